//! Container scheduler via the Nomad HTTP API.
//!
//! Registering a job returns an evaluation id, which is the operation handle.
//! An evaluation that completes with failed task group allocations counts as
//! a failed operation.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::NomadConfig;
use crate::error::{default_classification, ControlError, ControlResult, ErrorClass};
use crate::types::{OperationHandle, OperationStatus, Placement, ServiceSpec, ServiceState};

use super::http;
use super::{BackendAdapter, OperationSource};

const META_PORT: &str = "skyport_port";
const PORT_LABEL: &str = "http";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Job {
    #[serde(rename = "ID")]
    id: String,
    status: String,
    #[serde(default)]
    stop: bool,
    #[serde(default)]
    meta: Option<HashMap<String, String>>,
    #[serde(default)]
    task_groups: Vec<TaskGroup>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TaskGroup {
    count: u32,
    #[serde(default)]
    tasks: Vec<Task>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Task {
    #[serde(default)]
    config: HashMap<String, Value>,
    #[serde(default)]
    env: Option<BTreeMap<String, String>>,
    #[serde(default)]
    resources: Option<TaskResources>,
}

#[derive(Debug, Deserialize)]
struct TaskResources {
    #[serde(rename = "CPU")]
    cpu: u32,
    #[serde(rename = "MemoryMB")]
    memory_mb: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RegisterResponse {
    #[serde(rename = "EvalID", default)]
    eval_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Evaluation {
    status: String,
    #[serde(default)]
    status_description: String,
    #[serde(rename = "FailedTGAllocs", default)]
    failed_tg_allocs: Option<HashMap<String, Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AllocationStub {
    #[serde(rename = "ID")]
    id: String,
    client_status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Allocation {
    allocated_resources: AllocatedResources,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AllocatedResources {
    shared: SharedResources,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SharedResources {
    #[serde(default)]
    ports: Vec<AllocatedPort>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AllocatedPort {
    label: String,
    value: u16,
    #[serde(rename = "HostIP")]
    host_ip: String,
}

/// Map an evaluation to an operation status.
fn evaluation_status(eval: &Evaluation) -> OperationStatus {
    match eval.status.as_str() {
        "pending" | "blocked" => OperationStatus::in_progress(eval.status.clone()),
        "complete" => match &eval.failed_tg_allocs {
            Some(failed) if !failed.is_empty() => {
                let groups: Vec<&str> = failed.keys().map(String::as_str).collect();
                OperationStatus::failed(format!(
                    "placement failed for task groups: {}",
                    groups.join(", ")
                ))
            }
            _ => OperationStatus::succeeded("complete"),
        },
        "failed" | "canceled" => OperationStatus::failed(if eval.status_description.is_empty() {
            eval.status.clone()
        } else {
            format!("{}: {}", eval.status, eval.status_description)
        }),
        other => OperationStatus::unknown(other),
    }
}

/// Nomad backend.
#[derive(Debug, Clone)]
pub struct NomadBackend {
    client: Client,
    base_url: String,
    datacenter: String,
    namespace: Option<String>,
}

impl NomadBackend {
    /// Create a backend from configuration.
    pub fn new(config: &NomadConfig) -> ControlResult<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.token {
            let value = HeaderValue::from_str(token)
                .map_err(|e| ControlError::Config(format!("invalid nomad token: {e}")))?;
            headers.insert("X-Nomad-Token", value);
        }

        Ok(Self {
            client: http::client(headers, false)?,
            base_url: config.address.trim_end_matches('/').to_owned(),
            datacenter: config.datacenter.clone(),
            namespace: config.namespace.clone(),
        })
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.namespace {
            Some(ns) => builder.query(&[("namespace", ns.as_str())]),
            None => builder,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1{path}", self.base_url)
    }

    fn job_body(&self, spec: &ServiceSpec) -> Value {
        let mut job = json!({
            "ID": spec.name,
            "Name": spec.name,
            "Type": "service",
            "Datacenters": [self.datacenter],
            "Meta": { META_PORT: spec.port.to_string() },
            "TaskGroups": [{
                "Name": spec.name,
                "Count": spec.replicas,
                "Networks": [{
                    "DynamicPorts": [{ "Label": PORT_LABEL, "To": spec.port }],
                }],
                "Tasks": [{
                    "Name": spec.name,
                    "Driver": "docker",
                    "Config": { "image": spec.image, "ports": [PORT_LABEL] },
                    "Env": spec.env,
                    "Resources": { "CPU": spec.cpu, "MemoryMB": spec.memory_mb },
                }],
            }],
        });
        if let Some(ns) = &self.namespace {
            job["Namespace"] = json!(ns);
        }
        json!({ "Job": job })
    }

    async fn register(&self, path: &str, spec: &ServiceSpec) -> ControlResult<OperationHandle> {
        let response = self
            .request(self.client.post(self.url(path)))
            .json(&self.job_body(spec))
            .send()
            .await?;
        let registered: RegisterResponse = http::json(response).await?;
        info!(job = %spec.name, eval = %registered.eval_id, "job registered");
        Ok(OperationHandle::new(registered.eval_id))
    }
}

#[async_trait]
impl OperationSource for NomadBackend {
    async fn poll_operation(&self, handle: &OperationHandle) -> ControlResult<OperationStatus> {
        let response = self
            .request(
                self.client
                    .get(self.url(&format!("/evaluation/{}", handle.as_str()))),
            )
            .send()
            .await?;
        let eval: Evaluation = http::json(response).await?;
        debug!(eval = %handle, status = %eval.status, "evaluation status");
        Ok(evaluation_status(&eval))
    }

    fn classify_error(&self, err: &ControlError) -> ErrorClass {
        if let ControlError::Remote { status: 500, message } = err {
            if message.contains("No cluster leader") || message.contains("rpc error") {
                return ErrorClass::Retryable;
            }
        }
        default_classification(err)
    }
}

#[async_trait]
impl BackendAdapter for NomadBackend {
    fn name(&self) -> &'static str {
        "nomad"
    }

    async fn find_service(&self, name: &str) -> ControlResult<Option<ServiceState>> {
        let response = self
            .request(self.client.get(self.url(&format!("/job/{name}"))))
            .send()
            .await?;
        let Some(job) = http::optional_json::<Job>(response).await? else {
            return Ok(None);
        };

        let port = job
            .meta
            .as_ref()
            .and_then(|m| m.get(META_PORT))
            .and_then(|p| p.parse().ok())
            .unwrap_or_default();
        let group = job.task_groups.first();
        let task = group.and_then(|g| g.tasks.first());
        let image = task
            .and_then(|t| t.config.get("image"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let env = task.and_then(|t| t.env.clone()).unwrap_or_default();
        let resources = task.and_then(|t| t.resources.as_ref());

        Ok(Some(ServiceState {
            id: job.id.clone(),
            name: name.to_owned(),
            image,
            port,
            env,
            replicas: group.map_or(0, |g| g.count),
            cpu: resources.map(|r| r.cpu),
            memory_mb: resources.map(|r| r.memory_mb),
            running: !job.stop && job.status != "dead",
            cluster: Some(self.datacenter.clone()),
            task_definition: None,
        }))
    }

    async fn create_service(
        &self,
        spec: &ServiceSpec,
        _placement: &Placement,
    ) -> ControlResult<(String, OperationHandle)> {
        let handle = self.register("/jobs", spec).await?;
        Ok((spec.name.clone(), handle))
    }

    async fn update_service(
        &self,
        existing: &ServiceState,
        spec: &ServiceSpec,
        _placement: &Placement,
    ) -> ControlResult<OperationHandle> {
        self.register(&format!("/job/{}", existing.name), spec).await
    }

    async fn delete_service(&self, service: &str) -> ControlResult<()> {
        let response = self
            .request(self.client.delete(self.url(&format!("/job/{service}"))))
            .query(&[("purge", "true")])
            .send()
            .await?;
        http::deleted(response, &format!("job {service}")).await
    }

    async fn service_endpoint(&self, service: &ServiceState) -> ControlResult<Option<String>> {
        let response = self
            .request(
                self.client
                    .get(self.url(&format!("/job/{}/allocations", service.name))),
            )
            .send()
            .await?;
        let Some(allocs) = http::optional_json::<Vec<AllocationStub>>(response).await? else {
            return Ok(None);
        };
        let Some(running) = allocs.iter().find(|a| a.client_status == "running") else {
            return Ok(None);
        };

        let response = self
            .request(
                self.client
                    .get(self.url(&format!("/allocation/{}", running.id))),
            )
            .send()
            .await?;
        let alloc: Allocation = http::json(response).await?;
        Ok(alloc
            .allocated_resources
            .shared
            .ports
            .iter()
            .find(|p| p.label == PORT_LABEL)
            .map(|p| format!("http://{}:{}", p.host_ip, p.value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OperationState;

    fn eval(status: &str, failed: Option<&str>) -> Evaluation {
        Evaluation {
            status: status.to_owned(),
            status_description: String::new(),
            failed_tg_allocs: failed.map(|g| HashMap::from([(g.to_owned(), json!({}))])),
        }
    }

    #[test]
    fn evaluation_states() {
        assert_eq!(
            evaluation_status(&eval("pending", None)).state,
            OperationState::InProgress
        );
        assert_eq!(
            evaluation_status(&eval("complete", None)).state,
            OperationState::Succeeded
        );
        assert_eq!(
            evaluation_status(&eval("canceled", None)).state,
            OperationState::Failed
        );
        assert_eq!(
            evaluation_status(&eval("paused", None)).state,
            OperationState::Unknown
        );
    }

    #[test]
    fn completed_with_failed_allocations_is_failure() {
        let status = evaluation_status(&eval("complete", Some("web")));
        assert_eq!(status.state, OperationState::Failed);
        assert!(status.message.contains("web"));
    }
}
