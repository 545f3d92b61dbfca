//! Container scheduler via the Kubernetes REST API.
//!
//! A service is a `Deployment` plus a `Service` exposing it. The operation
//! handle is `<name>@<generation>`; polling reads the deployment's rollout
//! status until the observed generation catches up and every replica is
//! updated and available.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::KubernetesConfig;
use crate::error::{default_classification, ControlError, ControlResult, ErrorClass};
use crate::types::{OperationHandle, OperationStatus, Placement, ServiceSpec, ServiceState};

use super::http;
use super::{BackendAdapter, OperationSource};

const MERGE_PATCH: &str = "application/merge-patch+json";
const ANNOTATION_CPU: &str = "skyport/cpu";
const ANNOTATION_MEMORY: &str = "skyport/memory-mb";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    #[serde(default)]
    uid: String,
    #[serde(default)]
    generation: i64,
    #[serde(default)]
    deletion_timestamp: Option<String>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Requested size as recorded at the last create or update.
    ///
    /// Resource limits are written in millicores, which does not round-trip
    /// to CPU units, so the requested values are kept as annotations.
    fn recorded_size(&self) -> (Option<u32>, Option<u32>) {
        let read = |key: &str| -> Option<u32> {
            self.annotations.get(key).and_then(|v| v.parse().ok())
        };
        (read(ANNOTATION_CPU), read(ANNOTATION_MEMORY))
    }
}

#[derive(Debug, Deserialize)]
struct DeploymentObject {
    metadata: ObjectMeta,
    spec: DeploymentSpec,
    #[serde(default)]
    status: DeploymentStatus,
}

#[derive(Debug, Deserialize)]
struct DeploymentSpec {
    #[serde(default)]
    replicas: Option<u32>,
    template: PodTemplate,
}

#[derive(Debug, Deserialize)]
struct PodTemplate {
    spec: PodSpec,
}

#[derive(Debug, Deserialize)]
struct PodSpec {
    containers: Vec<Container>,
}

#[derive(Debug, Deserialize)]
struct Container {
    image: String,
    #[serde(default)]
    env: Vec<EnvVar>,
    #[serde(default)]
    ports: Vec<ContainerPort>,
}

#[derive(Debug, Deserialize)]
struct EnvVar {
    name: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerPort {
    container_port: u16,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentStatus {
    #[serde(default)]
    observed_generation: i64,
    #[serde(default)]
    updated_replicas: u32,
    #[serde(default)]
    available_replicas: u32,
    #[serde(default)]
    conditions: Vec<Condition>,
}

#[derive(Debug, Deserialize)]
struct Condition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ServiceObject {
    spec: ServiceObjectSpec,
    #[serde(default)]
    status: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceObjectSpec {
    #[serde(rename = "type", default)]
    kind: String,
}

/// Derive a rollout status for the generation named in a handle.
fn rollout_status(deployment: &DeploymentObject, generation: i64) -> OperationStatus {
    let status = &deployment.status;
    let desired = deployment.spec.replicas.unwrap_or(1);

    if let Some(stalled) = status
        .conditions
        .iter()
        .find(|c| c.kind == "Progressing" && c.status == "False")
    {
        return OperationStatus::failed(format!("{}: {}", stalled.reason, stalled.message));
    }
    if status.observed_generation < generation {
        return OperationStatus::in_progress(format!(
            "waiting for generation {generation} to be observed"
        ));
    }
    if status.updated_replicas < desired || status.available_replicas < desired {
        return OperationStatus::in_progress(format!(
            "{} of {desired} updated replicas available",
            status.available_replicas.min(status.updated_replicas)
        ));
    }
    OperationStatus::succeeded("rolled out")
}

fn parse_handle(handle: &OperationHandle) -> ControlResult<(&str, i64)> {
    handle
        .as_str()
        .split_once('@')
        .and_then(|(name, generation)| generation.parse().ok().map(|g| (name, g)))
        .ok_or_else(|| ControlError::internal(format!("malformed rollout handle {handle}")))
}

/// Kubernetes backend.
#[derive(Debug, Clone)]
pub struct KubernetesBackend {
    client: Client,
    base_url: String,
    namespace: String,
    service_type: String,
}

impl KubernetesBackend {
    /// Create a backend from configuration.
    ///
    /// The bearer token comes from `token`, or from `token_file` when that
    /// exists (the in-cluster service account token).
    pub fn new(config: &KubernetesConfig) -> ControlResult<Self> {
        let token = match &config.token {
            Some(token) => Some(token.clone()),
            None => match std::fs::read_to_string(&config.token_file) {
                Ok(token) => Some(token.trim().to_owned()),
                Err(e) => {
                    debug!(path = %config.token_file.display(), error = %e, "no service account token");
                    None
                }
            },
        };

        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ControlError::Config(format!("invalid kubernetes token: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }

        Ok(Self {
            client: http::client(headers, config.accept_invalid_certs)?,
            base_url: config.api_server.trim_end_matches('/').to_owned(),
            namespace: config.namespace.clone(),
            service_type: config.service_type.clone(),
        })
    }

    fn deployments_url(&self) -> String {
        format!(
            "{}/apis/apps/v1/namespaces/{}/deployments",
            self.base_url, self.namespace
        )
    }

    fn services_url(&self) -> String {
        format!("{}/api/v1/namespaces/{}/services", self.base_url, self.namespace)
    }

    async fn get_deployment(&self, name: &str) -> ControlResult<Option<DeploymentObject>> {
        let response = self
            .client
            .get(format!("{}/{name}", self.deployments_url()))
            .send()
            .await?;
        http::optional_json(response).await
    }

    fn container(spec: &ServiceSpec) -> Value {
        let env: Vec<Value> = spec
            .env
            .iter()
            .map(|(k, v)| json!({ "name": k, "value": v }))
            .collect();
        json!({
            "name": spec.name,
            "image": spec.image,
            "env": env,
            "ports": [{ "containerPort": spec.port }],
            "resources": {
                "limits": {
                    "cpu": format!("{}m", spec.cpu * 1000 / 1024),
                    "memory": format!("{}Mi", spec.memory_mb),
                },
            },
        })
    }

    fn size_annotations(spec: &ServiceSpec) -> Value {
        json!({
            ANNOTATION_CPU: spec.cpu.to_string(),
            ANNOTATION_MEMORY: spec.memory_mb.to_string(),
        })
    }

    fn deployment_body(spec: &ServiceSpec) -> Value {
        let labels = json!({ "app.kubernetes.io/name": spec.name });
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": spec.name,
                "labels": labels,
                "annotations": Self::size_annotations(spec),
            },
            "spec": {
                "replicas": spec.replicas,
                "selector": { "matchLabels": labels },
                "template": {
                    "metadata": { "labels": labels },
                    "spec": { "containers": [Self::container(spec)] },
                },
            },
        })
    }

    async fn ensure_service(&self, spec: &ServiceSpec) -> ControlResult<()> {
        let body = json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": { "name": spec.name },
            "spec": {
                "type": self.service_type,
                "selector": { "app.kubernetes.io/name": spec.name },
                "ports": [{ "port": spec.port, "targetPort": spec.port }],
            },
        });
        let response = self.client.post(self.services_url()).json(&body).send().await?;
        if response.status() == StatusCode::CONFLICT {
            debug!(service = %spec.name, "service object already exists");
            return Ok(());
        }
        http::check(response).await?;
        Ok(())
    }

    fn handle(name: &str, generation: i64) -> OperationHandle {
        OperationHandle::new(format!("{name}@{generation}"))
    }
}

#[async_trait]
impl OperationSource for KubernetesBackend {
    async fn poll_operation(&self, handle: &OperationHandle) -> ControlResult<OperationStatus> {
        let (name, generation) = parse_handle(handle)?;
        match self.get_deployment(name).await? {
            Some(deployment) => Ok(rollout_status(&deployment, generation)),
            None => Ok(OperationStatus::failed(format!("deployment {name} was deleted"))),
        }
    }

    fn classify_error(&self, err: &ControlError) -> ErrorClass {
        // Conflict: the object was modified concurrently or is still terminating.
        if http::is_status(err, StatusCode::CONFLICT) {
            return ErrorClass::Retryable;
        }
        default_classification(err)
    }
}

#[async_trait]
impl BackendAdapter for KubernetesBackend {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn find_service(&self, name: &str) -> ControlResult<Option<ServiceState>> {
        let Some(deployment) = self.get_deployment(name).await? else {
            return Ok(None);
        };
        let Some(container) = deployment.spec.template.spec.containers.first() else {
            return Err(ControlError::internal(format!(
                "deployment {name} has no containers"
            )));
        };

        let (cpu, memory_mb) = deployment.metadata.recorded_size();

        Ok(Some(ServiceState {
            id: deployment.metadata.uid.clone(),
            name: name.to_owned(),
            image: container.image.clone(),
            port: container.ports.first().map_or(0, |p| p.container_port),
            env: container
                .env
                .iter()
                .map(|e| (e.name.clone(), e.value.clone()))
                .collect::<BTreeMap<_, _>>(),
            replicas: deployment.spec.replicas.unwrap_or(1),
            cpu,
            memory_mb,
            running: deployment.metadata.deletion_timestamp.is_none(),
            cluster: Some(self.namespace.clone()),
            task_definition: Some(Self::handle(name, deployment.metadata.generation).to_string()),
        }))
    }

    async fn create_service(
        &self,
        spec: &ServiceSpec,
        _placement: &Placement,
    ) -> ControlResult<(String, OperationHandle)> {
        let response = self
            .client
            .post(self.deployments_url())
            .json(&Self::deployment_body(spec))
            .send()
            .await?;
        let created: DeploymentObject = http::json(response).await?;
        self.ensure_service(spec).await?;

        info!(deployment = %spec.name, generation = created.metadata.generation, "deployment created");
        Ok((
            created.metadata.uid,
            Self::handle(&spec.name, created.metadata.generation),
        ))
    }

    async fn update_service(
        &self,
        existing: &ServiceState,
        spec: &ServiceSpec,
        _placement: &Placement,
    ) -> ControlResult<OperationHandle> {
        let patch = json!({
            "metadata": { "annotations": Self::size_annotations(spec) },
            "spec": {
                "replicas": spec.replicas,
                "template": { "spec": { "containers": [Self::container(spec)] } },
            },
        });
        let response = self
            .client
            .patch(format!("{}/{}", self.deployments_url(), existing.name))
            .header(CONTENT_TYPE, MERGE_PATCH)
            .body(patch.to_string())
            .send()
            .await?;
        let patched: DeploymentObject = http::json(response).await?;
        self.ensure_service(spec).await?;
        Ok(Self::handle(&existing.name, patched.metadata.generation))
    }

    async fn delete_service(&self, service: &str) -> ControlResult<()> {
        let response = self
            .client
            .delete(format!("{}/{service}", self.services_url()))
            .send()
            .await?;
        if let Err(e) = http::deleted(response, &format!("service {service}")).await {
            if !e.is_already_absent() {
                warn!(service, error = %e, "failed to delete service object");
            }
        }

        let response = self
            .client
            .delete(format!("{}/{service}", self.deployments_url()))
            .json(&json!({ "propagationPolicy": "Foreground" }))
            .send()
            .await?;
        http::deleted(response, &format!("deployment {service}")).await
    }

    async fn service_endpoint(&self, service: &ServiceState) -> ControlResult<Option<String>> {
        let response = self
            .client
            .get(format!("{}/{}", self.services_url(), service.name))
            .send()
            .await?;
        let Some(svc) = http::optional_json::<ServiceObject>(response).await? else {
            return Ok(None);
        };

        if svc.spec.kind == "LoadBalancer" {
            let ingress = svc.status["loadBalancer"]["ingress"]
                .get(0)
                .and_then(|i| i["hostname"].as_str().or_else(|| i["ip"].as_str()))
                .map(|host| format!("http://{host}:{}", service.port));
            return Ok(ingress);
        }
        Ok(Some(format!(
            "http://{}.{}.svc.cluster.local:{}",
            service.name, self.namespace, service.port
        )))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::OperationState;

    fn deployment(status: Value) -> DeploymentObject {
        serde_json::from_value(json!({
            "metadata": { "name": "web", "uid": "u-1", "generation": 3 },
            "spec": {
                "replicas": 2,
                "template": { "spec": { "containers": [{ "image": "nginx:1.27" }] } },
            },
            "status": status,
        }))
        .unwrap()
    }

    #[test]
    fn rollout_waits_for_observed_generation() {
        let d = deployment(json!({ "observedGeneration": 2, "updatedReplicas": 2, "availableReplicas": 2 }));
        assert_eq!(rollout_status(&d, 3).state, OperationState::InProgress);
    }

    #[test]
    fn rollout_waits_for_available_replicas() {
        let d = deployment(json!({ "observedGeneration": 3, "updatedReplicas": 2, "availableReplicas": 1 }));
        let status = rollout_status(&d, 3);
        assert_eq!(status.state, OperationState::InProgress);
        assert_eq!(status.message, "1 of 2 updated replicas available");
    }

    #[test]
    fn rollout_complete() {
        let d = deployment(json!({ "observedGeneration": 3, "updatedReplicas": 2, "availableReplicas": 2 }));
        assert_eq!(rollout_status(&d, 3).state, OperationState::Succeeded);
    }

    #[test]
    fn stalled_rollout_fails() {
        let d = deployment(json!({
            "observedGeneration": 3,
            "conditions": [{
                "type": "Progressing",
                "status": "False",
                "reason": "ProgressDeadlineExceeded",
                "message": "ReplicaSet web-abc has timed out progressing.",
            }],
        }));
        let status = rollout_status(&d, 3);
        assert_eq!(status.state, OperationState::Failed);
        assert!(status.message.starts_with("ProgressDeadlineExceeded"));
    }

    #[test]
    fn size_is_read_back_from_annotations() {
        let spec = ServiceSpec::new("web", "nginx:1.27", 80).with_size(1024, 4096);
        let body = KubernetesBackend::deployment_body(&spec);
        let meta: ObjectMeta = serde_json::from_value(body["metadata"].clone()).unwrap();
        assert_eq!(meta.recorded_size(), (Some(1024), Some(4096)));

        let d = deployment(json!({}));
        assert_eq!(d.metadata.recorded_size(), (None, None));
    }

    #[test]
    fn handle_parsing() {
        let handle = KubernetesBackend::handle("web", 7);
        assert_eq!(parse_handle(&handle).unwrap(), ("web", 7));
        assert!(parse_handle(&OperationHandle::new("web")).is_err());
    }
}
