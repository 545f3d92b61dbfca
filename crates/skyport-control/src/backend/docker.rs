//! Local container runtime via the Docker Engine HTTP API.
//!
//! Container calls complete synchronously, so every mutating call returns
//! the empty operation handle. Containers are immutable: an update replaces
//! the container under the same name.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::config::DockerConfig;
use crate::error::{default_classification, ControlError, ControlResult, ErrorClass};
use crate::types::{OperationHandle, OperationStatus, Placement, ServiceSpec, ServiceState};

use super::http;
use super::{BackendAdapter, OperationSource};

const LABEL_SERVICE: &str = "dev.skyport.service";
const LABEL_PORT: &str = "dev.skyport.port";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInspect {
    id: String,
    config: ContainerConfig,
    state: ContainerState,
    #[serde(default)]
    network_settings: NetworkSettings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerConfig {
    image: String,
    #[serde(default)]
    env: Option<Vec<String>>,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerState {
    running: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkSettings {
    #[serde(default)]
    ports: Option<HashMap<String, Option<Vec<PortBinding>>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PortBinding {
    host_port: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreatedContainer {
    id: String,
}

/// Docker Engine backend.
#[derive(Debug, Clone)]
pub struct DockerBackend {
    client: Client,
    base_url: String,
    public_host: String,
    network: Option<String>,
}

impl DockerBackend {
    /// Create a backend from configuration.
    pub fn new(config: &DockerConfig) -> ControlResult<Self> {
        Ok(Self {
            client: http::client(HeaderMap::new(), false)?,
            base_url: config.host.trim_end_matches('/').to_owned(),
            public_host: config.public_host.clone(),
            network: config.network.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn inspect(&self, name: &str) -> ControlResult<Option<ContainerInspect>> {
        let response = self
            .client
            .get(self.url(&format!("/containers/{name}/json")))
            .send()
            .await?;
        http::optional_json(response).await
    }

    async fn pull(&self, image: &str) -> ControlResult<()> {
        debug!(image, "pulling image");
        let response = self
            .client
            .post(self.url("/images/create"))
            .query(&[("fromImage", image)])
            .send()
            .await?;
        http::check(response).await?;
        Ok(())
    }

    async fn run(&self, spec: &ServiceSpec) -> ControlResult<String> {
        if spec.replicas != 1 {
            return Err(ControlError::unsupported(
                "docker",
                format!("{} replicas", spec.replicas),
            ));
        }
        self.pull(&spec.image).await?;

        let exposed = format!("{}/tcp", spec.port);
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let mut host_config = json!({
            "PortBindings": { &exposed: [{ "HostPort": "" }] },
            "RestartPolicy": { "Name": "unless-stopped" },
        });
        if let Some(network) = &self.network {
            host_config["NetworkMode"] = json!(network);
        }
        let body = json!({
            "Image": spec.image,
            "Env": env,
            "Labels": {
                LABEL_SERVICE: spec.name,
                LABEL_PORT: spec.port.to_string(),
            },
            "ExposedPorts": { &exposed: {} },
            "HostConfig": host_config,
        });

        let response = self
            .client
            .post(self.url("/containers/create"))
            .query(&[("name", spec.name.as_str())])
            .json(&body)
            .send()
            .await?;
        let created: CreatedContainer = http::json(response).await?;

        let response = self
            .client
            .post(self.url(&format!("/containers/{}/start", created.id)))
            .send()
            .await?;
        if response.status() != StatusCode::NOT_MODIFIED {
            http::check(response).await?;
        }

        info!(service = %spec.name, container = %created.id, "container started");
        Ok(created.id)
    }

    async fn remove(&self, name: &str) -> ControlResult<()> {
        let response = self
            .client
            .delete(self.url(&format!("/containers/{name}")))
            .query(&[("force", "true")])
            .send()
            .await?;
        http::deleted(response, &format!("container {name}")).await
    }
}

#[async_trait]
impl OperationSource for DockerBackend {
    async fn poll_operation(&self, handle: &OperationHandle) -> ControlResult<OperationStatus> {
        Ok(OperationStatus::succeeded(format!("{handle} completed synchronously")))
    }

    fn classify_error(&self, err: &ControlError) -> ErrorClass {
        // A conflict means a previous container with the name is still being removed.
        if http::is_status(err, StatusCode::CONFLICT) {
            return ErrorClass::Retryable;
        }
        default_classification(err)
    }
}

#[async_trait]
impl BackendAdapter for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn find_service(&self, name: &str) -> ControlResult<Option<ServiceState>> {
        let Some(container) = self.inspect(name).await? else {
            return Ok(None);
        };

        let labels = container.config.labels.unwrap_or_default();
        let port = labels
            .get(LABEL_PORT)
            .and_then(|p| p.parse().ok())
            .unwrap_or_default();
        let env: BTreeMap<String, String> = container
            .config
            .env
            .unwrap_or_default()
            .into_iter()
            .filter_map(|kv| {
                kv.split_once('=')
                    .map(|(k, v)| (k.to_owned(), v.to_owned()))
            })
            .collect();

        Ok(Some(ServiceState {
            id: container.id,
            name: name.to_owned(),
            image: container.config.image,
            port,
            env,
            replicas: 1,
            cpu: None,
            memory_mb: None,
            running: container.state.running,
            cluster: None,
            task_definition: None,
        }))
    }

    async fn create_service(
        &self,
        spec: &ServiceSpec,
        _placement: &Placement,
    ) -> ControlResult<(String, OperationHandle)> {
        let id = self.run(spec).await?;
        Ok((id, OperationHandle::none()))
    }

    async fn update_service(
        &self,
        existing: &ServiceState,
        spec: &ServiceSpec,
        _placement: &Placement,
    ) -> ControlResult<OperationHandle> {
        match self.remove(&existing.name).await {
            Ok(()) => {}
            Err(e) if e.is_already_absent() => {}
            Err(e) => return Err(e),
        }
        self.run(spec).await?;
        Ok(OperationHandle::none())
    }

    fn is_drifted(&self, existing: &ServiceState, spec: &ServiceSpec) -> bool {
        // Images may carry env vars of their own; only compare the ones we set.
        !existing.running
            || existing.image != spec.image
            || existing.port != spec.port
            || spec
                .env
                .iter()
                .any(|(k, v)| existing.env.get(k) != Some(v))
    }

    async fn delete_service(&self, service: &str) -> ControlResult<()> {
        self.remove(service).await
    }

    async fn service_endpoint(&self, service: &ServiceState) -> ControlResult<Option<String>> {
        let Some(container) = self.inspect(&service.name).await? else {
            return Ok(None);
        };
        let key = format!("{}/tcp", service.port);
        let host_port = container
            .network_settings
            .ports
            .and_then(|mut ports| ports.remove(&key))
            .flatten()
            .and_then(|bindings| bindings.into_iter().next())
            .map(|b| b.host_port);

        Ok(host_port.map(|port| format!("http://{}:{port}", self.public_host)))
    }
}
