//! Test fixtures for control integration tests.

use skyport_control::config::Platform;
use skyport_control::types::ServiceSpec;
use skyport_control::{ControlConfig, DeploymentRequest};

/// Configuration with intervals short enough for real-time tests.
pub fn fast_config() -> ControlConfig {
    let mut config = ControlConfig::default();
    config.platform = Platform::Memory;
    config.cluster = "apps".to_owned();
    config.retry.attempts = 10;
    config.retry.interval_ms = 5;
    config.poll.interval_ms = 5;
    config.poll.timeout_secs = 10;
    config
}

/// Builder for deployment requests.
pub struct RequestBuilder {
    app: String,
    image: String,
    port: u16,
    env: Vec<(String, String)>,
}

impl RequestBuilder {
    /// Creates a builder for the given application.
    pub fn new(app: &str) -> Self {
        Self {
            app: app.to_owned(),
            image: "nginx:1.27".to_owned(),
            port: 80,
            env: Vec::new(),
        }
    }

    /// Sets the container image.
    pub fn with_image(mut self, image: &str) -> Self {
        self.image = image.to_owned();
        self
    }

    /// Sets the container port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_owned(), value.to_owned()));
        self
    }

    /// Builds the request.
    pub fn build(self) -> DeploymentRequest {
        let spec = self
            .env
            .into_iter()
            .fold(ServiceSpec::new(&self.app, self.image, self.port), |spec, (k, v)| {
                spec.with_env(k, v)
            });
        DeploymentRequest::new(self.app, spec)
    }
}
