//! Application service as a provisionable resource.

use async_trait::async_trait;

use crate::backend::BackendAdapter;
use crate::error::{ControlError, ControlResult, ErrorClass};
use crate::types::{OperationHandle, Placement, ServiceSpec, ServiceState};

use super::Resource;

/// A service on a backend, described by its desired spec and placement.
pub struct ServiceResource<'a> {
    adapter: &'a dyn BackendAdapter,
    spec: &'a ServiceSpec,
    placement: &'a Placement,
}

impl<'a> ServiceResource<'a> {
    /// Describe a service.
    #[must_use]
    pub fn new(
        adapter: &'a dyn BackendAdapter,
        spec: &'a ServiceSpec,
        placement: &'a Placement,
    ) -> Self {
        Self {
            adapter,
            spec,
            placement,
        }
    }
}

#[async_trait]
impl Resource for ServiceResource<'_> {
    type Observed = ServiceState;

    fn name(&self) -> &str {
        &self.spec.name
    }

    async fn find(&self) -> ControlResult<Option<ServiceState>> {
        self.adapter.find_service(&self.spec.name).await
    }

    async fn create(&self) -> ControlResult<(String, OperationHandle)> {
        self.adapter.create_service(self.spec, self.placement).await
    }

    async fn update(&self, existing: &ServiceState) -> ControlResult<OperationHandle> {
        self.adapter
            .update_service(existing, self.spec, self.placement)
            .await
    }

    fn id_of(&self, existing: &ServiceState) -> String {
        existing.id.clone()
    }

    fn is_drifted(&self, existing: &ServiceState) -> bool {
        self.adapter.is_drifted(existing, self.spec)
    }

    fn classify(&self, err: &ControlError) -> ErrorClass {
        self.adapter.classify_error(err)
    }
}
