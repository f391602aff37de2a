//! Cloud control-plane capability.
//!
//! The orchestrator only sees these traits; `azure` is the production
//! implementation and tests plug in fakes.

pub mod azure;
pub mod credential;

use std::sync::Arc;

use async_trait::async_trait;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum BackendError {
    /// No credential in the chain produced a token.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The control plane rejected (or never answered) the initial request.
    #[error("{0}")]
    Request(String),

    /// The long-running operation was accepted but ended in failure.
    #[error("{0}")]
    Operation(String),
}

/// One status entry of an instance view, in response order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStatus {
    pub code: String,
    pub display_status: Option<String>,
}

impl InstanceStatus {
    /// Display text, falling back to the status code.
    pub fn label(&self) -> &str {
        self.display_status.as_deref().unwrap_or(&self.code)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceView {
    pub statuses: Vec<InstanceStatus>,
}

/// An accepted long-running operation.
#[async_trait]
pub trait LongRunningOperation: Send {
    /// Suspend until the operation reaches a terminal state.
    async fn wait(self: Box<Self>) -> Result<(), BackendError>;
}

/// Compute API bound to one subscription.
#[async_trait]
pub trait ComputeClient: Send + Sync {
    async fn begin_start(
        &self,
        resource_group: &str,
        vm_name: &str,
    ) -> Result<Box<dyn LongRunningOperation>, BackendError>;

    async fn begin_deallocate(
        &self,
        resource_group: &str,
        vm_name: &str,
    ) -> Result<Box<dyn LongRunningOperation>, BackendError>;

    async fn instance_view(
        &self,
        resource_group: &str,
        vm_name: &str,
    ) -> Result<InstanceView, BackendError>;
}

/// Hands out authenticated compute clients. Shared by all handler tasks.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn client(&self, subscription_id: &str) -> Result<Arc<dyn ComputeClient>, BackendError>;
}
