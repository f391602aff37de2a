//! VM control orchestration.
//!
//! One `execute` call walks `Dispatching -> Polling -> Completed | Failed`
//! for a single action. Coordinates are resolved by the caller; the only
//! shared state is the read-only client factory.

use std::sync::Arc;
use std::time::Duration;

use crate::backend::{BackendError, ClientFactory};
use crate::command::Verb;
use crate::presenter;
use crate::registry::VmEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    PowerOn,
    PowerOff,
    QueryStatus,
}

impl ActionKind {
    pub fn for_verb(verb: Verb) -> Option<Self> {
        match verb {
            Verb::Start => Some(ActionKind::PowerOn),
            Verb::Stop => Some(ActionKind::PowerOff),
            Verb::State => Some(ActionKind::QueryStatus),
            _ => None,
        }
    }

    pub fn verb(self) -> Verb {
        match self {
            ActionKind::PowerOn => Verb::Start,
            ActionKind::PowerOff => Verb::Stop,
            ActionKind::QueryStatus => Verb::State,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlAction {
    pub kind: ActionKind,
    pub target: VmEntry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserInput,
    Authentication,
    ControlPlaneRequest,
    ControlPlaneOperation,
    Delivery,
}

impl ErrorKind {
    /// Internal failures are shown to users only as the generic message.
    pub fn is_internal(self) -> bool {
        matches!(self, ErrorKind::Authentication | ErrorKind::ControlPlaneRequest)
    }
}

impl From<&BackendError> for ErrorKind {
    fn from(err: &BackendError) -> Self {
        match err {
            BackendError::Authentication(_) => ErrorKind::Authentication,
            BackendError::Request(_) => ErrorKind::ControlPlaneRequest,
            BackendError::Operation(_) => ErrorKind::ControlPlaneOperation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationOutcome {
    pub succeeded: bool,
    pub display_text: String,
    pub error_kind: Option<ErrorKind>,
}

impl OperationOutcome {
    pub fn completed(display_text: String) -> Self {
        Self {
            succeeded: true,
            display_text,
            error_kind: None,
        }
    }

    pub fn failed(kind: ErrorKind, display_text: String) -> Self {
        Self {
            succeeded: false,
            display_text,
            error_kind: Some(kind),
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    factory: Arc<dyn ClientFactory>,
    /// Caller-supplied deadline for the polling wait. `None` waits forever.
    deadline: Option<Duration>,
}

impl Orchestrator {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            factory,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub async fn execute(&self, action: &ControlAction) -> OperationOutcome {
        let vm = &action.target;
        match self.run(action).await {
            Ok(text) => {
                tracing::info!(vm = %vm.logical_name, kind = ?action.kind, "action completed");
                OperationOutcome::completed(text)
            }
            Err(err) => {
                let kind = ErrorKind::from(&err);
                tracing::error!(
                    vm = %vm.logical_name,
                    resource_group = %vm.resource_group,
                    kind = ?kind,
                    "{} failed: {err}",
                    action.kind.verb()
                );
                OperationOutcome::failed(kind, presenter::user_error(action.kind.verb(), &err))
            }
        }
    }

    async fn run(&self, action: &ControlAction) -> Result<String, BackendError> {
        let vm = &action.target;

        // Dispatching
        let client = self.factory.client(&vm.subscription_id).await?;
        let operation = match action.kind {
            ActionKind::PowerOn => client.begin_start(&vm.resource_group, &vm.vm_name).await?,
            ActionKind::PowerOff => {
                client
                    .begin_deallocate(&vm.resource_group, &vm.vm_name)
                    .await?
            }
            ActionKind::QueryStatus => {
                let view = client
                    .instance_view(&vm.resource_group, &vm.vm_name)
                    .await?;
                if view.statuses.len() < 2 {
                    tracing::warn!(
                        vm = %vm.logical_name,
                        statuses = view.statuses.len(),
                        "instance view has fewer than two statuses"
                    );
                }
                return Ok(presenter::vm_info(&view));
            }
        };

        // Polling
        tracing::debug!(vm = %vm.logical_name, "waiting for operation to finish");
        match self.deadline {
            Some(limit) => tokio::time::timeout(limit, operation.wait())
                .await
                .map_err(|_| {
                    BackendError::Operation(format!(
                        "operation did not finish within {}s",
                        limit.as_secs()
                    ))
                })??,
            None => operation.wait().await?,
        }

        Ok(match action.kind {
            ActionKind::PowerOff => presenter::stopped(&vm.logical_name),
            _ => presenter::started(&vm.logical_name),
        })
    }
}
