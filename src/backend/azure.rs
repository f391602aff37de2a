//! Azure Resource Manager compute client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_LENGTH, HeaderMap, LOCATION, RETRY_AFTER};

use super::credential::DefaultCredential;
use super::{
    BackendError, ClientFactory, ComputeClient, InstanceStatus, InstanceView, LongRunningOperation,
};

pub const ARM_ENDPOINT: &str = "https://management.azure.com";
pub const COMPUTE_API_VERSION: &str = "2024-07-01";
const ASYNC_OPERATION: &str = "azure-asyncoperation";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Consecutive throttled, 5xx or dropped polls tolerated before giving up.
const MAX_TRANSIENT_POLLS: u32 = 5;

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Default, facet::Facet)]
#[facet(default)]
struct ErrorEnvelope {
    #[facet(default)]
    error: Option<ErrorBody>,
}

#[derive(Debug, Default, facet::Facet)]
#[facet(default)]
struct ErrorBody {
    #[facet(default)]
    code: String,
    #[facet(default)]
    message: String,
}

impl ErrorBody {
    fn describe(&self) -> Option<String> {
        match (self.code.is_empty(), self.message.is_empty()) {
            (true, true) => None,
            (false, true) => Some(self.code.clone()),
            (true, false) => Some(self.message.clone()),
            (false, false) => Some(format!("{}: {}", self.code, self.message)),
        }
    }
}

#[derive(Debug, Default, facet::Facet)]
#[facet(default)]
struct AsyncOperationBody {
    #[facet(default)]
    status: String,
    #[facet(default)]
    error: Option<ErrorBody>,
}

#[derive(Debug, Default, facet::Facet)]
#[facet(default)]
struct InstanceViewBody {
    #[facet(default)]
    statuses: Vec<StatusBody>,
}

#[derive(Debug, Default, facet::Facet)]
#[facet(default)]
struct StatusBody {
    #[facet(default)]
    code: String,
    #[facet(default, rename = "displayStatus")]
    display_status: Option<String>,
}

// ── Factory ─────────────────────────────────────────────────────────

/// Produces ARM compute clients authenticated through the default chain.
pub struct AzureClientFactory {
    http: reqwest::Client,
    credential: DefaultCredential,
    endpoint: String,
}

impl AzureClientFactory {
    pub fn new(http: reqwest::Client, credential: DefaultCredential) -> Self {
        Self {
            http,
            credential,
            endpoint: ARM_ENDPOINT.to_string(),
        }
    }

    pub fn from_env() -> Self {
        let http = reqwest::Client::new();
        let credential = DefaultCredential::from_env(http.clone());
        Self::new(http, credential)
    }
}

#[async_trait]
impl ClientFactory for AzureClientFactory {
    async fn client(&self, subscription_id: &str) -> Result<Arc<dyn ComputeClient>, BackendError> {
        let token = self.credential.token().await?;
        Ok(Arc::new(ArmComputeClient {
            http: self.http.clone(),
            endpoint: self.endpoint.clone(),
            subscription_id: subscription_id.to_string(),
            token,
        }))
    }
}

// ── Compute client ──────────────────────────────────────────────────

pub struct ArmComputeClient {
    http: reqwest::Client,
    endpoint: String,
    subscription_id: String,
    token: String,
}

impl ArmComputeClient {
    fn vm_url(&self, resource_group: &str, vm_name: &str, action: &str) -> String {
        vm_url(
            &self.endpoint,
            &self.subscription_id,
            resource_group,
            vm_name,
            action,
        )
    }

    async fn begin(
        &self,
        resource_group: &str,
        vm_name: &str,
        action: &str,
    ) -> Result<Box<dyn LongRunningOperation>, BackendError> {
        let url = self.vm_url(resource_group, vm_name, action);
        tracing::debug!(%url, "begin {action}");

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .header(CONTENT_LENGTH, "0")
            .send()
            .await
            .map_err(|e| BackendError::Request(format!("{action} request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Request(describe_failure(status, &body)));
        }

        let target = if status == StatusCode::ACCEPTED {
            let target = PollTarget::from_headers(resp.headers());
            if target.is_none() {
                return Err(BackendError::Request(format!(
                    "{action} accepted without a polling URL"
                )));
            }
            target
        } else {
            None
        };

        Ok(Box::new(ArmOperation {
            http: self.http.clone(),
            token: self.token.clone(),
            target,
            first_delay: retry_after(resp.headers()).unwrap_or(DEFAULT_POLL_INTERVAL),
        }))
    }
}

#[async_trait]
impl ComputeClient for ArmComputeClient {
    async fn begin_start(
        &self,
        resource_group: &str,
        vm_name: &str,
    ) -> Result<Box<dyn LongRunningOperation>, BackendError> {
        self.begin(resource_group, vm_name, "start").await
    }

    async fn begin_deallocate(
        &self,
        resource_group: &str,
        vm_name: &str,
    ) -> Result<Box<dyn LongRunningOperation>, BackendError> {
        self.begin(resource_group, vm_name, "deallocate").await
    }

    async fn instance_view(
        &self,
        resource_group: &str,
        vm_name: &str,
    ) -> Result<InstanceView, BackendError> {
        let url = self.vm_url(resource_group, vm_name, "instanceView");
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| BackendError::Request(format!("instanceView request failed: {e}")))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| BackendError::Request(format!("reading instanceView: {e}")))?;
        if !status.is_success() {
            return Err(BackendError::Request(describe_failure(status, &body)));
        }
        parse_instance_view(&body).map_err(BackendError::Request)
    }
}

// ── Long-running operation ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum PollTarget {
    AsyncOperation(String),
    Location(String),
}

impl PollTarget {
    fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        header(ASYNC_OPERATION)
            .map(PollTarget::AsyncOperation)
            .or_else(|| header(LOCATION.as_str()).map(PollTarget::Location))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum OperationState {
    InProgress,
    Succeeded,
    Failed(String),
}

struct ArmOperation {
    http: reqwest::Client,
    token: String,
    /// `None` when the initial response was already terminal.
    target: Option<PollTarget>,
    first_delay: Duration,
}

#[async_trait]
impl LongRunningOperation for ArmOperation {
    async fn wait(self: Box<Self>) -> Result<(), BackendError> {
        let ArmOperation {
            http,
            token,
            target,
            first_delay,
        } = *self;
        let Some(target) = target else {
            return Ok(());
        };
        let url = match &target {
            PollTarget::AsyncOperation(u) | PollTarget::Location(u) => u.clone(),
        };

        let mut delay = first_delay;
        let mut transient = 0;
        loop {
            tokio::time::sleep(delay).await;

            let resp = match http.get(&url).bearer_auth(&token).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    transient += 1;
                    if transient > MAX_TRANSIENT_POLLS {
                        return Err(BackendError::Operation(format!(
                            "polling operation failed: {e}"
                        )));
                    }
                    tracing::debug!(%url, attempt = transient, "poll request failed: {e}");
                    continue;
                }
            };

            let status = resp.status();
            delay = retry_after(resp.headers()).unwrap_or(DEFAULT_POLL_INTERVAL);
            let body = resp.text().await.unwrap_or_default();

            if is_transient(status) {
                transient += 1;
                if transient > MAX_TRANSIENT_POLLS {
                    return Err(BackendError::Operation(describe_failure(status, &body)));
                }
                tracing::debug!(%url, %status, attempt = transient, "transient poll response");
                continue;
            }
            transient = 0;

            let state = match target {
                PollTarget::AsyncOperation(_) if status.is_success() => {
                    async_operation_state(&body).map_err(BackendError::Operation)?
                }
                PollTarget::Location(_) if status == StatusCode::ACCEPTED => {
                    OperationState::InProgress
                }
                PollTarget::Location(_) if status.is_success() => OperationState::Succeeded,
                _ => OperationState::Failed(describe_failure(status, &body)),
            };

            match state {
                OperationState::InProgress => {
                    tracing::trace!(%url, "operation still running");
                }
                OperationState::Succeeded => return Ok(()),
                OperationState::Failed(reason) => return Err(BackendError::Operation(reason)),
            }
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn vm_url(
    endpoint: &str,
    subscription_id: &str,
    resource_group: &str,
    vm_name: &str,
    action: &str,
) -> String {
    format!(
        "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachines/{}/{}?api-version={}",
        endpoint.trim_end_matches('/'),
        urlencoding::encode(subscription_id),
        urlencoding::encode(resource_group),
        urlencoding::encode(vm_name),
        action,
        COMPUTE_API_VERSION,
    )
}

/// `Retry-After` in whole seconds; HTTP-date values fall back to the default.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Statuses the control plane returns for throttling or a momentary outage.
fn is_transient(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429 | 500 | 502 | 503 | 504)
}

fn describe_failure(status: StatusCode, body: &str) -> String {
    facet_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .and_then(|env| env.error)
        .and_then(|e| e.describe())
        .unwrap_or_else(|| format!("control plane returned {status}"))
}

fn async_operation_state(body: &str) -> Result<OperationState, String> {
    let op: AsyncOperationBody =
        facet_json::from_str(body).map_err(|e| format!("unreadable operation status: {e}"))?;
    if op.status.is_empty() {
        return Err("operation status missing".into());
    }
    Ok(match op.status.as_str() {
        "Succeeded" => OperationState::Succeeded,
        "Failed" | "Canceled" => OperationState::Failed(
            op.error
                .and_then(|e| e.describe())
                .unwrap_or_else(|| format!("operation {}", op.status.to_lowercase())),
        ),
        _ => OperationState::InProgress,
    })
}

fn parse_instance_view(body: &str) -> Result<InstanceView, String> {
    let view: InstanceViewBody =
        facet_json::from_str(body).map_err(|e| format!("unreadable instance view: {e}"))?;
    Ok(InstanceView {
        statuses: view
            .statuses
            .into_iter()
            .map(|s| InstanceStatus {
                code: s.code,
                display_status: s.display_status,
            })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_stub::{HttpStub, response};
    use reqwest::header::HeaderValue;

    const START_LINE: &str = "POST /subscriptions/sub1/resourceGroups/rg1/providers/Microsoft.Compute/virtualMachines/vm-web1/start?api-version=2024-07-01 HTTP/1.1";
    const QUOTA: &str = r#"{"status":"Failed","error":{"code":"QuotaExceeded","message":"Operation results in exceeding approved quota."}}"#;

    fn client(stub: &HttpStub) -> ArmComputeClient {
        ArmComputeClient {
            http: reqwest::Client::new(),
            endpoint: stub.base.clone(),
            subscription_id: "sub1".into(),
            token: "token".into(),
        }
    }

    /// 202 pointing at `{base}/op` through `header`, polled immediately.
    fn accepted(base: &str, header: &str) -> String {
        let url = format!("{base}/op");
        response("202 Accepted", &[(header, url.as_str()), ("Retry-After", "0")], "")
    }

    fn poll(status: &str, body: &str) -> String {
        response(status, &[("Retry-After", "0")], body)
    }

    async fn start(stub: &HttpStub) -> Result<(), BackendError> {
        client(stub)
            .begin_start("rg1", "vm-web1")
            .await?
            .wait()
            .await
    }

    #[tokio::test]
    async fn immediate_success_skips_polling() {
        let stub = HttpStub::start(|_| vec![response("200 OK", &[], "")]).await;

        assert_eq!(start(&stub).await, Ok(()));
        assert_eq!(stub.requests(), vec![START_LINE]);
    }

    #[tokio::test]
    async fn async_operation_failure_carries_code() {
        let stub = HttpStub::start(|base| {
            vec![
                accepted(base, "Azure-AsyncOperation"),
                poll("200 OK", r#"{"status":"InProgress"}"#),
                poll("200 OK", QUOTA),
            ]
        })
        .await;

        assert_eq!(
            start(&stub).await,
            Err(BackendError::Operation(
                "QuotaExceeded: Operation results in exceeding approved quota.".into()
            ))
        );
        assert_eq!(
            stub.requests(),
            vec![START_LINE, "GET /op HTTP/1.1", "GET /op HTTP/1.1"]
        );
    }

    #[tokio::test]
    async fn location_polling_until_done() {
        let stub = HttpStub::start(|base| {
            vec![
                accepted(base, "Location"),
                poll("202 Accepted", ""),
                poll("200 OK", ""),
            ]
        })
        .await;

        let result = client(&stub)
            .begin_deallocate("rg1", "vm-web1")
            .await
            .unwrap()
            .wait()
            .await;
        assert_eq!(result, Ok(()));
        let requests = stub.requests();
        assert!(requests[0].contains("/virtualMachines/vm-web1/deallocate?"));
        assert_eq!(requests.len(), 3);
    }

    #[tokio::test]
    async fn transient_poll_responses_keep_waiting() {
        let stub = HttpStub::start(|base| {
            vec![
                accepted(base, "Azure-AsyncOperation"),
                poll("503 Service Unavailable", ""),
                poll("429 Too Many Requests", ""),
                String::new(),
                poll("200 OK", r#"{"status":"Succeeded"}"#),
            ]
        })
        .await;

        assert_eq!(start(&stub).await, Ok(()));
        assert_eq!(stub.requests().len(), 5);
    }

    #[tokio::test]
    async fn persistent_outage_gives_up() {
        let stub = HttpStub::start(|base| {
            let mut script = vec![accepted(base, "Azure-AsyncOperation")];
            for _ in 0..=MAX_TRANSIENT_POLLS {
                script.push(poll("503 Service Unavailable", ""));
            }
            script
        })
        .await;

        let Err(BackendError::Operation(reason)) = start(&stub).await else {
            panic!("expected operation failure");
        };
        assert!(reason.contains("503"), "{reason}");
    }

    #[tokio::test]
    async fn client_error_while_polling_fails_operation() {
        let stub = HttpStub::start(|base| {
            vec![
                accepted(base, "Azure-AsyncOperation"),
                poll(
                    "404 Not Found",
                    r#"{"error":{"code":"NotFound","message":"operation expired"}}"#,
                ),
            ]
        })
        .await;

        assert_eq!(
            start(&stub).await,
            Err(BackendError::Operation("NotFound: operation expired".into()))
        );
    }

    #[tokio::test]
    async fn accepted_without_polling_url_is_rejected() {
        let stub = HttpStub::start(|_| vec![response("202 Accepted", &[], "")]).await;

        let Err(BackendError::Request(reason)) = client(&stub).begin_start("rg1", "vm-web1").await
        else {
            panic!("expected request failure");
        };
        assert!(reason.contains("without a polling URL"), "{reason}");
    }

    #[tokio::test]
    async fn rejected_start_is_request_error() {
        let stub = HttpStub::start(|_| {
            vec![response(
                "409 Conflict",
                &[],
                r#"{"error":{"code":"OperationNotAllowed","message":"VM is being deleted."}}"#,
            )]
        })
        .await;

        let Err(BackendError::Request(reason)) = client(&stub).begin_start("rg1", "vm-web1").await
        else {
            panic!("expected request failure");
        };
        assert_eq!(reason, "OperationNotAllowed: VM is being deleted.");
    }

    #[tokio::test]
    async fn instance_view_over_http() {
        let stub = HttpStub::start(|_| {
            vec![response(
                "200 OK",
                &[],
                r#"{"statuses":[{"code":"ProvisioningState/succeeded","displayStatus":"Provisioning succeeded"},{"code":"PowerState/deallocated","displayStatus":"VM deallocated"}]}"#,
            )]
        })
        .await;

        let view = client(&stub).instance_view("rg1", "vm-web1").await.unwrap();
        assert_eq!(view.statuses[1].label(), "VM deallocated");
        assert!(stub.requests()[0].starts_with("GET /subscriptions/sub1/"));
    }

    #[test]
    fn transient_statuses() {
        for code in [408, 429, 500, 502, 503, 504] {
            assert!(is_transient(StatusCode::from_u16(code).unwrap()), "{code}");
        }
        for code in [400, 401, 404, 409, 501] {
            assert!(!is_transient(StatusCode::from_u16(code).unwrap()), "{code}");
        }
    }

    #[test]
    fn vm_url_layout() {
        assert_eq!(
            vm_url("https://management.azure.com/", "sub1", "rg1", "vm-web1", "start"),
            "https://management.azure.com/subscriptions/sub1/resourceGroups/rg1/providers/Microsoft.Compute/virtualMachines/vm-web1/start?api-version=2024-07-01"
        );
    }

    #[test]
    fn vm_url_encodes_segments() {
        let url = vm_url(ARM_ENDPOINT, "sub", "rg one", "vm", "deallocate");
        assert!(url.contains("/resourceGroups/rg%20one/"));
    }

    #[test]
    fn poll_target_prefers_async_operation() {
        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, HeaderValue::from_static("https://loc"));
        headers.insert(ASYNC_OPERATION, HeaderValue::from_static("https://async"));
        assert_eq!(
            PollTarget::from_headers(&headers),
            Some(PollTarget::AsyncOperation("https://async".into()))
        );
    }

    #[test]
    fn poll_target_falls_back_to_location() {
        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, HeaderValue::from_static("https://loc"));
        assert_eq!(
            PollTarget::from_headers(&headers),
            Some(PollTarget::Location("https://loc".into()))
        );
        assert_eq!(PollTarget::from_headers(&HeaderMap::new()), None);
    }

    #[test]
    fn retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("15"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(15)));

        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn async_states() {
        assert_eq!(
            async_operation_state(r#"{"status":"InProgress"}"#).unwrap(),
            OperationState::InProgress
        );
        assert_eq!(
            async_operation_state(r#"{"status":"Succeeded","startTime":"x"}"#).unwrap(),
            OperationState::Succeeded
        );
        assert_eq!(
            async_operation_state(
                r#"{"status":"Failed","error":{"code":"QuotaExceeded","message":"Operation could not be completed as it results in exceeding approved quota."}}"#
            )
            .unwrap(),
            OperationState::Failed(
                "QuotaExceeded: Operation could not be completed as it results in exceeding approved quota."
                    .into()
            )
        );
        assert_eq!(
            async_operation_state(r#"{"status":"Canceled"}"#).unwrap(),
            OperationState::Failed("operation canceled".into())
        );
        assert!(async_operation_state("not json").is_err());
        assert!(async_operation_state("{}").is_err());
    }

    #[test]
    fn failure_description_uses_arm_error() {
        let body = r#"{"error":{"code":"ResourceNotFound","message":"The Resource 'vm' was not found."}}"#;
        assert_eq!(
            describe_failure(StatusCode::NOT_FOUND, body),
            "ResourceNotFound: The Resource 'vm' was not found."
        );
        assert_eq!(
            describe_failure(StatusCode::FORBIDDEN, ""),
            "control plane returned 403 Forbidden"
        );
    }

    #[test]
    fn instance_view_keeps_order() {
        let body = r#"{
            "computerName": "vm-web1",
            "statuses": [
                {"code": "ProvisioningState/succeeded", "level": "Info", "displayStatus": "Provisioning succeeded"},
                {"code": "PowerState/running", "level": "Info", "displayStatus": "VM running"}
            ]
        }"#;
        let view = parse_instance_view(body).unwrap();
        assert_eq!(view.statuses.len(), 2);
        assert_eq!(view.statuses[0].label(), "Provisioning succeeded");
        assert_eq!(view.statuses[1].code, "PowerState/running");
    }

    #[test]
    fn instance_status_label_falls_back_to_code() {
        let view = parse_instance_view(r#"{"statuses":[{"code":"PowerState/deallocated"}]}"#)
            .unwrap();
        assert_eq!(view.statuses[0].label(), "PowerState/deallocated");
    }
}
