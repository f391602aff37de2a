//! Default credential chain for Azure Resource Manager.
//!
//! Tried in order, first token wins:
//! 1. client secret from `AZURE_TENANT_ID` / `AZURE_CLIENT_ID` / `AZURE_CLIENT_SECRET`
//! 2. managed identity via the instance metadata service
//! 3. `az account get-access-token`

use std::time::Duration;

use super::BackendError;

const ARM_RESOURCE: &str = "https://management.azure.com/";
const ARM_SCOPE: &str = "https://management.azure.com/.default";
const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";
const IMDS_TOKEN_URL: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    ClientSecret {
        authority: String,
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
    ManagedIdentity {
        client_id: Option<String>,
    },
    AzureCli,
}

impl CredentialSource {
    fn name(&self) -> &'static str {
        match self {
            CredentialSource::ClientSecret { .. } => "environment",
            CredentialSource::ManagedIdentity { .. } => "managed identity",
            CredentialSource::AzureCli => "azure cli",
        }
    }
}

#[derive(Debug, Default, facet::Facet)]
#[facet(default)]
struct OAuthToken {
    #[facet(default)]
    access_token: String,
}

#[derive(Debug, Default, facet::Facet)]
#[facet(default)]
struct CliToken {
    #[facet(default, rename = "accessToken")]
    access_token: String,
}

#[derive(Debug, Clone)]
pub struct DefaultCredential {
    http: reqwest::Client,
    sources: Vec<CredentialSource>,
}

impl DefaultCredential {
    pub fn new(http: reqwest::Client, sources: Vec<CredentialSource>) -> Self {
        Self { http, sources }
    }

    /// Build the chain from process environment.
    pub fn from_env(http: reqwest::Client) -> Self {
        Self::new(http, chain_from_vars(|k| std::env::var(k).ok()))
    }

    /// Fetch a bearer token for ARM. Fresh on every call.
    pub async fn token(&self) -> Result<String, BackendError> {
        let mut reasons = Vec::new();
        for source in &self.sources {
            match self.token_from(source).await {
                Ok(token) => {
                    tracing::debug!(source = source.name(), "acquired control-plane token");
                    return Ok(token);
                }
                Err(reason) => {
                    tracing::debug!(source = source.name(), %reason, "credential source failed");
                    reasons.push(format!("{}: {reason}", source.name()));
                }
            }
        }
        if reasons.is_empty() {
            reasons.push("no credential sources configured".into());
        }
        Err(BackendError::Authentication(reasons.join("; ")))
    }

    async fn token_from(&self, source: &CredentialSource) -> Result<String, String> {
        match source {
            CredentialSource::ClientSecret {
                authority,
                tenant_id,
                client_id,
                client_secret,
            } => {
                let url = format!(
                    "{}/{}/oauth2/v2.0/token",
                    authority.trim_end_matches('/'),
                    urlencoding::encode(tenant_id)
                );
                let resp = self
                    .http
                    .post(&url)
                    .form(&[
                        ("grant_type", "client_credentials"),
                        ("client_id", client_id.as_str()),
                        ("client_secret", client_secret.as_str()),
                        ("scope", ARM_SCOPE),
                    ])
                    .send()
                    .await
                    .map_err(|e| e.to_string())?;
                read_oauth_token(resp).await
            }
            CredentialSource::ManagedIdentity { client_id } => {
                let mut query = vec![("api-version", "2018-02-01"), ("resource", ARM_RESOURCE)];
                if let Some(id) = client_id {
                    query.push(("client_id", id.as_str()));
                }
                let resp = self
                    .http
                    .get(IMDS_TOKEN_URL)
                    .header("Metadata", "true")
                    .query(&query)
                    .timeout(IMDS_TIMEOUT)
                    .send()
                    .await
                    .map_err(|e| e.to_string())?;
                read_oauth_token(resp).await
            }
            CredentialSource::AzureCli => {
                let output = tokio::process::Command::new("az")
                    .args([
                        "account",
                        "get-access-token",
                        "--resource",
                        ARM_RESOURCE,
                        "--output",
                        "json",
                    ])
                    .output()
                    .await
                    .map_err(|e| format!("running az: {e}"))?;
                if !output.status.success() {
                    return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
                }
                let stdout = String::from_utf8_lossy(&output.stdout);
                let token: CliToken =
                    facet_json::from_str(&stdout).map_err(|e| e.to_string())?;
                non_empty_token(token.access_token)
            }
        }
    }
}

async fn read_oauth_token(resp: reqwest::Response) -> Result<String, String> {
    let status = resp.status();
    let body = resp.text().await.map_err(|e| e.to_string())?;
    if !status.is_success() {
        return Err(format!("token endpoint returned {status}"));
    }
    let token: OAuthToken = facet_json::from_str(&body).map_err(|e| e.to_string())?;
    non_empty_token(token.access_token)
}

fn non_empty_token(token: String) -> Result<String, String> {
    if token.is_empty() {
        return Err("response carried no access token".into());
    }
    Ok(token)
}

/// Assemble the chain from a variable lookup.
fn chain_from_vars(var: impl Fn(&str) -> Option<String>) -> Vec<CredentialSource> {
    let non_empty = |k: &str| var(k).filter(|v| !v.trim().is_empty());
    let mut sources = Vec::new();

    if let (Some(tenant_id), Some(client_id), Some(client_secret)) = (
        non_empty("AZURE_TENANT_ID"),
        non_empty("AZURE_CLIENT_ID"),
        non_empty("AZURE_CLIENT_SECRET"),
    ) {
        sources.push(CredentialSource::ClientSecret {
            authority: non_empty("AZURE_AUTHORITY_HOST")
                .unwrap_or_else(|| DEFAULT_AUTHORITY.to_string()),
            tenant_id,
            client_id,
            client_secret,
        });
    }

    sources.push(CredentialSource::ManagedIdentity {
        client_id: non_empty("AZURE_CLIENT_ID"),
    });
    sources.push(CredentialSource::AzureCli);
    sources
}
