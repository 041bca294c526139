use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::{GateError, GateResult};

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ClientConfig {
    /// Base URL of the authorization service, e.g. `https://auth.example.com/functions/v1`.
    pub base_url: String,
    /// Fixed bearer credential sent with every request.
    pub api_key: Zeroizing<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: Zeroizing::new(api_key.into()),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(15),
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

// ── Outcomes ─────────────────────────────────────────────────────────────────

/// How the authorization service answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Positive verdict.
    Granted,
    /// Authoritative negative verdict.
    Denied,
    /// No usable answer: connect/read error, timeout, 408/429, 5xx or a
    /// malformed body.
    Unreachable,
}

/// Result of a link or validate call. Never an error: failures carry a
/// diagnostic `message` instead.
#[derive(Clone)]
pub struct Outcome {
    pub disposition: Disposition,
    pub message: String,
    /// Purchased module identities, when the service enumerates them.
    pub entitlements: Option<BTreeSet<String>>,
    pub owner_identity: Option<String>,
    pub verification_token: Option<String>,
}

pub type LinkOutcome = Outcome;
pub type ValidateOutcome = Outcome;

impl Outcome {
    pub fn ok(&self) -> bool {
        self.disposition == Disposition::Granted
    }

    fn failed(disposition: Disposition, message: String) -> Self {
        Self {
            disposition,
            message,
            entitlements: None,
            owner_identity: None,
            verification_token: None,
        }
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outcome")
            .field("disposition", &self.disposition)
            .field("message", &self.message)
            .field("entitlements", &self.entitlements)
            .field("owner_identity", &self.owner_identity)
            .field(
                "verification_token",
                &self.verification_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Installation details sent along with a link request.
#[derive(Debug, Clone)]
pub struct LinkMetadata {
    pub server_name: String,
    pub host_version: String,
}

// ── Wire types ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LinkRequest<'a> {
    token: &'a str,
    server_name: &'a str,
    mc_version: &'a str,
    installation_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ValidateRequest<'a> {
    installation_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EntitlementRequest<'a> {
    installation_id: &'a str,
    module_identity: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinkResponse {
    #[serde(default)]
    success: bool,
    message: Option<String>,
    #[serde(alias = "ownerUuid")]
    owner_id: Option<String>,
    verification_token: Option<String>,
    purchased_plugins: Option<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidateResponse {
    #[serde(default)]
    valid: bool,
    message: Option<String>,
    purchased_plugins: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct EntitlementResponse {
    #[serde(default)]
    purchased: bool,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

enum Reply<T> {
    Success(T),
    Rejected(String),
    Unreachable(String),
}

pub const LINK_PATH: &str = "/link-server";
pub const VALIDATE_PATH: &str = "/validate-server";
pub const ENTITLEMENT_PATH: &str = "/check-plugin";

// ── AuthClient ───────────────────────────────────────────────────────────────

/// Stateless request/response wrapper around the remote authorization service.
#[derive(Clone)]
pub struct AuthClient {
    client: reqwest::Client,
    base_url: Arc<str>,
    api_key: Arc<Zeroizing<String>>,
}

impl AuthClient {
    pub fn new(config: ClientConfig) -> GateResult<Self> {
        // Boot checks run on a throwaway runtime; pooled connections must not
        // outlive it.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| GateError::Transport(format!("build http client: {e}")))?;

        Ok(Self {
            client,
            base_url: Arc::from(config.base_url.trim_end_matches('/')),
            api_key: Arc::new(config.api_key),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Exchange a one-time link token for an account association.
    pub async fn link(
        &self,
        token: &str,
        installation_id: &str,
        metadata: &LinkMetadata,
    ) -> LinkOutcome {
        let body = LinkRequest {
            token,
            server_name: &metadata.server_name,
            mc_version: &metadata.host_version,
            installation_id,
        };

        match self
            .call::<_, LinkResponse>(LINK_PATH, &body, "Failed to link server")
            .await
        {
            Reply::Success(resp) if resp.success => Outcome {
                disposition: Disposition::Granted,
                message: resp.message.unwrap_or_else(|| "Server linked".into()),
                entitlements: resp.purchased_plugins.map(|p| p.into_iter().collect()),
                owner_identity: resp.owner_id,
                verification_token: resp.verification_token,
            },
            Reply::Success(resp) => Outcome::failed(
                Disposition::Denied,
                resp.message.unwrap_or_else(|| "Link rejected".into()),
            ),
            Reply::Rejected(message) => Outcome::failed(Disposition::Denied, message),
            Reply::Unreachable(message) => Outcome::failed(Disposition::Unreachable, message),
        }
    }

    /// Ask whether the installation's link is still valid.
    pub async fn validate(&self, installation_id: &str) -> ValidateOutcome {
        let body = ValidateRequest { installation_id };

        match self
            .call::<_, ValidateResponse>(VALIDATE_PATH, &body, "Validation failed")
            .await
        {
            Reply::Success(resp) => Outcome {
                disposition: if resp.valid {
                    Disposition::Granted
                } else {
                    Disposition::Denied
                },
                message: resp.message.unwrap_or_else(|| "Validated".into()),
                entitlements: resp.purchased_plugins.map(|p| p.into_iter().collect()),
                owner_identity: None,
                verification_token: None,
            },
            Reply::Rejected(message) => Outcome::failed(Disposition::Denied, message),
            Reply::Unreachable(message) => Outcome::failed(Disposition::Unreachable, message),
        }
    }

    /// Whether the linked account owns the module with this fingerprint.
    /// Any failure answers `false`.
    pub async fn check_entitlement(&self, installation_id: &str, module_identity: &str) -> bool {
        let body = EntitlementRequest {
            installation_id,
            module_identity,
        };

        match self
            .call::<_, EntitlementResponse>(ENTITLEMENT_PATH, &body, "Entitlement check failed")
            .await
        {
            Reply::Success(resp) => resp.purchased,
            Reply::Rejected(reason) => {
                debug!(%reason, "entitlement check rejected");
                false
            }
            Reply::Unreachable(reason) => {
                warn!(%reason, "entitlement check failed; treating as not purchased");
                false
            }
        }
    }

    /// POST a JSON body and sort the answer into success, explicit
    /// rejection, or no usable answer.
    async fn call<B, T>(&self, path: &str, body: &B, fallback: &str) -> Reply<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);

        let resp = match self
            .client
            .post(&url)
            .bearer_auth(self.api_key.as_str())
            .json(body)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                return Reply::Unreachable(format!("Error connecting to API: {e}"));
            }
        };

        let status = resp.status();
        let text = match resp.text().await {
            Ok(t) => t,
            Err(e) => return Reply::Unreachable(format!("Error reading API response: {e}")),
        };
        debug!(path, %status, "authorization service replied");

        classify(path, status, &text, fallback)
    }
}

impl fmt::Debug for AuthClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

fn classify<T: DeserializeOwned>(
    path: &str,
    status: StatusCode,
    text: &str,
    fallback: &str,
) -> Reply<T> {
    if status.is_success() {
        return match serde_json::from_str::<T>(text) {
            Ok(v) => Reply::Success(v),
            Err(e) => Reply::Unreachable(format!("Malformed response from {path}: {e}")),
        };
    }

    // Throttled or timed out upstream: try again later, not a verdict.
    if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT {
        return Reply::Unreachable(format!("{path} returned {status}"));
    }

    if status.is_client_error() {
        return match serde_json::from_str::<ErrorBody>(text) {
            Ok(err) => Reply::Rejected(
                err.error
                    .or(err.message)
                    .unwrap_or_else(|| fallback.to_owned()),
            ),
            Err(_) => Reply::Unreachable(format!("{path} returned {status} with a malformed body")),
        };
    }

    Reply::Unreachable(format!("{path} returned {status}"))
}
