//! Sandbox provider client — §4.1, §6.3.
//!
//! Generalizes the teacher's Docker/TEE-specific create/stop/resume
//! machinery (`runtime.rs`, `tee/mod.rs`) into a single HTTP client against
//! an opaque external sandbox-provider service. `build_url`/`auth_headers`/
//! `send_json` are carried over near-verbatim from `sandbox-runtime/src/http.rs`;
//! `auth_headers` now mints the spec's HMAC-signed bearer instead of a plain one.
//!
//! Every outcome is classified `Transient` or `Permanent` as a typed field,
//! decided at the call site from the transport error / status code — never
//! by parsing an error string back apart, matching the teacher's enum-of-kinds
//! discipline rather than string matching.

use crate::auth;
use crate::config::Config;
use crate::error::{CoordinatorError, Result};
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn build_url(base: &str, path: &str) -> Result<Url> {
    let base_url = Url::parse(base).map_err(|err| CoordinatorError::Permanent(format!("invalid provider base url: {err}")))?;
    base_url
        .join(path)
        .map_err(|err| CoordinatorError::Permanent(format!("invalid provider path '{path}': {err}")))
}

fn auth_headers(hmac_secret: &str) -> Result<reqwest::header::HeaderMap> {
    use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let token = auth::mint_service_token(hmac_secret, crate::model::now_ms())?;
    let value = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|_| CoordinatorError::Auth("invalid hmac bearer header".into()))?;
    headers.insert(AUTHORIZATION, value);
    Ok(headers)
}

/// Classify a transport-level failure. 502/503/504 and connect/timeout errors
/// are retryable; everything else (4xx, unrecognized 5xx) is not.
fn classify_status(status: StatusCode) -> CoordinatorError {
    match status {
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            CoordinatorError::Transient(format!("provider returned {status}"))
        }
        s if s.is_client_error() => CoordinatorError::Permanent(format!("provider rejected request: {s}")),
        s => CoordinatorError::Permanent(format!("provider returned unrecognized status {s}")),
    }
}

async fn send_json(client: &reqwest::Client, method: Method, url: Url, body: Option<Value>, headers: reqwest::header::HeaderMap) -> Result<Value> {
    let mut request = client.request(method, url).headers(headers);
    if let Some(body) = body {
        request = request.json(&body);
    }

    let response = request.send().await.map_err(|err| {
        if err.is_timeout() || err.is_connect() {
            CoordinatorError::Transient(format!("provider request failed: {err}"))
        } else {
            CoordinatorError::Permanent(format!("provider request failed: {err}"))
        }
    })?;

    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|err| CoordinatorError::Transient(format!("failed to read provider response: {err}")))?;

    if !status.is_success() {
        return Err(classify_status(status));
    }

    serde_json::from_str(&text).map_err(|err| CoordinatorError::Permanent(format!("invalid provider response json: {err}")))
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateSandboxConfig {
    pub session_id: String,
    pub repo_owner: String,
    pub repo_name: String,
    pub base_sha: Option<String>,
    pub cpu_cores: u32,
    pub memory_mb: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSandboxResult {
    pub sandbox_id: String,
    pub object_id: String,
    pub status: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotResult {
    pub image_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestoreResult {
    pub sandbox_id: String,
    pub object_id: String,
}

pub struct SandboxProviderClient {
    client: reqwest::Client,
    base_url: String,
    hmac_secret: Option<String>,
}

impl Default for SandboxProviderClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxProviderClient {
    /// Build a client from process-wide `Config`. The production path.
    pub fn new() -> Self {
        let config = Config::load();
        Self::with_config(
            config.provider_base_url.clone(),
            config.provider_hmac_secret.clone(),
            config.provider_request_timeout,
        )
    }

    /// Build a client against an explicit base URL / secret, bypassing the
    /// process-global `Config`. Used by tests so a mock server's ephemeral
    /// URL doesn't have to race the first `Config::load()` call in the
    /// process (`OnceCell` only ever initializes once per test binary).
    pub fn with_config(base_url: String, hmac_secret: Option<String>, timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builds with static config");
        Self { client, base_url, hmac_secret }
    }

    fn hmac_secret(&self) -> Result<String> {
        self.hmac_secret
            .clone()
            .ok_or_else(|| CoordinatorError::Permanent("sandbox provider hmac secret not configured".into()))
    }

    pub async fn create(&self, params: &CreateSandboxConfig) -> Result<CreateSandboxResult> {
        let url = build_url(&self.base_url, "/create-sandbox")?;
        let headers = auth_headers(&self.hmac_secret()?)?;
        let body = serde_json::to_value(params).map_err(CoordinatorError::from)?;
        let value = send_json(&self.client, Method::POST, url, Some(body), headers).await?;
        serde_json::from_value(value).map_err(|e| CoordinatorError::Permanent(format!("malformed create-sandbox response: {e}")))
    }

    pub async fn snapshot(&self, object_id: &str) -> Result<SnapshotResult> {
        let url = build_url(&self.base_url, "/snapshot-sandbox")?;
        let headers = auth_headers(&self.hmac_secret()?)?;
        let body = serde_json::json!({ "object_id": object_id });
        let value = send_json(&self.client, Method::POST, url, Some(body), headers).await?;
        serde_json::from_value(value).map_err(|e| CoordinatorError::Permanent(format!("malformed snapshot response: {e}")))
    }

    pub async fn restore(&self, snapshot_image_id: &str, params: &CreateSandboxConfig) -> Result<RestoreResult> {
        let url = build_url(&self.base_url, "/restore-sandbox")?;
        let headers = auth_headers(&self.hmac_secret()?)?;
        let mut body = serde_json::to_value(params).map_err(CoordinatorError::from)?;
        if let Value::Object(ref mut map) = body {
            map.insert("snapshot_image_id".into(), Value::String(snapshot_image_id.to_string()));
        }
        let value = send_json(&self.client, Method::POST, url, Some(body), headers).await?;
        serde_json::from_value(value).map_err(|e| CoordinatorError::Permanent(format!("malformed restore response: {e}")))
    }

    pub async fn health(&self) -> Result<()> {
        let url = build_url(&self.base_url, "/health")?;
        let headers = auth_headers(&self.hmac_secret()?)?;
        send_json(&self.client, Method::GET, url, None, headers).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> SandboxProviderClient {
        SandboxProviderClient::with_config(server.uri(), Some("secret".into()), Duration::from_secs(5))
    }

    #[test]
    fn classify_status_marks_5xx_gateway_errors_transient() {
        assert!(matches!(classify_status(StatusCode::BAD_GATEWAY), CoordinatorError::Transient(_)));
        assert!(matches!(classify_status(StatusCode::SERVICE_UNAVAILABLE), CoordinatorError::Transient(_)));
        assert!(matches!(classify_status(StatusCode::GATEWAY_TIMEOUT), CoordinatorError::Transient(_)));
    }

    #[test]
    fn classify_status_marks_4xx_permanent() {
        assert!(matches!(classify_status(StatusCode::BAD_REQUEST), CoordinatorError::Permanent(_)));
        assert!(matches!(classify_status(StatusCode::NOT_FOUND), CoordinatorError::Permanent(_)));
    }

    #[test]
    fn classify_status_marks_unrecognized_5xx_permanent() {
        assert!(matches!(classify_status(StatusCode::INTERNAL_SERVER_ERROR), CoordinatorError::Permanent(_)));
    }

    #[tokio::test]
    async fn create_sandbox_success_parses_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/create-sandbox"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sandbox_id": "sb-1",
                "object_id": "obj-1",
                "status": "spawning",
                "created_at": 1700000000000i64,
            })))
            .mount(&server)
            .await;
        let client = client_for(&server);
        let result = client
            .create(&CreateSandboxConfig {
                session_id: "s1".into(),
                repo_owner: "acme".into(),
                repo_name: "widgets".into(),
                base_sha: None,
                cpu_cores: 2,
                memory_mb: 2048,
            })
            .await
            .unwrap();
        assert_eq!(result.sandbox_id, "sb-1");
        assert_eq!(result.object_id, "obj-1");
    }

    #[tokio::test]
    async fn create_sandbox_503_classified_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/create-sandbox"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let client = client_for(&server);
        let err = client
            .create(&CreateSandboxConfig {
                session_id: "s1".into(),
                repo_owner: "acme".into(),
                repo_name: "widgets".into(),
                base_sha: None,
                cpu_cores: 2,
                memory_mb: 2048,
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn create_sandbox_400_classified_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/create-sandbox"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;
        let client = client_for(&server);
        let err = client
            .create(&CreateSandboxConfig {
                session_id: "s1".into(),
                repo_owner: "acme".into(),
                repo_name: "widgets".into(),
                base_sha: None,
                cpu_cores: 2,
                memory_mb: 2048,
            })
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(matches!(err, CoordinatorError::Permanent(_)));
    }
}
