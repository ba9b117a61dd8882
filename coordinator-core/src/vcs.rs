//! Version-control host client — §6.4.
//!
//! Installation-token issuance (RS256 JWT exchange), repository metadata,
//! and PR creation. Shares `send_json`-style plumbing with the sandbox
//! provider client (`provider.rs`) but is a distinct client: different base
//! URL, different auth (user bearer / app JWT rather than HMAC), different
//! failure semantics (never drives the circuit breaker — §4.1 ties the
//! breaker to the sandbox provider only).

use crate::auth;
use crate::error::{CoordinatorError, Result};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;

pub struct VcsClient {
    client: reqwest::Client,
    api_base_url: String,
    app_id: String,
    app_private_key_pem: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryMetadata {
    pub default_branch: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstallationToken {
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub html_url: String,
}

fn classify(status: StatusCode) -> CoordinatorError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            CoordinatorError::Unauthenticated(format!("version-control host rejected credentials: {status}"))
        }
        s if s.is_client_error() => CoordinatorError::Permanent(format!("version-control host rejected request: {s}")),
        s => CoordinatorError::Permanent(format!("version-control host returned {s}")),
    }
}

impl VcsClient {
    pub fn new(api_base_url: String, app_id: String, app_private_key_pem: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .expect("reqwest client builds with static config");
        Self { client, api_base_url, app_id, app_private_key_pem }
    }

    /// Exchange a fresh RS256 app JWT for a short-lived installation token (§6.4).
    pub async fn mint_installation_token(&self, installation_id: &str) -> Result<String> {
        let private_key = self
            .app_private_key_pem
            .as_deref()
            .ok_or_else(|| CoordinatorError::Permanent("version-control app private key not configured".into()))?;
        let jwt = auth::mint_app_jwt(&self.app_id, private_key, crate::model::now_ms() / 1000)?;

        let url = format!("{}/app/installations/{}/access_tokens", self.api_base_url.trim_end_matches('/'), installation_id);
        let response = self
            .client
            .request(Method::POST, &url)
            .bearer_auth(jwt)
            .send()
            .await
            .map_err(CoordinatorError::from)?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify(status));
        }
        let parsed: InstallationToken = response.json().await.map_err(CoordinatorError::from)?;
        Ok(parsed.token)
    }

    pub async fn repository_default_branch(&self, owner: &str, repo: &str, user_token: &str) -> Result<String> {
        let url = format!("{}/repos/{owner}/{repo}", self.api_base_url.trim_end_matches('/'));
        let response = self
            .client
            .request(Method::GET, &url)
            .bearer_auth(user_token)
            .send()
            .await
            .map_err(CoordinatorError::from)?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify(status));
        }
        let parsed: RepositoryMetadata = response.json().await.map_err(CoordinatorError::from)?;
        Ok(parsed.default_branch)
    }

    /// Create a pull request, authored using the prompting user's own token —
    /// never the installation token (§4.5, §9 "dual identity for git operations").
    pub async fn create_pull_request(
        &self,
        owner: &str,
        repo: &str,
        head_branch: &str,
        base_branch: &str,
        title: &str,
        user_token: &str,
    ) -> Result<PullRequest> {
        let url = format!("{}/repos/{owner}/{repo}/pulls", self.api_base_url.trim_end_matches('/'));
        let body: Value = serde_json::json!({
            "title": title,
            "head": head_branch,
            "base": base_branch,
        });
        let response = self
            .client
            .request(Method::POST, &url)
            .bearer_auth(user_token)
            .json(&body)
            .send()
            .await
            .map_err(CoordinatorError::from)?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify(status));
        }
        response.json().await.map_err(CoordinatorError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rsa_test_key() -> String {
        // A throwaway 2048-bit RSA private key used only by this test module.
        include_str!("../testdata/test_rsa_key.pem").to_string()
    }

    #[tokio::test]
    async fn repository_default_branch_parses_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "default_branch": "main",
            })))
            .mount(&server)
            .await;
        let client = VcsClient::new(server.uri(), "app-1".into(), None);
        let branch = client.repository_default_branch("acme", "widgets", "user-token").await.unwrap();
        assert_eq!(branch, "main");
    }

    #[tokio::test]
    async fn repository_default_branch_401_is_unauthenticated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let client = VcsClient::new(server.uri(), "app-1".into(), None);
        let err = client.repository_default_branch("acme", "widgets", "bad-token").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn mint_installation_token_without_key_fails_closed() {
        let client = VcsClient::new("https://api.example.test".into(), "app-1".into(), None);
        let err = client.mint_installation_token("inst-1").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Permanent(_)));
    }

    #[tokio::test]
    async fn mint_installation_token_success_parses_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/app/installations/inst-1/access_tokens"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "token": "ghs_abc123",
            })))
            .mount(&server)
            .await;
        let client = VcsClient::new(server.uri(), "app-1".into(), Some(rsa_test_key()));
        let token = client.mint_installation_token("inst-1").await.unwrap();
        assert_eq!(token, "ghs_abc123");
    }
}
