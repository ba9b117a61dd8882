//! Process-wide configuration, loaded once from the environment.
//!
//! Mirrors the teacher's `SidecarRuntimeConfig::load()` pattern: every field
//! is sourced from an env var with a documented default, parsed once into a
//! `OnceCell`, and reused for the rest of the process lifetime. Secrets are
//! read-only per-process state (§5) — nothing here is reloaded mid-flight.

use once_cell::sync::OnceCell;
use std::time::Duration;

static CONFIG: OnceCell<Config> = OnceCell::new();

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: String,

    /// Base URL of the external sandbox provider HTTP service (§4.1/§6.3).
    pub provider_base_url: String,
    /// Shared secret used to HMAC-sign outbound requests to the sandbox provider.
    pub provider_hmac_secret: Option<String>,
    pub provider_request_timeout: Duration,

    /// Secret authenticating inbound service-to-service calls into the Façade (§6.1).
    /// Kept distinct from `provider_hmac_secret` — see Open Question 1 in SPEC_FULL.md.
    pub internal_callback_secret: Option<String>,

    /// VCS app id + RSA private key (PEM) for installation-token JWT minting (§6.4).
    pub vcs_app_id: String,
    pub vcs_app_private_key_pem: Option<String>,
    /// Base URL of the version-control host's REST API (§6.4).
    pub vcs_api_base_url: String,

    /// Root key material for at-rest encryption of VCS access tokens.
    pub encryption_root_key: Option<String>,

    pub inactivity_timeout: Duration,
    pub heartbeat_threshold: Duration,
    pub sandbox_connect_timeout: Duration,

    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_window: Duration,
    pub circuit_breaker_cooldown: Duration,

    pub push_timeout: Duration,
    pub ws_auth_timeout: Duration,

    pub cors_allowed_origins: String,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_secs(key: &str, default_secs: u64) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(default_secs))
}

impl Config {
    fn from_env() -> Self {
        Self {
            bind_addr: env_or("COORDINATOR_BIND_ADDR", "0.0.0.0:8080"),

            provider_base_url: env_or("SANDBOX_PROVIDER_URL", "http://localhost:9090"),
            provider_hmac_secret: std::env::var("SANDBOX_PROVIDER_HMAC_SECRET").ok(),
            provider_request_timeout: env_secs("SANDBOX_PROVIDER_TIMEOUT_SECS", 30),

            internal_callback_secret: std::env::var("INTERNAL_CALLBACK_SECRET").ok(),

            vcs_app_id: env_or("VCS_APP_ID", ""),
            vcs_app_private_key_pem: std::env::var("VCS_APP_PRIVATE_KEY_PEM").ok(),
            vcs_api_base_url: env_or("VCS_API_BASE_URL", "https://api.github.com"),

            encryption_root_key: std::env::var("TOKEN_ENCRYPTION_KEY").ok(),

            inactivity_timeout: env_secs("SANDBOX_INACTIVITY_TIMEOUT_SECS", 600),
            heartbeat_threshold: env_secs("SANDBOX_HEARTBEAT_THRESHOLD_SECS", 60),
            sandbox_connect_timeout: env_secs("SANDBOX_CONNECT_TIMEOUT_SECS", 120),

            circuit_breaker_failure_threshold: std::env::var("CIRCUIT_BREAKER_FAILURE_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            circuit_breaker_window: env_secs("CIRCUIT_BREAKER_WINDOW_SECS", 120),
            circuit_breaker_cooldown: env_secs("CIRCUIT_BREAKER_COOLDOWN_SECS", 60),

            push_timeout: env_secs("PUSH_TIMEOUT_SECS", 180),
            ws_auth_timeout: env_secs("WS_AUTH_TIMEOUT_SECS", 30),

            cors_allowed_origins: env_or("CORS_ALLOWED_ORIGINS", "*"),
        }
    }

    pub fn load() -> &'static Config {
        CONFIG.get_or_init(Config::from_env)
    }
}
