use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::types::RoutingStrategy;

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_BIND: &str = "0.0.0.0";
/// Hard ceiling on concurrent upstream calls unless overridden.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 100;
/// Whole-request deadline; the upstream call gets this minus the margin.
pub const REQUEST_DEADLINE_SECS: u64 = 300;
pub const DEADLINE_SAFETY_MARGIN_SECS: u64 = 5;
/// How long an admission waits for an in-flight permit before failing fast.
pub const OVERLOAD_WAIT_MS: u64 = 100;

/// Top-level config (waddle.toml + WADDLE_* env overrides).
///
/// Environment names follow figment's prefix/split convention, e.g.
/// `WADDLE_AUTH_SIGNING_SECRET`, `WADDLE_DATABASE_PATH`,
/// `WADDLE_SECURITY_POLICY`, `WADDLE_ROUTING_MAX_IN_FLIGHT`,
/// `WADDLE_ROUTING_DEFAULT_STRATEGY`, `WADDLE_GATEWAY_BIND`,
/// `WADDLE_GATEWAY_PORT`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaddleConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC key for session token signing. The placeholder default lets
    /// offline CLI commands run; the server warns loudly when serving
    /// with it.
    #[serde(default = "default_signing_secret")]
    pub signing_secret: String,
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: u64,
}

impl AuthConfig {
    pub fn has_placeholder_secret(&self) -> bool {
        self.signing_secret == default_signing_secret()
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            signing_secret: default_signing_secret(),
            session_ttl_hours: default_session_ttl_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// One of "strict", "balanced", "permissive".
    #[serde(default = "default_policy")]
    pub policy: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            policy: default_policy(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub default_strategy: RoutingStrategy,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_strategy: RoutingStrategy::default(),
            max_in_flight: default_max_in_flight(),
            upstream_timeout_secs: default_upstream_timeout_secs(),
        }
    }
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_session_ttl_hours() -> u64 {
    24
}
fn default_signing_secret() -> String {
    "change-me".to_string()
}
fn default_db_path() -> String {
    "waddle.db".to_string()
}
fn default_policy() -> String {
    "balanced".to_string()
}
fn default_max_in_flight() -> usize {
    DEFAULT_MAX_IN_FLIGHT
}
fn default_upstream_timeout_secs() -> u64 {
    REQUEST_DEADLINE_SECS - DEADLINE_SAFETY_MARGIN_SECS
}

impl WaddleConfig {
    /// Load config from a TOML file with WADDLE_* env var overrides.
    /// Env overrides win so containerized deployments need no file at all.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path.unwrap_or("waddle.toml");

        let config: WaddleConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("WADDLE_").split("_"))
            .extract()
            .map_err(|e| crate::error::WaddleError::Config(e.to_string()))?;

        Ok(config)
    }
}
