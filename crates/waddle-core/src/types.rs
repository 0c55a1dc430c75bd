use serde::{Deserialize, Serialize};
use std::fmt;

/// Principal role hierarchy: admin > resource_manager > reporter > user.
///
/// Roles map to a fixed permission set; there is no per-principal
/// permission storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    ResourceManager,
    Reporter,
    #[default]
    User,
}

impl Role {
    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Admin => write!(f, "admin"),
            Role::ResourceManager => write!(f, "resource_manager"),
            Role::Reporter => write!(f, "reporter"),
            Role::User => write!(f, "user"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "resource_manager" => Ok(Role::ResourceManager),
            "reporter" => Ok(Role::Reporter),
            "user" => Ok(Role::User),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Upstream backend family. Determines the wire dialect a provider link
/// speaks and which conversion-rate rows apply to its models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible chat completions API.
    OpenAi,
    /// Anthropic-compatible messages API.
    Anthropic,
    /// Ollama-compatible local API (supports model pull/remove).
    Ollama,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::OpenAi => write!(f, "openai"),
            ProviderKind::Anthropic => write!(f, "anthropic"),
            ProviderKind::Ollama => write!(f, "ollama"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "ollama" => Ok(ProviderKind::Ollama),
            other => Err(format!("unknown provider kind: {}", other)),
        }
    }
}

/// Provider selection policy. Set at startup, overridable per request
/// and at runtime through the admin routing endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    RoundRobin,
    CostOptimized,
    LatencyOptimized,
    #[default]
    LoadBalanced,
    Failover,
    Random,
}

impl fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingStrategy::RoundRobin => write!(f, "round-robin"),
            RoutingStrategy::CostOptimized => write!(f, "cost-optimized"),
            RoutingStrategy::LatencyOptimized => write!(f, "latency-optimized"),
            RoutingStrategy::LoadBalanced => write!(f, "load-balanced"),
            RoutingStrategy::Failover => write!(f, "failover"),
            RoutingStrategy::Random => write!(f, "random"),
        }
    }
}

impl std::str::FromStr for RoutingStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(RoutingStrategy::RoundRobin),
            "cost-optimized" => Ok(RoutingStrategy::CostOptimized),
            "latency-optimized" => Ok(RoutingStrategy::LatencyOptimized),
            "load-balanced" => Ok(RoutingStrategy::LoadBalanced),
            "failover" => Ok(RoutingStrategy::Failover),
            "random" => Ok(RoutingStrategy::Random),
            other => Err(format!("unknown routing strategy: {}", other)),
        }
    }
}

/// Why an authentication attempt was rejected. Carried inside
/// `WaddleError::AuthenticationFailed`; never exposes the secret itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    UnknownPrincipal,
    BadSecret,
    Disabled,
    Expired,
    Malformed,
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthFailure::UnknownPrincipal => write!(f, "unknown-principal"),
            AuthFailure::BadSecret => write!(f, "bad-secret"),
            AuthFailure::Disabled => write!(f, "disabled"),
            AuthFailure::Expired => write!(f, "expired"),
            AuthFailure::Malformed => write!(f, "malformed"),
        }
    }
}

/// Usage versus limit for one quota period.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuotaPeriodDetail {
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    pub ok: bool,
}

impl QuotaPeriodDetail {
    pub fn new(used: u64, limit: u64) -> Self {
        Self {
            used,
            limit,
            remaining: limit.saturating_sub(used),
            ok: used < limit,
        }
    }
}

/// Daily + monthly admission snapshot returned by the token accountant
/// and echoed in 429 responses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuotaDetail {
    pub daily: QuotaPeriodDetail,
    pub monthly: QuotaPeriodDetail,
}

impl QuotaDetail {
    pub fn ok(&self) -> bool {
        self.daily.ok && self.monthly.ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn role_round_trips_through_strings() {
        for role in [Role::Admin, Role::ResourceManager, Role::Reporter, Role::User] {
            assert_eq!(Role::from_str(&role.to_string()).unwrap(), role);
        }
    }

    #[test]
    fn routing_strategy_uses_kebab_case() {
        assert_eq!(
            RoutingStrategy::from_str("load-balanced").unwrap(),
            RoutingStrategy::LoadBalanced
        );
        assert_eq!(RoutingStrategy::RoundRobin.to_string(), "round-robin");
    }

    #[test]
    fn quota_detail_remaining_saturates() {
        let d = QuotaPeriodDetail::new(150, 100);
        assert_eq!(d.remaining, 0);
        assert!(!d.ok);
    }
}
