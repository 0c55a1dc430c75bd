use serde::{Deserialize, Serialize};
use waddle_core::types::Role;

/// A billing and isolation unit. Tenants are soft-disabled, never deleted,
/// so usage and security history stays attributable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub token_quota_daily: u64,
    pub token_quota_monthly: u64,
    pub enabled: bool,
    pub created_at: String,
}

/// A human or service account. Belongs to exactly one tenant; resource
/// managers may additionally manage the tenants in `managed_tenants`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub role: Role,
    /// Stored as a JSON array in SQLite.
    pub managed_tenants: Vec<String>,
    /// Argon2 hash; None for service accounts that only hold credentials.
    pub password_hash: Option<String>,
    pub enabled: bool,
    pub created_at: String,
}

/// A long-lived opaque bearer credential bound to a principal.
///
/// Only the prefix and the argon2 hash of the full string are stored;
/// the plaintext is printed exactly once at issuance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    /// `wa-<principal-id>`: identifies candidate records without
    /// revealing the secret.
    pub prefix: String,
    pub secret_hash: String,
    pub principal_id: String,
    pub tenant_id: String,
    pub name: String,
    /// Overrides the tenant quota when set.
    pub quota_daily_override: Option<u64>,
    pub quota_monthly_override: Option<u64>,
    /// Hint for the fronting reverse proxy; not enforced here.
    pub rate_limit_rpm: u32,
    pub expires_at: Option<String>,
    pub last_used_at: Option<String>,
    pub enabled: bool,
    pub created_at: String,
}

/// Result of issuing a credential. `plaintext` is never persisted.
#[derive(Debug)]
pub struct IssuedCredential {
    pub credential: Credential,
    pub plaintext: String,
}

/// The authenticated identity carried through the request pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrincipalContext {
    pub principal_id: String,
    pub name: String,
    pub role: Role,
    pub tenant_id: String,
    pub managed_tenants: Vec<String>,
    /// Set when the principal authenticated with an API credential.
    pub credential_id: Option<String>,
}

impl PrincipalContext {
    /// True when `tenant_id` is one this principal manages. A principal's
    /// primary tenant does not count as managed unless listed.
    pub fn manages(&self, tenant_id: &str) -> bool {
        self.managed_tenants.iter().any(|t| t == tenant_id)
    }
}
