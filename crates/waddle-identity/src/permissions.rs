use waddle_core::types::Role;

use crate::error::{IdentityError, Result};
use crate::types::PrincipalContext;

/// All permissions that can be checked, in one place. Adding a variant
/// forces the compiler through `granted_to()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    SystemConfig,
    SystemMonitor,
    SystemHealth,
    TenantRead,
    TenantUpdate,
    PrincipalRead,
    PrincipalUpdate,
    CredentialCreate,
    CredentialRead,
    CredentialUpdate,
    QuotaRead,
    QuotaUpdate,
    AnalyticsRead,
    AnalyticsSecurity,
    ProviderConfig,
    ProxyUse,
    ProxyRoute,
}

impl Permission {
    /// Wire name, e.g. "quota:update". Used in 403 responses and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Permission::SystemConfig => "system:config",
            Permission::SystemMonitor => "system:monitor",
            Permission::SystemHealth => "system:health",
            Permission::TenantRead => "tenant:read",
            Permission::TenantUpdate => "tenant:update",
            Permission::PrincipalRead => "principal:read",
            Permission::PrincipalUpdate => "principal:update",
            Permission::CredentialCreate => "credential:create",
            Permission::CredentialRead => "credential:read",
            Permission::CredentialUpdate => "credential:update",
            Permission::QuotaRead => "quota:read",
            Permission::QuotaUpdate => "quota:update",
            Permission::AnalyticsRead => "analytics:read",
            Permission::AnalyticsSecurity => "analytics:security",
            Permission::ProviderConfig => "provider:config",
            Permission::ProxyUse => "proxy:use",
            Permission::ProxyRoute => "proxy:route",
        }
    }

    /// The fixed role → permission table. Deliberately a flat match,
    /// not role inheritance: each role lists what it holds.
    fn granted_to(&self, role: Role) -> bool {
        match role {
            Role::Admin => true,
            Role::ResourceManager => matches!(
                self,
                Permission::SystemHealth
                    | Permission::TenantRead
                    | Permission::TenantUpdate
                    | Permission::PrincipalRead
                    | Permission::PrincipalUpdate
                    | Permission::CredentialCreate
                    | Permission::CredentialRead
                    | Permission::CredentialUpdate
                    | Permission::QuotaRead
                    | Permission::QuotaUpdate
                    | Permission::AnalyticsRead
                    | Permission::ProxyUse
            ),
            Role::Reporter => matches!(
                self,
                Permission::SystemHealth
                    | Permission::TenantRead
                    | Permission::PrincipalRead
                    | Permission::AnalyticsRead
                    | Permission::AnalyticsSecurity
                    | Permission::ProxyUse
            ),
            Role::User => matches!(
                self,
                Permission::SystemHealth
                    | Permission::CredentialCreate
                    | Permission::CredentialRead
                    | Permission::CredentialUpdate
                    | Permission::QuotaRead
                    | Permission::AnalyticsRead
                    | Permission::ProxyUse
            ),
        }
    }
}

/// Check `permission` for `ctx`, optionally scoped to a resource tenant
/// and resource principal.
///
/// Admin passes unconditionally. Resource managers and reporters must
/// hold the resource tenant in their managed set; plain users are
/// confined to their own tenant and their own records.
pub fn check(
    ctx: &PrincipalContext,
    permission: Permission,
    resource_tenant: Option<&str>,
    resource_principal: Option<&str>,
) -> Result<()> {
    let denied = || IdentityError::PermissionDenied(permission.name().to_string());

    if !permission.granted_to(ctx.role) {
        return Err(denied());
    }
    if ctx.role == Role::Admin {
        return Ok(());
    }

    if let Some(tenant) = resource_tenant {
        let tenant_ok = match ctx.role {
            Role::Admin => true,
            Role::ResourceManager | Role::Reporter => ctx.manages(tenant),
            Role::User => tenant == ctx.tenant_id,
        };
        if !tenant_ok {
            return Err(denied());
        }
    }

    if let Some(principal) = resource_principal {
        if ctx.role == Role::User && principal != ctx.principal_id {
            return Err(denied());
        }
    }

    Ok(())
}
