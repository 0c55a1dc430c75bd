use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::{debug, info};
use waddle_core::types::AuthFailure;

use crate::error::{IdentityError, Result};
use crate::hashing::verify_secret;
use crate::store::{
    enabled_credentials_by_prefix, find_principal_by_name, get_principal, get_tenant,
    touch_credential_last_used,
};
use crate::token;
use crate::types::{Principal, PrincipalContext};

/// Turns a presented credential into a principal context.
///
/// Three forms are recognised: signed session tokens (from password
/// login), opaque API credentials (`wa-<principal-id>-<secret>`), and
/// name/password pairs (login endpoint only).
pub struct AuthResolver {
    db: Arc<Mutex<Connection>>,
    signing_secret: String,
    session_ttl_hours: u64,
}

impl AuthResolver {
    pub fn new(db: Arc<Mutex<Connection>>, signing_secret: String, session_ttl_hours: u64) -> Self {
        Self {
            db,
            signing_secret,
            session_ttl_hours,
        }
    }

    /// Resolve a bearer string from the Authorization header.
    ///
    /// API credentials are recognised by their `wa-` prefix; anything
    /// else is treated as a signed session token.
    pub fn resolve_bearer(&self, bearer: &str) -> Result<PrincipalContext> {
        if bearer.starts_with("wa-") {
            self.resolve_api_credential(bearer)
        } else {
            let claims = token::verify(bearer, &self.signing_secret)?;
            debug!(principal = %claims.sub, "session token accepted");
            Ok(claims.into_context())
        }
    }

    /// Password login. On success returns the context plus a freshly
    /// signed session token.
    pub fn login(&self, name: &str, password: &str) -> Result<(PrincipalContext, String)> {
        let conn = self.db.lock().unwrap();
        let principal = find_principal_by_name(&conn, name)?
            .ok_or(IdentityError::Authentication(AuthFailure::UnknownPrincipal))?;
        if !principal.enabled {
            return Err(IdentityError::Authentication(AuthFailure::Disabled));
        }
        let stored = principal
            .password_hash
            .as_deref()
            .ok_or(IdentityError::Authentication(AuthFailure::BadSecret))?;
        if !verify_secret(password, stored) {
            return Err(IdentityError::Authentication(AuthFailure::BadSecret));
        }
        self.check_tenant_enabled(&conn, &principal.tenant_id)?;

        let ctx = context_for(&principal, None);
        let session = token::sign(&ctx, &self.signing_secret, self.session_ttl_hours)?;
        info!(principal = %ctx.principal_id, "password login succeeded");
        Ok((ctx, session))
    }

    fn resolve_api_credential(&self, bearer: &str) -> Result<PrincipalContext> {
        // Split off the trailing secret segment; what remains is the
        // stored prefix `wa-<principal-id>`.
        let (prefix, secret) = bearer
            .rsplit_once('-')
            .ok_or(IdentityError::Authentication(AuthFailure::Malformed))?;
        if secret.is_empty() || prefix == "wa" || !prefix.starts_with("wa-") {
            return Err(IdentityError::Authentication(AuthFailure::Malformed));
        }

        let conn = self.db.lock().unwrap();
        let candidates = enabled_credentials_by_prefix(&conn, prefix)?;
        if candidates.is_empty() {
            return Err(IdentityError::Authentication(AuthFailure::UnknownPrincipal));
        }

        // A single successful hash-verify wins. Verification happens on
        // the full presented string, mirroring issuance.
        for record in &candidates {
            if !verify_secret(bearer, &record.secret_hash) {
                continue;
            }
            if is_expired(record.expires_at.as_deref()) {
                return Err(IdentityError::Authentication(AuthFailure::Expired));
            }
            let principal = get_principal(&conn, &record.principal_id)?
                .ok_or(IdentityError::Authentication(AuthFailure::UnknownPrincipal))?;
            if !principal.enabled {
                return Err(IdentityError::Authentication(AuthFailure::Disabled));
            }
            self.check_tenant_enabled(&conn, &principal.tenant_id)?;

            touch_credential_last_used(&conn, &record.id);
            debug!(principal = %principal.id, credential = %record.id, "API credential accepted");
            return Ok(context_for(&principal, Some(record.id.clone())));
        }

        Err(IdentityError::Authentication(AuthFailure::BadSecret))
    }

    fn check_tenant_enabled(&self, conn: &Connection, tenant_id: &str) -> Result<()> {
        match get_tenant(conn, tenant_id)? {
            Some(t) if t.enabled => Ok(()),
            _ => Err(IdentityError::Authentication(AuthFailure::Disabled)),
        }
    }
}

fn context_for(principal: &Principal, credential_id: Option<String>) -> PrincipalContext {
    PrincipalContext {
        principal_id: principal.id.clone(),
        name: principal.name.clone(),
        role: principal.role,
        tenant_id: principal.tenant_id.clone(),
        managed_tenants: principal.managed_tenants.clone(),
        credential_id,
    }
}

/// An expiry timestamp equal to "now" counts as expired.
fn is_expired(expires_at: Option<&str>) -> bool {
    match expires_at {
        None => false,
        Some(ts) => match chrono::DateTime::parse_from_rfc3339(ts) {
            Ok(t) => t.timestamp() <= chrono::Utc::now().timestamp(),
            // An unparseable expiry fails closed.
            Err(_) => true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::store::{create_principal, create_tenant, issue_credential, set_principal_enabled};
    use waddle_core::types::Role;

    fn resolver() -> (AuthResolver, Arc<Mutex<Connection>>) {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        let db = Arc::new(Mutex::new(conn));
        (AuthResolver::new(db.clone(), "test-signing-secret".into(), 24), db)
    }

    fn seed(db: &Arc<Mutex<Connection>>) -> (String, Principal) {
        let conn = db.lock().unwrap();
        let tenant = create_tenant(&conn, "acme", 10_000, 100_000).unwrap();
        let principal =
            create_principal(&conn, &tenant.id, "alice", Role::User, Some("open sesame")).unwrap();
        (tenant.id, principal)
    }

    #[test]
    fn api_credential_resolves_to_context() {
        let (resolver, db) = resolver();
        let (tenant_id, principal) = seed(&db);
        let issued = {
            let conn = db.lock().unwrap();
            issue_credential(&conn, &principal, "key", None, None, None).unwrap()
        };

        let ctx = resolver.resolve_bearer(&issued.plaintext).unwrap();
        assert_eq!(ctx.principal_id, principal.id);
        assert_eq!(ctx.tenant_id, tenant_id);
        assert_eq!(ctx.credential_id.as_deref(), Some(issued.credential.id.as_str()));

        // last_used_at stamped best-effort
        let conn = db.lock().unwrap();
        let reloaded = crate::store::get_credential(&conn, &issued.credential.id)
            .unwrap()
            .unwrap();
        assert!(reloaded.last_used_at.is_some());
    }

    #[test]
    fn wrong_secret_is_bad_secret() {
        let (resolver, db) = resolver();
        let (_, principal) = seed(&db);
        {
            let conn = db.lock().unwrap();
            issue_credential(&conn, &principal, "key", None, None, None).unwrap();
        }
        let err = resolver
            .resolve_bearer(&format!("wa-{}-{}", principal.id, "x".repeat(32)))
            .unwrap_err();
        assert!(matches!(
            err,
            IdentityError::Authentication(AuthFailure::BadSecret)
        ));
    }

    #[test]
    fn unknown_prefix_is_unknown_principal() {
        let (resolver, _db) = resolver();
        let err = resolver.resolve_bearer("wa-nobody-secret").unwrap_err();
        assert!(matches!(
            err,
            IdentityError::Authentication(AuthFailure::UnknownPrincipal)
        ));
    }

    #[test]
    fn malformed_bearer_is_malformed() {
        let (resolver, _db) = resolver();
        for bearer in ["wa-", "wa-x-"] {
            let err = resolver.resolve_bearer(bearer).unwrap_err();
            assert!(
                matches!(err, IdentityError::Authentication(AuthFailure::Malformed)),
                "{bearer}"
            );
        }
    }

    #[test]
    fn expired_credential_is_rejected() {
        let (resolver, db) = resolver();
        let (_, principal) = seed(&db);
        let past = (chrono::Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
        let issued = {
            let conn = db.lock().unwrap();
            issue_credential(&conn, &principal, "key", None, None, Some(&past)).unwrap()
        };
        let err = resolver.resolve_bearer(&issued.plaintext).unwrap_err();
        assert!(matches!(
            err,
            IdentityError::Authentication(AuthFailure::Expired)
        ));
    }

    #[test]
    fn disabled_principal_is_rejected() {
        let (resolver, db) = resolver();
        let (_, principal) = seed(&db);
        let issued = {
            let conn = db.lock().unwrap();
            let issued = issue_credential(&conn, &principal, "key", None, None, None).unwrap();
            set_principal_enabled(&conn, &principal.id, false).unwrap();
            issued
        };
        let err = resolver.resolve_bearer(&issued.plaintext).unwrap_err();
        assert!(matches!(
            err,
            IdentityError::Authentication(AuthFailure::Disabled)
        ));
    }

    #[test]
    fn login_yields_a_verifiable_session_token() {
        let (resolver, db) = resolver();
        seed(&db);
        let (ctx, session) = resolver.login("alice", "open sesame").unwrap();
        assert_eq!(ctx.name, "alice");

        let resolved = resolver.resolve_bearer(&session).unwrap();
        assert_eq!(resolved.principal_id, ctx.principal_id);
        assert!(resolved.credential_id.is_none());
    }

    #[test]
    fn login_with_wrong_password_fails() {
        let (resolver, db) = resolver();
        seed(&db);
        let err = resolver.login("alice", "wrong").unwrap_err();
        assert!(matches!(
            err,
            IdentityError::Authentication(AuthFailure::BadSecret)
        ));
    }
}
