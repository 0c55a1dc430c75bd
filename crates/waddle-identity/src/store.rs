use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use rusqlite::{params, Connection};
use uuid::Uuid;
use waddle_core::types::Role;

use crate::db::{
    row_to_credential, row_to_principal, row_to_tenant, CREDENTIAL_SELECT_SQL,
    PRINCIPAL_SELECT_SQL, TENANT_SELECT_SQL,
};
use crate::error::{IdentityError, Result};
use crate::hashing::hash_secret;
use crate::types::{Credential, IssuedCredential, Principal, Tenant};

/// Length of the random secret portion of an API credential.
const CREDENTIAL_SECRET_LEN: usize = 32;

// ── Tenants ───────────────────────────────────────────────────────────────────

/// Insert a brand-new tenant row. Id is generated here so the caller
/// immediately has the canonical id without a follow-up query.
pub fn create_tenant(
    conn: &Connection,
    name: &str,
    quota_daily: u64,
    quota_monthly: u64,
) -> Result<Tenant> {
    let tenant = Tenant {
        id: Uuid::now_v7().to_string(),
        name: name.to_string(),
        token_quota_daily: quota_daily,
        token_quota_monthly: quota_monthly,
        enabled: true,
        created_at: Utc::now().to_rfc3339(),
    };
    conn.execute(
        "INSERT INTO tenants (id, name, token_quota_daily, token_quota_monthly, enabled, created_at)
         VALUES (?1, ?2, ?3, ?4, 1, ?5)",
        params![
            tenant.id,
            tenant.name,
            tenant.token_quota_daily,
            tenant.token_quota_monthly,
            tenant.created_at
        ],
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            IdentityError::AlreadyExists(format!("tenant {}", name))
        }
        other => IdentityError::Database(other),
    })?;
    Ok(tenant)
}

/// Load a tenant by primary key. Returns None instead of an error when
/// absent so callers decide whether missing is exceptional.
pub fn get_tenant(conn: &Connection, tenant_id: &str) -> Result<Option<Tenant>> {
    let sql = format!("{} WHERE id = ?1", TENANT_SELECT_SQL);
    let mut stmt = conn.prepare(&sql)?;
    match stmt.query_row(params![tenant_id], row_to_tenant) {
        Ok(t) => Ok(Some(t)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(IdentityError::Database(e)),
    }
}

pub fn find_tenant_by_name(conn: &Connection, name: &str) -> Result<Option<Tenant>> {
    let sql = format!("{} WHERE name = ?1", TENANT_SELECT_SQL);
    let mut stmt = conn.prepare(&sql)?;
    match stmt.query_row(params![name], row_to_tenant) {
        Ok(t) => Ok(Some(t)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(IdentityError::Database(e)),
    }
}

/// Tenants are soft-disabled; rows are never deleted while usage or
/// security events reference them.
pub fn set_tenant_enabled(conn: &Connection, tenant_id: &str, enabled: bool) -> Result<()> {
    let rows = conn.execute(
        "UPDATE tenants SET enabled=?2 WHERE id=?1",
        params![tenant_id, enabled as i32],
    )?;
    if rows == 0 {
        return Err(IdentityError::NotFound(format!("tenant {}", tenant_id)));
    }
    Ok(())
}

// ── Principals ────────────────────────────────────────────────────────────────

pub fn create_principal(
    conn: &Connection,
    tenant_id: &str,
    name: &str,
    role: Role,
    password: Option<&str>,
) -> Result<Principal> {
    let password_hash = match password {
        Some(pw) => Some(hash_secret(pw)?),
        None => None,
    };
    let principal = Principal {
        id: Uuid::now_v7().to_string(),
        tenant_id: tenant_id.to_string(),
        name: name.to_string(),
        role,
        managed_tenants: vec![],
        password_hash,
        enabled: true,
        created_at: Utc::now().to_rfc3339(),
    };
    conn.execute(
        "INSERT INTO principals (id, tenant_id, name, role, managed_tenants, password_hash, enabled, created_at)
         VALUES (?1, ?2, ?3, ?4, '[]', ?5, 1, ?6)",
        params![
            principal.id,
            principal.tenant_id,
            principal.name,
            principal.role.to_string(),
            principal.password_hash,
            principal.created_at
        ],
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            IdentityError::AlreadyExists(format!("principal {}", name))
        }
        other => IdentityError::Database(other),
    })?;
    Ok(principal)
}

pub fn get_principal(conn: &Connection, principal_id: &str) -> Result<Option<Principal>> {
    let sql = format!("{} WHERE id = ?1", PRINCIPAL_SELECT_SQL);
    let mut stmt = conn.prepare(&sql)?;
    match stmt.query_row(params![principal_id], row_to_principal) {
        Ok(p) => Ok(Some(p)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(IdentityError::Database(e)),
    }
}

pub fn find_principal_by_name(conn: &Connection, name: &str) -> Result<Option<Principal>> {
    let sql = format!("{} WHERE name = ?1", PRINCIPAL_SELECT_SQL);
    let mut stmt = conn.prepare(&sql)?;
    match stmt.query_row(params![name], row_to_principal) {
        Ok(p) => Ok(Some(p)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(IdentityError::Database(e)),
    }
}

/// Replace the set of tenants a resource manager may administer.
pub fn set_managed_tenants(
    conn: &Connection,
    principal_id: &str,
    tenant_ids: &[String],
) -> Result<()> {
    let json = serde_json::to_string(tenant_ids)?;
    let rows = conn.execute(
        "UPDATE principals SET managed_tenants=?2 WHERE id=?1",
        params![principal_id, json],
    )?;
    if rows == 0 {
        return Err(IdentityError::NotFound(format!("principal {}", principal_id)));
    }
    Ok(())
}

/// Disabling is preferred over deletion: usage_records and
/// security_events keep referencing the principal id.
pub fn set_principal_enabled(conn: &Connection, principal_id: &str, enabled: bool) -> Result<()> {
    let rows = conn.execute(
        "UPDATE principals SET enabled=?2 WHERE id=?1",
        params![principal_id, enabled as i32],
    )?;
    if rows == 0 {
        return Err(IdentityError::NotFound(format!("principal {}", principal_id)));
    }
    Ok(())
}

// ── Credentials ───────────────────────────────────────────────────────────────

/// Issue a new API credential for a principal.
///
/// The plaintext `wa-<principal-id>-<secret>` is returned exactly once;
/// only its prefix and argon2 hash are stored. The prefix covers
/// everything before the final secret segment so the resolver can narrow
/// candidates without touching the secret.
pub fn issue_credential(
    conn: &Connection,
    principal: &Principal,
    name: &str,
    quota_daily_override: Option<u64>,
    quota_monthly_override: Option<u64>,
    expires_at: Option<&str>,
) -> Result<IssuedCredential> {
    let secret: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CREDENTIAL_SECRET_LEN)
        .map(char::from)
        .collect();
    let prefix = format!("wa-{}", principal.id);
    let plaintext = format!("{}-{}", prefix, secret);
    let secret_hash = hash_secret(&plaintext)?;

    let credential = Credential {
        id: Uuid::now_v7().to_string(),
        prefix,
        secret_hash,
        principal_id: principal.id.clone(),
        tenant_id: principal.tenant_id.clone(),
        name: name.to_string(),
        quota_daily_override,
        quota_monthly_override,
        rate_limit_rpm: 60,
        expires_at: expires_at.map(str::to_string),
        last_used_at: None,
        enabled: true,
        created_at: Utc::now().to_rfc3339(),
    };
    conn.execute(
        "INSERT INTO credentials (id, prefix, secret_hash, principal_id, tenant_id, name,
             quota_daily_override, quota_monthly_override, rate_limit_rpm, expires_at,
             last_used_at, enabled, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL, 1, ?11)",
        params![
            credential.id,
            credential.prefix,
            credential.secret_hash,
            credential.principal_id,
            credential.tenant_id,
            credential.name,
            credential.quota_daily_override,
            credential.quota_monthly_override,
            credential.rate_limit_rpm,
            credential.expires_at,
            credential.created_at
        ],
    )?;

    Ok(IssuedCredential { credential, plaintext })
}

pub fn get_credential(conn: &Connection, credential_id: &str) -> Result<Option<Credential>> {
    let sql = format!("{} WHERE id = ?1", CREDENTIAL_SELECT_SQL);
    let mut stmt = conn.prepare(&sql)?;
    match stmt.query_row(params![credential_id], row_to_credential) {
        Ok(c) => Ok(Some(c)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(IdentityError::Database(e)),
    }
}

/// All enabled credential records sharing a prefix. More than one row is
/// normal; a principal can hold several live credentials.
pub fn enabled_credentials_by_prefix(conn: &Connection, prefix: &str) -> Result<Vec<Credential>> {
    let sql = format!("{} WHERE prefix = ?1 AND enabled = 1", CREDENTIAL_SELECT_SQL);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![prefix], row_to_credential)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Best-effort last-used stamp; auth must not fail because this write does.
pub fn touch_credential_last_used(conn: &Connection, credential_id: &str) {
    let now = Utc::now().to_rfc3339();
    if let Err(e) = conn.execute(
        "UPDATE credentials SET last_used_at=?2 WHERE id=?1",
        params![credential_id, now],
    ) {
        tracing::debug!(credential_id, err = %e, "failed to stamp credential last_used_at");
    }
}

pub fn set_credential_enabled(conn: &Connection, credential_id: &str, enabled: bool) -> Result<()> {
    let rows = conn.execute(
        "UPDATE credentials SET enabled=?2 WHERE id=?1",
        params![credential_id, enabled as i32],
    )?;
    if rows == 0 {
        return Err(IdentityError::NotFound(format!("credential {}", credential_id)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::hashing::verify_secret;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        conn
    }

    fn seed(conn: &Connection) -> (Tenant, Principal) {
        let tenant = create_tenant(conn, "acme", 10_000, 100_000).unwrap();
        let principal =
            create_principal(conn, &tenant.id, "alice", Role::User, Some("pw")).unwrap();
        (tenant, principal)
    }

    #[test]
    fn tenant_names_are_unique() {
        let conn = test_conn();
        create_tenant(&conn, "acme", 1, 1).unwrap();
        let err = create_tenant(&conn, "acme", 1, 1).unwrap_err();
        assert!(matches!(err, IdentityError::AlreadyExists(_)));
    }

    #[test]
    fn issued_credential_verifies_and_disabling_revokes() {
        let conn = test_conn();
        let (_, principal) = seed(&conn);
        let issued = issue_credential(&conn, &principal, "ci key", None, None, None).unwrap();

        assert!(issued.plaintext.starts_with(&format!("wa-{}-", principal.id)));
        assert!(verify_secret(&issued.plaintext, &issued.credential.secret_hash));

        let found = enabled_credentials_by_prefix(&conn, &issued.credential.prefix).unwrap();
        assert_eq!(found.len(), 1);

        set_credential_enabled(&conn, &issued.credential.id, false).unwrap();
        let found = enabled_credentials_by_prefix(&conn, &issued.credential.prefix).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn two_credentials_share_one_prefix() {
        let conn = test_conn();
        let (_, principal) = seed(&conn);
        let a = issue_credential(&conn, &principal, "a", None, None, None).unwrap();
        let b = issue_credential(&conn, &principal, "b", None, None, None).unwrap();
        assert_eq!(a.credential.prefix, b.credential.prefix);
        assert_ne!(a.plaintext, b.plaintext);

        let found = enabled_credentials_by_prefix(&conn, &a.credential.prefix).unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn managed_tenants_round_trip() {
        let conn = test_conn();
        let (tenant, principal) = seed(&conn);
        set_managed_tenants(&conn, &principal.id, &[tenant.id.clone()]).unwrap();
        let loaded = get_principal(&conn, &principal.id).unwrap().unwrap();
        assert_eq!(loaded.managed_tenants, vec![tenant.id]);
    }
}
