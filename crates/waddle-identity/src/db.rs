use rusqlite::{Connection, Result};
use std::str::FromStr;
use waddle_core::types::Role;

use crate::types::{Credential, Principal, Tenant};

/// Initialise all identity tables. Safe to call on every startup —
/// CREATE IF NOT EXISTS makes it idempotent.
pub fn init_db(conn: &Connection) -> Result<()> {
    create_tenants_table(conn)?;
    create_principals_table(conn)?;
    create_credentials_table(conn)?;
    Ok(())
}

fn create_tenants_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tenants (
            id                   TEXT PRIMARY KEY NOT NULL,
            name                 TEXT NOT NULL UNIQUE,
            token_quota_daily    INTEGER NOT NULL DEFAULT 100000,
            token_quota_monthly  INTEGER NOT NULL DEFAULT 1000000,
            enabled              INTEGER NOT NULL DEFAULT 1,
            created_at           TEXT NOT NULL
        );",
    )
}

fn create_principals_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS principals (
            id              TEXT PRIMARY KEY NOT NULL,
            tenant_id       TEXT NOT NULL REFERENCES tenants(id),
            name            TEXT NOT NULL UNIQUE,
            role            TEXT NOT NULL DEFAULT 'user',
            managed_tenants TEXT NOT NULL DEFAULT '[]',  -- JSON array
            password_hash   TEXT,
            enabled         INTEGER NOT NULL DEFAULT 1,
            created_at      TEXT NOT NULL
        );",
    )
}

fn create_credentials_table(conn: &Connection) -> Result<()> {
    // idx_credentials_prefix serves the hot auth path: the resolver looks
    // up candidate records by the non-secret prefix of the bearer string.
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS credentials (
            id                     TEXT PRIMARY KEY NOT NULL,
            prefix                 TEXT NOT NULL,
            secret_hash            TEXT NOT NULL,
            principal_id           TEXT NOT NULL REFERENCES principals(id),
            tenant_id              TEXT NOT NULL REFERENCES tenants(id),
            name                   TEXT NOT NULL DEFAULT '',
            quota_daily_override   INTEGER,
            quota_monthly_override INTEGER,
            rate_limit_rpm         INTEGER NOT NULL DEFAULT 60,
            expires_at             TEXT,
            last_used_at           TEXT,
            enabled                INTEGER NOT NULL DEFAULT 1,
            created_at             TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_credentials_prefix
            ON credentials (prefix);",
    )
}

/// Map a SELECT row (column order from TENANT_SELECT_SQL) to a Tenant.
pub(crate) fn row_to_tenant(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: row.get(0)?,
        name: row.get(1)?,
        token_quota_daily: row.get(2)?,
        token_quota_monthly: row.get(3)?,
        enabled: row.get::<_, i32>(4)? != 0,
        created_at: row.get(5)?,
    })
}

pub(crate) const TENANT_SELECT_SQL: &str =
    "SELECT id, name, token_quota_daily, token_quota_monthly, enabled, created_at FROM tenants";

/// Map a SELECT row (column order from PRINCIPAL_SELECT_SQL) to a Principal.
pub(crate) fn row_to_principal(row: &rusqlite::Row<'_>) -> rusqlite::Result<Principal> {
    let managed: Vec<String> =
        serde_json::from_str(&row.get::<_, String>(4)?).unwrap_or_default();
    let role = Role::from_str(&row.get::<_, String>(3)?).unwrap_or_default();
    Ok(Principal {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        role,
        managed_tenants: managed,
        password_hash: row.get(5)?,
        enabled: row.get::<_, i32>(6)? != 0,
        created_at: row.get(7)?,
    })
}

pub(crate) const PRINCIPAL_SELECT_SQL: &str = "SELECT id, tenant_id, name, role, \
     managed_tenants, password_hash, enabled, created_at FROM principals";

/// Map a SELECT row (column order from CREDENTIAL_SELECT_SQL) to a Credential.
pub(crate) fn row_to_credential(row: &rusqlite::Row<'_>) -> rusqlite::Result<Credential> {
    Ok(Credential {
        id: row.get(0)?,
        prefix: row.get(1)?,
        secret_hash: row.get(2)?,
        principal_id: row.get(3)?,
        tenant_id: row.get(4)?,
        name: row.get(5)?,
        quota_daily_override: row.get(6)?,
        quota_monthly_override: row.get(7)?,
        rate_limit_rpm: row.get(8)?,
        expires_at: row.get(9)?,
        last_used_at: row.get(10)?,
        enabled: row.get::<_, i32>(11)? != 0,
        created_at: row.get(12)?,
    })
}

pub(crate) const CREDENTIAL_SELECT_SQL: &str = "SELECT id, prefix, secret_hash, principal_id, \
     tenant_id, name, quota_daily_override, quota_monthly_override, rate_limit_rpm, \
     expires_at, last_used_at, enabled, created_at FROM credentials";
