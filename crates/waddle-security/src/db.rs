use rusqlite::{params, Connection, Result};

use crate::types::ThreatDetection;

/// Initialise the security event log. Idempotent.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS security_events (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            ts                  TEXT NOT NULL,
            principal_id        TEXT,
            credential_id       TEXT,
            tenant_id           TEXT,
            request_fingerprint TEXT NOT NULL,
            threat_kind         TEXT NOT NULL,
            severity            TEXT NOT NULL,
            blocked             INTEGER NOT NULL DEFAULT 0,
            prompt_sample       TEXT NOT NULL,
            detail              TEXT NOT NULL DEFAULT '{}',  -- JSON
            source_ip           TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_security_events_ts_principal
            ON security_events (ts, principal_id);",
    )
}

/// Append one event row. The prompt sample is already truncated by the
/// caller; detail carries the matched patterns, confidence, and policy.
#[allow(clippy::too_many_arguments)]
pub fn insert_event(
    conn: &Connection,
    ts: &str,
    principal_id: Option<&str>,
    credential_id: Option<&str>,
    tenant_id: Option<&str>,
    fingerprint: &str,
    threat: &ThreatDetection,
    blocked: bool,
    prompt_sample: &str,
    policy_name: &str,
    source_ip: Option<&str>,
) -> Result<()> {
    let detail = serde_json::json!({
        "patterns": threat.matched,
        "confidence": threat.confidence,
        "policy": policy_name,
    });
    conn.execute(
        "INSERT INTO security_events (ts, principal_id, credential_id, tenant_id,
             request_fingerprint, threat_kind, severity, blocked, prompt_sample, detail, source_ip)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            ts,
            principal_id,
            credential_id,
            tenant_id,
            fingerprint,
            threat.kind.to_string(),
            threat.severity.to_string(),
            blocked as i32,
            prompt_sample,
            detail.to_string(),
            source_ip
        ],
    )?;
    Ok(())
}

/// Count events newer than `since` matching the intersection of every
/// identifier provided. Used by the repeat-offender rate limit.
pub fn count_events_since(
    conn: &Connection,
    since: &str,
    principal_id: Option<&str>,
    credential_id: Option<&str>,
    source_ip: Option<&str>,
) -> Result<u32> {
    let mut sql = String::from("SELECT COUNT(*) FROM security_events WHERE ts > ?1");
    let mut args: Vec<&dyn rusqlite::ToSql> = vec![&since];

    if let Some(ref p) = principal_id {
        sql.push_str(&format!(" AND principal_id = ?{}", args.len() + 1));
        args.push(p);
    }
    if let Some(ref c) = credential_id {
        sql.push_str(&format!(" AND credential_id = ?{}", args.len() + 1));
        args.push(c);
    }
    if let Some(ref ip) = source_ip {
        sql.push_str(&format!(" AND source_ip = ?{}", args.len() + 1));
        args.push(ip);
    }

    conn.query_row(&sql, args.as_slice(), |row| row.get(0))
}
