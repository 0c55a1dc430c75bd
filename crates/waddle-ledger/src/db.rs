use rusqlite::{params, Connection, Result};

/// Initialise the accounting tables. Idempotent.
pub fn init_db(conn: &Connection) -> Result<()> {
    create_conversion_rates_table(conn)?;
    create_usage_records_table(conn)?;
    create_quota_cache_table(conn)?;
    Ok(())
}

fn create_conversion_rates_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversion_rates (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            kind           TEXT NOT NULL,
            model          TEXT NOT NULL,
            input_divisor  REAL NOT NULL,
            output_divisor REAL NOT NULL,
            base_cost      REAL NOT NULL DEFAULT 0.001,
            effective_date TEXT NOT NULL,
            enabled        INTEGER NOT NULL DEFAULT 1
        );
        CREATE INDEX IF NOT EXISTS idx_conversion_rates_lookup
            ON conversion_rates (kind, model, enabled, effective_date);",
    )
}

fn create_usage_records_table(conn: &Connection) -> Result<()> {
    // Append-only ledger: one row per accepted request. The (credential,
    // day) index serves both invariant audits and daily reporting.
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS usage_records (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            credential_id      TEXT NOT NULL,
            principal_id       TEXT NOT NULL,
            tenant_id          TEXT NOT NULL,
            day                TEXT NOT NULL,
            normalized_tokens  INTEGER NOT NULL,
            raw_input_tokens   INTEGER NOT NULL,
            raw_output_tokens  INTEGER NOT NULL,
            model_breakdown    TEXT NOT NULL DEFAULT '{}',  -- JSON
            request_count      INTEGER NOT NULL DEFAULT 1,
            provider_kind      TEXT NOT NULL,
            model              TEXT NOT NULL,
            link_id            TEXT,
            success            INTEGER NOT NULL DEFAULT 1,
            base_cost_estimate REAL NOT NULL DEFAULT 0,
            created_at         TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_usage_records_credential_day
            ON usage_records (credential_id, day);",
    )
}

fn create_quota_cache_table(conn: &Connection) -> Result<()> {
    // Materialized view over usage_records for O(1) admission checks.
    // The UNIQUE constraint backs the upsert in the accounting path.
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS quota_cache (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            credential_id     TEXT NOT NULL,
            tenant_id         TEXT NOT NULL,
            period            TEXT NOT NULL,  -- 'daily' | 'monthly'
            period_start      TEXT NOT NULL,
            normalized_tokens INTEGER NOT NULL DEFAULT 0,
            requests          INTEGER NOT NULL DEFAULT 0,
            last_updated      TEXT NOT NULL,
            UNIQUE (credential_id, period, period_start)
        );",
    )
}

/// Seed the conversion-rate table with the stock rates. Each (kind,
/// model) pair is inserted only if absent so operator edits survive
/// restarts.
pub fn seed_default_rates(conn: &Connection, now: &str) -> Result<()> {
    const DEFAULTS: &[(&str, &str, f64, f64)] = &[
        ("openai", "gpt-4", 10.0, 20.0),
        ("openai", "gpt-3.5-turbo", 20.0, 30.0),
        ("anthropic", "claude-3-opus", 8.0, 15.0),
        ("anthropic", "claude-3-sonnet", 12.0, 18.0),
        ("ollama", "llama2", 50.0, 50.0),
        ("ollama", "mistral", 45.0, 45.0),
    ];
    for (kind, model, input, output) in DEFAULTS {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM conversion_rates WHERE kind=?1 AND model=?2)",
            params![kind, model],
            |row| row.get(0),
        )?;
        if !exists {
            conn.execute(
                "INSERT INTO conversion_rates
                     (kind, model, input_divisor, output_divisor, base_cost, effective_date, enabled)
                 VALUES (?1, ?2, ?3, ?4, 0.001, ?5, 1)",
                params![kind, model, input, output, now],
            )?;
        }
    }
    Ok(())
}
