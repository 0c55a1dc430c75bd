use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};
use waddle_core::types::{QuotaDetail, QuotaPeriodDetail};

use crate::error::{LedgerError, Result};
use crate::estimate::estimate_tokens;
use crate::rates::{default_normalize, lookup_rate, DEFAULT_BASE_COST};
use crate::types::{AccountedUsage, UsageParams};

/// The dual-denomination token accountant: estimates raw usage, converts
/// it to normalized tokens, enforces quotas, and keeps the append-only
/// ledger in sync with the admission cache.
pub struct TokenAccountant {
    db: Arc<Mutex<Connection>>,
}

impl TokenAccountant {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    /// Pre-call admission check.
    ///
    /// Resolves effective limits (credential override else tenant quota),
    /// reads current usage from the quota cache, and reports whether
    /// current usage plus the input estimate stays inside both the daily
    /// and monthly limit. Output tokens are accounted post-hoc, so only
    /// the input estimate participates here.
    pub fn check_admission(&self, credential_id: &str, input_estimate: u64) -> Result<QuotaDetail> {
        let conn = self.db.lock().unwrap();

        let (daily_override, monthly_override, tenant_id): (Option<u64>, Option<u64>, String) =
            conn.query_row(
                "SELECT quota_daily_override, quota_monthly_override, tenant_id
                 FROM credentials WHERE id = ?1",
                params![credential_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
            .ok_or_else(|| LedgerError::UnknownCredential(credential_id.to_string()))?;

        let (tenant_daily, tenant_monthly): (u64, u64) = conn
            .query_row(
                "SELECT token_quota_daily, token_quota_monthly FROM tenants WHERE id = ?1",
                params![tenant_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| LedgerError::UnknownTenant(tenant_id.clone()))?;

        let daily_limit = daily_override.unwrap_or(tenant_daily);
        let monthly_limit = monthly_override.unwrap_or(tenant_monthly);

        let daily_used = cached_usage(&conn, credential_id, "daily", &today())?;
        let monthly_used = cached_usage(&conn, credential_id, "monthly", &month_start())?;

        let detail = QuotaDetail {
            daily: period_detail(daily_used, daily_limit, input_estimate),
            monthly: period_detail(monthly_used, monthly_limit, input_estimate),
        };
        debug!(
            credential = credential_id,
            daily_used,
            daily_limit,
            monthly_used,
            monthly_limit,
            input_estimate,
            admitted = detail.ok(),
            "admission check"
        );
        Ok(detail)
    }

    /// Post-call accounting: one ledger append plus the daily and monthly
    /// cache increments, all inside a single transaction so the cache can
    /// never drift from the ledger.
    ///
    /// Raw counts reported by the upstream are authoritative; the local
    /// estimator only fills in when the backend stayed silent.
    pub fn record_usage(&self, usage: &UsageParams<'_>) -> Result<AccountedUsage> {
        let raw_in = usage
            .raw_input_tokens
            .unwrap_or_else(|| estimate_tokens(usage.input_text));
        let raw_out = usage
            .raw_output_tokens
            .unwrap_or_else(|| estimate_tokens(usage.output_text));

        let mut conn = self.db.lock().unwrap();

        let (normalized, base_cost) = match lookup_rate(&conn, usage.kind, usage.model)? {
            Some(rate) => (rate.normalize(raw_in, raw_out), rate.base_cost),
            None => {
                warn!(
                    kind = %usage.kind,
                    model = usage.model,
                    "no conversion rate configured, using default formula"
                );
                (default_normalize(raw_in, raw_out), DEFAULT_BASE_COST)
            }
        };
        let cost_estimate = normalized as f64 * base_cost;

        let now = Utc::now().to_rfc3339();
        let day = today();
        let month = month_start();
        let model_key = format!("{}_{}", usage.kind, usage.model.replace('-', "_"));
        let breakdown = serde_json::json!({
            model_key: { "input": raw_in, "output": raw_out }
        })
        .to_string();

        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO usage_records (credential_id, principal_id, tenant_id, day,
                 normalized_tokens, raw_input_tokens, raw_output_tokens, model_breakdown,
                 request_count, provider_kind, model, link_id, success, base_cost_estimate,
                 created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                usage.credential_id,
                usage.principal_id,
                usage.tenant_id,
                day,
                normalized,
                raw_in,
                raw_out,
                breakdown,
                usage.kind.to_string(),
                usage.model,
                usage.link_id,
                usage.success as i32,
                cost_estimate,
                now
            ],
        )?;
        for (period, period_start) in [("daily", day.as_str()), ("monthly", month.as_str())] {
            tx.execute(
                "INSERT INTO quota_cache (credential_id, tenant_id, period, period_start,
                     normalized_tokens, requests, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)
                 ON CONFLICT (credential_id, period, period_start) DO UPDATE SET
                     normalized_tokens = normalized_tokens + excluded.normalized_tokens,
                     requests = requests + 1,
                     last_updated = excluded.last_updated",
                params![
                    usage.credential_id,
                    usage.tenant_id,
                    period,
                    period_start,
                    normalized,
                    now
                ],
            )?;
        }
        tx.commit()?;

        Ok(AccountedUsage {
            normalized_tokens: normalized,
            raw_input_tokens: raw_in,
            raw_output_tokens: raw_out,
            cost_estimate,
        })
    }
}

fn period_detail(used: u64, limit: u64, estimate: u64) -> QuotaPeriodDetail {
    QuotaPeriodDetail {
        used,
        limit,
        remaining: limit.saturating_sub(used),
        ok: used + estimate <= limit,
    }
}

fn cached_usage(
    conn: &Connection,
    credential_id: &str,
    period: &str,
    period_start: &str,
) -> Result<u64> {
    let used: Option<u64> = conn
        .query_row(
            "SELECT normalized_tokens FROM quota_cache
             WHERE credential_id = ?1 AND period = ?2 AND period_start = ?3",
            params![credential_id, period, period_start],
            |row| row.get(0),
        )
        .optional()?;
    Ok(used.unwrap_or(0))
}

/// UTC calendar day bucket.
fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

/// First day of the current UTC month.
fn month_start() -> String {
    Utc::now().format("%Y-%m-01").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_db, seed_default_rates};
    use waddle_core::types::{ProviderKind, Role};
    use waddle_identity::store::{create_principal, create_tenant, issue_credential};

    struct Fixture {
        accountant: TokenAccountant,
        db: Arc<Mutex<Connection>>,
        credential_id: String,
        principal_id: String,
        tenant_id: String,
    }

    fn fixture(daily: u64, monthly: u64, overrides: (Option<u64>, Option<u64>)) -> Fixture {
        let conn = Connection::open_in_memory().unwrap();
        waddle_identity::db::init_db(&conn).unwrap();
        init_db(&conn).unwrap();

        let tenant = create_tenant(&conn, "acme", daily, monthly).unwrap();
        let principal = create_principal(&conn, &tenant.id, "alice", Role::User, None).unwrap();
        let issued =
            issue_credential(&conn, &principal, "key", overrides.0, overrides.1, None).unwrap();

        // m1 converts at 10 raw tokens per normalized token on both sides.
        conn.execute(
            "INSERT INTO conversion_rates (kind, model, input_divisor, output_divisor, base_cost, effective_date, enabled)
             VALUES ('openai', 'm1', 10, 10, 0.001, ?1, 1)",
            params![Utc::now().to_rfc3339()],
        )
        .unwrap();

        let db = Arc::new(Mutex::new(conn));
        Fixture {
            accountant: TokenAccountant::new(db.clone()),
            db,
            credential_id: issued.credential.id,
            principal_id: principal.id,
            tenant_id: tenant.id,
        }
    }

    fn usage<'a>(f: &'a Fixture, raw_in: Option<u64>, raw_out: Option<u64>) -> UsageParams<'a> {
        UsageParams {
            credential_id: &f.credential_id,
            principal_id: &f.principal_id,
            tenant_id: &f.tenant_id,
            kind: ProviderKind::OpenAi,
            model: "m1",
            link_id: Some("link-a"),
            raw_input_tokens: raw_in,
            raw_output_tokens: raw_out,
            input_text: "hello",
            output_text: "hi",
            success: true,
        }
    }

    #[test]
    fn happy_path_accounts_two_normalized_tokens() {
        let f = fixture(10_000, 100_000, (None, None));
        let accounted = f.accountant.record_usage(&usage(&f, Some(1), Some(1))).unwrap();
        assert_eq!(accounted.normalized_tokens, 2);
        assert_eq!(accounted.raw_input_tokens, 1);
        assert_eq!(accounted.raw_output_tokens, 1);

        let conn = f.db.lock().unwrap();
        let (ledger_normalized, day): (u64, String) = conn
            .query_row(
                "SELECT normalized_tokens, day FROM usage_records WHERE credential_id = ?1",
                params![f.credential_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(ledger_normalized, 2);

        let cached: u64 = conn
            .query_row(
                "SELECT normalized_tokens FROM quota_cache
                 WHERE credential_id = ?1 AND period = 'daily' AND period_start = ?2",
                params![f.credential_id, day],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(cached, 2);
    }

    #[test]
    fn cache_equals_ledger_sum_after_many_requests() {
        let f = fixture(10_000, 100_000, (None, None));
        for raw in [10u64, 25, 7, 99] {
            f.accountant.record_usage(&usage(&f, Some(raw), Some(raw))).unwrap();
        }
        let conn = f.db.lock().unwrap();
        let ledger_sum: u64 = conn
            .query_row(
                "SELECT SUM(normalized_tokens) FROM usage_records WHERE credential_id = ?1",
                params![f.credential_id],
                |row| row.get(0),
            )
            .unwrap();
        let cached: u64 = conn
            .query_row(
                "SELECT normalized_tokens FROM quota_cache
                 WHERE credential_id = ?1 AND period = 'daily'",
                params![f.credential_id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(cached, ledger_sum);

        let requests: u64 = conn
            .query_row(
                "SELECT requests FROM quota_cache
                 WHERE credential_id = ?1 AND period = 'monthly'",
                params![f.credential_id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(requests, 4);
    }

    #[test]
    fn admission_rejects_when_estimate_would_breach_daily_limit() {
        let f = fixture(100, 100_000, (None, None));
        // Pre-load the day bucket with 99 normalized tokens.
        {
            let conn = f.db.lock().unwrap();
            conn.execute(
                "INSERT INTO quota_cache (credential_id, tenant_id, period, period_start,
                     normalized_tokens, requests, last_updated)
                 VALUES (?1, ?2, 'daily', ?3, 99, 1, ?4)",
                params![f.credential_id, f.tenant_id, today(), Utc::now().to_rfc3339()],
            )
            .unwrap();
        }
        let detail = f.accountant.check_admission(&f.credential_id, 5).unwrap();
        assert!(!detail.ok());
        assert_eq!(detail.daily.used, 99);
        assert_eq!(detail.daily.limit, 100);
        assert_eq!(detail.daily.remaining, 1);
        assert!(detail.monthly.ok);

        // An estimate that still fits is admitted.
        let detail = f.accountant.check_admission(&f.credential_id, 1).unwrap();
        assert!(detail.ok());
    }

    #[test]
    fn credential_override_beats_tenant_quota() {
        let f = fixture(1_000_000, 10_000_000, (Some(10), None));
        let detail = f.accountant.check_admission(&f.credential_id, 11).unwrap();
        assert!(!detail.daily.ok);
        assert_eq!(detail.daily.limit, 10);
        assert_eq!(detail.monthly.limit, 10_000_000);
    }

    #[test]
    fn estimates_fill_in_when_upstream_reports_nothing() {
        let f = fixture(10_000, 100_000, (None, None));
        // "hello" -> 2 estimated tokens, "hi" -> 1.
        let accounted = f.accountant.record_usage(&usage(&f, None, None)).unwrap();
        assert_eq!(accounted.raw_input_tokens, 2);
        assert_eq!(accounted.raw_output_tokens, 1);

        // Authoritative counts win over text length.
        let accounted = f.accountant.record_usage(&usage(&f, Some(500), Some(300))).unwrap();
        assert_eq!(accounted.raw_input_tokens, 500);
        assert_eq!(accounted.raw_output_tokens, 300);
    }

    #[test]
    fn unknown_model_uses_default_conversion() {
        let f = fixture(10_000, 100_000, (None, None));
        let mut u = usage(&f, Some(100), Some(50));
        u.model = "unpriced-model";
        let accounted = f.accountant.record_usage(&u).unwrap();
        assert_eq!(accounted.normalized_tokens, 20); // (100 + 2*50) / 10
    }

    #[test]
    fn concurrent_accounting_never_loses_increments() {
        let f = fixture(1_000_000, 10_000_000, (None, None));
        let f = std::sync::Arc::new(f);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let f = f.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..10 {
                    f.accountant.record_usage(&usage(&f, Some(10), Some(10))).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let conn = f.db.lock().unwrap();
        let cached: u64 = conn
            .query_row(
                "SELECT normalized_tokens FROM quota_cache
                 WHERE credential_id = ?1 AND period = 'daily'",
                params![f.credential_id],
                |row| row.get(0),
            )
            .unwrap();
        // 80 requests x (1 + 1) normalized tokens each.
        assert_eq!(cached, 160);
    }

    #[test]
    fn seeded_rates_price_gpt4_steeper_on_output() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        seed_default_rates(&conn, &Utc::now().to_rfc3339()).unwrap();
        let rate = lookup_rate(&conn, ProviderKind::OpenAi, "gpt-4").unwrap().unwrap();
        assert_eq!(rate.normalize(100, 100), 10 + 5);
    }
}
