//! Conversion between raw upstream tokens and normalized tokens.
//!
//! Normalization is deterministic: identical (kind, model, raw_in,
//! raw_out) inputs always produce identical outputs, which is what makes
//! the ledger auditable after the fact.

use rusqlite::{params, Connection};
use waddle_core::types::ProviderKind;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct ConversionRate {
    pub kind: ProviderKind,
    pub model: String,
    /// Raw input tokens per normalized token.
    pub input_divisor: f64,
    /// Raw output tokens per normalized token.
    pub output_divisor: f64,
    /// Billing weight per normalized token.
    pub base_cost: f64,
}

impl ConversionRate {
    /// `ceil(raw_in / input_divisor) + ceil(raw_out / output_divisor)`,
    /// with each side contributing at least 1 when its raw count is
    /// positive and exactly 0 when it is zero.
    pub fn normalize(&self, raw_in: u64, raw_out: u64) -> u64 {
        ceil_div(raw_in, self.input_divisor) + ceil_div(raw_out, self.output_divisor)
    }
}

fn ceil_div(raw: u64, divisor: f64) -> u64 {
    if raw == 0 {
        return 0;
    }
    if divisor <= 0.0 {
        return raw.max(1);
    }
    let quotient = (raw as f64 / divisor).ceil() as u64;
    quotient.max(1)
}

/// Latest enabled rate for a (kind, model) pair, or None when no row
/// matches. Rates are effective-dated; newer rows shadow older ones.
pub fn lookup_rate(
    conn: &Connection,
    kind: ProviderKind,
    model: &str,
) -> Result<Option<ConversionRate>> {
    let mut stmt = conn.prepare(
        "SELECT input_divisor, output_divisor, base_cost
         FROM conversion_rates
         WHERE kind = ?1 AND model = ?2 AND enabled = 1
         ORDER BY effective_date DESC, id DESC
         LIMIT 1",
    )?;
    let result = stmt.query_row(params![kind.to_string(), model], |row| {
        Ok(ConversionRate {
            kind,
            model: model.to_string(),
            input_divisor: row.get(0)?,
            output_divisor: row.get(1)?,
            base_cost: row.get(2)?,
        })
    });
    match result {
        Ok(rate) => Ok(Some(rate)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Stock conversion when no rate row exists for the pair. Output tokens
/// are weighted double, matching how upstream pricing skews.
pub fn default_normalize(raw_in: u64, raw_out: u64) -> u64 {
    ((raw_in + raw_out * 2) / 10).max(1)
}

pub const DEFAULT_BASE_COST: f64 = 0.001;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_db, seed_default_rates};

    fn rate(input: f64, output: f64) -> ConversionRate {
        ConversionRate {
            kind: ProviderKind::OpenAi,
            model: "m1".into(),
            input_divisor: input,
            output_divisor: output,
            base_cost: 0.001,
        }
    }

    #[test]
    fn normalization_is_ceiling_division() {
        let r = rate(10.0, 20.0);
        assert_eq!(r.normalize(100, 200), 10 + 10);
        assert_eq!(r.normalize(101, 200), 11 + 10);
        assert_eq!(r.normalize(9, 19), 1 + 1);
    }

    #[test]
    fn each_positive_side_contributes_at_least_one() {
        let r = rate(10.0, 10.0);
        assert_eq!(r.normalize(1, 1), 2);
    }

    #[test]
    fn zero_raw_contributes_zero() {
        let r = rate(10.0, 10.0);
        assert_eq!(r.normalize(0, 50), 5);
        assert_eq!(r.normalize(50, 0), 5);
        assert_eq!(r.normalize(0, 0), 0);
    }

    #[test]
    fn normalization_is_deterministic() {
        let r = rate(7.0, 13.0);
        assert_eq!(r.normalize(123, 456), r.normalize(123, 456));
    }

    #[test]
    fn latest_enabled_rate_wins() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO conversion_rates (kind, model, input_divisor, output_divisor, base_cost, effective_date, enabled)
             VALUES ('openai', 'm1', 10, 10, 0.001, '2024-01-01T00:00:00Z', 1),
                    ('openai', 'm1', 5, 5, 0.002, '2024-06-01T00:00:00Z', 1),
                    ('openai', 'm1', 2, 2, 0.005, '2024-09-01T00:00:00Z', 0);",
        )
        .unwrap();
        let rate = lookup_rate(&conn, ProviderKind::OpenAi, "m1").unwrap().unwrap();
        assert_eq!(rate.input_divisor, 5.0);
        assert_eq!(rate.base_cost, 0.002);
    }

    #[test]
    fn seeded_defaults_cover_the_stock_models() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        seed_default_rates(&conn, "2024-01-01T00:00:00Z").unwrap();
        // Seeding twice must not duplicate rows.
        seed_default_rates(&conn, "2024-01-02T00:00:00Z").unwrap();

        let rate = lookup_rate(&conn, ProviderKind::OpenAi, "gpt-4").unwrap().unwrap();
        assert_eq!(rate.input_divisor, 10.0);
        assert_eq!(rate.output_divisor, 20.0);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM conversion_rates", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 6);
    }

    #[test]
    fn unknown_pair_falls_back_to_default_formula() {
        assert_eq!(default_normalize(100, 50), 20);
        assert_eq!(default_normalize(0, 0), 1);
    }
}
