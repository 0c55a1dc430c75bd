//! Prometheus metrics for the gateway, exposed at GET /metrics.
//!
//! Each AppState owns its own registry rather than the process-global
//! one, so parallel test servers never collide on metric names.

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts,
    Registry, TextEncoder,
};

/// Request latency buckets (seconds). Upstream LLM calls dominate, so
/// the buckets stretch well past typical API latencies.
const LATENCY_BUCKETS: &[f64] = &[0.005, 0.025, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

pub struct GatewayMetrics {
    registry: Registry,

    /// labels: method, path, status
    pub http_requests_total: IntCounterVec,
    /// labels: method, path
    pub http_request_duration_seconds: HistogramVec,
    /// labels: provider, model, status
    pub llm_requests_total: IntCounterVec,
    /// labels: denomination (raw_input | raw_output | normalized)
    pub tokens_total: IntCounterVec,
    /// labels: threat, action
    pub security_events_total: IntCounterVec,
    /// labels: period (daily | monthly)
    pub quota_rejections_total: IntCounterVec,
    pub accounting_failures_total: IntCounter,
    pub upstream_in_flight: Gauge,
}

impl GatewayMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new("waddle_http_requests_total", "Total HTTP requests"),
            &["method", "path", "status"],
        )?;
        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "waddle_http_request_duration_seconds",
                "HTTP request duration in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["method", "path"],
        )?;
        let llm_requests_total = IntCounterVec::new(
            Opts::new("waddle_llm_requests_total", "Routed upstream LLM requests"),
            &["provider", "model", "status"],
        )?;
        let tokens_total = IntCounterVec::new(
            Opts::new("waddle_tokens_total", "Tokens accounted, by denomination"),
            &["denomination"],
        )?;
        let security_events_total = IntCounterVec::new(
            Opts::new("waddle_security_events_total", "Prompt security detections"),
            &["threat", "action"],
        )?;
        let quota_rejections_total = IntCounterVec::new(
            Opts::new("waddle_quota_rejections_total", "Requests rejected at admission"),
            &["period"],
        )?;
        let accounting_failures_total = IntCounter::new(
            "waddle_accounting_failures_total",
            "Post-response accounting failures (response already served)",
        )?;
        let upstream_in_flight = Gauge::new(
            "waddle_upstream_in_flight",
            "Concurrent upstream calls currently held",
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(llm_requests_total.clone()))?;
        registry.register(Box::new(tokens_total.clone()))?;
        registry.register(Box::new(security_events_total.clone()))?;
        registry.register(Box::new(quota_rejections_total.clone()))?;
        registry.register(Box::new(accounting_failures_total.clone()))?;
        registry.register(Box::new(upstream_in_flight.clone()))?;

        Ok(Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            llm_requests_total,
            tokens_total,
            security_events_total,
            quota_rejections_total,
            accounting_failures_total,
            upstream_in_flight,
        })
    }

    /// Render the text exposition format.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::warn!(err = %e, "metrics encoding failed");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_instances_do_not_collide() {
        let a = GatewayMetrics::new().unwrap();
        let b = GatewayMetrics::new().unwrap();
        a.http_requests_total
            .with_label_values(&["POST", "/v1/chat/completions", "200"])
            .inc();
        assert!(a.gather().contains("waddle_http_requests_total"));
        assert!(!b.gather().contains("POST"));
    }

    #[test]
    fn exposition_includes_token_counters() {
        let m = GatewayMetrics::new().unwrap();
        m.tokens_total.with_label_values(&["normalized"]).inc_by(42);
        let text = m.gather();
        assert!(text.contains("waddle_tokens_total"));
        assert!(text.contains("42"));
    }
}
