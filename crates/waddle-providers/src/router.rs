use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use rusqlite::Connection;
use tracing::{info, warn};
use waddle_core::types::{ProviderKind, RoutingStrategy};

use crate::health::HealthBoard;
use crate::provider::{ChatMessage, ChatOptions, ProviderError};
use crate::registry::{ProviderRegistry, RegisteredProvider};

/// Result of a routed upstream call, enriched with which link served it
/// so accounting can attribute the usage.
#[derive(Debug)]
pub struct RoutedResponse {
    pub text: String,
    pub finish_reason: String,
    pub raw_input_tokens: Option<u64>,
    pub raw_output_tokens: Option<u64>,
    pub provider_kind: ProviderKind,
    pub link_id: String,
    pub link_name: String,
    /// Model name the upstream reported.
    pub upstream_model: String,
    /// How many links were tried before one answered.
    pub attempts: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("no providers available for model {0}")]
    NoCandidates(String),

    #[error("all providers failed: {last_error}")]
    AllFailed { last_error: String },

    /// An error class that failover would not help (upstream auth,
    /// model-not-found). Surfaced as-is after the first attempt.
    #[error("upstream rejected the request: {0}")]
    NotRetriable(ProviderError),
}

/// Selects a provider link for each request and performs the upstream
/// call with automatic failover across the remaining candidates.
pub struct RequestRouter {
    registry: Arc<ProviderRegistry>,
    health: Arc<HealthBoard>,
    db: Arc<Mutex<Connection>>,
    default_strategy: RwLock<RoutingStrategy>,
    /// Per-model monotonic counters for round-robin selection.
    rr_counters: DashMap<String, u64>,
    /// Preferred link names per model, consulted by the failover strategy.
    preferred: DashMap<String, Vec<String>>,
}

impl RequestRouter {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        health: Arc<HealthBoard>,
        db: Arc<Mutex<Connection>>,
        default_strategy: RoutingStrategy,
    ) -> Self {
        Self {
            registry,
            health,
            db,
            default_strategy: RwLock::new(default_strategy),
            rr_counters: DashMap::new(),
            preferred: DashMap::new(),
        }
    }

    pub fn strategy(&self) -> RoutingStrategy {
        *self.default_strategy.read().unwrap()
    }

    pub fn set_strategy(&self, strategy: RoutingStrategy) {
        *self.default_strategy.write().unwrap() = strategy;
        info!(strategy = %strategy, "routing strategy changed");
    }

    pub fn set_preferred(&self, model: &str, link_names: Vec<String>) {
        self.preferred.insert(model.to_string(), link_names);
    }

    /// Route one request. `budget` is the remaining request deadline;
    /// every attempt shares it.
    pub async fn dispatch(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
        strategy_override: Option<RoutingStrategy>,
        budget: Duration,
    ) -> Result<RoutedResponse, RouterError> {
        // Snapshot once: a concurrent registry reload must not change
        // this request's candidate set halfway through failover.
        let snapshot = self.registry.snapshot();
        let mut candidates: Vec<Arc<RegisteredProvider>> = snapshot
            .candidates_for(model)
            .into_iter()
            .filter(|p| self.health.is_available(&p.link.id))
            .collect();
        // Deterministic base order doubles as the selection tie-break.
        candidates.sort_by(|a, b| a.link.id.cmp(&b.link.id));

        if candidates.is_empty() {
            return Err(RouterError::NoCandidates(model.to_string()));
        }

        let strategy = strategy_override.unwrap_or_else(|| self.strategy());
        let selected = self.select(model, &candidates, strategy);

        // Ordered plan: the selected link first, then the rest. Each link
        // appears exactly once; the router never retries a handle.
        let mut plan = vec![candidates[selected].clone()];
        plan.extend(
            candidates
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != selected)
                .map(|(_, p)| p.clone()),
        );

        let deadline = Instant::now() + budget;
        let mut last_error: Option<ProviderError> = None;
        let mut attempts = 0u32;

        for provider in plan {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                last_error = Some(ProviderError::Timeout);
                break;
            }

            attempts += 1;
            let link_id = provider.link.id.clone();
            // Pending marker goes up before dispatch; no board lock is
            // held across the call itself.
            self.health.begin_attempt(&link_id);
            let started = Instant::now();

            let result = tokio::time::timeout(
                remaining,
                provider.handle.chat(messages, model, options),
            )
            .await
            .unwrap_or(Err(ProviderError::Timeout));

            match result {
                Ok(outcome) => {
                    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                    self.health.record_success(&link_id, latency_ms);
                    info!(
                        model,
                        link = %provider.link.name,
                        attempts,
                        latency_ms = latency_ms as u64,
                        "routed request served"
                    );
                    return Ok(RoutedResponse {
                        text: outcome.text,
                        finish_reason: outcome.finish_reason,
                        raw_input_tokens: outcome.usage.input_tokens,
                        raw_output_tokens: outcome.usage.output_tokens,
                        provider_kind: provider.handle.kind(),
                        link_id,
                        link_name: provider.link.name.clone(),
                        upstream_model: outcome.model,
                        attempts,
                    });
                }
                Err(e) => {
                    warn!(model, link = %provider.link.name, err = %e, "provider attempt failed");
                    self.health.record_failure(&link_id);
                    if !e.is_retriable() {
                        return Err(RouterError::NotRetriable(e));
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(RouterError::AllFailed {
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no provider attempted".to_string()),
        })
    }

    /// Pick an index into `candidates` (already sorted by link id, so
    /// "first minimum wins" realises the lexicographic tie-break).
    fn select(
        &self,
        model: &str,
        candidates: &[Arc<RegisteredProvider>],
        strategy: RoutingStrategy,
    ) -> usize {
        match strategy {
            RoutingStrategy::RoundRobin => {
                let mut counter = self.rr_counters.entry(model.to_string()).or_insert(0);
                let index = (*counter % candidates.len() as u64) as usize;
                *counter += 1;
                index
            }
            RoutingStrategy::CostOptimized => {
                argmin_by_key(candidates, |p| self.model_cost(p.handle.kind(), model))
            }
            RoutingStrategy::LatencyOptimized => argmin_by_key(candidates, |p| {
                self.health.snapshot(&p.link.id).avg_latency_ms
            }),
            RoutingStrategy::LoadBalanced => argmin_by_key(candidates, |p| {
                self.health.snapshot(&p.link.id).load_score() as f64
            }),
            RoutingStrategy::Failover => {
                if let Some(preferred) = self.preferred.get(model) {
                    for name in preferred.iter() {
                        if let Some(i) =
                            candidates.iter().position(|p| &p.link.name == name)
                        {
                            return i;
                        }
                    }
                }
                0
            }
            RoutingStrategy::Random => rand::thread_rng().gen_range(0..candidates.len()),
        }
    }

    /// Relative cost of serving `model` on a provider kind. Pairs with no
    /// configured rate sort last.
    fn model_cost(&self, kind: ProviderKind, model: &str) -> f64 {
        let conn = self.db.lock().unwrap();
        match waddle_ledger::rates::lookup_rate(&conn, kind, model) {
            Ok(Some(rate)) => (rate.input_divisor + rate.output_divisor) * rate.base_cost,
            _ => f64::MAX,
        }
    }
}

fn argmin_by_key<T, F>(items: &[T], mut key: F) -> usize
where
    F: FnMut(&T) -> f64,
{
    let mut best = 0;
    let mut best_key = key(&items[0]);
    for (i, item) in items.iter().enumerate().skip(1) {
        let k = key(item);
        if k < best_key {
            best = i;
            best_key = k;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ProviderLink;
    use crate::provider::{ChatOutcome, HealthStatus, ModelDescriptor, ProviderHandle, RawUsage};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        kind: ProviderKind,
        state: Arc<ScriptedState>,
    }

    #[derive(Default)]
    struct ScriptedState {
        results: Mutex<VecDeque<Result<ChatOutcome, ProviderError>>>,
        calls: AtomicU32,
    }

    impl ScriptedState {
        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Scripted {
        fn ok(kind: ProviderKind) -> Self {
            Self {
                kind,
                state: Arc::new(ScriptedState::default()),
            }
        }

        fn scripted(kind: ProviderKind, results: Vec<Result<ChatOutcome, ProviderError>>) -> Self {
            Self {
                kind,
                state: Arc::new(ScriptedState {
                    results: Mutex::new(results.into()),
                    calls: AtomicU32::new(0),
                }),
            }
        }
    }

    fn outcome(text: &str) -> ChatOutcome {
        ChatOutcome {
            text: text.to_string(),
            usage: RawUsage {
                input_tokens: Some(1),
                output_tokens: Some(1),
            },
            finish_reason: "stop".to_string(),
            model: "m1-upstream".to_string(),
        }
    }

    #[async_trait]
    impl ProviderHandle for Scripted {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _model: &str,
            _options: &ChatOptions,
        ) -> Result<ChatOutcome, ProviderError> {
            self.state.calls.fetch_add(1, Ordering::SeqCst);
            self.state
                .results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(outcome("ok")))
        }

        async fn list_models(&self) -> Result<Vec<ModelDescriptor>, ProviderError> {
            Ok(Vec::new())
        }

        async fn health(&self) -> HealthStatus {
            HealthStatus {
                healthy: true,
                detail: "ok".to_string(),
            }
        }
    }

    fn link(id: &str, name: &str, models: &[&str]) -> ProviderLink {
        ProviderLink {
            id: id.to_string(),
            name: name.to_string(),
            kind: ProviderKind::OpenAi,
            endpoint_url: "http://test".to_string(),
            api_key: None,
            model_list: models.iter().map(|m| m.to_string()).collect(),
            timeout_secs: 30,
            enabled: true,
            created_at: String::new(),
        }
    }

    struct Harness {
        router: RequestRouter,
        states: Vec<Arc<ScriptedState>>,
    }

    fn harness(entries: Vec<(ProviderLink, Scripted)>) -> Harness {
        let conn = Connection::open_in_memory().unwrap();
        waddle_ledger::db::init_db(&conn).unwrap();
        let db = Arc::new(Mutex::new(conn));

        let registry = Arc::new(ProviderRegistry::new(db.clone()));
        let mut states = Vec::new();
        let providers: Vec<Arc<RegisteredProvider>> = entries
            .into_iter()
            .map(|(link, handle)| {
                states.push(handle.state.clone());
                Arc::new(RegisteredProvider {
                    link,
                    handle: Box::new(handle) as Box<dyn ProviderHandle>,
                })
            })
            .collect();
        registry.publish(providers);

        let router = RequestRouter::new(
            registry,
            Arc::new(HealthBoard::new()),
            db,
            RoutingStrategy::LoadBalanced,
        );
        Harness { router, states }
    }

    fn messages() -> Vec<ChatMessage> {
        vec![ChatMessage {
            role: crate::provider::MessageRole::User,
            content: "hello".to_string(),
        }]
    }

    async fn dispatch(harness: &Harness, model: &str) -> Result<RoutedResponse, RouterError> {
        harness
            .router
            .dispatch(
                model,
                &messages(),
                &ChatOptions::default(),
                None,
                Duration::from_secs(5),
            )
            .await
    }

    #[tokio::test]
    async fn failover_moves_to_the_next_candidate() {
        let h = harness(vec![
            (
                link("a", "link-a", &["m1"]),
                Scripted::scripted(
                    ProviderKind::OpenAi,
                    vec![Err(ProviderError::Unavailable("connection refused".into()))],
                ),
            ),
            (link("b", "link-b", &["m1"]), Scripted::ok(ProviderKind::Anthropic)),
        ]);

        let resp = dispatch(&h, "m1").await.unwrap();
        assert_eq!(resp.link_id, "b");
        assert_eq!(resp.provider_kind, ProviderKind::Anthropic);
        assert_eq!(resp.attempts, 2);

        // Health reflects the failed and successful attempts.
        let a = h.router.health.snapshot("a");
        assert_eq!(a.consecutive_failures, 1);
        assert!(a.last_failure.is_some());
        let b = h.router.health.snapshot("b");
        assert!(b.last_success.is_some());
    }

    #[tokio::test]
    async fn all_candidates_failing_surfaces_all_failed() {
        let h = harness(vec![
            (
                link("a", "link-a", &["m1"]),
                Scripted::scripted(
                    ProviderKind::OpenAi,
                    vec![Err(ProviderError::Unavailable("down".into()))],
                ),
            ),
            (
                link("b", "link-b", &["m1"]),
                Scripted::scripted(
                    ProviderKind::OpenAi,
                    vec![Err(ProviderError::Api { status: 500, message: "boom".into() })],
                ),
            ),
        ]);

        let err = dispatch(&h, "m1").await.unwrap_err();
        assert!(matches!(err, RouterError::AllFailed { .. }));
        assert_eq!(h.router.health.snapshot("a").failed_requests, 1);
        assert_eq!(h.router.health.snapshot("b").failed_requests, 1);
        // Each handle tried exactly once, no same-link retries.
        assert_eq!(h.states[0].calls(), 1);
        assert_eq!(h.states[1].calls(), 1);
    }

    #[tokio::test]
    async fn unknown_model_has_no_candidates() {
        let h = harness(vec![(link("a", "link-a", &["m1"]), Scripted::ok(ProviderKind::OpenAi))]);
        let err = dispatch(&h, "m2").await.unwrap_err();
        assert!(matches!(err, RouterError::NoCandidates(m) if m == "m2"));
    }

    #[tokio::test]
    async fn upstream_auth_errors_do_not_fail_over() {
        let h = harness(vec![
            (
                link("a", "link-a", &["m1"]),
                Scripted::scripted(
                    ProviderKind::OpenAi,
                    vec![Err(ProviderError::Api { status: 401, message: "bad key".into() })],
                ),
            ),
            (link("b", "link-b", &["m1"]), Scripted::ok(ProviderKind::OpenAi)),
        ]);

        let err = dispatch(&h, "m1").await.unwrap_err();
        assert!(matches!(err, RouterError::NotRetriable(_)));
        assert_eq!(h.states[1].calls(), 0);
    }

    #[tokio::test]
    async fn round_robin_rotates_per_model() {
        let h = harness(vec![
            (link("a", "link-a", &["m1"]), Scripted::ok(ProviderKind::OpenAi)),
            (link("b", "link-b", &["m1"]), Scripted::ok(ProviderKind::OpenAi)),
        ]);
        h.router.set_strategy(RoutingStrategy::RoundRobin);

        let first = dispatch(&h, "m1").await.unwrap();
        let second = dispatch(&h, "m1").await.unwrap();
        let third = dispatch(&h, "m1").await.unwrap();
        assert_eq!(first.link_id, "a");
        assert_eq!(second.link_id, "b");
        assert_eq!(third.link_id, "a");
    }

    #[tokio::test]
    async fn load_balanced_avoids_failing_links() {
        let h = harness(vec![
            (link("a", "link-a", &["m1"]), Scripted::ok(ProviderKind::OpenAi)),
            (link("b", "link-b", &["m1"]), Scripted::ok(ProviderKind::OpenAi)),
        ]);
        // One failure on link-a adds 10 to its load score.
        h.router.health.begin_attempt("a");
        h.router.health.record_failure("a");

        let resp = dispatch(&h, "m1").await.unwrap();
        assert_eq!(resp.link_id, "b");
    }

    #[tokio::test]
    async fn ejected_links_leave_the_candidate_set() {
        let h = harness(vec![
            (link("a", "link-a", &["m1"]), Scripted::ok(ProviderKind::OpenAi)),
            (link("b", "link-b", &["m1"]), Scripted::ok(ProviderKind::OpenAi)),
        ]);
        for _ in 0..3 {
            h.router.health.begin_attempt("a");
            h.router.health.record_failure("a");
        }

        let resp = dispatch(&h, "m1").await.unwrap();
        assert_eq!(resp.link_id, "b");
        assert_eq!(h.states[0].calls(), 0);
    }

    #[tokio::test]
    async fn cost_optimized_prefers_the_cheaper_rate() {
        let h = harness(vec![
            (link("a", "link-a", &["m1"]), Scripted::ok(ProviderKind::OpenAi)),
            (
                link("b", "link-b", &["m1"]),
                Scripted::ok(ProviderKind::Anthropic),
            ),
        ]);
        {
            let conn = h.router.db.lock().unwrap();
            conn.execute_batch(
                "INSERT INTO conversion_rates (kind, model, input_divisor, output_divisor, base_cost, effective_date, enabled)
                 VALUES ('openai', 'm1', 10, 10, 0.01, '2024-01-01T00:00:00Z', 1),
                        ('anthropic', 'm1', 5, 5, 0.001, '2024-01-01T00:00:00Z', 1);",
            )
            .unwrap();
        }
        h.router.set_strategy(RoutingStrategy::CostOptimized);

        let resp = dispatch(&h, "m1").await.unwrap();
        assert_eq!(resp.link_id, "b");
    }

    #[tokio::test]
    async fn failover_strategy_honors_preferences() {
        let h = harness(vec![
            (link("a", "link-a", &["m1"]), Scripted::ok(ProviderKind::OpenAi)),
            (link("b", "link-b", &["m1"]), Scripted::ok(ProviderKind::OpenAi)),
        ]);
        h.router.set_strategy(RoutingStrategy::Failover);
        h.router.set_preferred("m1", vec!["link-b".to_string()]);

        let resp = dispatch(&h, "m1").await.unwrap();
        assert_eq!(resp.link_id, "b");
    }

    #[tokio::test]
    async fn latency_ties_break_lexicographically() {
        let h = harness(vec![
            (link("b", "link-b", &["m1"]), Scripted::ok(ProviderKind::OpenAi)),
            (link("a", "link-a", &["m1"]), Scripted::ok(ProviderKind::OpenAi)),
        ]);
        h.router.set_strategy(RoutingStrategy::LatencyOptimized);

        // No latency data on either link: scores tie, lowest id wins.
        let resp = dispatch(&h, "m1").await.unwrap();
        assert_eq!(resp.link_id, "a");
    }
}
