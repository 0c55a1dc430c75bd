use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use rusqlite::Connection;
use tokio::sync::Semaphore;
use waddle_core::config::{WaddleConfig, OVERLOAD_WAIT_MS};
use waddle_core::WaddleError;
use waddle_identity::AuthResolver;
use waddle_ledger::TokenAccountant;
use waddle_providers::{HealthBoard, ProviderRegistry, RequestRouter};
use waddle_security::SecurityScanner;

use crate::metrics::GatewayMetrics;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: WaddleConfig,
    pub db: Arc<Mutex<Connection>>,
    pub auth: AuthResolver,
    pub scanner: SecurityScanner,
    pub accountant: TokenAccountant,
    pub registry: Arc<ProviderRegistry>,
    pub router: RequestRouter,
    pub health: Arc<HealthBoard>,
    pub metrics: GatewayMetrics,
    /// Hard cap on concurrent upstream calls. Admission waits briefly for
    /// a permit, then fails fast with Overloaded.
    upstream_permits: Arc<Semaphore>,
}

impl AppState {
    pub fn new(config: WaddleConfig, conn: Connection) -> anyhow::Result<Self> {
        let db = Arc::new(Mutex::new(conn));

        let auth = AuthResolver::new(
            db.clone(),
            config.auth.signing_secret.clone(),
            config.auth.session_ttl_hours,
        );
        let scanner = SecurityScanner::new(db.clone(), &config.security.policy);
        let accountant = TokenAccountant::new(db.clone());
        let registry = Arc::new(ProviderRegistry::new(db.clone()));
        registry.reload()?;
        let health = Arc::new(HealthBoard::new());
        let router = RequestRouter::new(
            registry.clone(),
            health.clone(),
            db.clone(),
            config.routing.default_strategy,
        );
        let metrics = GatewayMetrics::new()?;
        let upstream_permits = Arc::new(Semaphore::new(config.routing.max_in_flight));

        Ok(Self {
            config,
            db,
            auth,
            scanner,
            accountant,
            registry,
            router,
            health,
            metrics,
            upstream_permits,
        })
    }

    /// Acquire one upstream slot, waiting a short bounded interval before
    /// declaring the server overloaded. The slot releases on drop.
    pub async fn acquire_upstream_slot(&self) -> Result<UpstreamSlot, WaddleError> {
        let permits = self.upstream_permits.clone();
        let permit = match permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => tokio::time::timeout(
                Duration::from_millis(OVERLOAD_WAIT_MS),
                permits.acquire_owned(),
            )
            .await
            .map_err(|_| WaddleError::Overloaded)?
            .map_err(|_| WaddleError::Overloaded)?,
        };
        self.metrics.upstream_in_flight.inc();
        Ok(UpstreamSlot {
            _permit: permit,
            gauge: self.metrics.upstream_in_flight.clone(),
        })
    }

    pub fn upstream_budget(&self) -> Duration {
        Duration::from_secs(self.config.routing.upstream_timeout_secs)
    }
}

/// RAII guard for one concurrent upstream call.
pub struct UpstreamSlot {
    _permit: tokio::sync::OwnedSemaphorePermit,
    gauge: prometheus::Gauge,
}

impl Drop for UpstreamSlot {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

/// Create every subsystem's tables and seed the stock conversion rates.
/// Idempotent; runs on every startup and from the init-db subcommand.
pub fn init_database(conn: &Connection) -> rusqlite::Result<()> {
    waddle_identity::db::init_db(conn)?;
    waddle_security::db::init_db(conn)?;
    waddle_ledger::db::init_db(conn)?;
    waddle_providers::db::init_db(conn)?;
    waddle_ledger::db::seed_default_rates(conn, &chrono::Utc::now().to_rfc3339())?;
    Ok(())
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(crate::http::health::healthz_handler))
        .route("/metrics", get(crate::http::health::metrics_handler))
        .route("/auth/login", post(crate::http::login::login_handler))
        .route(
            "/v1/chat/completions",
            post(crate::http::chat::chat_completions),
        )
        .route("/v1/models", get(crate::http::models::list_models))
        .route("/api/quota", get(crate::http::admin::quota_handler))
        .route(
            "/api/routing/stats",
            get(crate::http::admin::routing_stats_handler),
        )
        .route(
            "/api/routing/strategy",
            post(crate::http::admin::set_strategy_handler),
        )
        .route(
            "/api/providers/reload",
            post(crate::http::admin::reload_providers_handler),
        )
        .route(
            "/api/providers/{link_id}/pull",
            post(crate::http::admin::pull_model_handler),
        )
        .route(
            "/api/providers/{link_id}/remove",
            post(crate::http::admin::remove_model_handler),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::http::track_metrics,
        ))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
