use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use rusqlite::Connection;
use tracing::info;
use waddle_core::config::WaddleConfig;
use waddle_core::types::{ProviderKind, Role};

mod app;
mod http;
mod metrics;
mod pipeline;

#[derive(Parser)]
#[command(name = "waddle-gateway", about = "Multi-tenant LLM gateway")]
struct Cli {
    /// Path to waddle.toml. WADDLE_* env vars override file values.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway server (default).
    Serve,
    /// Create tables and seed default conversion rates.
    InitDb,
    /// Create a tenant.
    CreateTenant {
        name: String,
        #[arg(long, default_value_t = 100_000)]
        quota_daily: u64,
        #[arg(long, default_value_t = 1_000_000)]
        quota_monthly: u64,
    },
    /// Create a principal inside a tenant.
    CreatePrincipal {
        name: String,
        #[arg(long)]
        tenant: String,
        #[arg(long, default_value = "user")]
        role: String,
        #[arg(long)]
        password: Option<String>,
    },
    /// Issue an API credential for a principal. The plaintext is printed
    /// exactly once and never stored.
    IssueCredential {
        principal: String,
        #[arg(long, default_value = "default")]
        name: String,
        #[arg(long)]
        quota_daily: Option<u64>,
        #[arg(long)]
        quota_monthly: Option<u64>,
    },
    /// Register an upstream provider link.
    AddProvider {
        name: String,
        #[arg(long)]
        kind: String,
        #[arg(long)]
        endpoint: String,
        #[arg(long)]
        api_key: Option<String>,
        /// Comma-separated advertised models; empty accepts any.
        #[arg(long, default_value = "")]
        models: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "waddle_gateway=info,tower_http=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = WaddleConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::InitDb => {
            let conn = Connection::open(&config.database.path)?;
            app::init_database(&conn)?;
            println!("database initialised at {}", config.database.path);
            Ok(())
        }
        Command::CreateTenant {
            name,
            quota_daily,
            quota_monthly,
        } => {
            let conn = open_db(&config)?;
            let tenant =
                waddle_identity::store::create_tenant(&conn, &name, quota_daily, quota_monthly)?;
            println!("tenant {} created: {}", tenant.name, tenant.id);
            Ok(())
        }
        Command::CreatePrincipal {
            name,
            tenant,
            role,
            password,
        } => {
            let conn = open_db(&config)?;
            let tenant = waddle_identity::store::find_tenant_by_name(&conn, &tenant)?
                .ok_or_else(|| anyhow::anyhow!("no such tenant: {}", tenant))?;
            let role = Role::from_str(&role).map_err(|e| anyhow::anyhow!(e))?;
            let principal = waddle_identity::store::create_principal(
                &conn,
                &tenant.id,
                &name,
                role,
                password.as_deref(),
            )?;
            println!("principal {} created: {}", principal.name, principal.id);
            Ok(())
        }
        Command::IssueCredential {
            principal,
            name,
            quota_daily,
            quota_monthly,
        } => {
            let conn = open_db(&config)?;
            let principal = waddle_identity::store::find_principal_by_name(&conn, &principal)?
                .ok_or_else(|| anyhow::anyhow!("no such principal: {}", principal))?;
            let issued = waddle_identity::store::issue_credential(
                &conn,
                &principal,
                &name,
                quota_daily,
                quota_monthly,
                None,
            )?;
            println!("credential id: {}", issued.credential.id);
            println!("API key (save this, it will not be shown again):");
            println!("{}", issued.plaintext);
            Ok(())
        }
        Command::AddProvider {
            name,
            kind,
            endpoint,
            api_key,
            models,
        } => {
            let conn = open_db(&config)?;
            let kind = ProviderKind::from_str(&kind).map_err(|e| anyhow::anyhow!(e))?;
            let models: Vec<String> = models
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            let link = waddle_providers::db::insert_link(
                &conn,
                &name,
                kind,
                &endpoint,
                api_key.as_deref(),
                &models,
            )?;
            println!("provider link {} created: {}", link.name, link.id);
            Ok(())
        }
    }
}

fn open_db(config: &WaddleConfig) -> anyhow::Result<Connection> {
    let conn = Connection::open(&config.database.path)?;
    app::init_database(&conn)?;
    Ok(conn)
}

async fn serve(config: WaddleConfig) -> anyhow::Result<()> {
    if config.auth.has_placeholder_secret() {
        tracing::warn!(
            "serving with the placeholder signing secret; set WADDLE_AUTH_SIGNING_SECRET"
        );
    }
    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;

    let conn = Connection::open(&config.database.path)?;
    app::init_database(&conn)?;

    let state = Arc::new(app::AppState::new(config, conn)?);
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!(%addr, "WaddleAI gateway listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
