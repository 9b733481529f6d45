//! Process entry point.
//!
//! Wires the engines to one SQLite database, mounts the HTTP API, and runs
//! the background loops: rollback monitor ticks, nightly generation, pending
//! expiry, cache purges, and rate-limiter cleanup.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use adpilot_backend::adapter::{AdsApiAdapter, LiveAdsAdapter, ScriptedAdapter};
use adpilot_backend::api::{self, AppState};
use adpilot_backend::approval::ApprovalStore;
use adpilot_backend::cache::ExpiringCache;
use adpilot_backend::config::AppConfig;
use adpilot_backend::db;
use adpilot_backend::execution::ExecutionEngine;
use adpilot_backend::ledger::ChangeLedger;
use adpilot_backend::middleware::SlidingWindowLimiter;
use adpilot_backend::recommend::RecommendationEngine;
use adpilot_backend::rollback::{self, RollbackMonitor};
use adpilot_backend::rules::RuleRegistry;
use adpilot_backend::warehouse::SqliteWarehouse;

#[derive(Debug, Parser)]
#[command(name = "adpilot", about = "Ads account autopilot backend")]
struct Args {
    /// SQLite database path (overrides DATABASE_PATH).
    #[arg(long)]
    database_path: Option<String>,

    /// Listen port (overrides PORT).
    #[arg(long)]
    port: Option<u16>,

    /// Customer account under management (overrides CUSTOMER_ID).
    #[arg(long)]
    customer_id: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::from_env().context("configuration rejected")?;
    if let Some(database_path) = args.database_path {
        config.database_path = database_path;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(customer_id) = args.customer_id {
        config.customer_id = customer_id;
    }
    config.validate().context("configuration rejected")?;

    init_tracing(&config)?;
    info!(customer_id = config.customer_id, port = config.port, "starting autopilot backend");

    let conn = db::open(&config.database_path)?;
    let warehouse = Arc::new(SqliteWarehouse::new(conn.clone()));
    let approval = Arc::new(ApprovalStore::new(conn.clone()));
    let ledger = Arc::new(ChangeLedger::new(conn));
    let registry = Arc::new(RuleRegistry::builtin());
    let cache = Arc::new(ExpiringCache::new(
        Duration::from_secs(config.cache.ttl_seconds),
        config.cache.max_entries,
    ));

    let adapter: Arc<dyn AdsApiAdapter> = match std::env::var("ADS_API_ENDPOINT") {
        Ok(endpoint) => {
            info!(endpoint, "live ads adapter enabled");
            Arc::new(LiveAdsAdapter::new(
                endpoint,
                Duration::from_millis(config.execution.attempt_timeout_ms),
            )?)
        }
        Err(_) => {
            warn!("ADS_API_ENDPOINT unset; scripted adapter acknowledges everything locally");
            Arc::new(ScriptedAdapter::new())
        }
    };

    let execution = Arc::new(ExecutionEngine::new(
        approval.clone(),
        ledger.clone(),
        warehouse.clone(),
        adapter,
        registry.clone(),
        cache.clone(),
        config.clone(),
    ));
    let recommend = Arc::new(RecommendationEngine::new(
        warehouse.clone(),
        registry.clone(),
        approval.clone(),
        cache.clone(),
    ));
    let monitor = Arc::new(RollbackMonitor::new(
        ledger.clone(),
        warehouse,
        execution.clone(),
        registry,
        config.rollback.clone(),
    ));

    let execute_limiter = SlidingWindowLimiter::per_minute(config.rate_limits.execute_per_min);
    let batch_limiter = SlidingWindowLimiter::per_minute(config.rate_limits.batch_per_min);

    spawn_background_tasks(
        &config,
        monitor,
        recommend.clone(),
        approval.clone(),
        cache.clone(),
        execute_limiter.clone(),
        batch_limiter.clone(),
    );

    let state = AppState {
        config: Arc::new(config.clone()),
        approval,
        ledger,
        execution,
        recommend,
        cache,
        execute_limiter,
        batch_limiter,
    };
    let app = api::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server exited")?;
    Ok(())
}

fn init_tracing(config: &AppConfig) -> Result<()> {
    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("failed to create log dir {}", config.log_dir))?;

    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("adpilot")
        .filename_suffix("log")
        .max_log_files(10)
        .build(&config.log_dir)
        .context("failed to build log appender")?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(file_appender),
        )
        .init();
    Ok(())
}

fn spawn_background_tasks(
    config: &AppConfig,
    monitor: Arc<RollbackMonitor>,
    recommend: Arc<RecommendationEngine>,
    approval: Arc<ApprovalStore>,
    cache: Arc<ExpiringCache>,
    execute_limiter: SlidingWindowLimiter,
    batch_limiter: SlidingWindowLimiter,
) {
    // Rollback monitor tick loop.
    tokio::spawn(rollback::run(monitor));

    // Nightly generation for the latest complete snapshot day.
    let customer_id = config.customer_id;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(24 * 3600));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately, which doubles as a startup run.
        loop {
            interval.tick().await;
            let snapshot_date = (chrono::Utc::now() - chrono::Duration::days(1)).date_naive();
            match recommend.generate(customer_id, snapshot_date, None, chrono::Utc::now()) {
                Ok(summary) => info!(
                    proposals = summary.proposals,
                    entities = summary.entities_scanned,
                    %snapshot_date,
                    "nightly generation finished"
                ),
                Err(err) => warn!(error = %err, "nightly generation failed"),
            }
        }
    });

    // Pending-recommendation expiry sweep.
    let pending_ttl = chrono::Duration::hours(i64::from(config.pending_ttl_hours));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            interval.tick().await;
            if let Err(err) = approval.expire_overdue(chrono::Utc::now(), pending_ttl) {
                warn!(error = %err, "pending expiry sweep failed");
            }
        }
    });

    // Cache purge and rate-limiter cleanup.
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            cache.purge_expired();
            execute_limiter.cleanup();
            batch_limiter.cleanup();
        }
    });
}
