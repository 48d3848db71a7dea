//! WaBridge Messaging Core Server
//!
//! Boots the campaign engine: persistence, execution lock, rate limiter,
//! job queue, worker pool, scheduler tick and the webhook intake endpoint.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `WAB_API_PORT` | `8080` | Webhook intake / health port |
//! | `WAB_MONGO_URL` | `mongodb://localhost:27017` | MongoDB connection URL |
//! | `WAB_MONGO_DB` | `wabridge` | MongoDB database name |
//! | `WAB_REDIS_URL` | `redis://127.0.0.1:6379` | Redis URL (lock, limits, kill switch) |
//! | `WAB_QUEUE_DB_PATH` | `wab-queue.db` | SQLite job queue path |
//! | `WAB_STORE` | `mongo` | `mongo` or `memory` (dev mode) |
//! | `META_APP_SECRET` | - | App secret for webhook signatures |
//! | `WAB_VERIFY_TOKEN` | `change-me` | Webhook subscription verify token |
//! | `LOG_FORMAT` | `text` | `json` for production logs |
//! | `RUST_LOG` | `info` | Log level |

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tokio::{net::TcpListener, signal};
use tower_http::trace::TraceLayer;
use tracing::info;

use wab_automation::{AutomationEngine, LoggingCrmBridge};
use wab_common::logging::init_logging;
use wab_engine::{
    CampaignScheduler, CampaignService, EngineConfig, Platform, WorkerPool,
};
use wab_ingest::{intake_router, IngestState, TenantRouter, WebhookIngester};
use wab_limits::{RedisBackoffTracker, RedisKillSwitch, RedisRateLimiter};
use wab_lock::RedisExecutionLock;
use wab_provider::{CloudApiClient, CloudApiConfig};
use wab_queue::SqliteJobQueue;
use wab_store::Store;

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging("wab-server");

    let api_port: u16 = env_or("WAB_API_PORT", "8080")
        .parse()
        .context("WAB_API_PORT must be a port number")?;
    let redis_url = env_or("WAB_REDIS_URL", "redis://127.0.0.1:6379");

    // Persistence
    let store = match env_or("WAB_STORE", "mongo").as_str() {
        "memory" => {
            info!("Using in-memory store (development mode)");
            Store::memory()
        }
        _ => {
            let mongo_url = env_or("WAB_MONGO_URL", "mongodb://localhost:27017");
            let mongo_db = env_or("WAB_MONGO_DB", "wabridge");
            let client = mongodb::Client::with_uri_str(&mongo_url)
                .await
                .context("connecting to MongoDB")?;
            info!(db = %mongo_db, "Connected to MongoDB");
            Store::mongo(&client.database(&mongo_db))
        }
    };

    // Job queue
    let queue_path = env_or("WAB_QUEUE_DB_PATH", "wab-queue.db");
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(
            SqliteConnectOptions::new()
                .filename(&queue_path)
                .create_if_missing(true),
        )
        .await
        .context("opening job queue database")?;
    let queue = Arc::new(SqliteJobQueue::new(pool, 300, 3));
    queue.init_schema().await.context("initializing job queue")?;

    // Coordination & limits
    let lock = RedisExecutionLock::connect(&redis_url)
        .await
        .context("connecting execution lock to Redis")?;
    let limiter = RedisRateLimiter::connect(&redis_url)
        .await
        .context("connecting rate limiter to Redis")?;
    let backoff = RedisBackoffTracker::connect(&redis_url)
        .await
        .context("connecting backoff tracker to Redis")?;
    let kill_switch = RedisKillSwitch::connect(&redis_url)
        .await
        .context("connecting kill switch to Redis")?;

    // Provider client
    let provider = CloudApiClient::new(CloudApiConfig::default());

    let platform = Platform {
        store,
        lock: Arc::new(lock),
        limiter: Arc::new(limiter),
        backoff: Arc::new(backoff),
        kill_switch: Arc::new(kill_switch),
        provider: Arc::new(provider),
        queue: queue.clone(),
        config: Arc::new(EngineConfig::default()),
    };

    // Engine
    let service = Arc::new(CampaignService::new(platform.clone()));
    let worker_pool = Arc::new(WorkerPool::new(service.clone()));
    worker_pool.start().await;

    let scheduler = Arc::new(
        CampaignScheduler::new(platform.clone()).with_tick_interval(Duration::from_secs(60)),
    );
    scheduler.start().await;

    // Ingestion
    let tenant_router = Arc::new(TenantRouter::new(platform.clone()));
    let automation = Arc::new(AutomationEngine::new(
        platform.clone(),
        Arc::new(LoggingCrmBridge),
    ));
    let ingester = Arc::new(WebhookIngester::new(
        platform.clone(),
        tenant_router,
        service.clone(),
        automation,
    ));

    let app = intake_router(IngestState {
        ingester,
        verify_token: env_or("WAB_VERIFY_TOKEN", "change-me"),
        app_secret: std::env::var("META_APP_SECRET").ok(),
        queue: queue.clone(),
    })
    .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(("0.0.0.0", api_port))
        .await
        .context("binding intake port")?;
    info!(port = api_port, "Webhook intake listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving intake")?;

    info!("Shutting down");
    scheduler.shutdown();
    worker_pool.shutdown();
    queue.stop().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
