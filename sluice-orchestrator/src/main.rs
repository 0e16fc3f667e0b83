use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sluice_orchestrator::api;
use sluice_orchestrator::cluster::local::{CopyRunner, LocalCluster};
use sluice_orchestrator::config::Config;
use sluice_orchestrator::scheduler::Orchestrator;
use sluice_orchestrator::store::memory::MemoryBackend;
use sluice_orchestrator::store::postgres::{self, PostgresBackend};
use sluice_orchestrator::store::{Backend, Store};
use sluice_orchestrator::vfs::memory::MemVfs;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sluice_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Sluice Orchestrator...");

    let config = Config::from_env().expect("Failed to load configuration");

    // Pick the store backend
    let backend: Arc<dyn Backend> = match config.database_url {
        Some(ref database_url) => {
            tracing::info!("Connecting to database...");

            let pool = postgres::create_pool(database_url)
                .await
                .expect("Failed to create database pool");

            tracing::info!("Database connection pool created");

            postgres::run_migrations(&pool)
                .await
                .expect("Failed to run database migrations");

            Arc::new(PostgresBackend::new(pool))
        }
        None => {
            tracing::info!("No DATABASE_URL set, using the in-memory store");
            Arc::new(MemoryBackend::new())
        }
    };
    let store = Store::new(backend);

    // Local mode: filesystem and workers live inside this process.
    let vfs = Arc::new(MemVfs::new());
    let cluster = Arc::new(LocalCluster::new(
        vfs.clone(),
        Arc::new(CopyRunner),
        1,
        config.queue_capacity,
    ));

    let orch = Orchestrator::new(store, vfs, cluster, config.clone());

    // A single process owns every shard.
    for shard in 0..config.shard_count {
        orch.add_shard(shard).expect("Failed to claim shard");
    }

    // Build router with all API endpoints
    let app = api::create_router(orch);

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
