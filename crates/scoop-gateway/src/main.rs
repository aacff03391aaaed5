use std::net::SocketAddr;
use std::sync::Arc;

use rusqlite::Connection;
use tracing::{info, warn};

use scoop_core::config::ScoopConfig;
use scoop_engine::{ConversationEngine, GeminiClient};
use scoop_inference::HybridManager;
use scoop_memory::{db::init_db, MemoryStore, ProductCatalog};
use scoop_scheduler::TtlScheduler;

mod app;
mod http;
mod tools;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scoop_gateway=info,scoop_engine=info,tower_http=warn".into()),
        )
        .init();

    // load config: explicit SCOOP_CONFIG path > ~/.scoop/scoop.toml
    let config_path = std::env::var("SCOOP_CONFIG").ok();
    let config = ScoopConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("config load failed ({e}), using defaults");
        ScoopConfig::default()
    });

    // Separate connections per manager; same database file.
    let store_conn = Connection::open(&config.memory.db_path)?;
    init_db(&store_conn)?;
    let catalog_conn = Connection::open(&config.memory.db_path)?;

    let store = Arc::new(MemoryStore::new(store_conn, config.memory.clone()));
    let catalog = Arc::new(ProductCatalog::new(catalog_conn));
    let llm = Arc::new(GeminiClient::new(&config.llm, config.models.embedding.clone()));
    let hybrid = Arc::new(HybridManager::new(
        config.models.clone(),
        config.inference.clone(),
    ));
    let backend = Arc::new(tools::CatalogToolBackend::new(
        Arc::clone(&store),
        catalog,
        llm.clone(),
    ));

    let engine = Arc::new(ConversationEngine::new(
        llm,
        Arc::clone(&store),
        Arc::clone(&hybrid),
        backend,
        config.clone(),
    ));

    let scheduler = TtlScheduler::start(Arc::clone(&store));

    let bind = config.server.bind.clone();
    let port = config.server.port;
    let state = Arc::new(app::AppState {
        engine,
        hybrid,
        config,
    });
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("scoop gateway listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    scheduler.shutdown();
    Ok(())
}
