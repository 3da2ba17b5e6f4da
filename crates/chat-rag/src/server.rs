//! Server startup
//!
//! Opens the database and vector index, verifies the index against the
//! configured embedding dimension, wires the components into [`AppState`]
//! and serves the HTTP API. The only network calls leave through the
//! embedding and chat-completion client.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use anyhow::Context;
use tracing::{error, info, warn};

use crate::{
    config::{Config, VectorBackend},
    llm::LlmClient,
    memory_db::ChatDatabase,
    shared_state::AppState,
    vector_index::{ensure_index, InMemoryVectorIndex, SqliteVectorIndex, VectorIndex},
};

/// Open (or create) the SQLite database at the configured path.
pub fn open_database(cfg: &Config) -> anyhow::Result<Arc<ChatDatabase>> {
    let db_path = Path::new(&cfg.database_path);
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
    }
    let db = ChatDatabase::new(db_path)?;
    info!("Chat database initialized at: {}", db_path.display());
    Ok(Arc::new(db))
}

/// Select the vector store and make sure it is usable.
///
/// A dimension mismatch with an existing index is fatal.
pub async fn open_index(cfg: &Config, db: &ChatDatabase) -> anyhow::Result<Arc<dyn VectorIndex>> {
    let index: Arc<dyn VectorIndex> = match cfg.vector_backend {
        VectorBackend::Sqlite => Arc::new(SqliteVectorIndex::new(db.pool())?),
        VectorBackend::Memory => {
            warn!("Using the in-memory vector index; vectors are lost on restart");
            Arc::new(InMemoryVectorIndex::new())
        }
    };

    let description = ensure_index(index.as_ref(), cfg.embedding_dimension, cfg.index_poll_interval())
        .await
        .context("Vector index is not usable with the configured embedding model")?;
    info!(
        "Vector index ready: {} vectors of dimension {:?}",
        description.count, description.dimension
    );
    Ok(index)
}

/// Everything a server or a one-off job needs.
pub async fn build_state(cfg: Config) -> anyhow::Result<AppState> {
    let db = open_database(&cfg)?;
    let index = open_index(&cfg, &db).await?;
    let client = Arc::new(LlmClient::from_config(&cfg)?);

    Ok(AppState::new(cfg, db, index, client.clone(), client))
}

pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    crate::metrics::init_metrics();
    cfg.print_config();

    let addr = cfg.api_addr()?;
    let state = build_state(cfg).await?;

    // Finish dual writes interrupted by a previous shutdown.
    let backfill = state.backfill.clone();
    tokio::spawn(async move {
        match backfill.reconcile_pending().await {
            Ok(stats) if stats.total > 0 => info!("Reconciled pending embeddings: {:?}", stats),
            Ok(_) => {}
            Err(e) => error!("Pending embedding reconciliation failed: {:#}", e),
        }
    });

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = build_router(state);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Public routes plus `/metrics` and `/healthz`.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::{
        middleware,
        routing::{delete, get, post},
        Router,
    };
    use tower_http::{
        cors::{Any, CorsLayer},
        timeout::TimeoutLayer,
        trace::TraceLayer,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST, axum::http::Method::DELETE])
        .allow_headers(Any);

    // Leave room past the answer timeout for the gate to report it.
    let http_timeout = state.config.safety_config().request_timeout + Duration::from_secs(15);

    let ai = Router::new()
        .route("/ai/chat", post(crate::api::chat))
        .route("/ai/search", post(crate::api::search))
        .route("/ai/index/messages", post(crate::api::index_message))
        .route("/ai/index/messages/:id", delete(crate::api::delete_message))
        .route("/ai/index/backfill", post(crate::api::start_backfill))
        .route("/ai/index/status", get(crate::api::index_status))
        .layer(middleware::from_fn_with_state(state.clone(), crate::api::rate_limit_headers));

    Router::new()
        .merge(ai)
        .route("/metrics", get(crate::metrics::get_metrics))
        .route("/healthz", get(|| async { "OK" }))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(http_timeout))
        .with_state(state)
}
