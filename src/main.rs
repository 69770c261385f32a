//! faro-server 入口
//!
//! 启动: cargo run --bin faro-server
//! 无 DATABASE_URL 时以 demo 后端运行（固定数据，管线完整可用）。

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;

use faro::config::load_config;
use faro::executor::{DemoBackend, PgBackend, QueryBackend};
use faro::llm::create_llm_from_config;
use faro::memory::{ChatStore, InMemoryChatStore, PgChatStore};
use faro::server::{build_router, build_state};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    faro::observability::init();

    let cfg = load_config(None)?;

    let database_url = cfg
        .database
        .url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let (backend, pool): (Arc<dyn QueryBackend>, Option<sqlx::PgPool>) = match database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(cfg.database.max_connections)
                .connect_lazy(&url)?;
            (
                Arc::new(PgBackend::new(
                    pool.clone(),
                    cfg.database.query_timeout_seconds,
                )),
                Some(pool),
            )
        }
        None => {
            tracing::warn!("DATABASE_URL no configurada, usando backend demo");
            (Arc::new(DemoBackend::new()), None)
        }
    };

    let memory: Arc<dyn ChatStore> = match (cfg.memory.backend.as_str(), pool) {
        ("postgres", Some(pool)) => match PgChatStore::new(pool).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::warn!("memoria postgres no disponible ({}), usando memoria local", e);
                Arc::new(InMemoryChatStore::new())
            }
        },
        _ => Arc::new(InMemoryChatStore::new()),
    };

    let llm = create_llm_from_config(&cfg.llm);
    let state = build_state(&cfg, backend, llm, memory)?;
    let app = build_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], cfg.server.port));
    tracing::info!("faro-server escuchando en http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
