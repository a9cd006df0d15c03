//! MCP server initialization for stdio and Streamable HTTP transports.
//!
//! Provides [`serve_stdio`] and [`serve_http`] entry points that wire up the
//! database, embedding provider, debate oracle and MCP tool handler into a
//! running server.

use crate::config::CairnConfig;
use crate::db;
use crate::embedding;
use crate::memory::oracle;
use crate::memory::SharedMemory;
use crate::tools::CairnTools;
use anyhow::Result;
use rmcp::ServiceExt;
use std::sync::Arc;

/// Open the database, build the embedding provider and oracle, and check the
/// stored embedding model against the configured one.
pub fn open_memory(config: CairnConfig) -> Result<SharedMemory> {
    let db_path = config.resolved_db_path();
    let conn = db::open_database(&db_path)?;
    tracing::info!(db = %db_path.display(), "database ready");

    let provider = embedding::create_provider(&config.embedding)?;
    let embedder: Arc<dyn embedding::EmbeddingProvider> = Arc::from(provider);

    match db::migrations::get_embedding_model(&conn)? {
        Some(stored) if stored != embedder.model_id() => {
            tracing::warn!(
                stored = %stored,
                configured = %embedder.model_id(),
                "embedding model changed; similarity against existing fragments is unreliable"
            );
        }
        Some(_) => {}
        None => db::migrations::set_embedding_model(&conn, embedder.model_id())?,
    }
    tracing::info!(model = %embedder.model_id(), "embedding provider ready");

    let oracle = oracle::create_oracle(&config.conflict)?;
    tracing::info!(oracle = oracle.name(), "debate oracle ready");

    Ok(SharedMemory::new(conn, embedder, oracle, config))
}

/// Start the MCP server over stdio transport.
pub async fn serve_stdio(config: CairnConfig) -> Result<()> {
    tracing::info!("starting Cairn MCP server on stdio");

    let memory = open_memory(config)?;
    memory.resume_pending_checks().await?;
    let tools = CairnTools::new(memory.clone());
    let transport = rmcp::transport::stdio();

    let server = tools.serve(transport).await?;
    tracing::info!("MCP server running, waiting for client");

    server.waiting().await?;
    memory.settle().await;
    tracing::info!("MCP server shut down");

    Ok(())
}

/// Start the MCP server over Streamable HTTP transport.
pub async fn serve_http(config: CairnConfig) -> Result<()> {
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!(addr = %bind_addr, "starting Cairn MCP server on HTTP");

    let memory = open_memory(config)?;
    memory.resume_pending_checks().await?;
    let shared = memory.clone();

    let service = rmcp::transport::streamable_http_server::StreamableHttpService::new(
        move || Ok(CairnTools::new(shared.clone())),
        rmcp::transport::streamable_http_server::session::local::LocalSessionManager::default()
            .into(),
        Default::default(),
    );

    let router = axum::Router::new().nest_service("/mcp", service);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "MCP server listening at http://{bind_addr}/mcp");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutting down HTTP server");
        })
        .await?;

    memory.settle().await;
    Ok(())
}
