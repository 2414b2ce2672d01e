/// MCP Server setup using `rmcp` with stdio transport.
///
/// Provides `McpContext` (shared state) and `McpServer` (startup logic).
use crate::mcp::tools::AppTools;
use anyhow::{Context, Result};
use rmcp::{ServiceExt, handler::server::router::Router, transport::io::stdio};
use std::sync::Arc;
use tracing::info;

use crate::{
    config::Config,
    db::Db,
    embedder::EmbeddingService,
    indexer::Indexer,
    retrieval::{AnswerGenerator, Retriever, SourceListing},
};
use tokio::sync::Mutex as TokioMutex;

/// Shared application context available to all tool handlers and CLI commands.
#[derive(Clone)]
pub struct McpContext {
    pub db: Arc<TokioMutex<Db>>,
    pub config: Arc<Config>,
    pub indexer: Arc<Indexer>,
    pub retriever: Arc<Retriever>,
    pub generator: Arc<dyn AnswerGenerator>,
}

impl McpContext {
    /// Open the store and wire every component from `config`. With
    /// `rebuild_store`, a store built at another vector size is emptied
    /// instead of rejected.
    ///
    /// Must be called inside a tokio runtime (the HTTP embedder binds to it).
    pub fn open(config: Config, rebuild_store: bool) -> Result<Self> {
        let db = Db::open_with(&config.db_path, config.embedding.dimensions, rebuild_store)
            .with_context(|| format!("Failed to open database at {}", config.db_path))?;
        let db = Arc::new(TokioMutex::new(db));

        let embeddings = EmbeddingService::from_config(&config.embedding)
            .context("Failed to initialise embedding provider")?;
        let embeddings = Arc::new(embeddings);
        info!(model = embeddings.model_id(), "embedding provider ready");

        let indexer = Indexer::from_config(db.clone(), embeddings.clone(), &config)
            .context("Failed to initialise parsers")?;
        let retriever = Retriever::new(db.clone(), embeddings, config.retrieval.clone());

        Ok(Self {
            db,
            config: Arc::new(config),
            indexer: Arc::new(indexer),
            retriever: Arc::new(retriever),
            generator: Arc::new(SourceListing),
        })
    }
}

/// MCP Server wrapping the context and serving via stdio.
#[derive(Clone)]
pub struct McpServer {
    pub ctx: McpContext,
}

impl McpServer {
    pub fn new(ctx: McpContext) -> Self {
        Self { ctx }
    }

    /// Start the MCP server on stdio transport (blocks until the client disconnects).
    pub async fn start(self) -> Result<()> {
        info!("Starting MCP server on stdio...");
        let (stdin, stdout) = stdio();

        let app_tools = AppTools::new(self.ctx.clone());
        let router = Router::new(app_tools.clone()).with_tools(app_tools.tool_router.clone());

        let service = router
            .serve((stdin, stdout))
            .await
            .context("MCP Server encountered an error during stdio transport")?;
        service
            .waiting()
            .await
            .context("MCP Server stopped unexpectedly")?;

        Ok(())
    }
}
