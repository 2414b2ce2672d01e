/// MCP Tool handlers for coderag.
///
/// 1. index_codebase – incrementally index a source tree
/// 2. query_codebase – answer a question from indexed code
/// 3. class_lookup   – one class plus its one-hop reference neighbourhood
/// 4. template_deps  – classes a template refers to
/// 5. index_stats    – store counts
use crate::indexer::IndexOptions;
use crate::mcp::server::McpContext;
use crate::retrieval::{QueryEvent, QueryMode, QueryRequest, RetrieveOptions, collect_query};
use rmcp::handler::server::ServerHandler;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::{ErrorData as McpError, handler::server::tool::ToolRouter, model::*, tool, tool_router};
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::info;

// ── Parameter structs ────────────────────────────────────────────────

#[derive(Deserialize, JsonSchema)]
struct IndexParams {
    /// Root directory of the source tree
    directory: String,
    /// Drop the whole index before indexing (default: false)
    reset: Option<bool>,
    /// Only index files of this language (e.g. 'java', 'markdown')
    language: Option<String>,
    /// Re-chunk files even if unchanged (default: false)
    force: Option<bool>,
}

#[derive(Deserialize, JsonSchema)]
struct QueryParams {
    /// Question about the codebase (natural language)
    question: String,
    /// Restrict primary results to one language
    language: Option<String>,
    /// Fuse keyword and vector ranking (default: false)
    hybrid: Option<bool>,
    /// Number of primary results (default depends on the question intent)
    top_k: Option<usize>,
    /// Pull in one hop of referenced/referencing classes
    expand: Option<bool>,
}

#[derive(Deserialize, JsonSchema)]
struct NameParam {
    /// Class name, or template path/file name/stem
    name: String,
}

// ── Response helpers ─────────────────────────────────────────────────

fn json_result(value: serde_json::Value) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::success(vec![Content::text(
        serde_json::to_string_pretty(&value).unwrap_or_default(),
    )]))
}

fn error_result(msg: &str) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::error(vec![Content::text(msg.to_string())]))
}

/// Query events become one JSON document; a terminal error becomes a tool error.
fn events_result(events: Vec<QueryEvent>) -> Result<CallToolResult, McpError> {
    if let Some(QueryEvent::Error(msg)) = events.last() {
        return error_result(msg);
    }
    json_result(serde_json::json!({ "events": events }))
}

// ── Tool implementations ─────────────────────────────────────────────

#[derive(Clone)]
pub struct AppTools {
    pub ctx: McpContext,
    pub tool_router: ToolRouter<Self>,
}

impl ServerHandler for AppTools {}

#[tool_router]
impl AppTools {
    pub fn new(ctx: McpContext) -> Self {
        Self {
            ctx,
            tool_router: Self::tool_router(),
        }
    }

    // ── Tool 1: index_codebase ──────────────────────────────────────

    #[tool(
        description = "Index a source tree. Unchanged files are skipped by content hash; files that fail to parse are reported and skipped."
    )]
    async fn index_codebase(&self, params: Parameters<IndexParams>) -> Result<CallToolResult, McpError> {
        let p = params.0;
        if p.directory.is_empty() {
            return error_result("directory is required");
        }

        let options = IndexOptions {
            reset: p.reset.unwrap_or(false),
            language: p.language,
            force: p.force.unwrap_or(false),
        };
        info!(directory = %p.directory, "index_codebase");

        match self.ctx.indexer.index_directory(&p.directory, &options).await {
            Ok(report) => json_result(serde_json::to_value(&report).unwrap_or_default()),
            Err(e) => error_result(&format!("indexing failed: {e}")),
        }
    }

    // ── Tool 2: query_codebase ──────────────────────────────────────

    #[tool(
        description = "Answer a question about the indexed code. Returns the staged events: analysis (intent, class names, terms), ranked sources with file/line citations, the answer, and a summary."
    )]
    async fn query_codebase(&self, params: Parameters<QueryParams>) -> Result<CallToolResult, McpError> {
        let p = params.0;
        if p.question.trim().is_empty() {
            return error_result("question is required");
        }

        let request = QueryRequest {
            question: p.question,
            mode: QueryMode::Ask,
            options: RetrieveOptions {
                language: p.language,
                hybrid: p.hybrid.unwrap_or(false),
                top_k: p.top_k,
                expand_dependencies: p.expand,
                budget_tokens: None,
            },
        };
        self.run(request).await
    }

    // ── Tool 3: class_lookup ────────────────────────────────────────

    #[tool(description = "Show a class's chunks together with every class it references and every class or template that references it")]
    async fn class_lookup(&self, params: Parameters<NameParam>) -> Result<CallToolResult, McpError> {
        let name = params.0.name;
        if name.is_empty() {
            return error_result("name is required");
        }
        self.run(lookup_request(QueryMode::ClassLookup(name))).await
    }

    // ── Tool 4: template_deps ───────────────────────────────────────

    #[tool(description = "Resolve the classes a JSON/YAML template refers to")]
    async fn template_deps(&self, params: Parameters<NameParam>) -> Result<CallToolResult, McpError> {
        let name = params.0.name;
        if name.is_empty() {
            return error_result("name is required");
        }
        self.run(lookup_request(QueryMode::TemplateDeps(name))).await
    }

    // ── Tool 5: index_stats ─────────────────────────────────────────

    #[tool(description = "Chunk, file, edge and embedding-cache counts of the index")]
    async fn index_stats(&self) -> Result<CallToolResult, McpError> {
        let db = self.ctx.db.lock().await;
        let stats = db
            .stats()
            .map_err(|e| McpError::internal_error(format!("stats failed: {e}"), None))?;
        let classes = db
            .list_classes()
            .map_err(|e| McpError::internal_error(format!("stats failed: {e}"), None))?;

        json_result(serde_json::json!({
            "stats": stats,
            "classes": classes,
        }))
    }
}

impl AppTools {
    async fn run(&self, request: QueryRequest) -> Result<CallToolResult, McpError> {
        let events = collect_query(&self.ctx.retriever, self.ctx.generator.clone(), &request).await;
        events_result(events)
    }
}

fn lookup_request(mode: QueryMode) -> QueryRequest {
    QueryRequest {
        question: String::new(),
        mode,
        options: RetrieveOptions::default(),
    }
}
