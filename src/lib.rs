//! # coderag: Codebase indexing and retrieval engine
//!
//! Splits a source tree into semantically meaningful chunks, links classes and
//! templates through a name-keyed reference graph, embeds every chunk, and
//! answers natural-language questions with ranked, cited, size-budgeted context.
//!
//! ## Architecture
//!
//! - **[`config`]**: JSON configuration loading and validation
//! - **[`db`]**: SQLite + sqlite-vec store (chunks, index state, embedding cache, edges, search)
//! - **[`embedder`]**: `Embedder` providers and the batching, retrying `EmbeddingService`
//! - **[`indexer`]**: per-language parsers, chunker, reference graph, incremental indexer
//! - **[`retrieval`]**: question analysis, graph-aware retrieval, streamed query pipeline
//! - **[`mcp`]**: MCP server with 5 tool handlers (stdio transport via rmcp)

pub mod config;
pub mod db;
pub mod embedder;
pub mod indexer;
pub mod mcp;
pub mod retrieval;
