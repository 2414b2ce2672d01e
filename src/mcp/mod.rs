//! MCP stdio server exposing indexing and querying as tools.
pub mod server;
pub mod tools;
