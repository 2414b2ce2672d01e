//! Source tree → chunks → reference graph.
//!
//! Parsers are selected per file extension through [`parser::ParserRegistry`];
//! the [`chunker::Chunker`] never branches on language.
pub mod chunker;
pub mod code_parser;
pub mod core;
pub mod java;
pub mod languages;
pub mod markdown;
pub mod parser;
pub mod relations;
pub mod template;

pub use self::core::{IndexError, IndexOptions, IndexReport, Indexer, SkippedFile};
