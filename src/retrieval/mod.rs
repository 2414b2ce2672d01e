//! Question → analysis → ranked, budgeted context → streamed answer.
pub mod analyzer;
pub mod pipeline;
pub mod retriever;

pub use self::analyzer::{Intent, QueryAnalysis, QueryAnalyzer};
pub use self::pipeline::{
    AnswerGenerator, QueryEvent, QueryMode, QueryRequest, SourceListing, collect_query, run_query,
};
pub use self::retriever::{Citation, RetrieveError, RetrieveOptions, Retrieval, Retriever};
