//! Staged query pipeline: status → analysis → sources → answer → done.
//!
//! Events go to an unbounded channel so any transport (stdout JSON lines,
//! an MCP tool result, a test) can consume them. An `error` event is terminal.
use std::fmt::Write as _;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{info, warn};

use super::analyzer::{Intent, QueryAnalysis};
use super::retriever::{RetrieveOptions, RetrievedChunk, Retrieval, Retriever};
use crate::db::models::ChunkType;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum QueryEvent {
    Status(String),
    Analysis(QueryAnalysis),
    Sources(Vec<SourceRecord>),
    Answer(String),
    Done(DoneSummary),
    Error(String),
}

impl QueryEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueryEvent::Done(_) | QueryEvent::Error(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRecord {
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub class_name: Option<String>,
    pub method_name: Option<String>,
    pub chunk_type: ChunkType,
    pub language: String,
    pub content: String,
    pub score: f64,
}

impl From<&RetrievedChunk> for SourceRecord {
    fn from(item: &RetrievedChunk) -> Self {
        let chunk = &item.chunk;
        Self {
            file_path: chunk.file_path.clone(),
            start_line: chunk.start_line,
            end_line: chunk.end_line,
            class_name: chunk.class_name.clone(),
            method_name: chunk.method_name.clone(),
            chunk_type: chunk.chunk_type,
            language: chunk.language.clone(),
            content: chunk.content.clone(),
            score: item.score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DoneSummary {
    pub intent: Intent,
    pub num_sources: usize,
    pub num_expanded: usize,
    pub truncated: bool,
}

/// Produces the answer text from the assembled context.
pub trait AnswerGenerator: Send + Sync {
    fn generate(&self, question: &str, context: &str, sources: &[RetrievedChunk]) -> anyhow::Result<String>;
}

/// Retrieval-only answers: a numbered listing of the cited chunks.
#[derive(Debug, Default, Clone, Copy)]
pub struct SourceListing;

impl AnswerGenerator for SourceListing {
    fn generate(&self, _question: &str, _context: &str, sources: &[RetrievedChunk]) -> anyhow::Result<String> {
        if sources.is_empty() {
            return Ok("No relevant code found in the index.".to_string());
        }

        let mut out = format!("Found {} relevant chunks:\n", sources.len());
        for (i, item) in sources.iter().enumerate() {
            let chunk = &item.chunk;
            let name = match (&chunk.class_name, &chunk.method_name) {
                (Some(class), Some(method)) => format!("{class}.{method}"),
                (Some(class), None) => class.clone(),
                (None, Some(method)) => method.clone(),
                (None, None) => chunk.chunk_type.to_string(),
            };
            let _ = writeln!(
                out,
                "{}. {name} ({}:{}-{}) [score: {:.3}]",
                i + 1,
                chunk.file_path,
                chunk.start_line,
                chunk.end_line,
                item.score
            );
        }
        Ok(out)
    }
}

/// Render chunks as numbered, fenced snippets for a generation prompt.
pub fn format_context(sources: &[RetrievedChunk]) -> String {
    let mut out = String::new();
    for (i, item) in sources.iter().enumerate() {
        let chunk = &item.chunk;
        let _ = writeln!(
            out,
            "--- Code Snippet {} ({}:{}-{}) ---",
            i + 1,
            chunk.file_path,
            chunk.start_line,
            chunk.end_line
        );
        if let Some(doc) = chunk.docstring.as_deref().filter(|d| !d.trim().is_empty()) {
            let _ = writeln!(out, "Documentation: {}", doc.trim());
        }
        let _ = writeln!(out, "```{}\n{}\n```\n", chunk.language, chunk.content.trim_end());
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryMode {
    Ask,
    ClassLookup(String),
    TemplateDeps(String),
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub question: String,
    pub mode: QueryMode,
    pub options: RetrieveOptions,
}

impl QueryRequest {
    pub fn ask(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            mode: QueryMode::Ask,
            options: RetrieveOptions::default(),
        }
    }
}

/// Run one question through every stage, emitting events as they happen.
/// A closed receiver stops nothing; the pipeline finishes regardless.
pub async fn run_query(
    retriever: &Retriever,
    generator: Arc<dyn AnswerGenerator>,
    request: &QueryRequest,
    events: &UnboundedSender<QueryEvent>,
) {
    let emit = |event: QueryEvent| {
        let _ = events.send(event);
    };

    let retrieval = match &request.mode {
        QueryMode::Ask => {
            emit(QueryEvent::Status("Analyzing question".into()));
            let analysis = retriever.analyze(&request.question);
            emit(QueryEvent::Analysis(analysis.clone()));
            emit(QueryEvent::Status("Searching codebase".into()));
            retriever
                .retrieve_analyzed(&request.question, analysis, &request.options)
                .await
                .map(|r| (r, false))
        }
        QueryMode::ClassLookup(name) => {
            emit(QueryEvent::Status(format!("Looking up class {name}")));
            retriever
                .class_lookup(name, &request.options)
                .await
                .map(|r| (r, true))
        }
        QueryMode::TemplateDeps(name) => {
            emit(QueryEvent::Status(format!("Resolving template {name}")));
            retriever
                .template_dependencies(name, &request.options)
                .await
                .map(|r| (r, true))
        }
    };

    let retrieval: Retrieval = match retrieval {
        Ok((retrieval, lookup)) => {
            if lookup {
                emit(QueryEvent::Analysis(retrieval.analysis.clone()));
            }
            retrieval
        }
        Err(e) => {
            warn!("query failed: {e}");
            emit(QueryEvent::Error(e.to_string()));
            return;
        }
    };

    emit(QueryEvent::Sources(
        retrieval.chunks.iter().map(SourceRecord::from).collect(),
    ));

    emit(QueryEvent::Status("Generating answer".into()));
    let question = request.question.clone();
    let sources = retrieval.chunks.clone();
    let answer = tokio::task::spawn_blocking(move || {
        let context = format_context(&sources);
        generator.generate(&question, &context, &sources)
    })
    .await;

    match answer {
        Ok(Ok(text)) => emit(QueryEvent::Answer(text)),
        Ok(Err(e)) => {
            warn!("answer generation failed: {e:#}");
            emit(QueryEvent::Error(format!("answer generation failed: {e:#}")));
            return;
        }
        Err(e) => {
            emit(QueryEvent::Error(format!("answer generation panicked: {e}")));
            return;
        }
    }

    let summary = DoneSummary {
        intent: retrieval.analysis.intent,
        num_sources: retrieval.chunks.len(),
        num_expanded: retrieval.num_expanded(),
        truncated: retrieval.truncated,
    };
    info!(
        intent = %summary.intent,
        sources = summary.num_sources,
        expanded = summary.num_expanded,
        "query complete"
    );
    emit(QueryEvent::Done(summary));
}

/// Run a query and gather its events.
pub async fn collect_query(
    retriever: &Retriever,
    generator: Arc<dyn AnswerGenerator>,
    request: &QueryRequest,
) -> Vec<QueryEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    run_query(retriever, generator, request, &tx).await;
    drop(tx);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmbeddingConfig, RetrievalConfig};
    use crate::db::Db;
    use crate::db::models::Chunk;
    use crate::retrieval::retriever::Origin;
    use crate::embedder::mock::MockEmbedder;
    use crate::embedder::{Embedder, EmbeddingService};
    use anyhow::bail;
    use tokio::sync::Mutex as TokioMutex;

    const DIMS: usize = 32;

    struct Refusing;

    impl AnswerGenerator for Refusing {
        fn generate(&self, _: &str, _: &str, _: &[RetrievedChunk]) -> anyhow::Result<String> {
            bail!("model offline")
        }
    }

    fn retriever() -> Retriever {
        let embedder = MockEmbedder::new(DIMS);
        let mut chunk = Chunk::new(
            "src/Cart.java",
            "java",
            ChunkType::Class,
            1,
            3,
            "class Cart { add item checkout }",
        );
        chunk.class_name = Some("Cart".into());
        chunk.docstring = Some("Shopping cart.".into());
        chunk.embedding = Some(embedder.embed(&chunk.content).unwrap());

        let mut db = Db::open_in_memory(DIMS).unwrap();
        db.upsert(&[chunk]).unwrap();

        let config = EmbeddingConfig {
            dimensions: DIMS,
            ..Default::default()
        };
        let embeddings = Arc::new(EmbeddingService::new(Arc::new(embedder), &config));
        let retrieval = RetrievalConfig {
            min_similarity: 0.0,
            ..Default::default()
        };
        Retriever::new(Arc::new(TokioMutex::new(db)), embeddings, retrieval)
    }

    fn kinds(events: &[QueryEvent]) -> Vec<&'static str> {
        events
            .iter()
            .map(|e| match e {
                QueryEvent::Status(_) => "status",
                QueryEvent::Analysis(_) => "analysis",
                QueryEvent::Sources(_) => "sources",
                QueryEvent::Answer(_) => "answer",
                QueryEvent::Done(_) => "done",
                QueryEvent::Error(_) => "error",
            })
            .collect()
    }

    #[tokio::test]
    async fn test_event_order() {
        let retriever = retriever();
        let events = collect_query(
            &retriever,
            Arc::new(SourceListing),
            &QueryRequest::ask("add item checkout"),
        )
        .await;

        assert_eq!(
            kinds(&events),
            vec!["status", "analysis", "status", "sources", "status", "answer", "done"]
        );
        let QueryEvent::Answer(answer) = &events[5] else {
            panic!("expected answer");
        };
        assert!(answer.contains("1. Cart (src/Cart.java:1-3)"));
        let QueryEvent::Done(summary) = &events[6] else {
            panic!("expected done");
        };
        assert_eq!(summary.num_sources, 1);
        assert!(!summary.truncated);
    }

    #[tokio::test]
    async fn test_error_is_terminal() {
        let retriever = retriever();
        let request = QueryRequest {
            question: String::new(),
            mode: QueryMode::ClassLookup("Missing".into()),
            options: RetrieveOptions::default(),
        };
        let events = collect_query(&retriever, Arc::new(SourceListing), &request).await;
        assert_eq!(kinds(&events), vec!["status", "error"]);
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_generator_failure_reports_error() {
        let retriever = retriever();
        let events = collect_query(&retriever, Arc::new(Refusing), &QueryRequest::ask("checkout")).await;
        assert_eq!(kinds(&events).last(), Some(&"error"));
        assert!(!events.iter().any(|e| matches!(e, QueryEvent::Done(_))));
    }

    #[tokio::test]
    async fn test_class_lookup_mode_reports_fixed_intent() {
        let retriever = retriever();
        let request = QueryRequest {
            question: String::new(),
            mode: QueryMode::ClassLookup("Cart".into()),
            options: RetrieveOptions::default(),
        };
        let events = collect_query(&retriever, Arc::new(SourceListing), &request).await;
        let QueryEvent::Analysis(analysis) = &events[1] else {
            panic!("expected analysis");
        };
        assert_eq!(analysis.intent, Intent::Definition);
        assert_eq!(kinds(&events).last(), Some(&"done"));
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(QueryEvent::Status("searching".into())).unwrap();
        assert_eq!(json, serde_json::json!({"type": "status", "content": "searching"}));

        let done = QueryEvent::Done(DoneSummary {
            intent: Intent::Usage,
            num_sources: 2,
            num_expanded: 1,
            truncated: false,
        });
        let json = serde_json::to_value(done).unwrap();
        assert_eq!(json["type"], "done");
        assert_eq!(json["content"]["intent"], "usage");
        assert_eq!(json["content"]["num_expanded"], 1);
    }

    #[test]
    fn test_format_context() {
        let mut chunk = Chunk::new("src/A.java", "java", ChunkType::Class, 4, 6, "class A {}\n");
        chunk.docstring = Some("An A.".into());
        let text = format_context(&[RetrievedChunk {
            chunk,
            score: 0.9,
            origin: Origin::Primary,
        }]);
        assert_eq!(
            text,
            "--- Code Snippet 1 (src/A.java:4-6) ---\nDocumentation: An A.\n```java\nclass A {}\n```\n\n"
        );
    }
}
