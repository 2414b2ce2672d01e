use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex as TokioMutex;
use tracing::debug;

use super::analyzer::{Intent, QueryAnalysis, QueryAnalyzer};
use crate::config::RetrievalConfig;
use crate::db::models::{Chunk, ReferenceKind};
use crate::db::search::{SearchFilter, SearchHit};
use crate::db::{Db, StoreError};
use crate::embedder::{EmbedderError, EmbeddingService};

#[derive(Debug, thiserror::Error)]
pub enum RetrieveError {
    #[error("question is empty")]
    EmptyQuestion,

    #[error("no class named {0} is indexed")]
    ClassNotFound(String),

    #[error("no template named {0} is indexed")]
    TemplateNotFound(String),

    #[error("embedding the question failed: {0}")]
    Embedding(#[from] EmbedderError),

    #[error("vector store failed: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, RetrieveError>;

#[derive(Debug, Clone, Default)]
pub struct RetrieveOptions {
    pub language: Option<String>,
    /// Fuse vector and keyword rankings instead of pure vector search.
    pub hybrid: bool,
    pub top_k: Option<usize>,
    /// Overrides the intent's default.
    pub expand_dependencies: Option<bool>,
    /// Overrides `retrieval.context_budget_tokens`.
    pub budget_tokens: Option<usize>,
}

/// How a chunk made it into the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Exact structural match through the reference graph.
    GraphMatch,
    /// Ranked by vector or hybrid search.
    Primary,
    /// One hop away from a top result.
    Expansion,
}

#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    pub score: f64,
    pub origin: Origin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Citation {
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
}

impl From<&Chunk> for Citation {
    fn from(chunk: &Chunk) -> Self {
        Self {
            file_path: chunk.file_path.clone(),
            start_line: chunk.start_line,
            end_line: chunk.end_line,
        }
    }
}

/// Assembled context: primaries in rank order, then expansions, cut to budget.
#[derive(Debug, Clone)]
pub struct Retrieval {
    pub analysis: QueryAnalysis,
    pub chunks: Vec<RetrievedChunk>,
    pub citations: Vec<Citation>,
    /// The budget dropped at least one candidate from the tail.
    pub truncated: bool,
}

impl Retrieval {
    pub fn num_expanded(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.origin == Origin::Expansion)
            .count()
    }
}

/// Candidate list that ignores chunks it has already seen.
#[derive(Default)]
struct Candidates {
    seen: HashSet<String>,
    items: Vec<RetrievedChunk>,
}

impl Candidates {
    fn push(&mut self, chunk: Chunk, score: f64, origin: Origin) {
        if self.seen.insert(chunk.id.clone()) {
            self.items.push(RetrievedChunk { chunk, score, origin });
        }
    }

    /// Distinct graph keys of the current candidates, in rank order.
    fn graph_keys(&self, limit: usize) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for item in &self.items {
            if keys.len() >= limit {
                break;
            }
            if let Some(key) = item.chunk.graph_key() {
                if !keys.iter().any(|k| k == key) {
                    keys.push(key.to_string());
                }
            }
        }
        keys
    }
}

pub struct Retriever {
    db: Arc<TokioMutex<Db>>,
    embeddings: Arc<EmbeddingService>,
    analyzer: QueryAnalyzer,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(db: Arc<TokioMutex<Db>>, embeddings: Arc<EmbeddingService>, config: RetrievalConfig) -> Self {
        Self {
            db,
            embeddings,
            analyzer: QueryAnalyzer,
            config,
        }
    }

    pub fn analyze(&self, question: &str) -> QueryAnalysis {
        self.analyzer.analyze(question)
    }

    pub async fn retrieve(&self, question: &str, options: &RetrieveOptions) -> Result<Retrieval> {
        let analysis = self.analyze(question);
        self.retrieve_analyzed(question, analysis, options).await
    }

    /// Run the search stages for an already analysed question.
    pub async fn retrieve_analyzed(
        &self,
        question: &str,
        analysis: QueryAnalysis,
        options: &RetrieveOptions,
    ) -> Result<Retrieval> {
        if question.trim().is_empty() {
            return Err(RetrieveError::EmptyQuestion);
        }

        let profile = analysis.profile(&self.config);
        let top_k = options.top_k.unwrap_or(profile.top_k);
        let expand = options
            .expand_dependencies
            .unwrap_or(profile.expand_dependencies);
        let language = options.language.as_deref();

        let query_vector = self.embeddings.embed_query(question).await?;

        let db = self.db.lock().await;
        let mut candidates = Candidates::default();

        if profile.graph_first {
            for chunk in graph_matches(&db, &analysis, language)? {
                candidates.push(chunk, 1.0, Origin::GraphMatch);
            }
        }

        let filter = SearchFilter {
            language,
            chunk_type: profile.chunk_type,
        };
        let hits: Vec<SearchHit> = if options.hybrid {
            db.hybrid_search(
                &query_vector,
                &analysis.keywords(),
                top_k,
                &filter,
                &self.config.fusion,
            )?
        } else {
            db.search(&query_vector, top_k, &filter)?
                .into_iter()
                .filter(|hit| hit.score >= profile.min_similarity)
                .collect()
        };
        for hit in hits {
            candidates.push(hit.chunk, hit.score, Origin::Primary);
        }

        if expand {
            let seeds = candidates.graph_keys(self.config.expansion_seeds);
            for (chunk, score) in neighbourhood(&db, &seeds, &query_vector)? {
                candidates.push(chunk, score, Origin::Expansion);
            }
        }
        drop(db);

        debug!(
            intent = %analysis.intent,
            candidates = candidates.items.len(),
            "retrieved candidates"
        );
        let budget = options
            .budget_tokens
            .unwrap_or(self.config.context_budget_tokens);
        Ok(assemble(analysis, candidates.items, budget))
    }

    /// One class's own chunks plus its full one-hop neighbourhood.
    pub async fn class_lookup(&self, class_name: &str, options: &RetrieveOptions) -> Result<Retrieval> {
        let db = self.db.lock().await;
        let own = db.class_chunks(class_name)?;
        if own.is_empty() {
            return Err(RetrieveError::ClassNotFound(class_name.to_string()));
        }

        let mut candidates = Candidates::default();
        for chunk in own {
            candidates.push(chunk, 1.0, Origin::GraphMatch);
        }
        for chunk in one_hop(&db, class_name)? {
            candidates.push(chunk, 0.0, Origin::Expansion);
        }
        drop(db);

        let budget = options
            .budget_tokens
            .unwrap_or(self.config.context_budget_tokens);
        Ok(assemble(
            QueryAnalysis::for_lookup(Intent::Definition, class_name),
            candidates.items,
            budget,
        ))
    }

    /// A template and the classes its `template_ref` edges resolve to.
    pub async fn template_dependencies(&self, name: &str, options: &RetrieveOptions) -> Result<Retrieval> {
        let db = self.db.lock().await;
        let template = db
            .template_chunks()?
            .into_iter()
            .find(|chunk| template_matches(&chunk.file_path, name))
            .ok_or_else(|| RetrieveError::TemplateNotFound(name.to_string()))?;

        let edges = db.edges_from(&template.file_path)?;
        let mut candidates = Candidates::default();
        candidates.push(template, 1.0, Origin::GraphMatch);
        for edge in edges
            .iter()
            .filter(|e| e.reference_kind == ReferenceKind::TemplateRef)
        {
            for chunk in db.definition_chunks(&edge.target_class)? {
                candidates.push(chunk, 0.0, Origin::Expansion);
            }
        }
        drop(db);

        let budget = options
            .budget_tokens
            .unwrap_or(self.config.context_budget_tokens);
        Ok(assemble(
            QueryAnalysis::for_lookup(Intent::Explanation, name),
            candidates.items,
            budget,
        ))
    }
}

/// Exact definitions for `definition`, referencing classes for `usage`.
fn graph_matches(db: &Db, analysis: &QueryAnalysis, language: Option<&str>) -> Result<Vec<Chunk>> {
    let mut chunks = Vec::new();
    for name in &analysis.class_names {
        match analysis.intent {
            Intent::Definition => chunks.extend(db.definition_chunks(name)?),
            Intent::Usage => {
                for edge in db.edges_to(name)? {
                    chunks.extend(db.definition_chunks(&edge.source_class)?);
                }
            }
            _ => {}
        }
    }
    if let Some(language) = language {
        chunks.retain(|c| c.language == language);
    }
    Ok(chunks)
}

/// Definition chunks of everything one edge away from `key`, either direction.
fn one_hop(db: &Db, key: &str) -> Result<Vec<Chunk>> {
    let mut keys: Vec<String> = db
        .edges_from(key)?
        .into_iter()
        .map(|e| e.target_class)
        .collect();
    keys.extend(db.edges_to(key)?.into_iter().map(|e| e.source_class));

    let mut seen = HashSet::new();
    let mut chunks = Vec::new();
    for neighbour in keys {
        if neighbour != key && seen.insert(neighbour.clone()) {
            chunks.extend(db.definition_chunks(&neighbour)?);
        }
    }
    Ok(chunks)
}

/// One-hop neighbours of each seed in seed order, scored against the question.
fn neighbourhood(db: &Db, seeds: &[String], query_vector: &[f32]) -> Result<Vec<(Chunk, f64)>> {
    let mut expanded = Vec::new();
    for seed in seeds {
        for chunk in one_hop(db, seed)? {
            let score = db
                .chunk_embedding(&chunk.id)?
                .map(|v| cosine_similarity(query_vector, &v))
                .unwrap_or(0.0);
            expanded.push((chunk, score));
        }
    }
    Ok(expanded)
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// A template matches by relative path, path suffix, file name or file stem.
fn template_matches(file_path: &str, name: &str) -> bool {
    if file_path == name || file_path.ends_with(&format!("/{name}")) {
        return true;
    }
    let path = Path::new(file_path);
    let file_name = path.file_name().and_then(|s| s.to_str());
    let stem = path.file_stem().and_then(|s| s.to_str());
    file_name == Some(name) || stem == Some(name)
}

/// Keep the longest rank-ordered prefix that fits the budget. The first
/// chunk is always kept.
fn assemble(analysis: QueryAnalysis, candidates: Vec<RetrievedChunk>, budget: usize) -> Retrieval {
    let total = candidates.len();
    let mut used = 0usize;
    let mut chunks = Vec::with_capacity(total);

    for candidate in candidates {
        let tokens = candidate.chunk.estimated_tokens();
        if !chunks.is_empty() && used + tokens > budget {
            break;
        }
        used += tokens;
        chunks.push(candidate);
    }

    let truncated = chunks.len() < total;
    let citations = chunks.iter().map(|c| Citation::from(&c.chunk)).collect();
    Retrieval {
        analysis,
        chunks,
        citations,
        truncated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::db::models::{ChunkType, ReferenceEdge};
    use crate::embedder::Embedder;
    use crate::embedder::mock::MockEmbedder;

    const DIMS: usize = 64;

    fn class_chunk(file: &str, name: &str, content: &str) -> Chunk {
        let mut chunk = Chunk::new(file, "java", ChunkType::Class, 1, 5, content);
        chunk.class_name = Some(name.to_string());
        chunk
    }

    async fn fixture(chunks: Vec<Chunk>, edges: &[ReferenceEdge]) -> Retriever {
        let embedder = MockEmbedder::new(DIMS);
        let mut db = Db::open_in_memory(DIMS).unwrap();
        let embedded: Vec<Chunk> = chunks
            .into_iter()
            .map(|mut c| {
                c.embedding = Some(embedder.embed(&c.content).unwrap());
                c
            })
            .collect();
        db.upsert(&embedded).unwrap();
        db.replace_edges(edges).unwrap();

        let db = Arc::new(TokioMutex::new(db));
        let config = EmbeddingConfig {
            dimensions: DIMS,
            ..Default::default()
        };
        let embeddings = Arc::new(EmbeddingService::new(Arc::new(embedder), &config));
        let retrieval = RetrievalConfig {
            min_similarity: 0.0,
            ..Default::default()
        };
        Retriever::new(db, embeddings, retrieval)
    }

    fn shop() -> (Vec<Chunk>, Vec<ReferenceEdge>) {
        let chunks = vec![
            class_chunk("OrderService.java", "OrderService", "class OrderService { repository save order }"),
            class_chunk("OrderRepository.java", "OrderRepository", "class OrderRepository { persist rows }"),
            class_chunk("Invoice.java", "Invoice", "class Invoice { totals tax }"),
        ];
        let edges = vec![ReferenceEdge::new(
            "OrderService",
            "OrderRepository",
            ReferenceKind::Import,
        )];
        (chunks, edges)
    }

    fn sized(name: &str, tokens: usize, origin: Origin) -> RetrievedChunk {
        let content = "x".repeat(tokens * 4);
        RetrievedChunk {
            chunk: class_chunk(&format!("{name}.java"), name, &content),
            score: 0.0,
            origin,
        }
    }

    #[tokio::test]
    async fn test_usage_prefers_graph_match() {
        let (chunks, edges) = shop();
        let f = fixture(chunks, &edges).await;

        let retrieval = f
            .retrieve("who uses OrderRepository", &RetrieveOptions::default())
            .await
            .unwrap();

        assert_eq!(retrieval.analysis.intent, Intent::Usage);
        let first = &retrieval.chunks[0];
        assert_eq!(first.origin, Origin::GraphMatch);
        assert_eq!(first.chunk.class_name.as_deref(), Some("OrderService"));
        assert_eq!(retrieval.citations.len(), retrieval.chunks.len());
        assert_eq!(retrieval.citations[0].file_path, "OrderService.java");
    }

    #[tokio::test]
    async fn test_usage_lists_each_referencing_class_once() {
        let (chunks, mut edges) = shop();
        edges.push(ReferenceEdge::new("OrderService", "OrderRepository", ReferenceKind::FieldType));
        edges.push(ReferenceEdge::new("Invoice", "OrderRepository", ReferenceKind::ParamType));
        edges.push(ReferenceEdge::new("OrderService", "OrderRepository", ReferenceKind::ParamType));
        let f = fixture(chunks, &edges).await;

        let retrieval = f
            .retrieve("who uses OrderRepository", &RetrieveOptions::default())
            .await
            .unwrap();
        let graph: Vec<_> = retrieval
            .chunks
            .iter()
            .filter(|c| c.origin == Origin::GraphMatch)
            .map(|c| c.chunk.class_name.clone().unwrap_or_default())
            .collect();
        assert_eq!(graph, vec!["Invoice", "OrderService"]);
        let ids: HashSet<_> = retrieval.chunks.iter().map(|c| c.chunk.id.as_str()).collect();
        assert_eq!(ids.len(), retrieval.chunks.len());
    }

    #[tokio::test]
    async fn test_definition_graph_match_deduplicates_search_hit() {
        let (chunks, edges) = shop();
        let f = fixture(chunks, &edges).await;

        let retrieval = f
            .retrieve("What is Invoice?", &RetrieveOptions::default())
            .await
            .unwrap();

        assert_eq!(retrieval.chunks[0].chunk.class_name.as_deref(), Some("Invoice"));
        let invoices = retrieval
            .chunks
            .iter()
            .filter(|c| c.chunk.class_name.as_deref() == Some("Invoice"))
            .count();
        assert_eq!(invoices, 1);
    }

    #[tokio::test]
    async fn test_expansion_appends_after_primaries() {
        let (chunks, edges) = shop();
        let f = fixture(chunks, &edges).await;

        let options = RetrieveOptions {
            top_k: Some(1),
            expand_dependencies: Some(true),
            ..Default::default()
        };
        let retrieval = f
            .retrieve("repository save order", &options)
            .await
            .unwrap();

        assert_eq!(retrieval.chunks[0].origin, Origin::Primary);
        assert_eq!(retrieval.chunks[0].chunk.class_name.as_deref(), Some("OrderService"));
        assert_eq!(retrieval.chunks[1].origin, Origin::Expansion);
        assert_eq!(retrieval.chunks[1].chunk.class_name.as_deref(), Some("OrderRepository"));
        assert_eq!(retrieval.num_expanded(), 1);
    }

    #[tokio::test]
    async fn test_definition_question_searches_class_chunks_only() {
        let (mut chunks, edges) = shop();
        let mut method = Chunk::new("Invoice.java", "java", ChunkType::Method, 3, 4, "invoice totals tax");
        method.class_name = Some("Invoice".into());
        method.method_name = Some("totals".into());
        chunks.push(method);
        let f = fixture(chunks, &edges).await;

        let options = RetrieveOptions {
            expand_dependencies: Some(false),
            ..Default::default()
        };
        let retrieval = f.retrieve("What is Invoice?", &options).await.unwrap();
        assert!(!retrieval.chunks.is_empty());
        assert!(retrieval.chunks.iter().all(|c| c.chunk.chunk_type == ChunkType::Class));

        // Without a class name the question is not narrowed.
        let retrieval = f.retrieve("what is invoice totals tax", &options).await.unwrap();
        assert!(retrieval.chunks.iter().any(|c| c.chunk.chunk_type == ChunkType::Method));
    }

    #[tokio::test]
    async fn test_language_filter() {
        let (mut chunks, edges) = shop();
        chunks.push(Chunk::new(
            "README.md",
            "markdown",
            ChunkType::Doc,
            1,
            3,
            "repository save order notes",
        ));
        let f = fixture(chunks, &edges).await;

        let options = RetrieveOptions {
            language: Some("markdown".into()),
            ..Default::default()
        };
        let retrieval = f
            .retrieve("repository save order", &options)
            .await
            .unwrap();
        assert!(!retrieval.chunks.is_empty());
        assert!(retrieval.chunks.iter().all(|c| c.chunk.language == "markdown"));
    }

    #[tokio::test]
    async fn test_class_lookup() {
        let (chunks, edges) = shop();
        let f = fixture(chunks, &edges).await;

        let retrieval = f
            .class_lookup("OrderRepository", &RetrieveOptions::default())
            .await
            .unwrap();
        let names: Vec<_> = retrieval
            .chunks
            .iter()
            .map(|c| c.chunk.class_name.clone().unwrap_or_default())
            .collect();
        assert_eq!(names, vec!["OrderRepository", "OrderService"]);
        assert_eq!(retrieval.analysis.intent, Intent::Definition);

        let missing = f
            .class_lookup("Nope", &RetrieveOptions::default())
            .await;
        assert!(matches!(missing, Err(RetrieveError::ClassNotFound(_))));
    }

    #[tokio::test]
    async fn test_template_dependencies() {
        let (mut chunks, mut edges) = shop();
        chunks.push(Chunk::new(
            "templates/order.json",
            "json",
            ChunkType::Template,
            1,
            4,
            r#"{"handler": "OrderService"}"#,
        ));
        edges.push(ReferenceEdge::new(
            "templates/order.json",
            "OrderService",
            ReferenceKind::TemplateRef,
        ));
        let f = fixture(chunks, &edges).await;

        let retrieval = f
            .template_dependencies("order", &RetrieveOptions::default())
            .await
            .unwrap();
        assert_eq!(retrieval.chunks.len(), 2);
        assert_eq!(retrieval.chunks[0].chunk.chunk_type, ChunkType::Template);
        assert_eq!(retrieval.chunks[1].chunk.class_name.as_deref(), Some("OrderService"));

        let missing = f
            .template_dependencies("missing.yaml", &RetrieveOptions::default())
            .await;
        assert!(matches!(missing, Err(RetrieveError::TemplateNotFound(_))));
    }

    #[tokio::test]
    async fn test_empty_question() {
        let (chunks, edges) = shop();
        let f = fixture(chunks, &edges).await;
        let result = f.retrieve("   ", &RetrieveOptions::default()).await;
        assert!(matches!(result, Err(RetrieveError::EmptyQuestion)));
    }

    #[test]
    fn test_budget_keeps_rank_prefix() {
        let candidates = vec![
            sized("A", 50, Origin::Primary),
            sized("B", 30, Origin::Primary),
            sized("C", 10, Origin::Primary),
            sized("D", 10, Origin::Expansion),
        ];
        let analysis = QueryAnalysis::for_lookup(Intent::Search, "A");

        let retrieval = assemble(analysis.clone(), candidates.clone(), 85);
        let names: Vec<_> = retrieval
            .chunks
            .iter()
            .map(|c| c.chunk.class_name.clone().unwrap_or_default())
            .collect();
        assert_eq!(names, vec!["A", "B"]);
        assert!(retrieval.truncated);

        // C alone would still fit after B is dropped; the prefix stops at B anyway.
        let gap = assemble(analysis.clone(), candidates.clone(), 70);
        assert_eq!(gap.chunks.len(), 1);

        let tiny = assemble(analysis.clone(), candidates.clone(), 1);
        assert_eq!(tiny.chunks.len(), 1);
        assert!(tiny.truncated);

        let roomy = assemble(analysis, candidates, 1000);
        assert_eq!(roomy.chunks.len(), 4);
        assert!(!roomy.truncated);
    }

    #[test]
    fn test_template_name_matching() {
        assert!(template_matches("templates/order.json", "templates/order.json"));
        assert!(template_matches("templates/order.json", "order.json"));
        assert!(template_matches("templates/order.json", "order"));
        assert!(!template_matches("templates/order.json", "ord"));
    }
}
