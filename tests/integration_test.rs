/// End-to-end integration tests for the coderag pipeline.
///
/// Tests the complete flow:
///   source tree → Indexer → store + reference graph → Retriever → query events
use coderag::config::{Config, EmbeddingConfig};
use coderag::db::Db;
use coderag::db::models::{ChunkType, ReferenceEdge, ReferenceKind};
use coderag::db::search::SearchFilter;
use coderag::embedder::mock::MockEmbedder;
use coderag::embedder::{Embedder, EmbedderError, EmbeddingService};
use coderag::indexer::{IndexOptions, Indexer};
use coderag::retrieval::pipeline::{DoneSummary, SourceListing};
use coderag::retrieval::retriever::Origin;
use coderag::retrieval::{Intent, QueryEvent, QueryRequest, RetrieveOptions, Retriever, collect_query};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use tokio::sync::Mutex as TokioMutex;

const DIMS: usize = 64;

const ORDERS: &str = r#"package com.shop;

import com.shop.repo.OrderRepository;

/** Places orders. */
public class OrderService {
    public Receipt placeOrder(Order order) {
        return repository.save(order);
    }
}

class OrderRepository {
}
"#;

/// Mock embedder that counts texts sent for embedding.
struct CountingEmbedder {
    inner: MockEmbedder,
    texts: AtomicUsize,
}

impl Embedder for CountingEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        self.texts.fetch_add(1, Ordering::SeqCst);
        self.inner.embed(text)
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        self.inner.embed_batch(texts)
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }
}

struct Engine {
    indexer: Indexer,
    retriever: Retriever,
    db: Arc<TokioMutex<Db>>,
    embedder: Arc<CountingEmbedder>,
}

fn engine() -> Engine {
    let mut config = Config::default();
    config.embedding = EmbeddingConfig {
        dimensions: DIMS,
        ..Default::default()
    };
    config.retrieval.min_similarity = 0.0;

    let embedder = Arc::new(CountingEmbedder {
        inner: MockEmbedder::new(DIMS),
        texts: AtomicUsize::new(0),
    });
    let db = Arc::new(TokioMutex::new(Db::open_in_memory(DIMS).unwrap()));
    let embeddings = Arc::new(EmbeddingService::new(embedder.clone(), &config.embedding));

    Engine {
        indexer: Indexer::from_config(db.clone(), embeddings.clone(), &config).unwrap(),
        retriever: Retriever::new(db.clone(), embeddings, config.retrieval.clone()),
        db,
        embedder,
    }
}

fn write(dir: &Path, rel: &str, content: &str) {
    let path = dir.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn shop_tree() -> TempDir {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "src/OrderService.java", ORDERS);
    write(
        dir.path(),
        "src/Invoice.java",
        "package com.shop;\n\n/** Billing totals. */\nclass Invoice {\n    Money total;\n\n    Money tax(Money amount) {\n        return amount;\n    }\n}\n\nclass Money {\n}\n",
    );
    write(
        dir.path(),
        "templates/checkout.json",
        "{\n  \"name\": \"checkout\",\n  \"handler\": \"OrderService\",\n  \"type\": \"Invoice\"\n}\n",
    );
    write(
        dir.path(),
        "docs/guide.md",
        "# Guide\n\nOrders are placed through the service.\n\n## Billing\n\nInvoices total every line.\n",
    );
    dir
}

async fn sorted_ids(db: &Arc<TokioMutex<Db>>, file: Option<&str>) -> Vec<String> {
    let db = db.lock().await;
    let chunks = match file {
        Some(file) => db.chunks_for_file(file).unwrap(),
        None => db.all_chunks().unwrap(),
    };
    let mut ids: Vec<String> = chunks.into_iter().map(|c| c.id).collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn test_order_service_scenario() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "src/OrderService.java", ORDERS);
    let engine = engine();

    let report = engine
        .indexer
        .index_directory(dir.path(), &IndexOptions::default())
        .await
        .unwrap();
    assert_eq!(report.chunks_written, 3);
    assert_eq!(report.edges, 1);

    {
        let db = engine.db.lock().await;
        let mut summary: Vec<(&str, Option<String>, Option<String>)> = db
            .all_chunks()
            .unwrap()
            .into_iter()
            .map(|c| (c.chunk_type.as_str(), c.class_name, c.method_name))
            .collect();
        summary.sort();
        assert_eq!(
            summary,
            vec![
                ("class", Some("OrderRepository".into()), None),
                ("class", Some("OrderService".into()), None),
                ("method", Some("OrderService".into()), Some("placeOrder".into())),
            ]
        );
        assert_eq!(
            db.all_edges().unwrap(),
            vec![ReferenceEdge::new(
                "OrderService",
                "OrderRepository",
                ReferenceKind::Import
            )]
        );
    }

    let retrieval = engine
        .retriever
        .retrieve("who uses OrderRepository", &RetrieveOptions::default())
        .await
        .unwrap();
    assert_eq!(retrieval.analysis.intent, Intent::Usage);
    let first = &retrieval.chunks[0];
    assert_eq!(first.origin, Origin::GraphMatch);
    assert_eq!(first.chunk.chunk_type, ChunkType::Class);
    assert_eq!(first.chunk.class_name.as_deref(), Some("OrderService"));
    assert_eq!(retrieval.citations[0].file_path, "src/OrderService.java");
}

#[tokio::test]
async fn test_reindex_is_idempotent() {
    let dir = shop_tree();
    let engine = engine();

    engine
        .indexer
        .index_directory(dir.path(), &IndexOptions::default())
        .await
        .unwrap();
    let calls_after_first = engine.embedder.texts.load(Ordering::SeqCst);
    let ids_after_first = sorted_ids(&engine.db, None).await;
    assert!(calls_after_first > 0);

    // Forced re-chunking of every file still hits the embedding cache.
    let report = engine
        .indexer
        .index_directory(
            dir.path(),
            &IndexOptions {
                force: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(report.embeddings_computed, 0);
    assert_eq!(engine.embedder.texts.load(Ordering::SeqCst), calls_after_first);
    assert_eq!(sorted_ids(&engine.db, None).await, ids_after_first);
}

#[tokio::test]
async fn test_unrelated_edit_keeps_ids() {
    let dir = shop_tree();
    let engine = engine();

    engine
        .indexer
        .index_directory(dir.path(), &IndexOptions::default())
        .await
        .unwrap();
    let invoice_before = sorted_ids(&engine.db, Some("src/Invoice.java")).await;
    let orders_before = sorted_ids(&engine.db, Some("src/OrderService.java")).await;

    let edited = ORDERS.replace("return repository.save(order);", "return repository.persist(order);");
    write(dir.path(), "src/OrderService.java", &edited);
    let report = engine
        .indexer
        .index_directory(dir.path(), &IndexOptions::default())
        .await
        .unwrap();

    assert_eq!(report.indexed, 1);
    assert_eq!(sorted_ids(&engine.db, Some("src/Invoice.java")).await, invoice_before);
    assert_ne!(sorted_ids(&engine.db, Some("src/OrderService.java")).await, orders_before);
}

#[tokio::test]
async fn test_self_retrieval() {
    let dir = shop_tree();
    let engine = engine();
    engine
        .indexer
        .index_directory(dir.path(), &IndexOptions::default())
        .await
        .unwrap();

    let chunks = engine.db.lock().await.all_chunks().unwrap();
    assert!(!chunks.is_empty());
    let query = MockEmbedder::new(DIMS);
    for chunk in chunks {
        let vector = query.embed(&chunk.embedding_text()).unwrap();
        let hits = engine
            .db
            .lock()
            .await
            .search(&vector, 1, &SearchFilter::default())
            .unwrap();
        assert_eq!(hits[0].chunk.id, chunk.id, "chunk {} not ranked first", chunk.file_path);
        assert!(hits[0].score > 0.99);
    }
}

#[tokio::test]
async fn test_budget_truncates_to_prefix() {
    let dir = shop_tree();
    let engine = engine();
    engine
        .indexer
        .index_directory(dir.path(), &IndexOptions::default())
        .await
        .unwrap();

    let question = "orders invoice money total service";
    let full = engine
        .retriever
        .retrieve(question, &RetrieveOptions::default())
        .await
        .unwrap();
    assert!(full.chunks.len() >= 3);
    assert!(!full.truncated);

    let first_two: usize = full.chunks[..2]
        .iter()
        .map(|c| c.chunk.estimated_tokens())
        .sum();
    let options = RetrieveOptions {
        budget_tokens: Some(first_two),
        ..Default::default()
    };
    let budgeted = engine.retriever.retrieve(question, &options).await.unwrap();

    let full_ids: Vec<&str> = full.chunks.iter().map(|c| c.chunk.id.as_str()).collect();
    let budgeted_ids: Vec<&str> = budgeted.chunks.iter().map(|c| c.chunk.id.as_str()).collect();
    assert!(budgeted.truncated);
    assert!(budgeted_ids.len() >= 2 && budgeted_ids.len() < full_ids.len());
    assert_eq!(budgeted_ids, full_ids[..budgeted_ids.len()]);
    assert_eq!(budgeted.citations.len(), budgeted_ids.len());
}

#[tokio::test]
async fn test_reference_symmetry() {
    let dir = shop_tree();
    let engine = engine();
    engine
        .indexer
        .index_directory(dir.path(), &IndexOptions::default())
        .await
        .unwrap();

    let edges = engine.db.lock().await.all_edges().unwrap();
    assert!(edges.contains(&ReferenceEdge::new(
        "templates/checkout.json",
        "OrderService",
        ReferenceKind::TemplateRef
    )));
    assert!(edges.contains(&ReferenceEdge::new("Invoice", "Money", ReferenceKind::FieldType)));

    for edge in &edges {
        let incoming = engine.db.lock().await.edges_to(&edge.target_class).unwrap();
        assert!(
            incoming.iter().any(|e| e.source_class == edge.source_class),
            "{} -> {} missing from reverse lookup",
            edge.source_class,
            edge.target_class
        );
    }

    let deps = engine
        .retriever
        .template_dependencies("checkout", &RetrieveOptions::default())
        .await
        .unwrap();
    let classes: Vec<Option<&str>> = deps
        .chunks
        .iter()
        .skip(1)
        .map(|c| c.chunk.class_name.as_deref())
        .collect();
    assert!(classes.contains(&Some("OrderService")));
    assert!(classes.contains(&Some("Invoice")));
}

#[tokio::test]
async fn test_query_event_stream() {
    let dir = shop_tree();
    let engine = engine();
    engine
        .indexer
        .index_directory(dir.path(), &IndexOptions::default())
        .await
        .unwrap();

    let events = collect_query(
        &engine.retriever,
        Arc::new(SourceListing),
        &QueryRequest::ask("What is Invoice?"),
    )
    .await;

    assert!(matches!(events.first(), Some(QueryEvent::Status(_))));
    let analysis = events
        .iter()
        .find_map(|e| match e {
            QueryEvent::Analysis(a) => Some(a),
            _ => None,
        })
        .unwrap();
    assert_eq!(analysis.intent, Intent::Definition);
    assert_eq!(analysis.class_names, vec!["Invoice"]);

    let sources = events
        .iter()
        .find_map(|e| match e {
            QueryEvent::Sources(s) => Some(s),
            _ => None,
        })
        .unwrap();
    assert_eq!(sources[0].class_name.as_deref(), Some("Invoice"));
    assert_eq!(sources[0].chunk_type, ChunkType::Class);

    let Some(QueryEvent::Done(DoneSummary { num_sources, .. })) = events.last() else {
        panic!("stream must end with done");
    };
    assert_eq!(*num_sources, sources.len());

    let json = serde_json::to_value(&events[0]).unwrap();
    assert_eq!(json["type"], "status");
}
