use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use ignore::WalkBuilder;
use serde::Serialize;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};

use super::chunker::Chunker;
use super::parser::{ParseError, ParserRegistry};
use super::relations::ReferenceGraphBuilder;
use crate::config::Config;
use crate::db::models::{Chunk, IndexState};
use crate::db::{Db, StoreError};
use crate::embedder::{EmbedderError, EmbeddingService};

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("parser setup failed: {0}")]
    Parser(#[from] ParseError),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbedderError),

    #[error("vector store failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    /// Drop the whole store before indexing.
    pub reset: bool,
    /// Only index (and retire) files of this language.
    pub language: Option<String>,
    /// Re-chunk files even when their hash is unchanged.
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SkippedFile {
    pub file_path: String,
    pub reason: String,
}

#[derive(Debug, Default, Serialize)]
pub struct IndexReport {
    pub scanned: usize,
    pub indexed: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub skipped: Vec<SkippedFile>,
    pub chunks_written: usize,
    pub embeddings_computed: usize,
    pub embeddings_cached: usize,
    pub edges: usize,
}

/// A changed file waiting for embeddings.
struct PendingFile {
    state: IndexState,
    chunks: Vec<Chunk>,
}

pub struct Indexer {
    pub db: Arc<TokioMutex<Db>>,
    pub embeddings: Arc<EmbeddingService>,
    registry: ParserRegistry,
    chunker: Chunker,
    max_file_bytes: u64,
}

impl Indexer {
    pub fn new(
        db: Arc<TokioMutex<Db>>,
        embeddings: Arc<EmbeddingService>,
        registry: ParserRegistry,
        chunker: Chunker,
        max_file_bytes: u64,
    ) -> Self {
        Self {
            db,
            embeddings,
            registry,
            chunker,
            max_file_bytes,
        }
    }

    pub fn from_config(
        db: Arc<TokioMutex<Db>>,
        embeddings: Arc<EmbeddingService>,
        config: &Config,
    ) -> Result<Self, IndexError> {
        let registry = ParserRegistry::new(&config.indexer)?;
        Ok(Self::new(
            db,
            embeddings,
            registry,
            Chunker::new(config.chunking.clone()),
            config.indexer.max_file_bytes,
        ))
    }

    /// Incrementally index `dir`: unchanged files are skipped by hash, changed
    /// files are embedded and committed in bounded groups (each file's chunk
    /// set swapped in one transaction), files gone from disk are retired and
    /// the reference graph is rebuilt when anything moved.
    ///
    /// An embedding failure stops the run; groups committed before it stay
    /// indexed and the next run picks up the rest.
    pub async fn index_directory<P: AsRef<Path>>(
        &self,
        dir: P,
        options: &IndexOptions,
    ) -> Result<IndexReport, IndexError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(IndexError::NotADirectory(dir.to_path_buf()));
        }

        if options.reset {
            self.db.lock().await.reset()?;
        }

        let previous = self.db.lock().await.list_index_state()?;
        let mut report = IndexReport::default();
        let mut seen: HashSet<String> = HashSet::new();

        if let Err(e) = self
            .sync_files(dir, options, &previous, &mut seen, &mut report)
            .await
        {
            warn!("Indexing stopped after {} files: {}", report.indexed, e);
            if report.indexed > 0 {
                self.rebuild_graph().await?;
            }
            return Err(e);
        }

        for (file_path, state) in &previous {
            if seen.contains(file_path) {
                continue;
            }
            if let Some(language) = &options.language {
                if &state.language != language {
                    continue;
                }
            }
            self.db.lock().await.remove_file(file_path)?;
            info!("Removed {}", file_path);
            report.removed += 1;
        }

        if report.indexed > 0 || report.removed > 0 || options.reset {
            self.rebuild_graph().await?;
        }
        report.edges = self.db.lock().await.stats()?.edges;

        info!(
            "Indexed {} files ({} unchanged, {} removed, {} skipped), {} chunks, {} edges",
            report.indexed,
            report.unchanged,
            report.removed,
            report.skipped.len(),
            report.chunks_written,
            report.edges
        );
        Ok(report)
    }

    /// Walk `dir`, chunk every changed file and commit them group by group.
    async fn sync_files(
        &self,
        dir: &Path,
        options: &IndexOptions,
        previous: &HashMap<String, IndexState>,
        seen: &mut HashSet<String>,
        report: &mut IndexReport,
    ) -> Result<(), IndexError> {
        let window = self.embeddings.window();
        let mut group: Vec<PendingFile> = Vec::new();
        let mut group_chunks = 0;

        // Walk builder respects .gitignore by default
        let walker = WalkBuilder::new(dir).build();

        for entry in walker.into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let Some(parser) = self.registry.parser_for(path) else {
                continue;
            };
            if let Some(language) = &options.language {
                if parser.language() != language.as_str() {
                    continue;
                }
            }

            let rel_path = relative_path(dir, path);
            report.scanned += 1;
            seen.insert(rel_path.clone());

            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            if size > self.max_file_bytes {
                let reason = ParseError::TooLarge {
                    bytes: size,
                    limit: self.max_file_bytes,
                };
                skip(report, &rel_path, reason.to_string());
                continue;
            }

            let bytes = match std::fs::read(path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    skip(report, &rel_path, format!("read failed: {e}"));
                    continue;
                }
            };
            let file_hash = blake3::hash(&bytes).to_hex().to_string();

            let unchanged = previous
                .get(&rel_path)
                .is_some_and(|state| state.file_hash == file_hash);
            if unchanged && !options.force {
                report.unchanged += 1;
                continue;
            }

            let Ok(text) = String::from_utf8(bytes) else {
                skip(report, &rel_path, ParseError::NotUtf8.to_string());
                continue;
            };

            let parsed = match parser.parse(&text) {
                Ok(parsed) => parsed,
                Err(e) => {
                    skip(report, &rel_path, e.to_string());
                    continue;
                }
            };

            let chunks = self.chunker.chunk(&rel_path, parser.language(), &parsed);
            debug!("{}: {} chunks", rel_path, chunks.len());

            group_chunks += chunks.len();
            group.push(PendingFile {
                state: IndexState {
                    file_path: rel_path.clone(),
                    file_hash,
                    language: parser.language().to_string(),
                    chunk_ids: chunks.iter().map(|c| c.id.clone()).collect(),
                    indexed_at: Utc::now(),
                },
                chunks,
            });

            if group_chunks >= window {
                self.commit_group(&mut group, report).await?;
                group_chunks = 0;
            }
        }

        self.commit_group(&mut group, report).await
    }

    /// Embed a group of changed files through the cache and commit every
    /// file whose chunks all got a vector. Vectors computed before a failed
    /// batch are cached even though the run stops.
    async fn commit_group(&self, group: &mut Vec<PendingFile>, report: &mut IndexReport) -> Result<(), IndexError> {
        if group.is_empty() {
            return Ok(());
        }
        let mut chunks: Vec<Chunk> = group
            .iter_mut()
            .flat_map(|file| std::mem::take(&mut file.chunks))
            .collect();

        let model = self.embeddings.model_id().to_string();
        let cache = {
            let keys: Vec<String> = chunks.iter().map(Chunk::embedding_key).collect();
            let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
            self.db.lock().await.cached_embeddings(&model, &keys)?
        };

        let (stats, fresh, failure) = match self.embeddings.embed_chunks(&mut chunks, &cache).await {
            Ok((stats, fresh)) => (stats, fresh, None),
            Err(partial) => (partial.stats, partial.fresh, Some(partial.source)),
        };
        report.embeddings_computed += stats.computed;
        report.embeddings_cached += stats.cached;
        if !fresh.is_empty() {
            self.db.lock().await.store_cached_embeddings(&model, &fresh)?;
        }

        let mut rest = chunks.into_iter();
        for file in group.drain(..) {
            let file_chunks: Vec<Chunk> = rest.by_ref().take(file.state.chunk_ids.len()).collect();
            if file_chunks.iter().any(|c| c.embedding.is_none()) {
                continue;
            }
            self.db.lock().await.replace_file(&file.state, &file_chunks)?;
            report.indexed += 1;
            report.chunks_written += file_chunks.len();
        }

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    async fn rebuild_graph(&self) -> Result<(), IndexError> {
        let mut db = self.db.lock().await;
        let graph = ReferenceGraphBuilder.build(&db.all_chunks()?);
        db.replace_edges(&graph.edges)?;
        Ok(())
    }
}

fn skip(report: &mut IndexReport, file_path: &str, reason: String) {
    warn!("Skipping {}: {}", file_path, reason);
    report.skipped.push(SkippedFile {
        file_path: file_path.to_string(),
        reason,
    });
}

/// Path relative to the indexed root, with forward slashes.
fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::db::models::ChunkType;
    use crate::embedder::Embedder;
    use crate::embedder::mock::MockEmbedder;
    use std::fs;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    const DIMS: usize = 16;

    fn indexer() -> Indexer {
        let mut config = Config::default();
        config.embedding = EmbeddingConfig {
            dimensions: DIMS,
            ..Default::default()
        };
        let db = Arc::new(TokioMutex::new(Db::open_in_memory(DIMS).unwrap()));
        let embeddings = Arc::new(EmbeddingService::new(
            Arc::new(MockEmbedder::new(DIMS)),
            &config.embedding,
        ));
        Indexer::from_config(db, embeddings, &config).unwrap()
    }

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn test_index_directory_incremental() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "src/A.java", "class A {\n    void run() {}\n}\n");
        write(dir.path(), "src/B.java", "class B extends A {\n}\n");
        write(dir.path(), "README.md", "# Notes\n\nSee class A.\n");
        write(dir.path(), "logo.png", "binary");

        let indexer = indexer();
        let first = indexer
            .index_directory(dir.path(), &IndexOptions::default())
            .await
            .unwrap();
        assert_eq!(first.scanned, 3);
        assert_eq!(first.indexed, 3);
        assert_eq!(first.chunks_written, 4);
        assert_eq!(first.edges, 1);
        assert!(first.skipped.is_empty());

        let second = indexer
            .index_directory(dir.path(), &IndexOptions::default())
            .await
            .unwrap();
        assert_eq!(second.indexed, 0);
        assert_eq!(second.unchanged, 3);
        assert_eq!(second.embeddings_computed, 0);

        fs::remove_file(dir.path().join("src/B.java")).unwrap();
        let third = indexer
            .index_directory(dir.path(), &IndexOptions::default())
            .await
            .unwrap();
        assert_eq!(third.removed, 1);
        assert_eq!(third.edges, 0);

        let db = indexer.db.lock().await;
        assert!(db.chunks_for_file("src/B.java").unwrap().is_empty());
        let states = db.list_index_state().unwrap();
        assert!(states.contains_key("src/A.java"));
        assert!(states.contains_key("README.md"));
    }

    #[tokio::test]
    async fn test_parse_errors_are_skipped() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "Broken.java", "class Broken {\n    void x( {\n}\n");
        write(dir.path(), "forms/bad.json", "{ \"open\": ");
        write(dir.path(), "Good.java", "class Good {}\n");
        fs::write(dir.path().join("latin1.txt"), [0x66u8, 0xff, 0xfe]).unwrap();

        let report = indexer()
            .index_directory(dir.path(), &IndexOptions::default())
            .await
            .unwrap();
        assert_eq!(report.indexed, 1);
        let mut skipped: Vec<&str> = report.skipped.iter().map(|s| s.file_path.as_str()).collect();
        skipped.sort();
        assert_eq!(skipped, vec!["Broken.java", "forms/bad.json", "latin1.txt"]);
    }

    #[tokio::test]
    async fn test_language_filter_and_reset() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "A.java", "class A {}\n");
        write(dir.path(), "notes.md", "# Title\n\nBody.\n");

        let indexer = indexer();
        let options = IndexOptions {
            language: Some("markdown".into()),
            ..Default::default()
        };
        let report = indexer.index_directory(dir.path(), &options).await.unwrap();
        assert_eq!(report.scanned, 1);

        let report = indexer
            .index_directory(dir.path(), &IndexOptions::default())
            .await
            .unwrap();
        assert_eq!((report.indexed, report.unchanged), (1, 1));

        // A java-only run must not retire the markdown file.
        fs::remove_file(dir.path().join("A.java")).unwrap();
        let java_only = IndexOptions {
            language: Some("java".into()),
            ..Default::default()
        };
        let report = indexer.index_directory(dir.path(), &java_only).await.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(indexer.db.lock().await.stats().unwrap().files, 1);

        let report = indexer
            .index_directory(
                dir.path(),
                &IndexOptions {
                    reset: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(report.indexed, 1);
        // Re-embedding after reset is served from the cache.
        assert_eq!(report.embeddings_computed, 0);
        assert!(report.embeddings_cached > 0);

        let db = indexer.db.lock().await;
        assert!(db.all_chunks().unwrap().iter().all(|c| c.chunk_type == ChunkType::Doc));
    }

    /// Rejects every batch from the `ok_calls`-th call on until healed.
    struct Exhausting {
        inner: MockEmbedder,
        ok_calls: usize,
        calls: AtomicUsize,
        healed: AtomicBool,
    }

    impl Embedder for Exhausting {
        fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
            self.inner.embed(text)
        }

        fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call >= self.ok_calls && !self.healed.load(Ordering::SeqCst) {
                return Err(EmbedderError::InferenceFailed("400 input too long".into()));
            }
            self.inner.embed_batch(texts)
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        fn model_id(&self) -> &str {
            self.inner.model_id()
        }
    }

    #[tokio::test]
    async fn test_failed_run_keeps_committed_files() {
        let dir = TempDir::new().unwrap();
        for i in 0..6 {
            write(dir.path(), &format!("src/C{i}.java"), &format!("class C{i} {{}}\n"));
        }

        let mut config = Config::default();
        config.embedding = EmbeddingConfig {
            dimensions: DIMS,
            batch_size: 1,
            max_in_flight: 1,
            max_retries: 0,
            ..Default::default()
        };
        let embedder = Arc::new(Exhausting {
            inner: MockEmbedder::new(DIMS),
            ok_calls: 3,
            calls: AtomicUsize::new(0),
            healed: AtomicBool::new(false),
        });
        let db = Arc::new(TokioMutex::new(Db::open_in_memory(DIMS).unwrap()));
        let embeddings = Arc::new(EmbeddingService::new(embedder.clone(), &config.embedding));
        let indexer = Indexer::from_config(db, embeddings, &config).unwrap();

        let err = indexer
            .index_directory(dir.path(), &IndexOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Embedding(EmbedderError::InferenceFailed(_))));

        {
            let stats = indexer.db.lock().await.stats().unwrap();
            assert_eq!(stats.files, 3);
            assert_eq!(stats.chunks, 3);
            assert_eq!(stats.cached_embeddings, 3);
        }

        embedder.healed.store(true, Ordering::SeqCst);
        let report = indexer
            .index_directory(dir.path(), &IndexOptions::default())
            .await
            .unwrap();
        assert_eq!((report.unchanged, report.indexed), (3, 3));
        assert_eq!(report.embeddings_computed, 3);
        assert_eq!(indexer.db.lock().await.stats().unwrap().files, 6);
    }

    #[tokio::test]
    async fn test_not_a_directory() {
        let err = indexer()
            .index_directory("/definitely/not/here", &IndexOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::NotADirectory(_)));
    }
}
