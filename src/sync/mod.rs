//! Sync orchestration: source tree -> chunk store -> search store.
//!
//! A [`Pipeline`] is built once (usually from [`Config`]) and borrowed by
//! whatever drives it. `index` detects changed files, replaces their chunks
//! one file at a time, removes deleted files and finally rebuilds the search
//! store. Entry points report failures in their report objects instead of
//! returning errors.

pub mod cancel;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use crate::cache::EmbeddingCache;
use crate::config::Config;
use crate::db::{migrate, Db};
use crate::embeddings::{build_embedder, check_batch, Embedder};
use crate::error::{Result, RagsyncError};
use crate::fingerprint::{detect_changes, ChangeSet, DetectedFile, FingerprintRegistry};
use crate::index::{self, IndexInfo, IndexParams};
use crate::ingest::{preprocess_file, processed_path, CharChunker, Chunker, TextCleaner};
use crate::search::{self, SearchOptions, SearchResult};
use crate::store::{chunk_store, search_store, NewChunk, RebuildReport, SEARCH_TABLE};

pub use cancel::CancelFlag;

/// Knobs of a pipeline that do not change between runs
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Extensions picked up from the source tree, without the dot
    pub extensions: Vec<String>,
    /// Files fingerprinted concurrently
    pub workers: usize,
    /// Texts per embedding request
    pub embed_batch_size: usize,
    /// Embedding requests in flight
    pub embed_concurrency: usize,
    /// Where `clear` looks for the fingerprint registry
    pub processed_dir: PathBuf,
    pub default_limit: usize,
    pub similarity_threshold: f32,
    pub index: IndexParams,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            extensions: vec!["md".to_string(), "markdown".to_string(), "txt".to_string()],
            workers: 4,
            embed_batch_size: 32,
            embed_concurrency: 2,
            processed_dir: PathBuf::from("./data/processed"),
            default_limit: 5,
            similarity_threshold: 0.7,
            index: IndexParams::default(),
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            extensions: config.ingest.extensions.clone(),
            workers: config.ingest.workers,
            embed_batch_size: config.embeddings.batch_size,
            embed_concurrency: config.embeddings.concurrency,
            processed_dir: config.ingest.processed_dir.clone(),
            default_limit: config.search.default_limit,
            similarity_threshold: config.search.similarity_threshold,
            index: IndexParams::default(),
        }
    }
}

/// One indexing run
#[derive(Debug, Clone)]
pub struct IndexRequest {
    pub source_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Only process files whose fingerprint changed
    pub incremental: bool,
}

impl IndexRequest {
    pub fn from_config(config: &Config, incremental: bool) -> Self {
        Self {
            source_dir: config.ingest.source_dir.clone(),
            processed_dir: config.ingest.processed_dir.clone(),
            chunk_size: config.ingest.chunk_size,
            chunk_overlap: config.ingest.chunk_overlap,
            incremental,
        }
    }
}

/// Outcome of [`Pipeline::index`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexReport {
    /// Files whose chunks were committed in this run
    pub document_count: usize,
    pub chunk_count: usize,
    pub failed_files: usize,
    pub deleted_files: usize,
    pub unchanged_files: usize,
    pub skipped_files: usize,
    /// Rows in the search store after the rebuild
    pub search_rows: usize,
    pub processing_time_seconds: f64,
    pub success: bool,
    pub error: Option<String>,
    pub message: String,
}

/// Outcome of [`Pipeline::clear`]
#[derive(Debug, Clone, Serialize)]
pub struct ClearReport {
    pub deleted_count: usize,
    pub success: bool,
    pub error: Option<String>,
}

/// Row counts of both tiers plus index metadata
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub chunk_rows: i64,
    pub search_rows: i64,
    pub files: usize,
    pub index: Option<IndexInfo>,
}

pub struct Pipeline {
    db: Db,
    dim: usize,
    embedder: Arc<dyn Embedder>,
    cache: Option<EmbeddingCache>,
    cleaner: TextCleaner,
    settings: PipelineSettings,
    cancel: CancelFlag,
}

impl Pipeline {
    /// Create a pipeline bound to the embedder's dimension
    pub fn new(db: Db, embedder: Arc<dyn Embedder>, settings: PipelineSettings) -> Result<Self> {
        let dim = embedder.dimension();
        if dim == 0 {
            return Err(RagsyncError::Config("Embedding dimension must be > 0".to_string()));
        }
        if settings.embed_batch_size == 0 || settings.embed_concurrency == 0 || settings.workers == 0 {
            return Err(RagsyncError::Config(
                "batch size, concurrency and workers must be > 0".to_string(),
            ));
        }

        Ok(Self {
            db,
            dim,
            embedder,
            cache: None,
            cleaner: TextCleaner::new()?,
            settings,
            cancel: CancelFlag::new(),
        })
    }

    /// Build the database handle, embedder and query cache from config
    pub fn from_config(config: &Config) -> Result<Self> {
        let embedder = build_embedder(&config.embeddings)?;
        let pipeline = Self::new(
            Db::new(config.db_path()),
            embedder,
            PipelineSettings::from_config(config),
        )?;
        Ok(pipeline.with_cache(EmbeddingCache::new(config.embeddings.cache_capacity)))
    }

    pub fn with_cache(mut self, cache: Option<EmbeddingCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    pub fn cache(&self) -> Option<&EmbeddingCache> {
        self.cache.as_ref()
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Apply pending migrations from `migrations_dir`
    pub async fn ensure_schema(&self, migrations_dir: &Path) -> Result<()> {
        let dir = migrations_dir.to_path_buf();
        self.db
            .with_connection(move |conn| migrate::run_migrations(conn, &dir))
            .await
    }

    /// Search options prefilled with the configured limit and threshold
    pub fn search_options(&self) -> SearchOptions {
        SearchOptions {
            limit: self.settings.default_limit,
            threshold: self.settings.similarity_threshold,
            ..SearchOptions::default()
        }
    }

    /// Empty both tiers and forget every fingerprint
    pub async fn clear(&self) -> ClearReport {
        match self.clear_all().await {
            Ok(deleted_count) => {
                log::info!("✓ Cleared {} chunks", deleted_count);
                ClearReport {
                    deleted_count,
                    success: true,
                    error: None,
                }
            }
            Err(e) => {
                log::error!("✗ Clear failed: {}", e);
                ClearReport {
                    deleted_count: 0,
                    success: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn clear_all(&self) -> Result<usize> {
        let deleted = chunk_store::clear(&self.db).await?;
        self.rebuild().await?;

        let registry = FingerprintRegistry::registry_path(&self.settings.processed_dir);
        match fs::remove_file(&registry) {
            Ok(()) => log::info!("Removed {}", registry.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(deleted)
    }

    /// Rebuild the search store from the chunk store
    pub async fn rebuild(&self) -> Result<RebuildReport> {
        search_store::rebuild_with(&self.db, self.dim, self.settings.index, &self.cancel).await
    }

    /// Bring the chunk store in line with `request.source_dir` and rebuild
    pub async fn index(&self, request: IndexRequest) -> IndexReport {
        let start = Instant::now();
        let mut report = IndexReport::default();

        let outcome = self.run_index(&request, &mut report).await;
        report.processing_time_seconds = start.elapsed().as_secs_f64();

        match outcome {
            Ok(()) => {
                report.success = true;
                report.message = format!(
                    "Indexed {} files ({} chunks), {} failed, {} deleted, {} unchanged",
                    report.document_count,
                    report.chunk_count,
                    report.failed_files,
                    report.deleted_files,
                    report.unchanged_files
                );
                log::info!("✓ {}", report.message);
            }
            Err(e) => {
                report.success = false;
                report.error = Some(e.to_string());
                report.message = format!("Indexing stopped after {} files: {}", report.document_count, e);
                log::error!("✗ {}", report.message);
            }
        }
        report
    }

    async fn run_index(&self, request: &IndexRequest, report: &mut IndexReport) -> Result<()> {
        let chunker = CharChunker::new(request.chunk_size, request.chunk_overlap)?;
        let mut registry = FingerprintRegistry::load(&request.processed_dir)?;

        let changes = detect_changes(
            &request.source_dir,
            &self.settings.extensions,
            &registry,
            request.incremental,
            self.settings.workers,
        )
        .await?;
        report.unchanged_files = changes.unchanged.len();
        report.skipped_files = changes.skipped;
        if !request.incremental {
            // A full run records only what it commits
            registry.clear();
        }

        let source_root = request.source_dir.canonicalize()?;
        let applied = self
            .apply_changes(&source_root, &request.processed_dir, &chunker, &changes, &mut registry, report)
            .await;
        // Committed files keep their fingerprints even when the run stops early
        let saved = registry.save(&request.processed_dir);
        applied?;
        saved?;

        let rebuilt = self.rebuild().await?;
        report.search_rows = rebuilt.rows;
        Ok(())
    }

    async fn apply_changes(
        &self,
        source_root: &Path,
        processed_dir: &Path,
        chunker: &dyn Chunker,
        changes: &ChangeSet,
        registry: &mut FingerprintRegistry,
        report: &mut IndexReport,
    ) -> Result<()> {
        for source in &changes.deleted {
            self.cancel.check()?;
            let processed = processed_path(source_root, processed_dir, Path::new(source));
            let removed = chunk_store::delete_file(&self.db, &processed.to_string_lossy()).await?;
            if let Err(e) = fs::remove_file(&processed) {
                log::debug!("No processed copy to remove at {}: {}", processed.display(), e);
            }
            registry.remove(source);
            report.deleted_files += 1;
            log::info!("Removed {} chunks of deleted file {}", removed, source);
        }

        let total = changes.to_process.len();
        for (n, file) in changes.to_process.iter().enumerate() {
            self.cancel.check()?;
            match self.ingest_file(source_root, processed_dir, chunker, file).await {
                Ok(chunks) => {
                    registry.record(file.key(), file.fingerprint.clone());
                    report.document_count += 1;
                    report.chunk_count += chunks;
                    log::info!("[{}/{}] ✓ {} ({} chunks)", n + 1, total, file.path.display(), chunks);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    report.failed_files += 1;
                    log::error!("[{}/{}] ✗ {}: {}", n + 1, total, file.path.display(), e);
                }
            }
        }
        Ok(())
    }

    /// Preprocess, chunk and embed one file, then replace its rows
    ///
    /// # Returns
    ///
    /// Number of chunks committed
    async fn ingest_file(
        &self,
        source_root: &Path,
        processed_dir: &Path,
        chunker: &dyn Chunker,
        file: &DetectedFile,
    ) -> Result<usize> {
        let cleaner = self.cleaner.clone();
        let (root, out_dir, source) = (source_root.to_path_buf(), processed_dir.to_path_buf(), file.path.clone());
        let doc = tokio::task::spawn_blocking(move || preprocess_file(&cleaner, &root, &out_dir, &source))
            .await
            .map_err(|e| RagsyncError::Connectivity(format!("preprocess task failed: {}", e)))??;

        let texts = chunker.split(&doc.text);
        let embeddings = self.embed_documents(&texts).await.map_err(|e| match e {
            e if e.is_fatal() => e,
            e => RagsyncError::FileProcessing {
                path: file.path.display().to_string(),
                reason: e.to_string(),
            },
        })?;

        let chunks: Vec<NewChunk> = texts
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(i, (chunk_text, embedding))| NewChunk {
                chunk_text,
                embedding,
                file: doc.identity.clone(),
                chunk_index: i as i64,
            })
            .collect();
        let count = chunks.len();

        let (replaced, _) = chunk_store::replace_file(&self.db, self.dim, &doc.identity.filepath, chunks).await?;
        if replaced > 0 {
            log::debug!("Replaced {} previous chunks of {}", replaced, doc.identity.filepath);
        }
        Ok(count)
    }

    /// Embed chunk texts in ordered, bounded-concurrency batches
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let embedder = self.embedder.as_ref();
        let cancel = &self.cancel;
        let dim = self.dim;

        let batches: Vec<Vec<Vec<f32>>> = stream::iter(texts.chunks(self.settings.embed_batch_size))
            .map(|batch| async move {
                cancel.check()?;
                let vectors = embedder.embed_batch(batch).await?;
                check_batch(&vectors, batch.len(), dim)?;
                Ok::<_, RagsyncError>(vectors)
            })
            .buffered(self.settings.embed_concurrency)
            .try_collect()
            .await?;

        Ok(batches.into_iter().flatten().collect())
    }

    /// Rows in the search store
    pub async fn count(&self) -> Result<i64> {
        search::count(&self.db).await
    }

    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<SearchResult>> {
        search::search_text(&self.db, self.embedder.as_ref(), self.cache.as_ref(), query, options).await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let chunk_rows = chunk_store::count(&self.db).await?;
        let search_rows = search_store::count(&self.db).await?;
        let files = chunk_store::list_known_files(&self.db).await?.len();
        let index = self
            .db
            .with_connection(|conn| index::index_info(conn, SEARCH_TABLE))
            .await?;

        Ok(StoreStats {
            chunk_rows,
            search_rows,
            files,
            index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashingEmbedder;
    use crate::ingest::processed_file_name;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const DIM: usize = 64;

    /// Hashing embedder that fails any batch containing "POISON"
    struct PoisonEmbedder {
        inner: HashingEmbedder,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for PoisonEmbedder {
        fn model_id(&self) -> &str {
            "poison"
        }

        fn dimension(&self) -> usize {
            DIM
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if texts.iter().any(|t| t.contains("POISON")) {
                return Err(RagsyncError::Embedding("service rejected batch".to_string()));
            }
            self.inner.embed_batch(texts).await
        }
    }

    /// Returns one vector too few
    struct ShortEmbedder;

    #[async_trait]
    impl Embedder for ShortEmbedder {
        fn model_id(&self) -> &str {
            "short"
        }

        fn dimension(&self) -> usize {
            DIM
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(vec![vec![0.5; DIM]; texts.len().saturating_sub(1)])
        }
    }

    struct Fixture {
        _temp: TempDir,
        source: PathBuf,
        processed: PathBuf,
        pipeline: Pipeline,
    }

    async fn fixture(embedder: Arc<dyn Embedder>, batch_size: usize) -> Fixture {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("source");
        let processed = temp.path().join("processed");
        fs::create_dir_all(&source).unwrap();

        let settings = PipelineSettings {
            embed_batch_size: batch_size,
            processed_dir: processed.clone(),
            ..PipelineSettings::default()
        };
        let pipeline = Pipeline::new(Db::new(temp.path().join("test.db")), embedder, settings).unwrap();
        pipeline
            .ensure_schema(&Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations"))
            .await
            .unwrap();

        Fixture {
            _temp: temp,
            source,
            processed,
            pipeline,
        }
    }

    impl Fixture {
        fn write(&self, rel: &str, content: &str) {
            let path = self.source.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(path, content).unwrap();
        }

        fn processed_copy(&self, rel: &str) -> PathBuf {
            let root = self.source.canonicalize().unwrap();
            self.processed.join(processed_file_name(&root, &root.join(rel)))
        }
    }

    fn request(f: &Fixture, incremental: bool) -> IndexRequest {
        IndexRequest {
            source_dir: f.source.clone(),
            processed_dir: f.processed.clone(),
            chunk_size: 40,
            chunk_overlap: 10,
            incremental,
        }
    }

    fn hashing() -> Arc<dyn Embedder> {
        Arc::new(HashingEmbedder::new("hashing-v1", DIM))
    }

    #[tokio::test]
    async fn test_index_and_count() {
        let f = fixture(hashing(), 4).await;
        fs::write(f.source.join("a.md"), "# Alpha\n\nThe alpha service handles login.\nIt also handles logout.\n").unwrap();
        fs::write(f.source.join("b.txt"), "Beta notes about caching layers.\n").unwrap();

        let report = f.pipeline.index(request(&f, true)).await;
        assert!(report.success, "{:?}", report.error);
        assert_eq!(report.document_count, 2);
        assert_eq!(report.failed_files, 0);
        assert!(report.chunk_count >= 3);
        assert_eq!(report.search_rows, report.chunk_count);
        assert_eq!(f.pipeline.count().await.unwrap(), report.chunk_count as i64);

        let registry = FingerprintRegistry::load(&f.processed).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(f.processed_copy("a.md").exists());
        assert!(f.processed_copy("b.txt").exists());
    }

    #[tokio::test]
    async fn test_document_shorter_than_overlap() {
        let f = fixture(hashing(), 4).await;
        f.write("a.md", "Alpha.\n");

        let report = f.pipeline.index(request(&f, true)).await;
        assert!(report.success, "{:?}", report.error);
        assert_eq!(report.document_count, 1);
        assert_eq!(report.chunk_count, 1);
        assert_eq!(f.pipeline.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_lookalike_names_keep_separate_chunks() {
        let f = fixture(hashing(), 4).await;
        f.write("guide/a.md", "Nested guide about deployment.\n");
        f.write("a_guide.md", "Top level guide about monitoring.\n");
        f.write("x.txt", "Plain text about backups.\n");
        f.write("x_txt.md", "Markdown about restores.\n");

        let report = f.pipeline.index(request(&f, true)).await;
        assert!(report.success, "{:?}", report.error);
        assert_eq!(report.document_count, 4);
        assert_eq!(chunk_store::count(f.pipeline.db()).await.unwrap(), report.chunk_count as i64);
        assert_eq!(report.search_rows, report.chunk_count);
        assert_eq!(chunk_store::list_known_files(f.pipeline.db()).await.unwrap().len(), 4);

        // Deleting one lookalike leaves the other's rows in place
        fs::remove_file(f.source.join("guide/a.md")).unwrap();
        let report = f.pipeline.index(request(&f, true)).await;
        assert_eq!(report.deleted_files, 1);
        let per_file = chunk_store::count_by_file(f.pipeline.db()).await.unwrap();
        assert_eq!(per_file.len(), 3);
        assert!(per_file.contains_key(f.processed_copy("a_guide.md").to_string_lossy().as_ref()));
        assert!(!per_file.contains_key(f.processed_copy("guide/a.md").to_string_lossy().as_ref()));
    }

    #[tokio::test]
    async fn test_full_run_rebuilds_registry() {
        let f = fixture(hashing(), 4).await;
        f.write("a.md", "First document.\n");
        f.write("b.md", "Second document.\n");
        assert!(f.pipeline.index(request(&f, false)).await.success);

        fs::remove_file(f.source.join("b.md")).unwrap();
        let report = f.pipeline.index(request(&f, false)).await;
        assert!(report.success, "{:?}", report.error);
        assert_eq!(report.document_count, 1);
        assert_eq!(report.deleted_files, 1);

        let registry = FingerprintRegistry::load(&f.processed).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.paths().all(|p| p.ends_with("a.md")));

        let per_file = chunk_store::count_by_file(f.pipeline.db()).await.unwrap();
        assert_eq!(per_file.len(), 1);
        assert!(per_file.contains_key(f.processed_copy("a.md").to_string_lossy().as_ref()));
        assert!(!f.processed_copy("b.md").exists());
    }

    #[tokio::test]
    async fn test_failed_file_is_counted_and_not_recorded() {
        let embedder = Arc::new(PoisonEmbedder {
            inner: HashingEmbedder::new("hashing-v1", DIM),
            calls: AtomicUsize::new(0),
        });
        let f = fixture(embedder, 8).await;
        fs::write(f.source.join("good.md"), "Healthy document text.\n").unwrap();
        fs::write(f.source.join("bad.md"), "This one is POISON for the model.\n").unwrap();

        let report = f.pipeline.index(request(&f, true)).await;
        assert!(report.success);
        assert_eq!(report.document_count, 1);
        assert_eq!(report.failed_files, 1);

        let registry = FingerprintRegistry::load(&f.processed).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.paths().all(|p| p.ends_with("good.md")));

        // The failed file is retried on the next incremental run
        let again = f.pipeline.index(request(&f, true)).await;
        assert_eq!(again.failed_files, 1);
        assert_eq!(again.unchanged_files, 1);
    }

    #[tokio::test]
    async fn test_short_embedding_response_fails_file() {
        let f = fixture(Arc::new(ShortEmbedder), 8).await;
        fs::write(f.source.join("a.md"), "Some text.\n").unwrap();

        let report = f.pipeline.index(request(&f, false)).await;
        assert!(report.success);
        assert_eq!(report.failed_files, 1);
        assert_eq!(chunk_store::count(f.pipeline.db()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_embedding_batches_keep_chunk_order() {
        let f = fixture(hashing(), 2).await;
        let texts: Vec<String> = (0..7).map(|i| format!("chunk number {}", i)).collect();
        let vectors = f.pipeline.embed_documents(&texts).await.unwrap();

        let plain = HashingEmbedder::new("hashing-v1", DIM);
        assert_eq!(vectors.len(), 7);
        for (text, vector) in texts.iter().zip(&vectors) {
            assert_eq!(vector, &plain.embed_text(text));
        }
    }

    #[tokio::test]
    async fn test_cancelled_run_keeps_live_store_and_registry() {
        let f = fixture(hashing(), 4).await;
        fs::write(f.source.join("a.md"), "First document.\n").unwrap();
        let first = f.pipeline.index(request(&f, true)).await;
        assert!(first.success);
        let rows = f.pipeline.count().await.unwrap();

        fs::write(f.source.join("b.md"), "Second document.\n").unwrap();
        f.pipeline.cancel_flag().cancel();
        let report = f.pipeline.index(request(&f, true)).await;

        assert!(!report.success);
        assert_eq!(report.error.as_deref(), Some("Operation cancelled"));
        assert_eq!(f.pipeline.count().await.unwrap(), rows);
        assert_eq!(FingerprintRegistry::load(&f.processed).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bad_chunking_parameters_reported() {
        let f = fixture(hashing(), 4).await;
        let mut req = request(&f, true);
        req.chunk_overlap = req.chunk_size;

        let report = f.pipeline.index(req).await;
        assert!(!report.success);
        assert!(report.error.unwrap().contains("chunk_overlap"));
    }

    #[tokio::test]
    async fn test_missing_source_dir_reported() {
        let f = fixture(hashing(), 4).await;
        let mut req = request(&f, true);
        req.source_dir = f.source.join("missing");

        let report = f.pipeline.index(req).await;
        assert!(!report.success);
        assert!(report.error.is_some());
    }

    #[tokio::test]
    async fn test_clear() {
        let f = fixture(hashing(), 4).await;
        fs::write(f.source.join("a.md"), "Alpha text for clearing.\n").unwrap();
        let indexed = f.pipeline.index(request(&f, true)).await;
        assert!(indexed.success);

        let report = f.pipeline.clear().await;
        assert!(report.success);
        assert_eq!(report.deleted_count, indexed.chunk_count);
        assert_eq!(f.pipeline.count().await.unwrap(), 0);
        assert!(!FingerprintRegistry::registry_path(&f.processed).exists());

        // Clearing an empty store still succeeds
        let again = f.pipeline.clear().await;
        assert!(again.success);
        assert_eq!(again.deleted_count, 0);
    }

    #[tokio::test]
    async fn test_stats() {
        let f = fixture(hashing(), 4).await;
        fs::write(f.source.join("a.md"), "Stats document.\n").unwrap();
        f.pipeline.index(request(&f, true)).await;

        let stats = f.pipeline.stats().await.unwrap();
        assert_eq!(stats.files, 1);
        assert_eq!(stats.chunk_rows, stats.search_rows);
        let index = stats.index.unwrap();
        assert_eq!(index.row_count as i64, stats.search_rows);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let temp = TempDir::new().unwrap();
        let settings = PipelineSettings {
            embed_batch_size: 0,
            ..PipelineSettings::default()
        };
        assert!(Pipeline::new(Db::new(temp.path().join("x.db")), hashing(), settings).is_err());
    }
}
