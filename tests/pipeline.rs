use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use ragsync::db::Db;
use ragsync::embeddings::HashingEmbedder;
use ragsync::error::RagsyncError;
use ragsync::fingerprint::FingerprintRegistry;
use ragsync::ingest::processed_file_name;
use ragsync::search::{search_approx, search_exact, SearchOptions};
use ragsync::store::{chunk_store, search_store, FileIdentity, NewChunk, StoredChunk};
use ragsync::sync::PipelineSettings;
use ragsync::{IndexRequest, Pipeline};
use tempfile::TempDir;

const DIM: usize = 128;

struct Harness {
    _temp: TempDir,
    source: PathBuf,
    processed: PathBuf,
    pipeline: Pipeline,
}

impl Harness {
    async fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("source");
        let processed = temp.path().join("processed");
        fs::create_dir_all(&source).unwrap();

        let settings = PipelineSettings {
            processed_dir: processed.clone(),
            embed_batch_size: 4,
            ..PipelineSettings::default()
        };
        let pipeline = Pipeline::new(
            Db::new(temp.path().join("ragsync.db")),
            Arc::new(HashingEmbedder::new("hashing-v1", DIM)),
            settings,
        )
        .unwrap();
        pipeline
            .ensure_schema(&Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations"))
            .await
            .unwrap();

        Self {
            _temp: temp,
            source,
            processed,
            pipeline,
        }
    }

    fn request(&self, incremental: bool) -> IndexRequest {
        IndexRequest {
            source_dir: self.source.clone(),
            processed_dir: self.processed.clone(),
            chunk_size: 500,
            chunk_overlap: 100,
            incremental,
        }
    }

    fn write(&self, name: &str, content: &str) {
        let path = self.source.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    /// Processed file name of a source path relative to the source root
    fn name(&self, rel: &str) -> String {
        let root = self.source.canonicalize().unwrap();
        processed_file_name(&root, &root.join(rel))
    }

    fn processed_file(&self, rel: &str) -> String {
        self.processed.join(self.name(rel)).to_string_lossy().to_string()
    }

    async fn chunks(&self) -> Vec<StoredChunk> {
        self.pipeline
            .db()
            .with_connection(|conn| chunk_store::read_window(conn, 0, 10_000))
            .await
            .unwrap()
    }
}

fn handbook(topic: &str, paragraphs: usize) -> String {
    let mut doc = format!("# The {} handbook\n\n", topic);
    for i in 0..paragraphs {
        doc.push_str(&format!(
            "Paragraph {} of the {} handbook explains step {} of the {} workflow.\n",
            i, topic, i, topic
        ));
    }
    doc
}

fn exact_options(limit: usize, threshold: f32) -> SearchOptions {
    SearchOptions {
        limit,
        threshold,
        exact: true,
        ..SearchOptions::default()
    }
}

async fn three_file_corpus() -> Harness {
    let h = Harness::new().await;
    h.write("alpha.md", &handbook("alpha", 30));
    h.write("guides/beta.md", &handbook("beta", 12));
    h.write("gamma.txt", "Gamma is a short plain text note about telescopes.\n");

    let report = h.pipeline.index(h.request(true)).await;
    assert!(report.success, "{:?}", report.error);
    assert_eq!(report.document_count, 3);
    h
}

#[tokio::test]
async fn test_three_files_verbatim_chunk_is_top_match() {
    let h = three_file_corpus().await;

    let chunks = h.chunks().await;
    let count = h.pipeline.count().await.unwrap();
    let alpha = h.name("alpha.md");
    assert_eq!(count as usize, chunks.len());
    assert!(chunks.iter().filter(|c| c.filename == alpha).count() > 1);

    let files: Vec<String> = chunk_store::list_known_files(h.pipeline.db())
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.filename)
        .collect();
    assert_eq!(files.len(), 3);
    assert!(files.contains(&h.name("guides/beta.md")));
    assert!(files.contains(&h.name("gamma.txt")));

    let target = chunks.iter().find(|c| c.filename == alpha && c.chunk_index == 1).unwrap();
    let results = h
        .pipeline
        .search(&target.chunk_text, &exact_options(3, 0.5))
        .await
        .unwrap();
    assert_eq!(results[0].id, target.id);
    assert!((results[0].similarity - 1.0).abs() < 1e-4);
    assert_eq!(
        results[0].original_filepath.as_deref(),
        target.original_filepath.as_deref()
    );
    assert!(results[0].original_filepath.as_deref().unwrap().ends_with("alpha.md"));
}

#[tokio::test]
async fn test_chunk_indexes_follow_document_order() {
    let h = three_file_corpus().await;
    let chunks = h.chunks().await;
    let name = h.name("alpha.md");
    let alpha: Vec<&StoredChunk> = chunks.iter().filter(|c| c.filename == name).collect();

    let indexes: Vec<i64> = alpha.iter().map(|c| c.chunk_index).collect();
    assert_eq!(indexes, (0..alpha.len() as i64).collect::<Vec<_>>());
    assert!(alpha[0].chunk_text.starts_with("# The alpha handbook"));
    assert!(alpha.last().unwrap().chunk_text.contains("Paragraph 29"));
}

#[tokio::test]
async fn test_incremental_run_only_touches_changed_file() {
    let h = three_file_corpus().await;
    let before = chunk_store::count_by_file(h.pipeline.db()).await.unwrap();

    h.write("guides/beta.md", "# Beta\n\nZebra migration patterns across the savanna.\n");
    let report = h.pipeline.index(h.request(true)).await;
    assert!(report.success);
    assert_eq!(report.document_count, 1);
    assert_eq!(report.unchanged_files, 2);

    let after = chunk_store::count_by_file(h.pipeline.db()).await.unwrap();
    let alpha = h.processed_file("alpha.md");
    let beta = h.processed_file("guides/beta.md");
    assert_eq!(after.get(&alpha), before.get(&alpha));
    assert_eq!(after.get(&beta), Some(&1));

    let results = h
        .pipeline
        .search("zebra migration patterns", &exact_options(1, 0.0))
        .await
        .unwrap();
    assert_eq!(results[0].filename, h.name("guides/beta.md"));

    // Nothing changed since: nothing to process
    let quiet = h.pipeline.index(h.request(true)).await;
    assert_eq!(quiet.document_count, 0);
    assert_eq!(quiet.unchanged_files, 3);
}

#[tokio::test]
async fn test_deleted_file_leaves_both_stores() {
    let h = three_file_corpus().await;
    fs::remove_file(h.source.join("gamma.txt")).unwrap();

    let report = h.pipeline.index(h.request(true)).await;
    assert!(report.success);
    assert_eq!(report.deleted_files, 1);

    let gamma = h.processed_file("gamma.txt");
    assert!(!chunk_store::count_by_file(h.pipeline.db()).await.unwrap().contains_key(&gamma));
    assert!(!search_store::count_by_file(h.pipeline.db()).await.unwrap().contains_key(&gamma));
    assert!(!Path::new(&gamma).exists());

    let registry = FingerprintRegistry::load(&h.processed).unwrap();
    assert_eq!(registry.len(), 2);
    assert!(!registry.paths().any(|p| p.ends_with("gamma.txt")));
}

#[tokio::test]
async fn test_note_shorter_than_overlap_is_one_chunk() {
    let h = Harness::new().await;
    let note = "A short note under one hundred characters.\n";
    h.write("note.txt", note);

    let report = h.pipeline.index(h.request(true)).await;
    assert!(report.success, "{:?}", report.error);
    assert_eq!(report.chunk_count, 1);

    let chunks = h.chunks().await;
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].chunk_text, note);
    assert_eq!(h.pipeline.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_lookalike_source_paths_are_all_searchable() {
    let h = Harness::new().await;
    h.write("guide/a.md", &handbook("nested", 12));
    h.write("a_guide.md", &handbook("toplevel", 12));

    let report = h.pipeline.index(h.request(true)).await;
    assert!(report.success, "{:?}", report.error);
    assert_eq!(report.document_count, 2);
    assert_eq!(report.search_rows, report.chunk_count);
    assert_ne!(h.name("guide/a.md"), h.name("a_guide.md"));

    let per_file = search_store::count_by_file(h.pipeline.db()).await.unwrap();
    assert_eq!(per_file.len(), 2);
    assert!(per_file.contains_key(&h.processed_file("guide/a.md")));
    assert!(per_file.contains_key(&h.processed_file("a_guide.md")));
}

#[tokio::test]
async fn test_full_rerun_replaces_instead_of_duplicating() {
    let h = three_file_corpus().await;
    let before = h.pipeline.count().await.unwrap();

    let report = h.pipeline.index(h.request(false)).await;
    assert!(report.success);
    assert_eq!(report.document_count, 3);
    assert_eq!(h.pipeline.count().await.unwrap(), before);
}

#[tokio::test]
async fn test_rebuild_is_idempotent() {
    let h = three_file_corpus().await;

    let first = h.pipeline.rebuild().await.unwrap();
    let per_file_first = search_store::count_by_file(h.pipeline.db()).await.unwrap();
    let second = h.pipeline.rebuild().await.unwrap();
    let per_file_second = search_store::count_by_file(h.pipeline.db()).await.unwrap();

    assert_eq!(first.rows, second.rows);
    assert_eq!(per_file_first, per_file_second);
    assert_eq!(per_file_second, chunk_store::count_by_file(h.pipeline.db()).await.unwrap());
}

#[tokio::test]
async fn test_unreachable_threshold_is_empty_success() {
    let h = three_file_corpus().await;
    let chunks = h.chunks().await;

    let mut options = exact_options(5, 1.1);
    assert!(h.pipeline.search(&chunks[0].chunk_text, &options).await.unwrap().is_empty());
    options.exact = false;
    assert!(h.pipeline.search(&chunks[0].chunk_text, &options).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_exact_and_approx_agree_on_top_match() {
    let h = three_file_corpus().await;

    for chunk in h.chunks().await {
        let exact = search_exact(h.pipeline.db(), DIM, &chunk.embedding, 1, 0.0).await.unwrap();
        let approx = search_approx(h.pipeline.db(), DIM, &chunk.embedding, 1, 0.0, None).await.unwrap();
        assert_eq!(exact[0].id, chunk.id);
        assert_eq!(approx[0].id, exact[0].id);
    }
}

#[tokio::test]
async fn test_wrong_dimension_rejected_everywhere() {
    let h = three_file_corpus().await;

    let chunk = NewChunk {
        chunk_text: "short vector".to_string(),
        embedding: vec![0.1; DIM - 1],
        file: FileIdentity {
            filename: "x.md".to_string(),
            filepath: "x.md".to_string(),
            original_filepath: None,
        },
        chunk_index: 0,
    };
    let err = chunk_store::append(h.pipeline.db(), DIM, chunk).await.unwrap_err();
    assert!(matches!(err, RagsyncError::Validation(_)));

    let err = search_exact(h.pipeline.db(), DIM, &[0.5; 3], 5, 0.0).await.unwrap_err();
    assert!(matches!(err, RagsyncError::Validation(_)));
}

#[tokio::test]
async fn test_zero_vector_copied_unnormalized() {
    let h = three_file_corpus().await;
    chunk_store::append(
        h.pipeline.db(),
        DIM,
        NewChunk {
            chunk_text: "...".to_string(),
            embedding: vec![0.0; DIM],
            file: FileIdentity {
                filename: "empty.md".to_string(),
                filepath: "empty.md".to_string(),
                original_filepath: None,
            },
            chunk_index: 0,
        },
    )
    .await
    .unwrap();

    let report = h.pipeline.rebuild().await.unwrap();
    assert_eq!(report.zero_vectors, 1);
    assert_eq!(
        search_store::count_by_file(h.pipeline.db()).await.unwrap().get("empty.md"),
        Some(&1)
    );
}

#[tokio::test]
async fn test_clear_then_reindex() {
    let h = three_file_corpus().await;
    let before = h.pipeline.count().await.unwrap();

    let cleared = h.pipeline.clear().await;
    assert!(cleared.success);
    assert_eq!(cleared.deleted_count as i64, before);
    assert_eq!(h.pipeline.count().await.unwrap(), 0);

    // Registry is gone, so an incremental run processes everything again
    let report = h.pipeline.index(h.request(true)).await;
    assert_eq!(report.document_count, 3);
    assert_eq!(h.pipeline.count().await.unwrap(), before);
}
