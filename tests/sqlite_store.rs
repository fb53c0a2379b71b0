mod common;

use std::sync::Arc;

use sqlx::SqlitePool;
use tempfile::TempDir;

use common::*;
use ragline::config::parse_config;
use ragline::sqlite_store::SqliteStore;
use ragline::trace_sink::{SqliteTraceSink, TraceSink};
use ragline::{db, migrate, CancelToken, Ragline};
use ragline_core::models::{Chunk, Embedding, ProcessingStatus, Scope};
use ragline_core::store::Store;
use ragline_core::trace::{TraceEvent, TracePayload, TraceStage};

async fn open(tmp: &TempDir) -> SqlitePool {
    let pool = db::connect_path(&tmp.path().join("data/ragline.sqlite"))
        .await
        .unwrap();
    migrate::apply_schema(&pool).await.unwrap();
    pool
}

fn chunk_for(doc_id: &str, ordinal: u32, text: &str, owner: Option<&str>) -> Chunk {
    Chunk {
        id: Chunk::derive_id(doc_id, ordinal),
        source_document_id: doc_id.to_string(),
        ordinal,
        text: text.to_string(),
        start_offset: 0,
        end_offset: text.len(),
        owner_scope: owner.map(str::to_string),
    }
}

#[tokio::test]
async fn test_schema_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let pool = open(&tmp).await;
    migrate::apply_schema(&pool).await.unwrap();
    migrate::apply_schema(&pool).await.unwrap();
}

#[tokio::test]
async fn test_versions_are_invisible_until_activated() {
    let tmp = TempDir::new().unwrap();
    let store = SqliteStore::new(open(&tmp).await);

    let v1 = doc("notes.md", Some("team"), "rust v1");
    store.put_document(&v1).await.unwrap();
    store
        .put_chunks(&[chunk_for(&v1.id, 0, "rust v1", Some("team"))])
        .await
        .unwrap();
    assert!(store.scan_by_scope(&Scope::Unscoped).await.unwrap().is_empty());

    assert_eq!(store.activate(&v1.id).await.unwrap(), None);
    assert_eq!(store.scan_by_scope(&Scope::Unscoped).await.unwrap().len(), 1);

    let v2 = doc("notes.md", Some("team"), "rust v2");
    store.put_document(&v2).await.unwrap();
    store
        .put_chunks(&[chunk_for(&v2.id, 0, "rust v2", Some("team"))])
        .await
        .unwrap();
    assert_eq!(store.activate(&v2.id).await.unwrap(), Some(v1.id.clone()));

    let live = store.scan_by_scope(&Scope::owner("team")).await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].text, "rust v2");
    assert!(store.get_document(&v1.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_scope_filters_and_untagged_rows() {
    let tmp = TempDir::new().unwrap();
    let store = SqliteStore::new(open(&tmp).await);

    for (ext, owner) in [("a", Some("alice")), ("b", Some("bob")), ("c", None)] {
        let d = doc(ext, owner, "text");
        store.put_document(&d).await.unwrap();
        store
            .put_chunks(&[chunk_for(&d.id, 0, ext, owner)])
            .await
            .unwrap();
        store.activate(&d.id).await.unwrap();
    }

    let alice = store.scan_by_scope(&Scope::owner("alice")).await.unwrap();
    assert_eq!(alice.len(), 1);
    assert_eq!(alice[0].text, "a");
    assert_eq!(store.scan_by_scope(&Scope::Unscoped).await.unwrap().len(), 3);
    assert!(store
        .scan_by_scope(&Scope::owner("carol"))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_embeddings_replace_per_model_and_filter_by_threshold() {
    let tmp = TempDir::new().unwrap();
    let pool = open(&tmp).await;
    let store = SqliteStore::new(pool.clone());

    let d = doc("a", None, "x");
    store.put_document(&d).await.unwrap();
    let near = chunk_for(&d.id, 0, "near", None);
    let far = chunk_for(&d.id, 1, "far", None);
    store.put_chunks(&[near.clone(), far.clone()]).await.unwrap();
    store.activate(&d.id).await.unwrap();

    store
        .put_embeddings(&[
            Embedding::for_chunk(&near, MODEL, vec![0.0, 1.0]),
            Embedding::for_chunk(&far, MODEL, vec![1.0, 0.0]),
            Embedding::for_chunk(&near, "other", vec![1.0, 0.0]),
        ])
        .await
        .unwrap();
    // Re-embedding with the same model replaces the vector.
    store
        .put_embeddings(&[Embedding::for_chunk(&near, MODEL, vec![1.0, 0.1])])
        .await
        .unwrap();

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 3);

    let matches = store
        .similarity_search(&[1.0, 0.0], MODEL, &Scope::Unscoped, 10, 0.5)
        .await
        .unwrap();
    assert_eq!(matches.len(), 2);
    assert_eq!(matches[0].chunk.id, far.id);
    assert!(matches[0].similarity > matches[1].similarity);

    let top1 = store
        .similarity_search(&[1.0, 0.0], MODEL, &Scope::Unscoped, 1, 0.5)
        .await
        .unwrap();
    assert_eq!(top1.len(), 1);

    let strict = store
        .similarity_search(&[0.0, 1.0], MODEL, &Scope::Unscoped, 10, 0.5)
        .await
        .unwrap();
    assert!(strict.is_empty());
}

#[tokio::test]
async fn test_missing_embeddings_only_lists_live_chunks() {
    let tmp = TempDir::new().unwrap();
    let store = SqliteStore::new(open(&tmp).await);

    let staged = doc("staged", None, "x");
    store.put_document(&staged).await.unwrap();
    store
        .put_chunks(&[chunk_for(&staged.id, 0, "staged", None)])
        .await
        .unwrap();

    let live = doc("live", None, "x");
    store.put_document(&live).await.unwrap();
    let a = chunk_for(&live.id, 0, "a", None);
    let b = chunk_for(&live.id, 1, "b", None);
    store.put_chunks(&[a.clone(), b.clone()]).await.unwrap();
    store
        .put_embeddings(&[Embedding::for_chunk(&a, MODEL, vec![1.0])])
        .await
        .unwrap();
    store.activate(&live.id).await.unwrap();

    let missing = store.chunks_missing_embedding(MODEL, 10).await.unwrap();
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].id, b.id);
    assert_eq!(
        store.chunks_missing_embedding("other", 10).await.unwrap().len(),
        2
    );
    assert_eq!(
        store.chunks_missing_embedding("other", 1).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_status_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let store = SqliteStore::new(open(&tmp).await);
    let d = doc("a", Some("team"), "hello");
    store.put_document(&d).await.unwrap();
    store
        .set_status(&d.id, ProcessingStatus::Failed)
        .await
        .unwrap();

    let loaded = store.get_document(&d.id).await.unwrap().unwrap();
    assert_eq!(loaded.processing_status, ProcessingStatus::Failed);
    assert_eq!(loaded.external_id, "a");
    assert_eq!(loaded.owner_scope.as_deref(), Some("team"));
    assert_eq!(loaded.content_hash, d.content_hash);
    assert_eq!(loaded.created_at.timestamp_micros(), d.created_at.timestamp_micros());
    assert!(store.get_document("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn test_closed_pool_reports_store_unavailable() {
    let tmp = TempDir::new().unwrap();
    let pool = open(&tmp).await;
    let store = SqliteStore::new(pool.clone());
    pool.close().await;

    let err = store.scan_by_scope(&Scope::Unscoped).await.unwrap_err();
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_trace_sink_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let sink = SqliteTraceSink::new(open(&tmp).await);

    let first = TraceEvent::new(
        "c1",
        TracePayload::Cancelled {
            operation: "ingest".into(),
        },
    );
    let second = TraceEvent::new(
        "c2",
        TracePayload::KeywordSearch {
            scope: Scope::owner("team"),
            candidates: 3,
            timed_out: false,
        },
    )
    .with_duration(std::time::Duration::from_millis(12));
    sink.persist_batch(&[first.clone(), second.clone()])
        .await
        .unwrap();

    let recent = sink.recent(10).await.unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].correlation_id, "c2");
    assert_eq!(recent[0].payload, second.payload);
    assert_eq!(recent[0].duration_ms, Some(12));
    assert_eq!(recent[1].stage(), TraceStage::Cancelled);
    assert_eq!(sink.recent(1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_engine_persists_traces_on_shutdown() {
    let tmp = TempDir::new().unwrap();
    let pool = open(&tmp).await;
    let config = parse_config(&format!(
        r#"
[db]
path = "{}/data/ragline.sqlite"

[trace]
persist = true
batch_size = 100
flush_interval_ms = 60000
"#,
        tmp.path().display()
    ))
    .unwrap();

    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool.clone()));
    let sink: Arc<dyn TraceSink> = Arc::new(SqliteTraceSink::new(pool.clone()));
    let engine = Ragline::new(&config, store, Arc::new(TopicEmbedder::new()), Some(sink)).unwrap();

    let cancel = CancelToken::new();
    let outcome = engine
        .ingest(
            doc("a.md", Some("team"), &paragraphs(&["rust sqlite notes", "garden notes"])),
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(outcome.chunks_created, 1);

    let retrieval = engine
        .retrieve("rust", &Scope::owner("team"), &cancel)
        .await
        .unwrap();
    assert_eq!(retrieval.results.len(), 1);
    assert_eq!(engine.recent_traces(1)[0].stage(), TraceStage::Retrieval);
    let buffered = engine.trace_stats().buffered;

    engine.shutdown().await;

    let persisted = SqliteTraceSink::new(pool).recent(100).await.unwrap();
    assert_eq!(persisted.len(), buffered);
    assert_eq!(persisted[0].stage(), TraceStage::Retrieval);
}
