use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use serde_json::json;
use sqlx::SqlitePool;
use tempfile::TempDir;

use clinical_rag::db::connect_path;
use clinical_rag::migrate::apply_schema;
use clinical_rag::sqlite_store::{SqliteDocumentStore, SqliteVectorIndex};
use clinical_rag_core::chunk::{chunk_document, ChunkingParams};
use clinical_rag_core::embedding::{Embedder, HashEmbedder};
use clinical_rag_core::models::{ClinicalDocument, CodeRef, DataRecord, DocumentMetadata};
use clinical_rag_core::store::{
    DocumentChange, DocumentStore, RelatedDocuments, SimilarityQuery, VectorIndex,
};

async fn setup() -> (TempDir, SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let pool = connect_path(&tmp.path().join("data/test.sqlite")).await.unwrap();
    apply_schema(&pool).await.unwrap();
    (tmp, pool)
}

fn observation(id: &str, user: &str, code: &str, date: &str, text: &str) -> ClinicalDocument {
    ClinicalDocument {
        id: id.to_string(),
        user_id: user.to_string(),
        connection_id: "conn1".to_string(),
        data_record: DataRecord {
            raw: json!({"resourceType": "Observation", "id": id, "code": {"text": text}}),
            format: "FHIR.R4".to_string(),
            content_type: "application/fhir+json".to_string(),
            resource_type: "Observation".to_string(),
            version_history: vec![],
        },
        metadata: Some(DocumentMetadata {
            id: Some(id.to_string()),
            date: Some(date.to_string()),
            display_name: Some(text.to_string()),
            codes: vec![CodeRef {
                system: Some("http://loinc.org".to_string()),
                code: Some(code.to_string()),
                display: None,
            }],
        }),
    }
}

fn report(id: &str, results: &[&str]) -> ClinicalDocument {
    let refs: Vec<_> = results
        .iter()
        .map(|r| json!({"reference": format!("Observation/{}", r)}))
        .collect();
    ClinicalDocument {
        id: id.to_string(),
        user_id: "u1".to_string(),
        connection_id: "conn1".to_string(),
        data_record: DataRecord {
            raw: json!({"resourceType": "DiagnosticReport", "result": refs}),
            format: "FHIR.R4".to_string(),
            content_type: "application/fhir+json".to_string(),
            resource_type: "DiagnosticReport".to_string(),
            version_history: vec![],
        },
        metadata: None,
    }
}

/// Hash embedder that counts how many texts it embedded.
struct CountingEmbedder {
    inner: HashEmbedder,
    embedded: AtomicUsize,
}

#[async_trait]
impl Embedder for CountingEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.embedded.fetch_add(texts.len(), Ordering::SeqCst);
        self.inner.embed(texts).await
    }
}

#[tokio::test]
async fn test_document_roundtrip_and_paging() {
    let (_tmp, pool) = setup().await;
    let store = SqliteDocumentStore::new(pool);
    let docs = vec![
        observation("b", "u1", "4548-4", "2024-01-15", "Hemoglobin A1c"),
        observation("a", "u1", "2345-7", "2023-06-01", "Glucose"),
        observation("c", "u1", "2093-3", "2022-02-02", "Cholesterol"),
    ];
    assert_eq!(store.bulk_upsert(&docs).await.unwrap(), 3);
    assert_eq!(store.count().await.unwrap(), 3);

    let found = store.find_one("b").await.unwrap().unwrap();
    assert_eq!(found, docs[0]);
    assert!(store.find_one("zzz").await.unwrap().is_none());

    let page0: Vec<String> = store.find(0, 2).await.unwrap().into_iter().map(|d| d.id).collect();
    let page1: Vec<String> = store.find(2, 2).await.unwrap().into_iter().map(|d| d.id).collect();
    assert_eq!(page0, vec!["a", "b"]);
    assert_eq!(page1, vec!["c"]);
}

#[tokio::test]
async fn test_upsert_replaces_by_id() {
    let (_tmp, pool) = setup().await;
    let store = SqliteDocumentStore::new(pool);
    store
        .bulk_upsert(&[observation("a", "u1", "1", "2020-01-01", "Old")])
        .await
        .unwrap();
    store
        .bulk_upsert(&[observation("a", "u1", "1", "2021-01-01", "New")])
        .await
        .unwrap();
    assert_eq!(store.count().await.unwrap(), 1);
    let doc = store.find_one("a").await.unwrap().unwrap();
    assert_eq!(doc.display_name(), Some("New"));
}

#[tokio::test]
async fn test_watch_reports_upserts() {
    let (_tmp, pool) = setup().await;
    let store = SqliteDocumentStore::new(pool);
    let mut changes = store.watch();
    store
        .bulk_upsert(&[observation("a", "u1", "1", "2020-01-01", "A")])
        .await
        .unwrap();

    let change = changes.next().now_or_never().flatten();
    assert_eq!(change, Some(DocumentChange::Upserted(vec!["a".to_string()])));
    assert!(changes.next().now_or_never().is_none());
}

#[tokio::test]
async fn test_related_observations_share_code_and_user() {
    let (_tmp, pool) = setup().await;
    let store = SqliteDocumentStore::new(pool);
    let base = observation("a1c-3", "u1", "4548-4", "2024-03-01", "Hemoglobin A1c");
    store
        .bulk_upsert(&[
            base.clone(),
            observation("a1c-2", "u1", "4548-4", "2023-03-01", "Hemoglobin A1c"),
            observation("a1c-1", "u1", "4548-4", "2022-03-01", "Hemoglobin A1c"),
            observation("a1c-0", "u1", "4548-4", "2021-03-01", "Hemoglobin A1c"),
            observation("other-user", "u2", "4548-4", "2024-03-01", "Hemoglobin A1c"),
            observation("ldl", "u1", "13457-7", "2024-03-01", "LDL"),
        ])
        .await
        .unwrap();

    let related = store.related_observations(&base, 3).await.unwrap();
    let ids: Vec<&str> = related.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["a1c-2", "a1c-1", "a1c-0"]);

    let limited = store.related_observations(&base, 1).await.unwrap();
    assert_eq!(limited.len(), 1);
}

#[tokio::test]
async fn test_report_components_resolve_by_source_id() {
    let (_tmp, pool) = setup().await;
    let store = SqliteDocumentStore::new(pool);
    let panel = report("panel", &["ldl", "hdl"]);
    store
        .bulk_upsert(&[
            panel.clone(),
            observation("ldl", "u1", "13457-7", "2024-03-01", "LDL"),
            observation("hdl", "u1", "2085-9", "2024-03-01", "HDL"),
            observation("a1c", "u1", "4548-4", "2024-03-01", "A1c"),
        ])
        .await
        .unwrap();

    let mut ids: Vec<String> = store
        .report_components(&panel)
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.id)
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["hdl", "ldl"]);
}

#[tokio::test]
async fn test_vector_index_is_idempotent_and_skips_unchanged() {
    let (_tmp, pool) = setup().await;
    let embedder = Arc::new(CountingEmbedder {
        inner: HashEmbedder::new(64),
        embedded: AtomicUsize::new(0),
    });
    let index = SqliteVectorIndex::new(pool, embedder.clone());

    let doc = observation("a", "u1", "1", "2020-01-01", "Glucose fasting");
    let (chunks, meta) = chunk_document(&doc, &ChunkingParams::default()).into_parts();

    let ids = index.add_texts(&chunks, &meta).await.unwrap();
    assert_eq!(ids, vec!["a__chunk_0".to_string()]);
    assert_eq!(index.count().await.unwrap(), 1);
    assert_eq!(embedder.embedded.load(Ordering::SeqCst), 1);

    index.add_texts(&chunks, &meta).await.unwrap();
    assert_eq!(index.count().await.unwrap(), 1);
    assert_eq!(embedder.embedded.load(Ordering::SeqCst), 1);

    let changed = observation("a", "u1", "1", "2020-01-01", "Glucose random");
    let (chunks, meta) = chunk_document(&changed, &ChunkingParams::default()).into_parts();
    index.add_texts(&chunks, &meta).await.unwrap();
    assert_eq!(index.count().await.unwrap(), 1);
    assert_eq!(embedder.embedded.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_remove_stale_chunks_keeps_current_ids() {
    let (_tmp, pool) = setup().await;
    let index = SqliteVectorIndex::new(pool, Arc::new(HashEmbedder::new(64)));
    let params = ChunkingParams {
        tile_size: 20,
        tile_overlap: 0,
        ..ChunkingParams::default()
    };
    let mut long = observation("a", "u1", "1", "2020-01-01", "Glucose");
    long.data_record.content_type = "application/xml".to_string();
    long.data_record.raw = json!("<note>fasting glucose measured twice over the morning</note>");
    let (chunks, meta) = chunk_document(&long, &params).into_parts();
    assert!(chunks.len() > 1);
    index.add_texts(&chunks, &meta).await.unwrap();
    let other = observation("b", "u1", "2", "2020-01-01", "LDL");
    let (b_chunks, b_meta) = chunk_document(&other, &params).into_parts();
    index.add_texts(&b_chunks, &b_meta).await.unwrap();

    let keep = vec!["a__chunk_0".to_string()];
    let removed = index.remove_stale_chunks("a", &keep).await.unwrap();
    assert_eq!(removed, chunks.len() - 1);
    assert_eq!(index.count().await.unwrap(), 2);

    let hits = index
        .similarity_search(&SimilarityQuery::new("glucose", 10))
        .await
        .unwrap();
    let mut ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["a__chunk_0", "b__chunk_0"]);
}

#[tokio::test]
async fn test_similarity_search_ranks_and_filters_by_user() {
    let (_tmp, pool) = setup().await;
    let index = SqliteVectorIndex::new(pool, Arc::new(HashEmbedder::new(256)));
    for doc in [
        observation("mine", "u1", "1", "2020-01-01", "hemoglobin a1c"),
        observation("theirs", "u2", "1", "2020-01-01", "hemoglobin a1c"),
        observation("lipids", "u1", "2", "2020-01-01", "ldl cholesterol"),
    ] {
        let (chunks, meta) = chunk_document(&doc, &ChunkingParams::default()).into_parts();
        index.add_texts(&chunks, &meta).await.unwrap();
    }

    let all = index
        .similarity_search(&SimilarityQuery::new("hemoglobin a1c", 10))
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.windows(2).all(|w| w[0].score >= w[1].score));
    assert_eq!(all[2].metadata.document_id, "lipids");

    let mine = index
        .similarity_search(&SimilarityQuery::new("hemoglobin a1c", 10).for_user(Some("u1".into())))
        .await
        .unwrap();
    assert_eq!(mine.len(), 2);
    assert!(mine.iter().all(|h| h.metadata.user_id == "u1"));
    assert_eq!(mine[0].id, "mine__chunk_0");

    let top = index
        .similarity_search(&SimilarityQuery::new("hemoglobin a1c", 1))
        .await
        .unwrap();
    assert_eq!(top.len(), 1);
}
