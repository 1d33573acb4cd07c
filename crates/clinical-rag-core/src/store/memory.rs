//! In-memory collaborator implementations for tests and embedding.
//!
//! Uses `BTreeMap`s behind `std::sync::RwLock`. Locks are never held across
//! an `.await`: embeddings are computed first, then written in one step.
//! Vector search is brute-force cosine similarity over every stored vector.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::embedding::{cosine_similarity, Embedder};
use crate::models::{Chunk, ChunkMetadata, ClinicalDocument};

use super::{
    component_references, matches_reference, shares_code, ChangeFeed, DocumentChange,
    DocumentStore, RelatedDocuments, SimilarityQuery, VectorHit, VectorIndex,
};

/// Document store backed by a map keyed by document id.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    docs: RwLock<BTreeMap<String, ClinicalDocument>>,
    feed: ChangeFeed,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-filled with `docs`.
    pub fn with_documents(docs: Vec<ClinicalDocument>) -> Self {
        let store = Self::new();
        if let Ok(mut map) = store.docs.write() {
            for d in docs {
                map.insert(d.id.clone(), d);
            }
        }
        store
    }

    fn snapshot(&self) -> Result<Vec<ClinicalDocument>> {
        let docs = self.docs.read().map_err(|_| anyhow!("document store lock poisoned"))?;
        Ok(docs.values().cloned().collect())
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn find(&self, offset: usize, limit: usize) -> Result<Vec<ClinicalDocument>> {
        let docs = self.docs.read().map_err(|_| anyhow!("document store lock poisoned"))?;
        Ok(docs.values().skip(offset).take(limit).cloned().collect())
    }

    async fn find_one(&self, id: &str) -> Result<Option<ClinicalDocument>> {
        let docs = self.docs.read().map_err(|_| anyhow!("document store lock poisoned"))?;
        Ok(docs.get(id).cloned())
    }

    async fn count(&self) -> Result<usize> {
        let docs = self.docs.read().map_err(|_| anyhow!("document store lock poisoned"))?;
        Ok(docs.len())
    }

    async fn bulk_upsert(&self, incoming: &[ClinicalDocument]) -> Result<usize> {
        {
            let mut docs = self
                .docs
                .write()
                .map_err(|_| anyhow!("document store lock poisoned"))?;
            for d in incoming {
                docs.insert(d.id.clone(), d.clone());
            }
        }
        if !incoming.is_empty() {
            self.feed.publish(DocumentChange::Upserted(
                incoming.iter().map(|d| d.id.clone()).collect(),
            ));
        }
        Ok(incoming.len())
    }

    fn watch(&self) -> BoxStream<'static, DocumentChange> {
        self.feed.subscribe()
    }
}

#[async_trait]
impl RelatedDocuments for InMemoryDocumentStore {
    async fn related_observations(
        &self,
        doc: &ClinicalDocument,
        limit: usize,
    ) -> Result<Vec<ClinicalDocument>> {
        if doc.codes().is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .snapshot()?
            .into_iter()
            .filter(|d| d.id != doc.id && d.user_id == doc.user_id && d.is_lab_observation())
            .filter(|d| shares_code(doc, d))
            .take(limit)
            .collect())
    }

    async fn report_components(&self, report: &ClinicalDocument) -> Result<Vec<ClinicalDocument>> {
        let refs = component_references(report);
        if refs.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .snapshot()?
            .into_iter()
            .filter(|d| d.user_id == report.user_id && matches_reference(d, &refs))
            .collect())
    }
}

struct IndexedChunk {
    text_hash: String,
    metadata: ChunkMetadata,
    vector: Vec<f32>,
}

/// Vector index holding embeddings in memory.
pub struct InMemoryVectorIndex {
    embedder: Arc<dyn Embedder>,
    entries: RwLock<BTreeMap<String, IndexedChunk>>,
}

impl InMemoryVectorIndex {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn add_texts(&self, chunks: &[Chunk], metadata: &[ChunkMetadata]) -> Result<Vec<String>> {
        if chunks.len() != metadata.len() {
            bail!(
                "chunk/metadata length mismatch: {} chunks, {} metadata",
                chunks.len(),
                metadata.len()
            );
        }

        // Only re-embed chunks whose text changed.
        let stale: Vec<usize> = {
            let entries = self
                .entries
                .read()
                .map_err(|_| anyhow!("vector index lock poisoned"))?;
            chunks
                .iter()
                .enumerate()
                .filter(|(_, c)| {
                    entries
                        .get(&c.id)
                        .map(|e| e.text_hash != c.hash)
                        .unwrap_or(true)
                })
                .map(|(i, _)| i)
                .collect()
        };
        let texts: Vec<String> = stale.iter().map(|&i| chunks[i].text.clone()).collect();
        let vectors = if texts.is_empty() {
            Vec::new()
        } else {
            self.embedder.embed(&texts).await?
        };
        if vectors.len() != texts.len() {
            bail!("embedder returned {} vectors for {} texts", vectors.len(), texts.len());
        }

        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow!("vector index lock poisoned"))?;
        let mut fresh: HashMap<usize, Vec<f32>> = stale.into_iter().zip(vectors).collect();
        for (i, (chunk, meta)) in chunks.iter().zip(metadata).enumerate() {
            match fresh.remove(&i) {
                Some(vector) => {
                    entries.insert(
                        chunk.id.clone(),
                        IndexedChunk {
                            text_hash: chunk.hash.clone(),
                            metadata: meta.clone(),
                            vector,
                        },
                    );
                }
                None => {
                    if let Some(entry) = entries.get_mut(&chunk.id) {
                        entry.metadata = meta.clone();
                    }
                }
            }
        }
        Ok(chunks.iter().map(|c| c.id.clone()).collect())
    }

    async fn remove_stale_chunks(&self, document_id: &str, keep: &[String]) -> Result<usize> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow!("vector index lock poisoned"))?;
        let before = entries.len();
        entries.retain(|id, e| e.metadata.document_id != document_id || keep.contains(id));
        Ok(before - entries.len())
    }

    async fn similarity_search(&self, query: &SimilarityQuery) -> Result<Vec<VectorHit>> {
        if query.k == 0 {
            return Ok(Vec::new());
        }
        let query_vec = self
            .embedder
            .embed(std::slice::from_ref(&query.query))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("embedder returned no vector for the query"))?;

        let entries = self
            .entries
            .read()
            .map_err(|_| anyhow!("vector index lock poisoned"))?;
        let mut hits: Vec<VectorHit> = entries
            .iter()
            .filter(|(_, e)| {
                query
                    .user_id
                    .as_deref()
                    .map_or(true, |u| e.metadata.user_id == u)
            })
            .map(|(id, e)| VectorHit {
                id: id.clone(),
                metadata: e.metadata.clone(),
                score: cosine_similarity(&query_vec, &e.vector),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(query.k);
        Ok(hits)
    }

    async fn count(&self) -> Result<usize> {
        let entries = self
            .entries
            .read()
            .map_err(|_| anyhow!("vector index lock poisoned"))?;
        Ok(entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk_document, ChunkingParams};
    use crate::embedding::HashEmbedder;
    use crate::models::{CodeRef, DataRecord, DocumentMetadata};
    use futures::executor::block_on;
    use futures::StreamExt;
    use serde_json::json;

    fn observation(id: &str, user: &str, code: &str, text: &str) -> ClinicalDocument {
        ClinicalDocument {
            id: id.to_string(),
            user_id: user.to_string(),
            connection_id: "conn".to_string(),
            data_record: DataRecord {
                raw: json!({"code": {"text": text}}),
                format: "FHIR.R4".to_string(),
                content_type: "application/fhir+json".to_string(),
                resource_type: "Observation".to_string(),
                version_history: vec![],
            },
            metadata: Some(DocumentMetadata {
                id: Some(format!("src-{}", id)),
                date: None,
                display_name: Some(text.to_string()),
                codes: vec![CodeRef {
                    system: Some("http://loinc.org".to_string()),
                    code: Some(code.to_string()),
                    display: None,
                }],
            }),
        }
    }

    #[test]
    fn test_find_pages_in_id_order() {
        let store = InMemoryDocumentStore::with_documents(vec![
            observation("c", "u", "1", "C"),
            observation("a", "u", "1", "A"),
            observation("b", "u", "1", "B"),
        ]);
        let page = block_on(store.find(1, 5)).unwrap();
        let ids: Vec<&str> = page.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(block_on(store.count()).unwrap(), 3);
        assert!(block_on(store.find_one("zzz")).unwrap().is_none());
    }

    #[test]
    fn test_watch_sees_upserts() {
        let store = InMemoryDocumentStore::new();
        let mut changes = store.watch();
        block_on(store.bulk_upsert(&[observation("a", "u", "1", "A")])).unwrap();
        let change = block_on(changes.next()).unwrap();
        assert_eq!(change, DocumentChange::Upserted(vec!["a".to_string()]));
    }

    #[test]
    fn test_add_texts_is_idempotent() {
        let index = InMemoryVectorIndex::new(Arc::new(HashEmbedder::new(32)));
        let doc = observation("a", "u", "1", "Glucose");
        let set = chunk_document(&doc, &ChunkingParams::default());
        let (chunks, metas) = set.into_parts();
        block_on(index.add_texts(&chunks, &metas)).unwrap();
        let first = block_on(index.count()).unwrap();
        block_on(index.add_texts(&chunks, &metas)).unwrap();
        assert_eq!(block_on(index.count()).unwrap(), first);
        assert_eq!(first, 1);
    }

    #[test]
    fn test_remove_stale_chunks_only_touches_one_document() {
        let index = InMemoryVectorIndex::new(Arc::new(HashEmbedder::new(32)));
        let params = ChunkingParams {
            tile_size: 20,
            tile_overlap: 0,
            ..ChunkingParams::default()
        };
        let mut long = observation("a", "u", "1", "Glucose");
        long.data_record.content_type = "application/xml".to_string();
        long.data_record.raw = json!("<note>fasting glucose measured twice over the morning</note>");
        let (chunks, metas) = chunk_document(&long, &params).into_parts();
        assert!(chunks.len() > 1);
        block_on(index.add_texts(&chunks, &metas)).unwrap();
        let other = observation("b", "u", "1", "ldl");
        let (b_chunks, b_metas) = chunk_document(&other, &params).into_parts();
        block_on(index.add_texts(&b_chunks, &b_metas)).unwrap();

        let keep = vec![chunks[0].id.clone()];
        let removed = block_on(index.remove_stale_chunks("a", &keep)).unwrap();
        assert_eq!(removed, chunks.len() - 1);
        assert_eq!(block_on(index.count()).unwrap(), 1 + b_chunks.len());
        assert_eq!(block_on(index.remove_stale_chunks("a", &keep)).unwrap(), 0);
    }

    #[test]
    fn test_add_texts_rejects_mismatched_lengths() {
        let index = InMemoryVectorIndex::new(Arc::new(HashEmbedder::new(32)));
        let set = chunk_document(&observation("a", "u", "1", "x"), &ChunkingParams::default());
        let (chunks, _) = set.into_parts();
        assert!(block_on(index.add_texts(&chunks, &[])).is_err());
    }

    #[test]
    fn test_similarity_search_ranks_and_filters_by_user() {
        let index = InMemoryVectorIndex::new(Arc::new(HashEmbedder::new(256)));
        for doc in [
            observation("a", "u1", "1", "fasting glucose"),
            observation("b", "u1", "2", "penicillin allergy"),
            observation("c", "u2", "1", "fasting glucose"),
        ] {
            let (chunks, metas) = chunk_document(&doc, &ChunkingParams::default()).into_parts();
            block_on(index.add_texts(&chunks, &metas)).unwrap();
        }
        let query = SimilarityQuery::new("glucose", 5).for_user(Some("u1".to_string()));
        let hits = block_on(index.similarity_search(&query)).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].metadata.document_id, "a");
        assert!(hits[0].score >= hits[1].score);
    }

    #[test]
    fn test_related_observations_share_code_same_user() {
        let base = observation("a", "u", "4548-4", "A1c");
        let store = InMemoryDocumentStore::with_documents(vec![
            base.clone(),
            observation("b", "u", "4548-4", "A1c older"),
            observation("c", "u", "2345-7", "Glucose"),
            observation("d", "other", "4548-4", "A1c"),
        ]);
        let related = block_on(store.related_observations(&base, 3)).unwrap();
        let ids: Vec<&str> = related.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[test]
    fn test_report_components_resolve_references() {
        let mut report = observation("r", "u", "58410-2", "CBC panel");
        report.data_record.resource_type = "DiagnosticReport".to_string();
        report.data_record.raw = json!({
            "result": [{"reference": "Observation/src-b"}, {"reference": "Observation/c"}]
        });
        let store = InMemoryDocumentStore::with_documents(vec![
            report.clone(),
            observation("b", "u", "1", "WBC"),
            observation("c", "u", "2", "RBC"),
            observation("d", "u", "3", "Platelets"),
        ]);
        let comps = block_on(store.report_components(&report)).unwrap();
        let ids: Vec<&str> = comps.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }
}
