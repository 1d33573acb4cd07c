//! SQLite-backed collaborators.
//!
//! [`SqliteDocumentStore`] keeps clinical documents in the `documents` table
//! and answers related-document lookups. [`SqliteVectorIndex`] keeps one row
//! per chunk id in `chunk_vectors`; writes are `ON CONFLICT(chunk_id)`
//! upserts, so re-indexing a document overwrites its rows in place.
//!
//! Vector search is brute force: every vector of the active embedding model
//! is scored with cosine similarity in Rust, as the personal-record corpus
//! this targets stays small.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use clinical_rag_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob, Embedder};
use clinical_rag_core::models::{
    parse_clinical_date, Chunk, ChunkMetadata, ClinicalDocument, DataRecord, RESOURCE_OBSERVATION,
};
use clinical_rag_core::store::{
    component_references, matches_reference, shares_code, ChangeFeed, DocumentChange,
    DocumentStore, RelatedDocuments, SimilarityQuery, VectorHit, VectorIndex,
};

const DOCUMENT_COLUMNS: &str = "id, user_id, connection_id, format, content_type, resource_type, raw_json, versions_json, metadata_json";

/// Document store over the `documents` table.
pub struct SqliteDocumentStore {
    pool: SqlitePool,
    feed: ChangeFeed,
}

impl SqliteDocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            feed: ChangeFeed::new(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn user_observations(&self, user_id: &str) -> Result<Vec<ClinicalDocument>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE user_id = ? AND resource_type = ? ORDER BY doc_date DESC, id",
            DOCUMENT_COLUMNS
        ))
        .bind(user_id)
        .bind(RESOURCE_OBSERVATION)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_document).collect()
    }
}

fn row_to_document(row: &SqliteRow) -> Result<ClinicalDocument> {
    let id: String = row.try_get("id")?;
    let raw_json: String = row.try_get("raw_json")?;
    let versions_json: String = row.try_get("versions_json")?;
    let metadata_json: Option<String> = row.try_get("metadata_json")?;

    let raw = serde_json::from_str(&raw_json)
        .with_context(|| format!("corrupt raw_json for document {}", id))?;
    let version_history = serde_json::from_str(&versions_json)
        .with_context(|| format!("corrupt versions_json for document {}", id))?;
    let metadata = metadata_json
        .map(|m| serde_json::from_str(&m))
        .transpose()
        .with_context(|| format!("corrupt metadata_json for document {}", id))?;

    Ok(ClinicalDocument {
        id,
        user_id: row.try_get("user_id")?,
        connection_id: row.try_get("connection_id")?,
        data_record: DataRecord {
            raw,
            format: row.try_get("format")?,
            content_type: row.try_get("content_type")?,
            resource_type: row.try_get("resource_type")?,
            version_history,
        },
        metadata,
    })
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn find(&self, offset: usize, limit: usize) -> Result<Vec<ClinicalDocument>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM documents ORDER BY id LIMIT ? OFFSET ?",
            DOCUMENT_COLUMNS
        ))
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_document).collect()
    }

    async fn find_one(&self, id: &str) -> Result<Option<ClinicalDocument>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn count(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    async fn bulk_upsert(&self, docs: &[ClinicalDocument]) -> Result<usize> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        for doc in docs {
            let metadata_json = doc
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let doc_date = doc
                .metadata
                .as_ref()
                .and_then(|m| m.date.as_deref())
                .and_then(parse_clinical_date)
                .map(|d| d.to_rfc3339());

            sqlx::query(
                r#"
                INSERT INTO documents (id, user_id, connection_id, format, content_type, resource_type, raw_json, versions_json, metadata_json, doc_date, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    user_id = excluded.user_id,
                    connection_id = excluded.connection_id,
                    format = excluded.format,
                    content_type = excluded.content_type,
                    resource_type = excluded.resource_type,
                    raw_json = excluded.raw_json,
                    versions_json = excluded.versions_json,
                    metadata_json = excluded.metadata_json,
                    doc_date = excluded.doc_date,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&doc.id)
            .bind(&doc.user_id)
            .bind(&doc.connection_id)
            .bind(&doc.data_record.format)
            .bind(&doc.data_record.content_type)
            .bind(&doc.data_record.resource_type)
            .bind(serde_json::to_string(&doc.data_record.raw)?)
            .bind(serde_json::to_string(&doc.data_record.version_history)?)
            .bind(metadata_json)
            .bind(doc_date)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        if !docs.is_empty() {
            self.feed
                .publish(DocumentChange::Upserted(docs.iter().map(|d| d.id.clone()).collect()));
        }
        Ok(docs.len())
    }

    fn watch(&self) -> BoxStream<'static, DocumentChange> {
        self.feed.subscribe()
    }
}

#[async_trait]
impl RelatedDocuments for SqliteDocumentStore {
    async fn related_observations(
        &self,
        doc: &ClinicalDocument,
        limit: usize,
    ) -> Result<Vec<ClinicalDocument>> {
        if doc.codes().is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .user_observations(&doc.user_id)
            .await?
            .into_iter()
            .filter(|d| d.id != doc.id && shares_code(doc, d))
            .take(limit)
            .collect())
    }

    async fn report_components(&self, report: &ClinicalDocument) -> Result<Vec<ClinicalDocument>> {
        let refs = component_references(report);
        if refs.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .user_observations(&report.user_id)
            .await?
            .into_iter()
            .filter(|d| matches_reference(d, &refs))
            .collect())
    }
}

/// Vector index over the `chunk_vectors` table.
pub struct SqliteVectorIndex {
    pool: SqlitePool,
    embedder: Arc<dyn Embedder>,
}

impl SqliteVectorIndex {
    pub fn new(pool: SqlitePool, embedder: Arc<dyn Embedder>) -> Self {
        Self { pool, embedder }
    }

    /// Stored `(hash, model)` per chunk id, for the given ids.
    async fn stored_hashes(&self, chunks: &[Chunk]) -> Result<HashMap<String, (String, String)>> {
        let mut out = HashMap::new();
        for chunk in chunks {
            let row = sqlx::query("SELECT hash, model FROM chunk_vectors WHERE chunk_id = ?")
                .bind(&chunk.id)
                .fetch_optional(&self.pool)
                .await?;
            if let Some(row) = row {
                out.insert(chunk.id.clone(), (row.try_get("hash")?, row.try_get("model")?));
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn add_texts(&self, chunks: &[Chunk], metadata: &[ChunkMetadata]) -> Result<Vec<String>> {
        if chunks.len() != metadata.len() {
            bail!(
                "chunk/metadata length mismatch: {} chunks, {} metadata",
                chunks.len(),
                metadata.len()
            );
        }
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let model = self.embedder.model_name().to_string();
        let stored = self.stored_hashes(chunks).await?;
        let stale: Vec<usize> = chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| {
                stored
                    .get(&c.id)
                    .map(|(hash, m)| *hash != c.hash || *m != model)
                    .unwrap_or(true)
            })
            .map(|(i, _)| i)
            .collect();

        let texts: Vec<String> = stale.iter().map(|&i| chunks[i].text.clone()).collect();
        let vectors = if texts.is_empty() {
            Vec::new()
        } else {
            self.embedder.embed(&texts).await?
        };
        if vectors.len() != texts.len() {
            bail!("embedder returned {} vectors for {} texts", vectors.len(), texts.len());
        }
        let mut fresh: HashMap<usize, Vec<f32>> = stale.into_iter().zip(vectors).collect();

        let mut tx = self.pool.begin().await?;
        for (i, (chunk, meta)) in chunks.iter().zip(metadata).enumerate() {
            let metadata_json = serde_json::to_string(meta)?;
            match fresh.remove(&i) {
                Some(vector) => {
                    sqlx::query(
                        r#"
                        INSERT INTO chunk_vectors (chunk_id, document_id, user_id, text, metadata_json, hash, model, dims, embedding)
                        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                        ON CONFLICT(chunk_id) DO UPDATE SET
                            document_id = excluded.document_id,
                            user_id = excluded.user_id,
                            text = excluded.text,
                            metadata_json = excluded.metadata_json,
                            hash = excluded.hash,
                            model = excluded.model,
                            dims = excluded.dims,
                            embedding = excluded.embedding
                        "#,
                    )
                    .bind(&chunk.id)
                    .bind(&meta.document_id)
                    .bind(&meta.user_id)
                    .bind(&chunk.text)
                    .bind(metadata_json)
                    .bind(&chunk.hash)
                    .bind(&model)
                    .bind(vector.len() as i64)
                    .bind(vec_to_blob(&vector))
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    sqlx::query("UPDATE chunk_vectors SET metadata_json = ? WHERE chunk_id = ?")
                        .bind(metadata_json)
                        .bind(&chunk.id)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        tx.commit().await?;

        Ok(chunks.iter().map(|c| c.id.clone()).collect())
    }

    async fn remove_stale_chunks(&self, document_id: &str, keep: &[String]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let existing: Vec<String> =
            sqlx::query_scalar("SELECT chunk_id FROM chunk_vectors WHERE document_id = ?")
                .bind(document_id)
                .fetch_all(&mut *tx)
                .await?;
        let mut removed = 0;
        for chunk_id in existing.iter().filter(|id| !keep.contains(id)) {
            sqlx::query("DELETE FROM chunk_vectors WHERE chunk_id = ?")
                .bind(chunk_id)
                .execute(&mut *tx)
                .await?;
            removed += 1;
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn similarity_search(&self, query: &SimilarityQuery) -> Result<Vec<VectorHit>> {
        if query.k == 0 || query.query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let query_vec = self
            .embedder
            .embed(std::slice::from_ref(&query.query))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))?;

        let rows = match &query.user_id {
            Some(user) => {
                sqlx::query(
                    "SELECT chunk_id, metadata_json, embedding FROM chunk_vectors WHERE model = ? AND user_id = ?",
                )
                .bind(self.embedder.model_name())
                .bind(user)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT chunk_id, metadata_json, embedding FROM chunk_vectors WHERE model = ?")
                    .bind(self.embedder.model_name())
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.try_get("embedding")?;
            let metadata_json: String = row.try_get("metadata_json")?;
            hits.push(VectorHit {
                id: row.try_get("chunk_id")?,
                metadata: serde_json::from_str(&metadata_json)?,
                score: cosine_similarity(&query_vec, &blob_to_vec(&blob)),
            });
        }

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
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }
}
