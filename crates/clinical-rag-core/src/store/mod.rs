//! Collaborator abstractions for Clinical RAG.
//!
//! The pipeline never talks to a database directly. It goes through three
//! traits, so the same search and context code runs against SQLite in the
//! app crate and against [`memory`] stores in tests.
//!
//! | Trait | Role |
//! |-------|------|
//! | [`DocumentStore`] | paged `find`, point `find_one`, `count`, `bulk_upsert`, `watch` |
//! | [`VectorIndex`] | `add_texts` (upsert by chunk id) and `similarity_search` |
//! | [`RelatedDocuments`] | related lab observations and diagnostic report components |
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::{BoxStream, StreamExt};
use serde_json::Value;

use crate::models::{Chunk, ChunkMetadata, ClinicalDocument, RESOURCE_OBSERVATION};

/// Default cap on related observations pulled per lab result.
pub const RELATED_OBSERVATION_LIMIT: usize = 3;

/// A change observed through [`DocumentStore::watch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentChange {
    /// Documents with these ids were inserted or replaced.
    Upserted(Vec<String>),
}

/// Fan-out of [`DocumentChange`]s to every live watcher.
///
/// Watchers whose stream was dropped are pruned on the next publish.
#[derive(Default)]
pub struct ChangeFeed {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<DocumentChange>>>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> BoxStream<'static, DocumentChange> {
        let (tx, rx) = mpsc::unbounded();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx.boxed()
    }

    pub fn publish(&self, change: DocumentChange) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|tx| tx.unbounded_send(change.clone()).is_ok());
        }
    }
}

/// A similarity query against a [`VectorIndex`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimilarityQuery {
    pub query: String,
    pub k: usize,
    /// Restrict hits to chunks owned by this user.
    pub user_id: Option<String>,
}

impl SimilarityQuery {
    pub fn new(query: impl Into<String>, k: usize) -> Self {
        Self {
            query: query.into(),
            k,
            user_id: None,
        }
    }

    pub fn for_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }
}

/// One nearest-neighbour hit.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    /// Chunk id.
    pub id: String,
    pub metadata: ChunkMetadata,
    /// Cosine similarity, higher is closer.
    pub score: f32,
}

/// Persistent store of clinical documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// A page of documents in stable id order.
    async fn find(&self, offset: usize, limit: usize) -> Result<Vec<ClinicalDocument>>;

    async fn find_one(&self, id: &str) -> Result<Option<ClinicalDocument>>;

    async fn count(&self) -> Result<usize>;

    /// Insert or replace documents by id. Returns the number written.
    async fn bulk_upsert(&self, docs: &[ClinicalDocument]) -> Result<usize>;

    /// Stream of changes made through this store from now on.
    fn watch(&self) -> BoxStream<'static, DocumentChange>;
}

/// Nearest-neighbour index over chunk texts.
///
/// Writes are keyed by chunk id, so submitting the same chunk twice
/// overwrites rather than duplicates.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Upsert chunks with their metadata; returns the chunk ids written.
    async fn add_texts(&self, chunks: &[Chunk], metadata: &[ChunkMetadata]) -> Result<Vec<String>>;

    /// Drop `document_id`'s chunks whose ids are not in `keep`; returns how
    /// many were removed. Called after a document is re-chunked.
    async fn remove_stale_chunks(&self, document_id: &str, keep: &[String]) -> Result<usize>;

    /// Top-`k` hits sorted by score descending.
    async fn similarity_search(&self, query: &SimilarityQuery) -> Result<Vec<VectorHit>>;

    /// Number of indexed chunks.
    async fn count(&self) -> Result<usize>;
}

/// Vendor-neutral lookup of documents related to a lab result or report.
#[async_trait]
pub trait RelatedDocuments: Send + Sync {
    /// Other observations of the same user sharing at least one code.
    async fn related_observations(
        &self,
        doc: &ClinicalDocument,
        limit: usize,
    ) -> Result<Vec<ClinicalDocument>>;

    /// Observations referenced from a diagnostic report's `result` list.
    async fn report_components(&self, report: &ClinicalDocument) -> Result<Vec<ClinicalDocument>>;
}

/// Source ids of the observations a diagnostic report points at.
///
/// Reads `result[].reference` values of the form `Observation/<id>` from
/// the raw resource (or from its `resource` member for bundle entries).
pub fn component_references(report: &ClinicalDocument) -> Vec<String> {
    let raw = &report.data_record.raw;
    let resource = raw.get("resource").unwrap_or(raw);
    resource
        .get("result")
        .and_then(Value::as_array)
        .map(|results| {
            results
                .iter()
                .filter_map(|r| r.get("reference").and_then(Value::as_str))
                .filter_map(|r| r.strip_prefix("Observation/"))
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Whether `candidate` is a component named by one of `refs`.
pub fn matches_reference(candidate: &ClinicalDocument, refs: &[String]) -> bool {
    if candidate.resource_type() != RESOURCE_OBSERVATION {
        return false;
    }
    let source_id = candidate.metadata.as_ref().and_then(|m| m.id.as_deref());
    refs.iter()
        .any(|r| source_id == Some(r.as_str()) || candidate.id == *r)
}

/// Whether two documents share a non-empty code.
///
/// Systems must agree when both sides carry one.
pub fn shares_code(a: &ClinicalDocument, b: &ClinicalDocument) -> bool {
    let codes = b.codes();
    a.codes().iter().any(|x| {
        codes.iter().any(|y| {
            x.code == y.code
                && (x.system.is_none() || y.system.is_none() || x.system == y.system)
        })
    })
}
