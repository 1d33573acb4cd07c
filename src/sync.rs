//! Vector sync engine.
//!
//! Pages through every stored document, chunks each one and submits the
//! chunks to the vector index.
//!
//! ```text
//! NotStarted ──count()──▶ Paging{page, processed, total} ──▶ … ──▶ Done
//!                              │   ▲
//!                              └───┘ one page per step()
//! ```
//!
//! - `total` is captured once, when the first step runs.
//! - A page failure leaves the state untouched; the next `step()` retries
//!   the same page. Nothing is retried automatically.
//! - Stepping after `Done` is a no-op.
//! - Only one step runs at a time. A concurrent `step()` returns the current
//!   state without doing any work; a concurrent `run()` waits for the step
//!   in flight and carries on from the state it left.
//!
//! Indexing is keyed by deterministic chunk id, so a sync can overlap with
//! queries and with later re-syncs without duplicating entries.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use tokio::sync::Mutex as AsyncMutex;

use clinical_rag_core::chunk::{chunk_document, ChunkingParams};
use clinical_rag_core::models::{ChunkSet, ClinicalDocument};
use clinical_rag_core::store::{DocumentChange, DocumentStore, VectorIndex};

use crate::progress::{SyncProgressEvent, SyncProgressReporter};

/// Observable state of a [`VectorSync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    NotStarted,
    Paging {
        /// Next page to fetch (0-based).
        page: usize,
        processed: usize,
        total: usize,
        chunks: usize,
    },
    Done {
        processed: usize,
        total: usize,
        chunks: usize,
    },
}

impl SyncState {
    pub fn is_done(&self) -> bool {
        matches!(self, SyncState::Done { .. })
    }

    /// `(processed, total)`; total is 0 before the first step.
    pub fn progress(&self) -> (usize, usize) {
        match *self {
            SyncState::NotStarted => (0, 0),
            SyncState::Paging {
                processed, total, ..
            }
            | SyncState::Done {
                processed, total, ..
            } => (processed, total),
        }
    }
}

pub struct VectorSync {
    store: Arc<dyn DocumentStore>,
    index: Arc<dyn VectorIndex>,
    params: ChunkingParams,
    page_size: usize,
    state: Mutex<SyncState>,
    /// Held for the duration of one step.
    flight: AsyncMutex<()>,
}

impl VectorSync {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        index: Arc<dyn VectorIndex>,
        params: ChunkingParams,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            index,
            params,
            page_size: page_size.max(1),
            state: Mutex::new(SyncState::NotStarted),
            flight: AsyncMutex::new(()),
        }
    }

    pub fn state(&self) -> Result<SyncState> {
        self.state
            .lock()
            .map(|s| *s)
            .map_err(|_| anyhow!("sync state lock poisoned"))
    }

    fn set_state(&self, next: SyncState) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("sync state lock poisoned"))?;
        *state = next;
        Ok(())
    }

    /// Run one paging cycle and return the resulting state.
    pub async fn step(&self) -> Result<SyncState> {
        let Ok(_flight) = self.flight.try_lock() else {
            tracing::debug!("vector sync already running, skipping");
            return self.state();
        };
        self.step_locked().await
    }

    /// One paging cycle; the caller holds `flight`.
    async fn step_locked(&self) -> Result<SyncState> {
        let (page, processed, total, chunks) = match self.state()? {
            SyncState::Done { .. } => return self.state(),
            SyncState::NotStarted => {
                let total = self.store.count().await?;
                tracing::info!(total, "vector sync started");
                (0, 0, total, 0)
            }
            SyncState::Paging {
                page,
                processed,
                total,
                chunks,
            } => (page, processed, total, chunks),
        };

        if total == 0 {
            let done = SyncState::Done {
                processed: 0,
                total: 0,
                chunks: 0,
            };
            self.set_state(done)?;
            return Ok(done);
        }
        self.set_state(SyncState::Paging {
            page,
            processed,
            total,
            chunks,
        })?;

        let docs = self.store.find(page * self.page_size, self.page_size).await?;
        let indexed = self.index_documents(&docs).await?;

        let processed = processed + docs.len();
        let chunks = chunks + indexed;
        // An empty page means documents vanished since `total` was counted.
        let next = if processed >= total || docs.is_empty() {
            tracing::info!(processed, total, chunks, "vector sync done");
            SyncState::Done {
                processed,
                total,
                chunks,
            }
        } else {
            SyncState::Paging {
                page: page + 1,
                processed,
                total,
                chunks,
            }
        };
        tracing::debug!(page, documents = docs.len(), chunks = indexed, "indexed page");
        self.set_state(next)?;
        Ok(next)
    }

    /// Step until `Done`, reporting each page. Stops at the first error.
    pub async fn run(&self, reporter: &dyn SyncProgressReporter) -> Result<SyncState> {
        loop {
            let state = {
                let _flight = self.flight.lock().await;
                self.step_locked().await?
            };
            match state {
                SyncState::Paging {
                    page,
                    processed,
                    total,
                    ..
                } => reporter.report(SyncProgressEvent::Paging {
                    page: page.saturating_sub(1) as u64,
                    processed: processed as u64,
                    total: total as u64,
                }),
                SyncState::Done {
                    processed, chunks, ..
                } => {
                    reporter.report(SyncProgressEvent::Done {
                        processed: processed as u64,
                        chunks: chunks as u64,
                    });
                    return Ok(state);
                }
                SyncState::NotStarted => return Ok(state),
            }
        }
    }

    /// Index the documents named by a store change notification.
    ///
    /// Returns the number of chunks submitted. Does not touch the paging state.
    pub async fn apply_change(&self, change: DocumentChange) -> Result<usize> {
        let DocumentChange::Upserted(ids) = change;
        let mut docs = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(doc) = self.store.find_one(id).await? {
                docs.push(doc);
            }
        }
        self.index_documents(&docs).await
    }

    /// Upsert the chunks of `docs`, then drop any chunk a document no longer
    /// produces (fewer tiles, a removed CCDA section).
    async fn index_documents(&self, docs: &[ClinicalDocument]) -> Result<usize> {
        let mut set = ChunkSet::new();
        let mut current: Vec<(&str, Vec<String>)> = Vec::with_capacity(docs.len());
        for doc in docs {
            let chunks = chunk_document(doc, &self.params);
            if chunks.is_empty() {
                tracing::debug!(document_id = %doc.id, "no chunks, document not indexed");
            }
            let ids = chunks.chunks().iter().map(|c| c.id.clone()).collect();
            current.push((doc.id.as_str(), ids));
            set.extend(chunks);
        }

        let written = if set.is_empty() {
            0
        } else {
            let (chunks, metadata) = set.into_parts();
            self.index.add_texts(&chunks, &metadata).await?.len()
        };

        for (document_id, keep) in &current {
            let removed = self.index.remove_stale_chunks(document_id, keep).await?;
            if removed > 0 {
                tracing::debug!(document_id, removed, "dropped stale chunks");
            }
        }
        Ok(written)
    }
}
