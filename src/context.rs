//! Context preparation: turn retrieved documents into a bounded, ranked
//! set of snippets for the model.
//!
//! # Pipeline
//!
//! 1. Re-chunk every candidate document.
//! 2. Keep only the chunks named in `relevant_chunk_ids` (when given). If
//!    that leaves nothing while candidates exist, keep everything.
//! 3. Pull related records: up to three observations sharing a lab's code,
//!    and the component observations of a diagnostic report.
//! 4. Deduplicate by chunk id, first occurrence wins.
//! 5. Sort by source document date, newest first; undated records last.
//! 6. Truncate to the chunk budget.
//! 7. Rerank against the query when enabled for the active model. If
//!    nothing survives, keep a prefix of the step 6 order.
//! 8. Report the documents whose chunks survived.
//!
//! Neither reranking nor the related-record lookup can fail the call; both
//! degrade to the output of the previous step.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use clinical_rag_core::chunk::{chunk_document, ChunkingParams};
use clinical_rag_core::models::{Chunk, ChunkMetadata, ClinicalDocument};
use clinical_rag_core::store::{RelatedDocuments, RELATED_OBSERVATION_LIMIT};

use crate::config::{ModelConfig, RerankConfig, RetrievalConfig};
use crate::llm::ChatProvider;
use crate::rerank::{LlmReranker, RerankOptions};

/// The model a reranking pass should use.
#[derive(Clone, Copy)]
pub struct RerankStage<'a> {
    pub provider: &'a dyn ChatProvider,
    pub model: &'a ModelConfig,
    pub config: &'a RerankConfig,
}

impl RerankStage<'_> {
    /// Whether this stage should run at all for the active model.
    fn is_active(&self) -> bool {
        self.config.enabled && self.model.is_enabled() && !self.model.disable_reranking
    }
}

pub struct PrepareOptions<'a> {
    pub chunk_budget: usize,
    pub include_related: bool,
    pub query: Option<&'a str>,
    pub rerank: Option<RerankStage<'a>>,
    pub chunking: ChunkingParams,
}

impl<'a> PrepareOptions<'a> {
    pub fn from_config(retrieval: &RetrievalConfig, chunking: ChunkingParams) -> Self {
        Self {
            chunk_budget: retrieval.chunk_budget,
            include_related: retrieval.include_related,
            query: None,
            rerank: None,
            chunking,
        }
    }

    pub fn with_query(mut self, query: &'a str) -> Self {
        self.query = Some(query);
        self
    }

    pub fn with_rerank(mut self, stage: RerankStage<'a>) -> Self {
        self.rerank = Some(stage);
        self
    }
}

/// Output of [`prepare_context`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PreparedDocuments {
    /// Snippet texts in final rank order.
    pub texts: Vec<String>,
    /// Chunk id of each entry in `texts`.
    pub chunk_ids: Vec<String>,
    /// Source documents of the surviving snippets, in first-snippet order.
    pub documents: Vec<ClinicalDocument>,
    /// Number of deduplicated snippets before truncation.
    pub total_count: usize,
    pub reranking_applied: bool,
}

struct Candidate {
    chunk: Chunk,
    metadata: ChunkMetadata,
    date: Option<DateTime<Utc>>,
}

/// Run the preparation pipeline over `documents`.
pub async fn prepare_context(
    documents: &[ClinicalDocument],
    relevant_chunk_ids: &[String],
    related: Option<&dyn RelatedDocuments>,
    options: &PrepareOptions<'_>,
) -> PreparedDocuments {
    let mut sources: HashMap<String, ClinicalDocument> = documents
        .iter()
        .map(|d| (d.id.clone(), d.clone()))
        .collect();

    // 1. chunk universe
    let universe: Vec<Candidate> = documents
        .iter()
        .flat_map(|d| candidates_for(d, &options.chunking))
        .collect();

    // 2. exact-chunk filter
    let mut selected = filter_relevant(universe, relevant_chunk_ids);

    // 3. related records
    if options.include_related {
        if let Some(lookup) = related {
            for doc in fetch_related(lookup, documents).await {
                selected.extend(candidates_for(&doc, &options.chunking));
                sources.entry(doc.id.clone()).or_insert(doc);
            }
        }
    }

    // 4. dedup
    let mut seen = HashSet::new();
    selected.retain(|c| seen.insert(c.chunk.id.clone()));

    // 5. newest first; None sorts below every date
    selected.sort_by(|a, b| b.date.cmp(&a.date));

    // 6. budget
    let total_count = selected.len();
    selected.truncate(options.chunk_budget);

    // 7. rerank
    let mut reranking_applied = false;
    if let (Some(stage), Some(query)) = (options.rerank, options.query) {
        if stage.is_active() && !query.trim().is_empty() && !selected.is_empty() {
            let (kept, applied) = rerank_candidates(stage, query, selected).await;
            selected = kept;
            reranking_applied = applied;
        }
    }

    // 8. surviving sources
    let mut documents_out = Vec::new();
    let mut emitted = HashSet::new();
    for c in &selected {
        if emitted.insert(c.metadata.document_id.clone()) {
            if let Some(doc) = sources.get(&c.metadata.document_id) {
                documents_out.push(doc.clone());
            }
        }
    }

    tracing::debug!(
        candidates = documents.len(),
        total = total_count,
        kept = selected.len(),
        reranked = reranking_applied,
        "context prepared"
    );

    PreparedDocuments {
        chunk_ids: selected.iter().map(|c| c.chunk.id.clone()).collect(),
        texts: selected.into_iter().map(|c| c.chunk.text).collect(),
        documents: documents_out,
        total_count,
        reranking_applied,
    }
}

fn candidates_for(doc: &ClinicalDocument, params: &ChunkingParams) -> Vec<Candidate> {
    let date = doc.date();
    let (chunks, metadata) = chunk_document(doc, params).into_parts();
    chunks
        .into_iter()
        .zip(metadata)
        .map(|(chunk, metadata)| Candidate {
            chunk,
            metadata,
            date,
        })
        .collect()
}

fn filter_relevant(universe: Vec<Candidate>, relevant_chunk_ids: &[String]) -> Vec<Candidate> {
    if relevant_chunk_ids.is_empty() {
        return universe;
    }
    let wanted: HashSet<&str> = relevant_chunk_ids.iter().map(String::as_str).collect();
    let (kept, rest): (Vec<Candidate>, Vec<Candidate>) = universe.into_iter().partition(|c| {
        wanted.contains(c.chunk.id.as_str()) || wanted.contains(c.metadata.chunk_id().as_str())
    });
    if kept.is_empty() && !rest.is_empty() {
        tracing::debug!(
            chunks = rest.len(),
            "no candidate chunk matched the relevant ids, keeping all"
        );
        return rest;
    }
    kept
}

async fn fetch_related(
    lookup: &dyn RelatedDocuments,
    documents: &[ClinicalDocument],
) -> Vec<ClinicalDocument> {
    let mut out = Vec::new();
    for doc in documents {
        let found = if doc.is_lab_observation() {
            lookup
                .related_observations(doc, RELATED_OBSERVATION_LIMIT)
                .await
        } else if doc.is_diagnostic_report() {
            lookup.report_components(doc).await
        } else {
            continue;
        };
        match found {
            Ok(docs) => out.extend(docs),
            Err(e) => {
                tracing::warn!(document_id = %doc.id, error = %e, "related record lookup failed");
            }
        }
    }
    out
}

/// Rerank `candidates`, returning the survivors and whether they are in
/// reranked order.
async fn rerank_candidates(
    stage: RerankStage<'_>,
    query: &str,
    candidates: Vec<Candidate>,
) -> (Vec<Candidate>, bool) {
    let texts: Vec<String> = candidates.iter().map(|c| c.chunk.text.clone()).collect();
    let reranker = LlmReranker::new(stage.provider, stage.model, RerankOptions::from(stage.config));
    let result = reranker.rerank(query, &texts).await;

    if !result.reranking_applied {
        return (candidates, false);
    }

    let mut slots: Vec<Option<Candidate>> = candidates.into_iter().map(Some).collect();
    let survivors: Vec<Candidate> = result
        .documents
        .iter()
        .filter_map(|d| slots.get_mut(d.source_index).and_then(Option::take))
        .collect();

    if survivors.is_empty() {
        let prefix = stage.config.fallback_prefix.max(1);
        tracing::warn!(prefix, "reranking kept nothing, using the unranked prefix");
        let fallback: Vec<Candidate> = slots.into_iter().flatten().take(prefix).collect();
        return (fallback, false);
    }
    (survivors, true)
}
