//! Document search over a [`VectorIndex`] and a [`DocumentStore`].
//!
//! Similarity hits are chunks; callers want documents. [`search_documents`]
//! resolves every hit's document id with a point lookup, keeps one entry per
//! document, and still reports every chunk id so later stages can filter a
//! document's chunks down to the ones that actually matched.
//!
//! [`iterative_search`] repeats that over several rounds, letting the caller
//! rewrite the terms between rounds, until enough documents are found.

use std::collections::HashSet;

use anyhow::Result;

use crate::models::{ClinicalDocument, SearchResult};
use crate::store::{DocumentStore, SimilarityQuery, VectorIndex};

/// Default number of chunk hits requested per query.
pub const DEFAULT_SEARCH_K: usize = 10;
/// Default number of rounds for [`iterative_search`].
pub const DEFAULT_MAX_ITERATIONS: usize = 3;

/// Per-query retrieval parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchParams {
    /// Number of chunk hits to request.
    pub k: usize,
    /// Restrict hits to this user's chunks.
    pub user_id: Option<String>,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            k: DEFAULT_SEARCH_K,
            user_id: None,
        }
    }
}

/// Options for [`iterative_search`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterativeSearchOptions {
    pub max_iterations: usize,
    /// Stop as soon as at least this many documents are accumulated.
    pub limit: usize,
    pub params: SearchParams,
}

impl Default for IterativeSearchOptions {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            limit: DEFAULT_SEARCH_K,
            params: SearchParams::default(),
        }
    }
}

/// Rewrites the term list before round `n` (1-based for the second round on).
pub type ExpandTerms<'a> = &'a (dyn Fn(&[String], usize) -> Vec<String> + Send + Sync);

/// Run one similarity search and resolve hits to documents.
///
/// Terms are joined with a space into one query. Documents are deduplicated
/// by id in hit order; every hit's chunk id is kept. Hits whose document no
/// longer exists are skipped. Confidence is `1.0` when at least one document
/// resolved, `0.0` otherwise.
pub async fn search_documents<I, S>(
    terms: &[String],
    index: &I,
    store: &S,
    params: &SearchParams,
) -> Result<SearchResult>
where
    I: VectorIndex + ?Sized,
    S: DocumentStore + ?Sized,
{
    let query = terms.join(" ");
    let mut result = SearchResult {
        search_terms: terms.to_vec(),
        ..SearchResult::default()
    };
    if query.trim().is_empty() {
        return Ok(result);
    }

    let hits = index
        .similarity_search(
            &SimilarityQuery::new(query.as_str(), params.k).for_user(params.user_id.clone()),
        )
        .await?;

    let mut seen: HashSet<String> = HashSet::new();
    for hit in hits {
        result.relevant_chunk_ids.push(hit.id.clone());
        let doc_id = hit.metadata.document_id;
        if seen.contains(&doc_id) {
            continue;
        }
        match store.find_one(&doc_id).await? {
            Some(doc) => {
                seen.insert(doc_id);
                result.documents.push(doc);
            }
            None => {
                tracing::debug!(chunk_id = %hit.id, document_id = %doc_id, "hit without document, skipped");
            }
        }
    }

    result.confidence = confidence(&result.documents);
    tracing::debug!(
        query = %query,
        documents = result.documents.len(),
        chunks = result.relevant_chunk_ids.len(),
        "document search"
    );
    Ok(result)
}

/// Multi-round search accumulating documents and chunk ids.
///
/// Round 1 uses `terms` as given. Before each later round `expand` rewrites
/// the previous round's terms; without an expansion function a later round
/// would repeat the first, so the search stops after one round. Stops early
/// once `options.limit` documents are accumulated.
pub async fn iterative_search<I, S>(
    terms: &[String],
    index: &I,
    store: &S,
    options: &IterativeSearchOptions,
    expand: Option<ExpandTerms<'_>>,
) -> Result<SearchResult>
where
    I: VectorIndex + ?Sized,
    S: DocumentStore + ?Sized,
{
    let mut acc = SearchResult::default();
    let mut doc_ids: HashSet<String> = HashSet::new();
    let mut chunk_ids: HashSet<String> = HashSet::new();
    let mut current: Vec<String> = terms.to_vec();

    for round in 0..options.max_iterations.max(1) {
        if round > 0 {
            match expand {
                Some(f) => current = f(&current, round),
                None => break,
            }
            if current.is_empty() {
                break;
            }
        }

        let found = search_documents(&current, index, store, &options.params).await?;
        for term in found.search_terms {
            if !acc.search_terms.contains(&term) {
                acc.search_terms.push(term);
            }
        }
        for id in found.relevant_chunk_ids {
            if chunk_ids.insert(id.clone()) {
                acc.relevant_chunk_ids.push(id);
            }
        }
        for doc in found.documents {
            if doc_ids.insert(doc.id.clone()) {
                acc.documents.push(doc);
            }
        }

        tracing::debug!(round = round + 1, documents = acc.documents.len(), "iterative search round");
        if acc.documents.len() >= options.limit {
            break;
        }
    }

    acc.confidence = confidence(&acc.documents);
    Ok(acc)
}

fn confidence(docs: &[ClinicalDocument]) -> f64 {
    if docs.is_empty() {
        0.0
    } else {
        1.0
    }
}
