//! LLM-judged reranking with dynamic-threshold selection.
//!
//! Snippets are split into batches of `batch_size`. Each batch is sent to
//! the chat model with a prompt asking for a JSON object mapping the
//! 1-based in-batch index to a relevance score from 0 to 10. Batches run
//! concurrently when there are at most `max_concurrent_batches` of them,
//! otherwise one after another.
//!
//! # Failure handling
//!
//! | Failure | Effect |
//! |---------|--------|
//! | response does not decode or validate | retry once with the reason appended |
//! | second decode/validation failure | synthetic descending scores for that batch, reason `fallback` |
//! | provider error, no batch scored yet | whole call returns `reranking_applied = false`, every input at score 5 |
//! | provider error after another batch scored | that batch gets fallback scores |
//!
//! Callers therefore never get fewer documents back than they sent when
//! reranking fails entirely.

use anyhow::Result;
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;

use crate::config::{ModelConfig, RerankConfig};
use crate::llm::{decode_json_response, ChatProvider, ChatRequest, DecodeOutcome};

/// Score given to every document when reranking could not run.
pub const NEUTRAL_SCORE: f64 = 5.0;
/// Upper bound of the relevance scale.
pub const MAX_SCORE: f64 = 10.0;
/// Reason attached to synthetic scores.
pub const FALLBACK_REASON: &str = "fallback";

const RERANK_SYSTEM_PROMPT: &str = "You judge how relevant excerpts from a patient's clinical records are to their question. \
Score each excerpt from 0 (irrelevant) to 10 (directly answers the question). \
Reply with only a JSON object mapping each excerpt number to its integer score, for example {\"1\": 7, \"2\": 0}. \
You may instead give {\"score\": n, \"reason\": \"...\"} objects as values.";

/// One candidate with its relevance judgement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RerankingDocument {
    pub text: String,
    /// 0-10.
    pub relevance_score: f64,
    pub relevance_reason: String,
    /// Position of this text in the reranker's input.
    pub source_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RerankResult {
    pub reranking_applied: bool,
    pub documents: Vec<RerankingDocument>,
    /// The threshold actually applied by [`select`].
    pub effective_threshold: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RerankOptions {
    pub threshold: f64,
    pub target: usize,
    pub batch_size: usize,
    pub max_concurrent_batches: usize,
}

impl Default for RerankOptions {
    fn default() -> Self {
        Self::from(&RerankConfig::default())
    }
}

impl From<&RerankConfig> for RerankOptions {
    fn from(config: &RerankConfig) -> Self {
        Self {
            threshold: f64::from(config.threshold),
            target: config.target,
            batch_size: config.batch_size.max(1),
            max_concurrent_batches: config.max_concurrent_batches,
        }
    }
}

/// How one batch ended up scored.
#[derive(Debug, Clone, PartialEq)]
enum BatchScores {
    Scored(Vec<(f64, String)>),
    Fallback(Vec<(f64, String)>),
}

impl BatchScores {
    fn into_scores(self) -> Vec<(f64, String)> {
        match self {
            BatchScores::Scored(s) | BatchScores::Fallback(s) => s,
        }
    }
}

/// Reranker backed by a chat model.
pub struct LlmReranker<'a> {
    provider: &'a dyn ChatProvider,
    model: &'a ModelConfig,
    options: RerankOptions,
}

impl<'a> LlmReranker<'a> {
    pub fn new(provider: &'a dyn ChatProvider, model: &'a ModelConfig, options: RerankOptions) -> Self {
        Self {
            provider,
            model,
            options,
        }
    }

    /// Score `texts` against `query` and select the relevant subset.
    pub async fn rerank(&self, query: &str, texts: &[String]) -> RerankResult {
        if texts.is_empty() {
            return RerankResult {
                reranking_applied: false,
                documents: Vec::new(),
                effective_threshold: self.options.threshold,
            };
        }

        let batches: Vec<(usize, &[String])> = texts
            .chunks(self.options.batch_size)
            .enumerate()
            .map(|(i, b)| (i * self.options.batch_size, b))
            .collect();

        let scores = if batches.len() <= self.options.max_concurrent_batches {
            self.score_concurrently(query, &batches).await
        } else {
            self.score_sequentially(query, &batches).await
        };

        let Some(scores) = scores else {
            tracing::warn!(documents = texts.len(), "reranking failed, passing documents through");
            return not_applied(texts, self.options.threshold);
        };

        let docs: Vec<RerankingDocument> = texts
            .iter()
            .zip(scores)
            .enumerate()
            .map(|(i, (text, (score, reason)))| RerankingDocument {
                text: text.clone(),
                relevance_score: score,
                relevance_reason: reason,
                source_index: i,
            })
            .collect();

        let selection = select(docs, self.options.target, self.options.threshold);
        tracing::debug!(
            input = texts.len(),
            kept = selection.documents.len(),
            threshold = selection.threshold,
            "reranked"
        );
        RerankResult {
            reranking_applied: true,
            documents: selection.documents,
            effective_threshold: selection.threshold,
        }
    }

    /// All batches at once. `None` when every batch hit a provider error.
    async fn score_concurrently(
        &self,
        query: &str,
        batches: &[(usize, &[String])],
    ) -> Option<Vec<(f64, String)>> {
        let results = join_all(
            batches
                .iter()
                .map(|(offset, batch)| self.score_batch(query, *offset, batch)),
        )
        .await;

        if results.iter().all(|r| r.is_err()) {
            return None;
        }
        Some(
            results
                .into_iter()
                .zip(batches)
                .flat_map(|(r, (offset, batch))| match r {
                    Ok(scores) => scores.into_scores(),
                    Err(e) => {
                        tracing::warn!(offset, error = %e, "rerank batch failed, using fallback scores");
                        fallback_scores(batch.len())
                    }
                })
                .collect(),
        )
    }

    /// One batch at a time. `None` when the first batch hits a provider error.
    async fn score_sequentially(
        &self,
        query: &str,
        batches: &[(usize, &[String])],
    ) -> Option<Vec<(f64, String)>> {
        let mut all = Vec::new();
        for (i, (offset, batch)) in batches.iter().enumerate() {
            match self.score_batch(query, *offset, batch).await {
                Ok(scores) => all.extend(scores.into_scores()),
                Err(e) if i == 0 => {
                    tracing::warn!(error = %e, "first rerank batch failed");
                    return None;
                }
                Err(e) => {
                    tracing::warn!(offset, error = %e, "rerank batch failed, using fallback scores");
                    all.extend(fallback_scores(batch.len()));
                }
            }
        }
        Some(all)
    }

    /// Score one batch, retrying once on malformed output.
    ///
    /// Provider errors are returned as `Err`; decode and validation
    /// failures never are.
    async fn score_batch(&self, query: &str, offset: usize, batch: &[String]) -> Result<BatchScores> {
        let prompt = build_prompt(query, batch);
        let mut request = ChatRequest::single(self.model, RERANK_SYSTEM_PROMPT, prompt.clone());

        let first = self.provider.complete_structured(&request).await?;
        let reason = match validate(decode_json_response(&first), batch.len()) {
            Ok(scores) => return Ok(BatchScores::Scored(scores)),
            Err(reason) => reason,
        };
        tracing::debug!(offset, %reason, "rerank response rejected, retrying");

        request.messages[0].content = format!(
            "{}\n\nYour previous reply was rejected: {}. Reply again with only the JSON object, one score for every excerpt number from 1 to {}.",
            prompt,
            reason,
            batch.len()
        );
        let second = self.provider.complete_structured(&request).await?;
        match validate(decode_json_response(&second), batch.len()) {
            Ok(scores) => Ok(BatchScores::Scored(scores)),
            Err(reason) => {
                tracing::warn!(offset, %reason, "rerank response rejected twice, using fallback scores");
                Ok(BatchScores::Fallback(fallback_scores(batch.len())))
            }
        }
    }
}

fn build_prompt(query: &str, batch: &[String]) -> String {
    let mut prompt = format!("Question: {}\n\nExcerpts:\n", query);
    for (i, text) in batch.iter().enumerate() {
        prompt.push_str(&format!("\n[{}]\n{}\n", i + 1, text));
    }
    prompt.push_str(&format!(
        "\nReturn a JSON object with keys \"1\" to \"{}\".",
        batch.len()
    ));
    prompt
}

/// Check that every index `1..=n` has a numeric score in `0..=10`.
fn validate(outcome: DecodeOutcome, n: usize) -> Result<Vec<(f64, String)>, String> {
    let value = outcome.into_value()?;
    let map = match value.get("scores") {
        Some(inner @ Value::Object(_)) => inner,
        _ => &value,
    };

    let mut scores = Vec::with_capacity(n);
    for i in 1..=n {
        let key = i.to_string();
        let entry = map
            .get(&key)
            .ok_or_else(|| format!("missing score for excerpt {}", i))?;
        let (score, reason) = match entry {
            Value::Object(obj) => (
                obj.get("score").and_then(Value::as_f64),
                obj.get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            ),
            other => (other.as_f64(), String::new()),
        };
        let score = score.ok_or_else(|| format!("score for excerpt {} is not a number", i))?;
        if !(0.0..=MAX_SCORE).contains(&score) {
            return Err(format!("score {} for excerpt {} is outside 0-10", score, i));
        }
        scores.push((score, reason));
    }
    Ok(scores)
}

/// Descending scores that keep the batch's original order.
fn fallback_scores(n: usize) -> Vec<(f64, String)> {
    (0..n)
        .map(|i| {
            (
                MAX_SCORE * (n - i) as f64 / n as f64,
                FALLBACK_REASON.to_string(),
            )
        })
        .collect()
}

fn not_applied(texts: &[String], threshold: f64) -> RerankResult {
    RerankResult {
        reranking_applied: false,
        documents: texts
            .iter()
            .enumerate()
            .map(|(i, t)| RerankingDocument {
                text: t.clone(),
                relevance_score: NEUTRAL_SCORE,
                relevance_reason: "reranking unavailable".to_string(),
                source_index: i,
            })
            .collect(),
        effective_threshold: threshold,
    }
}

/// Output of [`select`].
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub documents: Vec<RerankingDocument>,
    pub threshold: f64,
}

/// Dynamic-threshold subset selection.
///
/// Sorts by score descending (stable), then:
/// - at least `target` documents reach `min_threshold`: keep the top
///   `target` plus every document tied with the `target`-th score, unless
///   that tie-inclusive set is larger than 1.5 × `target`, in which case
///   keep exactly `target`. The threshold is the cutoff score.
/// - otherwise keep the top `target` regardless of threshold; the
///   threshold is the last kept score.
///
/// Empty input yields an empty selection at `min_threshold`.
pub fn select(mut docs: Vec<RerankingDocument>, target: usize, min_threshold: f64) -> Selection {
    docs.sort_by(|a, b| {
        b.relevance_score
            .partial_cmp(&a.relevance_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    if docs.is_empty() || target == 0 {
        return Selection {
            documents: Vec::new(),
            threshold: min_threshold,
        };
    }

    let meeting = docs
        .iter()
        .filter(|d| d.relevance_score >= min_threshold)
        .count();

    if meeting >= target {
        let cutoff = docs[target - 1].relevance_score;
        let tie_inclusive = docs.iter().take_while(|d| d.relevance_score >= cutoff).count();
        let keep = if tie_inclusive as f64 > 1.5 * target as f64 {
            target
        } else {
            tie_inclusive
        };
        docs.truncate(keep);
        return Selection {
            documents: docs,
            threshold: cutoff,
        };
    }

    docs.truncate(target);
    let threshold = docs
        .last()
        .map(|d| d.relevance_score)
        .unwrap_or(min_threshold);
    Selection {
        documents: docs,
        threshold,
    }
}
