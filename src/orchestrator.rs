//! The question-answering loop.
//!
//! [`RagOrchestrator::ask`] retrieves context for a question, then lets the
//! model either answer or ask for more records. Each search request runs
//! small document searches, merges what they find into the working set and
//! goes back to the model. The loop is an explicit state machine:
//!
//! ```text
//! Start ─▶ AwaitModel ─┬─▶ FinalAnswer
//!              ▲       └─▶ ExecuteSearch ─┐
//!              └──────────────────────────┘
//!          (at max_iterations) ─▶ ForcedFinal
//! ```
//!
//! On the last allowed model call search is switched off, so the loop
//! always terminates with an answer.
//!
//! Notes about what was searched are kept in a scratchpad that is rendered
//! into the system prompt. They never enter the user-visible transcript.
//!
//! Callers that pass an event sender receive [`RagEvent`]s as the loop
//! runs, including answer tokens as they stream in. Without a sender the
//! model is called without streaming.

use std::collections::HashSet;

use anyhow::{bail, Result};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::Instrument;

use clinical_rag_core::chunk::ChunkingParams;
use clinical_rag_core::models::ClinicalDocument;
use clinical_rag_core::search::{
    iterative_search, search_documents, IterativeSearchOptions, SearchParams,
};
use clinical_rag_core::store::{DocumentStore, RelatedDocuments, VectorIndex};

use crate::config::{Config, ModelConfig, RerankConfig};
use crate::context::{prepare_context, PrepareOptions, PreparedDocuments, RerankStage};
use crate::llm::{ChatMessage, ChatProvider, ChatRequest, StreamEvent};

const SYSTEM_PROMPT: &str = "You are a careful assistant answering questions about the user's own medical records. \
Answer only from the records provided below. If they do not contain the answer, say so plainly. \
When the records look incomplete for the question, call the search_records tool with short search phrases instead of guessing.";

const FORCED_FINAL_NOTE: &str =
    "No more searches are available. Answer now with the records you have.";

/// Used when the model keeps asking to search after search was disabled.
const NO_ANSWER: &str = "I could not find enough in your records to answer that.";

/// Progress reported to the caller while [`RagOrchestrator::ask`] runs.
///
/// The `Token`s received since the last `Discard` concatenate to the final
/// answer text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RagEvent {
    /// A fragment of the answer.
    Token { text: String },
    /// The tokens streamed since the previous discard belonged to a turn that
    /// ended in a search request, not an answer.
    Discard,
    SearchStarted { queries: Vec<String> },
    SearchCompleted {
        queries: Vec<String>,
        new_documents: usize,
        total_documents: usize,
    },
    Answer { answer: RagAnswer },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RagAnswer {
    pub session_id: String,
    pub text: String,
    /// Documents behind the context of the final model call.
    pub documents: Vec<ClinicalDocument>,
    /// Number of model calls made.
    pub model_calls: usize,
    /// The iteration ceiling was reached and search was disabled.
    pub forced: bool,
}

/// Retrieval knobs used by the loop.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_iterations: usize,
    pub search_k: usize,
    pub followup_k: usize,
    pub max_search_iterations: usize,
    pub chunk_budget: usize,
    pub include_related: bool,
    pub rerank: RerankConfig,
    pub chunking: ChunkingParams,
    pub user_id: Option<String>,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_iterations: config.orchestrator.max_iterations,
            search_k: config.retrieval.search_k,
            followup_k: config.retrieval.followup_k,
            max_search_iterations: config.retrieval.max_search_iterations,
            chunk_budget: config.retrieval.chunk_budget,
            include_related: config.retrieval.include_related,
            rerank: config.rerank.clone(),
            chunking: config.chunking.params(),
            user_id: None,
        }
    }

    pub fn for_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }
}

/// Loop states. Terminal states carry the answer text.
#[derive(Debug, Clone, PartialEq)]
enum LoopState {
    Start,
    AwaitModel,
    ExecuteSearch(Vec<String>),
    FinalAnswer(String),
    ForcedFinal(String),
}

/// What one model call produced.
enum ModelTurn {
    Answer(String),
    Search(Vec<String>),
}

/// Documents and chunk ids gathered so far.
#[derive(Default)]
struct WorkingSet {
    documents: Vec<ClinicalDocument>,
    doc_ids: HashSet<String>,
    chunk_ids: Vec<String>,
    seen_chunks: HashSet<String>,
}

impl WorkingSet {
    /// Merge search output; returns the number of new documents.
    fn merge(&mut self, documents: Vec<ClinicalDocument>, chunk_ids: Vec<String>) -> usize {
        for id in chunk_ids {
            if self.seen_chunks.insert(id.clone()) {
                self.chunk_ids.push(id);
            }
        }
        let mut added = 0;
        for doc in documents {
            if self.doc_ids.insert(doc.id.clone()) {
                self.documents.push(doc);
                added += 1;
            }
        }
        added
    }
}

pub struct RagOrchestrator<'a> {
    store: &'a dyn DocumentStore,
    index: &'a dyn VectorIndex,
    related: Option<&'a dyn RelatedDocuments>,
    provider: &'a dyn ChatProvider,
    model: &'a ModelConfig,
    settings: OrchestratorSettings,
}

impl<'a> RagOrchestrator<'a> {
    pub fn new(
        store: &'a dyn DocumentStore,
        index: &'a dyn VectorIndex,
        provider: &'a dyn ChatProvider,
        model: &'a ModelConfig,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            index,
            related: None,
            provider,
            model,
            settings,
        }
    }

    pub fn with_related(mut self, related: &'a dyn RelatedDocuments) -> Self {
        self.related = Some(related);
        self
    }

    /// Answer `question` given the prior conversation `history`.
    ///
    /// Provider errors end the loop and are returned. Every fallback below
    /// that (reranking, malformed output) is handled internally.
    pub async fn ask(
        &self,
        history: &[ChatMessage],
        question: &str,
        events: Option<UnboundedSender<RagEvent>>,
    ) -> Result<RagAnswer> {
        if !self.model.is_enabled() {
            bail!("Model provider is disabled; set [model] provider in the config");
        }
        if question.trim().is_empty() {
            bail!("Question is empty");
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("rag", session = %session_id);
        self.run(history, question, events, session_id)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        history: &[ChatMessage],
        question: &str,
        events: Option<UnboundedSender<RagEvent>>,
        session_id: String,
    ) -> Result<RagAnswer> {
        let mut transcript: Vec<ChatMessage> = history.to_vec();
        transcript.push(ChatMessage::user(question));

        let mut working = WorkingSet::default();
        let mut scratchpad: Vec<String> = Vec::new();
        let mut context = PreparedDocuments::default();
        let mut model_calls = 0usize;
        let mut state = LoopState::Start;

        loop {
            state = match state {
                LoopState::Start => {
                    let initial = iterative_search(
                        &[question.to_string()],
                        self.index,
                        self.store,
                        &IterativeSearchOptions {
                            max_iterations: self.settings.max_search_iterations,
                            limit: self.settings.search_k,
                            params: self.search_params(self.settings.search_k),
                        },
                        None,
                    )
                    .await?;
                    working.merge(initial.documents, initial.relevant_chunk_ids);
                    tracing::info!(documents = working.documents.len(), "initial retrieval");
                    context = self.prepare(&working, question).await;
                    LoopState::AwaitModel
                }

                LoopState::AwaitModel => {
                    model_calls += 1;
                    let last_call = model_calls >= self.settings.max_iterations;
                    let request = ChatRequest {
                        system: render_system_prompt(&context, &scratchpad, last_call),
                        messages: transcript.clone(),
                        temperature: self.model.temperature,
                        model: self.model.model_name().to_string(),
                        allow_search: !last_call,
                    };
                    tracing::debug!(call = model_calls, allow_search = !last_call, "model call");

                    match self.call_model(&request, events.as_ref()).await? {
                        ModelTurn::Search(queries) if !last_call => LoopState::ExecuteSearch(queries),
                        ModelTurn::Search(_) => {
                            emit(events.as_ref(), RagEvent::Token { text: NO_ANSWER.to_string() });
                            LoopState::ForcedFinal(NO_ANSWER.to_string())
                        }
                        ModelTurn::Answer(text) if last_call => LoopState::ForcedFinal(text),
                        ModelTurn::Answer(text) => LoopState::FinalAnswer(text),
                    }
                }

                LoopState::ExecuteSearch(queries) => {
                    if queries.is_empty() {
                        scratchpad.push("A search was requested without any search phrases; nothing was searched.".to_string());
                    } else {
                        emit(events.as_ref(), RagEvent::SearchStarted { queries: queries.clone() });
                        let mut found = Vec::new();
                        let mut added = 0;
                        for query in &queries {
                            let result = search_documents(
                                std::slice::from_ref(query),
                                self.index,
                                self.store,
                                &self.search_params(self.settings.followup_k),
                            )
                            .await?;
                            let names: Vec<String> =
                                result.documents.iter().map(document_label).collect();
                            let new = working.merge(result.documents, result.relevant_chunk_ids);
                            added += new;
                            found.push(search_note(query, new, &names));
                        }
                        scratchpad.extend(found);
                        tracing::info!(queries = queries.len(), new_documents = added, "model-requested search");
                        emit(
                            events.as_ref(),
                            RagEvent::SearchCompleted {
                                queries,
                                new_documents: added,
                                total_documents: working.documents.len(),
                            },
                        );
                        context = self.prepare(&working, question).await;
                    }
                    LoopState::AwaitModel
                }

                LoopState::FinalAnswer(text) => {
                    return Ok(finish(session_id, text, context, model_calls, false, events.as_ref()));
                }
                LoopState::ForcedFinal(text) => {
                    return Ok(finish(session_id, text, context, model_calls, true, events.as_ref()));
                }
            };
        }
    }

    fn search_params(&self, k: usize) -> SearchParams {
        SearchParams {
            k,
            user_id: self.settings.user_id.clone(),
        }
    }

    async fn prepare(&self, working: &WorkingSet, question: &str) -> PreparedDocuments {
        let options = PrepareOptions {
            chunk_budget: self.settings.chunk_budget,
            include_related: self.settings.include_related,
            query: None,
            rerank: None,
            chunking: self.settings.chunking,
        }
        .with_query(question)
        .with_rerank(RerankStage {
            provider: self.provider,
            model: self.model,
            config: &self.settings.rerank,
        });
        prepare_context(&working.documents, &working.chunk_ids, self.related, &options).await
    }

    /// One model exchange, streamed when the caller listens for events.
    async fn call_model(
        &self,
        request: &ChatRequest,
        events: Option<&UnboundedSender<RagEvent>>,
    ) -> Result<ModelTurn> {
        let Some(tx) = events else {
            let completion = self.provider.complete(request).await?;
            return Ok(match completion.search_queries {
                Some(queries) => ModelTurn::Search(queries),
                None => ModelTurn::Answer(completion.text),
            });
        };

        let mut stream = self.provider.stream_complete(request).await?;
        let mut text = String::new();
        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::Text(fragment) => {
                    text.push_str(&fragment);
                    let _ = tx.send(RagEvent::Token { text: fragment });
                }
                StreamEvent::SearchCallDelta(_) => {}
                StreamEvent::SearchCallDone { queries } => {
                    if !text.is_empty() {
                        let _ = tx.send(RagEvent::Discard);
                    }
                    return Ok(ModelTurn::Search(queries));
                }
                StreamEvent::Done => break,
            }
        }
        Ok(ModelTurn::Answer(text))
    }
}

fn finish(
    session_id: String,
    text: String,
    context: PreparedDocuments,
    model_calls: usize,
    forced: bool,
    events: Option<&UnboundedSender<RagEvent>>,
) -> RagAnswer {
    let answer = RagAnswer {
        session_id,
        text,
        documents: context.documents,
        model_calls,
        forced,
    };
    tracing::info!(model_calls, forced, "answer ready");
    emit(events, RagEvent::Answer { answer: answer.clone() });
    answer
}

fn emit(events: Option<&UnboundedSender<RagEvent>>, event: RagEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

fn document_label(doc: &ClinicalDocument) -> String {
    let name = doc.display_name().unwrap_or_else(|| doc.resource_type());
    match doc.metadata.as_ref().and_then(|m| m.date.as_deref()) {
        Some(date) => format!("{} ({})", name, date),
        None => name.to_string(),
    }
}

fn search_note(query: &str, new_documents: usize, names: &[String]) -> String {
    if names.is_empty() {
        return format!("Searched the records for \"{}\": nothing found.", query);
    }
    format!(
        "Searched the records for \"{}\": {} matching record(s), {} new: {}.",
        query,
        names.len(),
        new_documents,
        names.join("; ")
    )
}

/// System prompt with the numbered records and the scratchpad.
fn render_system_prompt(context: &PreparedDocuments, scratchpad: &[String], last_call: bool) -> String {
    let mut prompt = String::from(SYSTEM_PROMPT);

    prompt.push_str("\n\n## Records\n");
    if context.texts.is_empty() {
        prompt.push_str("\n(no matching records were found)\n");
    }
    for (i, text) in context.texts.iter().enumerate() {
        prompt.push_str(&format!("\n[{}] {}\n", i + 1, text));
    }

    if !scratchpad.is_empty() || last_call {
        prompt.push_str("\n## Search notes\n");
        for note in scratchpad {
            prompt.push_str(&format!("- {}\n", note));
        }
        if last_call {
            prompt.push_str(&format!("- {}\n", FORCED_FINAL_NOTE));
        }
    }
    prompt
}
