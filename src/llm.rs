//! Chat model provider abstraction.
//!
//! The reranker and the orchestrator only see the [`ChatProvider`] trait:
//!
//! | Method | Returns | Used by |
//! |--------|---------|---------|
//! | [`complete`](ChatProvider::complete) | text plus optional search request | orchestrator (no streaming) |
//! | [`complete_structured`](ChatProvider::complete_structured) | JSON object or raw text | reranker |
//! | [`stream_complete`](ChatProvider::stream_complete) | stream of [`StreamEvent`]s | orchestrator (streaming) |
//!
//! Model output whose shape is not guaranteed goes through
//! [`decode_json_response`], which reports one of three outcomes instead of
//! erroring: the payload parsed as-is, a JSON object was extracted from
//! surrounding text, or decoding failed with a reason.
//!
//! [`OpenAIChatProvider`] talks to any OpenAI-compatible
//! `/chat/completions` endpoint. When a request allows search it exposes a
//! single `search_records` function tool; a search request is complete only
//! once the stream reports `finish_reason = "tool_calls"`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::{ModelConfig, API_KEY_ENV};
use crate::retry::send_with_retry;

/// Name of the function tool the model calls to request more records.
pub const SEARCH_TOOL_NAME: &str = "search_records";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One model exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    /// System instructions, including any retrieved context.
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub model: String,
    /// Whether the model may answer with a search request instead of text.
    pub allow_search: bool,
}

impl ChatRequest {
    /// A single-prompt request using the model settings from `config`.
    pub fn single(config: &ModelConfig, system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            messages: vec![ChatMessage::user(prompt)],
            temperature: config.temperature,
            model: config.model_name().to_string(),
            allow_search: false,
        }
    }
}

/// Result of a non-streaming completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatCompletion {
    pub text: String,
    /// Set when the model asked for more records instead of answering.
    pub search_queries: Option<Vec<String>>,
}

/// Raw shape of a structured completion.
#[derive(Debug, Clone, PartialEq)]
pub enum StructuredResponse {
    Object(Value),
    Text(String),
}

/// Incremental output of [`ChatProvider::stream_complete`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A fragment of answer text.
    Text(String),
    /// A fragment of an in-progress search request's arguments.
    SearchCallDelta(String),
    /// The search request is complete.
    SearchCallDone { queries: Vec<String> },
    Done,
}

pub type EventStream = BoxStream<'static, Result<StreamEvent>>;

#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatCompletion>;

    /// Ask for a JSON object answer.
    async fn complete_structured(&self, request: &ChatRequest) -> Result<StructuredResponse>;

    async fn stream_complete(&self, request: &ChatRequest) -> Result<EventStream>;
}

/// Build the provider selected by `model.provider`.
///
/// Fails without any network call when the provider needs credentials that
/// are missing.
pub fn create_chat_provider(config: &ModelConfig) -> Result<Arc<dyn ChatProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledChatProvider)),
        "openai" => Ok(Arc::new(OpenAIChatProvider::new(config)?)),
        other => bail!("Unknown model provider: {}", other),
    }
}

// ============ Decoding ============

/// Outcome of decoding a model's JSON answer.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOutcome {
    /// The response was already a JSON object, or text that parsed as one.
    Parsed(Value),
    /// A JSON object was recovered from surrounding prose or code fences.
    Extracted(Value),
    Failed(String),
}

impl DecodeOutcome {
    pub fn into_value(self) -> Result<Value, String> {
        match self {
            DecodeOutcome::Parsed(v) | DecodeOutcome::Extracted(v) => Ok(v),
            DecodeOutcome::Failed(reason) => Err(reason),
        }
    }
}

/// Normalize a structured response into a JSON object.
pub fn decode_json_response(response: &StructuredResponse) -> DecodeOutcome {
    let text = match response {
        StructuredResponse::Object(v) if v.is_object() => return DecodeOutcome::Parsed(v.clone()),
        StructuredResponse::Object(v) => {
            return DecodeOutcome::Failed(format!("expected a JSON object, got {}", json_kind(v)))
        }
        StructuredResponse::Text(t) => t.trim(),
    };

    if text.is_empty() {
        return DecodeOutcome::Failed("empty response".to_string());
    }

    match serde_json::from_str::<Value>(text) {
        Ok(v) if v.is_object() => return DecodeOutcome::Parsed(v),
        Ok(v) => return DecodeOutcome::Failed(format!("expected a JSON object, got {}", json_kind(&v))),
        Err(_) => {}
    }

    let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
        return DecodeOutcome::Failed("no JSON object found in response".to_string());
    };
    if end <= start {
        return DecodeOutcome::Failed("no JSON object found in response".to_string());
    }
    match serde_json::from_str::<Value>(&text[start..=end]) {
        Ok(v) if v.is_object() => DecodeOutcome::Extracted(v),
        Ok(v) => DecodeOutcome::Failed(format!("expected a JSON object, got {}", json_kind(&v))),
        Err(e) => DecodeOutcome::Failed(format!("invalid JSON: {}", e)),
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Queries from `search_records` arguments.
///
/// Accepts `{"queries": [..]}` or `{"query": ".."}`; anything else that is
/// non-empty is taken as one literal query.
pub fn parse_search_arguments(arguments: &str) -> Vec<String> {
    let trimmed = arguments.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let from_json = serde_json::from_str::<Value>(trimmed).ok().map(|v| {
        let mut queries: Vec<String> = v
            .get("queries")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        if let Some(q) = v.get("query").and_then(Value::as_str) {
            queries.push(q.to_string());
        }
        queries
    });
    match from_json {
        Some(queries) => queries
            .into_iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect(),
        None => vec![trimmed.to_string()],
    }
}

// ============ Disabled ============

/// A provider that refuses every call.
pub struct DisabledChatProvider;

#[async_trait]
impl ChatProvider for DisabledChatProvider {
    async fn complete(&self, _request: &ChatRequest) -> Result<ChatCompletion> {
        bail!("Model provider is disabled; set [model] provider in the config")
    }

    async fn complete_structured(&self, _request: &ChatRequest) -> Result<StructuredResponse> {
        bail!("Model provider is disabled; set [model] provider in the config")
    }

    async fn stream_complete(&self, _request: &ChatRequest) -> Result<EventStream> {
        bail!("Model provider is disabled; set [model] provider in the config")
    }
}

// ============ OpenAI-compatible ============

/// Provider for OpenAI-compatible `/chat/completions` endpoints.
pub struct OpenAIChatProvider {
    client: reqwest::Client,
    api_key: String,
    url: String,
    max_retries: u32,
}

impl OpenAIChatProvider {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        if config.model_name().is_empty() {
            bail!("model.name required for OpenAI provider");
        }
        let api_key = std::env::var(API_KEY_ENV)
            .map_err(|_| anyhow!("{} environment variable not set", API_KEY_ENV))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key,
            url: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            max_retries: config.max_retries,
        })
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        send_with_retry("OpenAI chat", self.max_retries, || {
            self.client
                .post(&self.url)
                .bearer_auth(&self.api_key)
                .json(body)
        })
        .await
    }
}

/// Request body for `/chat/completions`.
pub fn build_request_body(request: &ChatRequest, stream: bool, json_mode: bool) -> Value {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if !request.system.is_empty() {
        messages.push(json!({"role": "system", "content": request.system}));
    }
    for m in &request.messages {
        messages.push(json!({"role": m.role, "content": m.content}));
    }

    let mut body = json!({
        "model": request.model,
        "temperature": request.temperature,
        "messages": messages,
        "stream": stream,
    });
    if request.allow_search {
        body["tools"] = json!([search_tool_definition()]);
        body["tool_choice"] = json!("auto");
    }
    if json_mode {
        body["response_format"] = json!({"type": "json_object"});
    }
    body
}

fn search_tool_definition() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": SEARCH_TOOL_NAME,
            "description": "Search the patient's clinical records for more context before answering.",
            "parameters": {
                "type": "object",
                "properties": {
                    "queries": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Short search phrases, e.g. lab names, conditions, medications."
                    }
                },
                "required": ["queries"]
            }
        }
    })
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    function: ToolFunction,
}

#[derive(Debug, Deserialize)]
struct ToolFunction {
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: String,
}

fn parse_completion(json: Value) -> Result<ChatCompletion> {
    let response: CompletionResponse = serde_json::from_value(json)?;
    let message = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Invalid chat response: no choices"))?
        .message;

    let searches: Vec<String> = message
        .tool_calls
        .iter()
        .filter(|c| c.function.name == SEARCH_TOOL_NAME)
        .flat_map(|c| parse_search_arguments(&c.function.arguments))
        .collect();
    let requested = message
        .tool_calls
        .iter()
        .any(|c| c.function.name == SEARCH_TOOL_NAME);

    Ok(ChatCompletion {
        text: message.content.unwrap_or_default(),
        search_queries: requested.then_some(searches),
    })
}

#[async_trait]
impl ChatProvider for OpenAIChatProvider {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatCompletion> {
        let body = build_request_body(request, false, false);
        let json: Value = self.post(&body).await?.json().await?;
        parse_completion(json)
    }

    async fn complete_structured(&self, request: &ChatRequest) -> Result<StructuredResponse> {
        let body = build_request_body(request, false, true);
        let json: Value = self.post(&body).await?.json().await?;
        let text = parse_completion(json)?.text;
        Ok(match serde_json::from_str::<Value>(text.trim()) {
            Ok(v) if v.is_object() => StructuredResponse::Object(v),
            _ => StructuredResponse::Text(text),
        })
    }

    async fn stream_complete(&self, request: &ChatRequest) -> Result<EventStream> {
        let body = build_request_body(request, true, false);
        let response = self.post(&body).await?;
        let bytes = response.bytes_stream().boxed();

        let events = stream::unfold(
            (bytes, SseParser::default(), VecDeque::new()),
            |(mut bytes, mut parser, mut queue)| async move {
                loop {
                    if let Some(event) = queue.pop_front() {
                        return Some((Ok(event), (bytes, parser, queue)));
                    }
                    if parser.is_finished() {
                        return None;
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => match parser.push(&chunk) {
                            Ok(events) => queue.extend(events),
                            Err(e) => {
                                parser.abort();
                                return Some((Err(e), (bytes, parser, queue)));
                            }
                        },
                        Some(Err(e)) => {
                            parser.abort();
                            return Some((Err(e.into()), (bytes, parser, queue)));
                        }
                        None => queue.extend(parser.finish()),
                    }
                }
            },
        );
        Ok(events.boxed())
    }
}

// ============ SSE parsing ============

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: u64,
    #[serde(default)]
    function: Option<ToolFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct PendingToolCall {
    name: String,
    arguments: String,
}

/// Incremental parser for `text/event-stream` chat completions.
///
/// Tool call fragments are accumulated per call index and only turned into
/// a [`StreamEvent::SearchCallDone`] when the model finishes with
/// `tool_calls`. A stream that ends before that discards the partial call.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    calls: BTreeMap<u64, PendingToolCall>,
    finished: bool,
}

impl SseParser {
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed raw bytes; returns the events completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<StreamEvent>> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                self.finished = true;
                events.push(StreamEvent::Done);
                break;
            }
            if !data.is_empty() {
                self.handle_data(data, &mut events)?;
            }
        }
        Ok(events)
    }

    /// End of input without `[DONE]`.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        if !self.calls.is_empty() {
            tracing::warn!("stream ended inside a search request; request discarded");
            self.calls.clear();
        }
        vec![StreamEvent::Done]
    }

    fn abort(&mut self) {
        self.finished = true;
    }

    fn handle_data(&mut self, data: &str, events: &mut Vec<StreamEvent>) -> Result<()> {
        let chunk: StreamChunk = serde_json::from_str(data)
            .map_err(|e| anyhow!("invalid stream chunk: {}", e))?;
        for choice in chunk.choices {
            if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                events.push(StreamEvent::Text(text));
            }
            for delta in choice.delta.tool_calls {
                let call = self.calls.entry(delta.index).or_default();
                if let Some(f) = delta.function {
                    if let Some(name) = f.name {
                        call.name.push_str(&name);
                    }
                    if let Some(args) = f.arguments.filter(|a| !a.is_empty()) {
                        call.arguments.push_str(&args);
                        events.push(StreamEvent::SearchCallDelta(args));
                    }
                }
            }
            if choice.finish_reason.as_deref() == Some("tool_calls") {
                let calls = std::mem::take(&mut self.calls);
                let queries: Vec<String> = calls
                    .values()
                    .filter(|c| c.name.is_empty() || c.name == SEARCH_TOOL_NAME)
                    .flat_map(|c| parse_search_arguments(&c.arguments))
                    .collect();
                events.push(StreamEvent::SearchCallDone { queries });
            }
        }
        Ok(())
    }
}
