use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tempfile::TempDir;

use clinical_rag::config::{parse_config, Config};
use clinical_rag::context::{prepare_context, PrepareOptions, RerankStage};
use clinical_rag::db::connect_path;
use clinical_rag::llm::{
    ChatCompletion, ChatProvider, ChatRequest, EventStream, StreamEvent, StructuredResponse,
};
use clinical_rag::migrate::apply_schema;
use clinical_rag::orchestrator::{OrchestratorSettings, RagEvent, RagOrchestrator};
use clinical_rag::progress::NoProgress;
use clinical_rag::sqlite_store::{SqliteDocumentStore, SqliteVectorIndex};
use clinical_rag::sync::{SyncState, VectorSync};
use clinical_rag_core::embedding::HashEmbedder;
use clinical_rag_core::models::{ClinicalDocument, CodeRef, DataRecord, DocumentMetadata};
use clinical_rag_core::search::{search_documents, SearchParams};
use clinical_rag_core::store::{DocumentStore, VectorIndex};

const CCDA: &str = r#"<?xml version="1.0"?>
<ClinicalDocument xmlns="urn:hl7-org:v3">
  <component><structuredBody>
    <component><section>
      <title>Medications</title>
      <text>Metformin 500 mg twice daily</text>
    </section></component>
    <component><section>
      <title>Problems</title>
      <text>Type 2 diabetes mellitus without complications</text>
    </section></component>
  </structuredBody></component>
</ClinicalDocument>"#;

fn config() -> Config {
    parse_config(
        r#"
[db]
path = "unused"

[embedding]
provider = "hash"
dims = 256

[model]
provider = "openai"
name = "test-model"

[sync]
page_size = 2

[retrieval]
search_k = 3
"#,
    )
    .unwrap()
}

fn fhir(id: &str, resource_type: &str, date: &str, raw: Value, code: Option<&str>) -> ClinicalDocument {
    ClinicalDocument {
        id: id.to_string(),
        user_id: "u1".to_string(),
        connection_id: "portal".to_string(),
        data_record: DataRecord {
            raw,
            format: "FHIR.R4".to_string(),
            content_type: "application/fhir+json".to_string(),
            resource_type: resource_type.to_string(),
            version_history: vec![],
        },
        metadata: Some(DocumentMetadata {
            id: Some(id.to_string()),
            date: Some(date.to_string()),
            display_name: None,
            codes: code
                .map(|c| {
                    vec![CodeRef {
                        system: Some("http://loinc.org".to_string()),
                        code: Some(c.to_string()),
                        display: None,
                    }]
                })
                .unwrap_or_default(),
        }),
    }
}

fn records() -> Vec<ClinicalDocument> {
    let mut summary = fhir("summary", "ClinicalDocument", "2024-02-01", Value::String(CCDA.into()), None);
    summary.data_record.format = "CCDA".to_string();
    summary.data_record.content_type = "application/xml".to_string();
    vec![
        fhir(
            "a1c-2024",
            "Observation",
            "2024-01-15",
            json!({"code": {"text": "Hemoglobin A1c"}, "valueQuantity": {"value": 7.2, "unit": "%"}}),
            Some("4548-4"),
        ),
        fhir(
            "a1c-2023",
            "Observation",
            "2023-01-10",
            json!({"code": {"text": "Hemoglobin A1c"}, "valueQuantity": {"value": 8.1, "unit": "%"}}),
            Some("4548-4"),
        ),
        fhir(
            "allergy",
            "AllergyIntolerance",
            "2020-05-05",
            json!({"code": {"text": "Penicillin allergy"}}),
            None,
        ),
        summary,
    ]
}

struct Fixture {
    _tmp: TempDir,
    store: Arc<SqliteDocumentStore>,
    index: Arc<SqliteVectorIndex>,
}

async fn indexed_fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let pool = connect_path(&tmp.path().join("crag.sqlite")).await.unwrap();
    apply_schema(&pool).await.unwrap();
    let store = Arc::new(SqliteDocumentStore::new(pool.clone()));
    let index = Arc::new(SqliteVectorIndex::new(pool, Arc::new(HashEmbedder::new(256))));
    store.bulk_upsert(&records()).await.unwrap();

    let cfg = config();
    let sync = VectorSync::new(
        store.clone(),
        index.clone(),
        cfg.chunking.params(),
        cfg.sync.page_size,
    );
    let state = sync.run(&NoProgress).await.unwrap();
    assert!(state.is_done());
    Fixture {
        _tmp: tmp,
        store,
        index,
    }
}

#[tokio::test]
async fn test_sync_indexes_every_chunk_once() {
    let fx = indexed_fixture().await;
    // 3 JSON chunks + CCDA: full document + 2 sections.
    assert_eq!(fx.index.count().await.unwrap(), 6);

    let cfg = config();
    let again = VectorSync::new(
        fx.store.clone(),
        fx.index.clone(),
        cfg.chunking.params(),
        cfg.sync.page_size,
    );
    let state = again.run(&NoProgress).await.unwrap();
    assert_eq!(
        state,
        SyncState::Done {
            processed: 4,
            total: 4,
            chunks: 6
        }
    );
    assert_eq!(fx.index.count().await.unwrap(), 6);
}

#[tokio::test]
async fn test_search_dedups_ccda_sections_to_one_document() {
    let fx = indexed_fixture().await;
    let result = search_documents(
        &["metformin".to_string(), "diabetes".to_string()],
        fx.index.as_ref(),
        fx.store.as_ref(),
        &SearchParams {
            k: 6,
            user_id: Some("u1".to_string()),
        },
    )
    .await
    .unwrap();

    assert_eq!(result.relevant_chunk_ids.len(), 6);
    assert_eq!(result.documents.len(), 4);
    assert_eq!(result.documents[0].id, "summary");
    assert_eq!(result.confidence, 1.0);
}

#[tokio::test]
async fn test_context_pulls_related_labs() {
    let fx = indexed_fixture().await;
    let cfg = config();
    let newest = fx.store.find_one("a1c-2024").await.unwrap().unwrap();

    let options = PrepareOptions::from_config(&cfg.retrieval, cfg.chunking.params());
    let out = prepare_context(
        &[newest],
        &["a1c-2024__chunk_0".to_string()],
        Some(fx.store.as_ref()),
        &options,
    )
    .await;

    assert_eq!(out.chunk_ids, vec!["a1c-2024__chunk_0", "a1c-2023__chunk_0"]);
    assert_eq!(out.documents.len(), 2);
    assert!(out.texts[1].contains("8.1"));
}

/// Scores by keyword and answers with a fixed script.
struct ClinicBot {
    turns: Mutex<Vec<ChatCompletion>>,
    systems: Mutex<Vec<String>>,
}

impl ClinicBot {
    fn new(turns: Vec<ChatCompletion>) -> Self {
        Self {
            turns: Mutex::new(turns),
            systems: Mutex::new(Vec::new()),
        }
    }

    fn next_turn(&self, request: &ChatRequest) -> Result<ChatCompletion> {
        self.systems.lock().unwrap().push(request.system.clone());
        let mut turns = self.turns.lock().unwrap();
        if turns.is_empty() {
            anyhow::bail!("no turns left");
        }
        Ok(turns.remove(0))
    }
}

#[async_trait]
impl ChatProvider for ClinicBot {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatCompletion> {
        self.next_turn(request)
    }

    async fn complete_structured(&self, request: &ChatRequest) -> Result<StructuredResponse> {
        // Excerpts mentioning A1c score high, everything else low.
        let prompt = &request.messages[0].content;
        let mut scores = serde_json::Map::new();
        for (i, block) in prompt.split("\n[").skip(1).enumerate() {
            let score = if block.contains("Hemoglobin A1c") { 9 } else { 1 };
            scores.insert((i + 1).to_string(), json!(score));
        }
        Ok(StructuredResponse::Text(format!(
            "Scores:\n{}",
            Value::Object(scores)
        )))
    }

    async fn stream_complete(&self, request: &ChatRequest) -> Result<EventStream> {
        let turn = self.next_turn(request)?;
        let events: Vec<Result<StreamEvent>> = match turn.search_queries {
            Some(queries) => vec![Ok(StreamEvent::SearchCallDone { queries })],
            None => vec![Ok(StreamEvent::Text(turn.text)), Ok(StreamEvent::Done)],
        };
        Ok(stream::iter(events).boxed())
    }
}

#[tokio::test]
async fn test_context_rerank_keeps_relevant_snippets() {
    let fx = indexed_fixture().await;
    let cfg = config();
    let docs = fx.store.find(0, 10).await.unwrap();
    let bot = ClinicBot::new(vec![]);
    let mut rerank = cfg.rerank.clone();
    rerank.target = 2;

    let options = PrepareOptions::from_config(&cfg.retrieval, cfg.chunking.params())
        .with_query("What was my A1c?")
        .with_rerank(RerankStage {
            provider: &bot,
            model: &cfg.model,
            config: &rerank,
        });
    let out = prepare_context(&docs, &[], None, &options).await;

    assert!(out.reranking_applied);
    assert_eq!(out.texts.len(), 2);
    assert!(out.texts.iter().all(|t| t.contains("Hemoglobin A1c")));
    assert_eq!(out.total_count, 6);
}

#[tokio::test]
async fn test_orchestrator_end_to_end_with_followup_search() {
    let fx = indexed_fixture().await;
    let cfg = config();
    let bot = ClinicBot::new(vec![
        ChatCompletion {
            text: String::new(),
            search_queries: Some(vec!["penicillin allergy".to_string()]),
        },
        ChatCompletion {
            text: "Your A1c dropped from 8.1% to 7.2%. You are allergic to penicillin.".to_string(),
            search_queries: None,
        },
    ]);

    let settings = OrchestratorSettings::from_config(&cfg).for_user(Some("u1".to_string()));
    let rag = RagOrchestrator::new(
        fx.store.as_ref(),
        fx.index.as_ref(),
        &bot,
        &cfg.model,
        settings,
    )
    .with_related(fx.store.as_ref());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let answer = rag
        .ask(&[], "How is my hemoglobin a1c trending?", Some(tx))
        .await
        .unwrap();

    assert!(answer.text.starts_with("Your A1c dropped"));
    assert_eq!(answer.model_calls, 2);
    assert!(!answer.forced);
    assert!(answer.documents.iter().any(|d| d.id == "allergy"));

    let systems = bot.systems.lock().unwrap();
    let last = systems.iter().rev().find(|s| s.contains("## Records")).unwrap();
    assert!(last.contains("Searched the records for \"penicillin allergy\""));

    let mut saw_search = false;
    let mut saw_answer = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            RagEvent::SearchCompleted { .. } => saw_search = true,
            RagEvent::Answer { answer: a } => saw_answer = a.session_id == answer.session_id,
            _ => {}
        }
    }
    assert!(saw_search);
    assert!(saw_answer);
}
