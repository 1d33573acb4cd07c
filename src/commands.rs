//! CLI command implementations.
//!
//! Each `run_*` function backs one `crag` subcommand. Output meant for
//! scripts goes to stdout; progress and search activity go to stderr.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};
use futures::FutureExt;
use futures::StreamExt;

use clinical_rag_core::chunk::{chunk_document, classify};
use clinical_rag_core::search::{iterative_search, IterativeSearchOptions, SearchParams};
use clinical_rag_core::store::{DocumentStore, VectorIndex};

use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::import::{import_documents, load_documents};
use crate::llm::create_chat_provider;
use crate::migrate;
use crate::orchestrator::{OrchestratorSettings, RagEvent, RagOrchestrator};
use crate::progress::ProgressMode;
use crate::sqlite_store::{SqliteDocumentStore, SqliteVectorIndex};
use crate::sync::VectorSync;

/// Open the document store and, when embeddings are configured, the index.
async fn open_stores(
    config: &Config,
    need_index: bool,
) -> Result<(Arc<SqliteDocumentStore>, Option<Arc<SqliteVectorIndex>>)> {
    if need_index && !config.embedding.is_enabled() {
        bail!("This command requires embeddings. Set [embedding] provider in config.");
    }
    let pool = db::connect(config).await?;
    let store = Arc::new(SqliteDocumentStore::new(pool.clone()));
    let index = if need_index {
        let embedder = create_embedder(&config.embedding)?;
        Some(Arc::new(SqliteVectorIndex::new(pool, embedder)))
    } else {
        None
    };
    Ok((store, index))
}

pub async fn run_init(config: &Config) -> Result<()> {
    migrate::run_migrations(config).await?;
    println!("Database initialized successfully.");
    Ok(())
}

/// Import documents; with `index` also index each upserted batch.
pub async fn run_import(config: &Config, path: &Path, index: bool) -> Result<()> {
    let docs = load_documents(path)?;
    if docs.is_empty() {
        println!("No documents found at {}.", path.display());
        return Ok(());
    }

    let (store, vector_index) = open_stores(config, index).await?;
    let mut changes = store.watch();
    let written = import_documents(store.as_ref(), &docs).await?;
    println!("Imported {} documents.", written);

    if let Some(vector_index) = vector_index {
        let sync = VectorSync::new(
            store.clone(),
            vector_index,
            config.chunking.params(),
            config.sync.page_size,
        );
        let mut chunks = 0;
        while let Some(Some(change)) = changes.next().now_or_never() {
            chunks += sync.apply_change(change).await?;
        }
        println!("Indexed {} chunks.", chunks);
    }
    Ok(())
}

pub async fn run_index(config: &Config, progress: ProgressMode) -> Result<()> {
    let (store, index) = open_stores(config, true).await?;
    let Some(index) = index else {
        bail!("Vector index unavailable");
    };
    let sync = VectorSync::new(
        store,
        index.clone(),
        config.chunking.params(),
        config.sync.page_size,
    );
    let reporter = progress.reporter();
    let state = sync.run(reporter.as_ref()).await?;
    let (processed, total) = state.progress();
    println!(
        "Indexed {} of {} documents; index holds {} chunks.",
        processed,
        total,
        index.count().await?
    );
    Ok(())
}

/// Print the chunker output for one document.
pub async fn run_chunks(config: &Config, id: &str) -> Result<()> {
    let (store, _) = open_stores(config, false).await?;
    let Some(doc) = store.find_one(id).await? else {
        bail!("Document not found: {}", id);
    };

    let set = chunk_document(&doc, &config.chunking.params());
    println!("--- Document ---");
    println!("id:           {}", doc.id);
    println!("type:         {}", doc.resource_type());
    println!("content_type: {}", doc.data_record.content_type);
    println!("kind:         {:?}", classify(&doc));
    println!();
    println!("--- Chunks ({}) ---", set.len());
    for (chunk, meta) in set.iter() {
        match chunk.window {
            Some(w) => println!("[{}] offset={} size={}", chunk.id, w.offset, w.size),
            None => println!("[{}]", chunk.id),
        }
        if let Some(section) = &meta.section_name {
            println!("section: {}", section);
        }
        println!("{}", chunk.text);
        println!();
    }
    Ok(())
}

pub async fn run_search(
    config: &Config,
    terms: &[String],
    user: Option<String>,
    limit: Option<usize>,
) -> Result<()> {
    if terms.iter().all(|t| t.trim().is_empty()) {
        println!("No results.");
        return Ok(());
    }
    let (store, index) = open_stores(config, true).await?;
    let Some(index) = index else {
        bail!("Vector index unavailable");
    };

    let k = limit.unwrap_or(config.retrieval.search_k);
    let result = iterative_search(
        terms,
        index.as_ref(),
        store.as_ref(),
        &IterativeSearchOptions {
            max_iterations: config.retrieval.max_search_iterations,
            limit: k,
            params: SearchParams { k, user_id: user },
        },
        None,
    )
    .await?;

    if result.documents.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, doc) in result.documents.iter().enumerate() {
        let date = doc
            .metadata
            .as_ref()
            .and_then(|m| m.date.as_deref())
            .unwrap_or("-");
        println!(
            "{}. {}  {}  {}",
            i + 1,
            doc.display_name().unwrap_or("(unnamed)"),
            doc.resource_type(),
            date
        );
        println!("    id: {}", doc.id);
    }
    println!();
    println!("chunks: {}", result.relevant_chunk_ids.join(", "));
    Ok(())
}

/// Answer a question, streaming tokens to stdout.
pub async fn run_ask(config: &Config, question: &str, user: Option<String>) -> Result<()> {
    // Fail on missing credentials before touching the database.
    if !config.model.is_enabled() {
        bail!("Model provider is disabled; set [model] provider in the config");
    }
    let provider = create_chat_provider(&config.model)?;
    let (store, index) = open_stores(config, true).await?;
    let Some(index) = index else {
        bail!("Vector index unavailable");
    };

    let settings = OrchestratorSettings::from_config(config).for_user(user);
    let rag = RagOrchestrator::new(
        store.as_ref(),
        index.as_ref(),
        provider.as_ref(),
        &config.model,
        settings,
    )
    .with_related(store.as_ref());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        let mut printer = AnswerPrinter::new(std::io::stdout());
        while let Some(event) = rx.recv().await {
            printer.handle(event);
        }
    });

    let result = rag.ask(&[], question, Some(tx)).await;
    printer.await?;
    result.map(|_| ())
}

/// Renders orchestrator events for `crag ask`: the answer on `out`, search
/// activity on stderr.
struct AnswerPrinter<W: Write> {
    out: W,
    /// Whether the current turn has written anything to `out`.
    streamed: bool,
}

impl<W: Write> AnswerPrinter<W> {
    fn new(out: W) -> Self {
        Self {
            out,
            streamed: false,
        }
    }

    fn handle(&mut self, event: RagEvent) {
        let _ = self.write_event(event);
    }

    fn write_event(&mut self, event: RagEvent) -> std::io::Result<()> {
        match event {
            RagEvent::Token { text } => {
                self.streamed |= !text.is_empty();
                self.out.write_all(text.as_bytes())?;
                self.out.flush()?;
            }
            RagEvent::Discard => {
                // The model's remark before its search stays on a line of its own.
                if self.streamed {
                    writeln!(self.out)?;
                }
                self.streamed = false;
            }
            RagEvent::SearchStarted { queries } => {
                eprintln!("searching: {}", queries.join(", "));
            }
            RagEvent::SearchCompleted {
                new_documents,
                total_documents,
                ..
            } => {
                eprintln!("found {} new ({} total)", new_documents, total_documents);
            }
            RagEvent::Answer { answer } => {
                if !self.streamed {
                    write!(self.out, "{}", answer.text)?;
                }
                writeln!(self.out)?;
                if !answer.documents.is_empty() {
                    writeln!(self.out)?;
                    writeln!(self.out, "--- Sources ({}) ---", answer.documents.len())?;
                    for doc in &answer.documents {
                        writeln!(
                            self.out,
                            "{}  [{}]",
                            doc.display_name().unwrap_or(doc.resource_type()),
                            doc.id
                        )?;
                    }
                }
                self.out.flush()?;
            }
        }
        Ok(())
    }
}
