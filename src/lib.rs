//! # Clinical RAG
//!
//! Retrieval-augmented question answering over a patient's own clinical
//! records.
//!
//! Records imported from patient portals are chunked deterministically,
//! embedded into a vector index, and retrieved, filtered, reranked and fed to
//! a chat model that may ask for more searches before it answers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌──────────────┐
//! │  import  │──▶│   SQLite    │──▶│  VectorSync  │
//! │ JSON/XML │   │  documents  │   │ chunk+embed  │
//! └──────────┘   └──────┬──────┘   └──────┬───────┘
//!                       │                 ▼
//!                       │          ┌──────────────┐
//!                       └─────────▶│    search    │
//!                                  └──────┬───────┘
//!                                         ▼
//!               ┌──────────┐       ┌──────────────┐
//!               │  rerank  │◀──────│   context    │
//!               └──────────┘       └──────┬───────┘
//!                                         ▼
//!                                  ┌──────────────┐
//!                                  │ orchestrator │◀──▶ chat model
//!                                  └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! crag init                        # create database
//! crag import ./records --index    # load and index documents
//! crag search "hemoglobin a1c"
//! crag ask "How has my A1c changed this year?"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite document store and vector index |
//! | [`embedding`] | Embedding provider backends |
//! | [`llm`] | Chat model provider abstraction |
//! | [`sync`] | Vector sync engine |
//! | [`rerank`] | LLM reranking and threshold selection |
//! | [`context`] | Context preparation pipeline |
//! | [`orchestrator`] | Question-answering loop |
//! | [`import`] | Bulk document import |
//! | [`commands`] | `crag` subcommand implementations |
//!
//! Chunking, the store traits and document search live in
//! `clinical-rag-core`.

pub mod commands;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod import;
pub mod llm;
pub mod migrate;
pub mod orchestrator;
pub mod progress;
pub mod rerank;
pub mod retry;
pub mod sqlite_store;
pub mod sync;
