//! # Clinical RAG Core
//!
//! Runtime-agnostic logic for Clinical RAG: data models, the deterministic
//! chunker, the embedding trait, store abstractions and document search.
//!
//! This crate contains no tokio, sqlx, filesystem I/O or HTTP clients.
//! Async traits are driven by whatever executor the caller brings.

pub mod chunk;
pub mod embedding;
pub mod models;
pub mod search;
pub mod store;
