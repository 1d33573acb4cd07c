//! Bulk import of clinical documents.
//!
//! Accepts a single file or a directory tree. Files may hold a JSON array of
//! documents, one document object, or newline-delimited JSON (one document
//! per line). Directories are walked recursively and every `.json`,
//! `.ndjson` and `.jsonl` file is loaded in path order.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::Value;
use walkdir::WalkDir;

use clinical_rag_core::models::ClinicalDocument;
use clinical_rag_core::store::DocumentStore;

/// Documents written per `bulk_upsert` call.
pub const IMPORT_BATCH_SIZE: usize = 500;

const IMPORT_EXTENSIONS: &[&str] = &["json", "ndjson", "jsonl"];

/// Load every document found at `path`.
pub fn load_documents(path: &Path) -> Result<Vec<ClinicalDocument>> {
    if !path.exists() {
        bail!("Import path does not exist: {}", path.display());
    }
    if path.is_file() {
        return load_file(path);
    }

    let mut files: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(path) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let matches = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMPORT_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if matches {
            files.push(entry.into_path());
        }
    }
    files.sort();

    let mut docs = Vec::new();
    for file in &files {
        docs.extend(load_file(file)?);
    }
    tracing::debug!(files = files.len(), documents = docs.len(), "import files loaded");
    Ok(docs)
}

fn load_file(path: &Path) -> Result<Vec<ClinicalDocument>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read import file: {}", path.display()))?;
    parse_documents(&content).with_context(|| format!("Invalid import file: {}", path.display()))
}

/// Parse a JSON array, a single object, or NDJSON.
pub fn parse_documents(content: &str) -> Result<Vec<ClinicalDocument>> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return match value {
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| {
                    serde_json::from_value(item)
                        .with_context(|| format!("Invalid document at index {}", i))
                })
                .collect(),
            Value::Object(_) => Ok(vec![serde_json::from_value(value)
                .with_context(|| "Invalid document")?]),
            _ => bail!("Expected a document object or an array of documents"),
        };
    }

    trimmed
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).with_context(|| format!("Invalid document on line {}", n + 1))
        })
        .collect()
}

/// Upsert `docs` in batches; returns the number written.
pub async fn import_documents(store: &dyn DocumentStore, docs: &[ClinicalDocument]) -> Result<usize> {
    let mut written = 0;
    for batch in docs.chunks(IMPORT_BATCH_SIZE) {
        written += store.bulk_upsert(batch).await?;
    }
    tracing::info!(documents = written, "import complete");
    Ok(written)
}
