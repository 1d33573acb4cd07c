//! Core data models used throughout Clinical RAG.
//!
//! These types represent the clinical documents, chunks, and search results
//! that flow through the indexing and retrieval pipeline. Documents are
//! created by upstream sync collaborators and are read-only here; chunks are
//! derived on demand and only ever persisted inside a vector index.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Resource type tag for laboratory observations.
pub const RESOURCE_OBSERVATION: &str = "Observation";
/// Resource type tag for diagnostic reports.
pub const RESOURCE_DIAGNOSTIC_REPORT: &str = "DiagnosticReport";

/// One clinical record as stored by the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClinicalDocument {
    /// Composite key assigned by the sync collaborator
    /// (connection, resource type and source id folded into one string).
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// The portal connection this record was pulled from.
    pub connection_id: String,
    pub data_record: DataRecord,
    #[serde(default)]
    pub metadata: Option<DocumentMetadata>,
}

/// The raw payload of a record plus its format descriptors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    /// Structured JSON resource, or a JSON string holding an XML document.
    pub raw: Value,
    /// Format tag, e.g. `FHIR.R4` or `CCDA`.
    pub format: String,
    pub content_type: String,
    pub resource_type: String,
    #[serde(default)]
    pub version_history: Vec<Value>,
}

/// Optional descriptive metadata extracted by the sync collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Identifier of the record inside the source system.
    #[serde(default)]
    pub id: Option<String>,
    /// Clinically relevant date (ISO 8601 date or date-time).
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub codes: Vec<CodeRef>,
}

/// A coded concept (LOINC, SNOMED, ...) attached to a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodeRef {
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub display: Option<String>,
}

impl ClinicalDocument {
    pub fn resource_type(&self) -> &str {
        &self.data_record.resource_type
    }

    pub fn is_lab_observation(&self) -> bool {
        self.resource_type() == RESOURCE_OBSERVATION
    }

    pub fn is_diagnostic_report(&self) -> bool {
        self.resource_type() == RESOURCE_DIAGNOSTIC_REPORT
    }

    /// Codes with a non-empty `code` value.
    pub fn codes(&self) -> Vec<&CodeRef> {
        self.metadata
            .as_ref()
            .map(|m| {
                m.codes
                    .iter()
                    .filter(|c| c.code.as_deref().is_some_and(|v| !v.is_empty()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn display_name(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.display_name.as_deref())
    }

    /// The record's clinical date, if present and parseable.
    ///
    /// Accepts RFC 3339 date-times and `YYYY-MM-DD`, `YYYY-MM` or `YYYY`
    /// dates (interpreted as midnight UTC on the first day).
    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.metadata
            .as_ref()
            .and_then(|m| m.date.as_deref())
            .and_then(parse_clinical_date)
    }
}

/// Parse the loose date formats found in clinical records.
pub fn parse_clinical_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(&format!("{}-01", s), "%Y-%m-%d"))
        .or_else(|_| NaiveDate::parse_from_str(&format!("{}-01-01", s), "%Y-%m-%d"))
        .ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

/// Position of a tile inside the text it was cut from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkWindow {
    /// Start offset in characters.
    pub offset: usize,
    /// Length in characters.
    pub size: usize,
}

/// A bounded, independently embeddable slice of a document's serialized text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Deterministic id, see [`crate::chunk::chunk_id`].
    pub id: String,
    pub text: String,
    /// Set only when the text was tiled.
    pub window: Option<ChunkWindow>,
    /// SHA-256 of `text`, used for embedding staleness detection.
    pub hash: String,
}

/// Vector-index payload stored alongside each chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Record format family, e.g. `FHIR.R4` or `CCDA`.
    pub category: String,
    /// Resource type of the source document.
    pub document_type: String,
    /// Connection the document came from.
    pub source_id: String,
    pub document_id: String,
    #[serde(default)]
    pub section_name: Option<String>,
    pub chunk_number: usize,
    #[serde(default)]
    pub is_full_document: bool,
    pub user_id: String,
    #[serde(default)]
    pub url: Option<String>,
}

impl ChunkMetadata {
    /// The chunk id this metadata describes.
    pub fn chunk_id(&self) -> String {
        crate::chunk::chunk_id(
            &self.document_id,
            self.chunk_number,
            self.section_name.as_deref(),
        )
    }
}

/// Chunker output: chunks and their metadata as parallel arrays.
///
/// Both vectors always have the same length and order; the only way to add
/// an entry is [`ChunkSet::push`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkSet {
    chunks: Vec<Chunk>,
    metadata: Vec<ChunkMetadata>,
}

impl ChunkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: Chunk, metadata: ChunkMetadata) {
        self.chunks.push(chunk);
        self.metadata.push(metadata);
    }

    pub fn extend(&mut self, other: ChunkSet) {
        self.chunks.extend(other.chunks);
        self.metadata.extend(other.metadata);
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn metadata(&self) -> &[ChunkMetadata] {
        &self.metadata
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Chunk, &ChunkMetadata)> {
        self.chunks.iter().zip(self.metadata.iter())
    }

    pub fn into_parts(self) -> (Vec<Chunk>, Vec<ChunkMetadata>) {
        (self.chunks, self.metadata)
    }
}

/// Result of a document search.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchResult {
    /// Resolved documents, one per distinct document id, in hit order.
    pub documents: Vec<ClinicalDocument>,
    /// Every chunk id returned by the index, including those of
    /// already-resolved documents.
    pub relevant_chunk_ids: Vec<String>,
    pub search_terms: Vec<String>,
    /// `1.0` when at least one document resolved, else `0.0`.
    pub confidence: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_clinical_date_formats() {
        assert!(parse_clinical_date("2023-04-05T10:00:00Z").is_some());
        assert!(parse_clinical_date("2023-04-05T10:00:00+02:00").is_some());
        assert_eq!(
            parse_clinical_date("2023-04"),
            parse_clinical_date("2023-04-01")
        );
        assert_eq!(parse_clinical_date("2023"), parse_clinical_date("2023-01-01"));
        assert!(parse_clinical_date("not a date").is_none());
    }

    #[test]
    fn test_metadata_chunk_id_matches_chunker() {
        let meta = ChunkMetadata {
            category: "CCDA".into(),
            document_type: "ClinicalDocument".into(),
            source_id: "conn".into(),
            document_id: "doc".into(),
            section_name: Some("Medications".into()),
            chunk_number: 2,
            is_full_document: false,
            user_id: "u1".into(),
            url: None,
        };
        assert_eq!(meta.chunk_id(), "doc__chunk_2__section_Medications");
    }
}
