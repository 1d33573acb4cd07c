//! Deterministic chunker/serializer for clinical documents.
//!
//! Turns one [`ClinicalDocument`] into a [`ChunkSet`]: parallel arrays of
//! [`Chunk`]s and [`ChunkMetadata`]. Chunk ids depend only on the document
//! id, the chunk number and the optional section name, so re-chunking an
//! unchanged document reproduces byte-identical ids and the vector index can
//! treat a re-sync as an overwrite.
//!
//! # Dispatch
//!
//! | Content | Output |
//! |---------|--------|
//! | Structured JSON | one chunk (`__chunk_0`) of unique flattened values joined by `\|`, capped |
//! | CCDA XML | a `FULL_DOCUMENT\|` chunk-set plus one `{section}\|` chunk-set per section |
//! | Other XML | the raw string, tiled, no prefix |
//! | Anything else | no chunks |
//!
//! # Tiling
//!
//! Text longer than `tile_size` (S) is cut into windows of S characters
//! starting at 0 and advancing by `S - tile_overlap` until a window reaches
//! the end of the text. This yields `ceil((L - O) / (S - O))` tiles, each
//! overlapping its successor by exactly O characters. Text of at most S
//! characters is a single chunk without a window.
//!
//! # Example
//!
//! ```rust
//! use clinical_rag_core::chunk::{tile_text, chunk_id};
//!
//! let tiles = tile_text(&"a".repeat(250), 100, 20);
//! assert_eq!(tiles.len(), 3);
//! assert_eq!(chunk_id("doc", 0, None), "doc__chunk_0");
//! ```

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::models::{Chunk, ChunkMetadata, ChunkSet, ChunkWindow, ClinicalDocument};

/// Character cap for the serialized text of a structured JSON record.
pub const JSON_CHAR_CAP: usize = 18_000;
/// Default tile width in characters.
pub const DEFAULT_TILE_SIZE: usize = 2_000;
/// Default overlap between adjacent tiles in characters.
pub const DEFAULT_TILE_OVERLAP: usize = 200;
/// Prefix of the synthetic whole-document chunk-set of a CCDA.
pub const FULL_DOCUMENT_PREFIX: &str = "FULL_DOCUMENT";
/// Separator between flattened JSON values and after chunk prefixes.
pub const VALUE_SEPARATOR: &str = "|";

/// Bundle wrapper fields removed from a structured record before flattening.
const WRAPPER_FIELDS: &[&str] = &["link", "fullUrl", "search"];
/// Resource fields removed before flattening; they carry ids and
/// bookkeeping, not clinical content.
const RESOURCE_NOISE_FIELDS: &[&str] = &["category", "subject", "id", "status", "identifier"];

/// Chunking tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingParams {
    pub tile_size: usize,
    pub tile_overlap: usize,
    pub json_char_cap: usize,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            tile_overlap: DEFAULT_TILE_OVERLAP,
            json_char_cap: JSON_CHAR_CAP,
        }
    }
}

/// How a document's payload will be chunked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    StructuredJson,
    Ccda,
    GenericXml,
    Unsupported,
}

/// Build the deterministic id of a chunk.
///
/// Format: `{document_id}__chunk_{n}` with `__section_{name}` appended for
/// section chunk-sets.
pub fn chunk_id(document_id: &str, chunk_number: usize, section: Option<&str>) -> String {
    match section {
        Some(name) => format!("{}__chunk_{}__section_{}", document_id, chunk_number, name),
        None => format!("{}__chunk_{}", document_id, chunk_number),
    }
}

/// Decide which chunking strategy applies to a document.
pub fn classify(doc: &ClinicalDocument) -> DocumentKind {
    let content_type = doc
        .data_record
        .content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    if content_type.ends_with("json") {
        return DocumentKind::StructuredJson;
    }
    if content_type.ends_with("xml") {
        return match doc.data_record.raw.as_str() {
            Some(xml) if is_ccda(&doc.data_record.format, xml) => DocumentKind::Ccda,
            Some(_) => DocumentKind::GenericXml,
            None => DocumentKind::Unsupported,
        };
    }
    DocumentKind::Unsupported
}

fn is_ccda(format: &str, xml: &str) -> bool {
    format.eq_ignore_ascii_case("ccda")
        || (xml.contains("<ClinicalDocument") && xml.contains("urn:hl7-org:v3"))
}

/// Chunk one document.
///
/// Unsupported content yields an empty set; the document stays stored but
/// is never indexed.
pub fn chunk_document(doc: &ClinicalDocument, params: &ChunkingParams) -> ChunkSet {
    match classify(doc) {
        DocumentKind::StructuredJson => chunk_structured_json(doc, params),
        DocumentKind::Ccda => {
            let xml = doc.data_record.raw.as_str().unwrap_or_default();
            match parse_ccda_sections(xml) {
                Ok(sections) => chunk_ccda(doc, &sections, params),
                Err(e) => {
                    tracing::warn!(
                        document_id = %doc.id,
                        error = %e,
                        "CCDA parse failed, tiling raw XML instead"
                    );
                    chunk_generic_xml(doc, xml, params)
                }
            }
        }
        DocumentKind::GenericXml => {
            let xml = doc.data_record.raw.as_str().unwrap_or_default();
            chunk_generic_xml(doc, xml, params)
        }
        DocumentKind::Unsupported => {
            tracing::debug!(
                document_id = %doc.id,
                content_type = %doc.data_record.content_type,
                "unsupported content type, no chunks"
            );
            ChunkSet::new()
        }
    }
}

fn chunk_structured_json(doc: &ClinicalDocument, params: &ChunkingParams) -> ChunkSet {
    let text = serialize_json_record(&doc.data_record.raw, params.json_char_cap);
    let mut set = ChunkSet::new();
    set.push(
        make_chunk(chunk_id(&doc.id, 0, None), text, None),
        base_metadata(doc),
    );
    set
}

fn chunk_generic_xml(doc: &ClinicalDocument, xml: &str, params: &ChunkingParams) -> ChunkSet {
    let mut set = ChunkSet::new();
    push_tiles(&mut set, doc, xml, None, None, false, params);
    set
}

fn chunk_ccda(doc: &ClinicalDocument, sections: &[CcdaSection], params: &ChunkingParams) -> ChunkSet {
    let mut set = ChunkSet::new();
    let non_empty: Vec<&CcdaSection> = sections.iter().filter(|s| !s.text.is_empty()).collect();

    if !non_empty.is_empty() {
        let full = non_empty
            .iter()
            .map(|s| format!("{}{}{}", s.name, VALUE_SEPARATOR, s.text))
            .collect::<Vec<_>>()
            .join("\n");
        push_tiles(
            &mut set,
            doc,
            &full,
            Some(FULL_DOCUMENT_PREFIX),
            None,
            true,
            params,
        );
    }

    for section in non_empty {
        push_tiles(
            &mut set,
            doc,
            &section.text,
            Some(&section.name),
            Some(&section.name),
            false,
            params,
        );
    }
    set
}

/// Tile `text` and append one chunk per tile, numbered from 0.
fn push_tiles(
    set: &mut ChunkSet,
    doc: &ClinicalDocument,
    text: &str,
    prefix: Option<&str>,
    section: Option<&str>,
    is_full_document: bool,
    params: &ChunkingParams,
) {
    for (n, tile) in tile_text(text, params.tile_size, params.tile_overlap)
        .into_iter()
        .enumerate()
    {
        let body = match prefix {
            Some(p) => format!("{}{}{}", p, VALUE_SEPARATOR, tile.text),
            None => tile.text,
        };
        let mut meta = base_metadata(doc);
        meta.chunk_number = n;
        meta.section_name = section.map(str::to_string);
        meta.is_full_document = is_full_document;
        set.push(make_chunk(chunk_id(&doc.id, n, section), body, tile.window), meta);
    }
}

fn base_metadata(doc: &ClinicalDocument) -> ChunkMetadata {
    ChunkMetadata {
        category: doc.data_record.format.clone(),
        document_type: doc.data_record.resource_type.clone(),
        source_id: doc.connection_id.clone(),
        document_id: doc.id.clone(),
        section_name: None,
        chunk_number: 0,
        is_full_document: false,
        user_id: doc.user_id.clone(),
        url: doc
            .data_record
            .raw
            .get("fullUrl")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

fn make_chunk(id: String, text: String, window: Option<ChunkWindow>) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());
    Chunk {
        id,
        text,
        window,
        hash,
    }
}

// ─── Tiling ─────────────────────────────────────────────────────────

/// One window of tiled text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    pub text: String,
    /// `None` when the text fit in a single untiled chunk.
    pub window: Option<ChunkWindow>,
}

/// Slide a `size`-character window over `text`, advancing by
/// `size - overlap`, stopping once a window reaches the end.
///
/// Offsets and sizes are measured in characters, never bytes, so
/// multi-byte text is never split inside a code point.
pub fn tile_text(text: &str, size: usize, overlap: usize) -> Vec<Tile> {
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    let size = size.max(1);

    if len <= size {
        return vec![Tile {
            text: text.to_string(),
            window: None,
        }];
    }

    let step = size.saturating_sub(overlap).max(1);
    let mut tiles = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + size).min(len);
        tiles.push(Tile {
            text: chars[start..end].iter().collect(),
            window: Some(ChunkWindow {
                offset: start,
                size: end - start,
            }),
        });
        if end >= len {
            break;
        }
        start += step;
    }
    tiles
}

// ─── Structured JSON ────────────────────────────────────────────────

/// Serialize a structured record into `|`-joined unique leaf values.
///
/// The payload is cloned, wrapper and bookkeeping fields are removed, the
/// rest is flattened to path/value pairs, and the unique values are joined
/// in flattened-key order. The result is capped at `cap` characters.
pub fn serialize_json_record(raw: &Value, cap: usize) -> String {
    let mut value = match raw {
        Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| raw.clone()),
        other => other.clone(),
    };
    strip_noise(&mut value);

    let mut pairs = flatten_json(&value);
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut seen: HashSet<&str> = HashSet::new();
    let unique: Vec<&str> = pairs
        .iter()
        .map(|(_, v)| v.as_str())
        .filter(|v| seen.insert(v))
        .collect();
    let joined = unique.join(VALUE_SEPARATOR);

    if joined.chars().count() > cap {
        joined.chars().take(cap).collect()
    } else {
        joined
    }
}

/// Remove bundle wrapper fields and resource bookkeeping fields.
///
/// Bookkeeping fields are removed from the nested `resource` object when
/// the payload is a bundle entry, otherwise from the payload itself.
fn strip_noise(value: &mut Value) {
    let Some(obj) = value.as_object_mut() else {
        return;
    };
    for field in WRAPPER_FIELDS {
        obj.remove(*field);
    }
    let target = match obj.get_mut("resource") {
        Some(Value::Object(resource)) => resource,
        _ => obj,
    };
    for field in RESOURCE_NOISE_FIELDS {
        target.remove(*field);
    }
}

/// Flatten a JSON value into `(dotted.path, stringified value)` pairs.
///
/// Arrays flatten index-wise (`a.0`, `a.1`). Empty objects and arrays are
/// leaves rendered as `{}` and `[]`; `null` is rendered as `null`; strings
/// are emitted without quotes.
pub fn flatten_json(value: &Value) -> Vec<(String, String)> {
    let mut out = Vec::new();
    flatten_into(String::new(), value, &mut out);
    out
}

fn flatten_into(path: String, value: &Value, out: &mut Vec<(String, String)>) {
    let join = |key: &str| {
        if path.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", path, key)
        }
    };
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (k, v) in map {
                flatten_into(join(k), v, out);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (i, v) in items.iter().enumerate() {
                flatten_into(join(&i.to_string()), v, out);
            }
        }
        Value::String(s) => out.push((path, s.clone())),
        other => out.push((path, other.to_string())),
    }
}

// ─── CCDA ───────────────────────────────────────────────────────────

/// A named section of a CCDA document with its flattened narrative text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CcdaSection {
    pub name: String,
    pub text: String,
}

#[derive(Default)]
struct SectionBuilder {
    title: String,
    code_name: Option<String>,
    parts: Vec<String>,
}

/// Parse the top-level `<section>` elements of a CCDA document.
///
/// Section names come from the section's own `<title>`, falling back to
/// its `<code displayName=..>` and then to `Section {n}`. Nested
/// subsections are folded into their parent's text. Repeated names are
/// made unique with a ` (n)` suffix so section chunk ids never collide.
pub fn parse_ccda_sections(xml: &str) -> Result<Vec<CcdaSection>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut sections: Vec<CcdaSection> = Vec::new();
    let mut current: Option<SectionBuilder> = None;
    // Open elements inside the current top-level section (the section itself is 1).
    let mut depth = 0usize;
    let mut title_depth: Option<usize> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let is_section = e.local_name().as_ref() == b"section";
                match current.as_mut() {
                    None if is_section => {
                        current = Some(SectionBuilder::default());
                        depth = 1;
                    }
                    None => {}
                    Some(builder) => {
                        depth += 1;
                        if depth == 2 {
                            match e.local_name().as_ref() {
                                b"title" if builder.title.is_empty() => title_depth = Some(depth),
                                b"code" => builder.code_name = display_name_attr(&e)?,
                                _ => {}
                            }
                        }
                    }
                }
            }
            Event::Empty(e) => {
                if let Some(builder) = current.as_mut() {
                    if depth == 1 && e.local_name().as_ref() == b"code" {
                        builder.code_name = display_name_attr(&e)?;
                    }
                }
            }
            Event::End(_) => {
                if let Some(builder) = current.as_mut() {
                    if title_depth == Some(depth) {
                        title_depth = None;
                    }
                    depth -= 1;
                    if depth == 0 {
                        let finished = std::mem::take(builder);
                        current = None;
                        sections.push(finish_section(finished, sections.len()));
                    }
                }
            }
            Event::Text(t) => {
                if let Some(builder) = current.as_mut() {
                    let text = t.unescape()?.into_owned();
                    push_text(builder, title_depth.is_some(), text);
                }
            }
            Event::CData(c) => {
                if let Some(builder) = current.as_mut() {
                    let text = String::from_utf8_lossy(&c.into_inner()).into_owned();
                    push_text(builder, title_depth.is_some(), text);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(dedupe_section_names(sections))
}

fn display_name_attr(e: &BytesStart<'_>) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.local_name().as_ref() == b"displayName" {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

fn push_text(builder: &mut SectionBuilder, in_title: bool, text: String) {
    if in_title {
        if !builder.title.is_empty() {
            builder.title.push(' ');
        }
        builder.title.push_str(text.trim());
    } else {
        builder.parts.push(text);
    }
}

fn finish_section(builder: SectionBuilder, index: usize) -> CcdaSection {
    let name = if !builder.title.trim().is_empty() {
        builder.title.trim().to_string()
    } else {
        builder
            .code_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("Section {}", index + 1))
    };
    let text = builder
        .parts
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    CcdaSection { name, text }
}

fn dedupe_section_names(sections: Vec<CcdaSection>) -> Vec<CcdaSection> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    sections
        .into_iter()
        .map(|mut s| {
            let n = counts.entry(s.name.clone()).or_insert(0);
            *n += 1;
            if *n > 1 {
                s.name = format!("{} ({})", s.name, n);
            }
            s
        })
        .collect()
}
