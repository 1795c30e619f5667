//! Parser for the delimited record format the extraction prompt asks for:
//!
//! ```text
//! ("entity"<|>PARIS<|>LOCATION<|>Capital of France)##
//! ("relationship"<|>PARIS<|>FRANCE<|>Paris is the capital of France<|>9)##
//! <|COMPLETE|>
//! ```

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::debug;

use crate::schema::{EntityRecord, ExtractionOutput, ExtractionRecord, RelationRecord};

pub const TUPLE_DELIMITER: &str = "<|>";
pub const RECORD_DELIMITER: &str = "##";
pub const COMPLETION_DELIMITER: &str = "<|COMPLETE|>";

static RECORD_BODY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\((.*)\)").expect("record body pattern is valid"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record has no parenthesised body")]
    NoBody,

    #[error("unknown record kind {0:?}")]
    UnknownKind(String),

    #[error("{kind} record has {found} fields, expected at least {expected}")]
    TooFewFields {
        kind: &'static str,
        found: usize,
        expected: usize,
    },

    #[error("{0} record has an empty name")]
    EmptyName(&'static str),
}

/// Split on any of `markers`, trimming pieces and dropping empty ones.
pub fn split_by_markers<'a>(text: &'a str, markers: &[&str]) -> Vec<&'a str> {
    let mut pieces = vec![text];
    for marker in markers {
        pieces = pieces
            .into_iter()
            .flat_map(|piece| piece.split(*marker))
            .collect();
    }
    pieces
        .into_iter()
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .collect()
}

/// Trim whitespace and wrapping quotes, drop control characters and
/// decode the HTML entities models like to emit.
pub fn clean_field(raw: &str) -> String {
    let unescaped = raw
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&");
    let stripped: String = unescaped.chars().filter(|c| !c.is_control()).collect();
    stripped
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .trim()
        .to_string()
}

fn clean_name(raw: &str) -> String {
    clean_field(&raw.to_uppercase())
}

/// Parse one record into an entity or a relation.
pub fn parse_record(record: &str, chunk_id: &str) -> Result<ExtractionRecord, RecordError> {
    let body = RECORD_BODY
        .captures(record)
        .and_then(|caps| caps.get(1))
        .ok_or(RecordError::NoBody)?
        .as_str();

    let fields = split_by_markers(body, &[TUPLE_DELIMITER]);
    let kind = fields
        .first()
        .map(|k| clean_field(k).to_lowercase())
        .unwrap_or_default();

    match kind.as_str() {
        "entity" => parse_entity(&fields, chunk_id).map(ExtractionRecord::Entity),
        "relationship" | "relation" => {
            parse_relation(&fields, chunk_id).map(ExtractionRecord::Relation)
        }
        _ => Err(RecordError::UnknownKind(kind)),
    }
}

fn parse_entity(fields: &[&str], chunk_id: &str) -> Result<EntityRecord, RecordError> {
    if fields.len() < 4 {
        return Err(RecordError::TooFewFields {
            kind: "entity",
            found: fields.len(),
            expected: 4,
        });
    }

    let entity_name = clean_name(fields[1]);
    if entity_name.is_empty() {
        return Err(RecordError::EmptyName("entity"));
    }

    Ok(EntityRecord {
        entity_name,
        entity_type: clean_name(fields[2]),
        description: clean_field(fields[3]),
        source_id: chunk_id.to_string(),
    })
}

fn parse_relation(fields: &[&str], chunk_id: &str) -> Result<RelationRecord, RecordError> {
    if fields.len() < 3 {
        return Err(RecordError::TooFewFields {
            kind: "relationship",
            found: fields.len(),
            expected: 3,
        });
    }

    let src_id = clean_name(fields[1]);
    let tgt_id = clean_name(fields[2]);
    if src_id.is_empty() || tgt_id.is_empty() {
        return Err(RecordError::EmptyName("relationship"));
    }

    Ok(RelationRecord {
        src_id,
        tgt_id,
        description: fields.get(3).map(|d| clean_field(d)).unwrap_or_default(),
        source_id: chunk_id.to_string(),
    })
}

/// Parse a full model response. Records that fail to parse are dropped.
pub fn parse_response(response: &str, chunk_id: &str) -> ExtractionOutput {
    let mut output = ExtractionOutput::default();
    let mut discarded = 0usize;

    for record in split_by_markers(response, &[RECORD_DELIMITER, COMPLETION_DELIMITER]) {
        match parse_record(record, chunk_id) {
            Ok(parsed) => output.push(parsed),
            Err(e) => {
                discarded += 1;
                debug!(chunk_id, error = %e, "Discarding record");
            }
        }
    }

    debug!(
        chunk_id,
        entities = output.entity_count(),
        relations = output.relation_count(),
        discarded,
        "Parsed extraction response"
    );
    output
}
