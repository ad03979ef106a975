//! BSON body helpers.
//!
//! Packets carry their bodies as opaque bytes; these helpers convert between
//! those bytes and `bson::Document` for the few fields the transport layer
//! itself inspects (status codes, endpoints, offsets).

use bson::{Bson, Document};
use bytes::Bytes;
use thiserror::Error;

/// Body field carrying the application status
pub const STATUS_FIELD: &str = "status";

/// Document conversion errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    /// Document could not be serialized
    #[error("document encoding failed: {0}")]
    Encode(String),
    /// Body bytes are not a valid document
    #[error("document decoding failed: {0}")]
    Decode(String),
}

/// Serialize a document into packet body bytes
pub fn encode_doc(doc: &Document) -> Result<Bytes, DocumentError> {
    let mut buf = Vec::new();
    doc.to_writer(&mut buf)
        .map_err(|e| DocumentError::Encode(e.to_string()))?;
    Ok(Bytes::from(buf))
}

/// Parse packet body bytes; an empty body is an empty document
pub fn decode_doc(body: &[u8]) -> Result<Document, DocumentError> {
    if body.is_empty() {
        return Ok(Document::new());
    }
    Document::from_reader(body).map_err(|e| DocumentError::Decode(e.to_string()))
}

/// Integer field, accepting any numeric BSON width
pub fn get_int(doc: &Document, key: &str) -> Option<i64> {
    match doc.get(key)? {
        Bson::Int32(v) => Some(i64::from(*v)),
        Bson::Int64(v) => Some(*v),
        Bson::Double(v) if v.fract() == 0.0 => Some(*v as i64),
        _ => None,
    }
}

/// String field
pub fn get_str<'a>(doc: &'a Document, key: &str) -> Option<&'a str> {
    match doc.get(key)? {
        Bson::String(s) => Some(s.as_str()),
        _ => None,
    }
}

/// Non-empty string field
pub fn get_nonempty_str<'a>(doc: &'a Document, key: &str) -> Option<&'a str> {
    get_str(doc, key).filter(|s| !s.is_empty())
}

/// Application status; a missing field counts as success
pub fn get_status(doc: &Document) -> i64 {
    get_int(doc, STATUS_FIELD).unwrap_or(0)
}

/// Array of integers, skipping non-numeric entries
pub fn get_int_array(doc: &Document, key: &str) -> Vec<i64> {
    match doc.get(key) {
        Some(Bson::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Bson::Int32(v) => Some(i64::from(*v)),
                Bson::Int64(v) => Some(*v),
                Bson::Double(v) if v.fract() == 0.0 => Some(*v as i64),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Array of strings, skipping non-string entries
pub fn get_str_array(doc: &Document, key: &str) -> Vec<String> {
    match doc.get(key) {
        Some(Bson::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Bson::String(s) => Some(s.clone()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}
