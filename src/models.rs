//! Core data models used throughout the maintenance pipeline.
//!
//! Documents are owned by the remote index. Everything here is a
//! client-side view of them: transient hits from a query, and the
//! corrections an operator stages against them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Field name to value mapping carried by every document.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// A stored record: an opaque id plus its fields.
///
/// Ids always come from the index; nothing in this crate generates one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// String value of `field`, if present and a string.
    pub fn text(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(|v| v.as_str())
    }
}

/// A ranked query result: a document plus its score and highlight fragments.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub document: Document,
    pub score: f64,
    /// Field name to ordered fragments, each with the matched span wrapped
    /// in the configured markers.
    pub highlights: BTreeMap<String, Vec<String>>,
}

impl Hit {
    pub fn id(&self) -> &str {
        &self.document.id
    }
}

/// A staged change to a single document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Correction {
    /// Replace the document's fields, keeping its id.
    Edit { doc_id: String, fields: Fields },
    /// Remove the document.
    Delete { doc_id: String },
}

impl Correction {
    pub fn doc_id(&self) -> &str {
        match self {
            Correction::Edit { doc_id, .. } | Correction::Delete { doc_id } => doc_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Correction::Edit { .. } => "edit",
            Correction::Delete { .. } => "delete",
        }
    }
}

/// At most one staged correction per document id.
///
/// Staging a second correction for the same id replaces the first, so an
/// edit followed by a delete resolves to the delete.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrectionBatch {
    entries: BTreeMap<String, Correction>,
}

impl CorrectionBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a correction, returning the one it replaced, if any.
    pub fn stage(&mut self, correction: Correction) -> Option<Correction> {
        self.entries
            .insert(correction.doc_id().to_string(), correction)
    }

    pub fn get(&self, doc_id: &str) -> Option<&Correction> {
        self.entries.get(doc_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Correction> {
        self.entries.values()
    }

    /// Count of (edits, deletes).
    pub fn counts(&self) -> (usize, usize) {
        self.iter().fold((0, 0), |(e, d), c| match c {
            Correction::Edit { .. } => (e + 1, d),
            Correction::Delete { .. } => (e, d + 1),
        })
    }
}

impl FromIterator<Correction> for CorrectionBatch {
    fn from_iter<I: IntoIterator<Item = Correction>>(iter: I) -> Self {
        let mut batch = CorrectionBatch::new();
        for c in iter {
            batch.stage(c);
        }
        batch
    }
}
