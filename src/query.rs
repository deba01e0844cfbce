//! Read-only queries against the index.
//!
//! [`Query`] enumerates the query shapes the maintenance commands need and
//! compiles each into the index's JSON query DSL. [`QueryService`] issues a
//! single ranked search and returns hits ordered by score, highest first.
//!
//! # Shapes
//!
//! | Shape | Matches |
//! |-------|---------|
//! | [`Query::Tolerant`] | phrase within `slop` positions, OR any of the words |
//! | [`Query::Contains`] | field contains the term anywhere |
//! | [`Query::Empty`] | field absent, `""`, or blank after trimming |
//! | [`Query::MultiField`] | the same text across several boosted fields |
//! | [`Query::All`] | every document (full export) |

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::HighlightConfig;
use crate::error::IndexError;
use crate::index::{IndexClient, SearchRequest};
use crate::models::Hit;

/// A field participating in a multi-field match, with its relevance weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostedField {
    pub field: String,
    pub boost: f64,
}

impl BoostedField {
    pub fn new(field: impl Into<String>, boost: f64) -> Self {
        Self {
            field: field.into(),
            boost,
        }
    }
}

/// Parses `name` or `name^boost`; the boost must be a positive number.
impl std::str::FromStr for BoostedField {
    type Err = String;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let (name, boost) = match spec.split_once('^') {
            Some((name, boost)) => {
                let boost: f64 = boost
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid boost in '{}'", spec))?;
                (name.trim(), boost)
            }
            None => (spec.trim(), 1.0),
        };
        if name.is_empty() {
            return Err(format!("missing field name in '{}'", spec));
        }
        if !boost.is_finite() || boost <= 0.0 {
            return Err(format!("boost must be a positive number in '{}'", spec));
        }
        Ok(Self::new(name, boost))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Query {
    Tolerant {
        field: String,
        text: String,
        slop: u32,
    },
    Contains {
        field: String,
        term: String,
    },
    Empty {
        field: String,
    },
    MultiField {
        text: String,
        fields: Vec<BoostedField>,
    },
    All,
}

impl Query {
    /// Fields this query reads, in declaration order.
    pub fn fields(&self) -> Vec<&str> {
        match self {
            Query::Tolerant { field, .. } | Query::Contains { field, .. } | Query::Empty { field } => {
                vec![field.as_str()]
            }
            Query::MultiField { fields, .. } => fields.iter().map(|f| f.field.as_str()).collect(),
            Query::All => Vec::new(),
        }
    }

    /// Reject shapes the index would refuse anyway, before a round trip.
    pub fn validate(&self) -> Result<(), IndexError> {
        let reason = match self {
            Query::Tolerant { field, text, .. } if field.trim().is_empty() || text.trim().is_empty() => {
                Some("tolerant phrase search needs a field and non-empty text")
            }
            Query::Contains { field, term } if field.trim().is_empty() || term.is_empty() => {
                Some("substring match needs a field and a non-empty term")
            }
            Query::Empty { field } if field.trim().is_empty() => Some("emptiness check needs a field"),
            Query::MultiField { text, fields } if text.trim().is_empty() || fields.is_empty() => {
                Some("multi-field match needs text and at least one field")
            }
            Query::MultiField { fields, .. } if fields.iter().any(|f| f.field.trim().is_empty()) => {
                Some("multi-field match has an empty field name")
            }
            _ => None,
        };
        match reason {
            Some(reason) => Err(IndexError::Query {
                query: self.to_dsl(".keyword").to_string(),
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Compile to the index query DSL.
    ///
    /// `keyword_suffix` names the un-analyzed sub-field used for the exact
    /// empty-string and trimmed-blank checks of [`Query::Empty`], and for
    /// matching a [`Query::Contains`] term that spans several words.
    pub fn to_dsl(&self, keyword_suffix: &str) -> Value {
        match self {
            Query::Tolerant { field, text, slop } => json!({
                "bool": {
                    "should": [
                        { "match_phrase": { field.as_str(): { "query": text, "slop": slop } } },
                        { "match": { field.as_str(): { "query": text, "operator": "or" } } }
                    ],
                    "minimum_should_match": 1
                }
            }),
            Query::Contains { field, term } => {
                let exact = format!("{}{}", field, keyword_suffix);
                let pattern = format!("*{}*", escape_wildcard(term));
                // whole value on the keyword sub-field; analyzed tokens for long values
                let mut should = vec![json!({
                    "wildcard": { exact.as_str(): { "value": &pattern, "case_insensitive": true } }
                })];
                if term.split_whitespace().nth(1).is_some() {
                    should.push(json!({ "match_phrase": { field.as_str(): term } }));
                } else {
                    should.push(json!({
                        "wildcard": { field.as_str(): { "value": &pattern, "case_insensitive": true } }
                    }));
                }
                json!({ "bool": { "should": should, "minimum_should_match": 1 } })
            }
            Query::Empty { field } => {
                let exact = format!("{}{}", field, keyword_suffix);
                json!({
                    "bool": {
                        "should": [
                            { "bool": { "must_not": { "exists": { "field": field } } } },
                            { "term": { exact.as_str(): "" } },
                            { "script": { "script": {
                                "source": "def f = params.f; doc.containsKey(f) && doc[f].size() > 0 && doc[f].value.trim().isEmpty()",
                                "params": { "f": exact }
                            } } }
                        ],
                        "minimum_should_match": 1
                    }
                })
            }
            Query::MultiField { text, fields } => {
                let should: Vec<Value> = fields
                    .iter()
                    .map(|f| json!({ "match": { f.field.as_str(): { "query": text, "boost": f.boost } } }))
                    .collect();
                json!({ "bool": { "should": should, "minimum_should_match": 1 } })
            }
            Query::All => json!({ "match_all": {} }),
        }
    }
}

fn escape_wildcard(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '*' | '?' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Lowercased word tokens, the way a standard analyzer would split them.
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Highlighting parameters for a search.
#[derive(Debug, Clone, PartialEq)]
pub struct HighlightSpec {
    pub fields: Vec<String>,
    /// Maximum characters per fragment.
    pub fragment_size: usize,
    pub number_of_fragments: usize,
    pub pre_tag: String,
    pub post_tag: String,
    /// Characters of each field the highlighter may scan.
    pub max_analyzed_offset: usize,
}

impl HighlightSpec {
    pub fn from_config(config: &HighlightConfig, fields: &[&str]) -> Self {
        Self {
            fields: fields.iter().map(|f| f.to_string()).collect(),
            fragment_size: config.fragment_size,
            number_of_fragments: config.number_of_fragments,
            pre_tag: config.pre_tag.clone(),
            post_tag: config.post_tag.clone(),
            max_analyzed_offset: config.max_analyzed_offset,
        }
    }

    pub fn to_dsl(&self) -> Value {
        let fields: serde_json::Map<String, Value> = self
            .fields
            .iter()
            .map(|f| (f.clone(), json!({})))
            .collect();
        json!({
            "fields": fields,
            "fragment_size": self.fragment_size,
            "number_of_fragments": self.number_of_fragments,
            "pre_tags": [self.pre_tag],
            "post_tags": [self.post_tag],
            "max_analyzed_offset": self.max_analyzed_offset,
        })
    }
}

/// Issues single-page ranked searches through a shared client handle.
pub struct QueryService<'a> {
    client: &'a dyn IndexClient,
}

impl<'a> QueryService<'a> {
    pub fn new(client: &'a dyn IndexClient) -> Self {
        Self { client }
    }

    /// Run `query` against `index` and return at most `size` hits, ranked
    /// by score descending.
    ///
    /// Errors are not retried: a rejected query yields
    /// [`IndexError::Query`], an unreachable index [`IndexError::Connection`].
    pub async fn search(
        &self,
        index: &str,
        query: &Query,
        size: usize,
        highlight: Option<&HighlightSpec>,
    ) -> Result<Vec<Hit>, IndexError> {
        query.validate()?;
        let request = SearchRequest {
            index: index.to_string(),
            query: query.clone(),
            size,
            highlight: highlight.cloned(),
            scroll: None,
        };
        let page = self.client.search(&request).await?;
        debug!(index, hits = page.hits.len(), total = page.total, "search");

        let mut hits = page.hits;
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(size);
        Ok(hits)
    }
}
