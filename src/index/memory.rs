//! In-memory [`IndexClient`] implementation for tests.
//!
//! Evaluates every [`Query`] shape against documents held in a
//! `BTreeMap`, keeps point-in-time scroll contexts with real TTLs, and
//! records each call in order so tests can assert happens-before
//! relationships (for example, "no mutation before the snapshot").
//!
//! Fault injection:
//! - [`set_reachable`](InMemoryIndex::set_reachable) makes every call fail
//!   with [`IndexError::Connection`].
//! - [`fail_ids`](InMemoryIndex::fail_ids) makes bulk items for those ids fail.
//! - [`fail_cursor_after`](InMemoryIndex::fail_cursor_after) breaks the
//!   connection on the n-th cursor continuation.
//! - [`expire_cursors`](InMemoryIndex::expire_cursors) times out every open cursor.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::IndexError;
use crate::models::{Document, Fields, Hit};
use crate::query::{tokenize, HighlightSpec, Query};

use super::{BulkItemResult, BulkOperation, IndexClient, ItemStatus, SearchPage, SearchRequest};

/// One recorded client call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Ping,
    Search { index: String, scroll: bool },
    ContinueCursor { token: String },
    ReleaseCursor { token: String },
    BulkApply { ids: Vec<String> },
    DeleteOne { index: String, id: String },
}

impl Call {
    pub fn is_mutation(&self) -> bool {
        matches!(self, Call::BulkApply { .. } | Call::DeleteOne { .. })
    }
}

struct ScrollContext {
    remaining: VecDeque<Hit>,
    page_size: usize,
    total: u64,
    deadline: Instant,
}

#[derive(Default)]
struct State {
    indices: HashMap<String, BTreeMap<String, Fields>>,
    cursors: HashMap<String, ScrollContext>,
    next_cursor: u64,
    calls: Vec<Call>,
    unreachable: bool,
    failing_ids: HashSet<String>,
    continue_budget: Option<usize>,
}

/// In-memory index for tests.
#[derive(Default)]
pub struct InMemoryIndex {
    state: Mutex<State>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, index: &str, docs: Vec<Document>) {
        let mut state = self.state.lock().unwrap();
        let target = state.indices.entry(index.to_string()).or_default();
        for doc in docs {
            target.insert(doc.id, doc.fields);
        }
    }

    /// Insert a document from a JSON object literal.
    pub fn insert_raw(&self, index: &str, id: &str, fields: serde_json::Value) {
        let fields = fields.as_object().cloned().unwrap_or_default();
        self.insert(index, vec![Document::new(id, fields)]);
    }

    pub fn get(&self, index: &str, id: &str) -> Option<Fields> {
        let state = self.state.lock().unwrap();
        state.indices.get(index).and_then(|docs| docs.get(id).cloned())
    }

    /// All documents of `index`, ordered by id.
    pub fn documents(&self, index: &str) -> Vec<Document> {
        let state = self.state.lock().unwrap();
        state
            .indices
            .get(index)
            .map(|docs| {
                docs.iter()
                    .map(|(id, fields)| Document::new(id.clone(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn open_cursors(&self) -> usize {
        self.state.lock().unwrap().cursors.len()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unwrap().unreachable = !reachable;
    }

    pub fn fail_ids<I: IntoIterator<Item = S>, S: Into<String>>(&self, ids: I) {
        let mut state = self.state.lock().unwrap();
        state.failing_ids = ids.into_iter().map(Into::into).collect();
    }

    /// Let `n` cursor continuations succeed, then fail the next one.
    pub fn fail_cursor_after(&self, n: usize) {
        self.state.lock().unwrap().continue_budget = Some(n);
    }

    pub fn expire_cursors(&self) {
        let mut state = self.state.lock().unwrap();
        let past = Instant::now() - Duration::from_millis(1);
        for ctx in state.cursors.values_mut() {
            ctx.deadline = past;
        }
    }
}

fn check_reachable(state: &State) -> Result<(), IndexError> {
    if state.unreachable {
        Err(IndexError::Connection("connection refused (in-memory index offline)".to_string()))
    } else {
        Ok(())
    }
}

#[async_trait]
impl IndexClient for InMemoryIndex {
    async fn search(&self, request: &SearchRequest) -> Result<SearchPage, IndexError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Search {
            index: request.index.clone(),
            scroll: request.scroll.is_some(),
        });
        check_reachable(&state)?;

        let docs = state.indices.get(&request.index).ok_or_else(|| IndexError::Query {
            query: request.query.to_dsl(".keyword").to_string(),
            reason: format!("no such index [{}]", request.index),
        })?;

        // a field no document has is not in the mapping
        let unknown: Vec<&str> = if docs.is_empty() || matches!(request.query, Query::Empty { .. }) {
            Vec::new()
        } else {
            request
                .query
                .fields()
                .into_iter()
                .filter(|q| !docs.values().any(|f| f.contains_key(*q)))
                .collect()
        };
        if !unknown.is_empty() {
            return Err(IndexError::Query {
                query: request.query.to_dsl(".keyword").to_string(),
                reason: format!("unknown field(s): {}", unknown.join(", ")),
            });
        }

        let mut hits: Vec<Hit> = docs
            .iter()
            .filter_map(|(id, fields)| {
                score(&request.query, fields).map(|score| Hit {
                    document: Document::new(id.clone(), fields.clone()),
                    score,
                    highlights: request
                        .highlight
                        .as_ref()
                        .map(|spec| highlight(&request.query, fields, spec))
                        .unwrap_or_default(),
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.document.id.cmp(&b.document.id))
        });
        let total = hits.len() as u64;

        let mut remaining: VecDeque<Hit> = hits.into();
        let first: Vec<Hit> = remaining
            .drain(..request.size.min(remaining.len()))
            .collect();

        let cursor = match request.scroll {
            Some(ttl) => {
                state.next_cursor += 1;
                let token = format!("scroll-{}", state.next_cursor);
                state.cursors.insert(
                    token.clone(),
                    ScrollContext {
                        remaining,
                        page_size: request.size,
                        total,
                        deadline: Instant::now() + ttl,
                    },
                );
                Some(token)
            }
            None => None,
        };

        Ok(SearchPage {
            hits: first,
            cursor,
            total,
        })
    }

    async fn continue_cursor(&self, token: &str, ttl: Duration) -> Result<SearchPage, IndexError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::ContinueCursor {
            token: token.to_string(),
        });
        check_reachable(&state)?;

        if let Some(budget) = state.continue_budget.as_mut() {
            if *budget == 0 {
                state.continue_budget = None;
                return Err(IndexError::Connection("connection reset during scroll".to_string()));
            }
            *budget -= 1;
        }

        let now = Instant::now();
        let expired = match state.cursors.get(token) {
            None => true,
            Some(ctx) => ctx.deadline <= now,
        };
        if expired {
            state.cursors.remove(token);
            return Err(IndexError::CursorExpired);
        }

        let ctx = state
            .cursors
            .get_mut(token)
            .ok_or(IndexError::CursorExpired)?;
        ctx.deadline = now + ttl;
        let take = ctx.page_size.min(ctx.remaining.len());
        let hits: Vec<Hit> = ctx.remaining.drain(..take).collect();
        Ok(SearchPage {
            hits,
            cursor: Some(token.to_string()),
            total: ctx.total,
        })
    }

    async fn release_cursor(&self, token: &str) -> Result<(), IndexError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::ReleaseCursor {
            token: token.to_string(),
        });
        check_reachable(&state)?;
        state.cursors.remove(token);
        Ok(())
    }

    async fn bulk_apply(
        &self,
        operations: &[BulkOperation],
    ) -> Result<Vec<BulkItemResult>, IndexError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::BulkApply {
            ids: operations.iter().map(|op| op.id().to_string()).collect(),
        });
        check_reachable(&state)?;

        let mut results = Vec::with_capacity(operations.len());
        for op in operations {
            let id = op.id().to_string();
            if state.failing_ids.contains(&id) {
                results.push(BulkItemResult {
                    id,
                    status: ItemStatus::Failed("injected failure".to_string()),
                });
                continue;
            }
            let status = match op {
                BulkOperation::Replace { index, id, fields } => {
                    state
                        .indices
                        .entry(index.clone())
                        .or_default()
                        .insert(id.clone(), fields.clone());
                    ItemStatus::Ok
                }
                BulkOperation::Delete { index, id } => {
                    match state.indices.get_mut(index).and_then(|docs| docs.remove(id)) {
                        Some(_) => ItemStatus::Ok,
                        None => ItemStatus::NotFound,
                    }
                }
            };
            results.push(BulkItemResult { id, status });
        }
        Ok(results)
    }

    async fn delete_one(&self, index: &str, id: &str) -> Result<ItemStatus, IndexError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::DeleteOne {
            index: index.to_string(),
            id: id.to_string(),
        });
        check_reachable(&state)?;
        if state.failing_ids.contains(id) {
            return Ok(ItemStatus::Failed("injected failure".to_string()));
        }
        Ok(
            match state.indices.get_mut(index).and_then(|docs| docs.remove(id)) {
                Some(_) => ItemStatus::Ok,
                None => ItemStatus::NotFound,
            },
        )
    }

    async fn ping(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Ping);
        !state.unreachable
    }
}

// ============ Query evaluation ============

fn text_of<'a>(fields: &'a Fields, field: &str) -> Option<&'a str> {
    fields.get(field).and_then(|v| v.as_str())
}

fn score(query: &Query, fields: &Fields) -> Option<f64> {
    match query {
        Query::Tolerant { field, text, slop } => {
            let terms = tokenize(text);
            let tokens = tokenize(text_of(fields, field)?);
            let matched = terms.iter().filter(|t| tokens.contains(t)).count();
            if matched == 0 {
                return None;
            }
            let phrase_bonus = if phrase_within_slop(&tokens, &terms, *slop as usize) {
                terms.len()
            } else {
                0
            };
            Some((matched + phrase_bonus) as f64)
        }
        Query::Contains { field, term } => {
            let value = text_of(fields, field)?;
            value
                .to_lowercase()
                .contains(&term.to_lowercase())
                .then_some(1.0)
        }
        Query::Empty { field } => {
            let empty = match fields.get(field) {
                None | Some(serde_json::Value::Null) => true,
                Some(serde_json::Value::String(s)) => s.trim().is_empty(),
                Some(_) => false,
            };
            empty.then_some(1.0)
        }
        Query::MultiField { text, fields: boosted } => {
            let terms = tokenize(text);
            let total: f64 = boosted
                .iter()
                .filter_map(|b| {
                    let tokens = tokenize(text_of(fields, &b.field)?);
                    let matched = terms.iter().filter(|t| tokens.contains(t)).count();
                    Some(matched as f64 * b.boost)
                })
                .sum();
            (total > 0.0).then_some(total)
        }
        Query::All => Some(1.0),
    }
}

/// True when some window of `tokens` holds every term with at most `slop`
/// extra positions, in any order.
fn phrase_within_slop(tokens: &[String], terms: &[String], slop: usize) -> bool {
    let wanted: HashSet<&String> = terms.iter().collect();
    if wanted.is_empty() {
        return false;
    }
    for start in 0..tokens.len() {
        if !wanted.contains(&tokens[start]) {
            continue;
        }
        let mut seen: HashSet<&String> = HashSet::new();
        for (end, token) in tokens.iter().enumerate().skip(start) {
            if wanted.contains(token) {
                seen.insert(token);
            }
            if seen.len() == wanted.len() {
                if end + 1 - start <= wanted.len() + slop {
                    return true;
                }
                break;
            }
        }
    }
    false
}

// ============ Highlighting ============

fn highlight(query: &Query, fields: &Fields, spec: &HighlightSpec) -> BTreeMap<String, Vec<String>> {
    let mut out = BTreeMap::new();
    for field in &spec.fields {
        let Some(value) = text_of(fields, field) else {
            continue;
        };
        let chars: Vec<char> = value.chars().take(spec.max_analyzed_offset).collect();
        let spans = match query {
            Query::Tolerant { text, .. } | Query::MultiField { text, .. } => {
                term_spans(&chars, &tokenize(text))
            }
            Query::Contains { term, .. } => substring_spans(&chars, term),
            Query::Empty { .. } | Query::All => Vec::new(),
        };
        if spans.is_empty() {
            continue;
        }
        let fragments = fragments(&chars, &spans, spec);
        if !fragments.is_empty() {
            out.insert(field.clone(), fragments);
        }
    }
    out
}

/// Char-index spans of tokens equal to any of `terms`.
fn term_spans(chars: &[char], terms: &[String]) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = None;
    for i in 0..=chars.len() {
        let is_word = i < chars.len() && chars[i].is_alphanumeric();
        match (is_word, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                let token: String = chars[s..i].iter().collect::<String>().to_lowercase();
                if terms.contains(&token) {
                    spans.push((s, i));
                }
                start = None;
            }
            _ => {}
        }
    }
    spans
}

fn substring_spans(chars: &[char], term: &str) -> Vec<(usize, usize)> {
    let needle: Vec<char> = term.chars().flat_map(char::to_lowercase).collect();
    if needle.is_empty() || needle.len() > chars.len() {
        return Vec::new();
    }
    let hay: Vec<char> = chars
        .iter()
        .map(|c| c.to_lowercase().next().unwrap_or(*c))
        .collect();
    let mut spans = Vec::new();
    let mut i = 0;
    while i + needle.len() <= hay.len() {
        if hay[i..i + needle.len()] == needle[..] {
            spans.push((i, i + needle.len()));
            i += needle.len();
        } else {
            i += 1;
        }
    }
    spans
}

fn fragments(chars: &[char], spans: &[(usize, usize)], spec: &HighlightSpec) -> Vec<String> {
    let size = spec.fragment_size.max(1);
    let mut out = Vec::new();
    let mut covered_until = 0;
    for &(start, end) in spans {
        if out.len() >= spec.number_of_fragments {
            break;
        }
        if start < covered_until {
            continue;
        }
        let (from, to) = if chars.len() <= size {
            (0, chars.len())
        } else {
            let span_len = end - start;
            let from = start.saturating_sub(size.saturating_sub(span_len) / 2);
            let to = (from + size).min(chars.len()).max(end);
            (from, to)
        };
        let mut fragment = String::new();
        let mut pos = from;
        for &(s, e) in spans.iter().filter(|(s, e)| *s >= from && *e <= to) {
            fragment.extend(&chars[pos..s]);
            fragment.push_str(&spec.pre_tag);
            fragment.extend(&chars[s..e]);
            fragment.push_str(&spec.post_tag);
            pos = e;
        }
        fragment.extend(&chars[pos..to]);
        out.push(fragment);
        covered_until = to;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HighlightConfig;
    use serde_json::json;

    fn spec(fragment_size: usize, max_offset: usize) -> HighlightSpec {
        let mut s = HighlightSpec::from_config(&HighlightConfig::default(), &["body"]);
        s.fragment_size = fragment_size;
        s.max_analyzed_offset = max_offset;
        s
    }

    fn toks(s: &str) -> Vec<String> {
        tokenize(s)
    }

    #[test]
    fn phrase_allows_reordering_within_slop() {
        let tokens = toks("password my reset");
        assert!(phrase_within_slop(&tokens, &toks("reset my password"), 0));
        let gappy = toks("reset the old and new password");
        assert!(!phrase_within_slop(&gappy, &toks("reset password"), 2));
        assert!(phrase_within_slop(&gappy, &toks("reset password"), 4));
    }

    #[test]
    fn long_fields_fragment_around_matches() {
        let text = format!("{} needle {}", "a ".repeat(100), "b ".repeat(100));
        let fields = json!({ "body": text }).as_object().cloned().unwrap();
        let q = Query::Contains {
            field: "body".into(),
            term: "needle".into(),
        };
        let out = highlight(&q, &fields, &spec(40, 1_000_000));
        let frags = &out["body"];
        assert_eq!(frags.len(), 1);
        assert!(frags[0].contains("<<needle>>"));
        assert!(frags[0].chars().count() <= 40 + 4);
    }

    #[test]
    fn matches_past_analyzed_offset_are_ignored() {
        let text = format!("{}needle", "x".repeat(50));
        let fields = json!({ "body": text }).as_object().cloned().unwrap();
        let q = Query::Contains {
            field: "body".into(),
            term: "needle".into(),
        };
        assert!(highlight(&q, &fields, &spec(20, 30)).is_empty());
    }

    #[tokio::test]
    async fn scroll_context_expires() {
        let index = InMemoryIndex::new();
        index.insert_raw("qa", "1", json!({"q": "a"}));
        index.insert_raw("qa", "2", json!({"q": "b"}));
        let page = index
            .search(&SearchRequest {
                index: "qa".into(),
                query: Query::All,
                size: 1,
                highlight: None,
                scroll: Some(Duration::from_secs(60)),
            })
            .await
            .unwrap();
        let token = page.cursor.unwrap();
        index.expire_cursors();
        let err = index
            .continue_cursor(&token, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::CursorExpired));
        assert_eq!(index.open_cursors(), 0);
    }

    #[tokio::test]
    async fn bulk_delete_of_missing_id_reports_not_found() {
        let index = InMemoryIndex::new();
        index.insert_raw("qa", "1", json!({"q": "a"}));
        let results = index
            .bulk_apply(&[BulkOperation::Delete {
                index: "qa".into(),
                id: "nope".into(),
            }])
            .await
            .unwrap();
        assert_eq!(results[0].status, ItemStatus::NotFound);
    }
}
