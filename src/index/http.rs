//! Elasticsearch/OpenSearch REST transport.
//!
//! Maps the [`IndexClient`] contract onto the index's HTTP API:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | field check | `GET /{index}/_field_caps?fields=<query fields>` |
//! | search | `POST /{index}/_search[?scroll=<ttl>]` |
//! | continue cursor | `POST /_search/scroll` |
//! | release cursor | `DELETE /_search/scroll` |
//! | bulk apply | `POST /_bulk` (NDJSON) |
//! | delete one | `DELETE /{index}/_doc/{id}` |
//! | ping | `GET /` |
//!
//! # Error mapping
//!
//! - connect failures and timeouts → [`IndexError::Connection`]
//! - HTTP 400 or `index_not_found_exception` on search → [`IndexError::Query`]
//! - a query field missing from the index mapping → [`IndexError::Query`]
//!   (except for [`Query::Empty`](crate::query::Query::Empty), which looks
//!   for missing fields)
//! - HTTP 404 / `search_context_missing_exception` on scroll → [`IndexError::CursorExpired`]
//! - anything else unexpected → [`IndexError::Transport`]
//!
//! Index names and document ids are sent as escaped path segments, so an
//! id such as `faq#2` or `a/b` addresses exactly that document.
//!
//! Nothing is retried.

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use crate::config::IndexConfig;
use crate::error::IndexError;
use crate::models::{Document, Hit};
use crate::query::Query;

use super::{BulkItemResult, BulkOperation, IndexClient, ItemStatus, SearchPage, SearchRequest};

pub struct HttpIndexClient {
    http: reqwest::Client,
    base_url: Url,
    auth: Option<(String, Option<String>)>,
    keyword_suffix: String,
}

impl HttpIndexClient {
    /// Build the shared client from configuration.
    pub fn new(config: &IndexConfig) -> Result<Self, IndexError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| IndexError::Connection(e.to_string()))?;
        let base_url = Url::parse(&config.url)
            .map_err(|e| IndexError::Connection(format!("invalid index url {}: {}", config.url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(IndexError::Connection(format!(
                "invalid index url {}: not a base url",
                config.url
            )));
        }
        Ok(Self {
            http,
            base_url,
            auth: config
                .username
                .clone()
                .map(|user| (user, config.password())),
            keyword_suffix: config.keyword_suffix.clone(),
        })
    }

    /// Base url plus `segments`, each percent-encoded as one path segment.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        debug!(%method, %url, "index request");
        let builder = self.http.request(method, url);
        match &self.auth {
            Some((user, password)) => builder.basic_auth(user, password.as_deref()),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<(StatusCode, Value), IndexError> {
        let response = builder.send().await.map_err(connection_error)?;
        let status = response.status();
        let text = response.text().await.map_err(connection_error)?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)
                .map_err(|e| IndexError::Transport(format!("HTTP {}: invalid JSON ({}): {}", status, e, text)))?
        };
        Ok((status, body))
    }

    /// Fail with [`IndexError::Query`] when a field `query` targets is not
    /// mapped in `index`. The index itself would just return zero hits.
    async fn check_fields(&self, index: &str, query: &Query) -> Result<(), IndexError> {
        let fields = query.fields();
        if fields.is_empty() || matches!(query, Query::Empty { .. }) {
            return Ok(());
        }
        let mut url = self.url(&[index, "_field_caps"]);
        url.query_pairs_mut().append_pair("fields", &fields.join(","));
        let (status, response) = self
            .send(self.request(reqwest::Method::GET, url))
            .await?;

        let rejected = |reason: String| IndexError::Query {
            query: query.to_dsl(&self.keyword_suffix).to_string(),
            reason,
        };
        if !status.is_success() {
            if status == StatusCode::NOT_FOUND
                || status == StatusCode::BAD_REQUEST
                || error_type(&response) == "index_not_found_exception"
            {
                return Err(rejected(error_reason(status, &response)));
            }
            return Err(IndexError::Transport(format!(
                "field_caps failed: {}",
                error_reason(status, &response)
            )));
        }

        let unknown = unmapped_fields(&fields, &response);
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(rejected(format!(
                "unknown field(s) in [{}]: {}",
                index,
                unknown.join(", ")
            )))
        }
    }
}

/// Fields of `wanted` absent from a `_field_caps` response.
fn unmapped_fields<'a>(wanted: &[&'a str], response: &Value) -> Vec<&'a str> {
    wanted
        .iter()
        .copied()
        .filter(|f| !response["fields"].get(*f).is_some_and(|caps| !caps.is_null()))
        .collect()
}

fn connection_error(e: reqwest::Error) -> IndexError {
    IndexError::Connection(e.to_string())
}

fn ttl_param(ttl: Duration) -> String {
    format!("{}s", ttl.as_secs().max(1))
}

fn error_type(body: &Value) -> &str {
    body["error"]["type"].as_str().unwrap_or("")
}

fn error_reason(status: StatusCode, body: &Value) -> String {
    body["error"]["reason"]
        .as_str()
        .map(str::to_string)
        .or_else(|| body["error"].as_str().map(str::to_string))
        .unwrap_or_else(|| format!("HTTP {}", status))
}

/// Parse `hits.hits[]` of a search or scroll response.
fn parse_page(body: &Value) -> Result<SearchPage, IndexError> {
    let raw_hits = body["hits"]["hits"]
        .as_array()
        .ok_or_else(|| IndexError::Transport("response has no hits.hits array".to_string()))?;

    let mut hits = Vec::with_capacity(raw_hits.len());
    for raw in raw_hits {
        let id = raw["_id"]
            .as_str()
            .ok_or_else(|| IndexError::Transport("hit without _id".to_string()))?;
        let fields = raw["_source"].as_object().cloned().unwrap_or_default();
        let highlights: BTreeMap<String, Vec<String>> = raw["highlight"]
            .as_object()
            .map(|h| {
                h.iter()
                    .map(|(field, frags)| {
                        let frags = frags
                            .as_array()
                            .map(|a| a.iter().filter_map(|f| f.as_str().map(str::to_string)).collect())
                            .unwrap_or_default();
                        (field.clone(), frags)
                    })
                    .collect()
            })
            .unwrap_or_default();
        hits.push(Hit {
            document: Document::new(id, fields),
            score: raw["_score"].as_f64().unwrap_or(0.0),
            highlights,
        });
    }

    // total is an object on ES 7+, a bare number before that
    let total = body["hits"]["total"]["value"]
        .as_u64()
        .or_else(|| body["hits"]["total"].as_u64())
        .unwrap_or(hits.len() as u64);

    Ok(SearchPage {
        hits,
        cursor: body["_scroll_id"].as_str().map(str::to_string),
        total,
    })
}

/// Render bulk operations as NDJSON; every line, including the last, ends in `\n`.
fn bulk_body(operations: &[BulkOperation]) -> String {
    let mut body = String::new();
    for op in operations {
        match op {
            BulkOperation::Replace { index, id, fields } => {
                body.push_str(&json!({ "index": { "_index": index, "_id": id } }).to_string());
                body.push('\n');
                body.push_str(&Value::Object(fields.clone()).to_string());
                body.push('\n');
            }
            BulkOperation::Delete { index, id } => {
                body.push_str(&json!({ "delete": { "_index": index, "_id": id } }).to_string());
                body.push('\n');
            }
        }
    }
    body
}

fn parse_bulk_items(operations: &[BulkOperation], body: &Value) -> Result<Vec<BulkItemResult>, IndexError> {
    let items = body["items"]
        .as_array()
        .ok_or_else(|| IndexError::Transport("bulk response has no items array".to_string()))?;
    if items.len() != operations.len() {
        return Err(IndexError::Transport(format!(
            "bulk response has {} items for {} operations",
            items.len(),
            operations.len()
        )));
    }

    Ok(operations
        .iter()
        .zip(items)
        .map(|(op, item)| {
            // each item is keyed by its action: {"index": {...}} or {"delete": {...}}
            let detail = item
                .as_object()
                .and_then(|o| o.values().next())
                .cloned()
                .unwrap_or(Value::Null);
            let code = detail["status"].as_u64().unwrap_or(0);
            let status = if detail["error"].is_object() || detail["error"].is_string() {
                ItemStatus::Failed(error_reason(
                    StatusCode::from_u16(code as u16).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                    &detail,
                ))
            } else if code == 404 || detail["result"] == "not_found" {
                ItemStatus::NotFound
            } else if (200..300).contains(&code) {
                ItemStatus::Ok
            } else {
                ItemStatus::Failed(format!("HTTP {}", code))
            };
            BulkItemResult {
                id: op.id().to_string(),
                status,
            }
        })
        .collect())
}

#[async_trait]
impl IndexClient for HttpIndexClient {
    async fn search(&self, request: &SearchRequest) -> Result<SearchPage, IndexError> {
        let query = request.query.to_dsl(&self.keyword_suffix);
        let mut body = json!({ "query": query, "size": request.size });
        if let Some(spec) = &request.highlight {
            body["highlight"] = spec.to_dsl();
        }
        self.check_fields(&request.index, &request.query).await?;

        let mut url = self.url(&[request.index.as_str(), "_search"]);
        if let Some(ttl) = request.scroll {
            url.query_pairs_mut().append_pair("scroll", &ttl_param(ttl));
            // _doc order is cheapest for exhaustive traversal
            body["sort"] = json!(["_doc"]);
        }

        let (status, response) = self
            .send(self.request(reqwest::Method::POST, url).json(&body))
            .await?;

        if status.is_success() {
            return parse_page(&response);
        }
        if status == StatusCode::BAD_REQUEST || error_type(&response) == "index_not_found_exception" {
            return Err(IndexError::Query {
                query: body["query"].to_string(),
                reason: error_reason(status, &response),
            });
        }
        Err(IndexError::Transport(format!(
            "search failed: {}",
            error_reason(status, &response)
        )))
    }

    async fn continue_cursor(&self, token: &str, ttl: Duration) -> Result<SearchPage, IndexError> {
        let body = json!({ "scroll": ttl_param(ttl), "scroll_id": token });
        let (status, response) = self
            .send(self.request(reqwest::Method::POST, self.url(&["_search", "scroll"])).json(&body))
            .await?;

        if status.is_success() {
            return parse_page(&response);
        }
        if status == StatusCode::NOT_FOUND
            || error_type(&response) == "search_context_missing_exception"
        {
            return Err(IndexError::CursorExpired);
        }
        Err(IndexError::Transport(format!(
            "scroll failed: {}",
            error_reason(status, &response)
        )))
    }

    async fn release_cursor(&self, token: &str) -> Result<(), IndexError> {
        let body = json!({ "scroll_id": [token] });
        let (status, response) = self
            .send(self.request(reqwest::Method::DELETE, self.url(&["_search", "scroll"])).json(&body))
            .await?;
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(IndexError::Transport(format!(
                "clear scroll failed: {}",
                error_reason(status, &response)
            )))
        }
    }

    async fn bulk_apply(
        &self,
        operations: &[BulkOperation],
    ) -> Result<Vec<BulkItemResult>, IndexError> {
        if operations.is_empty() {
            return Ok(Vec::new());
        }
        let builder = self
            .request(reqwest::Method::POST, self.url(&["_bulk"]))
            .header("Content-Type", "application/x-ndjson")
            .body(bulk_body(operations));
        let (status, response) = self.send(builder).await?;
        if !status.is_success() {
            return Err(IndexError::Transport(format!(
                "bulk request failed: {}",
                error_reason(status, &response)
            )));
        }
        parse_bulk_items(operations, &response)
    }

    async fn delete_one(&self, index: &str, id: &str) -> Result<ItemStatus, IndexError> {
        let url = self.url(&[index, "_doc", id]);
        let (status, response) = self
            .send(self.request(reqwest::Method::DELETE, url))
            .await?;
        Ok(if status.is_success() {
            ItemStatus::Ok
        } else if status == StatusCode::NOT_FOUND {
            ItemStatus::NotFound
        } else {
            ItemStatus::Failed(error_reason(status, &response))
        })
    }

    async fn ping(&self) -> bool {
        match self.request(reqwest::Method::GET, self.base_url.clone()).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(error = %e, "ping failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_body_is_ndjson() {
        let fields = json!({"answer": "X"}).as_object().cloned().unwrap();
        let body = bulk_body(&[
            BulkOperation::Replace {
                index: "qa".into(),
                id: "a".into(),
                fields,
            },
            BulkOperation::Delete {
                index: "qa".into(),
                id: "c".into(),
            },
        ]);
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(body.ends_with('\n'));
        let action: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(action["index"]["_id"], "a");
        let source: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(source["answer"], "X");
        let delete: Value = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(delete["delete"]["_index"], "qa");
    }

    #[test]
    fn parse_page_reads_hits_highlights_and_cursor() {
        let body = json!({
            "_scroll_id": "abc",
            "hits": {
                "total": { "value": 7, "relation": "eq" },
                "hits": [{
                    "_id": "1",
                    "_score": 2.5,
                    "_source": { "question": "q", "answer": "a" },
                    "highlight": { "question": ["<<q>>"] }
                }]
            }
        });
        let page = parse_page(&body).unwrap();
        assert_eq!(page.cursor.as_deref(), Some("abc"));
        assert_eq!(page.total, 7);
        assert_eq!(page.hits[0].id(), "1");
        assert_eq!(page.hits[0].score, 2.5);
        assert_eq!(page.hits[0].highlights["question"], vec!["<<q>>"]);
        assert_eq!(page.hits[0].document.text("answer"), Some("a"));
    }

    #[test]
    fn parse_page_accepts_legacy_numeric_total() {
        let body = json!({ "hits": { "total": 3, "hits": [] } });
        assert_eq!(parse_page(&body).unwrap().total, 3);
    }

    #[test]
    fn bulk_items_map_statuses() {
        let ops = vec![
            BulkOperation::Delete { index: "qa".into(), id: "a".into() },
            BulkOperation::Delete { index: "qa".into(), id: "b".into() },
            BulkOperation::Delete { index: "qa".into(), id: "c".into() },
        ];
        let body = json!({
            "errors": true,
            "items": [
                { "delete": { "_id": "a", "status": 200, "result": "deleted" } },
                { "delete": { "_id": "b", "status": 404, "result": "not_found" } },
                { "delete": { "_id": "c", "status": 429, "error": { "type": "es_rejected_execution_exception", "reason": "queue full" } } }
            ]
        });
        let items = parse_bulk_items(&ops, &body).unwrap();
        assert_eq!(items[0].status, ItemStatus::Ok);
        assert_eq!(items[1].status, ItemStatus::NotFound);
        assert_eq!(items[2].status, ItemStatus::Failed("queue full".into()));
    }

    #[test]
    fn bulk_item_count_mismatch_is_transport_error() {
        let ops = vec![BulkOperation::Delete { index: "qa".into(), id: "a".into() }];
        let body = json!({ "items": [] });
        assert!(matches!(
            parse_bulk_items(&ops, &body),
            Err(IndexError::Transport(_))
        ));
    }

    fn client(url: &str) -> HttpIndexClient {
        HttpIndexClient::new(&IndexConfig {
            url: url.into(),
            name: "qa".into(),
            username: None,
            password_env: "KBM_TEST_UNSET".into(),
            timeout_secs: 2,
            keyword_suffix: ".keyword".into(),
        })
        .unwrap()
    }

    #[test]
    fn ids_are_escaped_as_single_segments() {
        let c = client("http://localhost:9200");
        assert_eq!(
            c.url(&["qa", "_doc", "faq#2"]).as_str(),
            "http://localhost:9200/qa/_doc/faq%232"
        );
        assert_eq!(
            c.url(&["qa", "_doc", "a/b?c"]).as_str(),
            "http://localhost:9200/qa/_doc/a%2Fb%3Fc"
        );
    }

    #[test]
    fn base_path_prefix_is_kept() {
        let c = client("https://search.example.com/es/");
        assert_eq!(
            c.url(&["qa", "_search"]).as_str(),
            "https://search.example.com/es/qa/_search"
        );
    }

    #[test]
    fn unparseable_url_is_rejected() {
        let err = HttpIndexClient::new(&IndexConfig {
            url: "http://".into(),
            name: "qa".into(),
            username: None,
            password_env: "KBM_TEST_UNSET".into(),
            timeout_secs: 2,
            keyword_suffix: ".keyword".into(),
        })
        .err()
        .unwrap();
        assert!(matches!(err, IndexError::Connection(_)));
    }

    #[test]
    fn unmapped_fields_lists_missing_names() {
        let caps = json!({
            "indices": ["qa"],
            "fields": { "answer": { "text": { "type": "text", "searchable": true } } }
        });
        assert_eq!(unmapped_fields(&["answer", "ansewr"], &caps), vec!["ansewr"]);
        assert!(unmapped_fields(&["answer"], &caps).is_empty());
    }

    #[tokio::test]
    async fn unreachable_host_pings_false() {
        let config = IndexConfig {
            url: "http://127.0.0.1:1".into(),
            name: "qa".into(),
            username: None,
            password_env: "KBM_TEST_UNSET".into(),
            timeout_secs: 2,
            keyword_suffix: ".keyword".into(),
        };
        let client = HttpIndexClient::new(&config).unwrap();
        assert!(!client.ping().await);
    }
}
