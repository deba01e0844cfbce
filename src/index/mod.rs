//! Remote index abstraction.
//!
//! The [`IndexClient`] trait is the complete contract this crate needs from
//! a search index: ranked search with an optional server-side cursor,
//! cursor continuation and release, grouped mutation, single delete, and a
//! reachability check. Implementations must be `Send + Sync`; one client is
//! constructed per process and shared by reference.
//!
//! | Implementation | Purpose |
//! |----------------|---------|
//! | [`http::HttpIndexClient`] | Elasticsearch/OpenSearch REST API over `reqwest` |
//! | [`memory::InMemoryIndex`] | In-process index for tests, with call log and fault injection |
//!
//! No method retries. A failed call surfaces to the caller unchanged.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::IndexError;
use crate::models::{Fields, Hit};
use crate::query::{HighlightSpec, Query};

/// A single search call.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub index: String,
    pub query: Query,
    pub size: usize,
    pub highlight: Option<HighlightSpec>,
    /// When set, ask the server to hold a cursor open for this long.
    pub scroll: Option<Duration>,
}

/// One page of results.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub hits: Vec<Hit>,
    /// Server-issued cursor token, when one was requested.
    pub cursor: Option<String>,
    /// Total number of matching documents.
    pub total: u64,
}

/// One entry of a grouped mutation request.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkOperation {
    Replace {
        index: String,
        id: String,
        fields: Fields,
    },
    Delete {
        index: String,
        id: String,
    },
}

impl BulkOperation {
    pub fn id(&self) -> &str {
        match self {
            BulkOperation::Replace { id, .. } | BulkOperation::Delete { id, .. } => id,
        }
    }
}

/// Outcome of a single mutation as reported by the index.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemStatus {
    Ok,
    /// The target id does not exist.
    NotFound,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BulkItemResult {
    pub id: String,
    pub status: ItemStatus,
}

#[async_trait]
pub trait IndexClient: Send + Sync {
    /// Run a search, optionally opening a cursor.
    async fn search(&self, request: &SearchRequest) -> Result<SearchPage, IndexError>;

    /// Fetch the next page of an open cursor and renew it for `ttl`.
    ///
    /// An empty page means the cursor is exhausted.
    async fn continue_cursor(&self, token: &str, ttl: Duration) -> Result<SearchPage, IndexError>;

    /// Free the server-side state behind a cursor. Unknown tokens are fine.
    async fn release_cursor(&self, token: &str) -> Result<(), IndexError>;

    /// Submit a grouped mutation request; one result per operation, in order.
    async fn bulk_apply(&self, operations: &[BulkOperation]) -> Result<Vec<BulkItemResult>, IndexError>;

    async fn delete_one(&self, index: &str, id: &str) -> Result<ItemStatus, IndexError>;

    async fn ping(&self) -> bool;
}
