//! Exhaustive traversal of every document matching a query.
//!
//! A single search returns at most one page. [`Cursor`] asks the server to
//! hold an iteration token open for a TTL and walks it page by page until
//! an empty page signals exhaustion. Pages are fetched strictly one at a
//! time: the token is sequential server-side state.
//!
//! [`traverse`] is the scoped form: it opens a cursor, feeds each page to a
//! callback, and releases the cursor on every exit path (exhaustion, error,
//! or the callback asking to stop).
//!
//! ```text
//! open ──▶ Open ──next_page──▶ Open ──empty page──▶ Exhausted
//!            │                   │
//!            │ TTL elapsed       │ fetch failed
//!            ▼                   ▼
//!         Expired              Failed          (release from any state)
//! ```

use std::collections::HashSet;
use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::IndexError;
use crate::index::{IndexClient, SearchRequest};
use crate::models::Hit;
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::query::Query;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Open,
    Exhausted,
    Expired,
    Failed,
    Released,
}

/// A server-side iteration over all matches of one query.
pub struct Cursor<'a> {
    client: &'a dyn IndexClient,
    token: Option<String>,
    ttl: Duration,
    deadline: Instant,
    /// The first page arrives with the opening search.
    pending: Option<Vec<Hit>>,
    state: CursorState,
    total: u64,
    seen: HashSet<String>,
}

impl<'a> Cursor<'a> {
    /// Issue the initial search, asking the server for a token valid for `ttl`.
    pub async fn open(
        client: &'a dyn IndexClient,
        index: &str,
        query: &Query,
        page_size: usize,
        ttl: Duration,
    ) -> Result<Cursor<'a>, IndexError> {
        query.validate()?;
        let request = SearchRequest {
            index: index.to_string(),
            query: query.clone(),
            size: page_size.max(1),
            highlight: None,
            scroll: Some(ttl),
        };
        let sent = Instant::now();
        let page = client.search(&request).await?;
        debug!(index, total = page.total, "cursor opened");

        Ok(Cursor {
            client,
            token: page.cursor,
            ttl,
            deadline: sent + ttl,
            pending: Some(page.hits),
            state: CursorState::Open,
            total: page.total,
            seen: HashSet::new(),
        })
    }

    /// Number of matches the server reported when the cursor was opened.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Fetch the next page. `Ok(None)` means the traversal is complete.
    ///
    /// Reading again after `None`, after a failure, or after the TTL
    /// elapsed is an error; the cursor is never silently reused.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Hit>>, IndexError> {
        match self.state {
            CursorState::Open => {}
            CursorState::Expired => return Err(IndexError::CursorExpired),
            CursorState::Exhausted | CursorState::Failed | CursorState::Released => {
                return Err(IndexError::CursorExhausted)
            }
        }

        let raw = match self.pending.take() {
            Some(first) => first,
            None => self.fetch().await?,
        };

        if raw.is_empty() {
            self.state = CursorState::Exhausted;
            return Ok(None);
        }

        let fetched = raw.len();
        let mut hits = raw;
        hits.retain(|h| self.seen.insert(h.document.id.clone()));
        if hits.len() < fetched {
            warn!(
                duplicates = fetched - hits.len(),
                "cursor returned already-seen documents; skipping them"
            );
        }
        Ok(Some(hits))
    }

    async fn fetch(&mut self) -> Result<Vec<Hit>, IndexError> {
        let Some(token) = self.token.clone() else {
            // no token was issued, so the first page was the only page
            return Ok(Vec::new());
        };
        if Instant::now() >= self.deadline {
            self.state = CursorState::Expired;
            return Err(IndexError::CursorExpired);
        }

        let sent = Instant::now();
        match self.client.continue_cursor(&token, self.ttl).await {
            Ok(page) => {
                self.deadline = sent + self.ttl;
                if let Some(next) = page.cursor {
                    self.token = Some(next);
                }
                Ok(page.hits)
            }
            Err(e) => {
                self.state = match e {
                    IndexError::CursorExpired => CursorState::Expired,
                    _ => CursorState::Failed,
                };
                Err(e)
            }
        }
    }

    /// Free the server-side state. Safe to call in any state.
    pub async fn release(mut self) -> Result<(), IndexError> {
        self.state = CursorState::Released;
        match self.token.take() {
            Some(token) => self.client.release_cursor(&token).await,
            None => Ok(()),
        }
    }
}

impl Drop for Cursor<'_> {
    fn drop(&mut self) {
        if let Some(token) = &self.token {
            warn!(token = %token, "cursor dropped without release; server state lingers until its TTL");
        }
    }
}

/// What a completed (or stopped) traversal saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraversalSummary {
    pub pages: usize,
    pub documents: usize,
    pub total: u64,
    /// False when the callback stopped the walk early.
    pub completed: bool,
}

/// Walk every match of `query`, handing each page to `on_page`.
///
/// The cursor is released whether the walk finishes, fails, or `on_page`
/// breaks out. A failed page fetch aborts the walk; restart from the
/// beginning to retry.
#[allow(clippy::too_many_arguments)]
pub async fn traverse<F>(
    client: &dyn IndexClient,
    index: &str,
    query: &Query,
    page_size: usize,
    ttl: Duration,
    label: &str,
    progress: &dyn ProgressReporter,
    mut on_page: F,
) -> Result<TraversalSummary, IndexError>
where
    F: FnMut(&[Hit]) -> Result<ControlFlow<()>, IndexError>,
{
    let mut cursor = Cursor::open(client, index, query, page_size, ttl).await?;
    progress.report(ProgressEvent::Opened {
        label: label.to_string(),
        total: cursor.total(),
    });

    let result = drive(&mut cursor, label, progress, &mut on_page).await;

    if let Err(e) = cursor.release().await {
        warn!(error = %e, "failed to release cursor");
    }

    let summary = result?;
    progress.report(ProgressEvent::Finished {
        label: label.to_string(),
        n: summary.documents as u64,
    });
    Ok(summary)
}

async fn drive<F>(
    cursor: &mut Cursor<'_>,
    label: &str,
    progress: &dyn ProgressReporter,
    on_page: &mut F,
) -> Result<TraversalSummary, IndexError>
where
    F: FnMut(&[Hit]) -> Result<ControlFlow<()>, IndexError>,
{
    let mut summary = TraversalSummary {
        pages: 0,
        documents: 0,
        total: cursor.total(),
        completed: false,
    };
    while let Some(page) = cursor.next_page().await? {
        summary.pages += 1;
        summary.documents += page.len();
        progress.report(ProgressEvent::Fetching {
            label: label.to_string(),
            n: summary.documents as u64,
            total: summary.total,
        });
        if on_page(&page)?.is_break() {
            return Ok(summary);
        }
    }
    summary.completed = true;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::memory::{Call, InMemoryIndex};
    use crate::progress::NoProgress;
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(60);

    fn index_with(n: usize) -> InMemoryIndex {
        let index = InMemoryIndex::new();
        index.insert("qa", Vec::new());
        for i in 0..n {
            index.insert_raw("qa", &format!("doc-{:03}", i), json!({ "question": format!("q{}", i) }));
        }
        index
    }

    async fn collect_ids(index: &InMemoryIndex, page_size: usize) -> Vec<String> {
        let mut ids = Vec::new();
        let summary = traverse(index, "qa", &Query::All, page_size, TTL, "test", &NoProgress, |page| {
            ids.extend(page.iter().map(|h| h.document.id.clone()));
            Ok(ControlFlow::Continue(()))
        })
        .await
        .unwrap();
        assert!(summary.completed);
        assert_eq!(summary.documents, ids.len());
        ids
    }

    #[tokio::test]
    async fn yields_every_document_exactly_once() {
        const P: usize = 4;
        for n in [0, 1, P, P + 1, 2 * P] {
            let index = index_with(n);
            let ids = collect_ids(&index, P).await;
            let unique: HashSet<&String> = ids.iter().collect();
            assert_eq!(ids.len(), n, "n = {}", n);
            assert_eq!(unique.len(), n, "duplicates for n = {}", n);
            assert_eq!(index.open_cursors(), 0, "cursor leaked for n = {}", n);
        }
    }

    #[tokio::test]
    async fn reading_after_exhaustion_fails() {
        let index = index_with(2);
        let mut cursor = Cursor::open(&index, "qa", &Query::All, 5, TTL).await.unwrap();
        assert_eq!(cursor.next_page().await.unwrap().unwrap().len(), 2);
        assert!(cursor.next_page().await.unwrap().is_none());
        assert!(matches!(
            cursor.next_page().await,
            Err(IndexError::CursorExhausted)
        ));
        cursor.release().await.unwrap();
        assert_eq!(index.open_cursors(), 0);
    }

    #[tokio::test]
    async fn expired_cursor_is_not_read_again() {
        let index = index_with(6);
        let mut cursor = Cursor::open(&index, "qa", &Query::All, 2, TTL).await.unwrap();
        cursor.next_page().await.unwrap();
        index.expire_cursors();
        assert!(matches!(cursor.next_page().await, Err(IndexError::CursorExpired)));
        assert_eq!(cursor.state(), CursorState::Expired);
        assert!(matches!(cursor.next_page().await, Err(IndexError::CursorExpired)));
        cursor.release().await.unwrap();
    }

    #[tokio::test]
    async fn failed_fetch_aborts_and_releases() {
        let index = index_with(10);
        index.fail_cursor_after(1);
        let mut pages = 0;
        let err = traverse(&index, "qa", &Query::All, 3, TTL, "test", &NoProgress, |_| {
            pages += 1;
            Ok(ControlFlow::Continue(()))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, IndexError::Connection(_)));
        assert_eq!(pages, 2);
        assert!(matches!(
            index.calls().last(),
            Some(Call::ReleaseCursor { .. })
        ));
        assert_eq!(index.open_cursors(), 0);
    }

    #[tokio::test]
    async fn early_stop_still_releases() {
        let index = index_with(10);
        let summary = traverse(&index, "qa", &Query::All, 3, TTL, "test", &NoProgress, |_| {
            Ok(ControlFlow::Break(()))
        })
        .await
        .unwrap();
        assert!(!summary.completed);
        assert_eq!(summary.pages, 1);
        assert_eq!(index.open_cursors(), 0);
    }

    #[tokio::test]
    async fn callback_error_releases_cursor() {
        let index = index_with(5);
        let err = traverse(&index, "qa", &Query::All, 2, TTL, "test", &NoProgress, |_| {
            Err(IndexError::CursorExhausted)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, IndexError::CursorExhausted));
        assert_eq!(index.open_cursors(), 0);
    }

    #[tokio::test]
    async fn pages_are_fetched_sequentially() {
        let index = index_with(5);
        collect_ids(&index, 2).await;
        let calls = index.calls();
        assert!(matches!(calls[0], Call::Search { scroll: true, .. }));
        // 3 pages of data, then the empty page, then release
        let continues = calls
            .iter()
            .filter(|c| matches!(c, Call::ContinueCursor { .. }))
            .count();
        assert_eq!(continues, 3);
        assert!(matches!(calls.last(), Some(Call::ReleaseCursor { .. })));
    }
}
