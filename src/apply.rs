//! Submitting a staged correction batch to the index.
//!
//! The whole batch goes out as one grouped (bulk) request: each edit becomes
//! a full-document replace under its existing id, each delete a delete. The
//! applier never stops at a failed item; every entry gets its own outcome.
//!
//! Re-applying is safe. A replace with the same payload leaves the document
//! as it was, and deleting an id that is already gone counts as success.

use tracing::{error, info};

use crate::error::IndexError;
use crate::index::{BulkOperation, IndexClient, ItemStatus};
use crate::models::{Correction, CorrectionBatch};
use crate::snapshot::SnapshotHandle;

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success,
    Failure(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutcome {
    pub doc_id: String,
    pub kind: &'static str,
    pub outcome: Outcome,
}

/// Per-item results of one apply, in batch order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    pub items: Vec<ItemOutcome>,
}

impl ApplyReport {
    pub fn successes(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.outcome == Outcome::Success)
            .count()
    }

    pub fn failures(&self) -> Vec<&ItemOutcome> {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, Outcome::Failure(_)))
            .collect()
    }

    pub fn has_failures(&self) -> bool {
        self.items
            .iter()
            .any(|i| matches!(i.outcome, Outcome::Failure(_)))
    }
}

pub struct CorrectionApplier<'a> {
    client: &'a dyn IndexClient,
    index: String,
}

impl<'a> CorrectionApplier<'a> {
    pub fn new(client: &'a dyn IndexClient, index: impl Into<String>) -> Self {
        Self {
            client,
            index: index.into(),
        }
    }

    /// One bulk operation per staged correction.
    pub fn compile(&self, batch: &CorrectionBatch) -> Vec<BulkOperation> {
        batch
            .iter()
            .map(|c| match c {
                Correction::Edit { doc_id, fields } => BulkOperation::Replace {
                    index: self.index.clone(),
                    id: doc_id.clone(),
                    fields: fields.clone(),
                },
                Correction::Delete { doc_id } => BulkOperation::Delete {
                    index: self.index.clone(),
                    id: doc_id.clone(),
                },
            })
            .collect()
    }

    /// Submit `batch`. `snapshot` must cover every id in it.
    ///
    /// Returns an error only when the batch is refused before anything is
    /// sent. Once the request goes out, failures (including a transport
    /// failure of the request itself) are reported per item.
    pub async fn apply(
        &self,
        batch: &CorrectionBatch,
        snapshot: &SnapshotHandle,
    ) -> Result<ApplyReport, IndexError> {
        let uncovered = snapshot.uncovered(batch.ids());
        if !uncovered.is_empty() {
            return Err(IndexError::UncoveredMutation { ids: uncovered });
        }
        if batch.is_empty() {
            return Ok(ApplyReport::default());
        }

        let operations = self.compile(batch);
        let (edits, deletes) = batch.counts();
        info!(index = %self.index, edits, deletes, "applying corrections");

        let results = match self.client.bulk_apply(&operations).await {
            Ok(results) => results,
            Err(e) => {
                error!(error = %e, "bulk request failed; no item is known to be applied");
                let reason = e.to_string();
                return Ok(ApplyReport {
                    items: batch
                        .iter()
                        .map(|c| ItemOutcome {
                            doc_id: c.doc_id().to_string(),
                            kind: c.kind(),
                            outcome: Outcome::Failure(reason.clone()),
                        })
                        .collect(),
                });
            }
        };

        let items = batch
            .iter()
            .enumerate()
            .map(|(n, correction)| {
                let outcome = match results.iter().find(|r| r.id == correction.doc_id()).or(results.get(n)) {
                    None => Outcome::Failure("no result reported by the index".to_string()),
                    Some(result) => match (&result.status, correction) {
                        (ItemStatus::Ok, _) => Outcome::Success,
                        // already gone: deleting again is a no-op
                        (ItemStatus::NotFound, Correction::Delete { .. }) => Outcome::Success,
                        (ItemStatus::NotFound, Correction::Edit { .. }) => {
                            Outcome::Failure("document not found".to_string())
                        }
                        (ItemStatus::Failed(reason), _) => Outcome::Failure(reason.clone()),
                    },
                };
                if let Outcome::Failure(reason) = &outcome {
                    error!(id = correction.doc_id(), kind = correction.kind(), %reason, "correction failed");
                }
                ItemOutcome {
                    doc_id: correction.doc_id().to_string(),
                    kind: correction.kind(),
                    outcome,
                }
            })
            .collect();

        Ok(ApplyReport { items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::memory::{Call, InMemoryIndex};
    use crate::models::{Document, Fields};
    use crate::snapshot::SnapshotStore;
    use serde_json::json;

    fn fields(v: serde_json::Value) -> Fields {
        v.as_object().cloned().unwrap()
    }

    fn seeded() -> InMemoryIndex {
        let index = InMemoryIndex::new();
        for id in ["a", "b", "c"] {
            index.insert_raw("qa", id, json!({ "question": id, "answer": "?" }));
        }
        index
    }

    fn snapshot_of(index: &InMemoryIndex, dir: &std::path::Path) -> SnapshotHandle {
        let docs: Vec<Document> = index.documents("qa");
        SnapshotStore::new(dir).write(&docs, "test").unwrap()
    }

    fn batch() -> CorrectionBatch {
        vec![
            Correction::Edit {
                doc_id: "a".into(),
                fields: fields(json!({ "question": "a", "answer": "X" })),
            },
            Correction::Delete { doc_id: "c".into() },
        ]
        .into_iter()
        .collect()
    }

    #[tokio::test]
    async fn applies_edits_and_deletes_in_one_request() {
        let dir = tempfile::tempdir().unwrap();
        let index = seeded();
        let snapshot = snapshot_of(&index, dir.path());

        let report = CorrectionApplier::new(&index, "qa")
            .apply(&batch(), &snapshot)
            .await
            .unwrap();

        assert!(!report.has_failures());
        assert_eq!(report.successes(), 2);
        assert_eq!(index.get("qa", "a").unwrap()["answer"], "X");
        assert_eq!(index.get("qa", "b").unwrap()["answer"], "?");
        assert!(index.get("qa", "c").is_none());
        let bulk_calls = index
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::BulkApply { .. }))
            .count();
        assert_eq!(bulk_calls, 1);
    }

    #[tokio::test]
    async fn applying_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let index = seeded();
        let snapshot = snapshot_of(&index, dir.path());
        let applier = CorrectionApplier::new(&index, "qa");

        applier.apply(&batch(), &snapshot).await.unwrap();
        let once = index.documents("qa");
        let second = applier.apply(&batch(), &snapshot).await.unwrap();

        assert!(!second.has_failures());
        assert_eq!(index.documents("qa"), once);
    }

    #[tokio::test]
    async fn one_failed_item_does_not_stop_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let index = seeded();
        let snapshot = snapshot_of(&index, dir.path());
        index.fail_ids(["a"]);

        let report = CorrectionApplier::new(&index, "qa")
            .apply(&batch(), &snapshot)
            .await
            .unwrap();

        assert!(report.has_failures());
        assert_eq!(report.failures().len(), 1);
        assert_eq!(report.failures()[0].doc_id, "a");
        assert_eq!(report.successes(), 1);
        assert!(index.get("qa", "c").is_none());
    }

    #[tokio::test]
    async fn refuses_ids_outside_the_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let index = seeded();
        let snapshot = SnapshotStore::new(dir.path())
            .write(&index.documents("qa")[..1], "partial")
            .unwrap();

        let err = CorrectionApplier::new(&index, "qa")
            .apply(&batch(), &snapshot)
            .await
            .unwrap_err();

        match err {
            IndexError::UncoveredMutation { ids } => assert_eq!(ids, vec!["c"]),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!index.calls().iter().any(Call::is_mutation));
    }

    #[tokio::test]
    async fn transport_failure_marks_every_item_failed() {
        let dir = tempfile::tempdir().unwrap();
        let index = seeded();
        let snapshot = snapshot_of(&index, dir.path());
        index.set_reachable(false);

        let report = CorrectionApplier::new(&index, "qa")
            .apply(&batch(), &snapshot)
            .await
            .unwrap();
        assert_eq!(report.failures().len(), 2);
        assert_eq!(report.successes(), 0);
    }

    #[tokio::test]
    async fn empty_batch_sends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let index = seeded();
        let snapshot = snapshot_of(&index, dir.path());
        let report = CorrectionApplier::new(&index, "qa")
            .apply(&CorrectionBatch::new(), &snapshot)
            .await
            .unwrap();
        assert!(report.items.is_empty());
        assert!(index.calls().is_empty());
    }
}
