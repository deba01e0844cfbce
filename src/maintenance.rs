//! Operator-facing maintenance commands.
//!
//! Each command follows the same order: ping the index, read (and, for
//! anything that mutates, snapshot), then mutate. A fatal error before
//! the mutation step leaves the index untouched and says so.
//!
//! | Command | Reads | Snapshot | Mutates |
//! |---------|-------|----------|---------|
//! | [`search`](Maintenance::search) | top-K hits | - | - |
//! | [`purge`](Maintenance::purge) | top-K hits | listed hits | one `DeleteOne` |
//! | [`backup`](Maintenance::backup) | whole index via cursor | everything | - |
//! | [`review`](Maintenance::review) | candidates via cursor | candidates | one bulk request |
//! | [`resume`](Maintenance::resume) | saved snapshot | reuses it | one bulk request |
//! | [`apply_session`](Maintenance::apply_session) | saved session | reuses it | one bulk request |

use std::io::{BufRead, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::info;

use crate::apply::{ApplyReport, CorrectionApplier, Outcome};
use crate::config::Config;
use crate::cursor::traverse;
use crate::error::IndexError;
use crate::index::{IndexClient, ItemStatus};
use crate::models::{Document, Hit};
use crate::progress::ProgressReporter;
use crate::query::{BoostedField, HighlightSpec, Query, QueryService};
use crate::review::{run_review, DecisionSource, ReviewMachine, ReviewOutcome, ReviewSession};
use crate::snapshot::{SnapshotHandle, SnapshotStore};

const NOT_MUTATED: &str = "aborted before any mutation; the index was not modified";

/// How `kbm search` and `kbm purge` interpret their query text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SearchMode {
    /// Phrase with slop, OR-ed with a plain word match.
    Tolerant,
    /// Field contains the text anywhere.
    Contains,
    /// Same text across every configured search field.
    Multi,
    /// Field is absent, empty, or blank (text is ignored).
    Empty,
}

/// Result of `kbm purge`.
#[derive(Debug, Clone, PartialEq)]
pub enum PurgeOutcome {
    NoMatches,
    Aborted,
    Deleted { id: String, snapshot: PathBuf },
    AlreadyAbsent { id: String, snapshot: PathBuf },
}

/// Result of `kbm review` or a resumed review.
#[derive(Debug)]
pub struct ReviewRun {
    pub outcome: ReviewOutcome,
    pub session: Option<PathBuf>,
    /// `None` when nothing was applied (dry run or empty batch).
    pub report: Option<ApplyReport>,
}

pub struct Maintenance<'a> {
    client: &'a dyn IndexClient,
    config: &'a Config,
    progress: &'a dyn ProgressReporter,
}

impl<'a> Maintenance<'a> {
    pub fn new(
        client: &'a dyn IndexClient,
        config: &'a Config,
        progress: &'a dyn ProgressReporter,
    ) -> Self {
        Self {
            client,
            config,
            progress,
        }
    }

    fn index(&self) -> &str {
        &self.config.index.name
    }

    fn snapshots(&self) -> SnapshotStore {
        SnapshotStore::new(&self.config.snapshot.dir)
    }

    pub async fn ensure_reachable(&self) -> Result<()> {
        if self.client.ping().await {
            Ok(())
        } else {
            Err(anyhow::Error::new(IndexError::Connection(self.config.index.url.clone()))
                .context(NOT_MUTATED))
        }
    }

    /// Build the query for a search mode.
    pub fn build_query(&self, mode: SearchMode, text: &str, field: Option<&str>) -> Result<Query> {
        let field = field
            .unwrap_or(&self.config.search.default_field)
            .to_string();
        Ok(match mode {
            SearchMode::Tolerant => Query::Tolerant {
                field,
                text: text.to_string(),
                slop: self.config.search.slop,
            },
            SearchMode::Contains => Query::Contains {
                field,
                term: text.to_string(),
            },
            SearchMode::Multi => Query::MultiField {
                text: text.to_string(),
                fields: self
                    .config
                    .search
                    .fields
                    .iter()
                    .map(|f| f.parse::<BoostedField>().map_err(anyhow::Error::msg))
                    .collect::<Result<Vec<_>>>()
                    .context("search.fields")?,
            },
            SearchMode::Empty => Query::Empty { field },
        })
    }

    fn highlight_for(&self, query: &Query) -> HighlightSpec {
        let fields = match query.fields() {
            f if f.is_empty() => vec![self.config.search.default_field.as_str()],
            f => f,
        };
        HighlightSpec::from_config(&self.config.highlight, &fields)
    }

    /// Print the top `limit` hits with highlighted fragments.
    pub async fn search(&self, query: &Query, limit: usize, out: &mut dyn Write) -> Result<Vec<Hit>> {
        self.ensure_reachable().await?;
        let highlight = self.highlight_for(query);
        let hits = QueryService::new(self.client)
            .search(self.index(), query, limit, Some(&highlight))
            .await?;

        if hits.is_empty() {
            writeln!(out, "No results.")?;
            return Ok(hits);
        }
        for (i, hit) in hits.iter().enumerate() {
            print_hit(out, i + 1, hit)?;
        }
        Ok(hits)
    }

    /// Search, let the operator pick one hit, snapshot, then delete it.
    pub async fn purge(
        &self,
        query: &Query,
        limit: usize,
        input: &mut dyn BufRead,
        out: &mut dyn Write,
    ) -> Result<PurgeOutcome> {
        let hits = self.search(query, limit, out).await?;
        if hits.is_empty() {
            return Ok(PurgeOutcome::NoMatches);
        }

        let id = loop {
            write!(out, "id to delete (empty to abort) > ")?;
            out.flush()?;
            let Some(line) = read_line(input)? else {
                return Ok(PurgeOutcome::Aborted);
            };
            if line.is_empty() {
                return Ok(PurgeOutcome::Aborted);
            }
            if hits.iter().any(|h| h.id() == line) {
                break line;
            }
            writeln!(out, "'{}' is not in the result list.", line)?;
        };

        write!(out, "Delete {}? [y/N] > ", id)?;
        out.flush()?;
        let confirmed = matches!(
            read_line(input)?.as_deref().map(str::to_lowercase).as_deref(),
            Some("y") | Some("yes")
        );
        if !confirmed {
            writeln!(out, "Aborted; nothing deleted.")?;
            return Ok(PurgeOutcome::Aborted);
        }

        let listed: Vec<Document> = hits.into_iter().map(|h| h.document).collect();
        let snapshot = self
            .snapshots()
            .write(&listed, &format!("purge_{}", self.index()))
            .context(NOT_MUTATED)?;

        info!(%id, snapshot = %snapshot.path().display(), "deleting document");
        match self.client.delete_one(self.index(), &id).await? {
            ItemStatus::Ok => {
                writeln!(out, "Deleted {} (snapshot: {}).", id, snapshot.path().display())?;
                Ok(PurgeOutcome::Deleted {
                    id,
                    snapshot: snapshot.path().to_path_buf(),
                })
            }
            ItemStatus::NotFound => {
                writeln!(out, "{} was already gone.", id)?;
                Ok(PurgeOutcome::AlreadyAbsent {
                    id,
                    snapshot: snapshot.path().to_path_buf(),
                })
            }
            ItemStatus::Failed(reason) => bail!("failed to delete {}: {}", id, reason),
        }
    }

    /// Export the entire index to a new snapshot, page by page.
    pub async fn backup(&self, label: Option<&str>) -> Result<SnapshotHandle> {
        self.ensure_reachable().await?;
        let label = label
            .map(str::to_string)
            .unwrap_or_else(|| format!("backup_{}", self.index()));
        let (_, handle) = self.stream_to_snapshot(&Query::All, &label, false).await?;
        Ok(handle)
    }

    /// Traverse every match of `query` into a fresh snapshot, optionally
    /// keeping the documents as review candidates.
    async fn stream_to_snapshot(
        &self,
        query: &Query,
        label: &str,
        keep: bool,
    ) -> Result<(Vec<Document>, SnapshotHandle)> {
        let mut writer = self.snapshots().create(label).context(NOT_MUTATED)?;
        let mut kept = Vec::new();
        traverse(
            self.client,
            self.index(),
            query,
            self.config.scroll.page_size,
            self.config.scroll.ttl(),
            label,
            self.progress,
            |page| {
                writer.append_hits(page)?;
                if keep {
                    kept.extend(page.iter().map(|h| h.document.clone()));
                }
                Ok(ControlFlow::Continue(()))
            },
        )
        .await
        .context(NOT_MUTATED)?;
        let handle = writer.finish().context(NOT_MUTATED)?;
        Ok((kept, handle))
    }

    /// Find candidates, snapshot them, review them, then apply the batch.
    pub async fn review(
        &self,
        query: &Query,
        source: &mut dyn DecisionSource,
        dry_run: bool,
        out: &mut dyn Write,
    ) -> Result<ReviewRun> {
        self.ensure_reachable().await?;
        let label = format!("review_{}", self.index());
        let (candidates, snapshot) = self.stream_to_snapshot(query, &label, true).await?;
        writeln!(
            out,
            "{} candidate(s); snapshot: {}",
            candidates.len(),
            snapshot.path().display()
        )?;
        if candidates.is_empty() {
            return Ok(ReviewRun {
                outcome: ReviewOutcome {
                    batch: Default::default(),
                    position: 0,
                    completed: true,
                },
                session: None,
                report: None,
            });
        }

        let outcome = run_review(ReviewMachine::new(candidates), source);
        self.finish_review(outcome, &snapshot, dry_run, out).await
    }

    /// Continue a saved review where it stopped.
    pub async fn resume(
        &self,
        session_path: &Path,
        source: &mut dyn DecisionSource,
        dry_run: bool,
        out: &mut dyn Write,
    ) -> Result<ReviewRun> {
        self.ensure_reachable().await?;
        let session = ReviewSession::load(session_path)?;
        self.check_session_index(&session)?;
        let (snapshot, candidates) =
            SnapshotHandle::open_with_documents(&session.snapshot).context(NOT_MUTATED)?;
        writeln!(
            out,
            "Resuming at {}/{} with {} staged correction(s).",
            (session.position + 1).min(candidates.len()),
            candidates.len(),
            session.corrections.len()
        )?;

        let machine = ReviewMachine::resume(candidates, session.position, session.corrections);
        let outcome = run_review(machine, source);
        self.finish_review(outcome, &snapshot, dry_run, out).await
    }

    async fn finish_review(
        &self,
        outcome: ReviewOutcome,
        snapshot: &SnapshotHandle,
        dry_run: bool,
        out: &mut dyn Write,
    ) -> Result<ReviewRun> {
        let session = ReviewSession {
            index: self.index().to_string(),
            snapshot: snapshot.path().to_path_buf(),
            position: outcome.position,
            completed: outcome.completed,
            corrections: outcome.batch.clone(),
            saved_at: Utc::now(),
        };
        let session_path = session.save().context(NOT_MUTATED)?;
        let (edits, deletes) = outcome.batch.counts();
        writeln!(
            out,
            "Staged {} edit(s), {} delete(s); session saved to {}",
            edits,
            deletes,
            session_path.display()
        )?;

        if dry_run || outcome.batch.is_empty() {
            if dry_run {
                writeln!(out, "Dry run; nothing applied.")?;
            }
            return Ok(ReviewRun {
                outcome,
                session: Some(session_path),
                report: None,
            });
        }

        let report = CorrectionApplier::new(self.client, self.index())
            .apply(&outcome.batch, snapshot)
            .await?;
        print_report(out, &report)?;
        Ok(ReviewRun {
            outcome,
            session: Some(session_path),
            report: Some(report),
        })
    }

    /// Apply a saved session's batch against its recorded snapshot.
    pub async fn apply_session(&self, session_path: &Path, out: &mut dyn Write) -> Result<ApplyReport> {
        self.ensure_reachable().await?;
        let session = ReviewSession::load(session_path)?;
        self.check_session_index(&session)?;
        let snapshot = SnapshotHandle::open(&session.snapshot).context(NOT_MUTATED)?;

        let report = CorrectionApplier::new(self.client, self.index())
            .apply(&session.corrections, &snapshot)
            .await
            .context(NOT_MUTATED)?;
        print_report(out, &report)?;
        Ok(report)
    }

    fn check_session_index(&self, session: &ReviewSession) -> Result<()> {
        if session.index != self.index() {
            bail!(
                "session belongs to index '{}', but the configured index is '{}'",
                session.index,
                self.index()
            );
        }
        Ok(())
    }
}

fn read_line(input: &mut dyn BufRead) -> Result<Option<String>> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

fn print_hit(out: &mut dyn Write, rank: usize, hit: &Hit) -> std::io::Result<()> {
    writeln!(out, "{}. [{:.2}] id: {}", rank, hit.score, hit.id())?;
    for (name, value) in &hit.document.fields {
        let shown = value
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string());
        writeln!(out, "    {}: {}", name, shown.replace('\n', " ").trim())?;
    }
    for (field, fragments) in &hit.highlights {
        for fragment in fragments {
            writeln!(out, "    ~{}: \"{}\"", field, fragment.replace('\n', " ").trim())?;
        }
    }
    writeln!(out)
}

/// Print successes and each failed id with its reason.
pub fn print_report(out: &mut dyn Write, report: &ApplyReport) -> std::io::Result<()> {
    let failures = report.failures();
    writeln!(
        out,
        "Applied: {} succeeded, {} failed.",
        report.successes(),
        failures.len()
    )?;
    for item in failures {
        if let Outcome::Failure(reason) = &item.outcome {
            writeln!(out, "  failed {} ({}): {}", item.doc_id, item.kind, reason)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[test]
    fn build_query_uses_config_defaults() {
        let cfg = parse_config(
            "[index]\nurl = \"http://localhost:9200\"\nname = \"qa\"\n[search]\nfields = [\"question^3\", \"answer\"]\nslop = 5\n",
        )
        .unwrap();
        let index = crate::index::memory::InMemoryIndex::new();
        let m = Maintenance::new(&index, &cfg, &crate::progress::NoProgress);

        assert_eq!(
            m.build_query(SearchMode::Tolerant, "reset", None).unwrap(),
            Query::Tolerant {
                field: "question".into(),
                text: "reset".into(),
                slop: 5
            }
        );
        match m.build_query(SearchMode::Multi, "reset", None).unwrap() {
            Query::MultiField { fields, .. } => {
                assert_eq!(fields[0], BoostedField::new("question", 3.0));
                assert_eq!(fields[1], BoostedField::new("answer", 1.0));
            }
            other => panic!("unexpected query {:?}", other),
        }
        assert_eq!(
            m.build_query(SearchMode::Empty, "", Some("answer")).unwrap(),
            Query::Empty {
                field: "answer".into()
            }
        );
    }

    #[test]
    fn report_lists_failed_ids() {
        let report = ApplyReport {
            items: vec![
                crate::apply::ItemOutcome {
                    doc_id: "a".into(),
                    kind: "edit",
                    outcome: Outcome::Success,
                },
                crate::apply::ItemOutcome {
                    doc_id: "c".into(),
                    kind: "delete",
                    outcome: Outcome::Failure("queue full".into()),
                },
            ],
        };
        let mut out = Vec::new();
        print_report(&mut out, &report).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("1 succeeded, 1 failed"));
        assert!(text.contains("failed c (delete): queue full"));
    }
}
