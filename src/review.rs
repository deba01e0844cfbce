//! Operator review of candidate documents.
//!
//! [`ReviewMachine`] walks a fixed candidate list one document at a time
//! and stages corrections into a [`CorrectionBatch`]. Decisions come from a
//! [`DecisionSource`]: [`ConsoleDecisions`] reads an interactive terminal,
//! [`ScriptedDecisions`] replays a fixed list for tests and automation.
//!
//! # States
//!
//! | State | Action | Next state | Staged |
//! |-------|--------|------------|--------|
//! | `Presenting(i)` | `Next` / `Skip` | `Presenting(i+1)` or `Done` | nothing |
//! | `Presenting(i)` | `Previous` | `Presenting(i-1)`, or stays with a boundary notice at 0 | nothing |
//! | `Presenting(i)` | `Edit(fields)` | as `Next` | `Edit(doc_i)` |
//! | `Presenting(i)` | `Delete` | `ConfirmingDelete(i)` | nothing |
//! | `ConfirmingDelete(i)` | `Confirm` | as `Next` | `Delete(doc_i)` |
//! | `ConfirmingDelete(i)` | `Cancel` | `Presenting(i)` | nothing |
//! | any | unrecognized | unchanged, `InvalidOperatorInput` notice | nothing |
//!
//! Quitting before `Done` is not an error; the batch staged so far is the
//! result. [`ReviewSession`] persists that result so a later run can resume
//! at the same position or apply it.

use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::{Correction, CorrectionBatch, Document, Fields};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewState {
    Presenting(usize),
    ConfirmingDelete(usize),
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Next,
    Skip,
    Previous,
    /// Field updates applied on top of the presented document.
    Edit(Fields),
    Delete,
    Confirm,
    Cancel,
    /// End the session now, keeping what was staged.
    Quit,
    Unrecognized(String),
}

/// Something the operator should be told; never an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    AtFirstCandidate,
    InvalidOperatorInput(String),
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notice::AtFirstCandidate => write!(f, "Already at the first candidate."),
            Notice::InvalidOperatorInput(input) => write!(f, "Unrecognized input: '{}'", input),
        }
    }
}

/// What the decision source sees for the current step.
pub struct ReviewView<'a> {
    pub document: &'a Document,
    pub position: usize,
    pub total: usize,
    pub confirming_delete: bool,
    pub staged: Option<&'a Correction>,
}

pub struct ReviewMachine {
    candidates: Vec<Document>,
    state: ReviewState,
    batch: CorrectionBatch,
}

impl ReviewMachine {
    pub fn new(candidates: Vec<Document>) -> Self {
        Self::resume(candidates, 0, CorrectionBatch::new())
    }

    /// Continue a saved session at `position` with its staged batch.
    pub fn resume(candidates: Vec<Document>, position: usize, batch: CorrectionBatch) -> Self {
        let state = if position < candidates.len() {
            ReviewState::Presenting(position)
        } else {
            ReviewState::Done
        };
        Self {
            candidates,
            state,
            batch,
        }
    }

    pub fn state(&self) -> ReviewState {
        self.state
    }

    pub fn batch(&self) -> &CorrectionBatch {
        &self.batch
    }

    pub fn candidates(&self) -> &[Document] {
        &self.candidates
    }

    /// Index of the candidate being shown; the candidate count once done.
    pub fn position(&self) -> usize {
        match self.state {
            ReviewState::Presenting(i) | ReviewState::ConfirmingDelete(i) => i,
            ReviewState::Done => self.candidates.len(),
        }
    }

    pub fn view(&self) -> Option<ReviewView<'_>> {
        let (i, confirming_delete) = match self.state {
            ReviewState::Presenting(i) => (i, false),
            ReviewState::ConfirmingDelete(i) => (i, true),
            ReviewState::Done => return None,
        };
        let document = &self.candidates[i];
        Some(ReviewView {
            document,
            position: i,
            total: self.candidates.len(),
            confirming_delete,
            staged: self.batch.get(&document.id),
        })
    }

    fn advance(&mut self, i: usize) {
        self.state = if i + 1 < self.candidates.len() {
            ReviewState::Presenting(i + 1)
        } else {
            ReviewState::Done
        };
    }

    /// Apply one operator action. `Quit` is handled by the caller.
    pub fn step(&mut self, action: Action) -> Option<Notice> {
        match (self.state, action) {
            (ReviewState::Done, _) => None,
            (ReviewState::Presenting(i), Action::Next | Action::Skip) => {
                self.advance(i);
                None
            }
            (ReviewState::Presenting(i), Action::Previous) => {
                if i == 0 {
                    Some(Notice::AtFirstCandidate)
                } else {
                    self.state = ReviewState::Presenting(i - 1);
                    None
                }
            }
            (ReviewState::Presenting(i), Action::Edit(updates)) => {
                let doc = &self.candidates[i];
                let mut fields = doc.fields.clone();
                fields.extend(updates);
                debug!(id = %doc.id, "staged edit");
                self.batch.stage(Correction::Edit {
                    doc_id: doc.id.clone(),
                    fields,
                });
                self.advance(i);
                None
            }
            (ReviewState::Presenting(i), Action::Delete) => {
                self.state = ReviewState::ConfirmingDelete(i);
                None
            }
            (ReviewState::ConfirmingDelete(i), Action::Confirm) => {
                let id = self.candidates[i].id.clone();
                debug!(%id, "staged delete");
                self.batch.stage(Correction::Delete { doc_id: id });
                self.advance(i);
                None
            }
            (ReviewState::ConfirmingDelete(i), Action::Cancel) => {
                self.state = ReviewState::Presenting(i);
                None
            }
            (_, other) => Some(Notice::InvalidOperatorInput(describe(&other))),
        }
    }

    pub fn into_batch(self) -> CorrectionBatch {
        self.batch
    }
}

fn describe(action: &Action) -> String {
    match action {
        Action::Unrecognized(input) => input.clone(),
        Action::Edit(_) => "edit".to_string(),
        other => format!("{:?}", other).to_lowercase(),
    }
}

/// Supplies the next operator action for the document on screen.
pub trait DecisionSource {
    fn decide(&mut self, view: &ReviewView<'_>) -> Action;

    /// Surface a notice; the same document will be presented again.
    fn notify(&mut self, notice: &Notice) {
        let _ = notice;
    }
}

/// Replays a fixed action list; quits when it runs out.
#[derive(Debug, Default)]
pub struct ScriptedDecisions {
    actions: VecDeque<Action>,
    pub notices: Vec<Notice>,
}

impl ScriptedDecisions {
    pub fn new(actions: impl IntoIterator<Item = Action>) -> Self {
        Self {
            actions: actions.into_iter().collect(),
            notices: Vec::new(),
        }
    }
}

impl DecisionSource for ScriptedDecisions {
    fn decide(&mut self, _view: &ReviewView<'_>) -> Action {
        self.actions.pop_front().unwrap_or(Action::Quit)
    }

    fn notify(&mut self, notice: &Notice) {
        self.notices.push(notice.clone());
    }
}

/// Line-oriented interactive prompt over any reader/writer pair.
///
/// Edits replace `edit_field`; end of input quits.
pub struct ConsoleDecisions<R, W> {
    input: R,
    output: W,
    edit_field: String,
}

impl<R: BufRead, W: Write> ConsoleDecisions<R, W> {
    pub fn new(input: R, output: W, edit_field: impl Into<String>) -> Self {
        Self {
            input,
            output,
            edit_field: edit_field.into(),
        }
    }

    fn read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        match self.input.read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
            Err(e) => {
                warn!(error = %e, "failed to read operator input");
                None
            }
        }
    }

    fn show(&mut self, view: &ReviewView<'_>) -> std::io::Result<()> {
        writeln!(self.output)?;
        writeln!(
            self.output,
            "[{}/{}] id: {}",
            view.position + 1,
            view.total,
            view.document.id
        )?;
        for (name, value) in &view.document.fields {
            match value.as_str() {
                Some(s) => writeln!(self.output, "  {}: {}", name, s)?,
                None => writeln!(self.output, "  {}: {}", name, value)?,
            }
        }
        if let Some(staged) = view.staged {
            writeln!(self.output, "  (staged: {})", staged.kind())?;
        }
        if view.confirming_delete {
            write!(self.output, "Delete {}? [y]es / [n]o > ", view.document.id)?;
        } else {
            write!(
                self.output,
                "[n]ext [s]kip [p]revious [e]dit [d]elete [q]uit > "
            )?;
        }
        self.output.flush()
    }

    fn edit(&mut self, inline: &str) -> Action {
        let text = if inline.is_empty() {
            let _ = write!(self.output, "new {}: ", self.edit_field);
            let _ = self.output.flush();
            match self.read_line() {
                Some(line) => line,
                None => return Action::Quit,
            }
        } else {
            inline.to_string()
        };
        if text.trim().is_empty() {
            return Action::Unrecognized("edit with empty text".to_string());
        }
        let mut fields = Fields::new();
        fields.insert(self.edit_field.clone(), serde_json::Value::String(text));
        Action::Edit(fields)
    }
}

impl<R: BufRead, W: Write> DecisionSource for ConsoleDecisions<R, W> {
    fn decide(&mut self, view: &ReviewView<'_>) -> Action {
        if let Err(e) = self.show(view) {
            warn!(error = %e, "failed to write review prompt");
            return Action::Quit;
        }
        let Some(line) = self.read_line() else {
            return Action::Quit;
        };
        let trimmed = line.trim();
        let (command, rest) = match trimmed.split_once(' ') {
            Some((c, r)) => (c, r.trim()),
            None => (trimmed, ""),
        };

        if view.confirming_delete {
            return match command.to_lowercase().as_str() {
                "y" | "yes" | "confirm" => Action::Confirm,
                "n" | "no" | "cancel" => Action::Cancel,
                "q" | "quit" => Action::Quit,
                _ => Action::Unrecognized(line),
            };
        }
        match command.to_lowercase().as_str() {
            "n" | "next" => Action::Next,
            "s" | "skip" => Action::Skip,
            "p" | "prev" | "previous" => Action::Previous,
            "e" | "edit" => self.edit(rest),
            "d" | "delete" => Action::Delete,
            "q" | "quit" | "exit" => Action::Quit,
            _ => Action::Unrecognized(line),
        }
    }

    fn notify(&mut self, notice: &Notice) {
        let _ = writeln!(self.output, "{}", notice);
    }
}

/// Result of driving a machine until done or quit.
#[derive(Debug)]
pub struct ReviewOutcome {
    pub batch: CorrectionBatch,
    /// Where the session stopped; equals the candidate count when completed.
    pub position: usize,
    pub completed: bool,
}

/// Drive `machine` with `source` until `Done` or the operator quits.
pub fn run_review(mut machine: ReviewMachine, source: &mut dyn DecisionSource) -> ReviewOutcome {
    loop {
        let Some(view) = machine.view() else {
            break;
        };
        let action = source.decide(&view);
        if action == Action::Quit {
            break;
        }
        if let Some(notice) = machine.step(action) {
            source.notify(&notice);
        }
    }
    let completed = machine.state() == ReviewState::Done;
    let position = machine.position();
    ReviewOutcome {
        batch: machine.into_batch(),
        position,
        completed,
    }
}

/// A saved review: enough to resume it or to apply its batch later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewSession {
    pub index: String,
    /// Snapshot covering every candidate of the session.
    pub snapshot: PathBuf,
    pub position: usize,
    pub completed: bool,
    pub corrections: CorrectionBatch,
    pub saved_at: DateTime<Utc>,
}

impl ReviewSession {
    /// Session file path for a snapshot: `<snapshot stem>.session.json`.
    pub fn path_for(snapshot: &Path) -> PathBuf {
        snapshot.with_extension("session.json")
    }

    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::path_for(&self.snapshot);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to save review session: {}", path.display()))?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read review session: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse review session: {}", path.display()))
    }
}
