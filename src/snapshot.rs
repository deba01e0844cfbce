//! Write-once document snapshots.
//!
//! A snapshot is a JSON Lines file, one `{"id": ..., "fields": {...}}`
//! record per line, named `<label>_<YYYYmmdd_HHMMSS>.jsonl` inside the
//! snapshot directory. Files are created with `create_new`, so an existing
//! snapshot is never overwritten: a name collision gets a numeric suffix.
//!
//! Pages are appended as they arrive ([`SnapshotWriter::append`]), so a
//! full export never holds the whole index in memory. [`SnapshotWriter::finish`]
//! flushes and fsyncs, and only then hands out the [`SnapshotHandle`] that
//! mutating operations require as proof of coverage.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::IndexError;
use crate::models::{Document, Hit};

pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create a new, empty snapshot file for `label`.
    pub fn create(&self, label: &str) -> Result<SnapshotWriter, IndexError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| IndexError::backup_write(&self.dir, e))?;

        let stem = format!(
            "{}_{}",
            sanitize(label),
            chrono::Local::now().format("%Y%m%d_%H%M%S")
        );
        let mut attempt = 0;
        loop {
            let name = if attempt == 0 {
                format!("{}.jsonl", stem)
            } else {
                format!("{}_{}.jsonl", stem, attempt)
            };
            let path = self.dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    info!(path = %path.display(), "snapshot created");
                    return Ok(SnapshotWriter {
                        path,
                        file: BufWriter::new(file),
                        ids: HashSet::new(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists && attempt < 1000 => attempt += 1,
                Err(e) => return Err(IndexError::backup_write(path, e)),
            }
        }
    }

    /// Write `documents` as a complete snapshot in one call.
    pub fn write(&self, documents: &[Document], label: &str) -> Result<SnapshotHandle, IndexError> {
        let mut writer = self.create(label)?;
        writer.append(documents)?;
        writer.finish()
    }
}

fn sanitize(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// An open snapshot being filled page by page.
pub struct SnapshotWriter {
    path: PathBuf,
    file: BufWriter<File>,
    ids: HashSet<String>,
}

impl SnapshotWriter {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn append(&mut self, documents: &[Document]) -> Result<(), IndexError> {
        for doc in documents {
            self.write_record(doc)?;
        }
        self.file
            .flush()
            .map_err(|e| IndexError::backup_write(&self.path, e))
    }

    pub fn append_hits(&mut self, hits: &[Hit]) -> Result<(), IndexError> {
        for hit in hits {
            self.write_record(&hit.document)?;
        }
        self.file
            .flush()
            .map_err(|e| IndexError::backup_write(&self.path, e))
    }

    fn write_record(&mut self, doc: &Document) -> Result<(), IndexError> {
        let line = serde_json::to_string(doc)
            .map_err(|e| IndexError::backup_write(&self.path, e.into()))?;
        writeln!(self.file, "{}", line).map_err(|e| IndexError::backup_write(&self.path, e))?;
        self.ids.insert(doc.id.clone());
        Ok(())
    }

    /// Flush and fsync; the snapshot is durable once this returns.
    pub fn finish(mut self) -> Result<SnapshotHandle, IndexError> {
        self.file
            .flush()
            .map_err(|e| IndexError::backup_write(&self.path, e))?;
        self.file
            .get_ref()
            .sync_all()
            .map_err(|e| IndexError::backup_write(&self.path, e))?;
        info!(path = %self.path.display(), documents = self.ids.len(), "snapshot written");
        Ok(SnapshotHandle {
            path: self.path,
            ids: self.ids,
        })
    }
}

/// Proof that a durable snapshot exists for a set of document ids.
#[derive(Debug, Clone)]
pub struct SnapshotHandle {
    path: PathBuf,
    ids: HashSet<String>,
}

impl SnapshotHandle {
    /// Re-open an existing snapshot file, e.g. to resume a review.
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        Self::open_with_documents(path).map(|(handle, _)| handle)
    }

    /// Re-open a snapshot and also return its documents, in file order.
    pub fn open_with_documents(path: &Path) -> Result<(Self, Vec<Document>), IndexError> {
        let docs = load(path)?;
        let handle = Self {
            path: path.to_path_buf(),
            ids: docs.iter().map(|d| d.id.clone()).collect(),
        };
        Ok((handle, docs))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn covers(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// The subset of `ids` this snapshot does not cover.
    pub fn uncovered<'b>(&self, ids: impl IntoIterator<Item = &'b str>) -> Vec<String> {
        ids.into_iter()
            .filter(|id| !self.covers(id))
            .map(str::to_string)
            .collect()
    }
}

/// Read every document of a snapshot, in file order.
pub fn load(path: &Path) -> Result<Vec<Document>, IndexError> {
    let read_err = |reason: String| IndexError::SnapshotRead {
        path: path.to_path_buf(),
        reason,
    };
    let file = File::open(path).map_err(|e| read_err(e.to_string()))?;
    let mut docs = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| read_err(e.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        let doc: Document =
            serde_json::from_str(&line).map_err(|e| read_err(format!("line {}: {}", n + 1, e)))?;
        docs.push(doc);
    }
    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, answer: &str) -> Document {
        Document::new(id, json!({ "question": "q", "answer": answer }).as_object().cloned().unwrap())
    }

    #[test]
    fn round_trip_preserves_ids_and_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let docs = vec![doc("a", "x"), doc("b", "multi\nline \"quoted\""), doc("c", "")];

        let handle = store.write(&docs, "backup_qa").unwrap();
        assert_eq!(handle.len(), 3);
        assert!(handle.covers("b"));
        assert_eq!(load(handle.path()).unwrap(), docs);
    }

    #[test]
    fn incremental_appends_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let mut writer = store.create("review").unwrap();
        writer.append(&[doc("a", "1")]).unwrap();
        writer.append(&[doc("b", "2"), doc("c", "3")]).unwrap();
        assert_eq!(writer.len(), 3);

        let handle = writer.finish().unwrap();
        let ids: Vec<String> = load(handle.path()).unwrap().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn same_label_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let first = store.write(&[doc("a", "1")], "backup").unwrap();
        let second = store.write(&[doc("b", "2")], "backup").unwrap();

        assert_ne!(first.path(), second.path());
        assert_eq!(load(first.path()).unwrap()[0].id, "a");
        assert_eq!(load(second.path()).unwrap()[0].id, "b");
    }

    #[test]
    fn file_name_carries_label_and_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let handle = store.write(&[], "backup qa/prod").unwrap();
        let name = handle.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("backup_qa_prod_"), "{}", name);
        assert!(name.ends_with(".jsonl"));
        // backup_qa_prod_YYYYmmdd_HHMMSS.jsonl
        assert_eq!(name.len(), "backup_qa_prod_".len() + 15 + ".jsonl".len());
    }

    #[test]
    fn unwritable_directory_is_backup_failure() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();
        let store = SnapshotStore::new(blocker.join("backups"));

        let err = store.create("backup").err().unwrap();
        assert!(matches!(err, IndexError::BackupWrite { .. }));
    }

    #[test]
    fn uncovered_lists_missing_ids() {
        let dir = tempfile::tempdir().unwrap();
        let handle = SnapshotStore::new(dir.path())
            .write(&[doc("a", "1")], "s")
            .unwrap();
        assert_eq!(handle.uncovered(["a", "z"]), vec!["z"]);

        let reopened = SnapshotHandle::open(handle.path()).unwrap();
        assert!(reopened.covers("a"));
    }

    #[test]
    fn corrupt_line_is_reported_with_line_number() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "{\"id\":\"a\",\"fields\":{}}\nnot json\n").unwrap();
        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }
}
