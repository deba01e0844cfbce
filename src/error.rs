//! Error taxonomy for index operations.
//!
//! Every variant is fatal for the call that produced it. Recoverable
//! conditions (per-item apply failures, bad operator input) are reported
//! as values elsewhere: see [`crate::apply::ApplyReport`] and
//! [`crate::review::Notice`].

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    /// The index could not be reached at all.
    #[error("index unreachable: {0}")]
    Connection(String),

    /// The index rejected the query (malformed shape, unknown field).
    #[error("query rejected: {reason}\n  query: {query}")]
    Query { query: String, reason: String },

    /// The server-side cursor timed out or is unknown to the server.
    #[error("cursor expired; restart the traversal from the beginning")]
    CursorExpired,

    /// The cursor was read after it yielded an empty page or was released.
    #[error("cursor already exhausted or released")]
    CursorExhausted,

    /// A snapshot could not be written. Nothing may be mutated after this.
    #[error("failed to write snapshot {}: {source}", path.display())]
    BackupWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read snapshot {}: {reason}", path.display())]
    SnapshotRead { path: PathBuf, reason: String },

    /// A mutation was requested for ids no snapshot covers.
    #[error("refusing to mutate {} document(s) not covered by a snapshot: {}", ids.len(), ids.join(", "))]
    UncoveredMutation { ids: Vec<String> },

    /// The index answered with something this client does not understand.
    #[error("unexpected index response: {0}")]
    Transport(String),
}

impl IndexError {
    pub fn backup_write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IndexError::BackupWrite {
            path: path.into(),
            source,
        }
    }
}
