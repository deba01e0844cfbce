//! Traversal progress reporting.
//!
//! Reports observable progress while a cursor walks an index (during
//! `kbm backup` and the candidate phase of `kbm review`) so operators see
//! how many documents have been fetched out of how many match.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for a traversal.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    /// The cursor is open; the server reported `total` matches.
    Opened { label: String, total: u64 },
    /// `n` documents fetched so far out of `total`.
    Fetching { label: String, n: u64, total: u64 },
    /// The traversal ended after `n` documents.
    Finished { label: String, n: u64 },
}

/// Reports traversal progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "backup qa  fetching  1,000 / 5,000 documents".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Opened { label, total } => {
                format!("{}  {} matching documents\n", label, format_number(*total))
            }
            ProgressEvent::Fetching { label, n, total } => format!(
                "{}  fetching  {} / {} documents\n",
                label,
                format_number(*n),
                format_number(*total)
            ),
            ProgressEvent::Finished { label, n } => {
                format!("{}  done  {} documents\n", label, format_number(*n))
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Opened { label, total } => serde_json::json!({
                "event": "progress",
                "label": label,
                "phase": "opened",
                "total": total
            }),
            ProgressEvent::Fetching { label, n, total } => serde_json::json!({
                "event": "progress",
                "label": label,
                "phase": "fetching",
                "n": n,
                "total": total
            }),
            ProgressEvent::Finished { label, n } => serde_json::json!({
                "event": "progress",
                "label": label,
                "phase": "finished",
                "n": n
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
