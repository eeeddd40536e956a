//! Append-only JSON-lines journal backing [`crate::MemoryBroker`].
//!
//! Every state change of the broker is written as one line before the call
//! returns; opening a broker replays the lines in order and then rewrites
//! the file as a snapshot of the resulting state.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::log::{EntryId, Fields};
use crate::BrokerError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalOp {
    Append {
        stream: String,
        id: EntryId,
        fields: Fields,
    },
    CreateGroup {
        stream: String,
        group: String,
        last_delivered: EntryId,
    },
    Deliver {
        stream: String,
        group: String,
        consumer: String,
        id: EntryId,
    },
    Ack {
        stream: String,
        group: String,
        id: EntryId,
    },
    ListPush {
        key: String,
        value: String,
    },
    Delete {
        key: String,
    },
    /// Entries up to and including `up_to` were dropped from `stream`.
    Trim {
        stream: String,
        up_to: EntryId,
    },
}

pub struct Journal {
    path: PathBuf,
    file: File,
}

impl Journal {
    /// Open (creating if needed) a journal and return the operations it
    /// already holds. A torn last line from a crash is skipped.
    pub fn open(path: &Path) -> Result<(Self, Vec<JournalOp>), BrokerError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut ops = Vec::new();
        let mut torn = false;
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            torn = !content.is_empty() && !content.ends_with('\n');
            for (lineno, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<JournalOp>(line) {
                    Ok(op) => ops.push(op),
                    Err(e) => tracing::warn!(
                        path = %path.display(),
                        line = lineno + 1,
                        error = %e,
                        "Skipping unreadable journal line"
                    ),
                }
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if torn {
            // Terminate the torn line so the next record starts clean.
            file.write_all(b"\n")?;
        }
        Ok((
            Self {
                path: path.to_path_buf(),
                file,
            },
            ops,
        ))
    }

    pub fn record(&mut self, op: &JournalOp) -> Result<(), BrokerError> {
        let mut line = serde_json::to_string(op)?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.flush())
            .map_err(|e| BrokerError::Journal(format!("{}: {e}", self.path.display())))
    }

    /// Replace the journal with `ops`, written to a sibling file first and
    /// renamed over the old one.
    pub fn rewrite(&mut self, ops: &[JournalOp]) -> Result<(), BrokerError> {
        let tmp = self.path.with_extension("compact");
        let mut content = String::new();
        for op in ops {
            content.push_str(&serde_json::to_string(op)?);
            content.push('\n');
        }
        std::fs::write(&tmp, content)
            .and_then(|_| std::fs::rename(&tmp, &self.path))
            .map_err(|e| BrokerError::Journal(format!("{}: {e}", self.path.display())))?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
