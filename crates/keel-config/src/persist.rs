use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use keel_domain::TimestampMs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ConfigTreeError;
use crate::tree::{ConfigTree, TopicNode};

pub(crate) const SNAPSHOT_FILE: &str = "config.snapshot.json";
pub(crate) const TLOG_FILE: &str = "config.tlog.jsonl";

// ── Transaction log ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum TlogOp {
    Write,
    Remove,
}

/// One journaled mutation. The log is a file of JSON lines appended before
/// the mutation becomes visible to readers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TlogEntry {
    pub ts: TimestampMs,
    pub path: String,
    pub op: TlogOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

pub(crate) struct Journal {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl Journal {
    pub(crate) fn open(path: &Path) -> Result<Self, ConfigTreeError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| ConfigTreeError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
        Ok(Journal {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub(crate) fn append(&mut self, entry: &TlogEntry) -> Result<(), ConfigTreeError> {
        let line = serde_json::to_string(entry)?;
        self.writer
            .write_all(line.as_bytes())
            .and_then(|_| self.writer.write_all(b"\n"))
            .and_then(|_| self.writer.flush())
            .map_err(|e| ConfigTreeError::Io {
                path: self.path.display().to_string(),
                source: e,
            })
    }
}

/// Replay a transaction log, handing each parseable entry to `apply`.
/// Corrupt lines are skipped with a warning; a missing file is an empty log.
fn replay_tlog(
    path: &Path,
    mut apply: impl FnMut(&TlogEntry),
) -> Result<usize, ConfigTreeError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(ConfigTreeError::Io {
                path: path.display().to_string(),
                source: e,
            })
        }
    };
    let mut replayed = 0;
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                warn!(path = %path.display(), lineno, error = %e, "unreadable tlog line skipped");
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TlogEntry>(&line) {
            Ok(entry) => {
                apply(&entry);
                replayed += 1;
            }
            Err(e) => {
                warn!(path = %path.display(), lineno, error = %e, "corrupt tlog entry skipped");
            }
        }
    }
    Ok(replayed)
}

// ── Tree store ────────────────────────────────────────────────────────────────

/// Opens and checkpoints a persistent [`ConfigTree`] under one directory:
/// a snapshot file plus the transaction log of mutations since.
pub struct TreeStore {
    dir: PathBuf,
}

impl TreeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        TreeStore { dir: dir.into() }
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    fn tlog_path(&self) -> PathBuf {
        self.dir.join(TLOG_FILE)
    }

    /// Load the snapshot (fatal if present but unreadable), replay the
    /// transaction log over it, and return a live journaling tree.
    pub fn open(&self) -> Result<ConfigTree, ConfigTreeError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| ConfigTreeError::Io {
            path: self.dir.display().to_string(),
            source: e,
        })?;

        let snapshot_path = self.snapshot_path();
        let root = match std::fs::read(&snapshot_path) {
            Ok(bytes) => serde_json::from_slice::<TopicNode>(&bytes).map_err(|e| {
                ConfigTreeError::CorruptSnapshot {
                    path: snapshot_path.display().to_string(),
                    message: e.to_string(),
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => TopicNode::default(),
            Err(e) => {
                return Err(ConfigTreeError::Io {
                    path: snapshot_path.display().to_string(),
                    source: e,
                })
            }
        };

        let tree = ConfigTree::with_journal(None, root);
        let replayed = replay_tlog(&self.tlog_path(), |entry| tree.apply_replayed(entry))?;
        if replayed > 0 {
            debug!(replayed, "transaction log replayed");
        }
        tree.replace_journal(Some(Journal::open(&self.tlog_path())?));
        Ok(tree)
    }

    /// Write a fresh snapshot atomically (temp + rename) and truncate the
    /// transaction log.
    pub fn checkpoint(&self, tree: &ConfigTree) -> Result<(), ConfigTreeError> {
        let bytes = tree.snapshot_bytes()?;
        write_atomically(&self.snapshot_path(), &bytes)?;

        // Truncate: mutations up to here are captured by the snapshot.
        let tlog = self.tlog_path();
        File::create(&tlog).map_err(|e| ConfigTreeError::Io {
            path: tlog.display().to_string(),
            source: e,
        })?;
        tree.replace_journal(Some(Journal::open(&tlog)?));
        Ok(())
    }
}

/// Write-temp-then-rename so readers never observe a half-written file.
pub fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), ConfigTreeError> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes).map_err(|e| ConfigTreeError::Io {
        path: tmp.display().to_string(),
        source: e,
    })?;
    std::fs::rename(&tmp, path).map_err(|e| ConfigTreeError::Io {
        path: path.display().to_string(),
        source: e,
    })
}
