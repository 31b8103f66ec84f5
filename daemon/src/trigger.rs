/// Trigger channel: a per-worker directory of small JSON event files.
///
/// The controller publishes with an atomic rename so a trigger is never
/// observable half-written. A consumer claims each trigger by renaming it to a
/// hidden name, then reads, dispatches and deletes the claimed file; a
/// republish of the same key during that window is a new visible trigger.
/// A trigger that cannot be read or deleted is quarantined for the rest of
/// the consumer's lifetime instead of being redelivered.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::TriggerError;
use crate::paths::{self, TRIGGER_EXTENSION};

/// Larger payloads must be referenced by path rather than embedded.
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;
/// Upper bound on a whole trigger file (payload plus envelope).
const MAX_TRIGGER_FILE_BYTES: u64 = (MAX_PAYLOAD_BYTES as u64) + 4 * 1024;

/// A single notification that work is ready.
///
/// Unknown fields are ignored on read so newer controllers can add metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerRecord {
    pub kind: String,
    pub correlation_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Diagnostics only; never used for ordering.
    pub created_at: DateTime<Utc>,
}

impl TriggerRecord {
    pub fn new(kind: &str, correlation_id: &str, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.to_string(),
            correlation_id: correlation_id.to_string(),
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn file_name(&self) -> String {
        trigger_file_name(&self.kind, &self.correlation_id)
    }

    /// Time elapsed since the controller created this trigger.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

/// `{kind}-{correlation_id}.trigger`. Re-publishing the same pair targets the same file.
///
/// The name is not injective when either part contains `-`:
/// `("task", "ready-1")` and `("task-ready", "1")` share a file and overwrite
/// each other. Keep kinds free of the correlation ids' alphabet, or ids free of `-`.
pub fn trigger_file_name(kind: &str, correlation_id: &str) -> String {
    format!("{kind}-{correlation_id}.{TRIGGER_EXTENSION}")
}

/// A claimed trigger, read but not yet removed.
#[derive(Debug)]
pub struct PendingTrigger {
    /// Hidden path the trigger was claimed under; this is what gets removed.
    pub path: PathBuf,
    /// `Err(Malformed)` for unparseable files, which are discarded.
    /// `Err(Io)` for unreadable files, which are quarantined.
    pub record: Result<TriggerRecord, TriggerError>,
}

impl PendingTrigger {
    /// The file could not be read at all, as opposed to read and found malformed.
    pub fn is_unreadable(&self) -> bool {
        matches!(self.record, Err(TriggerError::Io { .. }))
    }
}

/// One worker's trigger directory.
#[derive(Debug)]
pub struct TriggerChannel {
    dir: PathBuf,
    quarantined: HashSet<PathBuf>,
}

impl TriggerChannel {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            quarantined: HashSet::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates the trigger directory if it does not already exist.
    pub fn ensure_dir(&self) -> Result<(), TriggerError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| TriggerError::Io {
            path: self.dir.clone(),
            source,
        })
    }

    /// Writes a trigger visible to this channel's watcher and returns its path.
    ///
    /// A second publish with the same `(kind, correlation_id)` before the first
    /// is consumed overwrites it, so only the latest payload is dispatched.
    pub fn publish(
        &self,
        kind: &str,
        correlation_id: &str,
        payload: serde_json::Value,
    ) -> Result<PathBuf, TriggerError> {
        validate_name("kind", kind)?;
        validate_name("correlation_id", correlation_id)?;

        let payload_size = serde_json::to_vec(&payload)
            .map(|v| v.len())
            .unwrap_or(usize::MAX);
        if payload_size > MAX_PAYLOAD_BYTES {
            return Err(TriggerError::PayloadTooLarge {
                size: payload_size,
                limit: MAX_PAYLOAD_BYTES,
            });
        }

        let record = TriggerRecord::new(kind, correlation_id, payload);
        let path = self.dir.join(record.file_name());
        let bytes = serde_json::to_vec(&record).map_err(|e| TriggerError::Malformed {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        self.ensure_dir()?;
        paths::write_atomically(&path, &bytes).map_err(|source| TriggerError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// Lists visible trigger files, oldest first (modification time, then name).
    ///
    /// Temporary files, dotfiles, foreign files and quarantined triggers are skipped.
    pub fn scan(&self) -> Result<Vec<PathBuf>, TriggerError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| TriggerError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut found: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !is_trigger_file(&path) || self.quarantined.contains(&path) {
                continue;
            }
            let modified = match entry.metadata() {
                Ok(meta) if meta.is_file() => meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                // Vanished between read_dir and stat, or not a regular file.
                _ => continue,
            };
            found.push((modified, path));
        }

        found.sort();
        Ok(found.into_iter().map(|(_, path)| path).collect())
    }

    /// Takes the trigger at `path` out of the visible set and reads it.
    ///
    /// Returns `Ok(None)` when the file vanished before it could be claimed.
    /// A rename failure quarantines `path` so later scans skip it.
    pub fn claim(&mut self, path: &Path) -> Result<Option<PendingTrigger>, TriggerError> {
        let claimed = paths::claim_path(path);
        match std::fs::rename(path, &claimed) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                self.quarantined.insert(path.to_path_buf());
                return Err(TriggerError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }

        let record = read_record(&claimed);
        if let Ok(record) = &record {
            let expected = record.file_name();
            if path.file_name().is_some_and(|name| name != expected.as_str()) {
                tracing::warn!(
                    path = %path.display(),
                    kind = %record.kind,
                    correlation_id = %record.correlation_id,
                    expected = %expected,
                    "trigger file name does not match its record"
                );
            }
        }
        Ok(Some(PendingTrigger {
            path: claimed,
            record,
        }))
    }

    /// Leaves `path` in place and excludes it from further scans.
    pub fn quarantine(&mut self, path: &Path) {
        self.quarantined.insert(path.to_path_buf());
    }

    /// Puts triggers left claimed by a consumer that exited mid-dispatch back
    /// into the visible set, and returns how many were restored.
    ///
    /// A claimed copy whose key has been republished since is older than the
    /// visible trigger and is dropped.
    pub fn recover_claimed(&mut self) -> Result<usize, TriggerError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| TriggerError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut restored = 0;
        for entry in entries.flatten() {
            let claimed = entry.path();
            let Some(original) = paths::claimed_original(&claimed) else {
                continue;
            };
            // A hard link never replaces an existing file, unlike rename.
            match std::fs::hard_link(&claimed, &original) {
                Ok(()) => restored += 1,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => {
                    tracing::warn!(path = %claimed.display(), error = %e, "cannot restore claimed trigger");
                    continue;
                }
            }
            if let Err(e) = std::fs::remove_file(&claimed) {
                tracing::warn!(path = %claimed.display(), error = %e, "cannot remove claimed trigger");
            }
        }
        Ok(restored)
    }

    /// Removes a dispatched (or malformed) trigger.
    ///
    /// A file that is already gone counts as removed. Any other failure
    /// quarantines the path so later scans skip it.
    pub fn remove(&mut self, path: &Path) -> Result<(), TriggerError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => {
                self.quarantined.insert(path.to_path_buf());
                Err(TriggerError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }

    /// Takes the next pending trigger, removing it from the visible set.
    ///
    /// An unreadable trigger is returned with its error and stays quarantined
    /// under its claimed name. Returns `Ok(None)` when the channel is empty.
    pub fn consume(&mut self) -> Result<Option<PendingTrigger>, TriggerError> {
        for path in self.scan()? {
            let Some(pending) = self.claim(&path)? else {
                continue;
            };
            if pending.is_unreadable() {
                self.quarantine(&pending.path);
            } else {
                self.remove(&pending.path)?;
            }
            return Ok(Some(pending));
        }
        Ok(None)
    }

    /// Number of triggers this instance refused to redeliver.
    pub fn quarantined_count(&self) -> usize {
        self.quarantined.len()
    }

    /// Returns `true` if at least one trigger is waiting.
    pub fn has_pending(&self) -> bool {
        self.scan().map(|v| !v.is_empty()).unwrap_or(false)
    }
}

fn validate_name(field: &'static str, value: &str) -> Result<(), TriggerError> {
    if paths::is_safe_component(value) {
        Ok(())
    } else {
        Err(TriggerError::InvalidName {
            field,
            value: value.to_string(),
        })
    }
}

/// Visible `*.trigger` file name (temporary files are dot-prefixed).
pub fn is_trigger_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(true);
    !hidden && path.extension().is_some_and(|ext| ext == TRIGGER_EXTENSION)
}

fn read_record(path: &Path) -> Result<TriggerRecord, TriggerError> {
    let io_err = |source| TriggerError::Io {
        path: path.to_path_buf(),
        source,
    };
    let size = std::fs::metadata(path).map_err(io_err)?.len();
    if size > MAX_TRIGGER_FILE_BYTES {
        return Err(TriggerError::Malformed {
            path: path.to_path_buf(),
            reason: format!("file is {size} bytes, over the {MAX_TRIGGER_FILE_BYTES} byte limit"),
        });
    }
    let content = std::fs::read(path).map_err(io_err)?;
    serde_json::from_slice(&content).map_err(|e| TriggerError::Malformed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
