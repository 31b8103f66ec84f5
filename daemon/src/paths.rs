/// Canonical per-worker artifact paths.
///
///   - `{trigger_dir}/{worker}/`               trigger channel directory
///   - `{pipe_dir}/{worker}-control`           control pipe (commands in)
///   - `{pipe_dir}/{worker}-status`            status pipe (replies out)
///   - `{heartbeat_dir}/{worker}-watcher.json` heartbeat record
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::Config;

pub const TRIGGER_EXTENSION: &str = "trigger";
pub const CONTROL_PIPE_SUFFIX: &str = "-control";
pub const STATUS_PIPE_SUFFIX: &str = "-status";
pub const HEARTBEAT_FILE_SUFFIX: &str = "-watcher.json";
/// Extension of a trigger taken out of the visible set for dispatch.
pub const CLAIMED_EXTENSION: &str = "claimed";

/// Distinguishes concurrent temporary files written by the same process.
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// All filesystem locations owned by one worker's watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPaths {
    pub worker: String,
    pub trigger_dir: PathBuf,
    pub control_pipe: PathBuf,
    pub status_pipe: PathBuf,
    pub heartbeat_file: PathBuf,
}

impl WorkerPaths {
    pub fn new(worker: &str, trigger_root: &Path, pipe_dir: &Path, heartbeat_dir: &Path) -> Self {
        Self {
            worker: worker.to_string(),
            trigger_dir: trigger_root.join(worker),
            control_pipe: pipe_dir.join(format!("{worker}{CONTROL_PIPE_SUFFIX}")),
            status_pipe: pipe_dir.join(format!("{worker}{STATUS_PIPE_SUFFIX}")),
            heartbeat_file: heartbeat_dir.join(format!("{worker}{HEARTBEAT_FILE_SUFFIX}")),
        }
    }

    pub fn from_config(config: &Config, worker: &str) -> Self {
        Self::new(
            worker,
            &config.trigger_dir,
            &config.pipe_dir,
            &config.heartbeat_dir,
        )
    }
}

/// Returns `true` if `name` can be used as a single path component: non-empty,
/// no separators, no leading dot (which also rules out `.` and `..`).
pub fn is_safe_component(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

/// Writes `contents` to a hidden temporary sibling of `path` and renames it over
/// `path`, so readers only ever see the old or the new file in full.
pub fn write_atomically(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = hidden_sibling(path, "tmp");

    let result = (|| {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

/// `.{name}.{pid}.{seq}.{extension}` next to `path`; unique within this host.
fn hidden_sibling(path: &Path, extension: &str) -> PathBuf {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    dir.join(format!(".{name}.{}.{seq}.{extension}", std::process::id()))
}

/// Hidden name a trigger at `path` is renamed to while it is being dispatched.
pub fn claim_path(path: &Path) -> PathBuf {
    hidden_sibling(path, CLAIMED_EXTENSION)
}

/// Inverse of [`claim_path`]: the visible path a claimed file came from.
pub fn claimed_original(claimed: &Path) -> Option<PathBuf> {
    let file_name = claimed.file_name()?.to_str()?;
    let stem = file_name
        .strip_prefix('.')?
        .strip_suffix(CLAIMED_EXTENSION)?
        .strip_suffix('.')?;
    let mut parts = stem.rsplitn(3, '.');
    let seq = parts.next()?;
    let pid = parts.next()?;
    let name = parts.next()?;
    let numeric = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !numeric(seq) || !numeric(pid) || !is_safe_component(name) {
        return None;
    }
    Some(claimed.parent()?.join(name))
}
