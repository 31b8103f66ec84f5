/// Control/status named pipe pair.
///
/// Commands arrive one per line on `{worker}-control`; replies (and proactive
/// event notices) leave one JSON object per line on `{worker}-status`. Each
/// direction has exactly one reader and one writer.
///
/// Every open is non-blocking with bounded, exponentially backed-off retries,
/// so a missing counterpart produces a timeout instead of a stalled daemon.
use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::fmt;
use std::io::ErrorKind;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time::Instant;

use crate::config::Tunables;
use crate::error::{ConfigError, PipeError};
use crate::event::WatcherEvent;
use crate::state::{StatsSnapshot, WatcherState};

/// First retry delay when a pipe counterpart is missing; doubles up to the cap.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(25);

// ── Protocol ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Status,
    Reload,
    Shutdown,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Status => "status",
            Verb::Reload => "reload",
            Verb::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Verb {
    type Err = PipeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "status" => Ok(Verb::Status),
            "reload" => Ok(Verb::Reload),
            "shutdown" => Ok(Verb::Shutdown),
            _ => Err(PipeError::InvalidCommand(s.to_string())),
        }
    }
}

/// `{verb, args}` sent over the control pipe.
///
/// Wire form is either plain text (`reload poll_interval_ms=200`) or a JSON
/// object (`{"verb":"reload","args":["poll_interval_ms=200"]}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlCommand {
    pub verb: Verb,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ControlCommand {
    #[cfg(test)]
    pub fn new(verb: Verb) -> Self {
        Self {
            verb,
            args: Vec::new(),
        }
    }

    pub fn with_args(verb: Verb, args: Vec<String>) -> Self {
        Self { verb, args }
    }

    pub fn parse(line: &str) -> Result<Self, PipeError> {
        let line = line.trim();
        if line.starts_with('{') {
            return serde_json::from_str(line)
                .map_err(|_| PipeError::InvalidCommand(line.to_string()));
        }
        let mut words = line.split_whitespace();
        let verb = words
            .next()
            .ok_or_else(|| PipeError::InvalidCommand(line.to_string()))?
            .parse()?;
        Ok(Self {
            verb,
            args: words.map(str::to_string).collect(),
        })
    }

    /// Newline-terminated plain-text form.
    pub fn to_line(&self) -> String {
        let mut line = self.verb.as_str().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line.push('\n');
        line
    }

    /// `key=value` pairs from the arguments; bare words are ignored.
    pub fn key_values(&self) -> impl Iterator<Item = (&str, &str)> {
        self.args.iter().filter_map(|a| a.split_once('='))
    }
}

/// `{ok, detail, stats}` sent over the status pipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReply {
    pub ok: bool,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<StatsSnapshot>,
    /// Set on replies; absent on proactive event notices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Verb>,
    /// Name of the notable event for proactive notices (`trigger`, `stopping`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

impl StatusReply {
    pub fn reply(verb: Verb, ok: bool, detail: impl Into<String>, stats: Option<StatsSnapshot>) -> Self {
        Self {
            ok,
            detail: detail.into(),
            stats,
            reply_to: Some(verb),
            event: None,
        }
    }

    /// Reply to a line that could not be parsed as a command.
    pub fn rejected(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: detail.into(),
            stats: None,
            reply_to: None,
            event: Some("rejected".to_string()),
        }
    }

    pub fn event(name: &str, detail: impl Into<String>, stats: Option<StatsSnapshot>) -> Self {
        Self {
            ok: true,
            detail: detail.into(),
            stats,
            reply_to: None,
            event: Some(name.to_string()),
        }
    }

    pub fn parse(line: &str) -> Result<Self, PipeError> {
        serde_json::from_str(line.trim()).map_err(|e| PipeError::MalformedReply(e.to_string()))
    }

    /// Newline-terminated JSON form.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| {
            format!("{{\"ok\":{},\"detail\":\"unserializable reply\"}}", self.ok)
        });
        line.push('\n');
        line
    }
}

// ── FIFO primitives ────────────────────────────────────────────────────────────

/// Creates a named pipe at `path` (mode 0600) unless one is already there.
pub fn ensure_fifo(path: &Path) -> Result<(), ConfigError> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => return Ok(()),
        Ok(_) => return Err(ConfigError::NotAFifo(path.to_path_buf())),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(ConfigError::Io(e)),
    }

    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|e| ConfigError::CreateFifo {
        path: path.to_path_buf(),
        source: std::io::Error::new(ErrorKind::InvalidInput, e),
    })?;
    // SAFETY: `c_path` is a valid NUL-terminated string that outlives the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        // Lost a creation race; fine as long as the winner made a FIFO.
        if err.kind() == ErrorKind::AlreadyExists {
            return ensure_fifo(path);
        }
        return Err(ConfigError::CreateFifo {
            path: path.to_path_buf(),
            source: err,
        });
    }
    Ok(())
}

/// Opens the read end without waiting for a writer.
///
/// On Linux the FIFO is opened read-write so the reader never sees EOF when
/// the last writer disconnects; elsewhere the caller reopens on EOF.
pub fn open_receiver(path: &Path) -> std::io::Result<pipe::Receiver> {
    let mut options = pipe::OpenOptions::new();
    #[cfg(target_os = "linux")]
    options.read_write(true);
    options.open_receiver(path)
}

/// Device and inode of the file at `path`, used to notice a pipe being replaced.
fn fifo_identity(path: &Path) -> std::io::Result<(u64, u64)> {
    let meta = std::fs::symlink_metadata(path)?;
    Ok((meta.dev(), meta.ino()))
}

fn counterpart_missing(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::ENXIO) || e.kind() == ErrorKind::NotFound
}

/// Opens the write end, retrying with exponential backoff (capped at
/// `max_backoff`) until a reader attaches or `timeout` elapses.
pub async fn open_sender(
    path: &Path,
    timeout: Duration,
    max_backoff: Duration,
) -> Result<pipe::Sender, PipeError> {
    let started = Instant::now();
    let mut delay = INITIAL_BACKOFF.min(max_backoff);
    loop {
        match pipe::OpenOptions::new().open_sender(path) {
            Ok(sender) => return Ok(sender),
            Err(e) if counterpart_missing(&e) => {}
            Err(e) => return Err(PipeError::Io(e)),
        }
        let elapsed = started.elapsed();
        if elapsed >= timeout {
            return Err(PipeError::Timeout {
                path: path.to_path_buf(),
                waited: elapsed,
            });
        }
        tokio::time::sleep(delay.min(timeout - elapsed)).await;
        delay = (delay * 2).min(max_backoff);
    }
}

/// One non-blocking open attempt; `Ok(None)` when nobody is reading.
pub fn try_open_sender(path: &Path) -> Result<Option<pipe::Sender>, PipeError> {
    match pipe::OpenOptions::new().open_sender(path) {
        Ok(sender) => Ok(Some(sender)),
        Err(e) if counterpart_missing(&e) => Ok(None),
        Err(e) => Err(PipeError::Io(e)),
    }
}

async fn write_line(
    sender: &mut pipe::Sender,
    path: &Path,
    line: &str,
    timeout: Duration,
) -> Result<(), PipeError> {
    match tokio::time::timeout(timeout, sender.write_all(line.as_bytes())).await {
        Ok(result) => result.map_err(PipeError::Io),
        Err(_) => Err(PipeError::Timeout {
            path: path.to_path_buf(),
            waited: timeout,
        }),
    }
}

/// Writes a proactive event notice if a status reader is attached; dropped otherwise.
pub async fn notify_status(path: &Path, reply: &StatusReply, timeout: Duration) -> Result<bool, PipeError> {
    let Some(mut sender) = try_open_sender(path)? else {
        return Ok(false);
    };
    write_line(&mut sender, path, &reply.to_line(), timeout).await?;
    Ok(true)
}

// ── Client ─────────────────────────────────────────────────────────────────────

/// Sends `command` to a running watcher and waits for its reply.
///
/// Event notices that arrive before the reply are skipped. Fails with
/// [`PipeError::Timeout`] when no watcher is attached or none answers in time.
pub async fn send_command(
    control: &Path,
    status: &Path,
    command: &ControlCommand,
    timeout: Duration,
) -> Result<StatusReply, PipeError> {
    let deadline = Instant::now() + timeout;
    // Attach as status reader first so the reply has somewhere to go.
    let receiver = open_receiver(status)?;
    let mut lines = BufReader::new(receiver).lines();

    let mut sender = open_sender(control, timeout, timeout / 4).await?;
    write_line(&mut sender, control, &command.to_line(), timeout).await?;
    drop(sender);

    loop {
        let line = match tokio::time::timeout_at(deadline, lines.next_line()).await {
            Ok(line) => line?,
            Err(_) => {
                return Err(PipeError::Timeout {
                    path: status.to_path_buf(),
                    waited: timeout,
                })
            }
        };
        let Some(line) = line else {
            return Err(PipeError::Closed);
        };
        if line.trim().is_empty() {
            continue;
        }
        let reply = StatusReply::parse(&line)?;
        if reply.reply_to == Some(command.verb) {
            return Ok(reply);
        }
        tracing::debug!(line = %line.trim(), "skipping status notice while awaiting reply");
    }
}

// ── Daemon-side listener ───────────────────────────────────────────────────────

/// Serves the control pipe for one watcher.
///
/// Reads commands, forwards them to the watcher's event loop and writes the
/// reply to the status pipe. I/O failures restart this listener's own loop;
/// they never reach the rest of the daemon.
pub struct ControlListener {
    control: PathBuf,
    status: PathBuf,
    events: mpsc::Sender<WatcherEvent>,
    state: Arc<WatcherState>,
    tunables: Arc<RwLock<Tunables>>,
}

impl ControlListener {
    pub fn new(
        control: PathBuf,
        status: PathBuf,
        events: mpsc::Sender<WatcherEvent>,
        state: Arc<WatcherState>,
        tunables: Arc<RwLock<Tunables>>,
    ) -> Self {
        Self {
            control,
            status,
            events,
            state,
            tunables,
        }
    }

    pub async fn run(&self, mut stop_rx: watch::Receiver<bool>) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if *stop_rx.borrow() {
                break;
            }
            match self.serve(&mut stop_rx).await {
                Ok(()) => break,
                Err(e) => {
                    let cap = self.tunables.read().await.heartbeat_interval;
                    tracing::warn!(error = %e, retry_in = ?backoff, "control listener failed; restarting");
                    self.state.set_error(format!("control listener: {e}"));
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = stop_rx.changed() => break,
                    }
                    backoff = (backoff * 2).min(cap);
                }
            }
        }
    }

    /// Returns `Ok(())` only when asked to stop.
    ///
    /// Recreates either pipe if it is missing. A control pipe removed or
    /// replaced while attached fails with [`PipeError::Vanished`] so `run`
    /// attaches to the new one.
    async fn serve(&self, stop_rx: &mut watch::Receiver<bool>) -> Result<(), PipeError> {
        ensure_fifo(&self.control)?;
        ensure_fifo(&self.status)?;
        let receiver = open_receiver(&self.control)?;
        let attached = fifo_identity(&self.control)?;
        let mut lines = BufReader::new(receiver).lines();
        tracing::debug!(pipe = %self.control.display(), "control listener attached");

        loop {
            // Bounded wait: wake periodically even if nothing arrives.
            let idle = self.tunables.read().await.heartbeat_interval;
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = tokio::time::sleep(idle) => {
                    // An unlinked FIFO opened read-write never reports EOF.
                    if fifo_identity(&self.control).ok() != Some(attached) {
                        return Err(PipeError::Vanished(self.control.clone()));
                    }
                    ensure_fifo(&self.status)?;
                    continue;
                }
                _ = stop_rx.changed() => return Ok(()),
            };
            let Some(line) = line else {
                return Err(PipeError::Closed);
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            self.state.record_command();
            let reply = match ControlCommand::parse(line) {
                Ok(command) => {
                    tracing::info!(verb = %command.verb, args = ?command.args, "control command received");
                    self.dispatch(command).await
                }
                Err(e) => {
                    tracing::warn!(line, error = %e, "discarding invalid control command");
                    StatusReply::rejected(e.to_string())
                }
            };

            if let Err(e) = self.send_reply(&reply).await {
                tracing::warn!(error = %e, "failed to deliver status reply");
            }
        }
    }

    async fn dispatch(&self, command: ControlCommand) -> StatusReply {
        let verb = command.verb;
        let timeout = self.tunables.read().await.pipe_timeout;
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .events
            .send(WatcherEvent::Control {
                command,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return StatusReply::reply(verb, false, "watcher is shutting down", None);
        }
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => StatusReply::reply(verb, false, "watcher is shutting down", None),
            Err(_) => StatusReply::reply(verb, false, "watcher did not answer in time", None),
        }
    }

    async fn send_reply(&self, reply: &StatusReply) -> Result<(), PipeError> {
        let (timeout, cap) = {
            let t = self.tunables.read().await;
            (t.pipe_timeout, t.heartbeat_interval)
        };
        ensure_fifo(&self.status)?;
        let mut sender = open_sender(&self.status, timeout, cap).await?;
        write_line(&mut sender, &self.status, &reply.to_line(), timeout).await
    }
}
