use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::config::Mode;

/// Which trigger-observation strategy is actually running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObserverKind {
    /// Kernel filesystem notification (inotify, FSEvents, ...).
    Notify,
    /// Fixed-interval directory scan.
    Polling,
}

/// In-memory state of one watcher daemon.
///
/// Only the daemon's own tasks mutate it; everybody else sees the
/// [`StatsSnapshot`] projection via the heartbeat file and status replies.
#[derive(Debug)]
pub struct WatcherState {
    mode: Mode,
    started: Instant,
    processed: AtomicU64,
    malformed: AtomicU64,
    commands: AtomicU64,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    observer: Option<ObserverKind>,
    last_error: Option<String>,
    degraded: Option<String>,
    quarantined: u64,
    active_tasks: Vec<&'static str>,
}

/// Serializable projection of [`WatcherState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub mode: Mode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observer: Option<ObserverKind>,
    pub uptime_seconds: u64,
    pub triggers_processed: u64,
    pub triggers_malformed: u64,
    pub triggers_quarantined: u64,
    pub commands_handled: u64,
    #[serde(default)]
    pub active_tasks: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

impl WatcherState {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            started: Instant::now(),
            processed: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            commands: AtomicU64::new(0),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn record_processed(&self) -> u64 {
        self.processed.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_command(&self) {
        self.commands.fetch_add(1, Ordering::SeqCst);
    }

    pub fn set_observer(&self, kind: ObserverKind) {
        self.lock().observer = Some(kind);
    }

    pub fn set_error(&self, error: impl Into<String>) {
        self.lock().last_error = Some(error.into());
    }

    /// Marks the watcher degraded; surfaced in the heartbeat for external probers.
    pub fn set_degraded(&self, reason: impl Into<String>) {
        self.lock().degraded = Some(reason.into());
    }

    pub fn clear_degraded(&self) {
        self.lock().degraded = None;
    }

    pub fn set_quarantined(&self, count: usize) {
        self.lock().quarantined = count as u64;
    }

    pub fn task_started(&self, name: &'static str) {
        let mut inner = self.lock();
        if !inner.active_tasks.contains(&name) {
            inner.active_tasks.push(name);
        }
    }

    pub fn task_stopped(&self, name: &'static str) {
        self.lock().active_tasks.retain(|t| *t != name);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.lock();
        StatsSnapshot {
            mode: self.mode,
            observer: inner.observer,
            uptime_seconds: self.uptime_seconds(),
            triggers_processed: self.processed.load(Ordering::SeqCst),
            triggers_malformed: self.malformed.load(Ordering::SeqCst),
            triggers_quarantined: inner.quarantined,
            commands_handled: self.commands.load(Ordering::SeqCst),
            active_tasks: inner.active_tasks.iter().map(|t| t.to_string()).collect(),
            last_error: inner.last_error.clone(),
            degraded: inner.degraded.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
