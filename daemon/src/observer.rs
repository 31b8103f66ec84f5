//! Trigger observation.
//!
//! One [`TriggerSource`] hands out pending triggers regardless of how the
//! directory is watched. The wake-up mechanism is a [`Strategy`] picked at
//! construction: kernel filesystem notification, or fixed-interval polling.
//! Both strategies share the same scan/dispatch path, so they differ only in
//! latency.
use notify::event::{ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};

use crate::config::Tunables;
use crate::state::{ObserverKind, WatcherState};
use crate::trigger::{is_trigger_file, PendingTrigger, TriggerChannel};

/// With notification active, rescan this often anyway in case an event was dropped.
pub const NOTIFY_SAFETY_RESCAN: Duration = Duration::from_secs(5);

/// What the mode selector asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationPreference {
    Polling,
    /// Filesystem notification, falling back to polling when unavailable.
    NotifyWithFallback,
}

/// Why [`Strategy::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The kernel reported a trigger file appearing.
    Changed,
    /// The polling interval or the safety rescan elapsed.
    Tick,
    Stopped,
}

/// Kernel notification on a single directory. Coalesces bursts into one wake.
pub struct NotifyStrategy {
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<()>,
}

impl NotifyStrategy {
    pub fn start(dir: &Path) -> notify::Result<Self> {
        let (tx, rx) = mpsc::channel::<()>(1);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                let relevant = match res {
                    Ok(event) => announces_trigger(&event),
                    // Errors (e.g. queue overflow) may hide events; rescan to be safe.
                    Err(_) => true,
                };
                if relevant {
                    let _ = tx.try_send(());
                }
            },
            NotifyConfig::default(),
        )?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        Ok(Self {
            _watcher: watcher,
            rx,
        })
    }
}

/// `true` for events that can make a trigger file appear. Renames count only
/// by their destination, so claiming a trigger is not mistaken for a new one.
fn announces_trigger(event: &notify::Event) -> bool {
    match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => false,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.last().is_some_and(|p| is_trigger_file(p))
        }
        EventKind::Create(_) | EventKind::Modify(_) => event.paths.iter().any(|p| is_trigger_file(p)),
        _ => false,
    }
}

/// How a directory is watched for new entries.
pub enum Strategy {
    Notify(NotifyStrategy),
    Polling,
}

impl Strategy {
    /// Builds the strategy for `preference`. A notification failure falls back
    /// to polling and returns the reason alongside.
    pub fn select(dir: &Path, preference: ObservationPreference) -> (Self, Option<String>) {
        match preference {
            ObservationPreference::Polling => (Strategy::Polling, None),
            ObservationPreference::NotifyWithFallback => match NotifyStrategy::start(dir) {
                Ok(n) => (Strategy::Notify(n), None),
                Err(e) => {
                    let reason = format!("filesystem notification unavailable ({e}); polling");
                    tracing::warn!(dir = %dir.display(), error = %e, "falling back to polling");
                    (Strategy::Polling, Some(reason))
                }
            },
        }
    }

    pub fn kind(&self) -> ObserverKind {
        match self {
            Strategy::Notify(_) => ObserverKind::Notify,
            Strategy::Polling => ObserverKind::Polling,
        }
    }

    /// Sleeps until the directory may have changed or `stop_rx` flips.
    pub async fn wait(
        &mut self,
        stop_rx: &mut watch::Receiver<bool>,
        tunables: &RwLock<Tunables>,
    ) -> Wake {
        if *stop_rx.borrow() {
            return Wake::Stopped;
        }
        match self {
            Strategy::Notify(n) => tokio::select! {
                _ = n.rx.recv() => Wake::Changed,
                _ = tokio::time::sleep(NOTIFY_SAFETY_RESCAN) => Wake::Tick,
                _ = stop_rx.changed() => Wake::Stopped,
            },
            Strategy::Polling => {
                // Re-read each cycle so `reload` changes the interval in place.
                let interval = tunables.read().await.poll_interval;
                tokio::select! {
                    _ = tokio::time::sleep(interval) => Wake::Tick,
                    _ = stop_rx.changed() => Wake::Stopped,
                }
            }
        }
    }
}

/// Yields pending triggers one at a time, in best-effort creation order.
pub struct TriggerSource {
    channel: TriggerChannel,
    strategy: Strategy,
    queue: VecDeque<PathBuf>,
    tunables: Arc<RwLock<Tunables>>,
    state: Arc<WatcherState>,
    fallback_reason: Option<String>,
}

impl TriggerSource {
    pub fn new(
        channel: TriggerChannel,
        preference: ObservationPreference,
        tunables: Arc<RwLock<Tunables>>,
        state: Arc<WatcherState>,
    ) -> Self {
        let (strategy, fallback_reason) = Strategy::select(channel.dir(), preference);
        state.set_observer(strategy.kind());
        if let Some(reason) = &fallback_reason {
            state.set_degraded(reason.clone());
        }
        Self {
            channel,
            strategy,
            queue: VecDeque::new(),
            tunables,
            state,
            fallback_reason,
        }
    }

    pub fn kind(&self) -> ObserverKind {
        self.strategy.kind()
    }

    pub fn channel_mut(&mut self) -> &mut TriggerChannel {
        &mut self.channel
    }

    /// Next pending trigger, or `None` once `stop_rx` flips.
    pub async fn observe(&mut self, stop_rx: &mut watch::Receiver<bool>) -> Option<PendingTrigger> {
        loop {
            if *stop_rx.borrow() {
                return None;
            }
            while let Some(path) = self.queue.pop_front() {
                match self.channel.claim(&path) {
                    Ok(Some(pending)) => return Some(pending),
                    // Vanished since the scan.
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(path = %path.display(), error = %e, "cannot claim trigger; quarantined");
                        self.state.set_error(e.to_string());
                        self.state.set_quarantined(self.channel.quarantined_count());
                    }
                }
            }
            self.refill();
            if !self.queue.is_empty() {
                continue;
            }
            if self.strategy.wait(stop_rx, &self.tunables).await == Wake::Stopped {
                return None;
            }
        }
    }

    fn refill(&mut self) {
        match self.channel.scan() {
            Ok(paths) => {
                self.queue.extend(paths);
                match &self.fallback_reason {
                    Some(reason) => self.state.set_degraded(reason.clone()),
                    None => self.state.clear_degraded(),
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot scan trigger directory");
                self.state.set_degraded(format!("trigger directory unreadable: {e}"));
                self.state.set_error(e.to_string());
            }
        }
    }
}
