use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};

use crate::config::{Mode, Tunables};
use crate::paths;
use crate::state::{ObserverKind, WatcherState};

/// A prober treats a heartbeat older than this many intervals as unhealthy.
pub const DEFAULT_STALENESS_FACTOR: u32 = 3;

/// Lifecycle marker carried by every heartbeat.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    /// Terminal marker written once on clean shutdown.
    Stopped,
}

/// Liveness record written to `{heartbeat_dir}/{worker}-watcher.json`.
/// External probers read this file (read-only) to decide whether to restart a worker.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HeartbeatRecord {
    /// Daemon binary version (set from Cargo.toml at compile time).
    pub version: String,
    pub worker_id: String,
    pub process_id: u32,
    pub last_emitted_at: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub triggers_processed_count: u64,
    pub mode: Mode,
    pub state: RunState,
    /// Emission interval at the time of writing, so probers need no config.
    pub heartbeat_interval_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observer: Option<ObserverKind>,
    /// Why the watcher is running degraded (e.g. polling fallback, unreadable directory).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl HeartbeatRecord {
    pub fn from_state(
        worker: &str,
        state: &WatcherState,
        interval: Duration,
        run_state: RunState,
    ) -> Self {
        let snapshot = state.snapshot();
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            worker_id: worker.to_string(),
            process_id: std::process::id(),
            last_emitted_at: Utc::now(),
            uptime_seconds: snapshot.uptime_seconds,
            triggers_processed_count: snapshot.triggers_processed,
            mode: snapshot.mode,
            state: run_state,
            heartbeat_interval_secs: interval.as_secs().max(1),
            observer: snapshot.observer,
            degraded: snapshot.degraded,
            last_error: snapshot.last_error,
        }
    }
}

/// Result of checking a heartbeat against the staleness threshold.
#[derive(Debug, PartialEq)]
pub enum Health {
    Healthy,
    /// Older than `factor × interval`: crashed or stalled.
    Stale { age: chrono::Duration },
    /// The watcher shut down cleanly.
    Stopped,
}

/// Classifies `record` as seen at `now`.
pub fn assess(record: &HeartbeatRecord, now: DateTime<Utc>, factor: u32) -> Health {
    if record.state == RunState::Stopped {
        return Health::Stopped;
    }
    let age = now - record.last_emitted_at;
    // A limit too large to represent is never reached.
    let limit = record
        .heartbeat_interval_secs
        .checked_mul(u64::from(factor))
        .and_then(|secs| i64::try_from(secs).ok())
        .and_then(chrono::Duration::try_seconds);
    match limit {
        Some(limit) if age > limit => Health::Stale { age },
        _ => Health::Healthy,
    }
}

/// Serializes `record` to JSON and atomically replaces the file at `path`.
pub fn write_heartbeat(path: &Path, record: &HeartbeatRecord) -> Result<()> {
    let content = serde_json::to_vec_pretty(record).context("Failed to serialize heartbeat")?;
    paths::write_atomically(path, &content)
        .with_context(|| format!("Failed to write heartbeat file: {}", path.display()))
}

pub fn read_heartbeat(path: &Path) -> Result<HeartbeatRecord> {
    let content = std::fs::read(path)
        .with_context(|| format!("Failed to read heartbeat file: {}", path.display()))?;
    serde_json::from_slice(&content)
        .with_context(|| format!("Failed to parse heartbeat file: {}", path.display()))
}

/// Periodically overwrites the worker's heartbeat file.
pub struct HeartbeatEmitter {
    path: PathBuf,
    worker: String,
    state: Arc<WatcherState>,
    tunables: Arc<RwLock<Tunables>>,
}

impl HeartbeatEmitter {
    pub fn new(
        path: PathBuf,
        worker: &str,
        state: Arc<WatcherState>,
        tunables: Arc<RwLock<Tunables>>,
    ) -> Self {
        Self {
            path,
            worker: worker.to_string(),
            state,
            tunables,
        }
    }

    /// Writes one heartbeat. Failures are logged and recorded, never propagated:
    /// a heartbeat write failure must not take the daemon down.
    pub async fn emit(&self, run_state: RunState) {
        let interval = self.tunables.read().await.heartbeat_interval;
        let record = HeartbeatRecord::from_state(&self.worker, &self.state, interval, run_state);
        if let Err(e) = write_heartbeat(&self.path, &record) {
            tracing::error!(error = %format!("{e:#}"), "heartbeat write failed");
            self.state.set_error(format!("heartbeat write failed: {e:#}"));
        }
    }

    /// Emits immediately, then once per interval until `stop_rx` flips.
    /// The interval is re-read every cycle so `reload` takes effect without a restart.
    pub async fn run(&self, mut stop_rx: watch::Receiver<bool>) {
        loop {
            if *stop_rx.borrow() {
                break;
            }
            self.emit(RunState::Running).await;
            let interval = self.tunables.read().await.heartbeat_interval;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop_rx.changed() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tunables(heartbeat: Duration) -> Arc<RwLock<Tunables>> {
        Arc::new(RwLock::new(Tunables {
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: heartbeat,
            pipe_timeout: Duration::from_secs(1),
        }))
    }

    fn record(state: RunState, emitted: DateTime<Utc>) -> HeartbeatRecord {
        HeartbeatRecord {
            version: "0.0.0".to_string(),
            worker_id: "planner".to_string(),
            process_id: 1,
            last_emitted_at: emitted,
            uptime_seconds: 0,
            triggers_processed_count: 0,
            mode: Mode::Hooks,
            state,
            heartbeat_interval_secs: 10,
            observer: None,
            degraded: None,
            last_error: None,
        }
    }

    // ── HeartbeatRecord ───────────────────────────────────────────────────────

    #[test]
    fn from_state_projects_counters() {
        let state = WatcherState::new(Mode::Polling);
        state.record_processed();
        state.set_observer(ObserverKind::Polling);
        let r = HeartbeatRecord::from_state("coder", &state, Duration::from_secs(10), RunState::Running);
        assert_eq!(r.worker_id, "coder");
        assert_eq!(r.process_id, std::process::id());
        assert_eq!(r.triggers_processed_count, 1);
        assert_eq!(r.mode, Mode::Polling);
        assert_eq!(r.observer, Some(ObserverKind::Polling));
        assert_eq!(r.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn record_serializes_lowercase_state_and_omits_none() {
        let json = serde_json::to_string(&record(RunState::Stopped, Utc::now())).unwrap();
        assert!(json.contains("\"state\":\"stopped\""));
        assert!(json.contains("\"mode\":\"hooks\""));
        assert!(!json.contains("degraded"));
        assert!(!json.contains("last_error"));
    }

    // ── assess ────────────────────────────────────────────────────────────────

    #[test]
    fn assess_fresh_heartbeat_is_healthy() {
        let now = Utc::now();
        let r = record(RunState::Running, now - chrono::Duration::seconds(5));
        assert_eq!(assess(&r, now, DEFAULT_STALENESS_FACTOR), Health::Healthy);
    }

    #[test]
    fn assess_old_heartbeat_is_stale() {
        let now = Utc::now();
        let r = record(RunState::Running, now - chrono::Duration::seconds(31));
        assert!(matches!(
            assess(&r, now, DEFAULT_STALENESS_FACTOR),
            Health::Stale { .. }
        ));
    }

    #[test]
    fn assess_exactly_at_limit_is_healthy() {
        let now = Utc::now();
        let r = record(RunState::Running, now - chrono::Duration::seconds(30));
        assert_eq!(assess(&r, now, DEFAULT_STALENESS_FACTOR), Health::Healthy);
    }

    #[test]
    fn assess_terminal_marker_is_stopped() {
        let now = Utc::now();
        let r = record(RunState::Stopped, now);
        assert_eq!(assess(&r, now, DEFAULT_STALENESS_FACTOR), Health::Stopped);
    }

    #[test]
    fn assess_huge_interval_or_factor_never_goes_stale() {
        let now = Utc::now();
        let mut r = record(RunState::Running, now - chrono::Duration::days(365));
        r.heartbeat_interval_secs = 10_000_000_000_000_000;
        assert_eq!(assess(&r, now, DEFAULT_STALENESS_FACTOR), Health::Healthy);

        r.heartbeat_interval_secs = u64::MAX;
        assert_eq!(assess(&r, now, u32::MAX), Health::Healthy);

        r.heartbeat_interval_secs = 10;
        assert_eq!(assess(&r, now, u32::MAX), Health::Healthy);
    }

    // ── write_heartbeat / read_heartbeat ──────────────────────────────────────

    #[test]
    fn write_then_read_returns_same_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("planner-watcher.json");
        let mut original = record(RunState::Running, Utc::now());
        original.degraded = Some("notify unavailable; polling".to_string());
        write_heartbeat(&path, &original).unwrap();
        assert_eq!(read_heartbeat(&path).unwrap(), original);
    }

    #[test]
    fn read_heartbeat_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_heartbeat(&dir.path().join("absent.json")).is_err());
    }

    #[test]
    fn read_heartbeat_tolerates_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hb.json");
        let mut value = serde_json::to_value(record(RunState::Running, Utc::now())).unwrap();
        value["future_field"] = serde_json::json!(true);
        std::fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();
        assert!(read_heartbeat(&path).is_ok());
    }

    // ── HeartbeatEmitter ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn emit_failure_is_recorded_not_propagated() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(WatcherState::new(Mode::Hooks));
        let emitter = HeartbeatEmitter::new(
            dir.path().join("missing").join("hb.json"),
            "planner",
            Arc::clone(&state),
            tunables(Duration::from_secs(10)),
        );
        emitter.emit(RunState::Running).await;
        assert!(state.snapshot().last_error.is_some());
    }

    #[tokio::test]
    async fn run_emits_immediately_and_stops_on_signal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("planner-watcher.json");
        let state = Arc::new(WatcherState::new(Mode::Hooks));
        let emitter = HeartbeatEmitter::new(
            path.clone(),
            "planner",
            state,
            tunables(Duration::from_secs(3600)),
        );
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move { emitter.run(stop_rx).await });
        for _ in 0..100 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(read_heartbeat(&path).unwrap().state, RunState::Running);

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("emitter must observe the stop flag")
            .unwrap();
    }

    #[tokio::test]
    async fn run_refreshes_within_one_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("planner-watcher.json");
        let state = Arc::new(WatcherState::new(Mode::Polling));
        let emitter = HeartbeatEmitter::new(
            path.clone(),
            "planner",
            state,
            tunables(Duration::from_secs(1)),
        );
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { emitter.run(stop_rx).await });

        tokio::time::sleep(Duration::from_millis(3_000)).await;
        let r = read_heartbeat(&path).unwrap();
        let age = Utc::now() - r.last_emitted_at;
        assert!(age <= chrono::Duration::seconds(1), "heartbeat too old: {age}");
        assert_eq!(assess(&r, Utc::now(), DEFAULT_STALENESS_FACTOR), Health::Healthy);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
