/// Watcher daemon: the single process per worker that drains the trigger
/// channel, serves the control/status pipe pair and keeps the heartbeat fresh.
///
/// Each duty runs as its own task so that none can stall another. They share
/// only [`WatcherState`], the runtime [`Tunables`] and one stop flag; the
/// flag is flipped by a termination signal or by the `shutdown` command, and
/// every task checks it at its next wake point.
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;

use crate::broker::Broker;
use crate::config::{self, Config, Mode, TunableOverrides, Tunables, MAX_HEARTBEAT_INTERVAL_SECS};
use crate::error::{ConfigError, TriggerError};
use crate::event::WatcherEvent;
use crate::heartbeat::{HeartbeatEmitter, RunState};
use crate::observer::{ObservationPreference, TriggerSource};
use crate::paths::WorkerPaths;
use crate::pipe::{self, ControlCommand, ControlListener, StatusReply, Verb};
use crate::state::WatcherState;
use crate::trigger::{PendingTrigger, TriggerChannel, TriggerRecord};

/// A configured, not yet running, watcher for one worker.
pub struct Watcher {
    worker: String,
    paths: WorkerPaths,
    mode: Mode,
    preference: ObservationPreference,
    config_path: Option<PathBuf>,
    watch_config: bool,
    shutdown_grace: Duration,
    broker: Option<Broker>,
    state: Arc<WatcherState>,
    tunables: Arc<RwLock<Tunables>>,
    pinned: TunableOverrides,
}

impl Watcher {
    /// `config_path` is the file `reload` re-reads; `None` means overrides only.
    pub fn new(
        config: &Config,
        config_path: Option<PathBuf>,
        preference: ObservationPreference,
    ) -> Result<Self, ConfigError> {
        let worker = config.worker_name()?.to_string();
        let broker = config.broker_url.as_deref().and_then(|url| {
            match Broker::new(url, &config.effective_broker_channel(&worker), config.pipe_timeout()) {
                Ok(broker) => Some(broker),
                Err(e) => {
                    tracing::warn!(worker = %worker, error = %e, "ignoring broker; continuing without it");
                    None
                }
            }
        });

        Ok(Self {
            paths: WorkerPaths::from_config(config, &worker),
            worker,
            mode: config.mode,
            preference,
            config_path,
            watch_config: config.watch_config,
            shutdown_grace: config.shutdown_grace(),
            broker,
            state: Arc::new(WatcherState::new(config.mode)),
            tunables: Arc::new(RwLock::new(config.tunables())),
            pinned: config.pinned,
        })
    }

    /// Runs until `stop` flips to `true`, then shuts down gracefully.
    ///
    /// Errors are returned only for startup failures (pipe pair or trigger
    /// directory cannot be created).
    pub async fn run(self, stop: Arc<watch::Sender<bool>>) -> Result<()> {
        // ── Startup ───────────────────────────────────────────────────────────
        pipe::ensure_fifo(&self.paths.control_pipe)?;
        pipe::ensure_fifo(&self.paths.status_pipe)?;
        let mut channel = TriggerChannel::new(&self.paths.trigger_dir);
        channel
            .ensure_dir()
            .context("Failed to create trigger directory")?;
        match channel.recover_claimed() {
            Ok(0) => {}
            Ok(restored) => tracing::info!(restored, "restored triggers claimed by a previous instance"),
            Err(e) => tracing::warn!(error = %e, "cannot look for previously claimed triggers"),
        }

        let (event_tx, mut event_rx) = mpsc::channel::<WatcherEvent>(32);
        let mut handles: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        // ── Trigger observer ──────────────────────────────────────────────────
        let mut source = TriggerSource::new(
            channel,
            self.preference,
            Arc::clone(&self.tunables),
            Arc::clone(&self.state),
        );
        let observer_kind = source.kind();
        {
            let dispatcher = Dispatcher {
                worker: self.worker.clone(),
                status_pipe: self.paths.status_pipe.clone(),
                broker: self.broker.clone(),
                state: Arc::clone(&self.state),
                tunables: Arc::clone(&self.tunables),
            };
            let mut stop_rx = stop.subscribe();
            handles.push(spawn_task(&self.state, "observer", async move {
                // A dispatch in progress is never interrupted; the stop flag is
                // only checked between triggers.
                while let Some(pending) = source.observe(&mut stop_rx).await {
                    dispatcher.dispatch(source.channel_mut(), pending).await;
                }
            }));
        }

        // ── Heartbeat ─────────────────────────────────────────────────────────
        let heartbeat = Arc::new(HeartbeatEmitter::new(
            self.paths.heartbeat_file.clone(),
            &self.worker,
            Arc::clone(&self.state),
            Arc::clone(&self.tunables),
        ));
        {
            let heartbeat = Arc::clone(&heartbeat);
            let stop_rx = stop.subscribe();
            handles.push(spawn_task(&self.state, "heartbeat", async move {
                heartbeat.run(stop_rx).await;
            }));
        }

        // ── Control listener ──────────────────────────────────────────────────
        {
            let listener = ControlListener::new(
                self.paths.control_pipe.clone(),
                self.paths.status_pipe.clone(),
                event_tx.clone(),
                Arc::clone(&self.state),
                Arc::clone(&self.tunables),
            );
            let stop_rx = stop.subscribe();
            handles.push(spawn_task(&self.state, "control", async move {
                listener.run(stop_rx).await;
            }));
        }

        // ── Config file watcher ───────────────────────────────────────────────
        if let (true, Some(path)) = (self.watch_config, self.config_path.clone()) {
            let tx = event_tx.clone();
            let stop_rx = stop.subscribe();
            handles.push(spawn_task(&self.state, "config", async move {
                config::watch_config(path, tx, stop_rx).await;
            }));
        }
        drop(event_tx);

        tracing::info!(
            worker = %self.worker,
            mode = %self.mode,
            observer = ?observer_kind,
            trigger_dir = %self.paths.trigger_dir.display(),
            "watcher started"
        );

        // ── Event loop ────────────────────────────────────────────────────────
        let mut stop_rx = stop.subscribe();
        while !*stop_rx.borrow() {
            let event = tokio::select! {
                event = event_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = stop_rx.changed() => break,
            };

            match event {
                WatcherEvent::Control { command, reply } => {
                    let (response, stop_after) = self.handle_command(&command, &heartbeat).await;
                    let _ = reply.send(response);
                    if stop_after {
                        stop.send_replace(true);
                        break;
                    }
                }
                WatcherEvent::ConfigChanged => match self.reload(None).await {
                    Ok(t) => tracing::info!(tunables = ?t, "config file change applied"),
                    Err(e) => tracing::warn!(error = %e, "config file change rejected"),
                },
            }
        }
        // Commands still queued get "shutting down" instead of a late answer.
        drop(event_rx);

        self.shutdown(&stop, handles, &heartbeat).await;
        Ok(())
    }

    async fn handle_command(
        &self,
        command: &ControlCommand,
        heartbeat: &HeartbeatEmitter,
    ) -> (StatusReply, bool) {
        match command.verb {
            Verb::Status => (
                StatusReply::reply(Verb::Status, true, "running", Some(self.state.snapshot())),
                false,
            ),
            Verb::Reload => match self.reload(Some(command)).await {
                Ok(t) => {
                    // Publish the new interval right away instead of after the old one.
                    heartbeat.emit(RunState::Running).await;
                    let detail = format!(
                        "reloaded: poll_interval_ms={} heartbeat_interval_secs={} pipe_timeout_ms={}",
                        t.poll_interval.as_millis(),
                        t.heartbeat_interval.as_secs(),
                        t.pipe_timeout.as_millis()
                    );
                    (
                        StatusReply::reply(Verb::Reload, true, detail, Some(self.state.snapshot())),
                        false,
                    )
                }
                Err(e) => {
                    tracing::warn!(error = %e, "reload rejected");
                    (StatusReply::reply(Verb::Reload, false, e, None), false)
                }
            },
            Verb::Shutdown => {
                tracing::info!(worker = %self.worker, "shutdown requested over control pipe");
                (
                    StatusReply::reply(Verb::Shutdown, true, "stopping", Some(self.state.snapshot())),
                    true,
                )
            }
        }
    }

    /// Re-reads the config file (if any), applies `command`'s overrides and
    /// swaps in the new tunables.
    async fn reload(&self, command: Option<&ControlCommand>) -> Result<Tunables, String> {
        let file = match &self.config_path {
            Some(path) if path.exists() => {
                Some(config::load_for_reload(path).map_err(|e| format!("{e:#}"))?)
            }
            _ => None,
        };
        if let Some((file, _)) = &file {
            if file.mode != self.mode {
                tracing::warn!(
                    running = %self.mode,
                    configured = %file.mode,
                    "mode change requires restart; ignoring"
                );
            }
        }

        let mut tunables = self.tunables.write().await;
        let overrides = command.into_iter().flat_map(|c| c.key_values());
        let next = resolve_reload(*tunables, file.as_ref().map(|(_, t)| t), &self.pinned, overrides)?;
        *tunables = next;
        tracing::info!(worker = %self.worker, tunables = ?next, "configuration reloaded");
        Ok(next)
    }

    /// Stops every task, waits up to the grace period, then writes the terminal heartbeat.
    async fn shutdown(
        &self,
        stop: &watch::Sender<bool>,
        handles: Vec<(&'static str, JoinHandle<()>)>,
        heartbeat: &HeartbeatEmitter,
    ) {
        stop.send_replace(true);
        tracing::info!(worker = %self.worker, grace = ?self.shutdown_grace, "watcher stopping");

        let timeout = self.tunables.read().await.pipe_timeout;
        let notice = StatusReply::event("stopping", "watcher is shutting down", Some(self.state.snapshot()));
        if let Err(e) = pipe::notify_status(&self.paths.status_pipe, &notice, timeout).await {
            tracing::debug!(error = %e, "stopping notice not delivered");
        }

        let deadline = tokio::time::Instant::now() + self.shutdown_grace;
        for (name, mut handle) in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                tracing::warn!(task = name, "task did not stop within the grace period; aborting");
                handle.abort();
                self.state.task_stopped(name);
            }
        }

        heartbeat.emit(RunState::Stopped).await;
        tracing::info!(
            worker = %self.worker,
            processed = self.state.processed(),
            "watcher stopped"
        );
    }
}

/// Computes the tunables after a reload.
///
/// Starting from `current`, the keys the file sets apply first, then the
/// environment and command-line values pinned at startup, then the command's
/// `key=value` overrides. Unknown keys and out-of-range values are rejected
/// and leave the current tunables untouched.
pub fn resolve_reload<'a>(
    current: Tunables,
    file: Option<&TunableOverrides>,
    pinned: &TunableOverrides,
    overrides: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Result<Tunables, String> {
    let mut next = file.map_or(current, |file| file.apply(current));
    next = pinned.apply(next);
    for (key, raw) in overrides {
        let value: u64 = raw
            .trim()
            .parse()
            .map_err(|_| format!("{key}: '{raw}' is not a number"))?;
        match key {
            "poll_interval_ms" => next.poll_interval = Duration::from_millis(value),
            "heartbeat_interval_secs" => next.heartbeat_interval = Duration::from_secs(value),
            "pipe_timeout_ms" => next.pipe_timeout = Duration::from_millis(value),
            _ => return Err(format!("{key} cannot be changed at runtime")),
        }
    }

    let non_zero = [
        ("poll_interval_ms", next.poll_interval),
        ("heartbeat_interval_secs", next.heartbeat_interval),
        ("pipe_timeout_ms", next.pipe_timeout),
    ];
    for (key, value) in non_zero {
        if value.is_zero() {
            return Err(format!("{key} must be greater than zero"));
        }
    }
    if next.heartbeat_interval > Duration::from_secs(MAX_HEARTBEAT_INTERVAL_SECS) {
        return Err(format!(
            "heartbeat_interval_secs must be at most {MAX_HEARTBEAT_INTERVAL_SECS}"
        ));
    }
    Ok(next)
}

fn spawn_task<F>(state: &Arc<WatcherState>, name: &'static str, task: F) -> (&'static str, JoinHandle<()>)
where
    F: Future<Output = ()> + Send + 'static,
{
    state.task_started(name);
    let state = Arc::clone(state);
    let handle = tokio::spawn(async move {
        task.await;
        state.task_stopped(name);
    });
    (name, handle)
}

// ── Dispatch ───────────────────────────────────────────────────────────────────

/// Everything the observer task needs to handle one trigger.
struct Dispatcher {
    worker: String,
    status_pipe: PathBuf,
    broker: Option<Broker>,
    state: Arc<WatcherState>,
    tunables: Arc<RwLock<Tunables>>,
}

impl Dispatcher {
    async fn dispatch(&self, channel: &mut TriggerChannel, pending: PendingTrigger) {
        let PendingTrigger { path, record } = pending;
        let record = match record {
            Ok(record) => record,
            Err(e @ TriggerError::Io { .. }) => {
                tracing::error!(worker = %self.worker, path = %path.display(), error = %e, "cannot read trigger; quarantined");
                channel.quarantine(&path);
                self.state.set_error(e.to_string());
                self.state.set_quarantined(channel.quarantined_count());
                return;
            }
            Err(e) => {
                tracing::warn!(worker = %self.worker, path = %path.display(), error = %e, "discarding malformed trigger");
                self.state.record_malformed();
                self.state.set_error(e.to_string());
                self.delete(channel, &path);
                return;
            }
        };

        tracing::info!(
            worker = %self.worker,
            kind = %record.kind,
            correlation_id = %record.correlation_id,
            age_ms = record.age().num_milliseconds(),
            "trigger received"
        );

        if let Some(broker) = &self.broker {
            self.forward(broker, &record).await;
        }
        self.delete(channel, &path);
        let processed = self.state.record_processed();

        let timeout = self.tunables.read().await.pipe_timeout;
        let notice = StatusReply::event(
            "trigger",
            format!("{}/{}", record.kind, record.correlation_id),
            None,
        );
        match pipe::notify_status(&self.status_pipe, &notice, timeout).await {
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "trigger notice not delivered"),
        }
        tracing::debug!(processed, "trigger dispatched");
    }

    /// Fans the trigger out to the broker. Failure only costs remote wakeup latency.
    async fn forward(&self, broker: &Broker, record: &TriggerRecord) {
        let message = crate::broker::trigger_notice(
            &self.worker,
            &record.kind,
            &record.correlation_id,
            record.created_at,
        );
        match broker.publish(&message).await {
            Ok(receivers) => tracing::debug!(channel = broker.channel(), receivers, "trigger forwarded to broker"),
            Err(e) => tracing::warn!(channel = broker.channel(), error = %e, "broker forward failed"),
        }
    }

    fn delete(&self, channel: &mut TriggerChannel, path: &Path) {
        if let Err(e) = channel.remove(path) {
            tracing::error!(path = %path.display(), error = %e, "cannot delete trigger; quarantined");
            self.state.set_error(format!("cannot delete trigger: {e}"));
        }
        self.state.set_quarantined(channel.quarantined_count());
    }
}
