/// Activation wrapper: keeps the worker process suspended until something is
/// ready for it, then starts it and waits for it to exit.
///
/// Wake sources, highest priority first: a message on the broker channel, a
/// filesystem notification for a new trigger file, and the polling timer
/// (which only wakes the worker if a trigger is actually pending). The wrapper
/// never reads or removes triggers; that is the worker's (or the watcher's) job.
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::Instant;

use crate::broker::{Broker, Subscription};
use crate::config::{Config, Tunables};
use crate::error::{BrokerError, ConfigError};
use crate::observer::{ObservationPreference, Strategy, Wake};
use crate::trigger::TriggerChannel;

/// Why the worker was started; exported to it as `BEACON_WAKE_REASON`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// Triggers were already pending when the wrapper started.
    Startup,
    Broker,
    Filesystem,
    Poll,
}

impl WakeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            WakeReason::Startup => "startup",
            WakeReason::Broker => "broker",
            WakeReason::Filesystem => "filesystem",
            WakeReason::Poll => "poll",
        }
    }
}

enum Input {
    Broker(Result<String, BrokerError>),
    Fs(Wake),
    Exited(std::io::Result<ExitStatus>),
}

pub struct Wrapper {
    worker: String,
    trigger_dir: PathBuf,
    command: Vec<String>,
    broker: Option<Broker>,
    tunables: Arc<RwLock<Tunables>>,
    shutdown_grace: Duration,
}

impl Wrapper {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let worker = config.worker_name()?.to_string();
        let broker = config.broker_url.as_deref().and_then(|url| {
            match Broker::new(url, &config.effective_broker_channel(&worker), config.pipe_timeout()) {
                Ok(broker) => Some(broker),
                Err(e) => {
                    tracing::warn!(worker = %worker, error = %e, "ignoring broker; waking on filesystem only");
                    None
                }
            }
        });
        Ok(Self {
            trigger_dir: config.trigger_dir.join(&worker),
            worker,
            command: config.worker_command.clone(),
            broker,
            tunables: Arc::new(RwLock::new(config.tunables())),
            shutdown_grace: config.shutdown_grace(),
        })
    }

    pub async fn run(self, stop: Arc<watch::Sender<bool>>) -> Result<()> {
        let channel = TriggerChannel::new(&self.trigger_dir);
        channel
            .ensure_dir()
            .context("Failed to create trigger directory")?;
        let (mut strategy, _) = Strategy::select(channel.dir(), ObservationPreference::NotifyWithFallback);
        let mut stop_rx = stop.subscribe();

        let mut subscription: Option<mpsc::Receiver<Result<String, BrokerError>>> = None;
        let mut next_subscribe = Instant::now();
        let mut running: Option<Child> = None;
        // Wakes that arrive while the worker runs collapse into this one slot.
        let mut follow_up = channel.has_pending().then_some(WakeReason::Startup);

        tracing::info!(
            worker = %self.worker,
            observer = ?strategy.kind(),
            broker = self.broker.as_ref().map(Broker::channel),
            "activation wrapper started"
        );

        loop {
            if running.is_none() {
                if let Some(reason) = follow_up.take() {
                    running = self.start_worker(reason);
                }
            }

            if let (None, Some(broker)) = (&subscription, &self.broker) {
                if Instant::now() >= next_subscribe {
                    match broker.subscribe().await {
                        Ok(sub) => {
                            tracing::info!(channel = broker.channel(), "subscribed to broker");
                            subscription = Some(forward_messages(sub));
                        }
                        Err(e) => {
                            tracing::warn!(channel = broker.channel(), error = %e, "broker subscribe failed; retrying later");
                            next_subscribe = Instant::now() + self.resubscribe_delay().await;
                        }
                    }
                }
            }

            let input = tokio::select! {
                biased;
                msg = next_message(&mut subscription) => Input::Broker(msg),
                wake = strategy.wait(&mut stop_rx, &self.tunables) => Input::Fs(wake),
                status = wait_child(&mut running) => Input::Exited(status),
            };

            let reason = match input {
                Input::Broker(Ok(payload)) => {
                    tracing::debug!(payload = %payload, "broker wake");
                    Some(WakeReason::Broker)
                }
                Input::Broker(Err(e)) => {
                    tracing::warn!(error = %e, "broker subscription lost");
                    subscription = None;
                    next_subscribe = Instant::now() + self.resubscribe_delay().await;
                    None
                }
                Input::Fs(Wake::Stopped) => break,
                Input::Fs(Wake::Changed) => Some(WakeReason::Filesystem),
                Input::Fs(Wake::Tick) => channel.has_pending().then_some(WakeReason::Poll),
                Input::Exited(status) => {
                    running = None;
                    match status {
                        Ok(status) if status.success() => tracing::info!(worker = %self.worker, "worker finished"),
                        Ok(status) => tracing::warn!(worker = %self.worker, %status, "worker exited unsuccessfully"),
                        Err(e) => tracing::error!(worker = %self.worker, error = %e, "cannot wait for worker"),
                    }
                    None
                }
            };
            if let Some(reason) = reason {
                follow_up.get_or_insert(reason);
            }
        }

        if let Some(child) = running.take() {
            self.stop_worker(child).await;
        }
        tracing::info!(worker = %self.worker, "activation wrapper stopped");
        Ok(())
    }

    async fn resubscribe_delay(&self) -> Duration {
        self.tunables.read().await.heartbeat_interval
    }

    /// Hands control to the worker. Without a configured command the wake is only logged.
    fn start_worker(&self, reason: WakeReason) -> Option<Child> {
        let Some((program, args)) = self.command.split_first() else {
            tracing::info!(worker = %self.worker, reason = reason.as_str(), "wake (no worker command configured)");
            return None;
        };
        let spawned = Command::new(program)
            .args(args)
            .env("BEACON_WORKER", &self.worker)
            .env("BEACON_WAKE_REASON", reason.as_str())
            .kill_on_drop(true)
            .spawn();
        match spawned {
            Ok(child) => {
                tracing::info!(worker = %self.worker, reason = reason.as_str(), pid = child.id(), "worker started");
                Some(child)
            }
            Err(e) => {
                tracing::error!(worker = %self.worker, program = %program, error = %e, "failed to start worker");
                None
            }
        }
    }

    /// Gives a running worker the grace period to finish, then kills it.
    async fn stop_worker(&self, mut child: Child) {
        match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                tracing::warn!(worker = %self.worker, grace = ?self.shutdown_grace, "worker still running; killing");
                if let Err(e) = child.kill().await {
                    tracing::error!(error = %e, "failed to kill worker");
                }
            }
        }
    }
}

/// Reads `sub` on its own task. The returned receiver is cancel-safe, unlike a
/// frame read that the wake loop's `select!` could drop halfway.
fn forward_messages(mut sub: Subscription) -> mpsc::Receiver<Result<String, BrokerError>> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                message = sub.next_message() => message,
                _ = tx.closed() => return,
            };
            let failed = message.is_err();
            if tx.send(message).await.is_err() || failed {
                return;
            }
        }
    });
    rx
}

async fn next_message(
    subscription: &mut Option<mpsc::Receiver<Result<String, BrokerError>>>,
) -> Result<String, BrokerError> {
    match subscription {
        Some(rx) => match rx.recv().await {
            Some(message) => message,
            None => Err(BrokerError::Protocol("subscription closed".to_string())),
        },
        None => std::future::pending().await,
    }
}

async fn wait_child(child: &mut Option<Child>) -> std::io::Result<ExitStatus> {
    match child {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}
