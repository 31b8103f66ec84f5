/// Mode selector: maps the configured [`Mode`] to the set of components that
/// run in this process, and owns the process-wide stop flag.
///
/// The mapping is fixed at startup. The only fallback that ever happens at
/// runtime is the watcher's own notify-to-polling switch.
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

use crate::config::{Config, Mode};
use crate::observer::ObservationPreference;
use crate::watcher::Watcher;
use crate::wrapper::Wrapper;

/// Which components a mode runs, and how the watcher observes triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    pub run_daemon: bool,
    pub run_wrapper: bool,
    pub observation: ObservationPreference,
}

impl Topology {
    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::Polling => Topology {
                run_daemon: true,
                run_wrapper: false,
                observation: ObservationPreference::Polling,
            },
            Mode::EventDriven => Topology {
                run_daemon: false,
                run_wrapper: true,
                observation: ObservationPreference::NotifyWithFallback,
            },
            Mode::Hooks => Topology {
                run_daemon: true,
                run_wrapper: false,
                observation: ObservationPreference::NotifyWithFallback,
            },
            Mode::Hybrid => Topology {
                run_daemon: true,
                run_wrapper: true,
                observation: ObservationPreference::NotifyWithFallback,
            },
        }
    }
}

/// Runs the configured topology until SIGINT/SIGTERM or a `shutdown` command.
pub async fn launch(config: Config, config_path: Option<PathBuf>) -> Result<()> {
    let stop = Arc::new(watch::channel(false).0);

    let signals = {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            match wait_for_signal().await {
                Ok(name) => {
                    tracing::info!(signal = name, "termination signal received");
                    stop.send_replace(true);
                }
                Err(e) => tracing::error!(error = %e, "cannot install signal handlers"),
            }
        })
    };

    let result = run_topology(&config, config_path, stop).await;
    signals.abort();
    result
}

/// Starts every component `config.mode` calls for and waits for all of them.
///
/// Construction errors are returned before anything starts. If one component
/// fails while starting, the others are stopped.
pub async fn run_topology(
    config: &Config,
    config_path: Option<PathBuf>,
    stop: Arc<watch::Sender<bool>>,
) -> Result<()> {
    let topology = Topology::for_mode(config.mode);
    let watcher = if topology.run_daemon {
        Some(Watcher::new(config, config_path, topology.observation)?)
    } else {
        None
    };
    let wrapper = if topology.run_wrapper {
        Some(Wrapper::new(config)?)
    } else {
        None
    };
    tracing::info!(
        mode = %config.mode,
        daemon = topology.run_daemon,
        wrapper = topology.run_wrapper,
        "starting"
    );

    let daemon = async {
        let Some(watcher) = watcher else { return Ok(()) };
        let result = watcher.run(Arc::clone(&stop)).await;
        if result.is_err() {
            stop.send_replace(true);
        }
        result
    };
    let activation = async {
        let Some(wrapper) = wrapper else { return Ok(()) };
        let result = wrapper.run(Arc::clone(&stop)).await;
        if result.is_err() {
            stop.send_replace(true);
        }
        result
    };
    let (daemon, activation) = tokio::join!(daemon, activation);
    daemon?;
    activation
}

async fn wait_for_signal() -> std::io::Result<&'static str> {
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            Ok("SIGINT")
        }
        _ = term.recv() => Ok("SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::{read_heartbeat, RunState};
    use crate::paths::WorkerPaths;
    use std::time::Duration;

    fn config(root: &std::path::Path, mode: Mode) -> Config {
        let dir = |name: &str| {
            let d = root.join(name);
            std::fs::create_dir_all(&d).unwrap();
            d
        };
        Config {
            worker: Some("w1".to_string()),
            mode,
            poll_interval_ms: 50,
            shutdown_grace_secs: 1,
            pipe_timeout_ms: 500,
            trigger_dir: dir("triggers"),
            pipe_dir: dir("pipes"),
            heartbeat_dir: dir("heartbeats"),
            ..Config::default()
        }
    }

    // ── Topology::for_mode ────────────────────────────────────────────────────

    #[test]
    fn polling_runs_daemon_only_with_polling() {
        let t = Topology::for_mode(Mode::Polling);
        assert!(t.run_daemon && !t.run_wrapper);
        assert_eq!(t.observation, ObservationPreference::Polling);
    }

    #[test]
    fn event_driven_runs_wrapper_only() {
        let t = Topology::for_mode(Mode::EventDriven);
        assert!(!t.run_daemon && t.run_wrapper);
    }

    #[test]
    fn hooks_runs_daemon_with_notification() {
        let t = Topology::for_mode(Mode::Hooks);
        assert!(t.run_daemon && !t.run_wrapper);
        assert_eq!(t.observation, ObservationPreference::NotifyWithFallback);
    }

    #[test]
    fn hybrid_runs_both() {
        let t = Topology::for_mode(Mode::Hybrid);
        assert!(t.run_daemon && t.run_wrapper);
        assert_eq!(t.observation, ObservationPreference::NotifyWithFallback);
    }

    // ── run_topology ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn missing_worker_fails_before_starting() {
        let root = tempfile::tempdir().unwrap();
        let mut cfg = config(root.path(), Mode::Hybrid);
        cfg.worker = None;
        let stop = Arc::new(watch::channel(false).0);
        assert!(run_topology(&cfg, None, stop).await.is_err());
    }

    #[tokio::test]
    async fn hybrid_stops_both_components_on_stop_flag() {
        let root = tempfile::tempdir().unwrap();
        let cfg = config(root.path(), Mode::Hybrid);
        let paths = WorkerPaths::from_config(&cfg, "w1");
        let stop = Arc::new(watch::channel(false).0);

        let run = {
            let stop = Arc::clone(&stop);
            let cfg = cfg.clone();
            tokio::spawn(async move { run_topology(&cfg, None, stop).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        stop.send_replace(true);
        tokio::time::timeout(Duration::from_secs(3), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(read_heartbeat(&paths.heartbeat_file).unwrap().state, RunState::Stopped);
    }

    #[tokio::test]
    async fn event_driven_creates_no_pipes_or_heartbeat() {
        let root = tempfile::tempdir().unwrap();
        let cfg = config(root.path(), Mode::EventDriven);
        let paths = WorkerPaths::from_config(&cfg, "w1");
        let stop = Arc::new(watch::channel(false).0);

        let run = {
            let stop = Arc::clone(&stop);
            let cfg = cfg.clone();
            tokio::spawn(async move { run_topology(&cfg, None, stop).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.send_replace(true);
        tokio::time::timeout(Duration::from_secs(3), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(!paths.control_pipe.exists());
        assert!(!paths.heartbeat_file.exists());
        assert!(paths.trigger_dir.is_dir());
    }

    #[tokio::test]
    async fn startup_failure_stops_the_other_component() {
        let root = tempfile::tempdir().unwrap();
        let cfg = config(root.path(), Mode::Hybrid);
        let paths = WorkerPaths::from_config(&cfg, "w1");
        std::fs::write(&paths.status_pipe, "not a pipe").unwrap();
        let stop = Arc::new(watch::channel(false).0);

        let result = tokio::time::timeout(Duration::from_secs(3), run_topology(&cfg, None, Arc::clone(&stop)))
            .await
            .unwrap();
        assert!(result.is_err());
        assert!(*stop.borrow());
    }
}
