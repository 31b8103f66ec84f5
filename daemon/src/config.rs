use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::error::ConfigError;
use crate::event::WatcherEvent;
use crate::paths;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;
pub const DEFAULT_PIPE_TIMEOUT_MS: u64 = 2_000;
/// One day. Probers multiply the interval by a staleness factor.
pub const MAX_HEARTBEAT_INTERVAL_SECS: u64 = 86_400;
/// Base directory for all per-worker artifacts when none is configured.
pub const DEFAULT_RUNTIME_ROOT: &str = "/tmp/beacon";

/// The four operating topologies. Chosen once at startup; changing it needs a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Watcher daemon only, fixed-interval directory scan.
    Polling,
    /// Activation wrapper only; no pipe protocol or heartbeat.
    EventDriven,
    /// Watcher daemon only, filesystem notification with polling fallback.
    Hooks,
    /// Activation wrapper and watcher daemon side by side.
    Hybrid,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Polling => "polling",
            Mode::EventDriven => "event-driven",
            Mode::Hooks => "hooks",
            Mode::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "polling" | "poll" => Ok(Mode::Polling),
            "event-driven" | "event_driven" | "events" => Ok(Mode::EventDriven),
            "hooks" => Ok(Mode::Hooks),
            "hybrid" => Ok(Mode::Hybrid),
            _ => Err(ConfigError::UnknownMode(s.to_string())),
        }
    }
}

/// Root configuration structure, deserialized from the TOML config file and
/// then layered with environment and command-line overrides.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Config {
    /// Worker identity; names the trigger subdirectory, pipes and heartbeat file.
    #[serde(default)]
    pub worker: Option<String>,
    #[serde(default = "default_mode")]
    pub mode: Mode,
    /// Fallback scan interval for the polling observation strategy.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// How long shutdown waits for in-flight work before forcing exit.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Upper bound on any single pipe open/read/write.
    #[serde(default = "default_pipe_timeout_ms")]
    pub pipe_timeout_ms: u64,
    #[serde(default = "default_trigger_dir")]
    pub trigger_dir: PathBuf,
    #[serde(default = "default_pipe_dir")]
    pub pipe_dir: PathBuf,
    #[serde(default = "default_heartbeat_dir")]
    pub heartbeat_dir: PathBuf,
    /// Optional `redis://host:port` fanout broker.
    #[serde(default)]
    pub broker_url: Option<String>,
    /// Broker channel; defaults to `beacon:<worker>`.
    #[serde(default)]
    pub broker_channel: Option<String>,
    /// argv of the worker process the activation wrapper hands control to.
    #[serde(default)]
    pub worker_command: Vec<String>,
    /// Apply config file edits without a `reload` command.
    #[serde(default)]
    pub watch_config: bool,
    /// Tunables set by the environment or the command line. `reload` applies
    /// them again on top of the file so they keep precedence.
    #[serde(skip)]
    pub pinned: TunableOverrides,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker: None,
            mode: default_mode(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            pipe_timeout_ms: DEFAULT_PIPE_TIMEOUT_MS,
            trigger_dir: default_trigger_dir(),
            pipe_dir: default_pipe_dir(),
            heartbeat_dir: default_heartbeat_dir(),
            broker_url: None,
            broker_channel: None,
            worker_command: Vec::new(),
            watch_config: false,
            pinned: TunableOverrides::default(),
        }
    }
}

/// The subset of configuration that `reload` may change on a running daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tunables {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub pipe_timeout: Duration,
}

/// Tunables one configuration layer sets explicitly; `None` leaves the value
/// from the layer below in place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct TunableOverrides {
    pub poll_interval_ms: Option<u64>,
    pub heartbeat_interval_secs: Option<u64>,
    pub pipe_timeout_ms: Option<u64>,
}

impl TunableOverrides {
    pub fn apply(&self, mut tunables: Tunables) -> Tunables {
        if let Some(ms) = self.poll_interval_ms {
            tunables.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = self.heartbeat_interval_secs {
            tunables.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = self.pipe_timeout_ms {
            tunables.pipe_timeout = Duration::from_millis(ms);
        }
        tunables
    }
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn pipe_timeout(&self) -> Duration {
        Duration::from_millis(self.pipe_timeout_ms)
    }

    pub fn tunables(&self) -> Tunables {
        Tunables {
            poll_interval: self.poll_interval(),
            heartbeat_interval: self.heartbeat_interval(),
            pipe_timeout: self.pipe_timeout(),
        }
    }

    /// Returns the validated worker name.
    pub fn worker_name(&self) -> Result<&str, ConfigError> {
        let worker = self.worker.as_deref().ok_or(ConfigError::MissingWorker)?;
        if !paths::is_safe_component(worker) {
            return Err(ConfigError::InvalidWorker(worker.to_string()));
        }
        Ok(worker)
    }

    /// Returns the broker channel, falling back to `beacon:<worker>`.
    pub fn effective_broker_channel(&self, worker: &str) -> String {
        self.broker_channel
            .clone()
            .unwrap_or_else(|| format!("beacon:{worker}"))
    }

    /// Sets the poll interval and keeps it across `reload`.
    pub fn pin_poll_interval_ms(&mut self, ms: u64) {
        self.poll_interval_ms = ms;
        self.pinned.poll_interval_ms = Some(ms);
    }

    /// Sets the heartbeat interval and keeps it across `reload`.
    pub fn pin_heartbeat_interval_secs(&mut self, secs: u64) {
        self.heartbeat_interval_secs = secs;
        self.pinned.heartbeat_interval_secs = Some(secs);
    }

    /// Layers `BEACON_*` overrides on top of the file values.
    ///
    /// `lookup` abstracts the environment so that only the top-level entry
    /// point ever touches the real process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(worker) = lookup("BEACON_WORKER") {
            self.worker = Some(worker);
        }
        if let Some(mode) = lookup("BEACON_MODE") {
            self.mode = mode.parse()?;
        }
        if let Some(ms) = lookup("BEACON_POLL_INTERVAL_MS") {
            self.pin_poll_interval_ms(parse_u64("BEACON_POLL_INTERVAL_MS", &ms)?);
        }
        if let Some(secs) = lookup("BEACON_HEARTBEAT_INTERVAL_SECS") {
            self.pin_heartbeat_interval_secs(parse_u64("BEACON_HEARTBEAT_INTERVAL_SECS", &secs)?);
        }
        if let Some(dir) = lookup("BEACON_TRIGGER_DIR") {
            self.trigger_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("BEACON_PIPE_DIR") {
            self.pipe_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("BEACON_HEARTBEAT_DIR") {
            self.heartbeat_dir = PathBuf::from(dir);
        }
        if let Some(url) = lookup("BEACON_BROKER_URL") {
            self.broker_url = if url.is_empty() { None } else { Some(url) };
        }
        Ok(())
    }

    /// Startup validation. Any error here means the daemon must not start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.worker_name()?;

        let non_zero = [
            ("poll_interval_ms", self.poll_interval_ms),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("pipe_timeout_ms", self.pipe_timeout_ms),
        ];
        for (key, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key,
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        if self.heartbeat_interval_secs > MAX_HEARTBEAT_INTERVAL_SECS {
            return Err(ConfigError::InvalidValue {
                key: "heartbeat_interval_secs",
                message: format!("must be at most {MAX_HEARTBEAT_INTERVAL_SECS}"),
            });
        }

        let dirs = [
            ("trigger_dir", &self.trigger_dir),
            ("pipe_dir", &self.pipe_dir),
            ("heartbeat_dir", &self.heartbeat_dir),
        ];
        for (key, path) in dirs {
            if !path.is_dir() {
                return Err(ConfigError::MissingDirectory {
                    key,
                    path: path.clone(),
                });
            }
        }
        Ok(())
    }
}

fn parse_u64(key: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
        key,
        message: format!("'{raw}': {e}"),
    })
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Reads the config file for `reload`: the whole config, which must still
/// parse, and the tunables the file sets explicitly.
pub fn load_for_reload(path: &Path) -> Result<(Config, TunableOverrides)> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    let tunables = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok((config, tunables))
}

/// Spawns a file watcher on the parent directory of `path`.  Whenever the config
/// file is created or modified, asks the watcher to run its reload path.
pub async fn watch_config(
    path: PathBuf,
    tx: mpsc::Sender<WatcherEvent>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.try_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!(error = %e, "failed to create config file watcher");
            return;
        }
    };

    // Watch the parent directory rather than the file directly so we catch
    // editor-style atomic saves (write-new + rename).
    let watch_dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
        _ => PathBuf::from("."),
    };

    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        tracing::warn!(error = %e, dir = %watch_dir.display(), "failed to watch config directory");
        return;
    }

    loop {
        let event = tokio::select! {
            event = watch_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = stop_rx.changed() => break,
        };

        let affects_config = event
            .paths
            .iter()
            .any(|p| p.file_name() == path.file_name());
        let is_write = matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        );

        if affects_config && is_write {
            tracing::debug!(path = %path.display(), "config file changed");
            if tx.send(WatcherEvent::ConfigChanged).await.is_err() {
                break;
            }
        }
    }
}

fn default_mode() -> Mode {
    Mode::Hybrid
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_heartbeat_interval_secs() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}

fn default_shutdown_grace_secs() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}

fn default_pipe_timeout_ms() -> u64 {
    DEFAULT_PIPE_TIMEOUT_MS
}

fn default_trigger_dir() -> PathBuf {
    PathBuf::from(DEFAULT_RUNTIME_ROOT).join("triggers")
}

fn default_pipe_dir() -> PathBuf {
    PathBuf::from(DEFAULT_RUNTIME_ROOT).join("pipes")
}

fn default_heartbeat_dir() -> PathBuf {
    PathBuf::from(DEFAULT_RUNTIME_ROOT).join("heartbeats")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn config_in(dir: &Path) -> Config {
        let mut config = Config {
            worker: Some("planner".to_string()),
            trigger_dir: dir.join("triggers"),
            pipe_dir: dir.join("pipes"),
            heartbeat_dir: dir.join("heartbeats"),
            ..Config::default()
        };
        for d in [&config.trigger_dir, &config.pipe_dir, &config.heartbeat_dir] {
            std::fs::create_dir_all(d).unwrap();
        }
        config.mode = Mode::Hooks;
        config
    }

    // ── defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn config_default_values() {
        let c = Config::default();
        assert_eq!(c.mode, Mode::Hybrid);
        assert_eq!(c.poll_interval(), Duration::from_millis(500));
        assert_eq!(c.heartbeat_interval(), Duration::from_secs(10));
        assert_eq!(c.shutdown_grace(), Duration::from_secs(5));
        assert!(c.broker_url.is_none());
        assert!(c.worker_command.is_empty());
        assert!(!c.watch_config);
    }

    // ── Mode ──────────────────────────────────────────────────────────────────

    #[test]
    fn mode_parses_all_variants() {
        assert_eq!("polling".parse::<Mode>().unwrap(), Mode::Polling);
        assert_eq!("event-driven".parse::<Mode>().unwrap(), Mode::EventDriven);
        assert_eq!("HOOKS".parse::<Mode>().unwrap(), Mode::Hooks);
        assert_eq!(" hybrid ".parse::<Mode>().unwrap(), Mode::Hybrid);
    }

    #[test]
    fn mode_rejects_unknown_value() {
        let err = "turbo".parse::<Mode>().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownMode(ref m) if m == "turbo"));
    }

    #[test]
    fn mode_display_matches_serde_name() {
        for mode in [Mode::Polling, Mode::EventDriven, Mode::Hooks, Mode::Hybrid] {
            let json = serde_json::to_string(&mode).unwrap();
            assert_eq!(json, format!("\"{mode}\""));
        }
    }

    // ── apply_env ─────────────────────────────────────────────────────────────

    #[test]
    fn apply_env_overrides_file_values() {
        let mut c = Config::default();
        c.apply_env(env(&[
            ("BEACON_WORKER", "reviewer"),
            ("BEACON_MODE", "polling"),
            ("BEACON_POLL_INTERVAL_MS", "250"),
            ("BEACON_HEARTBEAT_INTERVAL_SECS", "3"),
            ("BEACON_TRIGGER_DIR", "/srv/triggers"),
            ("BEACON_BROKER_URL", "redis://127.0.0.1:6379"),
        ]))
        .unwrap();

        assert_eq!(c.worker.as_deref(), Some("reviewer"));
        assert_eq!(c.mode, Mode::Polling);
        assert_eq!(c.poll_interval_ms, 250);
        assert_eq!(c.heartbeat_interval_secs, 3);
        assert_eq!(c.trigger_dir, PathBuf::from("/srv/triggers"));
        assert_eq!(c.broker_url.as_deref(), Some("redis://127.0.0.1:6379"));
        assert_eq!(
            c.pinned,
            TunableOverrides {
                poll_interval_ms: Some(250),
                heartbeat_interval_secs: Some(3),
                pipe_timeout_ms: None,
            }
        );
    }

    #[test]
    fn file_values_are_not_pinned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beacon.toml");
        std::fs::write(&path, "poll_interval_ms = 100\n").unwrap();
        let mut c = load_or_default(&path).unwrap();
        assert_eq!(c.pinned, TunableOverrides::default());

        c.apply_env(env(&[])).unwrap();
        assert_eq!(c.pinned, TunableOverrides::default());
    }

    #[test]
    fn apply_env_empty_broker_url_disables_broker() {
        let mut c = Config {
            broker_url: Some("redis://localhost:6379".to_string()),
            ..Config::default()
        };
        c.apply_env(env(&[("BEACON_BROKER_URL", "")])).unwrap();
        assert!(c.broker_url.is_none());
    }

    #[test]
    fn apply_env_rejects_bad_number() {
        let mut c = Config::default();
        let err = c
            .apply_env(env(&[("BEACON_POLL_INTERVAL_MS", "fast")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "BEACON_POLL_INTERVAL_MS", .. }));
    }

    #[test]
    fn apply_env_rejects_bad_mode() {
        let mut c = Config::default();
        assert!(c.apply_env(env(&[("BEACON_MODE", "sometimes")])).is_err());
    }

    // ── validate ──────────────────────────────────────────────────────────────

    #[test]
    fn validate_accepts_complete_config() {
        let dir = tempfile::tempdir().unwrap();
        assert!(config_in(dir.path()).validate().is_ok());
    }

    #[test]
    fn validate_requires_worker() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = config_in(dir.path());
        c.worker = None;
        assert!(matches!(c.validate(), Err(ConfigError::MissingWorker)));
    }

    #[test]
    fn validate_rejects_path_like_worker() {
        let dir = tempfile::tempdir().unwrap();
        for bad in ["", "../x", "a/b", ".hidden"] {
            let mut c = config_in(dir.path());
            c.worker = Some(bad.to_string());
            assert!(
                matches!(c.validate(), Err(ConfigError::InvalidWorker(_))),
                "worker {bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn validate_rejects_zero_interval() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = config_in(dir.path());
        c.poll_interval_ms = 0;
        assert!(matches!(
            c.validate(),
            Err(ConfigError::InvalidValue { key: "poll_interval_ms", .. })
        ));
    }

    #[test]
    fn validate_rejects_oversized_heartbeat_interval() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = config_in(dir.path());
        c.heartbeat_interval_secs = MAX_HEARTBEAT_INTERVAL_SECS;
        assert!(c.validate().is_ok());
        c.heartbeat_interval_secs = 10_000_000_000_000_000;
        assert!(matches!(
            c.validate(),
            Err(ConfigError::InvalidValue { key: "heartbeat_interval_secs", .. })
        ));
    }

    #[test]
    fn validate_rejects_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = config_in(dir.path());
        c.heartbeat_dir = dir.path().join("nope");
        assert!(matches!(
            c.validate(),
            Err(ConfigError::MissingDirectory { key: "heartbeat_dir", .. })
        ));
    }

    // ── effective_broker_channel ──────────────────────────────────────────────

    #[test]
    fn broker_channel_falls_back_to_worker_name() {
        let c = Config::default();
        assert_eq!(c.effective_broker_channel("coder"), "beacon:coder");
    }

    #[test]
    fn broker_channel_uses_override() {
        let c = Config {
            broker_channel: Some("fanout".to_string()),
            ..Config::default()
        };
        assert_eq!(c.effective_broker_channel("coder"), "fanout");
    }

    // ── load_or_default ───────────────────────────────────────────────────────

    #[test]
    fn load_or_default_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonexistent.toml");
        let config = load_or_default(&path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn load_or_default_parses_valid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beacon.toml");
        std::fs::write(
            &path,
            r#"
worker = "architect"
mode = "event-driven"
poll_interval_ms = 200
heartbeat_interval_secs = 4
trigger_dir = "/var/run/beacon/triggers"
broker_url = "redis://broker:6379"
worker_command = ["run-agent", "--once"]
"#,
        )
        .unwrap();

        let config = load_or_default(&path).unwrap();
        assert_eq!(config.worker.as_deref(), Some("architect"));
        assert_eq!(config.mode, Mode::EventDriven);
        assert_eq!(config.poll_interval_ms, 200);
        assert_eq!(config.heartbeat_interval_secs, 4);
        assert_eq!(config.trigger_dir, PathBuf::from("/var/run/beacon/triggers"));
        assert_eq!(config.broker_url.as_deref(), Some("redis://broker:6379"));
        assert_eq!(config.worker_command, vec!["run-agent", "--once"]);
    }

    #[test]
    fn load_or_default_partial_toml_uses_field_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beacon.toml");
        std::fs::write(&path, "poll_interval_ms = 100\n").unwrap();

        let config = load_or_default(&path).unwrap();
        assert_eq!(config.poll_interval_ms, 100);
        assert_eq!(config.mode, Mode::Hybrid);
        assert_eq!(config.heartbeat_interval_secs, DEFAULT_HEARTBEAT_INTERVAL_SECS);
    }

    // ── load_for_reload ───────────────────────────────────────────────────────

    #[test]
    fn load_for_reload_reports_only_keys_the_file_sets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beacon.toml");
        std::fs::write(&path, "worker = \"w1\"\nheartbeat_interval_secs = 4\n").unwrap();

        let (config, tunables) = load_for_reload(&path).unwrap();
        assert_eq!(config.worker.as_deref(), Some("w1"));
        assert_eq!(
            tunables,
            TunableOverrides {
                heartbeat_interval_secs: Some(4),
                ..TunableOverrides::default()
            }
        );
    }

    #[test]
    fn load_for_reload_rejects_broken_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beacon.toml");
        std::fs::write(&path, "mode = \"sometimes\"\n").unwrap();
        assert!(load_for_reload(&path).is_err());
    }

    #[test]
    fn overrides_apply_only_set_keys() {
        let base = Config::default().tunables();
        let layer = TunableOverrides {
            pipe_timeout_ms: Some(300),
            ..TunableOverrides::default()
        };
        let next = layer.apply(base);
        assert_eq!(next.pipe_timeout, Duration::from_millis(300));
        assert_eq!(next.poll_interval, base.poll_interval);
        assert_eq!(next.heartbeat_interval, base.heartbeat_interval);
    }

    #[test]
    fn load_or_default_invalid_mode_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beacon.toml");
        std::fs::write(&path, "mode = \"sometimes\"\n").unwrap();
        assert!(load_or_default(&path).is_err());
    }

    #[test]
    fn load_or_default_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beacon.toml");
        std::fs::write(&path, "this is not valid toml ][[[").unwrap();
        assert!(load_or_default(&path).is_err());
    }
}
