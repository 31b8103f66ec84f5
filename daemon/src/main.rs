mod broker;
mod config;
mod error;
mod event;
mod heartbeat;
mod mode;
mod observer;
mod paths;
mod pipe;
mod state;
mod trigger;
mod watcher;
mod wrapper;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use crate::broker::Broker;
use crate::config::{Config, Mode};
use crate::error::TriggerError;
use crate::heartbeat::{Health, DEFAULT_STALENESS_FACTOR};
use crate::paths::WorkerPaths;
use crate::pipe::{ControlCommand, Verb};
use crate::trigger::TriggerChannel;

#[derive(Parser)]
#[command(name = "beacon", version, about = "Trigger watcher, control pipes and heartbeat for one worker")]
struct Cli {
    /// TOML config file. A missing file means built-in defaults.
    #[arg(long, short, global = true, default_value = "beacon.toml")]
    config: PathBuf,

    /// Worker name; overrides `worker` in the config file and BEACON_WORKER.
    #[arg(long, short, global = true)]
    worker: Option<String>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the components selected by the activation mode.
    Run {
        #[arg(long)]
        mode: Option<Mode>,
        #[arg(long)]
        poll_interval_ms: Option<u64>,
        #[arg(long)]
        heartbeat_interval_secs: Option<u64>,
    },
    /// Write a trigger for the worker (and announce it on the broker, if configured).
    Publish {
        kind: String,
        correlation_id: String,
        /// JSON payload.
        #[arg(long, default_value = "null")]
        payload: String,
    },
    /// Take the next pending trigger and print it as JSON; exit 1 when none is pending.
    Consume,
    /// Send status, reload or shutdown to a running watcher and print the reply.
    Ctl {
        verb: Verb,
        /// `key=value` arguments, e.g. `poll_interval_ms=200` for reload.
        args: Vec<String>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Check the worker's heartbeat: exit 0 healthy, 1 stale or stopped, 2 unreadable.
    Probe {
        #[arg(long, default_value_t = DEFAULT_STALENESS_FACTOR)]
        factor: u32,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "fatal");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// File, then `BEACON_*` environment, then command-line flags.
fn resolve_config(path: &Path, worker: Option<String>) -> Result<Config> {
    let mut config = config::load_or_default(path)?;
    config.apply_env(|key| std::env::var(key).ok())?;
    if let Some(worker) = worker {
        config.worker = Some(worker);
    }
    Ok(config)
}

async fn execute(cli: Cli) -> Result<ExitCode> {
    let mut config = resolve_config(&cli.config, cli.worker)?;

    match cli.command {
        // ── run ───────────────────────────────────────────────────────────────
        Command::Run {
            mode,
            poll_interval_ms,
            heartbeat_interval_secs,
        } => {
            if let Some(mode) = mode {
                config.mode = mode;
            }
            if let Some(ms) = poll_interval_ms {
                config.pin_poll_interval_ms(ms);
            }
            if let Some(secs) = heartbeat_interval_secs {
                config.pin_heartbeat_interval_secs(secs);
            }
            config.validate()?;
            tracing::info!(version = env!("CARGO_PKG_VERSION"), config = %cli.config.display(), "beacon starting");
            mode::launch(config, Some(cli.config)).await?;
            Ok(ExitCode::SUCCESS)
        }

        // ── publish ───────────────────────────────────────────────────────────
        Command::Publish {
            kind,
            correlation_id,
            payload,
        } => {
            let worker = config.worker_name()?;
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("--payload must be valid JSON")?;
            let channel = TriggerChannel::new(config.trigger_dir.join(worker));
            let path = channel.publish(&kind, &correlation_id, payload)?;
            println!("{}", path.display());

            if let Some(url) = &config.broker_url {
                let notice =
                    broker::trigger_notice(worker, &kind, &correlation_id, chrono::Utc::now());
                let announced = match Broker::new(url, &config.effective_broker_channel(worker), config.pipe_timeout()) {
                    Ok(broker) => broker.publish(&notice).await.map(|_| ()),
                    Err(e) => Err(e),
                };
                if let Err(e) = announced {
                    tracing::warn!(error = %e, "trigger written but broker announcement failed");
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        // ── consume ───────────────────────────────────────────────────────────
        Command::Consume => {
            let worker = config.worker_name()?;
            let mut channel = TriggerChannel::new(config.trigger_dir.join(worker));
            while let Some(pending) = channel.consume()? {
                match pending.record {
                    Ok(record) => {
                        println!("{}", serde_json::to_string(&record)?);
                        return Ok(ExitCode::SUCCESS);
                    }
                    Err(e @ TriggerError::Io { .. }) => {
                        tracing::error!(path = %pending.path.display(), error = %e, "trigger unreadable; left in place");
                    }
                    Err(e) => {
                        tracing::warn!(path = %pending.path.display(), error = %e, "discarded malformed trigger");
                    }
                }
            }
            Ok(ExitCode::FAILURE)
        }

        // ── ctl ───────────────────────────────────────────────────────────────
        Command::Ctl {
            verb,
            args,
            timeout_ms,
        } => {
            let worker = config.worker_name()?;
            let paths = WorkerPaths::from_config(&config, worker);
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.pipe_timeout());
            let command = ControlCommand::with_args(verb, args);

            match pipe::send_command(&paths.control_pipe, &paths.status_pipe, &command, timeout).await {
                Ok(reply) => {
                    println!("{}", reply.to_line().trim_end());
                    Ok(if reply.ok {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::FAILURE
                    })
                }
                Err(e) => {
                    tracing::error!(worker, verb = %command.verb, error = %e, "no reply from watcher");
                    Ok(ExitCode::FAILURE)
                }
            }
        }

        // ── probe ─────────────────────────────────────────────────────────────
        Command::Probe { factor } => {
            let worker = config.worker_name()?;
            let paths = WorkerPaths::from_config(&config, worker);
            let record = match heartbeat::read_heartbeat(&paths.heartbeat_file) {
                Ok(record) => record,
                Err(e) => {
                    println!("unknown: {e:#}");
                    return Ok(ExitCode::from(2));
                }
            };

            match heartbeat::assess(&record, chrono::Utc::now(), factor) {
                Health::Healthy => {
                    match &record.degraded {
                        Some(reason) => println!("healthy (degraded: {reason})"),
                        None => println!("healthy"),
                    }
                    Ok(ExitCode::SUCCESS)
                }
                Health::Stale { age } => {
                    println!("stale: last heartbeat {}s ago", age.num_seconds());
                    Ok(ExitCode::from(1))
                }
                Health::Stopped => {
                    println!("stopped");
                    Ok(ExitCode::from(1))
                }
            }
        }
    }
}
