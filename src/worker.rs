use crate::config::{Config, DEFAULT_CONFIG_PATH};
use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Arg, ArgMatches, Command};
use log::LevelFilter;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What a tick found to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing was pending; sleep for the worker's cadence.
    Idle,
    /// Work was done; poll again straight away.
    Busy,
}

/// A polling worker. The loop lives in [`run_worker`]; a worker only knows
/// how to do one pass.
#[async_trait]
pub trait Worker: Send {
    fn name(&self) -> &'static str;

    fn cadence(&self) -> Duration;

    /// Errors returned here are worker-scoped: logged, then retried after
    /// the cadence sleep.
    async fn tick(&mut self) -> Result<TickOutcome>;
}

/// Runs `worker` until `token` is cancelled. Cancellation is only observed
/// between ticks, so an in-progress tick always completes.
pub async fn run_worker<W: Worker + ?Sized>(worker: &mut W, token: CancellationToken) {
    log::info!("{} started (cadence {:?})", worker.name(), worker.cadence());

    while !token.is_cancelled() {
        let sleep_for = match worker.tick().await {
            Ok(TickOutcome::Busy) => continue,
            Ok(TickOutcome::Idle) => worker.cadence(),
            Err(e) => {
                log::error!("{} tick failed: {e:#}", worker.name());
                worker.cadence()
            }
        };

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }

    log::info!("{} stopped", worker.name());
}

/// Returns a token cancelled on Ctrl-C or SIGTERM.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();

    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                log::info!("Received interrupt, shutting down");
                ctrl_c_token.cancel();
            }
            Err(e) => log::error!("Failed to listen for Ctrl-C: {e}"),
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let sigterm_token = token.clone();
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::spawn(async move {
                    sigterm.recv().await;
                    log::info!("Received SIGTERM, shutting down");
                    sigterm_token.cancel();
                });
            }
            Err(e) => log::error!("Failed to install SIGTERM handler: {e}"),
        }
    }

    token
}

/// Command line shared by every worker binary: `-c/--config` and `-v`.
pub fn worker_command(name: &'static str, about: &'static str) -> Command {
    Command::new(name)
        .version(env!("CARGO_PKG_VERSION"))
        .about(about)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(clap::ArgAction::SetTrue),
        )
}

pub fn init_logging(verbose: bool) {
    let log_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();
}

/// Initialises logging from `matches` and loads the configuration it names.
pub fn init_from_matches(matches: &ArgMatches) -> Result<Config> {
    init_logging(matches.get_flag("verbose"));
    let path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_PATH);
    let config = Config::from_file(path)
        .with_context(|| format!("Failed to load configuration from {path}"))?;
    log::info!("Loaded configuration from {path}");
    Ok(config)
}
