//! Exposes the command line application.
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jukebox_service::config::Config;
use jukebox_service::{metrics, storage};

use crate::{healthcheck, logging, server};

/// Jukebox commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Run the web server.
    Run,

    /// Remove leftover audio files from the storage directory.
    Cleanup,

    /// Check whether a running server is healthy.
    Healthcheck {
        /// Address of the server. Defaults to the configured bind address.
        #[arg(long)]
        addr: Option<SocketAddr>,

        /// Request timeout in seconds.
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(name = "jukebox", version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: No runtime threads have been started yet.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(ref tag) = config.metrics.hostname_tag {
            if let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag.clone(), hostname);
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)
            .context("failed to configure metrics")?;
    }

    match cli.command {
        Command::Run => server::run(config).context("failed to start the server")?,
        Command::Cleanup => storage::cleanup(&config).context("failed to clean up storage")?,
        Command::Healthcheck { addr, timeout } => {
            healthcheck::healthcheck(&config, addr, Duration::from_secs(timeout))?
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        let cli = Cli::try_parse_from(["jukebox", "--config", "jukebox.yml", "run"]).unwrap();
        assert_eq!(cli.config(), Some(Path::new("jukebox.yml")));
        assert!(matches!(cli.command, Command::Run));

        let cli = Cli::try_parse_from(["jukebox", "healthcheck", "--addr", "127.0.0.1:5000"])
            .unwrap();
        let Command::Healthcheck { addr, timeout } = cli.command else {
            panic!("expected the healthcheck command");
        };
        assert_eq!(addr, Some(SocketAddr::from(([127, 0, 0, 1], 5000))));
        assert_eq!(timeout, 5);

        assert!(Cli::try_parse_from(["jukebox"]).is_err());
    }
}
