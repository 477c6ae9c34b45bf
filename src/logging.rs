//! Tracing subscriber setup from the log options
//!
//! stderr gets `log-level-stderr`. When `log-path` is set and
//! `log-level-file` is not `off`, a second layer appends to a per-command
//! file under it. `RUST_LOG` overrides the stderr level.

use crate::config::Config;
use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Map a log level option to a tracing filter; `detail` is debug
pub fn level_filter(level: &str) -> LevelFilter {
    match level {
        "off" => LevelFilter::OFF,
        "error" => LevelFilter::ERROR,
        "warn" => LevelFilter::WARN,
        "info" => LevelFilter::INFO,
        "detail" | "debug" => LevelFilter::DEBUG,
        "trace" => LevelFilter::TRACE,
        _ => LevelFilter::WARN,
    }
}

/// `<stanza>-<command>.log`, with the mode and process id for executor processes
pub fn log_file_name(config: &Config) -> String {
    let stanza = config.stanza().unwrap_or("all");
    match config.command() {
        mode @ ("local" | "remote") => format!(
            "{stanza}-{}-{mode}-{:03}.log",
            config.value("command").unwrap_or(mode),
            config.value("process").and_then(|p| p.parse::<u32>().ok()).unwrap_or(0)
        ),
        command => format!("{stanza}-{command}.log"),
    }
}

/// Install the global subscriber
pub fn init(config: &Config) -> Result<()> {
    let stderr_filter = EnvFilter::builder()
        .with_default_directive(level_filter(config.log_level_stderr()).into())
        .from_env_lossy();
    let stderr_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_filter(stderr_filter);

    let file_level = level_filter(config.log_level_file());
    let file_layer = match config.value("log-path") {
        Some(path) if file_level != LevelFilter::OFF => {
            let path = Path::new(path);
            fs::create_dir_all(path)
                .with_context(|| format!("unable to create log path '{}'", path.display()))?;

            let file_path = path.join(log_file_name(config));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&file_path)
                .with_context(|| format!("unable to open log file '{}'", file_path.display()))?;

            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(file_level),
            )
        }
        _ => None,
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("unable to install log subscriber")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter() {
        assert_eq!(level_filter("off"), LevelFilter::OFF);
        assert_eq!(level_filter("detail"), LevelFilter::DEBUG);
        assert_eq!(level_filter("trace"), LevelFilter::TRACE);
    }

    #[test]
    fn test_log_file_name() {
        let config = Config::from_args(["pgvault", "--stanza=db", "backup"]).unwrap();
        assert_eq!(log_file_name(&config), "db-backup.log");

        let config = Config::from_args(["pgvault", "--stanza=db", "--command=backup", "--process=2", "local"]).unwrap();
        assert_eq!(log_file_name(&config), "db-backup-local-002.log");

        let config = Config::from_args(["pgvault", "remote"]).unwrap();
        assert_eq!(log_file_name(&config), "all-remote-remote-000.log");
    }
}
