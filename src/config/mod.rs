//! Option store for pgvault commands
//!
//! Options come from the command line (`--name=value`, `--name`) and from an
//! ini-style config file with `[global]` and `[<stanza>]` sections. Command
//! line options win over file options. Indexed options keep their indexed
//! names (`repo1-host`, `pg3-port`).
//!
//! Only command-line options are forwarded to spawned processes by
//! [`Config::exec_params`]; a spawned process reads its own config file.

mod handler;

pub use handler::ConfigHandler;

use crate::error::{ErrorKind, ProtocolError};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Config file name looked up under `config-path`
pub const CONFIG_FILE: &str = "pgvault.conf";

/// Config file used when neither `config` nor `config-path` is given
pub const CONFIG_DEFAULT: &str = "/etc/pgvault/pgvault.conf";

/// Highest pg index accepted in option names (`pg1-` .. `pg8-`)
pub const PG_INDEX_MAX: usize = 8;

/// Upper bound for `protocol-timeout` (one week)
pub const PROTOCOL_TIMEOUT_MAX: Duration = Duration::from_secs(7 * 86400);

const LOG_LEVELS: [&str; 7] = ["off", "error", "warn", "info", "detail", "debug", "trace"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid argument '{0}'")]
    InvalidArgument(String),

    #[error("'{value}' is not valid for '{name}' option")]
    InvalidValue { name: String, value: String },

    #[error("unable to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid line {line} in config file '{}': {content}", .path.display())]
    FileFormat {
        path: PathBuf,
        line: usize,
        content: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Flag,
    Value(String),
}

/// Where an option was set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionSource {
    Param,
    Config,
}

#[derive(Debug, Clone)]
struct ConfigOption {
    value: OptionValue,
    source: OptionSource,
}

#[derive(Debug, Clone)]
pub struct Config {
    exe: String,
    command: Option<String>,
    options: BTreeMap<String, ConfigOption>,
}

impl Config {
    /// Parse a full argument list; the first element is the executable
    pub fn from_args<I, S>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut args = args.into_iter();
        let exe = args
            .next()
            .map(|arg| arg.as_ref().to_string())
            .unwrap_or_else(|| "pgvault".to_string());

        let mut config = Config {
            exe,
            command: None,
            options: BTreeMap::new(),
        };

        for arg in args {
            let arg = arg.as_ref();

            let Some(option) = arg.strip_prefix("--") else {
                if arg.starts_with('-') {
                    return Err(ConfigError::InvalidArgument(arg.to_string()));
                }
                config.command = Some(arg.to_string());
                continue;
            };

            let (name, value) = match option.split_once('=') {
                Some((name, value)) => (name, OptionValue::Value(value.to_string())),
                None => (option, OptionValue::Flag),
            };
            if !valid_name(name) {
                return Err(ConfigError::InvalidArgument(arg.to_string()));
            }

            config.set(name, value, OptionSource::Param);
        }

        config.validate()?;
        Ok(config)
    }

    /// Merge options from the config file
    ///
    /// The file is `config` when set, else `<config-path>/pgvault.conf`, else
    /// the default location. Only an explicitly named file must exist.
    pub fn load_file(&mut self) -> Result<(), ConfigError> {
        let (path, required) = match (self.value("config"), self.value("config-path")) {
            (Some(file), _) => (PathBuf::from(file), true),
            (None, Some(dir)) => (Path::new(dir).join(CONFIG_FILE), true),
            (None, None) => (PathBuf::from(CONFIG_DEFAULT), false),
        };

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if !required && e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(source) => return Err(ConfigError::FileRead { path, source }),
        };

        self.load_str(&content, &path)
    }

    /// Merge ini content; `[<stanza>]` wins over `[global]`
    pub fn load_str(&mut self, content: &str, path: &Path) -> Result<(), ConfigError> {
        let stanza = self.value("stanza").map(str::to_string);
        let mut global = Vec::new();
        let mut section_stanza = Vec::new();
        let mut section: Option<String> = None;

        for (number, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
                section = Some(name.trim().to_string());
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::FileFormat {
                    path: path.to_path_buf(),
                    line: number + 1,
                    content: line.to_string(),
                });
            };
            let (key, value) = (key.trim(), value.trim());
            if !valid_name(key) {
                return Err(ConfigError::FileFormat {
                    path: path.to_path_buf(),
                    line: number + 1,
                    content: line.to_string(),
                });
            }

            match section.as_deref() {
                Some("global") => global.push((key.to_string(), value.to_string())),
                Some(name) if stanza.as_deref() == Some(name) => {
                    section_stanza.push((key.to_string(), value.to_string()))
                }
                _ => {}
            }
        }

        for (key, value) in global.into_iter().chain(section_stanza) {
            if self.source(&key) == Some(OptionSource::Param) {
                continue;
            }
            self.set(&key, OptionValue::Value(value), OptionSource::Config);
        }

        self.validate()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |name: &str, value: &str| ConfigError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        };

        if let Some(value) = self.value("process-max") {
            match value.parse::<usize>() {
                Ok(max) if max >= 1 => {}
                _ => return Err(invalid("process-max", value)),
            }
        }

        if let Some(value) = self.value("protocol-timeout") {
            if parse_timeout(value).is_none() {
                return Err(invalid("protocol-timeout", value));
            }
        }

        for name in ["log-level-file", "log-level-stderr"] {
            if let Some(value) = self.value(name) {
                if !LOG_LEVELS.contains(&value) {
                    return Err(invalid(name, value));
                }
            }
        }

        for name in ["log-subprocess", "host-key-check"] {
            if let Some(OptionValue::Value(value)) = self.get(name) {
                if parse_bool(value).is_none() {
                    return Err(invalid(name, value));
                }
            }
        }

        Ok(())
    }

    pub fn set(&mut self, name: &str, value: OptionValue, source: OptionSource) {
        self.options
            .insert(name.to_string(), ConfigOption { value, source });
    }

    pub fn get(&self, name: &str) -> Option<&OptionValue> {
        self.options.get(name).map(|option| &option.value)
    }

    pub fn source(&self, name: &str) -> Option<OptionSource> {
        self.options.get(name).map(|option| option.source)
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.options.contains_key(name)
    }

    /// String value of an option; flags have no value
    pub fn value(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(OptionValue::Value(value)) => Some(value),
            _ => None,
        }
    }

    /// Value as set, else the built-in default
    pub fn value_or_default(&self, name: &str) -> Option<String> {
        match self.get(name) {
            Some(OptionValue::Value(value)) => Some(value.clone()),
            Some(OptionValue::Flag) => Some("y".to_string()),
            None => default_value(name, &self.exe),
        }
    }

    /// Boolean option; a bare flag is true
    pub fn flag(&self, name: &str) -> bool {
        match self.get(name) {
            Some(OptionValue::Flag) => true,
            Some(OptionValue::Value(value)) => parse_bool(value).unwrap_or(false),
            None => default_value(name, &self.exe)
                .and_then(|value| parse_bool(&value))
                .unwrap_or(false),
        }
    }

    /// Names of every option currently set
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.options.keys().map(String::as_str)
    }

    pub fn exe(&self) -> &str {
        &self.exe
    }

    pub fn exe_set(&mut self, exe: impl Into<String>) {
        self.exe = exe.into();
    }

    /// Command word given on the command line, empty when none was given
    pub fn command(&self) -> &str {
        self.command.as_deref().unwrap_or_default()
    }

    pub fn stanza(&self) -> Option<&str> {
        self.value("stanza")
    }

    pub fn process_max(&self) -> usize {
        self.value("process-max")
            .and_then(|value| value.parse().ok())
            .unwrap_or(1)
    }

    pub fn protocol_timeout(&self) -> Duration {
        self.value("protocol-timeout")
            .and_then(parse_timeout)
            .unwrap_or(Duration::from_secs(1830))
    }

    pub fn log_level_file(&self) -> &str {
        self.value("log-level-file").unwrap_or("info")
    }

    pub fn log_level_stderr(&self) -> &str {
        self.value("log-level-stderr").unwrap_or("warn")
    }

    pub fn log_subprocess(&self) -> bool {
        self.flag("log-subprocess")
    }

    pub fn cmd_ssh(&self) -> &str {
        self.value("cmd-ssh").unwrap_or("ssh")
    }

    pub fn host_key_check(&self) -> bool {
        self.flag("host-key-check")
    }

    /// True when the repository is on this host
    pub fn repo_is_local(&self) -> bool {
        !self.is_set("repo1-host")
    }

    /// Fail unless the repository is on this host
    pub fn repo_is_local_verify(&self) -> crate::error::Result<()> {
        if self.repo_is_local() {
            return Ok(());
        }
        Err(ProtocolError::raised(
            ErrorKind::HostInvalid,
            format!("{} command must be run on the repository host", self.command()),
        ))
    }

    /// True when pg host `host_id` (1-based) is on this host
    pub fn pg_is_local(&self, host_id: usize) -> bool {
        !self.is_set(&format!("pg{host_id}-host"))
    }

    /// Command line for a spawned pgvault process
    ///
    /// Every command-line option is rendered, replacements applied (`None`
    /// removes the option), sorted by name and followed by `mode`.
    pub fn exec_params(&self, mode: &str, replacements: &BTreeMap<String, Option<String>>) -> Vec<String> {
        let mut options: BTreeMap<&str, OptionValue> = self
            .options
            .iter()
            .filter(|(_, option)| option.source == OptionSource::Param)
            .map(|(name, option)| (name.as_str(), option.value.clone()))
            .collect();

        for (name, value) in replacements {
            match value {
                Some(value) => options.insert(name.as_str(), OptionValue::Value(value.clone())),
                None => options.remove(name.as_str()),
            };
        }

        let mut params: Vec<String> = options
            .into_iter()
            .map(|(name, value)| match value {
                OptionValue::Flag => format!("--{name}"),
                OptionValue::Value(value) => format!("--{name}={value}"),
            })
            .collect();
        params.push(mode.to_string());

        params
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Seconds, fractions allowed, within `(0, PROTOCOL_TIMEOUT_MAX]`
fn parse_timeout(value: &str) -> Option<Duration> {
    let seconds = value.parse::<f64>().ok()?;
    let timeout = Duration::try_from_secs_f64(seconds).ok()?;
    (!timeout.is_zero() && timeout <= PROTOCOL_TIMEOUT_MAX).then_some(timeout)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "y" | "yes" | "true" | "1" => Some(true),
        "n" | "no" | "false" | "0" => Some(false),
        _ => None,
    }
}

fn default_value(name: &str, exe: &str) -> Option<String> {
    let value = match name {
        "process-max" => "1",
        "protocol-timeout" => "1830",
        "log-level-file" => "info",
        "log-level-stderr" => "warn",
        "log-subprocess" => "n",
        "cmd-ssh" => "ssh",
        "host-key-check" => "y",
        "repo1-host-user" => "pgvault",
        "repo1-cipher-type" => "none",
        "repo1-host-cmd" => exe,
        _ => match indexed_suffix(name, "pg") {
            Some("host-user") => "postgres",
            Some("host-cmd") => exe,
            _ => return None,
        },
    };

    Some(value.to_string())
}

/// Split `pg3-port` into index 3 and `port`
pub fn indexed<'a>(name: &'a str, prefix: &str) -> Option<(usize, &'a str)> {
    let rest = name.strip_prefix(prefix)?;
    let (index, suffix) = rest.split_once('-')?;
    if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((index.parse().ok()?, suffix))
}

fn indexed_suffix<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    indexed(name, prefix)
        .filter(|(index, _)| (1..=PG_INDEX_MAX).contains(index))
        .map(|(_, suffix)| suffix)
}
