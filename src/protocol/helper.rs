//! Lazily spawned local and remote executor sessions
//!
//! The helper owns the config for one run and two caches of clients: local
//! executors (a re-exec of this binary, one per process slot) and remote
//! executors (this binary on another host, started through ssh, one per
//! host). A client is spawned on first request and reused afterwards until
//! [`ProtocolHelper::free`] shuts everything down.

use crate::config::{indexed, Config, OptionSource, OptionValue, PG_INDEX_MAX};
use crate::error::{ErrorKind, ProtocolError, Result};
use crate::exec::Exec;
use crate::protocol::client::ProtocolClient;
use crate::protocol::command::ProtocolCommand;
use crate::protocol::{SERVICE_LOCAL, SERVICE_REMOTE};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

/// Cipher type meaning the repository is not encrypted
pub const CIPHER_TYPE_NONE: &str = "none";

/// Which kind of storage a session serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Repo,
    Pg,
}

impl StorageType {
    /// Option name for host `host_id` (1-based), e.g. `pg2-host-user`
    fn option(self, host_id: usize, suffix: &str) -> String {
        match self {
            StorageType::Repo => format!("repo1-{suffix}"),
            StorageType::Pg => format!("pg{host_id}-{suffix}"),
        }
    }

    /// Value of the `type` option on the spawned process
    fn type_name(self) -> &'static str {
        match self {
            StorageType::Repo => "backup",
            StorageType::Pg => "db",
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StorageType::Repo => "repo",
            StorageType::Pg => "pg",
        })
    }
}

/// A cached client and the process behind it
///
/// Field order matters: the client is dropped (sending `exit`) before the
/// process is freed.
struct HelperClient {
    client: ProtocolClient,
    exec: Exec,
    storage: StorageType,
}

impl HelperClient {
    fn spawn(
        storage: StorageType,
        program: &str,
        params: &[String],
        process_name: String,
        client_name: String,
        service: &str,
        config: &Config,
    ) -> Result<Self> {
        let mut exec = Exec::spawn(program, params, process_name, config.protocol_timeout())?;
        let (read, write) = exec.io()?;
        let client = ProtocolClient::new(client_name, service, Box::new(read), Box::new(write));

        Ok(Self { client, exec, storage })
    }

    fn free(mut self) {
        self.client.close();
        if let Err(e) = self.exec.free() {
            warn!(process = %self.exec.name(), error = %e, "unable to free process");
        }
    }
}

pub struct ProtocolHelper {
    config: Config,
    local: Vec<Option<HelperClient>>,
    remote: Vec<Option<HelperClient>>,
}

impl ProtocolHelper {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            local: Vec::new(),
            remote: Vec::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Command line for local process `process_id` serving `storage`
    pub fn local_param(&self, storage: StorageType, process_id: usize) -> Vec<String> {
        let config = &self.config;
        let mut replace = BTreeMap::new();

        replace.insert("command".to_string(), Some(config.command().to_string()));
        replace.insert("process".to_string(), Some(process_id.to_string()));
        replace.insert("host-id".to_string(), Some("1".to_string()));
        replace.insert("type".to_string(), Some(storage.type_name().to_string()));
        replace.insert("log-level-file".to_string(), Some(subprocess_log_level(config)));
        replace.insert("log-level-stderr".to_string(), Some("error".to_string()));

        config.exec_params(SERVICE_LOCAL, &replace)
    }

    /// ssh arguments for the remote serving `storage` on host `host_id` (1-based)
    ///
    /// The last argument is the complete remote command line. Options that
    /// only make sense on this host are dropped, and the selected pg host is
    /// renumbered to `pg1` because the remote only sees one.
    pub fn remote_param(&self, storage: StorageType, process_id: usize, host_id: usize) -> Vec<String> {
        let config = &self.config;
        let option = |suffix: &str| storage.option(host_id, suffix);

        let mut params: Vec<String> = ["-o", "LogLevel=error", "-o", "Compression=no", "-o", "PasswordAuthentication=no"]
            .into_iter()
            .map(str::to_string)
            .collect();

        if !config.host_key_check() {
            params.push("-o".to_string());
            params.push("StrictHostKeyChecking=no".to_string());
        }

        if let Some(port) = config.value(&option("host-port")) {
            params.push("-p".to_string());
            params.push(port.to_string());
        }

        params.push(format!(
            "{}@{}",
            config.value_or_default(&option("host-user")).unwrap_or_default(),
            config.value(&option("host")).unwrap_or_default()
        ));

        let mut replace: BTreeMap<String, Option<String>> = BTreeMap::new();

        // Never forward local config locations, only the host's own
        for name in ["config", "config-include-path", "config-path"] {
            let host_option = option(&format!("host-{name}"));
            replace.insert(name.to_string(), config.value(&host_option).map(str::to_string));
        }

        for name in config.names() {
            match indexed(name, "pg").or_else(|| indexed(name, "repo")) {
                Some((_, suffix)) if suffix.starts_with("host") => {
                    replace.insert(name.to_string(), None);
                }
                Some((index, _)) if name.starts_with("pg") && index > 1 => {
                    replace.insert(name.to_string(), None);
                }
                _ => {}
            }
        }

        if storage == StorageType::Pg && host_id > 1 {
            for suffix in ["path", "port", "socket-path"] {
                let value = config.value(&format!("pg{host_id}-{suffix}")).map(str::to_string);
                replace.insert(format!("pg1-{suffix}"), value);
            }
        }

        if !config.is_set("command") {
            replace.insert("command".to_string(), Some(config.command().to_string()));
        }
        if !config.is_set("process") {
            replace.insert("process".to_string(), Some(process_id.to_string()));
        }

        for name in ["cmd-ssh", "log-path", "lock-path", "host-id"] {
            replace.insert(name.to_string(), None);
        }
        replace.insert("log-level-file".to_string(), Some(subprocess_log_level(config)));
        replace.insert("log-level-stderr".to_string(), Some("error".to_string()));
        replace.insert("type".to_string(), Some(storage.type_name().to_string()));

        let mut command = vec![config
            .value_or_default(&option("host-cmd"))
            .unwrap_or_else(|| config.exe().to_string())];
        command.extend(config.exec_params(SERVICE_REMOTE, &replace));
        let command: Vec<Cow<'_, str>> = command.iter().map(|arg| shell_quote(arg)).collect();
        params.push(command.join(" "));

        params
    }

    /// Client for local process `process_id` (1-based), spawned on first use
    ///
    /// # Panics
    ///
    /// `process_id` must be within `1..=process-max`, and a process already
    /// started for one storage type cannot be requested for the other.
    pub fn local_get(&mut self, storage: StorageType, process_id: usize) -> Result<&mut ProtocolClient> {
        self.local_alloc();
        assert!(
            (1..=self.local.len()).contains(&process_id),
            "local process id {process_id} is not in 1..={}",
            self.local.len()
        );

        let index = process_id - 1;
        if let Some(entry) = &self.local[index] {
            assert!(
                entry.storage == storage,
                "local process id {process_id} serves {}, not {storage}",
                entry.storage
            );
        }

        let entry = match self.local[index].take() {
            Some(entry) => entry,
            None => {
                debug!(%storage, process_id, "spawning local");
                HelperClient::spawn(
                    storage,
                    self.config.exe(),
                    &self.local_param(storage, process_id),
                    format!("{SERVICE_LOCAL}-{process_id} process"),
                    format!("{SERVICE_LOCAL}-{process_id} protocol"),
                    SERVICE_LOCAL,
                    &self.config,
                )?
            }
        };

        Ok(&mut self.local[index].insert(entry).client)
    }

    /// Clients for local processes `1..=count`, spawning any that are missing
    ///
    /// Handy for filling a [`ProtocolParallel`](crate::protocol::ProtocolParallel) pool.
    pub fn local_pool(&mut self, storage: StorageType, count: usize) -> Result<Vec<&mut ProtocolClient>> {
        for process_id in 1..=count {
            self.local_get(storage, process_id)?;
        }

        Ok(self
            .local
            .iter_mut()
            .take(count)
            .filter_map(|entry| entry.as_mut().map(|entry| &mut entry.client))
            .collect())
    }

    /// Client for the remote serving `storage` on host `host_id` (1-based)
    ///
    /// On the first repository connection, when no cipher is configured
    /// locally, the remote's cipher settings are adopted for the rest of the
    /// run.
    ///
    /// # Panics
    ///
    /// `host_id` must be 1 for the repository and within `1..=PG_INDEX_MAX`
    /// for pg hosts.
    pub fn remote_get(&mut self, storage: StorageType, host_id: usize) -> Result<&mut ProtocolClient> {
        self.remote_alloc();

        // Slot 0 is the repository, slots 1.. are pg hosts
        let index = match storage {
            StorageType::Repo => {
                assert!(host_id == 1, "repo host id {host_id} is not 1");
                0
            }
            StorageType::Pg => {
                assert!(
                    (1..=PG_INDEX_MAX).contains(&host_id),
                    "pg host id {host_id} is not in 1..={PG_INDEX_MAX}"
                );
                host_id
            }
        };
        let entry = match self.remote[index].take() {
            Some(entry) => entry,
            None => self.remote_spawn(storage, host_id)?,
        };

        Ok(&mut self.remote[index].insert(entry).client)
    }

    fn remote_spawn(&mut self, storage: StorageType, host_id: usize) -> Result<HelperClient> {
        let host_option = storage.option(host_id, "host");
        let Some(host) = self.config.value(&host_option).map(str::to_string) else {
            return Err(ProtocolError::raised(
                ErrorKind::HostInvalid,
                format!("option '{host_option}' is required to reach a {storage} remote"),
            ));
        };

        // The remote process id follows ours so logs on both sides line up
        let process_id = self
            .config
            .value("process")
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);

        debug!(%storage, host_id, %host, process_id, "spawning remote");
        let mut entry = HelperClient::spawn(
            storage,
            self.config.cmd_ssh(),
            &self.remote_param(storage, process_id, host_id),
            format!("{SERVICE_REMOTE}-{process_id} process on '{host}'"),
            format!("{SERVICE_REMOTE}-{process_id} protocol on '{host}'"),
            SERVICE_REMOTE,
            &self.config,
        )?;

        if storage == StorageType::Repo
            && self.config.value_or_default("repo1-cipher-type").as_deref() == Some(CIPHER_TYPE_NONE)
        {
            // On failure the entry is dropped here and never cached
            self.cipher_adopt(&mut entry.client)?;
        }

        Ok(entry)
    }

    fn cipher_adopt(&mut self, client: &mut ProtocolClient) -> Result<()> {
        let command = ProtocolCommand::new("option")
            .param("repo1-cipher-type")
            .param("repo1-cipher-pass");
        let output = client.execute(&command, true)?;

        let values = match output {
            Some(Value::Array(values)) => values,
            other => {
                return Err(ProtocolError::raised(
                    ErrorKind::Format,
                    format!("expected option list from '{}' but got {}", client.name(), other.unwrap_or_default()),
                ))
            }
        };

        let cipher_type = values.first().and_then(Value::as_str);
        let cipher_pass = values.get(1).and_then(Value::as_str);

        if let Some(cipher_type) = cipher_type.filter(|cipher_type| *cipher_type != CIPHER_TYPE_NONE) {
            info!(client = %client.name(), cipher_type, "adopting repository cipher from remote");
            self.config.set(
                "repo1-cipher-type",
                OptionValue::Value(cipher_type.to_string()),
                OptionSource::Config,
            );
            if let Some(cipher_pass) = cipher_pass {
                self.config.set(
                    "repo1-cipher-pass",
                    OptionValue::Value(cipher_pass.to_string()),
                    OptionSource::Config,
                );
            }
        }

        Ok(())
    }

    /// Send `noop` to every remote that exists, so idle connections are not dropped
    pub fn keep_alive(&mut self) -> Result<()> {
        for entry in self.remote.iter_mut().flatten() {
            entry.client.noop()?;
        }
        Ok(())
    }

    /// Close every client and reap its process, remotes first
    pub fn free(&mut self) {
        for entry in self.remote.iter_mut().chain(self.local.iter_mut()) {
            if let Some(entry) = entry.take() {
                debug!(client = %entry.client.name(), "freeing");
                entry.free();
            }
        }
    }

    fn local_alloc(&mut self) {
        if self.local.is_empty() {
            self.local.resize_with(self.config.process_max(), || None);
        }
    }

    fn remote_alloc(&mut self) {
        if self.remote.is_empty() {
            self.remote.resize_with(PG_INDEX_MAX + 1, || None);
        }
    }
}

impl Drop for ProtocolHelper {
    fn drop(&mut self) {
        self.free();
    }
}

/// Quote `arg` for a POSIX shell when it holds anything but plain word characters
///
/// ssh hands the remote command line to the remote user's shell.
fn shell_quote(arg: &str) -> Cow<'_, str> {
    let plain = |c: char| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c);
    if !arg.is_empty() && arg.chars().all(plain) {
        return Cow::Borrowed(arg);
    }
    Cow::Owned(format!("'{}'", arg.replace('\'', "'\\''")))
}

/// File logging on a child only when requested
fn subprocess_log_level(config: &Config) -> String {
    if config.log_subprocess() {
        config.log_level_file().to_string()
    } else {
        "off".to_string()
    }
}
