#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{bail, Context, Result};
use pgvault::config::{Config, ConfigHandler, PG_INDEX_MAX};
use pgvault::logging;
use pgvault::protocol::{
    HandleRead, ProtocolHelper, ProtocolServer, StorageType, PROJECT_NAME, PROJECT_VERSION, SERVICE_LOCAL,
    SERVICE_REMOTE,
};
use std::env;
use std::io;
use std::os::fd::AsFd;
use tracing::{debug, info};

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let mut args: Vec<String> = env::args().collect();

    // Executor processes are spawned from the resolved path, not argv[0]
    if let (Some(first), Ok(exe)) = (args.first_mut(), env::current_exe()) {
        *first = exe.to_string_lossy().into_owned();
    }

    let mut config = Config::from_args(&args)?;

    match config.command() {
        "version" => {
            println!("{PROJECT_NAME} {PROJECT_VERSION}");
            return Ok(0);
        }
        "" | "help" => {
            print_help();
            return Ok(0);
        }
        _ => {}
    }

    config.load_file()?;
    logging::init(&config)?;

    match config.command() {
        SERVICE_LOCAL | SERVICE_REMOTE => serve(config),
        "ping" => ping(config),
        other => bail!("invalid command '{other}'"),
    }
}

/// Run an executor: a protocol server over stdin/stdout
fn serve(config: Config) -> Result<i32> {
    let service = config.command().to_string();
    let name = format!(
        "{service}-{} server",
        config.value("process").unwrap_or("0")
    );

    let stdin = io::stdin()
        .as_fd()
        .try_clone_to_owned()
        .context("unable to duplicate stdin")?;
    let read = HandleRead::new(format!("{name} read"), stdin, config.protocol_timeout());

    let mut server = ProtocolServer::new(name.clone(), service, Box::new(read), Box::new(io::stdout()))?;
    server.handler_add(ConfigHandler::new(config));

    debug!(server = %name, "serving");
    server.process()?;
    debug!(server = %name, "exit");

    Ok(0)
}

/// Round trip a `noop` to every configured remote
fn ping(config: Config) -> Result<i32> {
    let mut targets = Vec::new();
    if !config.repo_is_local() {
        targets.push((StorageType::Repo, 1));
    }
    for host_id in 1..=PG_INDEX_MAX {
        if !config.pg_is_local(host_id) {
            targets.push((StorageType::Pg, host_id));
        }
    }

    if targets.is_empty() {
        println!("no remote hosts configured");
        return Ok(0);
    }

    let mut helper = ProtocolHelper::new(config);
    let mut failed = 0;

    for (storage, host_id) in targets {
        let label = match storage {
            StorageType::Repo => "repo1".to_string(),
            StorageType::Pg => format!("pg{host_id}"),
        };

        match helper.remote_get(storage, host_id).and_then(|client| client.noop()) {
            Ok(()) => {
                info!(remote = %label, "ping ok");
                println!("{label}: ok");
            }
            Err(e) => {
                failed += 1;
                println!("{label}: [{}] {e}", e.kind());
            }
        }
    }

    helper.free();
    Ok(if failed == 0 { 0 } else { 1 })
}

fn print_help() {
    println!("{PROJECT_NAME} {PROJECT_VERSION} - parallel backup protocol executor");
    println!();
    println!("Usage: pgvault [--option=value ...] <command>");
    println!();
    println!("Commands:");
    println!("  ping      check every configured remote host");
    println!("  local     run as a local executor over stdin/stdout");
    println!("  remote    run as a remote executor over stdin/stdout");
    println!("  version   print the version");
    println!("  help      print this help");
    println!();
    println!("Common options:");
    println!("  --stanza=<name>             stanza to operate on");
    println!("  --config=<file>             config file (default /etc/pgvault/pgvault.conf)");
    println!("  --process-max=<n>           local executor processes (default 1)");
    println!("  --protocol-timeout=<secs>   protocol read timeout (default 1830)");
    println!("  --log-level-stderr=<level>  off, error, warn, info, detail, debug, trace");
    println!("  --log-level-file=<level>    level for <log-path>/<stanza>-<command>.log");
    println!("  --repo1-host=<host>         repository host reached over ssh");
    println!("  --pg<n>-host=<host>         database host reached over ssh");
}
