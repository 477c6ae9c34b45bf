//! pgvault protocol core
//!
//! Request/response sessions between a main process and the local or remote
//! executor processes it spawns:
//! - `wire`: one JSON object per line, greeting/command/result/error shapes
//! - `command`: the command value sent by a client
//! - `io`: line reads with deadlines over pollable handles
//! - `client`: greeting check and command execution
//! - `server`: greeting and the handler dispatch loop
//! - `parallel`: job dispatch over a fixed pool of clients
//! - `helper`: lazily spawned and cached local/remote clients

pub mod wire;
pub mod command;
pub mod io;
pub mod client;
pub mod server;
pub mod parallel;
pub mod helper;

pub use client::ProtocolClient;
pub use command::ProtocolCommand;
pub use helper::{ProtocolHelper, StorageType};
pub use io::{BufferRead, HandleRead, LineRead};
pub use parallel::{JobState, ProtocolParallel, ProtocolParallelJob};
pub use server::{ProtocolHandler, ProtocolServer, ServerIo};
pub use wire::{Greeting, Response};

/// Product name sent and checked in every greeting
pub const PROJECT_NAME: &str = "pgVault";

/// Build version sent and checked in every greeting
pub const PROJECT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Service name of sessions to local executor processes
pub const SERVICE_LOCAL: &str = "local";

/// Service name of sessions to remote executor processes
pub const SERVICE_REMOTE: &str = "remote";

pub const COMMAND_NOOP: &str = "noop";
pub const COMMAND_EXIT: &str = "exit";
