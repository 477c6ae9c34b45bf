//! Error types for the pgvault protocol core
//!
//! Every error that can cross a protocol session carries a numeric code.
//! Codes are stable because they travel on the wire in `{"err":<code>}`
//! replies and are reconstructed on the far side.

use std::fmt;
use std::io;
use thiserror::Error;

/// Error class with a stable numeric code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Assert,
    Format,
    FileRead,
    Protocol,
    ProtocolOutputRequired,
    HostInvalid,
    JsonFormat,
    Execute,
    Runtime,
    Unknown,
}

impl ErrorKind {
    const ALL: [ErrorKind; 10] = [
        ErrorKind::Assert,
        ErrorKind::Format,
        ErrorKind::FileRead,
        ErrorKind::Protocol,
        ErrorKind::ProtocolOutputRequired,
        ErrorKind::HostInvalid,
        ErrorKind::JsonFormat,
        ErrorKind::Execute,
        ErrorKind::Runtime,
        ErrorKind::Unknown,
    ];

    /// Numeric code sent on the wire
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::Assert => 25,
            ErrorKind::Format => 29,
            ErrorKind::Protocol => 39,
            ErrorKind::FileRead => 42,
            ErrorKind::ProtocolOutputRequired => 62,
            ErrorKind::HostInvalid => 72,
            ErrorKind::JsonFormat => 95,
            ErrorKind::Execute => 103,
            ErrorKind::Runtime => 122,
            ErrorKind::Unknown => 125,
        }
    }

    /// Map a wire code back to its class. Codes outside the table are `Unknown`.
    pub fn from_code(code: i32) -> Self {
        Self::ALL
            .into_iter()
            .find(|kind| kind.code() == code)
            .unwrap_or(ErrorKind::Unknown)
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Assert => "AssertError",
            ErrorKind::Format => "FormatError",
            ErrorKind::FileRead => "FileReadError",
            ErrorKind::Protocol => "ProtocolError",
            ErrorKind::ProtocolOutputRequired => "ProtocolOutputRequiredError",
            ErrorKind::HostInvalid => "HostInvalidError",
            ErrorKind::JsonFormat => "JsonFormatError",
            ErrorKind::Execute => "ExecuteError",
            ErrorKind::Runtime => "RuntimeError",
            ErrorKind::Unknown => "UnknownError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors raised by the protocol core
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A line that is not well-formed JSON or not the expected message shape
    #[error("unable to parse '{line}': {reason}")]
    Format { line: String, reason: String },

    /// Greeting mismatch or missing greeting key
    #[error("{0}")]
    Handshake(String),

    /// The peer answered with `{"err":...}`
    #[error("raised from {client}: {message}")]
    Remote {
        client: String,
        code: i32,
        message: String,
        stack: String,
    },

    /// A spawned process went away while a read was outstanding
    #[error("{name} terminated unexpectedly [{status}]{}", stderr_suffix(.stderr))]
    Process {
        name: String,
        status: String,
        stderr: String,
    },

    /// No complete line arrived before the deadline
    #[error("timeout after {timeout_ms}ms waiting for read from '{name}'")]
    Timeout { name: String, timeout_ms: u128 },

    /// The process could not be started at all
    #[error("unable to execute '{program}': {source}")]
    Execute {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("unexpected eof reading from '{0}'")]
    Eof(String),

    #[error("no output required by command")]
    OutputNotRequired,

    #[error("output required by command")]
    OutputRequired,

    #[error("invalid command '{0}'")]
    InvalidCommand(String),

    /// An error raised with an explicit class, usually by a server handler
    #[error("{message}")]
    Raised { kind: ErrorKind, message: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {}", stderr.trim_end())
    }
}

impl ProtocolError {
    /// Shorthand for raising a classified error
    pub fn raised(kind: ErrorKind, message: impl Into<String>) -> Self {
        ProtocolError::Raised {
            kind,
            message: message.into(),
        }
    }

    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        ProtocolError::Io {
            context: context.into(),
            source,
        }
    }

    /// Numeric code for this error as sent on the wire
    pub fn code(&self) -> i32 {
        match self {
            ProtocolError::Remote { code, .. } => *code,
            other => other.kind().code(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::Format { .. } => ErrorKind::JsonFormat,
            ProtocolError::Handshake(_) | ProtocolError::InvalidCommand(_) => ErrorKind::Protocol,
            ProtocolError::Remote { code, .. } => ErrorKind::from_code(*code),
            ProtocolError::Process { .. } | ProtocolError::Execute { .. } => ErrorKind::Execute,
            ProtocolError::Timeout { .. } | ProtocolError::Eof(_) | ProtocolError::Io { .. } => {
                ErrorKind::FileRead
            }
            ProtocolError::OutputNotRequired => ErrorKind::Assert,
            ProtocolError::OutputRequired => ErrorKind::ProtocolOutputRequired,
            ProtocolError::Raised { kind, .. } => *kind,
        }
    }

    /// Stack text reported by the peer, when this error came from one
    pub fn stack(&self) -> Option<&str> {
        match self {
            ProtocolError::Remote { stack, .. } => Some(stack),
            _ => None,
        }
    }

    /// Framing and handshake failures leave the session unusable
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Format { .. } | ProtocolError::Handshake(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
