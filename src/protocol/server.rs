//! Server half of a protocol session
//!
//! The server writes its greeting as soon as it is created, then
//! [`ProtocolServer::process`] reads commands until `exit`. Commands other
//! than `noop` and `exit` are offered to the registered handlers in order;
//! the first one that recognizes the command answers it. A handler error is
//! sent back as an error reply and the loop keeps going. Only `exit` or a
//! transport failure ends it.

use crate::error::{ErrorKind, ProtocolError, Result};
use crate::protocol::io::LineRead;
use crate::protocol::wire::{self, Greeting};
use crate::protocol::{COMMAND_EXIT, COMMAND_NOOP, PROJECT_NAME, PROJECT_VERSION};
use serde_json::Value;
use std::io::Write;
use tracing::{debug, warn};

/// Services commands a server receives
///
/// Returns `Ok(true)` when the command was recognized and fully answered
/// through `server` (including any extra lines), `Ok(false)` to let the next
/// handler try.
pub trait ProtocolHandler {
    fn handle(&mut self, command: &str, params: &[Value], server: &mut ServerIo) -> anyhow::Result<bool>;
}

impl<F> ProtocolHandler for F
where
    F: FnMut(&str, &[Value], &mut ServerIo) -> anyhow::Result<bool>,
{
    fn handle(&mut self, command: &str, params: &[Value], server: &mut ServerIo) -> anyhow::Result<bool> {
        self(command, params, server)
    }
}

/// The server's streams as seen by handlers
pub struct ServerIo {
    name: String,
    read: Box<dyn LineRead>,
    write: Box<dyn Write>,
}

impl ServerIo {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Answer the current command with `{}` or `{"out":...}`
    pub fn response(&mut self, out: Option<Value>) -> Result<()> {
        let line = wire::encode_output(out.as_ref())?;
        self.write_line(&line)
    }

    /// Write a raw line, used by handlers that stream extra output after their response
    pub fn write_line(&mut self, line: &str) -> Result<()> {
        wire::write_line(self.write.as_mut(), line)
            .map_err(|e| ProtocolError::io(format!("unable to write to '{}'", self.name), e))
    }

    /// Read a raw line, used by handlers that accept streamed input
    pub fn read_line(&mut self) -> Result<String> {
        self.read.read_line()
    }

    fn error(&mut self, error: &anyhow::Error) -> Result<()> {
        let (code, stack) = match error.downcast_ref::<ProtocolError>() {
            Some(protocol) => (protocol.code(), protocol.stack().map(str::to_string)),
            None => (ErrorKind::Runtime.code(), None),
        };

        let causes: Vec<String> = error.chain().skip(1).map(|cause| format!("caused by: {cause}")).collect();
        let stack = match (stack, causes.is_empty()) {
            (Some(stack), true) => Some(stack),
            (Some(stack), false) => Some(format!("{}\n{stack}", causes.join("\n"))),
            (None, false) => Some(causes.join("\n")),
            (None, true) => None,
        };

        let line = wire::encode_error(code, &error.to_string(), stack.as_deref())?;
        self.write_line(&line)
    }
}

pub struct ProtocolServer {
    io: ServerIo,
    handlers: Vec<Box<dyn ProtocolHandler>>,
}

impl ProtocolServer {
    /// Create the server and send the greeting
    pub fn new(
        name: impl Into<String>,
        service: impl Into<String>,
        read: Box<dyn LineRead>,
        write: Box<dyn Write>,
    ) -> Result<Self> {
        let mut io = ServerIo {
            name: name.into(),
            read,
            write,
        };

        let greeting = Greeting::new(PROJECT_NAME, service, PROJECT_VERSION);
        io.write_line(&wire::encode(&greeting)?)?;
        debug!(server = %io.name, service = %greeting.service, "greeting sent");

        Ok(Self {
            io,
            handlers: Vec::new(),
        })
    }

    /// Register a handler; handlers are tried in registration order
    pub fn handler_add(&mut self, handler: impl ProtocolHandler + 'static) {
        self.handlers.push(Box::new(handler));
    }

    /// Run the command loop until `exit`
    ///
    /// Returns an error only when the transport fails.
    pub fn process(&mut self) -> Result<()> {
        loop {
            let line = self.io.read_line()?;

            match self.dispatch(&line) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(server = %self.io.name, "exit received");
                    return Ok(());
                }
                Err(error) => {
                    warn!(server = %self.io.name, error = %error, "command failed");
                    self.io.error(&error)?;
                }
            }
        }
    }

    /// Service one command line; `Ok(false)` means the loop should end
    fn dispatch(&mut self, line: &str) -> anyhow::Result<bool> {
        let command = wire::decode_command(line)?;
        debug!(server = %self.io.name, %command, "command received");

        match command.name() {
            COMMAND_EXIT => return Ok(false),
            COMMAND_NOOP => {
                self.io.response(None)?;
                return Ok(true);
            }
            _ => {}
        }

        for handler in self.handlers.iter_mut() {
            if handler.handle(command.name(), command.params(), &mut self.io)? {
                return Ok(true);
            }
        }

        Err(ProtocolError::InvalidCommand(command.name().to_string()).into())
    }

    pub fn io(&mut self) -> &mut ServerIo {
        &mut self.io
    }
}
