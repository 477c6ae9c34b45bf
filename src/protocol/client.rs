//! Client half of a protocol session
//!
//! A client owns the read and write streams to one server. The server's
//! greeting is read and checked before the first command goes out, and only
//! one command is in flight at a time: every command written is answered by
//! exactly one result or error line.

use crate::error::{ProtocolError, Result};
use crate::protocol::command::ProtocolCommand;
use crate::protocol::io::LineRead;
use crate::protocol::wire::{self, Response, NO_DETAILS, NO_STACK_TRACE};
use crate::protocol::{COMMAND_EXIT, COMMAND_NOOP, PROJECT_NAME, PROJECT_VERSION};
use serde_json::{Map, Value};
use std::io::{self, Write};
use std::os::fd::BorrowedFd;
use std::time::Duration;
use tracing::{debug, trace};

pub struct ProtocolClient {
    name: String,
    service: String,
    read: Option<Box<dyn LineRead>>,
    write: Option<Box<dyn Write>>,
    verified: bool,
}

impl ProtocolClient {
    /// Wrap a pair of streams without reading the greeting yet
    ///
    /// The greeting is checked by [`open`](Self::open), which every command
    /// path calls first.
    pub fn new(
        name: impl Into<String>,
        service: impl Into<String>,
        read: Box<dyn LineRead>,
        write: Box<dyn Write>,
    ) -> Self {
        Self {
            name: name.into(),
            service: service.into(),
            read: Some(read),
            write: Some(write),
            verified: false,
        }
    }

    /// Wrap a pair of streams and check the greeting immediately
    pub fn connect(
        name: impl Into<String>,
        service: impl Into<String>,
        read: Box<dyn LineRead>,
        write: Box<dyn Write>,
    ) -> Result<Self> {
        let mut client = Self::new(name, service, read, write);
        client.open()?;
        Ok(client)
    }

    /// Read and check the server greeting if that has not happened yet
    ///
    /// Keys are checked in order: `name`, `service`, `version`. A line that
    /// is not a JSON object fails as a format error, not a handshake error.
    pub fn open(&mut self) -> Result<()> {
        if self.verified {
            return Ok(());
        }

        let line = self.reader()?.read_line()?;
        let greeting = wire::decode_object(&line)?;

        greeting_check(&greeting, "name", PROJECT_NAME)?;
        greeting_check(&greeting, "service", &self.service)?;
        greeting_check(&greeting, "version", PROJECT_VERSION)?;

        self.verified = true;
        debug!(client = %self.name, service = %self.service, "greeting verified");

        Ok(())
    }

    /// Send a command without waiting for its result
    pub fn write_command(&mut self, command: &ProtocolCommand) -> Result<()> {
        self.open()?;

        let line = command.to_json();
        let name = &self.name;
        let writer = self.write.as_mut().ok_or_else(|| closed_error(name))?;

        wire::write_line(writer.as_mut(), &line)
            .map_err(|e| ProtocolError::io(format!("unable to write to '{}'", self.name), e))?;
        debug!(client = %self.name, %command, "command sent");

        Ok(())
    }

    /// Read the single result or error line answering the last command
    ///
    /// With `output_required` the result must carry `out`; without it the
    /// result must not.
    pub fn read_output(&mut self, output_required: bool) -> Result<Option<Value>> {
        let line = self.reader()?.read_line()?;
        trace!(client = %self.name, %line, "response received");

        match wire::decode_response(&line)? {
            Response::Error {
                code,
                message,
                stack,
            } => {
                let error = ProtocolError::Remote {
                    client: self.name.clone(),
                    code,
                    message: message.unwrap_or_else(|| NO_DETAILS.to_string()),
                    stack: stack.unwrap_or_else(|| NO_STACK_TRACE.to_string()),
                };
                debug!(client = %self.name, code, stack = error.stack().unwrap_or_default(), "remote error");
                Err(error)
            }
            Response::Output(None) if output_required => Err(ProtocolError::OutputRequired),
            Response::Output(Some(_)) if !output_required => Err(ProtocolError::OutputNotRequired),
            Response::Output(out) => Ok(out),
        }
    }

    /// Read a raw line streamed by a handler after its response
    pub fn read_line(&mut self) -> Result<String> {
        self.reader()?.read_line()
    }

    /// Send a command and wait for its result
    pub fn execute(&mut self, command: &ProtocolCommand, output_required: bool) -> Result<Option<Value>> {
        self.write_command(command)?;
        self.read_output(output_required)
    }

    /// Round trip without side effects, used for keep-alive
    pub fn noop(&mut self) -> Result<()> {
        self.execute(&ProtocolCommand::new(COMMAND_NOOP), false)
            .map(|_| ())
    }

    /// Send `exit` (best effort) and release both streams
    ///
    /// Closing an already closed client does nothing.
    pub fn close(&mut self) {
        if let Some(mut writer) = self.write.take() {
            let exit = ProtocolCommand::new(COMMAND_EXIT).to_json();
            if let Err(e) = wire::write_line(writer.as_mut(), &exit) {
                debug!(client = %self.name, error = %e, "unable to send exit");
            }
        }
        self.read = None;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn is_open(&self) -> bool {
        self.read.is_some() && self.write.is_some()
    }

    /// Pollable read descriptor, `None` for in-memory or closed clients
    pub fn read_handle(&self) -> Option<BorrowedFd<'_>> {
        self.read.as_ref().and_then(|read| read.handle())
    }

    /// True when a response is already buffered and can be read without waiting
    pub fn read_buffered(&self) -> bool {
        self.read.as_ref().is_some_and(|read| read.buffered())
    }

    /// Longest wait for one response, `None` for in-memory or closed clients
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read.as_ref().and_then(|read| read.read_timeout())
    }

    fn reader(&mut self) -> Result<&mut Box<dyn LineRead>> {
        let name = &self.name;
        self.read.as_mut().ok_or_else(|| closed_error(name))
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn greeting_check(greeting: &Map<String, Value>, key: &str, expected: &str) -> Result<()> {
    match greeting.get(key) {
        None | Some(Value::Null) => Err(ProtocolError::Handshake(format!(
            "unable to find greeting key '{key}'"
        ))),
        Some(Value::String(value)) if value == expected => Ok(()),
        Some(Value::String(value)) => Err(ProtocolError::Handshake(format!(
            "expected value '{expected}' for greeting key '{key}' but got '{value}'"
        ))),
        Some(_) => Err(ProtocolError::Handshake(format!(
            "greeting key '{key}' must be string type"
        ))),
    }
}

fn closed_error(name: &str) -> ProtocolError {
    ProtocolError::io(
        format!("client '{name}' is closed"),
        io::Error::new(io::ErrorKind::BrokenPipe, "session closed"),
    )
}
