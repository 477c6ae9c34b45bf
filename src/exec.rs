//! Spawned executor processes
//!
//! An [`Exec`] owns a child process started with piped stdio. Its stdout and
//! stdin are handed to a protocol client; stderr is drained on a background
//! thread so the child never blocks on a full pipe and so the text can be
//! reported if the child dies. A read that fails because the child went away
//! is reported as a process error carrying the exit status and stderr.

use crate::error::{ProtocolError, Result};
use crate::protocol::io::deadline_after;
use crate::protocol::{HandleRead, LineRead};
use std::io::{self, BufRead, BufReader};
use std::os::fd::BorrowedFd;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long a failed read waits for the child to finish exiting
const EXIT_GRACE: Duration = Duration::from_millis(500);

const EXIT_POLL: Duration = Duration::from_millis(10);

struct Shared {
    child: Mutex<Child>,
    stderr: Mutex<String>,
    stderr_done: AtomicBool,
}

impl Shared {
    fn child(&self) -> MutexGuard<'_, Child> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait up to `grace` for the child to exit
    fn exit_status(&self, grace: Duration) -> io::Result<Option<ExitStatus>> {
        let deadline = deadline_after(grace);
        loop {
            if let Some(status) = self.child().try_wait()? {
                return Ok(Some(status));
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Ok(None);
            }
            thread::sleep(EXIT_POLL);
        }
    }

    /// Captured stderr, after giving the reader thread a moment to drain it
    fn stderr_text(&self) -> String {
        let deadline = Instant::now() + EXIT_GRACE;
        while !self.stderr_done.load(Ordering::Acquire) && Instant::now() < deadline {
            thread::sleep(EXIT_POLL);
        }
        self.stderr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct Exec {
    name: String,
    program: String,
    timeout: Duration,
    shared: Arc<Shared>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr_reader: Option<JoinHandle<()>>,
    freed: bool,
}

impl Exec {
    /// Start `program` with piped stdio
    ///
    /// `name` labels the process in errors; `timeout` bounds reads from its
    /// stdout and the wait for it to exit in [`free`](Self::free).
    pub fn spawn(program: &str, args: &[String], name: impl Into<String>, timeout: Duration) -> Result<Self> {
        let name = name.into();

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ProtocolError::Execute {
                program: program.to_string(),
                source,
            })?;
        debug!(process = %name, program, pid = child.id(), args = ?args, "process started");

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let shared = Arc::new(Shared {
            child: Mutex::new(child),
            stderr: Mutex::new(String::new()),
            stderr_done: AtomicBool::new(false),
        });

        let stderr_reader = stderr.map(|stderr| {
            let shared = Arc::clone(&shared);
            thread::spawn(move || drain_stderr(stderr, &shared))
        });

        Ok(Self {
            name,
            program: program.to_string(),
            timeout,
            shared,
            stdin,
            stdout,
            stderr_reader,
            freed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn pid(&self) -> u32 {
        self.shared.child().id()
    }

    /// Hand out the read and write sides; only possible once
    pub fn io(&mut self) -> Result<(ExecRead, ChildStdin)> {
        match (self.stdout.take(), self.stdin.take()) {
            (Some(stdout), Some(stdin)) => Ok((
                ExecRead {
                    name: self.name.clone(),
                    read: HandleRead::new(self.name.clone(), stdout, self.timeout),
                    shared: Arc::clone(&self.shared),
                },
                stdin,
            )),
            _ => Err(ProtocolError::io(
                format!("io for '{}' was already taken", self.name),
                io::Error::new(io::ErrorKind::BrokenPipe, "stdio not available"),
            )),
        }
    }

    /// Wait for the process to exit, killing it once the timeout passes
    ///
    /// The caller is expected to have closed the write side (or sent `exit`)
    /// first. Freeing twice does nothing.
    pub fn free(&mut self) -> Result<()> {
        if self.freed {
            return Ok(());
        }
        self.freed = true;

        self.stdin = None;
        self.stdout = None;

        let status = self
            .shared
            .exit_status(self.timeout)
            .map_err(|e| ProtocolError::io(format!("unable to wait for '{}'", self.name), e))?;

        match status {
            Some(status) => debug!(process = %self.name, %status, "process exited"),
            None => {
                warn!(process = %self.name, timeout = ?self.timeout, "process did not exit, killing");
                let mut child = self.shared.child();
                child
                    .kill()
                    .and_then(|()| child.wait())
                    .map_err(|e| ProtocolError::io(format!("unable to kill '{}'", self.name), e))?;
            }
        }

        if let Some(reader) = self.stderr_reader.take() {
            if reader.is_finished() {
                let _ = reader.join();
            }
        }

        Ok(())
    }
}

impl Drop for Exec {
    fn drop(&mut self) {
        if let Err(e) = self.free() {
            warn!(process = %self.name, error = %e, "unable to free process");
        }
    }
}

fn drain_stderr(stderr: ChildStderr, shared: &Shared) {
    let mut reader = BufReader::new(stderr);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => shared
                .stderr
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_str(&line),
        }
    }
    shared.stderr_done.store(true, Ordering::Release);
}

/// Read side of an [`Exec`]
pub struct ExecRead {
    name: String,
    read: HandleRead,
    shared: Arc<Shared>,
}

impl ExecRead {
    /// Replace a read failure with a process error when the child has exited
    fn check(&self, error: ProtocolError) -> ProtocolError {
        let grace = match error {
            ProtocolError::Eof(_) | ProtocolError::Io { .. } => EXIT_GRACE,
            ProtocolError::Timeout { .. } => Duration::ZERO,
            _ => return error,
        };

        match self.shared.exit_status(grace) {
            Ok(Some(status)) => ProtocolError::Process {
                name: self.name.clone(),
                status: status.to_string(),
                stderr: self.shared.stderr_text(),
            },
            Ok(None) | Err(_) => error,
        }
    }
}

impl LineRead for ExecRead {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_line(&mut self) -> Result<String> {
        self.read.read_line().map_err(|error| self.check(error))
    }

    fn handle(&self) -> Option<BorrowedFd<'_>> {
        self.read.handle()
    }

    fn buffered(&self) -> bool {
        self.read.buffered()
    }

    fn read_timeout(&self) -> Option<Duration> {
        self.read.read_timeout()
    }
}
