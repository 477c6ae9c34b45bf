//! Line-oriented reads with deadlines
//!
//! Every blocking read is bounded by a timeout. Handle-backed readers wait
//! with `poll(2)` before reading so a silent peer produces a timeout error
//! instead of hanging the caller. Bytes past the first newline stay buffered
//! in the reader, so readiness checks must consult [`LineRead::buffered`]
//! before polling the descriptor.

use crate::error::{ProtocolError, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::time::{Duration, Instant};

const READ_CHUNK: usize = 8192;

/// Source of protocol lines
pub trait LineRead {
    /// Name used in error messages
    fn name(&self) -> &str;

    /// Read one line without its terminator
    fn read_line(&mut self) -> Result<String>;

    /// Pollable descriptor, when the source has one
    fn handle(&self) -> Option<BorrowedFd<'_>>;

    /// True when bytes are already buffered and a read will not wait on the descriptor
    fn buffered(&self) -> bool;

    /// Longest wait for one line, `None` when reads never block
    fn read_timeout(&self) -> Option<Duration> {
        None
    }
}

/// Reader over a file descriptor (pipe, socket, child stdout)
pub struct HandleRead {
    name: String,
    file: File,
    timeout: Duration,
    buffer: Vec<u8>,
}

impl HandleRead {
    pub fn new(name: impl Into<String>, fd: impl Into<OwnedFd>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            file: File::from(fd.into()),
            timeout,
            buffer: Vec::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn take_line(&mut self) -> Option<Result<String>> {
        let position = self.buffer.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buffer.drain(..=position).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        Some(String::from_utf8(line).map_err(|e| ProtocolError::Format {
            line: String::from_utf8_lossy(e.as_bytes()).into_owned(),
            reason: "line is not valid UTF-8".to_string(),
        }))
    }

    fn fill(&mut self, deadline: Option<Instant>) -> Result<()> {
        loop {
            let ready = wait_readable(&[self.file.as_fd()], remaining(deadline))
                .map_err(|e| ProtocolError::io(format!("unable to poll '{}'", self.name), e))?;

            if ready.is_empty() {
                return Err(ProtocolError::Timeout {
                    name: self.name.clone(),
                    timeout_ms: self.timeout.as_millis(),
                });
            }

            let mut chunk = [0u8; READ_CHUNK];
            match self.file.read(&mut chunk) {
                Ok(0) => return Err(ProtocolError::Eof(self.name.clone())),
                Ok(size) => {
                    self.buffer.extend_from_slice(&chunk[..size]);
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(ProtocolError::io(
                        format!("unable to read from '{}'", self.name),
                        e,
                    ))
                }
            }
        }
    }
}

impl LineRead for HandleRead {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_line(&mut self) -> Result<String> {
        let deadline = deadline_after(self.timeout);

        loop {
            if let Some(line) = self.take_line() {
                return line;
            }
            self.fill(deadline)?;
        }
    }

    fn handle(&self) -> Option<BorrowedFd<'_>> {
        Some(self.file.as_fd())
    }

    fn buffered(&self) -> bool {
        !self.buffer.is_empty()
    }

    fn read_timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }
}

/// In-memory reader, never blocks and has no descriptor
pub struct BufferRead {
    name: String,
    lines: std::collections::VecDeque<String>,
}

impl BufferRead {
    pub fn new(name: impl Into<String>, content: &str) -> Self {
        Self {
            name: name.into(),
            lines: content.lines().map(str::to_string).collect(),
        }
    }
}

impl LineRead for BufferRead {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_line(&mut self) -> Result<String> {
        self.lines
            .pop_front()
            .ok_or_else(|| ProtocolError::Eof(self.name.clone()))
    }

    fn handle(&self) -> Option<BorrowedFd<'_>> {
        None
    }

    fn buffered(&self) -> bool {
        !self.lines.is_empty()
    }
}

/// Point in time `timeout` from now, `None` when that is past what `Instant` can hold
pub fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

/// Time left until `deadline`; no deadline waits as long as poll allows
fn remaining(deadline: Option<Instant>) -> Duration {
    deadline.map_or(Duration::MAX, |deadline| deadline.saturating_duration_since(Instant::now()))
}

/// Wait until at least one descriptor is readable or the timeout passes
///
/// Returns the indexes of every descriptor reporting input, hangup or error;
/// an empty list means the timeout elapsed. Interrupted waits resume with the
/// remaining time.
pub fn wait_readable(fds: &[BorrowedFd<'_>], timeout: Duration) -> io::Result<Vec<usize>> {
    let deadline = deadline_after(timeout);

    loop {
        let mut poll_fds: Vec<PollFd<'_>> = fds
            .iter()
            .map(|fd| PollFd::new(*fd, PollFlags::POLLIN))
            .collect();

        let millis = i32::try_from(remaining(deadline).as_millis()).unwrap_or(i32::MAX);
        let poll_timeout = PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX);

        match poll(&mut poll_fds, poll_timeout) {
            Ok(0) => return Ok(Vec::new()),
            Ok(_) => {
                let ready = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
                return Ok(poll_fds
                    .iter()
                    .enumerate()
                    .filter(|(_, fd)| fd.revents().is_some_and(|events| events.intersects(ready)))
                    .map(|(index, _)| index)
                    .collect());
            }
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(io::Error::from(errno)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_lines_across_chunks() {
        let (reader, mut writer) = os_pipe::pipe().unwrap();
        let mut read = HandleRead::new("test read", reader, Duration::from_secs(2));

        writer.write_all(b"{\"out\":1}\n{\"ou").unwrap();
        assert_eq!(read.read_line().unwrap(), r#"{"out":1}"#);
        assert!(read.buffered());

        writer.write_all(b"t\":2}\n").unwrap();
        assert_eq!(read.read_line().unwrap(), r#"{"out":2}"#);
        assert!(!read.buffered());
    }

    #[test]
    fn test_read_timeout() {
        let (reader, _writer) = os_pipe::pipe().unwrap();
        let mut read = HandleRead::new("server read", reader, Duration::from_millis(100));

        let err = read.read_line().unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout { .. }));
        assert_eq!(
            err.to_string(),
            "timeout after 100ms waiting for read from 'server read'"
        );
    }

    #[test]
    fn test_unbounded_timeout_does_not_overflow() {
        assert!(deadline_after(Duration::MAX).is_none());

        let (reader, mut writer) = os_pipe::pipe().unwrap();
        let mut read = HandleRead::new("test read", reader, Duration::MAX);
        assert_eq!(read.read_timeout(), Some(Duration::MAX));

        writer.write_all(b"{}\n").unwrap();
        assert_eq!(read.read_line().unwrap(), "{}");
    }

    #[test]
    fn test_read_eof() {
        let (reader, writer) = os_pipe::pipe().unwrap();
        drop(writer);
        let mut read = HandleRead::new("client read", reader, Duration::from_secs(1));

        assert!(matches!(read.read_line(), Err(ProtocolError::Eof(_))));
    }

    #[test]
    fn test_buffer_read() {
        let mut read = BufferRead::new("buffer", "{}\n{\"out\":true}\n");
        assert!(read.handle().is_none());
        assert_eq!(read.read_line().unwrap(), "{}");
        assert_eq!(read.read_line().unwrap(), r#"{"out":true}"#);
        assert!(matches!(read.read_line(), Err(ProtocolError::Eof(_))));
    }

    #[test]
    fn test_wait_readable_reports_only_ready() {
        let (reader1, _writer1) = os_pipe::pipe().unwrap();
        let (reader2, mut writer2) = os_pipe::pipe().unwrap();

        assert!(wait_readable(&[reader1.as_fd(), reader2.as_fd()], Duration::from_millis(50))
            .unwrap()
            .is_empty());

        writer2.write_all(b"{}\n").unwrap();
        let ready = wait_readable(&[reader1.as_fd(), reader2.as_fd()], Duration::from_secs(1)).unwrap();
        assert_eq!(ready, vec![1]);
    }
}
