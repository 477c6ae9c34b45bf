//! Parallel job dispatch over a fixed pool of protocol clients
//!
//! One caller thread drives the dispatcher; the parallelism comes from the
//! processes behind each client. Each call to [`ProtocolParallel::process`]
//! hands queued jobs to idle clients, then waits (bounded) for whichever busy
//! client answers first and completes that one job. Jobs start in FIFO order
//! but complete in whatever order their processes finish. A job whose client
//! stays silent past its read timeout completes with a timeout error, and
//! that client takes no further jobs.

use crate::error::{ErrorKind, ProtocolError, Result};
use crate::protocol::client::ProtocolClient;
use crate::protocol::command::ProtocolCommand;
use crate::protocol::io::{deadline_after, wait_readable};
use serde_json::Value;
use std::borrow::BorrowMut;
use std::collections::VecDeque;
use std::fmt;
use std::os::fd::BorrowedFd;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Done,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Done => "done",
        })
    }
}

/// One command tracked from submission to completion
///
/// The key is opaque to the dispatcher and comes back unchanged with the
/// result, so callers can correlate it with their request.
#[derive(Debug)]
pub struct ProtocolParallelJob {
    key: Value,
    command: ProtocolCommand,
    state: JobState,
    process_id: usize,
    result: Option<Value>,
    error: Option<ProtocolError>,
    deadline: Option<Instant>,
}

impl ProtocolParallelJob {
    pub fn new(key: impl Into<Value>, command: ProtocolCommand) -> Self {
        Self {
            key: key.into(),
            command,
            state: JobState::Pending,
            process_id: 0,
            result: None,
            error: None,
            deadline: None,
        }
    }

    /// Move the job forward: `pending -> running -> done`
    ///
    /// # Panics
    ///
    /// Any other transition is a caller bug and panics.
    pub fn state_set(&mut self, state: JobState) {
        let legal = matches!(
            (self.state, state),
            (JobState::Pending, JobState::Running) | (JobState::Running, JobState::Done)
        );
        assert!(legal, "invalid state transition from '{}' to '{}'", self.state, state);

        self.state = state;
    }

    pub fn key(&self) -> &Value {
        &self.key
    }

    pub fn command(&self) -> &ProtocolCommand {
        &self.command
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// 1-based pool slot the job ran on, 0 before it starts
    pub fn process_id(&self) -> usize {
        self.process_id
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&ProtocolError> {
        self.error.as_ref()
    }

    /// Error code, 0 when the job succeeded
    pub fn error_code(&self) -> i32 {
        self.error.as_ref().map_or(0, ProtocolError::code)
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }

    /// Consume the job into its outcome
    pub fn into_result(self) -> Result<Option<Value>> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result),
        }
    }

    fn complete(&mut self, outcome: Result<Option<Value>>) {
        match outcome {
            Ok(result) => self.result = result,
            Err(error) => self.error = Some(error),
        }
        self.state_set(JobState::Done);
    }
}

/// Dispatcher over a pool of clients
///
/// `C` is any owner of a client: owned clients, or `&mut` borrows of the
/// clients cached by a [`ProtocolHelper`](crate::protocol::helper::ProtocolHelper).
pub struct ProtocolParallel<C = ProtocolClient> {
    timeout: Duration,
    clients: Vec<C>,
    client_job: Vec<Option<ProtocolParallelJob>>,
    retired: Vec<bool>,
    job_list: VecDeque<ProtocolParallelJob>,
    done_list: Vec<ProtocolParallelJob>,
    started: bool,
    next_check: usize,
}

impl<C: BorrowMut<ProtocolClient>> ProtocolParallel<C> {
    /// `timeout` bounds each wait for a busy client to answer
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            clients: Vec::new(),
            client_job: Vec::new(),
            retired: Vec::new(),
            job_list: VecDeque::new(),
            done_list: Vec::new(),
            started: false,
            next_check: 0,
        }
    }

    /// Add a client to the pool
    ///
    /// # Panics
    ///
    /// The client must have a pollable read handle, and clients can only be
    /// added before the first call to [`process`](Self::process).
    pub fn client_add(&mut self, client: C) {
        assert!(!self.started, "clients must be added before jobs are processed");
        assert!(
            client.borrow().read_handle().is_some(),
            "client with read handle is required"
        );

        self.clients.push(client);
        self.client_job.push(None);
        self.retired.push(false);
    }

    /// Queue a job; it is owned by the dispatcher until returned by [`result`](Self::result)
    pub fn job_add(&mut self, job: ProtocolParallelJob) {
        self.job_list.push_back(job);
    }

    /// Start queued jobs on idle clients and complete at most one running job
    ///
    /// Returns the number of jobs completed by this call. Returning 0 is not
    /// an error: nothing was running or nothing answered before the timeout.
    /// Per-job failures (including a job outliving its client's read timeout)
    /// are stored on the job; only a failure that leaves a client unusable
    /// (handshake or framing while sending) is returned here.
    pub fn process(&mut self) -> Result<usize> {
        self.started = true;

        self.start_jobs()?;

        let running: Vec<usize> = (0..self.clients.len())
            .filter(|&index| self.client_job[index].is_some())
            .collect();

        if running.is_empty() {
            return Ok(self.abandon_jobs());
        }

        let Some(index) = self.ready_client(&running)? else {
            trace!(running = running.len(), "no client ready before timeout");
            return Ok(self.expire_jobs());
        };

        let outcome = self.clients[index].borrow_mut().read_output(true);
        if let Some(mut job) = self.client_job[index].take() {
            job.complete(outcome);
            debug!(
                key = %job.key,
                process_id = job.process_id,
                error_code = job.error_code(),
                "job done"
            );
            self.done_list.push(job);
        }

        Ok(1)
    }

    /// Next completed job, most recently completed first
    pub fn result(&mut self) -> Option<ProtocolParallelJob> {
        self.done_list.pop()
    }

    /// True when no job is queued or running
    pub fn done(&self) -> bool {
        self.job_list.is_empty() && self.client_job.iter().all(Option::is_none)
    }

    pub fn client_total(&self) -> usize {
        self.clients.len()
    }

    pub fn job_total(&self) -> usize {
        self.job_list.len()
            + self.client_job.iter().filter(|job| job.is_some()).count()
            + self.done_list.len()
    }

    fn state(&self) -> JobState {
        if !self.started {
            JobState::Pending
        } else if self.done() {
            JobState::Done
        } else {
            JobState::Running
        }
    }

    fn start_jobs(&mut self) -> Result<()> {
        for index in 0..self.clients.len() {
            if self.client_job[index].is_some() || self.retired[index] {
                continue;
            }
            let Some(mut job) = self.job_list.pop_front() else {
                break;
            };

            job.state_set(JobState::Running);
            job.process_id = index + 1;

            match self.clients[index].borrow_mut().write_command(&job.command) {
                Ok(()) => {
                    job.deadline = self.clients[index]
                        .borrow()
                        .read_timeout()
                        .and_then(deadline_after);
                    debug!(key = %job.key, command = %job.command, process_id = index + 1, "job started");
                    self.client_job[index] = Some(job);
                }
                Err(error) if error.is_fatal() => {
                    let fatal = ProtocolError::Handshake(format!(
                        "unable to start job on '{}': {error}",
                        self.clients[index].borrow().name()
                    ));
                    job.complete(Err(error));
                    self.done_list.push(job);
                    return Err(fatal);
                }
                Err(error) => {
                    job.complete(Err(error));
                    self.done_list.push(job);
                }
            }
        }

        Ok(())
    }

    /// Complete every running job past its deadline with a timeout error
    ///
    /// The client is retired: a late reply would be read as the answer to
    /// the next command.
    fn expire_jobs(&mut self) -> usize {
        let now = Instant::now();
        let mut expired = 0;

        for index in 0..self.clients.len() {
            let overdue = self.client_job[index]
                .as_ref()
                .and_then(|job| job.deadline)
                .is_some_and(|deadline| now >= deadline);
            if !overdue {
                continue;
            }
            let Some(mut job) = self.client_job[index].take() else {
                continue;
            };

            let client = self.clients[index].borrow();
            let error = ProtocolError::Timeout {
                name: client.name().to_string(),
                timeout_ms: client.read_timeout().unwrap_or_default().as_millis(),
            };
            warn!(key = %job.key, client = %client.name(), "job timed out, client retired");

            job.complete(Err(error));
            self.retired[index] = true;
            self.done_list.push(job);
            expired += 1;
        }

        expired
    }

    /// Fail queued jobs once every client has been retired
    fn abandon_jobs(&mut self) -> usize {
        if self.clients.is_empty() || !self.retired.iter().all(|&retired| retired) {
            return 0;
        }

        let mut abandoned = 0;
        while let Some(mut job) = self.job_list.pop_front() {
            job.state_set(JobState::Running);
            job.complete(Err(ProtocolError::raised(
                ErrorKind::Protocol,
                "no client left to run job",
            )));
            self.done_list.push(job);
            abandoned += 1;
        }

        abandoned
    }

    /// Longest wait allowed before the nearest running job expires
    fn wait_limit(&self, running: &[usize]) -> Duration {
        let now = Instant::now();
        running
            .iter()
            .filter_map(|&index| self.client_job[index].as_ref().and_then(|job| job.deadline))
            .map(|deadline| deadline.saturating_duration_since(now))
            .fold(self.timeout, Duration::min)
    }

    /// Pick a running client whose response is ready, waiting up to the timeout
    fn ready_client(&mut self, running: &[usize]) -> Result<Option<usize>> {
        let start = self.next_check % self.clients.len();
        let rotated = running
            .iter()
            .copied()
            .filter(|&index| index >= start)
            .chain(running.iter().copied().filter(|&index| index < start));
        let order: Vec<usize> = rotated.collect();

        let mut ready = order
            .iter()
            .copied()
            .find(|&index| self.clients[index].borrow().read_buffered());

        if ready.is_none() {
            let fds: Option<Vec<BorrowedFd<'_>>> = order
                .iter()
                .map(|&index| self.clients[index].borrow().read_handle())
                .collect();
            let Some(fds) = fds else {
                return Err(ProtocolError::raised(
                    ErrorKind::Assert,
                    "running client has no read handle",
                ));
            };

            let polled = wait_readable(&fds, self.wait_limit(running))
                .map_err(|e| ProtocolError::io("unable to wait for protocol clients", e))?;
            ready = polled.first().map(|&position| order[position]);
        }

        if let Some(index) = ready {
            self.next_check = index + 1;
        }

        Ok(ready)
    }
}

impl<C: BorrowMut<ProtocolClient>> fmt::Display for ProtocolParallel<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{state: {}, clientTotal: {}, jobTotal: {}}}",
            self.state(),
            self.client_total(),
            self.job_total()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::io::BufferRead;

    fn job() -> ProtocolParallelJob {
        ProtocolParallelJob::new("test", ProtocolCommand::new("command"))
    }

    #[test]
    fn test_job_state_machine() {
        let mut job = job();
        assert_eq!(job.state(), JobState::Pending);
        job.state_set(JobState::Running);
        job.state_set(JobState::Done);
        assert_eq!(job.state(), JobState::Done);
    }

    #[test]
    #[should_panic(expected = "invalid state transition from 'pending' to 'done'")]
    fn test_job_pending_to_done() {
        job().state_set(JobState::Done);
    }

    #[test]
    #[should_panic(expected = "invalid state transition from 'running' to 'pending'")]
    fn test_job_running_to_pending() {
        let mut job = job();
        job.state_set(JobState::Running);
        job.state_set(JobState::Pending);
    }

    #[test]
    #[should_panic(expected = "invalid state transition from 'running' to 'running'")]
    fn test_job_running_twice() {
        let mut job = job();
        job.state_set(JobState::Running);
        job.state_set(JobState::Running);
    }

    #[test]
    #[should_panic(expected = "invalid state transition from 'done' to 'done'")]
    fn test_job_done_twice() {
        let mut job = job();
        job.state_set(JobState::Running);
        job.state_set(JobState::Done);
        job.state_set(JobState::Done);
    }

    #[test]
    fn test_job_outcome() {
        let mut job = job();
        job.state_set(JobState::Running);
        job.complete(Err(ProtocolError::Remote {
            client: "test client 1".to_string(),
            code: 39,
            message: "very serious error".to_string(),
            stack: String::new(),
        }));

        assert_eq!(job.error_code(), 39);
        assert_eq!(
            job.error_message().as_deref(),
            Some("raised from test client 1: very serious error")
        );
        assert!(job.result().is_none());
        assert!(job.into_result().is_err());
    }

    #[test]
    fn test_empty_dispatcher() {
        let mut parallel: ProtocolParallel = ProtocolParallel::new(Duration::from_millis(10));
        assert_eq!(parallel.to_string(), "{state: pending, clientTotal: 0, jobTotal: 0}");
        assert!(parallel.done());
        assert_eq!(parallel.process().unwrap(), 0);
        assert!(parallel.result().is_none());
        assert_eq!(parallel.to_string(), "{state: done, clientTotal: 0, jobTotal: 0}");
    }

    #[test]
    #[should_panic(expected = "client with read handle is required")]
    fn test_client_without_handle() {
        let client = ProtocolClient::new(
            "error",
            "error",
            Box::new(BufferRead::new("buffer", "{}\n")),
            Box::new(std::io::sink()),
        );
        let mut parallel = ProtocolParallel::new(Duration::from_millis(10));
        parallel.client_add(client);
    }
}
