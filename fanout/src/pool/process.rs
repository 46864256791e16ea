//! Child processes behind a process-backed pool.
//!
//! Every worker thread of a [`ExecutorKind::Process`](crate::ExecutorKind)
//! pool owns at most one child. The parent talks to it over the child's
//! stdin/stdout with one JSON document per line:
//!
//! ```text
//! parent                          child
//!   | ---- spawn ----------------> |
//!   | <--- {"type":"ready"} ------ |
//!   | ---- {"type":"run",...} ---> |
//!   | <--- {"type":"done",...} --- |
//!   | ---- {"type":"shutdown"} --> |
//! ```
//!
//! The child side lives in [`crate::worker`].

use serde::{Deserialize, Serialize};
use std::{
    ffi::OsString,
    io::{self, BufRead, BufReader, Write},
    path::PathBuf,
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
};

use crate::error::TaskError;

/// Environment variable that tells a launched binary to act as a worker.
pub const WORKER_ENV: &str = "FANOUT_WORKER";

/// Messages from the parent to a worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Ping,
    Run {
        task: String,
        payload: serde_json::Value,
    },
    Shutdown,
}

/// Messages from a worker process to the parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    /// Sent once on startup and in answer to every ping.
    Ready { pid: u32 },
    Done { payload: serde_json::Value },
    Failed { message: String },
    Panicked { message: String },
}

/// What a process-backed pool launches for each worker.
///
/// Defaults to the current executable, which is expected to call
/// [`serve_if_worker`](crate::worker::serve_if_worker) early in `main`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Re-launch the running binary.
    pub fn current_exe() -> io::Result<Self> {
        std::env::current_exe().map(Self::new)
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(WORKER_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        cmd
    }
}

/// A running worker process.
#[derive(Debug)]
pub(crate) struct ChildWorker {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    pid: u32,
}

impl ChildWorker {
    /// Launches the process and waits for its `ready` line.
    pub(crate) fn spawn(command: &ProcessCommand) -> Result<Self, TaskError> {
        let mut child = command.command().spawn().map_err(|e| {
            TaskError::Remote(format!(
                "failed to launch {}: {e}",
                command.program.display()
            ))
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(TaskError::Remote("worker stdio was not captured".into()));
        };
        let mut worker = Self {
            pid: child.id(),
            child,
            stdin,
            stdout: BufReader::new(stdout),
        };
        match worker.read()? {
            WorkerResponse::Ready { .. } => {
                tracing::debug!(pid = worker.pid, "Worker process ready");
                Ok(worker)
            }
            other => Err(TaskError::Remote(format!(
                "expected ready from worker {}, got {other:?}",
                worker.pid
            ))),
        }
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    /// Sends one request and reads the matching response.
    pub(crate) fn call(&mut self, request: &WorkerRequest) -> Result<WorkerResponse, TaskError> {
        self.write(request)?;
        self.read()
    }

    fn write(&mut self, request: &WorkerRequest) -> Result<(), TaskError> {
        let mut line = serde_json::to_vec(request).map_err(|e| TaskError::Codec(e.to_string()))?;
        line.push(b'\n');
        self.stdin
            .write_all(&line)
            .and_then(|_| self.stdin.flush())
            .map_err(|_| TaskError::Lost)
    }

    fn read(&mut self) -> Result<WorkerResponse, TaskError> {
        let mut line = String::new();
        match self.stdout.read_line(&mut line) {
            Ok(0) | Err(_) => Err(TaskError::Lost),
            Ok(_) => serde_json::from_str(&line).map_err(|e| {
                TaskError::Remote(format!(
                    "malformed message from worker {}: {e}: {:?}",
                    self.pid,
                    line.trim_end()
                ))
            }),
        }
    }
}

impl Drop for ChildWorker {
    fn drop(&mut self) {
        if self.write(&WorkerRequest::Shutdown).is_err() {
            let _ = self.child.kill();
        }
        match self.child.wait() {
            Ok(status) => tracing::debug!(pid = self.pid, %status, "Worker process exited"),
            Err(e) => tracing::warn!(pid = self.pid, "Failed to reap worker process: {e}"),
        }
    }
}
