//! The child side of a process pool.
//!
//! A binary that uses process pools re-launches itself as its workers. It must
//! hand control to [`serve_if_worker`] before doing anything else in `main`,
//! and must not write to stdout from remote tasks: stdout carries the protocol.
//!
//! ```no_run
//! use fanout::{TaskTable, worker};
//!
//! fn main() {
//!     let tasks = TaskTable::new();
//!     // tasks.register::<MyTask>();
//!     worker::serve_if_worker(&tasks);
//!
//!     // ... the parent program ...
//! }
//! ```

use std::{
    io::{self, BufRead, Write},
    panic::{self, AssertUnwindSafe},
};

use crate::{
    error::panic_message,
    pool::{WorkerRequest, WorkerResponse, process::WORKER_ENV},
    remote::TaskTable,
};

/// Whether this process was launched as a pool worker.
pub fn is_worker() -> bool {
    std::env::var_os(WORKER_ENV).is_some_and(|v| v == "1")
}

/// If this process is a pool worker, serves requests on stdin/stdout until
/// told to stop and then exits. Otherwise returns immediately.
pub fn serve_if_worker(tasks: &TaskTable) {
    if !is_worker() {
        return;
    }
    let stdin = io::stdin();
    let stdout = io::stdout();
    let code = match serve(stdin.lock(), stdout.lock(), tasks) {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("Worker process failed: {e}");
            1
        }
    };
    std::process::exit(code);
}

/// Runs the worker loop: announce readiness, then answer requests until a
/// `shutdown` request or end of input.
pub fn serve<R, W>(reader: R, mut writer: W, tasks: &TaskTable) -> io::Result<()>
where
    R: BufRead,
    W: Write,
{
    let pid = std::process::id();
    tracing::debug!(pid, tasks = ?tasks.names(), "Worker process serving");
    send(&mut writer, &WorkerResponse::Ready { pid })?;

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<WorkerRequest>(&line) {
            Ok(WorkerRequest::Shutdown) => break,
            Ok(WorkerRequest::Ping) => WorkerResponse::Ready { pid },
            Ok(WorkerRequest::Run { task, payload }) => {
                match panic::catch_unwind(AssertUnwindSafe(|| tasks.run(&task, payload))) {
                    Ok(Ok(payload)) => WorkerResponse::Done { payload },
                    Ok(Err(e)) => WorkerResponse::Failed {
                        message: e.to_string(),
                    },
                    Err(payload) => WorkerResponse::Panicked {
                        message: panic_message(payload.as_ref()),
                    },
                }
            }
            Err(e) => WorkerResponse::Failed {
                message: format!("malformed request: {e}"),
            },
        };
        send(&mut writer, &response)?;
    }
    tracing::debug!(pid, "Worker process stopping");
    Ok(())
}

fn send<W: Write>(writer: &mut W, response: &WorkerResponse) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, response)?;
    writer.write_all(b"\n")?;
    writer.flush()
}
