use futures::channel::oneshot;
use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
};

use crate::error::TaskError;

type Outcome<R> = Result<R, TaskError>;

/// Handle to one submitted task.
///
/// Resolve it by blocking with [`wait`](Self::wait) or by awaiting it; both
/// yield the task's value or the reason it did not produce one. Dropping a
/// handle does not stop the task.
#[derive(Debug)]
pub struct TaskHandle<R> {
    rx: oneshot::Receiver<Outcome<R>>,
    cancelled: Arc<AtomicBool>,
}

/// Worker-side half of a [`TaskHandle`].
#[derive(Debug)]
pub(crate) struct Completion<R> {
    tx: oneshot::Sender<Outcome<R>>,
    cancelled: Arc<AtomicBool>,
}

pub(crate) fn task_channel<R>() -> (Completion<R>, TaskHandle<R>) {
    let (tx, rx) = oneshot::channel();
    let cancelled = Arc::new(AtomicBool::new(false));
    (
        Completion {
            tx,
            cancelled: Arc::clone(&cancelled),
        },
        TaskHandle { rx, cancelled },
    )
}

impl<R> TaskHandle<R> {
    /// Blocks the current thread until the task resolves.
    pub fn wait(self) -> Outcome<R> {
        futures::executor::block_on(self)
    }

    /// Asks the pool to skip this task if no worker has started it yet.
    ///
    /// A task that is already running finishes normally.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl<R> Future for TaskHandle<R> {
    type Output = Outcome<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the job was discarded without running.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(TaskError::Lost)))
    }
}

impl<R> Completion<R> {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn complete(self, outcome: Outcome<R>) {
        // The caller may have stopped listening; that is not our problem.
        let _ = self.tx.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_returns_the_value() {
        let (done, handle) = task_channel();
        done.complete(Ok(5));
        assert_eq!(handle.wait().unwrap(), 5);
    }

    #[test]
    fn dropped_completion_means_lost() {
        let (done, handle) = task_channel::<u8>();
        drop(done);
        assert!(matches!(handle.wait(), Err(TaskError::Lost)));
    }

    #[test]
    fn cancel_is_visible_to_the_worker() {
        let (done, handle) = task_channel::<u8>();
        assert!(!done.is_cancelled());
        handle.cancel();
        assert!(done.is_cancelled());
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn handles_can_be_awaited() {
        let (done, handle) = task_channel();
        std::thread::spawn(move || done.complete(Ok("hi")));
        assert_eq!(handle.await.unwrap(), "hi");
    }
}
