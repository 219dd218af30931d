//! Result handle for a submitted task.

use std::time::Duration;

/// Why a task produced no value.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("task was dropped before it ran")]
    Cancelled,
    #[error("timed out waiting for the task result")]
    Timeout,
}

/// Receives the return value of a submitted task.
///
/// Submission hands this back immediately; the caller may block on it,
/// poll it, or simply drop it. A panic inside the task resolves the
/// handle with [`TaskError::Panicked`].
pub struct TaskHandle<R> {
    rx: crossbeam_channel::Receiver<Result<R, TaskError>>,
}

impl<R> TaskHandle<R> {
    pub(crate) fn new(rx: crossbeam_channel::Receiver<Result<R, TaskError>>) -> Self {
        Self { rx }
    }

    /// Block until the task finishes.
    pub fn wait(self) -> Result<R, TaskError> {
        self.rx.recv().unwrap_or(Err(TaskError::Cancelled))
    }

    /// Poll without blocking; `None` while the task is still pending.
    pub fn try_wait(&self) -> Option<Result<R, TaskError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(crossbeam_channel::TryRecvError::Empty) => None,
            Err(crossbeam_channel::TryRecvError::Disconnected) => Some(Err(TaskError::Cancelled)),
        }
    }

    /// Block up to `timeout` for the result.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<R, TaskError> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(TaskError::Timeout),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(TaskError::Cancelled),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
