//! Threads doing periodic maintenance of the buffer pool, e.g. writing back dirty pages.

use std::{mem, sync::mpsc, thread};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackgroundWorkerError {
    #[error("failed to signal worker to stop: {0}")]
    FailedToShutdown(String),
    #[error("background worker was already shutdown")]
    AlreadyShutdown,
    #[error("background worker thread panicked")]
    FailedToJoin,
}

/// Owner's side of a running worker thread.
///
/// Dropping it without [`BackgroundWorkerHandle::shutdown`] disconnects the channel,
/// which the worker treats as a stop signal too.
pub struct BackgroundWorkerHandle {
    thread: thread::JoinHandle<()>,
    /// `None` once the stop signal was sent.
    shutdown: Option<mpsc::Sender<()>>,
}

impl BackgroundWorkerHandle {
    pub(crate) fn new(thread: thread::JoinHandle<()>, shutdown: mpsc::Sender<()>) -> Self {
        BackgroundWorkerHandle {
            thread,
            shutdown: Some(shutdown),
        }
    }

    /// Asks the worker to stop after its current round. Fails when called twice.
    pub fn shutdown(&mut self) -> Result<(), BackgroundWorkerError> {
        let tx = mem::take(&mut self.shutdown);
        tx.ok_or(BackgroundWorkerError::AlreadyShutdown)?
            .send(())
            .map_err(|e| BackgroundWorkerError::FailedToShutdown(e.to_string()))
    }

    pub fn join(self) -> Result<(), BackgroundWorkerError> {
        self.thread
            .join()
            .map_err(|_| BackgroundWorkerError::FailedToJoin)
    }

    /// Signals the worker and waits until its thread exits.
    pub fn stop(mut self) -> Result<(), BackgroundWorkerError> {
        self.shutdown()?;
        self.join()
    }
}

/// Work run on its own thread until the returned handle stops it.
pub(crate) trait BackgroundWorker {
    type BackgroundWorkerParams;

    fn start(params: Self::BackgroundWorkerParams) -> BackgroundWorkerHandle;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spawn_waiting_thread() -> BackgroundWorkerHandle {
        let (tx, rx) = mpsc::channel();
        let thread = thread::spawn(move || {
            let _ = rx.recv_timeout(Duration::from_secs(5));
        });
        BackgroundWorkerHandle::new(thread, tx)
    }

    #[test]
    fn background_worker_handle_shutdown_only_once() {
        // given a thread waiting for shutdown signal
        let mut worker = spawn_waiting_thread();

        // when shutting it down twice
        worker.shutdown().unwrap();
        let second = worker.shutdown();

        // then second call fails and thread still joins
        assert!(matches!(second, Err(BackgroundWorkerError::AlreadyShutdown)));
        worker.join().unwrap();
    }

    #[test]
    fn background_worker_handle_stop_after_shutdown_fails() {
        let mut worker = spawn_waiting_thread();
        worker.shutdown().unwrap();

        assert!(matches!(
            worker.stop(),
            Err(BackgroundWorkerError::AlreadyShutdown)
        ));
    }

    #[test]
    fn background_worker_handle_stop_joins_thread() {
        let worker = spawn_waiting_thread();

        worker.stop().unwrap();
    }
}
