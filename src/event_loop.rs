//! Background-thread event loop bridging async execution to synchronous
//! or streaming callers.
//!
//! A [`ThreadedEventLoop`] owns a dedicated thread driving a
//! current-thread tokio runtime. [`run_coroutine`](ThreadedEventLoop::run_coroutine)
//! schedules a future there and returns immediately; the calling thread is
//! then free to drain
//! [`ProcessingContext`](crate::context::ProcessingContext) messages —
//! blocking `pop_message` in a polling loop, or `pop_message_async` from
//! async code — until a terminal message, and finally joins the returned
//! [`TaskHandle`] to propagate the run's result.

use std::future::Future;
use std::thread;

use miette::Diagnostic;
use thiserror::Error;
use tokio::runtime;
use tokio::sync::oneshot;

#[derive(Debug, Error, Diagnostic)]
pub enum EventLoopError {
    /// The task ended without producing a result: it panicked, or the
    /// event loop shut down underneath it.
    #[error("task ended without a result")]
    #[diagnostic(code(loomflow::event_loop::task_failed))]
    TaskFailed,
}

/// Completion handle for a scheduled coroutine.
///
/// Joinable from synchronous code ([`join`](Self::join)) or async code
/// ([`join_async`](Self::join_async)).
pub struct TaskHandle<T> {
    rx: flume::Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Block until the task finishes and return its output.
    pub fn join(self) -> Result<T, EventLoopError> {
        self.rx.recv().map_err(|_| EventLoopError::TaskFailed)
    }

    /// Suspend until the task finishes and return its output.
    pub async fn join_async(self) -> Result<T, EventLoopError> {
        self.rx
            .recv_async()
            .await
            .map_err(|_| EventLoopError::TaskFailed)
    }

    /// Take the output if the task already finished.
    pub fn try_join(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

/// Dedicated background thread owning one cooperative event loop.
pub struct ThreadedEventLoop {
    handle: runtime::Handle,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Default for ThreadedEventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadedEventLoop {
    /// Spawn the loop thread and wait for its runtime to come up.
    #[must_use]
    pub fn new() -> Self {
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name("loomflow-event-loop".to_string())
            .spawn(move || {
                let rt = runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("event loop runtime");
                let _ = handle_tx.send(rt.handle().clone());
                // Park on the shutdown signal; spawned tasks run on this
                // thread while block_on drives the runtime.
                rt.block_on(async move {
                    let _ = shutdown_rx.await;
                });
            })
            .expect("event loop thread");

        let handle = handle_rx.recv().expect("event loop runtime handle");
        Self {
            handle,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        }
    }

    /// Schedule a future on the loop thread and return immediately.
    pub fn run_coroutine<F>(&self, future: F) -> TaskHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (tx, rx) = flume::bounded(1);
        self.handle.spawn(async move {
            let _ = tx.send(future.await);
        });
        TaskHandle { rx }
    }

    /// Stop the loop and join its thread. Tasks still pending are dropped.
    pub fn shutdown(mut self) {
        self.finalize();
    }

    fn finalize(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ThreadedEventLoop {
    fn drop(&mut self) {
        self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_future_on_background_thread() {
        let event_loop = ThreadedEventLoop::new();
        let caller = thread::current().id();
        let handle = event_loop.run_coroutine(async move { thread::current().id() != caller });
        assert!(handle.join().unwrap());
        event_loop.shutdown();
    }

    #[test]
    fn panicking_task_reports_failure() {
        let event_loop = ThreadedEventLoop::new();
        let handle = event_loop.run_coroutine(async { panic!("deliberate") });
        assert!(matches!(handle.join(), Err(EventLoopError::TaskFailed)));
    }
}
