//! Worker pool owned by a client.
//!
//! Every non-blocking operation is spawned onto a small multi-thread tokio
//! runtime and handed back as a [`Pending`]. Blocking forms wait for the same
//! future on the caller's thread, which must not be one of the pool's own
//! workers: a worker blocked on work queued behind it never wakes up.

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{ClientError, Result};

/// Default number of worker threads.
pub const DEFAULT_WORKER_THREADS: usize = 2;

thread_local! {
    static IN_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// True when the current thread belongs to a client worker pool.
pub fn is_worker_thread() -> bool {
    IN_WORKER.with(Cell::get)
}

/// A multi-thread tokio runtime running client operations.
///
/// Dropping the pool shuts it down in the background; work still queued is
/// abandoned.
pub struct WorkerPool {
    runtime: Option<Runtime>,
    handle: Handle,
}

impl WorkerPool {
    pub fn new(worker_threads: usize) -> Result<Self> {
        if worker_threads == 0 {
            return Err(ClientError::Config(
                "worker_threads must be at least 1".to_string(),
            ));
        }
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .thread_name("esclient-worker")
            .on_thread_start(|| IN_WORKER.with(|flag| flag.set(true)))
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        debug!(worker_threads, "Worker pool started");
        Ok(Self {
            runtime: Some(runtime),
            handle,
        })
    }

    /// Run `future` on the pool.
    pub fn spawn<T, F>(&self, future: F) -> Pending<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Pending::running(self.handle.spawn(future))
    }

    /// Handle for spawning onto the pool directly.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
            debug!("Worker pool shut down");
        }
    }
}

/// Result of an operation submitted to a worker pool.
///
/// Awaiting it yields the operation's result. Dropping it abandons the
/// result; the operation itself still runs to completion on the pool.
#[must_use = "a Pending does nothing observable unless awaited or waited on"]
pub struct Pending<T> {
    inner: Inner<T>,
}

enum Inner<T> {
    Running(JoinHandle<Result<T>>),
    Failed(Option<ClientError>),
}

impl<T> Pending<T> {
    pub(crate) fn running(handle: JoinHandle<Result<T>>) -> Self {
        Self {
            inner: Inner::Running(handle),
        }
    }

    /// A pending that resolves to `err` without touching the pool.
    pub(crate) fn failed(err: ClientError) -> Self {
        Self {
            inner: Inner::Failed(Some(err)),
        }
    }

    /// Wait on the current thread.
    ///
    /// Fails with `BlockingInWorker` when called on a pool thread.
    pub fn wait(self, operation: &'static str) -> Result<T> {
        if is_worker_thread() {
            return Err(ClientError::BlockingInWorker(operation));
        }
        futures::executor::block_on(self)
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            Inner::Running(handle) => Pin::new(handle).poll(cx).map(|joined| match joined {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(ClientError::Connection(
                    "worker pool shut down before the operation finished".to_string(),
                )),
                Err(e) => Err(ClientError::Connection(format!("operation panicked: {}", e))),
            }),
            Inner::Failed(err) => Poll::Ready(Err(err.take().unwrap_or_else(|| {
                ClientError::InvalidArgument("pending polled after completion".to_string())
            }))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_and_wait() {
        let pool = WorkerPool::new(2).unwrap();
        let value = pool.spawn(async { Ok(40 + 2) }).wait("answer").unwrap();
        assert_eq!(value, 42);
        assert!(!is_worker_thread());
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(matches!(WorkerPool::new(0), Err(ClientError::Config(_))));
    }

    #[test]
    fn test_failed_resolves_without_pool() {
        let pending: Pending<()> = Pending::failed(ClientError::InvalidArgument("x".to_string()));
        assert!(pending.wait("noop").unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_wait_on_worker_fails_fast() {
        let pool = WorkerPool::new(1).unwrap();
        let handle = pool.handle().clone();
        let outcome = pool
            .spawn(async move {
                assert!(is_worker_thread());
                let inner = Pending::running(handle.spawn(async { Ok(1) }));
                Ok(inner.wait("nested"))
            })
            .wait("outer")
            .unwrap();
        assert!(matches!(outcome, Err(ClientError::BlockingInWorker("nested"))));
    }

    #[test]
    fn test_panicking_operation_maps_to_error() {
        let pool = WorkerPool::new(1).unwrap();
        let err = pool
            .spawn(async {
                if true {
                    panic!("boom");
                }
                Ok(())
            })
            .wait("panics")
            .unwrap_err();
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn test_pending_awaited_from_another_runtime() {
        let pool = WorkerPool::new(1).unwrap();
        let value = pool.spawn(async { Ok("done") }).await.unwrap();
        assert_eq!(value, "done");
    }
}
