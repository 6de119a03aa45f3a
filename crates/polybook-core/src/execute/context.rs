//! Execution context shared by the runners.
//!
//! Provides cancellation, the sink through which runners report progress,
//! and scoped cleanup of per-execution resources.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// Output captured for one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Untouched stdout capture, sentinels included.
    pub raw: String,
    /// Text intended for presentation. Never contains a sentinel.
    pub displayed: String,
}

/// Handle for cancelling an execution.
///
/// `AbortHandle` can be cloned and shared across tasks; any clone can
/// trigger the abort, which is visible to all other clones and wakes every
/// task awaiting [`AbortHandle::aborted`].
///
/// # Example
///
/// ```
/// use polybook_core::execute::AbortHandle;
///
/// let handle = AbortHandle::new();
/// let handle_clone = handle.clone();
///
/// assert!(!handle.is_aborted());
/// handle_clone.abort();
/// assert!(handle.is_aborted());
/// ```
#[derive(Clone, Default)]
pub struct AbortHandle {
    inner: Arc<AbortState>,
}

#[derive(Default)]
struct AbortState {
    aborted: AtomicBool,
    notify: Notify,
}

impl AbortHandle {
    /// Create a new abort handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if abort has been requested.
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Request abort of execution.
    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Resolve once abort has been requested.
    pub async fn aborted(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking the flag so a concurrent
            // abort() between the check and the await is not lost.
            notified.as_mut().enable();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortHandle")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// Receiver of a running execution's progress.
///
/// Runners call `on_display` for every piece of presentable text, in stream
/// order, and `on_input_request` when the program blocks on a line of
/// input. `None` from `on_input_request` means the request was cancelled;
/// the runner then unblocks the program with an empty line.
pub trait ExecutionSink: Send + Sync {
    /// Text was appended to the display.
    fn on_display<'a>(&'a self, text: &'a str) -> BoxFuture<'a, ()>;

    /// The program is waiting for one line of input.
    fn on_input_request(&self, request_id: String, prompt: String)
    -> BoxFuture<'_, Option<String>>;
}

/// Sink that discards output and answers every input request with nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ExecutionSink for NullSink {
    fn on_display<'a>(&'a self, _text: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }

    fn on_input_request(
        &self,
        _request_id: String,
        _prompt: String,
    ) -> BoxFuture<'_, Option<String>> {
        Box::pin(async { None })
    }
}

/// Cleanup handlers that run exactly once, on [`CleanupScope::run`] or drop.
///
/// Handlers run in reverse order of registration. A panicking handler is
/// logged and does not prevent the others from running.
#[derive(Default)]
pub struct CleanupScope {
    handlers: Vec<Box<dyn FnOnce() + Send>>,
}

impl CleanupScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cleanup handler.
    pub fn on_cleanup(&mut self, handler: impl FnOnce() + Send + 'static) {
        self.handlers.push(Box::new(handler));
    }

    /// Run all pending handlers now.
    pub fn run(&mut self) {
        while let Some(handler) = self.handlers.pop() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(handler));
            if let Err(e) = result {
                tracing::error!("cleanup handler panicked: {:?}", e);
            }
        }
    }
}

impl Drop for CleanupScope {
    fn drop(&mut self) {
        self.run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_cleanup_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        {
            let mut scope = CleanupScope::new();
            scope.on_cleanup(move || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            });
            scope.run();
            scope.run();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cleanup_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let order1 = order.clone();
        let order2 = order.clone();

        {
            let mut scope = CleanupScope::new();
            scope.on_cleanup(move || order1.lock().unwrap().push(1));
            scope.on_cleanup(move || order2.lock().unwrap().push(2));
        }

        assert_eq!(*order.lock().unwrap(), vec![2, 1]);
    }

    #[test]
    fn test_cleanup_survives_panicking_handler() {
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();

        {
            let mut scope = CleanupScope::new();
            scope.on_cleanup(move || called_clone.store(true, Ordering::SeqCst));
            scope.on_cleanup(|| panic!("boom"));
        }

        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_abort_handle_clone_shares_state() {
        let handle = AbortHandle::new();
        let clone = handle.clone();

        assert!(!handle.is_aborted());
        clone.abort();
        assert!(handle.is_aborted());
    }

    #[tokio::test]
    async fn test_aborted_wakes_waiter() {
        let handle = AbortHandle::new();
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.aborted().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.abort();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_aborted_returns_immediately_when_already_aborted() {
        let handle = AbortHandle::new();
        handle.abort();
        tokio::time::timeout(Duration::from_millis(100), handle.aborted())
            .await
            .expect("already aborted");
    }

    #[tokio::test]
    async fn test_null_sink_cancels_input() {
        let sink = NullSink;
        sink.on_display("ignored").await;
        assert_eq!(
            sink.on_input_request("id".into(), "prompt".into()).await,
            None
        );
    }
}
