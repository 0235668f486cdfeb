//! Action context, cancellation and progress callbacks
//!
//! These traits let the executor report progress without depending on a
//! particular terminal UI.

use crate::retry::RetryConfig;
use crate::types::NodeOutcome;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Granularity of cancellable sleeps
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Cooperative cancellation signal shared by a run
///
/// Cancelling never interrupts an action mid-side-effect; it stops new work
/// from starting and cuts retry back-off short.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token that is not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless cancelled first
    ///
    /// Returns `false` if the sleep was cut short by cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let until = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= until {
                return true;
            }
            thread::sleep(SLEEP_SLICE.min(until - now));
        }
    }
}

/// Context passed to provisioning actions
#[derive(Debug, Clone)]
pub struct ActionContext {
    /// Name of the node being provisioned
    pub node: String,
    /// Run-wide cancellation signal
    pub cancel: CancelToken,
    /// Instant by which the action must return
    pub deadline: Option<Instant>,
    /// Retry policy for transient failures inside the action
    pub retry: RetryConfig,
}

impl ActionContext {
    /// Create a context without deadline
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            cancel: CancelToken::new(),
            deadline: None,
            retry: RetryConfig::default(),
        }
    }

    /// Time left before the deadline, if there is one
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has passed
    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|left| left.is_zero())
    }
}

/// Progress callback for graph execution
///
/// Implement this trait to receive progress updates during a run. All calls
/// happen on the thread that called the executor.
pub trait ProgressCallback {
    /// Called once before any node is dispatched
    fn on_run_start(&mut self, total: usize);

    /// Called when a node is handed to a worker
    fn on_node_start(&mut self, name: &str, description: &str);

    /// Called when a node reaches a terminal state (including skips)
    fn on_node_complete(&mut self, outcome: &NodeOutcome);
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_run_start(&mut self, _total: usize) {}
    fn on_node_start(&mut self, _name: &str, _description: &str) {}
    fn on_node_complete(&mut self, _outcome: &NodeOutcome) {}
}
