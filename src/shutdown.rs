//! Listener quiescing signals
//!
//! A listener hands every upgraded inbound stream a [`Lifeline`]. While the
//! stream is alive the listener's task tracker stays open. When the shutdown
//! timeout expires the listener closes the socket itself through a
//! [`ChannelCloser`](crate::ChannelCloser); the lifeline wakes a stream that
//! is parked in a read or write so it observes the close.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::Context;

use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tokio_util::task::TaskTracker;
use tokio_util::task::task_tracker::TaskTrackerToken;

/// Signals a listener raises while shutting down
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignals {
    /// Raised when quiescing starts; connections should finish their work
    pub drain: CancellationToken,
    /// Raised when the shutdown timeout expires; connections are cut off
    pub force: CancellationToken,
}

impl ShutdownSignals {
    /// Create a fresh, unraised pair
    pub fn new() -> Self {
        Self::default()
    }
}

/// Per-stream handle on a listener's shutdown
pub struct Lifeline {
    _token: TaskTrackerToken,
    drain: CancellationToken,
    force: Pin<Box<WaitForCancellationFutureOwned>>,
    forced: bool,
}

impl Lifeline {
    /// Register a stream with `tracker` and subscribe it to `signals`
    pub fn new(tracker: &TaskTracker, signals: &ShutdownSignals) -> Self {
        Self {
            _token: tracker.token(),
            drain: signals.drain.clone(),
            force: Box::pin(signals.force.clone().cancelled_owned()),
            forced: false,
        }
    }

    /// Token cancelled once the listener starts quiescing
    pub fn drain_signal(&self) -> &CancellationToken {
        &self.drain
    }

    /// Whether the listener has force-closed this stream
    pub fn is_forced(&self) -> bool {
        self.forced
    }

    /// Poll the force signal, registering `cx` for wake-up.
    pub fn poll_forced(&mut self, cx: &mut Context<'_>) -> bool {
        if !self.forced && self.force.as_mut().poll(cx).is_ready() {
            self.forced = true;
        }
        self.forced
    }
}

impl fmt::Debug for Lifeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifeline")
            .field("draining", &self.drain.is_cancelled())
            .field("forced", &self.forced)
            .finish()
    }
}
