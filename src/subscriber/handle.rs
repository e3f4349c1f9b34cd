//! Handles to running subscriptions.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a subscription: `Unbound -> Bound -> Draining -> Unbound`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    Unbound,
    Bound,
    Draining,
}

/// How a subscription receives messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Queue-group delivery, at most once, no acknowledgment.
    Transient,
    /// Durable pull consumer, at least once, ack / nak.
    Durable,
}

/// Counters from a dispatch loop.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Messages taken off the transport.
    pub received: usize,
    /// Messages the handler accepted.
    pub handled: usize,
    /// Messages the handler failed.
    pub failed: usize,
    /// Messages that did not decode.
    pub dropped: usize,
    /// Durable messages acknowledged.
    pub acked: usize,
    /// Durable messages negatively acknowledged.
    pub nacked: usize,
    /// Durable pull requests issued.
    pub pulls: usize,
}

/// Handle to a subscription's dispatch task.
///
/// Dropping the handle detaches the task: it keeps running until its
/// cancellation scope fires. Call [`stop`](Self::stop) to cancel and collect stats.
pub struct SubscriptionHandle {
    subject: String,
    queue: String,
    mode: DeliveryMode,
    cancel: CancellationToken,
    state: watch::Receiver<SubscriptionState>,
    task: Option<JoinHandle<SubscriptionStats>>,
}

impl SubscriptionHandle {
    pub(crate) fn new(
        subject: String,
        queue: String,
        mode: DeliveryMode,
        cancel: CancellationToken,
        state: watch::Receiver<SubscriptionState>,
        task: JoinHandle<SubscriptionStats>,
    ) -> Self {
        Self {
            subject,
            queue,
            mode,
            cancel,
            state,
            task: Some(task),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Queue group (transient) or durable consumer name (durable).
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Signal cancellation without waiting.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait until the subscription reaches `state`.
    ///
    /// Returns `false` if the dispatch task ended without reaching it.
    pub async fn wait_for(&mut self, state: SubscriptionState) -> bool {
        self.state.wait_for(|current| *current == state).await.is_ok()
    }

    /// Cancel the subscription, wait for the loop to exit, and return its stats.
    pub async fn stop(mut self) -> SubscriptionStats {
        self.cancel.cancel();
        match self.task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => SubscriptionStats::default(),
        }
    }

    /// Wait for the loop to exit on its own (scope cancelled or transport closed).
    pub async fn join(mut self) -> SubscriptionStats {
        match self.task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => SubscriptionStats::default(),
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("subject", &self.subject)
            .field("queue", &self.queue)
            .field("mode", &self.mode)
            .field("state", &self.state())
            .finish()
    }
}
