//! Transport seam.
//!
//! The messaging core never touches a broker client directly. It talks to a
//! [`Connector`] that opens a [`Session`], and the session exposes the raw
//! primitives the core is built from:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │          Connection / Publisher / Subscriber / Worker        │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Session: publish / publish_durable / queue_subscribe /      │
//! │           declare_stream / pull_consumer / drain             │
//! └──────────────────────────────────────────────────────────────┘
//!              │                                │
//!              ▼                                ▼
//! ┌─────────────────────────┐      ┌─────────────────────────────┐
//! │ InMemoryBroker          │      │ NatsConnector (`nats`)      │
//! │ (tests, single process) │      │ core NATS + JetStream       │
//! └─────────────────────────┘      └─────────────────────────────┘
//! ```

mod in_memory;
#[cfg(feature = "nats")]
mod nats;

pub use in_memory::{InMemoryBroker, InMemorySession};
#[cfg(feature = "nats")]
pub use nats::{NatsConnector, NatsSession};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::ReconnectPolicy;
use crate::error::Result;

/// Opens sessions against a broker address.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Make a single connection attempt.
    ///
    /// Retrying the initial attempt is the caller's job; `policy` is handed
    /// over so the transport can apply it to mid-session reconnects.
    async fn connect(&self, address: &str, policy: &ReconnectPolicy) -> Result<Arc<dyn Session>>;
}

/// A live broker session shared by every publisher and subscriber built on
/// one connection.
#[async_trait]
pub trait Session: Send + Sync {
    /// At-most-once publish. Returns once the transport accepted the bytes.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;

    /// Publish to a stream-covered subject; returns once the broker stored it.
    async fn publish_durable(&self, subject: &str, payload: Bytes) -> Result<()>;

    /// Join queue group `queue` on `subject`.
    async fn queue_subscribe(
        &self,
        subject: &str,
        queue: &str,
    ) -> Result<Box<dyn QueueSubscription>>;

    /// Create stream `name` over `subjects`, or confirm an identical one exists.
    async fn declare_stream(&self, name: &str, subjects: &[String]) -> Result<()>;

    /// Bind (or resume) durable pull consumer `durable` filtered to `subject`.
    async fn pull_consumer(&self, subject: &str, durable: &str) -> Result<Box<dyn PullConsumer>>;

    /// Flush outstanding publishes and acks, then close.
    async fn drain(&self) -> Result<()>;
}

/// A queue-group membership delivering raw message bodies.
#[async_trait]
pub trait QueueSubscription: Send {
    /// Next message body; `None` once the subscription is closed.
    async fn next(&mut self) -> Option<Bytes>;

    /// Leave the queue group.
    async fn unsubscribe(&mut self) -> Result<()>;
}

/// A durable, pull-based consumer on a stream.
#[async_trait]
pub trait PullConsumer: Send {
    /// Pull up to `batch` messages, waiting at most `expires` for the first.
    async fn fetch(&mut self, batch: usize, expires: Duration) -> Result<Vec<Box<dyn Delivery>>>;

    /// Release the consumer handle. The durable position stays on the broker.
    async fn release(&mut self) -> Result<()>;
}

/// One message pulled from a durable consumer.
#[async_trait]
pub trait Delivery: Send + Sync {
    fn subject(&self) -> &str;

    fn payload(&self) -> &[u8];

    /// Acknowledge; the durable position moves past this message for good.
    async fn ack(&self) -> Result<()>;

    /// Negative-acknowledge; the broker redelivers the message later.
    async fn nak(&self) -> Result<()>;
}
