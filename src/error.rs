//! Error types for the messaging core.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = BrokerError> = std::result::Result<T, E>;

/// Errors surfaced by connections, publishers, and subscription setup.
///
/// Configuration variants are raised synchronously by the call that
/// triggered them and are never retried. Errors that happen inside a
/// dispatch loop are logged there and never reach the caller.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Operation requires a live session but `connect` was never called
    /// (or the connection was already disconnected).
    #[error("not connected")]
    NotConnected,
    /// `connect` called on a connection that already holds a session.
    #[error("already connected")]
    AlreadyConnected,
    /// The broker could not be reached within the retry window.
    #[error("connection to {address} failed after {attempts} attempt(s): {reason}")]
    Connection {
        address: String,
        attempts: usize,
        reason: String,
    },
    /// Draining the session failed; local resources were still released.
    #[error("disconnect failed: {0}")]
    Disconnect(String),
    #[error("domain is empty")]
    EmptyDomain,
    #[error("service is empty")]
    EmptyService,
    #[error("publish topic is empty")]
    EmptyTopic,
    #[error("topic list is empty")]
    EmptyTopicList,
    /// A subject segment was empty.
    #[error("invalid subject: {0}")]
    InvalidSubject(String),
    /// The event serialized to nothing (`null`).
    #[error("publish payload is nil")]
    NilPayload,
    #[error("event name is empty")]
    EmptyEventName,
    /// Plain publish was rejected by the transport.
    #[error("publish to {subject} failed: {reason}")]
    Publish { subject: String, reason: String },
    /// Durable publish was not stored (no covering stream, or storage failed).
    #[error("stream publish to {subject} failed: {reason}")]
    StreamPublish { subject: String, reason: String },
    /// A stream was re-declared with a different subject set.
    #[error("stream {name} already declared with a different configuration: {reason}")]
    StreamConflict { name: String, reason: String },
    /// The broker could not confirm or create a stream (timeout, JetStream
    /// unavailable). Worth retrying, unlike `StreamConflict`.
    #[error("declaring stream {name} failed: {reason}")]
    StreamDeclare { name: String, reason: String },
    /// No stream captures the subject a durable consumer asked for.
    #[error("no stream covers subject {0}")]
    StreamNotFound(String),
    /// The transport refused to open a subscription or consumer.
    #[error("subscribe to {subject} failed: {reason}")]
    Subscribe { subject: String, reason: String },
    /// Encoding an event or envelope failed.
    #[error("encode failed: {0}")]
    Encode(String),
    /// A required configuration value is missing.
    #[error("configuration error: {0}")]
    Config(String),
}

impl BrokerError {
    /// True for errors that stem from caller configuration rather than the transport.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            BrokerError::EmptyDomain
                | BrokerError::EmptyService
                | BrokerError::EmptyTopic
                | BrokerError::EmptyTopicList
                | BrokerError::InvalidSubject(_)
                | BrokerError::NilPayload
                | BrokerError::EmptyEventName
                | BrokerError::StreamConflict { .. }
                | BrokerError::Config(_)
        )
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Encode(err.to_string())
    }
}
