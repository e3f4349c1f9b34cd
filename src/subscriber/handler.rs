//! Message handlers.

use std::error::Error;
use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::envelope::Envelope;
use crate::error::BrokerError;

/// Error returned by a handler.
///
/// In transient mode any error is logged and the message is gone. In durable
/// mode any error naks the message so the broker redelivers it.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Payload could not be decoded into the expected type.
    #[error("decode failed: {0}")]
    Decode(String),
    /// Business logic refused the message.
    #[error("rejected: {0}")]
    Rejected(String),
    /// A publish or other broker call made by the handler failed.
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("handler error: {0}")]
    Other(Box<dyn Error + Send + Sync>),
}

impl HandlerError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        HandlerError::Rejected(reason.into())
    }

    pub fn other(err: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        HandlerError::Other(err.into())
    }

    pub fn is_decode(&self) -> bool {
        matches!(self, HandlerError::Decode(_))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Decode(err.to_string())
    }
}

/// Handles decoded envelopes for one subscription.
///
/// Implemented for any `Fn(Envelope) -> impl Future<Output = Result<(), HandlerError>>`:
///
/// ```ignore
/// subscriber
///     .subscribe(&cancel, "wms", "ordering", "order", |envelope: Envelope| async move {
///         let order: OrderCreated = envelope.decode()?;
///         Ok(())
///     })
///     .await?;
/// ```
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, envelope: Envelope) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope) -> Result<(), HandlerError> {
        (self)(envelope).await
    }
}

/// Handler that decodes the payload into `T` before calling `f(name, T)`.
///
/// Created with [`typed`].
pub struct Typed<T, F> {
    handler: F,
    _payload: PhantomData<fn() -> T>,
}

/// Wrap `handler` so it receives the event name and the decoded payload.
///
/// A payload that does not decode counts as a decode failure: dropped in
/// transient mode, nak'd in durable mode.
pub fn typed<T, F, Fut>(handler: F) -> Typed<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(String, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Typed {
        handler,
        _payload: PhantomData,
    }
}

#[async_trait]
impl<T, F, Fut> Handler for Typed<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(String, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope) -> Result<(), HandlerError> {
        let data: T = envelope.decode()?;
        (self.handler)(envelope.name, data).await
    }
}
