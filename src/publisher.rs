//! Publisher: wraps events in envelopes and sends them on this service's subjects.
//!
//! Events always go out on `domain.service.topic`, where domain and service are
//! the connection's own scope. There is no buffering: a failed publish is
//! returned to the caller immediately and the envelope is dropped.

use std::sync::Arc;

use tracing::debug;

use crate::connection::Connection;
use crate::envelope::{DomainEvent, Envelope};
use crate::error::{BrokerError, Result};

/// Publishes domain events for the connection's (domain, service).
#[derive(Clone)]
pub struct Publisher {
    connection: Arc<Connection>,
}

impl Publisher {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// At-most-once publish on the plain subject.
    ///
    /// Fails with `EmptyTopic` / `NilPayload` before touching the transport,
    /// and with `Publish` if the transport rejects the message. Not retried.
    pub async fn publish<E>(&self, topic: &str, event: &E) -> Result<()>
    where
        E: DomainEvent + ?Sized,
    {
        let (subject, envelope) = self.prepare(topic, event)?;
        self.connection
            .publish_raw(&subject, envelope.encode()?)
            .await?;
        debug!(%subject, event = %envelope.name, "published");
        Ok(())
    }

    /// Publish to a stream-covered subject and wait for the broker to store it.
    ///
    /// Fails with `StreamPublish` when no declared stream covers the subject
    /// or storage fails.
    pub async fn publish_durable<E>(&self, topic: &str, event: &E) -> Result<()>
    where
        E: DomainEvent + ?Sized,
    {
        let (subject, envelope) = self.prepare(topic, event)?;
        self.connection
            .publish_durable_raw(&subject, envelope.encode()?)
            .await?;
        debug!(%subject, event = %envelope.name, "published to stream");
        Ok(())
    }

    /// Publish an optional event; `None` fails with `NilPayload`.
    pub async fn publish_opt<E: DomainEvent>(&self, topic: &str, event: Option<&E>) -> Result<()> {
        match event {
            Some(event) => self.publish(topic, event).await,
            None if topic.is_empty() => Err(BrokerError::EmptyTopic),
            None => Err(BrokerError::NilPayload),
        }
    }

    fn prepare<E>(&self, topic: &str, event: &E) -> Result<(String, Envelope)>
    where
        E: DomainEvent + ?Sized,
    {
        if topic.is_empty() {
            return Err(BrokerError::EmptyTopic);
        }
        let envelope = Envelope::from_event(event)?;
        let subject = self.connection.scope().subject(topic)?;
        Ok((subject, envelope))
    }
}
