//! Connection lifecycle.
//!
//! A `Connection` owns at most one live transport session:
//!
//! ```text
//! new() ──► connect() ──► [live: publish / subscribe / declare] ──► disconnect()
//!  (unconnected)                                                   (drain + close)
//! ```
//!
//! Every publisher and subscriber built on a connection shares its session.
//! Without a session, every operation fails with `BrokerError::NotConnected`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use bytes::Bytes;
use tracing::{error, info, warn};

use crate::config::{BrokerConfig, ReconnectPolicy};
use crate::error::{BrokerError, Result};
use crate::stream::StreamSpec;
use crate::subject::Scope;
use crate::transport::{Connector, InMemoryBroker, Session};

/// Owns the transport session for one (domain, service) pair.
pub struct Connection {
    config: BrokerConfig,
    connector: Arc<dyn Connector>,
    session: RwLock<Option<Arc<dyn Session>>>,
    pub(crate) stream: Mutex<Option<StreamSpec>>,
    /// Serializes connect / disconnect.
    lifecycle: tokio::sync::Mutex<()>,
}

impl Connection {
    /// Create an unconnected connection.
    pub fn new(config: BrokerConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            session: RwLock::new(None),
            stream: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Connection backed by NATS.
    #[cfg(feature = "nats")]
    pub fn nats(config: BrokerConfig) -> Self {
        Self::new(config, Arc::new(crate::transport::NatsConnector))
    }

    /// Connection to an in-memory broker. Connects in a single attempt.
    pub fn in_memory(broker: &InMemoryBroker, scope: Scope) -> Self {
        let config = BrokerConfig {
            url: broker.url().to_string(),
            scope,
            reconnect: ReconnectPolicy::no_retry(),
        };
        Self::new(config, Arc::new(broker.clone()))
    }

    pub fn scope(&self) -> &Scope {
        &self.config.scope
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.read_session().is_some()
    }

    /// Establish the session.
    ///
    /// Tries `1 + max_reconnects` times with a fixed `reconnect_wait` between
    /// attempts, then fails with `BrokerError::Connection`.
    pub async fn connect(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_connected() {
            return Err(BrokerError::AlreadyConnected);
        }

        let address = &self.config.url;
        let policy = &self.config.reconnect;
        let attempts = policy.max_reconnects + 1;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.connector.connect(address, policy).await {
                Ok(session) => {
                    *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(session);
                    info!(
                        domain = self.config.scope.domain(),
                        service = self.config.scope.service(),
                        attempt,
                        "connected to broker"
                    );
                    return Ok(());
                }
                Err(err) => {
                    warn!(%address, attempt, attempts, error = %err, "broker connection attempt failed");
                    last_error = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(policy.reconnect_wait).await;
                    }
                }
            }
        }

        Err(BrokerError::Connection {
            address: address.clone(),
            attempts,
            reason: last_error
                .map(|err| err.to_string())
                .unwrap_or_else(|| "no attempt made".to_string()),
        })
    }

    /// Drain outstanding publishes and acks, then close.
    ///
    /// The session is released even when draining fails.
    pub async fn disconnect(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let session = self
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(BrokerError::NotConnected)?;
        *self.stream_spec() = None;

        match session.drain().await {
            Ok(()) => {
                info!(
                    domain = self.config.scope.domain(),
                    service = self.config.scope.service(),
                    "disconnected from broker"
                );
                Ok(())
            }
            Err(BrokerError::Disconnect(reason)) => Err(BrokerError::Disconnect(reason)),
            Err(err) => Err(BrokerError::Disconnect(err.to_string())),
        }
    }

    /// Disconnect for process shutdown: failures are logged, not returned.
    pub async fn shutdown(&self) {
        if let Err(err) = self.disconnect().await {
            error!(error = %err, "error disconnecting from broker");
        }
    }

    /// The live session, or `NotConnected`.
    pub fn session(&self) -> Result<Arc<dyn Session>> {
        self.read_session().ok_or(BrokerError::NotConnected)
    }

    /// Publish raw bytes on `subject` (at-most-once).
    pub async fn publish_raw(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.session()?.publish(subject, payload).await
    }

    /// Publish raw bytes on a stream-covered `subject` and wait for storage.
    pub async fn publish_durable_raw(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.session()?.publish_durable(subject, payload).await
    }

    /// The stream declared through this connection, if any.
    pub fn stream(&self) -> Option<StreamSpec> {
        self.stream_spec().clone()
    }

    pub(crate) fn stream_spec(&self) -> MutexGuard<'_, Option<StreamSpec>> {
        self.stream.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_session(&self) -> Option<Arc<dyn Session>> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
