//! Service bus - the messaging graph for one (domain, service).
//!
//! The bus builds a [`Connection`] and the [`Publisher`], [`Subscriber`] and
//! [`Worker`] that share it, and carries the root cancellation token every
//! subscription made through it hangs off.
//!
//! ```ignore
//! let bus = Bus::from_env()?;
//! bus.start().await?;
//! bus.connection().with_stream(["order"]).await?;
//!
//! bus.subscribe_stream("wms", "ordering", "order", typed(on_order)).await?;
//! bus.publish_durable("order", &OrderCreated { id }).await?;
//!
//! // on SIGTERM
//! bus.shutdown().await;
//! ```

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

#[cfg(feature = "nats")]
use crate::config::{BrokerConfig, EnvSource};
use crate::config::SubscriptionOptions;
use crate::connection::Connection;
use crate::envelope::DomainEvent;
use crate::error::Result;
use crate::publisher::Publisher;
use crate::subscriber::{Handler, SubscriptionHandle, Subscriber};
use crate::worker::Worker;

pub struct Bus {
    connection: Arc<Connection>,
    publisher: Publisher,
    subscriber: Subscriber,
    worker: Worker,
    root: CancellationToken,
}

impl Bus {
    pub fn new(connection: Connection) -> Self {
        Self::with_options(connection, SubscriptionOptions::default())
    }

    pub fn with_options(connection: Connection, options: SubscriptionOptions) -> Self {
        let connection = Arc::new(connection);
        let subscriber = Subscriber::with_options(Arc::clone(&connection), options);
        Self {
            publisher: Publisher::new(Arc::clone(&connection)),
            worker: Worker::from_subscriber(subscriber.clone()),
            subscriber,
            connection,
            root: CancellationToken::new(),
        }
    }

    /// Bus over NATS for `config`. Not connected until [`start`](Self::start).
    #[cfg(feature = "nats")]
    pub fn nats(config: BrokerConfig) -> Self {
        Self::new(Connection::nats(config))
    }

    /// Bus over NATS configured from `NATS_URLS`, `DOMAIN` and `SERVICE`.
    #[cfg(feature = "nats")]
    pub fn from_env() -> Result<Self> {
        let config = BrokerConfig::from_env(&EnvSource)?;
        Ok(Self::nats(config))
    }

    /// Connect to the broker.
    pub async fn start(&self) -> Result<()> {
        self.connection.connect().await
    }

    /// Cancel every subscription made through the bus, then disconnect.
    ///
    /// Never fails: a disconnect error is logged.
    pub async fn shutdown(&self) {
        info!(
            domain = self.connection.scope().domain(),
            service = self.connection.scope().service(),
            "shutting down bus"
        );
        self.root.cancel();
        self.connection.shutdown().await;
    }

    pub async fn publish<E: DomainEvent + ?Sized>(&self, topic: &str, event: &E) -> Result<()> {
        self.publisher.publish(topic, event).await
    }

    pub async fn publish_durable<E: DomainEvent + ?Sized>(&self, topic: &str, event: &E) -> Result<()> {
        self.publisher.publish_durable(topic, event).await
    }

    /// Transient subscription under the bus's root token.
    pub async fn subscribe<H: Handler>(
        &self,
        domain: &str,
        service: &str,
        topic: &str,
        handler: H,
    ) -> Result<SubscriptionHandle> {
        self.subscriber
            .subscribe(&self.root, domain, service, topic, handler)
            .await
    }

    /// Durable subscription under the bus's root token.
    pub async fn subscribe_stream<H: Handler>(
        &self,
        domain: &str,
        service: &str,
        topic: &str,
        handler: H,
    ) -> Result<SubscriptionHandle> {
        self.subscriber
            .subscribe_stream(&self.root, domain, service, topic, handler)
            .await
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn subscriber(&self) -> &Subscriber {
        &self.subscriber
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    /// Root token; pass it (or a child) to `Worker` binders.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.root
    }
}
