//! Worker - attach one long-lived consumer to topics chosen at call time.
//!
//! ```ignore
//! struct Projector { store: Store }
//!
//! #[async_trait]
//! impl Consumer for Projector {
//!     async fn handle(&self, envelope: Envelope) -> Result<(), HandlerError> {
//!         self.store.apply(envelope.decode::<OrderCreated>()?).await
//!     }
//! }
//!
//! let bind = worker.run(Arc::new(Projector { store }));
//! let orders = bind(&cancel, "wms", "ordering", "order").await?;
//! let invoices = bind(&cancel, "wms", "billing", "invoice").await?;
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::envelope::Envelope;
use crate::error::Result;
use crate::subscriber::{Handler, HandlerError, SubscriptionHandle, Subscriber};

/// A long-lived message consumer.
#[async_trait]
pub trait Consumer: Send + Sync + 'static {
    async fn handle(&self, envelope: Envelope) -> Result<(), HandlerError>;
}

/// Adapts a shared consumer to the subscriber's `Handler`.
struct ConsumerHandler<C: ?Sized>(Arc<C>);

#[async_trait]
impl<C: Consumer + ?Sized> Handler for ConsumerHandler<C> {
    async fn handle(&self, envelope: Envelope) -> Result<(), HandlerError> {
        self.0.handle(envelope).await
    }
}

/// Binds consumers to transient (queue-group) subscriptions.
#[derive(Clone)]
pub struct Worker {
    subscriber: Subscriber,
}

impl Worker {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self::from_subscriber(Subscriber::new(connection))
    }

    pub fn from_subscriber(subscriber: Subscriber) -> Self {
        Self { subscriber }
    }

    /// Returns a binder that subscribes `consumer` to `domain.service.topic`.
    ///
    /// Every call opens a new subscription sharing the same consumer instance.
    pub fn run<C>(
        &self,
        consumer: Arc<C>,
    ) -> impl Fn(&CancellationToken, &str, &str, &str) -> BoxFuture<'static, Result<SubscriptionHandle>>
           + Clone
           + Send
           + Sync
           + 'static
    where
        C: Consumer + ?Sized,
    {
        let subscriber = self.subscriber.clone();
        move |cancel: &CancellationToken, domain: &str, service: &str, topic: &str| {
            let subscriber = subscriber.clone();
            let handler = ConsumerHandler(Arc::clone(&consumer));
            let cancel = cancel.clone();
            let (domain, service, topic) = (domain.to_owned(), service.to_owned(), topic.to_owned());
            async move {
                subscriber
                    .subscribe(&cancel, &domain, &service, &topic, handler)
                    .await
            }
            .boxed()
        }
    }
}
