//! Subscriber - binds handlers to subjects and runs one dispatch task per binding.
//!
//! ## Delivery modes
//!
//! ```text
//!                        subscribe()                    subscribe_stream()
//!                   ┌──────────────────┐             ┌──────────────────────┐
//!  domain.service.  │ queue group      │             │ durable pull consumer│
//!  topic ─────────► │ at most once     │             │ at least once        │
//!                   │ error: log, drop │             │ ok: ack  error: nak  │
//!                   └──────────────────┘             └──────────────────────┘
//!                            │                                  │
//!                            └──────────► Handler ◄─────────────┘
//! ```
//!
//! Both modes name their queue group / durable consumer
//! `{own domain}-{own service}-{subject with '.' replaced by '-'}`, so every
//! instance of a service shares one delivery stream per subject.
//!
//! Each binding runs on its own task under a child of the caller's
//! [`CancellationToken`]. Cancelling the token, or calling
//! [`SubscriptionHandle::stop`], leaves the group or releases the consumer
//! without waiting for further messages.

mod durable;
mod handle;
mod handler;
mod transient;

pub use handle::{DeliveryMode, SubscriptionHandle, SubscriptionState, SubscriptionStats};
pub use handler::{typed, Handler, HandlerError, Typed};

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};

use crate::config::SubscriptionOptions;
use crate::connection::Connection;
use crate::error::Result;
use crate::subject;

/// Subscribes handlers on behalf of the connection's (domain, service).
#[derive(Clone)]
pub struct Subscriber {
    connection: Arc<Connection>,
    options: SubscriptionOptions,
}

impl Subscriber {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self::with_options(connection, SubscriptionOptions::default())
    }

    pub fn with_options(connection: Arc<Connection>, mut options: SubscriptionOptions) -> Self {
        options.batch_size = options.batch_size.max(1);
        Self {
            connection,
            options,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn options(&self) -> &SubscriptionOptions {
        &self.options
    }

    /// Join this service's queue group on `domain.service.topic`.
    ///
    /// `domain` and `service` name the publisher being listened to, which may
    /// be another service. Returns once the group is joined; messages are
    /// dispatched on a spawned task until `cancel` fires.
    pub async fn subscribe<H: Handler>(
        &self,
        cancel: &CancellationToken,
        domain: &str,
        service: &str,
        topic: &str,
        handler: H,
    ) -> Result<SubscriptionHandle> {
        let subject = subject::build(domain, service, topic)?;
        let queue = self.connection.scope().queue_name(&subject);
        let subscription = self
            .connection
            .session()?
            .queue_subscribe(&subject, &queue)
            .await?;

        let token = cancel.child_token();
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Bound);
        let span = info_span!("subscription", %subject, %queue, mode = "transient");
        let task = tokio::spawn(
            transient::dispatch(subscription, handler, token.clone(), state_tx).instrument(span),
        );
        info!(%subject, %queue, "joined queue group");

        Ok(SubscriptionHandle::new(
            subject,
            queue,
            DeliveryMode::Transient,
            token,
            state_rx,
            task,
        ))
    }

    /// Bind durable pull consumer on `domain.service.topic`.
    ///
    /// The subject must be covered by a declared stream, otherwise binding
    /// fails with `StreamNotFound`. Resubscribing resumes after the last
    /// acknowledged message.
    pub async fn subscribe_stream<H: Handler>(
        &self,
        cancel: &CancellationToken,
        domain: &str,
        service: &str,
        topic: &str,
        handler: H,
    ) -> Result<SubscriptionHandle> {
        let subject = subject::build(domain, service, topic)?;
        let durable = self.connection.scope().queue_name(&subject);
        let consumer = self
            .connection
            .session()?
            .pull_consumer(&subject, &durable)
            .await?;

        let token = cancel.child_token();
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Bound);
        let span = info_span!("subscription", %subject, queue = %durable, mode = "durable");
        let task = tokio::spawn(
            durable::dispatch(
                consumer,
                handler,
                self.options.clone(),
                token.clone(),
                state_tx,
            )
            .instrument(span),
        );
        info!(%subject, %durable, "bound durable consumer");

        Ok(SubscriptionHandle::new(
            subject,
            durable,
            DeliveryMode::Durable,
            token,
            state_rx,
            task,
        ))
    }
}
