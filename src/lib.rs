//! Domain-scoped messaging over a pub/sub broker.
//!
//! Services publish domain events on `domain.service.topic` subjects and
//! consume them either transiently (queue groups, at most once) or durably
//! (stream-backed pull consumers, at least once). Every message travels in
//! the same [`Envelope`].

extern crate self as sourced_messaging;

pub mod bus;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod publisher;
pub mod stream;
pub mod subject;
pub mod subscriber;
pub mod transport;
pub mod worker;

pub use bus::Bus;
pub use config::{BrokerConfig, ConfigSource, EnvSource, ReconnectPolicy, SubscriptionOptions};
pub use connection::Connection;
pub use envelope::{DomainEvent, Envelope};
pub use error::{BrokerError, Result};
pub use publisher::Publisher;
pub use stream::StreamSpec;
pub use subject::Scope;
pub use subscriber::{
    typed, DeliveryMode, Handler, HandlerError, SubscriptionHandle, SubscriptionState,
    SubscriptionStats, Subscriber,
};
pub use transport::InMemoryBroker;
pub use worker::{Consumer, Worker};

// Derive macro shares the trait's name, like serde's.
pub use sourced_messaging_macros::DomainEvent;

pub use tokio_util::sync::CancellationToken;
