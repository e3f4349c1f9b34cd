//! NATS transport: core NATS for transient traffic, JetStream for streams.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::context::{CreateStreamErrorKind, GetStreamErrorKind};
use async_nats::jetstream::{self, consumer::pull, consumer::AckPolicy, AckKind, ErrorCode};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tracing::warn;

use super::{Connector, Delivery, PullConsumer, QueueSubscription, Session};
use crate::config::ReconnectPolicy;
use crate::error::{BrokerError, Result};

/// Connects to a NATS server (or cluster, given a comma-separated URL list).
#[derive(Clone, Copy, Debug, Default)]
pub struct NatsConnector;

#[async_trait]
impl Connector for NatsConnector {
    async fn connect(&self, address: &str, policy: &ReconnectPolicy) -> Result<Arc<dyn Session>> {
        let wait = policy.reconnect_wait;
        let client = async_nats::ConnectOptions::new()
            .max_reconnects(policy.max_reconnects)
            .reconnect_delay_callback(move |_attempts| wait)
            .connect(address)
            .await
            .map_err(|err| BrokerError::Connection {
                address: address.to_string(),
                attempts: 1,
                reason: err.to_string(),
            })?;

        let jetstream = jetstream::new(client.clone());
        Ok(Arc::new(NatsSession {
            client,
            jetstream,
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// A live NATS client plus its JetStream context.
pub struct NatsSession {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    closed: Arc<AtomicBool>,
}

impl NatsSession {
    /// The underlying client, for anything the core does not cover.
    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }
}

#[async_trait]
impl Session for NatsSession {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|err| BrokerError::Publish {
                subject: subject.to_string(),
                reason: err.to_string(),
            })
    }

    async fn publish_durable(&self, subject: &str, payload: Bytes) -> Result<()> {
        let stream_error = |reason: String| BrokerError::StreamPublish {
            subject: subject.to_string(),
            reason,
        };
        self.jetstream
            .publish(subject.to_string(), payload)
            .await
            .map_err(|err| stream_error(err.to_string()))?
            .await
            .map_err(|err| stream_error(err.to_string()))?;
        Ok(())
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        queue: &str,
    ) -> Result<Box<dyn QueueSubscription>> {
        let subscriber = self
            .client
            .queue_subscribe(subject.to_string(), queue.to_string())
            .await
            .map_err(|err| BrokerError::Subscribe {
                subject: subject.to_string(),
                reason: err.to_string(),
            })?;
        Ok(Box::new(NatsQueueSubscription {
            subject: subject.to_string(),
            subscriber,
        }))
    }

    async fn declare_stream(&self, name: &str, subjects: &[String]) -> Result<()> {
        if subjects.is_empty() {
            return Err(BrokerError::EmptyTopicList);
        }
        let wanted: BTreeSet<&str> = subjects.iter().map(String::as_str).collect();

        let unavailable = |reason: String| BrokerError::StreamDeclare {
            name: name.to_string(),
            reason,
        };

        match self.jetstream.get_stream(name).await {
            Ok(stream) => {
                let existing: BTreeSet<&str> = stream
                    .cached_info()
                    .config
                    .subjects
                    .iter()
                    .map(String::as_str)
                    .collect();
                if existing == wanted {
                    return Ok(());
                }
                return Err(BrokerError::StreamConflict {
                    name: name.to_string(),
                    reason: format!("existing subjects {existing:?}, requested {wanted:?}"),
                });
            }
            Err(err) => match err.kind() {
                GetStreamErrorKind::JetStream(source)
                    if source.error_code() == ErrorCode::STREAM_NOT_FOUND => {}
                _ => return Err(unavailable(err.to_string())),
            },
        }

        let created = self
            .jetstream
            .create_stream(jetstream::stream::Config {
                name: name.to_string(),
                subjects: subjects.to_vec(),
                ..Default::default()
            })
            .await;
        match created {
            Ok(_) => Ok(()),
            Err(err) => match err.kind() {
                CreateStreamErrorKind::JetStream(source)
                    if source.error_code() == ErrorCode::STREAM_NAME_EXIST
                        || source.error_code() == ErrorCode::STREAM_SUBJECT_OVERLAP =>
                {
                    Err(BrokerError::StreamConflict {
                        name: name.to_string(),
                        reason: err.to_string(),
                    })
                }
                _ => Err(unavailable(err.to_string())),
            },
        }
    }

    async fn pull_consumer(&self, subject: &str, durable: &str) -> Result<Box<dyn PullConsumer>> {
        let subscribe_error = |reason: String| BrokerError::Subscribe {
            subject: subject.to_string(),
            reason,
        };

        let stream_name = self
            .jetstream
            .stream_by_subject(subject.to_string())
            .await
            .map_err(|_| BrokerError::StreamNotFound(subject.to_string()))?;
        let stream = self
            .jetstream
            .get_stream(&stream_name)
            .await
            .map_err(|err| subscribe_error(err.to_string()))?;

        let consumer: jetstream::consumer::PullConsumer = stream
            .get_or_create_consumer(
                durable,
                pull::Config {
                    durable_name: Some(durable.to_string()),
                    filter_subject: subject.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| subscribe_error(err.to_string()))?;

        Ok(Box::new(NatsPullConsumer {
            subject: subject.to_string(),
            consumer,
            session_closed: Arc::clone(&self.closed),
        }))
    }

    async fn drain(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.client
            .drain()
            .await
            .map_err(|err| BrokerError::Disconnect(err.to_string()))
    }
}

struct NatsQueueSubscription {
    subject: String,
    subscriber: async_nats::Subscriber,
}

#[async_trait]
impl QueueSubscription for NatsQueueSubscription {
    async fn next(&mut self) -> Option<Bytes> {
        self.subscriber.next().await.map(|message| message.payload)
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.subscriber
            .unsubscribe()
            .await
            .map_err(|err| BrokerError::Subscribe {
                subject: self.subject.clone(),
                reason: err.to_string(),
            })
    }
}

struct NatsPullConsumer {
    subject: String,
    consumer: jetstream::consumer::PullConsumer,
    session_closed: Arc<AtomicBool>,
}

#[async_trait]
impl PullConsumer for NatsPullConsumer {
    async fn fetch(&mut self, batch: usize, expires: Duration) -> Result<Vec<Box<dyn Delivery>>> {
        if self.session_closed.load(Ordering::SeqCst) {
            return Err(BrokerError::NotConnected);
        }
        let fetch_error = |reason: String| BrokerError::Subscribe {
            subject: self.subject.clone(),
            reason,
        };

        let mut messages = self
            .consumer
            .fetch()
            .max_messages(batch)
            .expires(expires)
            .messages()
            .await
            .map_err(|err| fetch_error(err.to_string()))?;

        let mut deliveries: Vec<Box<dyn Delivery>> = Vec::with_capacity(batch);
        while let Some(message) = messages.next().await {
            match message {
                Ok(message) => deliveries.push(Box::new(NatsDelivery { message })),
                // Hand back what already arrived; those are in flight on the server.
                Err(err) if !deliveries.is_empty() => {
                    warn!(subject = %self.subject, error = %err, "pull cut short");
                    break;
                }
                Err(err) => return Err(fetch_error(err.to_string())),
            }
        }
        Ok(deliveries)
    }

    async fn release(&mut self) -> Result<()> {
        // Durable consumers live on the server; there is no client-side
        // subscription to tear down for pull mode.
        Ok(())
    }
}

struct NatsDelivery {
    message: jetstream::Message,
}

#[async_trait]
impl Delivery for NatsDelivery {
    fn subject(&self) -> &str {
        self.message.subject.as_str()
    }

    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    async fn ack(&self) -> Result<()> {
        self.message.ack().await.map_err(|err| BrokerError::Subscribe {
            subject: self.subject().to_string(),
            reason: format!("ack failed: {err}"),
        })
    }

    async fn nak(&self) -> Result<()> {
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|err| BrokerError::Subscribe {
                subject: self.subject().to_string(),
                reason: format!("nak failed: {err}"),
            })
    }
}
