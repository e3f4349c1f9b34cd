//! Stream registrar.
//!
//! Declares the one persistent stream a connection may own. Durable
//! publishers and subscribers need the stream to exist before they bind.
//!
//! ```ignore
//! let connection = Connection::nats(config);
//! // Connects if needed, then declares `wms-ordering` over `wms.ordering.order`.
//! connection.with_stream(["order"]).await?;
//! ```

use std::collections::BTreeSet;

use tracing::info;

use crate::connection::Connection;
use crate::error::{BrokerError, Result};

/// A stream name and the subjects it captures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamSpec {
    pub name: String,
    pub subjects: BTreeSet<String>,
}

impl StreamSpec {
    /// Fails with `EmptyTopicList` when `subjects` is empty.
    pub fn new<I, S>(name: impl Into<String>, subjects: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let subjects: BTreeSet<String> = subjects.into_iter().map(Into::into).collect();
        if subjects.is_empty() {
            return Err(BrokerError::EmptyTopicList);
        }
        Ok(Self {
            name: name.into(),
            subjects,
        })
    }

    pub fn covers(&self, subject: &str) -> bool {
        self.subjects.contains(subject)
    }
}

impl Connection {
    /// Declare stream `name` over `subjects`.
    ///
    /// Re-declaring the same stream is a no-op. Declaring a different subject
    /// set, or a second stream on the same connection, fails with
    /// `StreamConflict` and should be treated as fatal configuration.
    pub async fn declare_stream<I, S>(&self, name: &str, subjects: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = StreamSpec::new(name, subjects)?;

        if let Some(existing) = self.stream_spec().as_ref() {
            if *existing == spec {
                return Ok(());
            }
            return Err(BrokerError::StreamConflict {
                name: spec.name,
                reason: format!(
                    "connection already declared stream {} over {:?}",
                    existing.name, existing.subjects
                ),
            });
        }

        let subjects: Vec<String> = spec.subjects.iter().cloned().collect();
        self.session()?.declare_stream(&spec.name, &subjects).await?;

        info!(stream = %spec.name, subjects = ?spec.subjects, "declared stream");
        *self.stream_spec() = Some(spec);
        Ok(())
    }

    /// Declare this service's stream, `domain-service`, over
    /// `domain.service.topic` for every topic. Connects first if needed.
    pub async fn with_stream<I, S>(&self, topics: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let scope = self.scope().clone();
        let subjects = topics
            .into_iter()
            .map(|topic| scope.subject(topic.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        if subjects.is_empty() {
            return Err(BrokerError::EmptyTopicList);
        }

        if !self.is_connected() {
            self.connect().await?;
        }
        self.declare_stream(&scope.stream_name(), subjects).await
    }
}
