//! Subject namespace: `domain.service.topic`.
//!
//! Subjects are always exactly three dot-delimited segments. Queue groups and
//! durable consumers are named after the *subscribing* service plus the target
//! subject, so every process of one service shares a group while different
//! services each get their own copy of the traffic.
//!
//! ```
//! use sourced_messaging::subject;
//!
//! let s = subject::build("wms", "ordering", "order").unwrap();
//! assert_eq!(s, "wms.ordering.order");
//! assert_eq!(
//!     subject::queue_name("wms", "billing", &s),
//!     "wms-billing-wms-ordering-order"
//! );
//! ```

use crate::error::{BrokerError, Result};

/// Segment delimiter inside a subject.
pub const DELIMITER: char = '.';

/// Separator used for queue, durable, and stream names.
pub const NAME_SEPARATOR: char = '-';

/// Build the subject for a (domain, service, topic) triple.
///
/// Segments are not escaped; a topic containing `.` simply yields a deeper
/// subject, which is the caller's business.
pub fn build(domain: &str, service: &str, topic: &str) -> Result<String> {
    for (segment, label) in [(domain, "domain"), (service, "service"), (topic, "topic")] {
        if segment.is_empty() {
            return Err(BrokerError::InvalidSubject(format!(
                "{label} segment is empty in \"{domain}{DELIMITER}{service}{DELIMITER}{topic}\""
            )));
        }
    }
    Ok(format!("{domain}{DELIMITER}{service}{DELIMITER}{topic}"))
}

/// Queue group / durable consumer name for a subscriber of `subject`.
///
/// `service_domain` and `service_name` identify the subscribing service, not
/// the publisher.
pub fn queue_name(service_domain: &str, service_name: &str, subject: &str) -> String {
    format!(
        "{service_domain}{NAME_SEPARATOR}{service_name}{NAME_SEPARATOR}{}",
        subject.replace(DELIMITER, &NAME_SEPARATOR.to_string())
    )
}

/// Stream name for a service: `domain-service`.
pub fn stream_name(domain: &str, service: &str) -> String {
    format!("{domain}{NAME_SEPARATOR}{service}")
}

/// The (domain, service) pair a process runs as.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Scope {
    domain: String,
    service: String,
}

impl Scope {
    /// Validate and create a scope.
    pub fn new(domain: impl Into<String>, service: impl Into<String>) -> Result<Self> {
        let domain = domain.into();
        let service = service.into();
        if domain.is_empty() {
            return Err(BrokerError::EmptyDomain);
        }
        if service.is_empty() {
            return Err(BrokerError::EmptyService);
        }
        Ok(Self { domain, service })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Subject for one of this service's own topics.
    pub fn subject(&self, topic: &str) -> Result<String> {
        build(&self.domain, &self.service, topic)
    }

    /// Queue / durable name this service uses when consuming `subject`.
    pub fn queue_name(&self, subject: &str) -> String {
        queue_name(&self.domain, &self.service, subject)
    }

    /// Name of this service's stream.
    pub fn stream_name(&self) -> String {
        stream_name(&self.domain, &self.service)
    }
}
