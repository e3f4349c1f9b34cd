//! Envelope: the two-field wire wrapper applied to every published message.
//!
//! ```text
//! {"name": "orderCreated", "payload": "eyJvcmRlcklkIjoiMTIzIn0="}
//! ```
//!
//! `payload` is the JSON serialization of the event, carried as base64 so the
//! record stays self-describing regardless of what the event contains.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, Result};

/// An application event that can be published.
///
/// Usually derived:
///
/// ```
/// use serde::Serialize;
/// use sourced_messaging::DomainEvent;
///
/// #[derive(Serialize, DomainEvent)]
/// struct OrderCreated {
///     order_id: String,
/// }
///
/// let event = OrderCreated { order_id: "123".into() };
/// assert_eq!(event.name(), "orderCreated");
/// ```
pub trait DomainEvent: Serialize {
    /// Logical event type identifier, carried as the envelope `name`.
    fn name(&self) -> &str;
}

impl<T: DomainEvent + ?Sized> DomainEvent for &T {
    fn name(&self) -> &str {
        (**self).name()
    }
}

impl<T: DomainEvent + ?Sized> DomainEvent for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Wire wrapper: event name plus serialized event body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub name: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Create an envelope from already-serialized payload bytes.
    pub fn new(name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    /// Wrap an event: serialize it and take its name.
    ///
    /// Fails with `EmptyEventName` if the event reports an empty name and
    /// `NilPayload` if it serializes to `null`.
    pub fn from_event<E: DomainEvent + ?Sized>(event: &E) -> Result<Self> {
        let name = event.name();
        if name.is_empty() {
            return Err(BrokerError::EmptyEventName);
        }
        let payload = serde_json::to_vec(event)?;
        if payload == b"null" {
            return Err(BrokerError::NilPayload);
        }
        Ok(Self::new(name, payload))
    }

    /// Serialize the envelope for the wire.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parse an envelope from wire bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Decode the payload into an application type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Payload as a string (if valid UTF-8).
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

mod base64_bytes {
    use super::{Engine, STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
