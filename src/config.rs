//! Broker configuration.
//!
//! The broker address comes from a [`ConfigSource`] (environment, a secrets
//! store, a map in tests). The domain and service the process runs as come
//! from the process environment.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::{BrokerError, Result};
use crate::subject::Scope;

/// Key holding the broker connection URL(s).
pub const NATS_URLS: &str = "NATS_URLS";
/// Environment variable naming the process domain.
pub const DOMAIN: &str = "DOMAIN";
/// Environment variable naming the process service.
pub const SERVICE: &str = "SERVICE";

/// Source of configuration values.
pub trait ConfigSource: Send + Sync {
    fn get_value(&self, key: &str) -> Result<String>;
}

/// Reads values from process environment variables.
#[derive(Clone, Copy, Debug, Default)]
pub struct EnvSource;

impl ConfigSource for EnvSource {
    fn get_value(&self, key: &str) -> Result<String> {
        std::env::var(key).map_err(|_| BrokerError::Config(format!("{key} is not set")))
    }
}

impl ConfigSource for HashMap<String, String> {
    fn get_value(&self, key: &str) -> Result<String> {
        self.get(key)
            .cloned()
            .ok_or_else(|| BrokerError::Config(format!("{key} is not set")))
    }
}

/// Reconnect behaviour handed to the transport.
///
/// `max_reconnects` also bounds the number of initial connection attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_reconnects: usize,
    pub reconnect_wait: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_reconnects: 10,
            reconnect_wait: Duration::from_secs(1),
        }
    }
}

impl ReconnectPolicy {
    /// Policy that tries once and never waits. Handy in tests.
    pub fn no_retry() -> Self {
        Self {
            max_reconnects: 0,
            reconnect_wait: Duration::ZERO,
        }
    }
}

/// Everything a `Connection` needs at construction time.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub url: String,
    pub scope: Scope,
    pub reconnect: ReconnectPolicy,
}

impl BrokerConfig {
    pub fn new(url: impl Into<String>, scope: Scope) -> Result<Self> {
        let url = url.into();
        if url.is_empty() {
            return Err(BrokerError::Config(format!("{NATS_URLS} is empty")));
        }
        Ok(Self {
            url,
            scope,
            reconnect: ReconnectPolicy::default(),
        })
    }

    /// Load the URL from `source` for the given domain and service.
    pub fn load(source: &dyn ConfigSource, domain: &str, service: &str) -> Result<Self> {
        let scope = Scope::new(domain, service)?;
        let url = source.get_value(NATS_URLS)?;
        Self::new(url, scope)
    }

    /// Load the URL from `source`, domain and service from `DOMAIN` / `SERVICE`.
    pub fn from_env(source: &dyn ConfigSource) -> Result<Self> {
        let domain = std::env::var(DOMAIN).unwrap_or_default();
        let service = std::env::var(SERVICE).unwrap_or_default();
        Self::load(source, &domain, &service)
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// Tuning for subscription dispatch loops.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Messages requested per durable pull; the only flow-control knob.
    pub batch_size: usize,
    /// How long a durable pull waits for messages before returning empty.
    pub fetch_expiry: Duration,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            fetch_expiry: Duration::from_secs(1),
        }
    }
}
