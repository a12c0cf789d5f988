//! Message broker abstraction
//!
//! The pipeline talks to its broker only through the [`Connector`] and
//! [`Channel`] traits, modelled on AMQP 0-9-1: exchanges route published
//! messages to bound queues by routing key, consumers pull deliveries and
//! acknowledge them by delivery tag, and anything unacknowledged when a
//! channel goes away is redelivered.
//!
//! - [`InMemoryBroker`]: a single-process broker used by the CLI and tests

mod memory;

pub use memory::{InMemoryBroker, MemoryChannel};

use adsft_common::PipelineError;
use async_trait::async_trait;
use thiserror::Error;

/// Errors returned by broker primitives
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("connection refused by {0}")]
    ConnectionRefused(String),

    #[error("connection lost")]
    ConnectionLost,

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("no queue bound to exchange '{exchange}' accepts routing key '{routing_key}'")]
    Unroutable {
        exchange: String,
        routing_key: String,
    },

    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),
}

impl BrokerError {
    /// Whether the error means the connection is gone and should be
    /// re-established
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            BrokerError::ConnectionRefused(_) | BrokerError::ConnectionLost
        )
    }
}

impl From<BrokerError> for PipelineError {
    fn from(err: BrokerError) -> Self {
        if err.is_connection_error() {
            PipelineError::Connection(err.to_string())
        } else {
            PipelineError::Broker(err.to_string())
        }
    }
}

/// Exchange routing behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routing key must equal the binding key
    Direct,
    /// Dot-separated binding keys with `*` (one word) and `#` (zero or more
    /// words) wildcards
    Topic,
}

impl ExchangeKind {
    /// Whether a message published with `routing_key` matches `binding_key`
    pub fn matches(&self, binding_key: &str, routing_key: &str) -> bool {
        match self {
            ExchangeKind::Direct => binding_key == routing_key,
            ExchangeKind::Topic => {
                let pattern: Vec<&str> = binding_key.split('.').collect();
                let words: Vec<&str> = routing_key.split('.').collect();
                topic_matches(&pattern, &words)
            }
        }
    }
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExchangeKind::Direct => write!(f, "direct"),
            ExchangeKind::Topic => write!(f, "topic"),
        }
    }
}

fn topic_matches(pattern: &[&str], words: &[&str]) -> bool {
    match (pattern.first(), words.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            // '#' swallows zero words, or one word and stays in place
            topic_matches(&pattern[1..], words)
                || (!words.is_empty() && topic_matches(pattern, &words[1..]))
        }
        (Some(&"*"), Some(_)) => topic_matches(&pattern[1..], &words[1..]),
        (Some(p), Some(w)) if p == w => topic_matches(&pattern[1..], &words[1..]),
        _ => false,
    }
}

/// A message pulled from a queue, pending acknowledgement
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Channel-scoped tag used to acknowledge this delivery
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    /// The message was delivered before and never acknowledged
    pub redelivered: bool,
}

/// Opens channels to a broker
#[async_trait]
pub trait Connector: Send + Sync {
    type Channel: Channel + 'static;

    /// Establish a connection and open one channel on it
    async fn connect(&self) -> Result<Self::Channel, BrokerError>;

    /// Human-readable broker address for logs
    fn describe(&self) -> String;
}

/// One channel on a broker connection
#[async_trait]
pub trait Channel: Send + Sync {
    /// Declare an exchange; succeeds when it already exists with the same kind
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError>;

    /// Declare a queue; succeeds when it already exists
    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError>;

    /// Bind a queue to an exchange; binding twice is a no-op
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Publish a message, returning how many queues received it.
    ///
    /// A message that no queue accepts is an [`BrokerError::Unroutable`]
    /// error rather than being dropped.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<usize, BrokerError>;

    /// Pull the next ready message from a queue, if any
    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError>;

    /// Acknowledge a delivery so it is never redelivered
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Number of ready (undelivered) messages in a queue
    async fn message_count(&self, queue: &str) -> Result<usize, BrokerError>;

    /// Drop every ready message in a queue, returning how many were removed
    async fn purge(&self, queue: &str) -> Result<usize, BrokerError>;

    /// Close the channel; unacknowledged deliveries are requeued
    async fn close(&self) -> Result<(), BrokerError>;
}
