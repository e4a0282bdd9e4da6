//! Durable, priority-aware message channel between the submitter and the
//! consumer loop.
//!
//! All broker I/O goes through [`BrokerChannel`]. [`RedisBroker`] is the
//! production transport; [`InMemoryBroker`] has identical delivery semantics
//! and is used by tests and single-process deployments.

use async_trait::async_trait;

mod memory;
mod redis_queue;

pub use self::memory::InMemoryBroker;
pub use self::redis_queue::RedisBroker;

/// Per-message publish settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    /// 0..=9, higher is delivered sooner.
    pub priority: u8,
    /// Ask the broker to keep the message across a broker restart.
    pub persistent: bool,
}

impl PublishOptions {
    pub fn persistent(priority: u8) -> Self {
        Self {
            priority,
            persistent: true,
        }
    }
}

/// A message handed to the consumer. It stays outstanding until it is passed
/// back to [`BrokerChannel::ack`] or [`BrokerChannel::nack`].
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Broker-specific handle identifying this delivery.
    pub tag: String,
    pub body: String,
    pub priority: u8,
    /// Set when the broker is handing out a message a second time because
    /// the previous delivery was never acknowledged.
    pub redelivered: bool,
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Establish (or re-establish) the connection and declare the durable
    /// task and result queues. Unacknowledged deliveries from a previous
    /// connection become available again, flagged as redelivered.
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Limit the number of unacknowledged deliveries. `0` means unbounded.
    async fn qos(&self, prefetch: usize) -> Result<(), BrokerError>;

    /// Publish a message body onto the task queue.
    async fn publish(&self, body: &str, options: PublishOptions) -> Result<(), BrokerError>;

    /// Take the highest-priority waiting message, if any. Does not block when
    /// the queue is empty.
    async fn receive(&self) -> Result<Option<Delivery>, BrokerError>;

    /// Permanently remove a delivered message.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Reject a delivered message. With `requeue` it goes back to the front
    /// of its priority level, otherwise it is dead-lettered.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError>;

    /// Passive count of messages waiting on the task queue.
    async fn depth(&self) -> Result<u64, BrokerError>;

    /// Messages delivered but not yet acknowledged.
    async fn unacked(&self) -> Result<u64, BrokerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Broker connection is not established")]
    Disconnected,

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Prefetch limit of {0} unacknowledged deliveries reached")]
    PrefetchExhausted(usize),

    #[error("Unknown delivery tag: {0}")]
    UnknownDelivery(String),
}

impl BrokerError {
    /// True when the connection itself is gone and must be re-established.
    pub fn is_transport(&self) -> bool {
        match self {
            BrokerError::Disconnected => true,
            BrokerError::Redis(e) => {
                e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
            }
            _ => false,
        }
    }
}
