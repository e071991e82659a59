//! MessageBus trait definition
//!
//! A durable topic/subscription bus with at-least-once delivery. Publishing
//! fans a message out to every subscription of the topic whose property
//! filter matches. Consumers claim messages under a lock deadline; a
//! completed message is gone, an abandoned (or crashed) one returns to the
//! subscription when its lock lapses.
//!
//! Two features carry the orchestration protocols:
//! - **scheduled enqueue** (`visible_at`): retry-check self-messages are
//!   published with a future visibility time instead of an in-process timer
//! - **duplicate detection**: a publish with an explicit message id inside
//!   the detection window is dropped, so replayed job dispatches never reach
//!   a worker twice

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Duplicate-detection window
pub const DEDUP_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Default message time-to-live
pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Default consumer lock duration; must exceed worst-case handler latency
pub const DEFAULT_LOCK: Duration = Duration::from_secs(60);

/// Error type for bus operations
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Subscription does not exist
    #[error("unknown subscription {topic}/{name}")]
    UnknownSubscription { topic: String, name: String },

    /// Delivery not found (already completed or dead-lettered)
    #[error("delivery not found: {0}")]
    DeliveryNotFound(i64),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Whether a publish was accepted or suppressed by duplicate detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    Duplicate,
}

/// A subscription on a topic, optionally filtered by one application property
#[derive(Debug, Clone)]
pub struct SubscriptionSpec {
    pub topic: String,
    pub name: String,
    pub filter: Option<(String, String)>,
}

impl SubscriptionSpec {
    pub fn new(topic: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            name: name.into(),
            filter: None,
        }
    }

    /// Only deliver messages whose `property` equals `value`
    pub fn with_filter(mut self, property: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter = Some((property.into(), value.into()));
        self
    }
}

/// A message to publish
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    /// Duplicate-detection key; publishes reusing an id inside the window
    /// are dropped
    pub message_id: Option<String>,
    pub body: Value,
    pub properties: BTreeMap<String, String>,
    /// Scheduled-enqueue time; the message is invisible until then
    pub visible_at: Option<DateTime<Utc>>,
    /// Time-to-live from the visibility time; defaults to [`DEFAULT_TTL`]
    pub ttl: Option<Duration>,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, body: Value) -> Self {
        Self {
            topic: topic.into(),
            message_id: None,
            body,
            properties: BTreeMap::new(),
            visible_at: None,
            ttl: None,
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn with_visible_at(mut self, visible_at: DateTime<Utc>) -> Self {
        self.visible_at = Some(visible_at);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// A claimed message, locked until the consumer completes or abandons it
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub delivery_id: i64,
    pub topic: String,
    pub message_id: Option<String>,
    pub body: Value,
    pub properties: BTreeMap<String, String>,
    /// Delivery attempt number (1-based)
    pub attempt: i32,
}

impl ReceivedMessage {
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }
}

/// Durable topic/subscription message bus
///
/// Implementations must be thread-safe; both services hold one instance
/// behind an `Arc` and call it from concurrent consumer tasks.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Create the subscription if it does not already exist
    async fn ensure_subscription(&self, spec: &SubscriptionSpec) -> Result<(), BusError>;

    /// Publish to a topic, fanning out to matching subscriptions
    async fn publish(&self, message: BusMessage) -> Result<PublishOutcome, BusError>;

    /// Claim up to `max` visible messages for a subscription, locking each
    /// for `lock`
    async fn receive(
        &self,
        topic: &str,
        subscription: &str,
        max: usize,
        lock: Duration,
    ) -> Result<Vec<ReceivedMessage>, BusError>;

    /// Acknowledge and remove a claimed message
    async fn complete(&self, delivery_id: i64) -> Result<(), BusError>;

    /// Release a claimed message back to the subscription immediately
    async fn abandon(&self, delivery_id: i64) -> Result<(), BusError>;

    /// Extend the lock on a claimed message
    async fn renew_lock(&self, delivery_id: i64, lock: Duration) -> Result<(), BusError>;

    /// Move expired messages of a subscription to the dead-letter store;
    /// returns how many moved
    async fn dead_letter_expired(&self, topic: &str, subscription: &str) -> Result<u64, BusError>;
}
