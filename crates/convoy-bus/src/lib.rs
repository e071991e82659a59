//! # Convoy message bus
//!
//! Durable topic/subscription messaging for the scheduler, orchestrator and
//! workers, with the delivery semantics the orchestration protocols lean on:
//! at-least-once delivery under a lock deadline, scheduled enqueue for
//! delayed self-messages, a duplicate-detection window keyed by message id,
//! and TTL-based dead-lettering.
//!
//! [`PostgresMessageBus`] is the production implementation (tables created
//! by the convoy-storage migrations). [`InMemoryMessageBus`] mirrors its
//! semantics for tests.

pub mod bus;
pub mod memory;
pub mod postgres;

pub use bus::{
    BusError, BusMessage, MessageBus, PublishOutcome, ReceivedMessage, SubscriptionSpec,
    DEDUP_WINDOW, DEFAULT_LOCK, DEFAULT_TTL,
};
pub use memory::InMemoryMessageBus;
pub use postgres::PostgresMessageBus;
