//! In-memory implementation of MessageBus for testing
//!
//! Mirrors the PostgreSQL semantics: fan-out at publish, visibility times,
//! lock deadlines, the duplicate-detection window and TTL dead-lettering.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::bus::*;

struct SubscriptionState {
    spec: SubscriptionSpec,
}

struct DeliveryState {
    topic: String,
    subscription: String,
    message_id: Option<String>,
    body: serde_json::Value,
    properties: BTreeMap<String, String>,
    visible_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    attempt: i32,
    locked_until: Option<DateTime<Utc>>,
}

/// A dead-lettered message, exposed for test assertions
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub topic: String,
    pub subscription: String,
    pub message_id: Option<String>,
    pub body: serde_json::Value,
    pub attempt: i32,
    pub reason: String,
}

#[derive(Default)]
struct Inner {
    subscriptions: Vec<SubscriptionState>,
    deliveries: HashMap<i64, DeliveryState>,
    message_ids: HashMap<(String, String), DateTime<Utc>>,
    dead_letters: Vec<DeadLetter>,
    next_delivery_id: i64,
}

/// In-memory message bus with the same semantics as the PostgreSQL bus
#[derive(Default)]
pub struct InMemoryMessageBus {
    inner: Mutex<Inner>,
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages currently visible to a subscription (for tests)
    pub fn visible_count(&self, topic: &str, subscription: &str) -> usize {
        let now = Utc::now();
        let inner = self.inner.lock();
        inner
            .deliveries
            .values()
            .filter(|d| {
                d.topic == topic
                    && d.subscription == subscription
                    && d.visible_at <= now
                    && d.locked_until.map(|l| l <= now).unwrap_or(true)
            })
            .count()
    }

    /// All deliveries pending for a subscription regardless of visibility
    pub fn pending_count(&self, topic: &str, subscription: &str) -> usize {
        let inner = self.inner.lock();
        inner
            .deliveries
            .values()
            .filter(|d| d.topic == topic && d.subscription == subscription)
            .count()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.lock().dead_letters.clone()
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn ensure_subscription(&self, spec: &SubscriptionSpec) -> Result<(), BusError> {
        let mut inner = self.inner.lock();
        let exists = inner
            .subscriptions
            .iter()
            .any(|s| s.spec.topic == spec.topic && s.spec.name == spec.name);
        if !exists {
            inner.subscriptions.push(SubscriptionState { spec: spec.clone() });
        }
        Ok(())
    }

    async fn publish(&self, message: BusMessage) -> Result<PublishOutcome, BusError> {
        let now = Utc::now();
        let visible_at = message.visible_at.unwrap_or(now);
        let ttl = message.ttl.unwrap_or(DEFAULT_TTL);
        let expires_at = visible_at
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(7));

        let mut inner = self.inner.lock();

        if let Some(message_id) = &message.message_id {
            let window = now
                - chrono::Duration::from_std(DEDUP_WINDOW)
                    .unwrap_or_else(|_| chrono::Duration::minutes(10));
            inner.message_ids.retain(|_, published| *published >= window);

            let key = (message.topic.clone(), message_id.clone());
            if inner.message_ids.contains_key(&key) {
                return Ok(PublishOutcome::Duplicate);
            }
            inner.message_ids.insert(key, now);
        }

        let matching: Vec<String> = inner
            .subscriptions
            .iter()
            .filter(|s| s.spec.topic == message.topic)
            .filter(|s| match &s.spec.filter {
                Some((property, value)) => {
                    message.properties.get(property).map(String::as_str) == Some(value.as_str())
                }
                None => true,
            })
            .map(|s| s.spec.name.clone())
            .collect();

        for subscription in matching {
            inner.next_delivery_id += 1;
            let id = inner.next_delivery_id;
            inner.deliveries.insert(
                id,
                DeliveryState {
                    topic: message.topic.clone(),
                    subscription,
                    message_id: message.message_id.clone(),
                    body: message.body.clone(),
                    properties: message.properties.clone(),
                    visible_at,
                    expires_at,
                    attempt: 0,
                    locked_until: None,
                },
            );
        }

        Ok(PublishOutcome::Published)
    }

    async fn receive(
        &self,
        topic: &str,
        subscription: &str,
        max: usize,
        lock: Duration,
    ) -> Result<Vec<ReceivedMessage>, BusError> {
        let now = Utc::now();
        let lock_until = now
            + chrono::Duration::from_std(lock).unwrap_or_else(|_| chrono::Duration::seconds(60));

        let mut inner = self.inner.lock();

        let mut claimable: Vec<i64> = inner
            .deliveries
            .iter()
            .filter(|(_, d)| {
                d.topic == topic
                    && d.subscription == subscription
                    && d.visible_at <= now
                    && d.expires_at > now
                    && d.locked_until.map(|l| l <= now).unwrap_or(true)
            })
            .map(|(id, _)| *id)
            .collect();
        claimable.sort_by_key(|id| {
            let d = &inner.deliveries[id];
            (d.visible_at, *id)
        });
        claimable.truncate(max);

        let mut messages = Vec::with_capacity(claimable.len());
        for id in claimable {
            let delivery = inner
                .deliveries
                .get_mut(&id)
                .ok_or(BusError::DeliveryNotFound(id))?;
            delivery.locked_until = Some(lock_until);
            delivery.attempt += 1;
            messages.push(ReceivedMessage {
                delivery_id: id,
                topic: delivery.topic.clone(),
                message_id: delivery.message_id.clone(),
                body: delivery.body.clone(),
                properties: delivery.properties.clone(),
                attempt: delivery.attempt,
            });
        }

        Ok(messages)
    }

    async fn complete(&self, delivery_id: i64) -> Result<(), BusError> {
        let mut inner = self.inner.lock();
        inner
            .deliveries
            .remove(&delivery_id)
            .map(|_| ())
            .ok_or(BusError::DeliveryNotFound(delivery_id))
    }

    async fn abandon(&self, delivery_id: i64) -> Result<(), BusError> {
        let mut inner = self.inner.lock();
        if let Some(delivery) = inner.deliveries.get_mut(&delivery_id) {
            delivery.locked_until = None;
        }
        Ok(())
    }

    async fn renew_lock(&self, delivery_id: i64, lock: Duration) -> Result<(), BusError> {
        let lock_until = Utc::now()
            + chrono::Duration::from_std(lock).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut inner = self.inner.lock();
        let delivery = inner
            .deliveries
            .get_mut(&delivery_id)
            .ok_or(BusError::DeliveryNotFound(delivery_id))?;
        if delivery.locked_until.is_none() {
            return Err(BusError::DeliveryNotFound(delivery_id));
        }
        delivery.locked_until = Some(lock_until);
        Ok(())
    }

    async fn dead_letter_expired(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<u64, BusError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        let expired: Vec<i64> = inner
            .deliveries
            .iter()
            .filter(|(_, d)| {
                d.topic == topic
                    && d.subscription == subscription
                    && d.expires_at <= now
                    && d.locked_until.map(|l| l <= now).unwrap_or(true)
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(delivery) = inner.deliveries.remove(id) {
                inner.dead_letters.push(DeadLetter {
                    topic: delivery.topic,
                    subscription: delivery.subscription,
                    message_id: delivery.message_id,
                    body: delivery.body,
                    attempt: delivery.attempt,
                    reason: "expired".into(),
                });
            }
        }

        Ok(expired.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TOPIC: &str = "orchestrator-events";
    const SUB: &str = "orchestrator";

    async fn bus_with_sub() -> InMemoryMessageBus {
        let bus = InMemoryMessageBus::new();
        bus.ensure_subscription(&SubscriptionSpec::new(TOPIC, SUB))
            .await
            .unwrap();
        bus
    }

    #[tokio::test]
    async fn publish_receive_complete() {
        let bus = bus_with_sub().await;
        bus.publish(BusMessage::new(TOPIC, json!({"BatchId": 1})))
            .await
            .unwrap();

        let messages = bus.receive(TOPIC, SUB, 10, DEFAULT_LOCK).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].attempt, 1);
        assert_eq!(messages[0].body, json!({"BatchId": 1}));

        // Locked: a second receive sees nothing
        assert!(bus.receive(TOPIC, SUB, 10, DEFAULT_LOCK).await.unwrap().is_empty());

        bus.complete(messages[0].delivery_id).await.unwrap();
        assert_eq!(bus.pending_count(TOPIC, SUB), 0);
    }

    #[tokio::test]
    async fn abandoned_message_is_redelivered() {
        let bus = bus_with_sub().await;
        bus.publish(BusMessage::new(TOPIC, json!({}))).await.unwrap();

        let first = bus.receive(TOPIC, SUB, 1, DEFAULT_LOCK).await.unwrap();
        bus.abandon(first[0].delivery_id).await.unwrap();

        let second = bus.receive(TOPIC, SUB, 1, DEFAULT_LOCK).await.unwrap();
        assert_eq!(second[0].delivery_id, first[0].delivery_id);
        assert_eq!(second[0].attempt, 2);
    }

    #[tokio::test]
    async fn lapsed_lock_returns_message() {
        let bus = bus_with_sub().await;
        bus.publish(BusMessage::new(TOPIC, json!({}))).await.unwrap();

        let first = bus.receive(TOPIC, SUB, 1, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);

        // Zero-length lock has already lapsed
        let second = bus.receive(TOPIC, SUB, 1, DEFAULT_LOCK).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].attempt, 2);
    }

    #[tokio::test]
    async fn duplicate_message_id_is_suppressed() {
        let bus = bus_with_sub().await;
        let outcome = bus
            .publish(BusMessage::new(TOPIC, json!({})).with_message_id("step-1-attempt-1"))
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Published);

        let outcome = bus
            .publish(BusMessage::new(TOPIC, json!({})).with_message_id("step-1-attempt-1"))
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Duplicate);
        assert_eq!(bus.pending_count(TOPIC, SUB), 1);

        // A different id is a different dispatch attempt
        let outcome = bus
            .publish(BusMessage::new(TOPIC, json!({})).with_message_id("step-1-retry-1"))
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Published);
    }

    #[tokio::test]
    async fn scheduled_message_is_invisible_until_due() {
        let bus = bus_with_sub().await;
        bus.publish(
            BusMessage::new(TOPIC, json!({}))
                .with_visible_at(Utc::now() + chrono::Duration::hours(1)),
        )
        .await
        .unwrap();

        assert!(bus.receive(TOPIC, SUB, 10, DEFAULT_LOCK).await.unwrap().is_empty());
        assert_eq!(bus.pending_count(TOPIC, SUB), 1);

        bus.publish(
            BusMessage::new(TOPIC, json!({"due": true}))
                .with_visible_at(Utc::now() - chrono::Duration::seconds(1)),
        )
        .await
        .unwrap();
        let messages = bus.receive(TOPIC, SUB, 10, DEFAULT_LOCK).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, json!({"due": true}));
    }

    #[tokio::test]
    async fn filtered_subscription_only_sees_matching_properties() {
        let bus = InMemoryMessageBus::new();
        bus.ensure_subscription(
            &SubscriptionSpec::new("worker-jobs", "mover").with_filter("WorkerId", "mover"),
        )
        .await
        .unwrap();
        bus.ensure_subscription(
            &SubscriptionSpec::new("worker-jobs", "infra").with_filter("WorkerId", "infra"),
        )
        .await
        .unwrap();

        bus.publish(
            BusMessage::new("worker-jobs", json!({"JobId": "step-1-attempt-1"}))
                .with_property("WorkerId", "mover"),
        )
        .await
        .unwrap();

        assert_eq!(bus.pending_count("worker-jobs", "mover"), 1);
        assert_eq!(bus.pending_count("worker-jobs", "infra"), 0);
    }

    #[tokio::test]
    async fn expired_messages_dead_letter() {
        let bus = bus_with_sub().await;
        bus.publish(BusMessage::new(TOPIC, json!({})).with_ttl(Duration::ZERO))
            .await
            .unwrap();

        let moved = bus.dead_letter_expired(TOPIC, SUB).await.unwrap();
        assert_eq!(moved, 1);
        assert_eq!(bus.pending_count(TOPIC, SUB), 0);
        assert_eq!(bus.dead_letters().len(), 1);
        assert_eq!(bus.dead_letters()[0].reason, "expired");
    }
}
