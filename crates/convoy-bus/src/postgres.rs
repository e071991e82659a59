//! PostgreSQL implementation of MessageBus
//!
//! Rides the same database as the state store (tables created by the
//! convoy-storage migrations). Claiming uses `FOR UPDATE SKIP LOCKED` so
//! concurrent consumers never contend on the same delivery.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use crate::bus::*;

#[derive(Clone)]
pub struct PostgresMessageBus {
    pool: PgPool,
}

impl PostgresMessageBus {
    /// Create a new bus over an existing connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MessageBus for PostgresMessageBus {
    #[instrument(skip(self))]
    async fn ensure_subscription(&self, spec: &SubscriptionSpec) -> Result<(), BusError> {
        let (filter_property, filter_value) = match &spec.filter {
            Some((p, v)) => (Some(p.as_str()), Some(v.as_str())),
            None => (None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO bus_subscriptions (topic, name, filter_property, filter_value)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (topic, name) DO NOTHING
            "#,
        )
        .bind(&spec.topic)
        .bind(&spec.name)
        .bind(filter_property)
        .bind(filter_value)
        .execute(&self.pool)
        .await
        .map_err(|e| BusError::Database(e.to_string()))?;

        Ok(())
    }

    #[instrument(skip(self, message), fields(topic = %message.topic))]
    async fn publish(&self, message: BusMessage) -> Result<PublishOutcome, BusError> {
        let now = Utc::now();
        let visible_at = message.visible_at.unwrap_or(now);
        let ttl = message.ttl.unwrap_or(DEFAULT_TTL);
        let expires_at = visible_at
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(7));
        let properties = serde_json::to_value(&message.properties)
            .map_err(|e| BusError::Serialization(e.to_string()))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BusError::Database(e.to_string()))?;

        // Duplicate detection: drop the publish if this (topic, message id)
        // was seen inside the window
        if let Some(message_id) = &message.message_id {
            let window =
                now - chrono::Duration::from_std(DEDUP_WINDOW).unwrap_or_else(|_| {
                    chrono::Duration::minutes(10)
                });

            sqlx::query("DELETE FROM bus_message_ids WHERE published_at < $1")
                .bind(window)
                .execute(&mut *tx)
                .await
                .map_err(|e| BusError::Database(e.to_string()))?;

            let claimed = sqlx::query(
                r#"
                INSERT INTO bus_message_ids (topic, message_id, published_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (topic, message_id) DO NOTHING
                "#,
            )
            .bind(&message.topic)
            .bind(message_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| BusError::Database(e.to_string()))?;

            if claimed.rows_affected() == 0 {
                tx.commit()
                    .await
                    .map_err(|e| BusError::Database(e.to_string()))?;
                debug!(message_id, "duplicate publish suppressed");
                return Ok(PublishOutcome::Duplicate);
            }
        }

        // Fan out to matching subscriptions; the filter compares one
        // application property against the subscription's bound value
        sqlx::query(
            r#"
            INSERT INTO bus_deliveries
                (subscription_id, topic, message_id, body, properties, visible_at, expires_at)
            SELECT s.id, $1, $2, $3, $4, $5, $6
            FROM bus_subscriptions s
            WHERE s.topic = $1
              AND (s.filter_property IS NULL
                   OR $4::jsonb ->> s.filter_property = s.filter_value)
            "#,
        )
        .bind(&message.topic)
        .bind(&message.message_id)
        .bind(&message.body)
        .bind(&properties)
        .bind(visible_at)
        .bind(expires_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| BusError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| BusError::Database(e.to_string()))?;

        Ok(PublishOutcome::Published)
    }

    #[instrument(skip(self))]
    async fn receive(
        &self,
        topic: &str,
        subscription: &str,
        max: usize,
        lock: Duration,
    ) -> Result<Vec<ReceivedMessage>, BusError> {
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT d.id
                FROM bus_deliveries d
                JOIN bus_subscriptions s ON d.subscription_id = s.id
                WHERE s.topic = $1 AND s.name = $2
                  AND d.visible_at <= NOW()
                  AND (d.locked_until IS NULL OR d.locked_until <= NOW())
                  AND d.expires_at > NOW()
                ORDER BY d.visible_at, d.id
                LIMIT $3
                FOR UPDATE OF d SKIP LOCKED
            )
            UPDATE bus_deliveries t
            SET locked_until = NOW() + $4 * INTERVAL '1 second',
                attempt = attempt + 1
            FROM claimable c
            WHERE t.id = c.id
            RETURNING t.id, t.topic, t.message_id, t.body, t.properties, t.attempt
            "#,
        )
        .bind(topic)
        .bind(subscription)
        .bind(max as i64)
        .bind(lock.as_secs() as f64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BusError::Database(e.to_string()))?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let properties_json: serde_json::Value = row.get("properties");
            let properties: BTreeMap<String, String> = serde_json::from_value(properties_json)
                .map_err(|e| BusError::Serialization(e.to_string()))?;

            messages.push(ReceivedMessage {
                delivery_id: row.get("id"),
                topic: row.get("topic"),
                message_id: row.get("message_id"),
                body: row.get("body"),
                properties,
                attempt: row.get("attempt"),
            });
        }

        if !messages.is_empty() {
            debug!(topic, subscription, count = messages.len(), "claimed messages");
        }

        Ok(messages)
    }

    async fn complete(&self, delivery_id: i64) -> Result<(), BusError> {
        let result = sqlx::query("DELETE FROM bus_deliveries WHERE id = $1")
            .bind(delivery_id)
            .execute(&self.pool)
            .await
            .map_err(|e| BusError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(BusError::DeliveryNotFound(delivery_id));
        }
        Ok(())
    }

    async fn abandon(&self, delivery_id: i64) -> Result<(), BusError> {
        sqlx::query("UPDATE bus_deliveries SET locked_until = NULL WHERE id = $1")
            .bind(delivery_id)
            .execute(&self.pool)
            .await
            .map_err(|e| BusError::Database(e.to_string()))?;

        Ok(())
    }

    async fn renew_lock(&self, delivery_id: i64, lock: Duration) -> Result<(), BusError> {
        let result = sqlx::query(
            r#"
            UPDATE bus_deliveries
            SET locked_until = NOW() + $2 * INTERVAL '1 second'
            WHERE id = $1 AND locked_until IS NOT NULL
            "#,
        )
        .bind(delivery_id)
        .bind(lock.as_secs() as f64)
        .execute(&self.pool)
        .await
        .map_err(|e| BusError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(BusError::DeliveryNotFound(delivery_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn dead_letter_expired(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<u64, BusError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BusError::Database(e.to_string()))?;

        let rows = sqlx::query(
            r#"
            SELECT d.id
            FROM bus_deliveries d
            JOIN bus_subscriptions s ON d.subscription_id = s.id
            WHERE s.topic = $1 AND s.name = $2
              AND d.expires_at <= NOW()
              AND (d.locked_until IS NULL OR d.locked_until <= NOW())
            FOR UPDATE OF d SKIP LOCKED
            "#,
        )
        .bind(topic)
        .bind(subscription)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| BusError::Database(e.to_string()))?;

        let ids: Vec<i64> = rows.iter().map(|r| r.get("id")).collect();
        if ids.is_empty() {
            tx.commit()
                .await
                .map_err(|e| BusError::Database(e.to_string()))?;
            return Ok(0);
        }

        sqlx::query(
            r#"
            INSERT INTO bus_dead_letters
                (subscription_id, topic, message_id, body, properties, attempt, reason)
            SELECT subscription_id, topic, message_id, body, properties, attempt, 'expired'
            FROM bus_deliveries
            WHERE id = ANY($1)
            "#,
        )
        .bind(&ids)
        .execute(&mut *tx)
        .await
        .map_err(|e| BusError::Database(e.to_string()))?;

        sqlx::query("DELETE FROM bus_deliveries WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&mut *tx)
            .await
            .map_err(|e| BusError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| BusError::Database(e.to_string()))?;

        debug!(topic, subscription, count = ids.len(), "dead-lettered expired messages");
        Ok(ids.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    // Behavior is covered against the in-memory implementation; the
    // PostgreSQL paths are exercised by the ignored integration tests in
    // tests/postgres_bus_test.rs, which need a database.
}
