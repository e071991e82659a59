//! PostgreSQL bus integration tests
//!
//! Require a running database with the convoy-storage migrations applied:
//!
//! ```sh
//! DATABASE_URL=postgres://localhost/convoy_test cargo test -p convoy-bus -- --ignored
//! ```

use std::time::Duration;

use convoy_bus::{BusMessage, MessageBus, PostgresMessageBus, PublishOutcome, SubscriptionSpec};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

async fn connect() -> Option<PostgresMessageBus> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;
    Some(PostgresMessageBus::new(pool))
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn publish_receive_complete_roundtrip() {
    let Some(bus) = connect().await else {
        panic!("DATABASE_URL not set");
    };

    // Unique names keep reruns isolated
    let topic = format!("it-{}", Uuid::new_v4());
    let sub = "consumer";
    bus.ensure_subscription(&SubscriptionSpec::new(&topic, sub))
        .await
        .unwrap();

    bus.publish(BusMessage::new(&topic, json!({"BatchId": 1})))
        .await
        .unwrap();

    let messages = bus
        .receive(&topic, sub, 10, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].body, json!({"BatchId": 1}));

    bus.complete(messages[0].delivery_id).await.unwrap();
    let messages = bus
        .receive(&topic, sub, 10, Duration::from_secs(30))
        .await
        .unwrap();
    assert!(messages.is_empty());
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn duplicate_detection_across_connections() {
    let Some(bus) = connect().await else {
        panic!("DATABASE_URL not set");
    };

    let topic = format!("it-{}", Uuid::new_v4());
    bus.ensure_subscription(&SubscriptionSpec::new(&topic, "consumer"))
        .await
        .unwrap();

    let id = format!("job-{}", Uuid::new_v4());
    let first = bus
        .publish(BusMessage::new(&topic, json!({})).with_message_id(&id))
        .await
        .unwrap();
    let second = bus
        .publish(BusMessage::new(&topic, json!({})).with_message_id(&id))
        .await
        .unwrap();

    assert_eq!(first, PublishOutcome::Published);
    assert_eq!(second, PublishOutcome::Duplicate);
}
