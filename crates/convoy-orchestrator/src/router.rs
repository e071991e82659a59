//! Event router: the bus-facing consumer loops
//!
//! One consumer per subscription (`orchestrator-events`, `worker-results`),
//! each claiming up to `prefetch` messages and handling them concurrently.
//! A handler error abandons the message so the bus redelivers it; decode
//! failures complete the message (a poison payload never becomes a hot
//! loop). Expired messages are swept to the dead-letter store whenever a
//! loop goes idle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use convoy_bus::{MessageBus, ReceivedMessage, SubscriptionSpec};
use convoy_core::{
    OrchestratorEvent, WorkerResult, PROP_MESSAGE_TYPE, SUB_ORCHESTRATOR,
    TOPIC_ORCHESTRATOR_EVENTS, TOPIC_WORKER_RESULTS,
};

use crate::Orchestrator;

/// Consumer tunables
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Messages claimed per receive call, handled concurrently
    pub prefetch: usize,

    /// Message lock duration; must exceed worst-case handler latency
    pub lock: Duration,

    /// Sleep when a subscription is empty
    pub idle_wait: Duration,

    /// Sleep after a receive error before trying again
    pub error_backoff: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            prefetch: 10,
            lock: Duration::from_secs(60),
            idle_wait: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
        }
    }
}

impl RouterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn with_lock(mut self, lock: Duration) -> Self {
        self.lock = lock;
        self
    }

    /// Read overrides from the environment (`CONVOY_PREFETCH`)
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(prefetch) = std::env::var("CONVOY_PREFETCH")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
        {
            config.prefetch = prefetch.max(1);
        }
        config
    }
}

/// Which subscription a consumer loop drains
#[derive(Debug, Clone, Copy)]
enum Stream {
    Events,
    Results,
}

impl Stream {
    fn topic(&self) -> &'static str {
        match self {
            Self::Events => TOPIC_ORCHESTRATOR_EVENTS,
            Self::Results => TOPIC_WORKER_RESULTS,
        }
    }
}

pub struct EventRouter {
    orchestrator: Arc<Orchestrator>,
    bus: Arc<dyn MessageBus>,
    config: RouterConfig,
}

impl EventRouter {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        bus: Arc<dyn MessageBus>,
        config: RouterConfig,
    ) -> Self {
        Self {
            orchestrator,
            bus,
            config,
        }
    }

    /// Run both consumer loops until shutdown
    pub async fn run(&self, shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        self.bus
            .ensure_subscription(&SubscriptionSpec::new(
                TOPIC_ORCHESTRATOR_EVENTS,
                SUB_ORCHESTRATOR,
            ))
            .await?;
        self.bus
            .ensure_subscription(&SubscriptionSpec::new(TOPIC_WORKER_RESULTS, SUB_ORCHESTRATOR))
            .await?;

        info!(prefetch = self.config.prefetch, "event router running");

        tokio::join!(
            self.consume(Stream::Events, shutdown_rx.clone()),
            self.consume(Stream::Results, shutdown_rx),
        );

        info!("event router stopped");
        Ok(())
    }

    /// Consumer loop over one subscription
    async fn consume(&self, stream: Stream, mut shutdown_rx: watch::Receiver<bool>) {
        let topic = stream.topic();
        loop {
            if *shutdown_rx.borrow() {
                return;
            }

            let batch = match self
                .bus
                .receive(topic, SUB_ORCHESTRATOR, self.config.prefetch, self.config.lock)
                .await
            {
                Ok(messages) => messages,
                Err(e) => {
                    error!(topic, error = %e, "receive failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                if let Err(e) = self.bus.dead_letter_expired(topic, SUB_ORCHESTRATOR).await {
                    warn!(topic, error = %e, "dead-letter sweep failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.config.idle_wait) => {}
                    _ = shutdown_rx.changed() => {}
                }
                continue;
            }

            // In-flight handlers run to completion within the lock window;
            // unacked messages return to the subscription on their own
            join_all(batch.iter().map(|message| self.settle(stream, message))).await;
        }
    }

    /// Handle one claimed message and settle it: complete on success,
    /// abandon on handler error so the bus redelivers.
    async fn settle(&self, stream: Stream, message: &ReceivedMessage) {
        let outcome = match stream {
            Stream::Events => self.process_event(message).await,
            Stream::Results => self.process_result(message).await,
        };

        match outcome {
            Ok(()) => {
                if let Err(e) = self.bus.complete(message.delivery_id).await {
                    warn!(delivery_id = message.delivery_id, error = %e, "complete failed");
                }
            }
            Err(e) => {
                warn!(
                    delivery_id = message.delivery_id,
                    attempt = message.attempt,
                    error = %e,
                    "handler failed, message returns to subscription"
                );
                if let Err(abandon_err) = self.bus.abandon(message.delivery_id).await {
                    warn!(delivery_id = message.delivery_id, error = %abandon_err, "abandon failed");
                }
            }
        }
    }

    /// Decode and dispatch one orchestrator event. Decode failures are
    /// poison: completed and logged, never retried.
    async fn process_event(&self, message: &ReceivedMessage) -> Result<()> {
        let message_type = message.property(PROP_MESSAGE_TYPE).unwrap_or_default();
        match OrchestratorEvent::decode(message_type, &message.body) {
            Ok(event) => {
                debug!(message_type, attempt = message.attempt, "handling event");
                self.orchestrator.handle_event(&event).await
            }
            Err(e) => {
                warn!(message_type, error = %e, "undecodable event dropped");
                Ok(())
            }
        }
    }

    /// Decode and process one worker result
    async fn process_result(&self, message: &ReceivedMessage) -> Result<()> {
        match serde_json::from_value::<WorkerResult>(message.body.clone()) {
            Ok(result) => {
                debug!(job_id = %result.job_id, attempt = message.attempt, "handling result");
                self.orchestrator.process_worker_result(&result).await
            }
            Err(e) => {
                warn!(error = %e, "undecodable worker result dropped");
                Ok(())
            }
        }
    }
}
