//! Transactional outbox for reliable event publishing.
//!
//! State changes and the events describing them commit in one database
//! transaction; a background processor drains undelivered rows to the broker
//! and marks them delivered only after a publisher confirm. Delivery is
//! at-least-once and rows are never deleted: delivery is recorded by flipping
//! the `delivered` flag, and rows that exhaust their retry budget stay in the
//! table flagged by their attempt count.
//!
//! Multiple processor instances may run concurrently: the claim query uses
//! `FOR UPDATE SKIP LOCKED`, so each pending row is handed to exactly one
//! claimant at a time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use event_schema::{entity, routing, AlertSeverity, EventEnvelope};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

mod error;
pub mod metrics;

pub use error::{OutboxError, OutboxResult};
pub use metrics::OutboxMetrics;

/// One pending event row.
///
/// Inserted only inside the transaction that produced the state change it
/// describes.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxEvent {
    pub id: Uuid,
    /// Topic-exchange routing key (e.g. "runner.started.api").
    pub routing_key: String,
    /// Serialized event envelope.
    pub payload: serde_json::Value,
    /// Number of failed publish attempts so far.
    pub attempts: i32,
    /// Earliest instant the processor may try (again).
    pub next_retry_at: DateTime<Utc>,
    pub delivered: bool,
    pub delivered_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OutboxEvent {
    pub fn new(routing_key: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            routing_key: routing_key.into(),
            payload,
            attempts: 0,
            next_retry_at: now,
            delivered: false,
            delivered_at: None,
            last_error: None,
            created_at: now,
        }
    }

    /// Wrap an event envelope; the envelope's `event_id` rides along in the
    /// payload so consumers can dedupe.
    pub fn for_envelope(
        routing_key: impl Into<String>,
        envelope: &EventEnvelope,
    ) -> OutboxResult<Self> {
        Ok(Self::new(routing_key, serde_json::to_value(envelope)?))
    }
}

/// Insert a new event inside the caller's transaction.
///
/// This is the only write path for new rows: an outbox row exists exactly
/// when the transaction that produced the matching state change commits.
pub async fn insert_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    event: &OutboxEvent,
) -> OutboxResult<()> {
    sqlx::query(
        r#"
        INSERT INTO outbox_events (
            id, routing_key, payload, attempts, next_retry_at,
            delivered, delivered_at, last_error, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(event.id)
    .bind(&event.routing_key)
    .bind(&event.payload)
    .bind(event.attempts)
    .bind(event.next_retry_at)
    .bind(event.delivered)
    .bind(event.delivered_at)
    .bind(&event.last_error)
    .bind(event.created_at)
    .execute(&mut **tx)
    .await?;

    debug!(
        event_id = %event.id,
        routing_key = %event.routing_key,
        "event inserted into outbox"
    );

    Ok(())
}

/// SQLx-backed repository over the `outbox_events` table.
pub struct SqlxOutboxRepository {
    pool: PgPool,
}

impl SqlxOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a new event inside the caller's transaction.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &OutboxEvent,
    ) -> OutboxResult<()> {
        insert_in_tx(tx, event).await
    }

    /// Claim up to `batch` pending rows due for (re)delivery.
    ///
    /// `FOR UPDATE SKIP LOCKED` makes the claim exclusive among concurrent
    /// processors: a row locked by one claimant is invisible to the others
    /// until that transaction ends.
    pub async fn claim_pending(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        batch: i64,
        max_attempts: i32,
    ) -> OutboxResult<Vec<OutboxEvent>> {
        let rows = sqlx::query_as::<_, OutboxEvent>(
            r#"
            SELECT id, routing_key, payload, attempts, next_retry_at,
                   delivered, delivered_at, last_error, created_at
            FROM outbox_events
            WHERE delivered = FALSE
              AND attempts < $2
              AND next_retry_at <= now()
            ORDER BY next_retry_at ASC, created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(batch)
        .bind(max_attempts)
        .fetch_all(&mut **tx)
        .await?;

        debug!(count = rows.len(), "claimed pending outbox events");

        Ok(rows)
    }

    /// Record successful delivery for the given rows.
    pub async fn mark_delivered(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        ids: &[Uuid],
    ) -> OutboxResult<()> {
        sqlx::query(
            r#"
            UPDATE outbox_events
            SET delivered = TRUE, delivered_at = now()
            WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Record a failed attempt and schedule the next retry.
    pub async fn record_failure(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> OutboxResult<()> {
        sqlx::query(
            r#"
            UPDATE outbox_events
            SET attempts = attempts + 1,
                last_error = $2,
                next_retry_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(next_retry_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Pending count and oldest pending age in seconds (0 when none pending).
    pub async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        let row: (i64, Option<i64>) = sqlx::query_as(
            r#"
            SELECT COUNT(*)::BIGINT,
                   EXTRACT(EPOCH FROM (now() - MIN(created_at)))::BIGINT
            FROM outbox_events
            WHERE delivered = FALSE
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok((row.0, row.1.unwrap_or(0)))
    }

    /// Rows that exhausted their retry budget and need operator attention.
    pub async fn dead_count(&self, max_attempts: i32) -> OutboxResult<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)::BIGINT
            FROM outbox_events
            WHERE delivered = FALSE AND attempts >= $1
            "#,
        )
        .bind(max_attempts)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }
}

/// Publisher abstraction so the processor can be driven against a fake broker
/// in tests.
#[async_trait::async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &OutboxEvent) -> OutboxResult<()>;
}

/// Publishes outbox rows through the AMQP broker client, one confirm per
/// message.
pub struct AmqpEventPublisher {
    client: Arc<broker_client::BrokerClient>,
    confirm_timeout: Duration,
}

impl AmqpEventPublisher {
    pub fn new(client: Arc<broker_client::BrokerClient>, confirm_timeout: Duration) -> Self {
        Self {
            client,
            confirm_timeout,
        }
    }
}

#[async_trait::async_trait]
impl EventPublisher for AmqpEventPublisher {
    async fn publish(&self, event: &OutboxEvent) -> OutboxResult<()> {
        let body = serde_json::to_vec(&event.payload)?;
        self.client
            .publish(&event.routing_key, &body, self.confirm_timeout)
            .await
            .map_err(|e| OutboxError::Publish(e.to_string()))?;

        debug!(
            event_id = %event.id,
            routing_key = %event.routing_key,
            "event published to broker"
        );

        Ok(())
    }
}

/// Retry backoff schedule.
pub mod backoff {
    use super::Duration;
    use rand::Rng;

    /// `min(max, base * 2^attempts)`.
    pub fn delay(attempts: i32, base: Duration, max: Duration) -> Duration {
        let exp = attempts.clamp(0, 30) as u32;
        base.checked_mul(2u32.saturating_pow(exp))
            .unwrap_or(max)
            .min(max)
    }

    /// Additive jitter of up to 250ms so concurrent processors don't retry in
    /// lockstep.
    pub fn with_jitter(d: Duration) -> Duration {
        d + Duration::from_millis(rand::thread_rng().gen_range(0..=250))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        const BASE: Duration = Duration::from_secs(1);
        const MAX: Duration = Duration::from_secs(300);

        #[test]
        fn delay_doubles_per_attempt() {
            assert_eq!(delay(0, BASE, MAX), Duration::from_secs(1));
            assert_eq!(delay(1, BASE, MAX), Duration::from_secs(2));
            assert_eq!(delay(2, BASE, MAX), Duration::from_secs(4));
            assert_eq!(delay(3, BASE, MAX), Duration::from_secs(8));
        }

        #[test]
        fn delay_is_capped() {
            assert_eq!(delay(10, BASE, MAX), MAX);
            assert_eq!(delay(60, BASE, MAX), MAX);
        }

        #[test]
        fn jitter_stays_within_bound() {
            for _ in 0..100 {
                let jittered = with_jitter(BASE);
                assert!(jittered >= BASE);
                assert!(jittered <= BASE + Duration::from_millis(250));
            }
        }
    }
}

/// Processor tuning knobs.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub batch_size: i64,
    pub poll_interval: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: i32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(2),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            max_attempts: 10,
        }
    }
}

/// Background loop draining the outbox to the broker.
///
/// Rows are claimed, published, and marked delivered within one transaction,
/// so a crash between publish and commit re-delivers (at-least-once). Empty
/// and failing cycles stretch the poll interval up to 8x to avoid hammering a
/// dead broker.
pub struct OutboxProcessor<P: EventPublisher> {
    repository: SqlxOutboxRepository,
    publisher: Arc<P>,
    config: ProcessorConfig,
    metrics: Option<OutboxMetrics>,
}

impl<P: EventPublisher> OutboxProcessor<P> {
    pub fn new(pool: PgPool, publisher: Arc<P>, config: ProcessorConfig) -> Self {
        Self {
            repository: SqlxOutboxRepository::new(pool),
            publisher,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run until the shutdown channel fires. In-flight batches complete
    /// before the loop exits.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_attempts = self.config.max_attempts,
            "outbox processor starting"
        );

        let max_idle = self.config.poll_interval * 8;
        let mut idle = self.config.poll_interval;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("outbox processor stopping");
                    break;
                }
                _ = tokio::time::sleep(idle) => {}
            }

            match self.process_batch().await {
                Ok(0) => {
                    idle = (idle * 2).min(max_idle);
                }
                Ok(count) => {
                    debug!(published = count, "drained outbox batch");
                    idle = self.config.poll_interval;
                }
                Err(e) => {
                    error!(error = %e, "outbox batch failed");
                    idle = (idle * 2).min(max_idle);
                }
            }

            if let Some(metrics) = &self.metrics {
                if let Ok((pending, age)) = self.repository.pending_stats().await {
                    metrics.pending.set(pending);
                    metrics.oldest_pending_age_seconds.set(age);
                }
            }
        }
    }

    /// Process one claimed batch; returns the number of rows delivered.
    async fn process_batch(&self) -> OutboxResult<usize> {
        let mut tx = self.repository.pool().begin().await?;
        let batch = self
            .repository
            .claim_pending(&mut tx, self.config.batch_size, self.config.max_attempts)
            .await?;

        let mut published = 0usize;

        for event in &batch {
            match self.publisher.publish(event).await {
                Ok(()) => {
                    self.repository.mark_delivered(&mut tx, &[event.id]).await?;
                    published += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.published.inc();
                    }
                }
                Err(e) => {
                    let attempts = event.attempts + 1;
                    let delay = backoff::with_jitter(backoff::delay(
                        attempts,
                        self.config.base_backoff,
                        self.config.max_backoff,
                    ));
                    let next_retry_at = Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(300));

                    warn!(
                        event_id = %event.id,
                        routing_key = %event.routing_key,
                        attempts,
                        error = %e,
                        "publish failed, retry scheduled"
                    );

                    self.repository
                        .record_failure(&mut tx, event.id, &e.to_string(), next_retry_at)
                        .await?;

                    if attempts >= self.config.max_attempts {
                        self.flag_dead(&mut tx, event, &e).await?;
                    }
                }
            }
        }

        tx.commit().await?;
        Ok(published)
    }

    /// The row exhausted its retry budget: leave it undelivered (rows are
    /// never deleted) and raise a critical alert through the outbox itself.
    async fn flag_dead(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &OutboxEvent,
        cause: &OutboxError,
    ) -> OutboxResult<()> {
        error!(
            event_id = %event.id,
            routing_key = %event.routing_key,
            attempts = event.attempts + 1,
            "outbox event exhausted retries, flagging dead"
        );

        let envelope = EventEnvelope::new(
            "system.alert",
            entity::DAEMON,
            "outbox",
            serde_json::json!({
                "alert": "outbox event undeliverable",
                "dead_event_id": event.id,
                "routing_key": event.routing_key,
                "attempts": event.attempts + 1,
                "last_error": cause.to_string(),
            }),
        );
        let alert = OutboxEvent::for_envelope(
            routing::system_alert(AlertSeverity::Critical),
            &envelope,
        )?;
        self.repository.insert(tx, &alert).await?;

        if let Some(metrics) = &self.metrics {
            metrics.dead.inc();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_event_starts_undelivered_and_due() {
        let event = OutboxEvent::new("runner.started.p1", serde_json::json!({"k": "v"}));
        assert!(!event.delivered);
        assert_eq!(event.attempts, 0);
        assert!(event.delivered_at.is_none());
        assert!(event.last_error.is_none());
        assert!(event.next_retry_at <= Utc::now());
    }

    #[test]
    fn for_envelope_embeds_event_id() {
        let envelope = EventEnvelope::new(
            "runner.started",
            entity::RUNNER,
            "r-1",
            serde_json::json!({}),
        );
        let row = OutboxEvent::for_envelope("runner.started.p1", &envelope).unwrap();
        assert_eq!(
            row.payload.get("event_id").and_then(|v| v.as_str()),
            Some(envelope.event_id.to_string().as_str())
        );
    }
}
