//! Append-only audit events.
//!
//! `append` writes the durable event row and the matching outbox row in the
//! caller's transaction, so the audit trail, the state change, and the
//! pending publication commit or roll back together.

use chrono::{DateTime, Utc};
use event_schema::EventEnvelope;
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use transactional_outbox::OutboxEvent;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct EventRecord {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub kind: String,
    pub occurred_at: DateTime<Utc>,
    pub actor: String,
    pub payload: serde_json::Value,
    pub integrity_tag: String,
}

/// Append the audit row and enqueue the broker publication.
pub async fn append(
    tx: &mut Transaction<'_, Postgres>,
    envelope: &EventEnvelope,
    routing_key: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO events (id, entity_type, entity_id, kind, occurred_at, actor, payload, integrity_tag)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(envelope.event_id)
    .bind(&envelope.entity_type)
    .bind(&envelope.entity_id)
    .bind(&envelope.kind)
    .bind(envelope.timestamp)
    .bind(&envelope.actor)
    .bind(&envelope.data)
    .bind(envelope.integrity_tag())
    .execute(&mut **tx)
    .await?;

    let outbox_row = OutboxEvent::for_envelope(routing_key, envelope)?;
    transactional_outbox::insert_in_tx(tx, &outbox_row).await?;

    Ok(())
}

/// Audit retrieval, newest first.
pub async fn list_for_entity(
    pool: &PgPool,
    entity_type: &str,
    entity_id: &str,
    limit: i64,
) -> Result<Vec<EventRecord>> {
    Ok(sqlx::query_as::<_, EventRecord>(
        r#"
        SELECT id, entity_type, entity_id, kind, occurred_at, actor, payload, integrity_tag
        FROM events
        WHERE entity_type = $1 AND entity_id = $2
        ORDER BY occurred_at DESC
        LIMIT $3
        "#,
    )
    .bind(entity_type)
    .bind(entity_id)
    .bind(limit)
    .fetch_all(pool)
    .await?)
}
