//! Session rows: one logical conversation grouping per launched runner;
//! counters fold in from heartbeats.

use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::Result;
use crate::model::Session;

const SESSION_COLUMNS: &str = r#"
    id, project_id, runner_id, started_at, ended_at,
    message_count, tokens_total, transcript_uri
"#;

pub async fn create(
    tx: &mut Transaction<'_, Postgres>,
    project_id: Uuid,
    runner_id: Uuid,
) -> Result<Session> {
    let session = sqlx::query_as::<_, Session>(&format!(
        r#"
        INSERT INTO sessions (id, project_id, runner_id)
        VALUES ($1, $2, $3)
        RETURNING {SESSION_COLUMNS}
        "#,
    ))
    .bind(Uuid::new_v4())
    .bind(project_id)
    .bind(runner_id)
    .fetch_one(&mut **tx)
    .await?;

    Ok(session)
}

/// Close any open session attached to the runner; returns the session ids so
/// the caller can emit `session.ended` events.
pub async fn end_for_runner(
    tx: &mut Transaction<'_, Postgres>,
    runner_id: Uuid,
) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        UPDATE sessions
        SET ended_at = now()
        WHERE runner_id = $1 AND ended_at IS NULL
        RETURNING id
        "#,
    )
    .bind(runner_id)
    .fetch_all(&mut **tx)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn add_tokens(
    tx: &mut Transaction<'_, Postgres>,
    runner_id: Uuid,
    tokens_delta: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE sessions
        SET tokens_total = tokens_total + $2
        WHERE runner_id = $1 AND ended_at IS NULL
        "#,
    )
    .bind(runner_id)
    .bind(tokens_delta)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

pub async fn list(pool: &PgPool, project_id: Option<Uuid>) -> Result<Vec<Session>> {
    let mut sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE TRUE");
    if project_id.is_some() {
        sql.push_str(" AND project_id = $1");
    }
    sql.push_str(" ORDER BY started_at DESC");

    let mut query = sqlx::query_as::<_, Session>(&sql);
    if let Some(project_id) = project_id {
        query = query.bind(project_id);
    }

    Ok(query.fetch_all(pool).await?)
}
