//! Runner rows: admission inserts, heartbeat folds, terminal transitions,
//! and the stale-runner reaper.

use chrono::{DateTime, Utc};
use event_schema::{entity, routing, EventEnvelope};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::db::event_repo;
use crate::error::Result;
use crate::model::{RestartPolicy, Runner, RunnerStatus};

const RUNNER_COLUMNS: &str = r#"
    id, project_id, status, pid, launched_at, last_heartbeat_at,
    cpu_percent, memory_mb, tokens_used, exit_code, restart_policy,
    agent_version, updated_at
"#;

pub async fn insert(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    project_id: Uuid,
    restart_policy: RestartPolicy,
) -> Result<Runner> {
    let runner = sqlx::query_as::<_, Runner>(&format!(
        r#"
        INSERT INTO runners (id, project_id, status, restart_policy)
        VALUES ($1, $2, 'starting', $3)
        RETURNING {RUNNER_COLUMNS}
        "#,
    ))
    .bind(id)
    .bind(project_id)
    .bind(restart_policy)
    .fetch_one(&mut **tx)
    .await?;

    Ok(runner)
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Option<Runner>> {
    Ok(sqlx::query_as::<_, Runner>(&format!(
        "SELECT {RUNNER_COLUMNS} FROM runners WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?)
}

pub async fn list(
    pool: &PgPool,
    project_id: Option<Uuid>,
    active_only: bool,
) -> Result<Vec<Runner>> {
    let mut sql = format!("SELECT {RUNNER_COLUMNS} FROM runners WHERE TRUE");
    if project_id.is_some() {
        sql.push_str(" AND project_id = $1");
    }
    if active_only {
        sql.push_str(" AND status IN ('starting', 'running', 'paused', 'stopping')");
    }
    sql.push_str(" ORDER BY launched_at DESC");

    let mut query = sqlx::query_as::<_, Runner>(&sql);
    if let Some(project_id) = project_id {
        query = query.bind(project_id);
    }

    Ok(query.fetch_all(pool).await?)
}

/// Active-runner count for quota admission; runs inside the admission
/// transaction under the project advisory lock.
pub async fn count_active(tx: &mut Transaction<'_, Postgres>, project_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*)::BIGINT FROM runners
        WHERE project_id = $1
          AND status IN ('starting', 'running', 'paused', 'stopping')
        "#,
    )
    .bind(project_id)
    .fetch_one(&mut **tx)
    .await?;

    Ok(row.0)
}

pub async fn set_pid(pool: &PgPool, id: Uuid, pid: i64) -> Result<()> {
    sqlx::query("UPDATE runners SET pid = $2, updated_at = now() WHERE id = $1")
        .bind(id)
        .bind(pid)
        .execute(pool)
        .await?;
    Ok(())
}

/// Promote `starting -> running`; a no-op for any other current status, so
/// both the first heartbeat and the spawn-confirm timer may call it.
pub async fn mark_running(pool: &PgPool, id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE runners SET status = 'running', updated_at = now() WHERE id = $1 AND status = 'starting'",
    )
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn mark_stopping(pool: &PgPool, id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE runners SET status = 'stopping', updated_at = now()
        WHERE id = $1 AND status IN ('starting', 'running', 'paused')
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn get_for_update(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
) -> Result<Option<Runner>> {
    Ok(sqlx::query_as::<_, Runner>(&format!(
        "SELECT {RUNNER_COLUMNS} FROM runners WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?)
}

/// Fold one heartbeat sample into the runner row. The heartbeat timestamp is
/// server-side receipt time; the sample carries none that we trust.
#[allow(clippy::too_many_arguments)]
pub async fn apply_heartbeat(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    status: RunnerStatus,
    cpu_percent: f64,
    memory_mb: f64,
    tokens_delta: i64,
    agent_version: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE runners
        SET status = $2,
            last_heartbeat_at = now(),
            cpu_percent = $3,
            memory_mb = $4,
            tokens_used = tokens_used + $5,
            agent_version = COALESCE($6, agent_version),
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(status)
    .bind(cpu_percent)
    .bind(memory_mb)
    .bind(tokens_delta)
    .bind(agent_version)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Terminal transition, guarded so a runner the reaper already failed is not
/// transitioned twice. Returns the project id and the pre-transition status
/// when the update took effect.
pub async fn mark_terminal(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    status: RunnerStatus,
    exit_code: Option<i32>,
) -> Result<Option<(Uuid, RunnerStatus)>> {
    debug_assert!(status.is_terminal());

    let row: Option<(Uuid, RunnerStatus)> = sqlx::query_as(
        r#"
        UPDATE runners r
        SET status = $2, exit_code = $3, updated_at = now()
        FROM (SELECT id, status AS prev_status FROM runners WHERE id = $1 FOR UPDATE) old
        WHERE r.id = old.id
          AND old.prev_status IN ('starting', 'running', 'paused', 'stopping')
        RETURNING r.project_id, old.prev_status
        "#,
    )
    .bind(id)
    .bind(status)
    .bind(exit_code)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(row)
}

/// A runner reaped for heartbeat expiry.
#[derive(Debug, Clone)]
pub struct ReapedRunner {
    pub runner_id: Uuid,
    pub project_id: Uuid,
    pub project_name: String,
    pub previous_status: RunnerStatus,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

/// Fail every live runner whose last heartbeat (or launch, if it never
/// heartbeated) is older than `ttl`, and insert one `runner.failed.*` outbox
/// row per victim, all in the caller's transaction.
pub async fn reap_stale(
    tx: &mut Transaction<'_, Postgres>,
    ttl_seconds: i64,
) -> Result<Vec<ReapedRunner>> {
    let rows: Vec<(Uuid, Uuid, String, RunnerStatus, Option<DateTime<Utc>>)> = sqlx::query_as(
        r#"
        WITH victims AS (
            SELECT r.id, r.status AS prev_status, r.project_id, r.last_heartbeat_at, p.name
            FROM runners r
            JOIN projects p ON r.project_id = p.id
            WHERE r.status IN ('starting', 'running')
              AND COALESCE(r.last_heartbeat_at, r.launched_at) < now() - make_interval(secs => $1)
            FOR UPDATE OF r
        )
        UPDATE runners r
        SET status = 'failed', updated_at = now()
        FROM victims v
        WHERE r.id = v.id
        RETURNING r.id, v.project_id, v.name, v.prev_status, v.last_heartbeat_at
        "#,
    )
    .bind(ttl_seconds as f64)
    .fetch_all(&mut **tx)
    .await?;

    let mut reaped = Vec::with_capacity(rows.len());
    for (runner_id, project_id, project_name, previous_status, last_heartbeat_at) in rows {
        crate::db::project_repo::adjust_runner_count(tx, project_id, -1).await?;

        let envelope = EventEnvelope::new(
            "runner.failed",
            entity::RUNNER,
            runner_id.to_string(),
            serde_json::json!({
                "project_id": project_id,
                "reason": "heartbeat expired",
                "last_heartbeat_at": last_heartbeat_at,
            }),
        );
        event_repo::append(tx, &envelope, &routing::runner_failed(&project_name)).await?;

        reaped.push(ReapedRunner {
            runner_id,
            project_id,
            project_name,
            previous_status,
            last_heartbeat_at,
        });
    }

    Ok(reaped)
}
