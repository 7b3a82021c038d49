//! Project rows and their resource quotas.

use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::model::{Project, ProjectStatus, ResourceQuota};

pub struct NewProject {
    pub name: String,
    pub path: String,
    pub description: String,
    pub max_concurrent_runners: i32,
    pub max_memory_mb: i64,
    pub max_tokens_per_day: i64,
}

/// Insert the project and its quota row in one transaction.
pub async fn create(tx: &mut Transaction<'_, Postgres>, new: &NewProject) -> Result<Project> {
    let project = sqlx::query_as::<_, Project>(
        r#"
        INSERT INTO projects (id, name, path, description, status)
        VALUES ($1, $2, $3, $4, 'active')
        RETURNING id, name, path, description, status, runner_count, tokens_total,
                  created_at, updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&new.name)
    .bind(&new.path)
    .bind(&new.description)
    .fetch_one(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO resource_quotas (project_id, max_concurrent_runners, max_memory_mb, max_tokens_per_day)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(project.id)
    .bind(new.max_concurrent_runners)
    .bind(new.max_memory_mb)
    .bind(new.max_tokens_per_day)
    .execute(&mut **tx)
    .await?;

    Ok(project)
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Option<Project>> {
    Ok(sqlx::query_as::<_, Project>(
        r#"
        SELECT id, name, path, description, status, runner_count, tokens_total,
               created_at, updated_at
        FROM projects
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?)
}

pub async fn list(pool: &PgPool) -> Result<Vec<Project>> {
    Ok(sqlx::query_as::<_, Project>(
        r#"
        SELECT id, name, path, description, status, runner_count, tokens_total,
               created_at, updated_at
        FROM projects
        ORDER BY created_at ASC
        "#,
    )
    .fetch_all(pool)
    .await?)
}

/// Project plus quota, loaded inside the admission transaction (the caller
/// already holds the project advisory lock).
pub async fn get_for_admission(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
) -> Result<Option<(Project, ResourceQuota)>> {
    let project = sqlx::query_as::<_, Project>(
        r#"
        SELECT id, name, path, description, status, runner_count, tokens_total,
               created_at, updated_at
        FROM projects
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?;

    let Some(project) = project else {
        return Ok(None);
    };

    let quota = sqlx::query_as::<_, ResourceQuota>(
        r#"
        SELECT project_id, max_concurrent_runners, max_memory_mb, max_tokens_per_day, created_at
        FROM resource_quotas
        WHERE project_id = $1
        "#,
    )
    .bind(id)
    .fetch_one(&mut **tx)
    .await?;

    Ok(Some((project, quota)))
}

/// Archive is refused while the project still has live runners.
pub async fn archive(tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<Project> {
    let live: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*)::BIGINT FROM runners
        WHERE project_id = $1
          AND status IN ('starting', 'running', 'paused', 'stopping')
        "#,
    )
    .bind(id)
    .fetch_one(&mut **tx)
    .await?;

    if live.0 > 0 {
        return Err(AppError::Conflict(format!(
            "project has {} live runner(s)",
            live.0
        )));
    }

    let project = sqlx::query_as::<_, Project>(
        r#"
        UPDATE projects
        SET status = 'archived', updated_at = now()
        WHERE id = $1
        RETURNING id, name, path, description, status, runner_count, tokens_total,
                  created_at, updated_at
        "#,
    )
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| AppError::NotFound("project".to_string()))?;

    Ok(project)
}

async fn set_status_unless_archived(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    status: ProjectStatus,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE projects SET status = $2, updated_at = now()
        WHERE id = $1 AND status != 'archived' AND status != $2
        "#,
    )
    .bind(id)
    .bind(status)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Aggregate counter maintenance; always called inside the transaction that
/// causes the change, under the project advisory lock. Also flips the
/// active/idle status with the count: a project with live runners is
/// `active`, one that drains to zero falls back to `idle`. Archived projects
/// are left alone (they cannot have live runners).
pub async fn adjust_runner_count(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    delta: i64,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        UPDATE projects
        SET runner_count = GREATEST(runner_count + $2, 0), updated_at = now()
        WHERE id = $1
        RETURNING runner_count
        "#,
    )
    .bind(id)
    .bind(delta)
    .fetch_one(&mut **tx)
    .await?;

    let status = if row.0 > 0 {
        ProjectStatus::Active
    } else {
        ProjectStatus::Idle
    };
    set_status_unless_archived(tx, id, status).await?;

    Ok(row.0)
}

pub async fn add_tokens(tx: &mut Transaction<'_, Postgres>, id: Uuid, delta: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE projects
        SET tokens_total = tokens_total + $2, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(delta)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
