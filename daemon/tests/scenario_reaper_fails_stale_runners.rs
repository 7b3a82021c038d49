//! Scenario: heartbeat expiry reaping.
//!
//! # Invariant under test
//! A live runner whose last heartbeat is older than the TTL is failed by one
//! reap pass, the `runner.failed.*` outbox row is written by the same
//! transaction, and a second pass finds nothing (reaping is one-shot).
//!
//! All tests skip gracefully when `STRATAVORE_TEST_DATABASE_URL` is not set.

mod common;

use stratavore_daemon::db::runner_repo;
use stratavore_daemon::model::{RestartPolicy, RunnerStatus};
use uuid::Uuid;

#[tokio::test]
#[ignore = "requires STRATAVORE_TEST_DATABASE_URL; run with -- --include-ignored"]
#[serial_test::serial]
async fn stale_runner_is_failed_with_outbox_row() -> anyhow::Result<()> {
    let db = common::connect().await?;
    let project = common::create_project(&db, 4).await?;

    // A runner whose heartbeat stopped two minutes ago.
    let runner_id = Uuid::new_v4();
    let mut tx = db.begin().await?;
    runner_repo::insert(&mut tx, runner_id, project.id, RestartPolicy::Never).await?;
    tx.commit().await?;
    sqlx::query(
        "UPDATE runners SET status = 'running', last_heartbeat_at = now() - interval '120 seconds' WHERE id = $1",
    )
    .bind(runner_id)
    .execute(db.pool())
    .await?;

    let outbox_before = common::outbox_count(db.pool(), "runner.failed.").await?;

    let mut tx = db.begin().await?;
    let reaped = runner_repo::reap_stale(&mut tx, 60).await?;
    tx.commit().await?;

    let victim = reaped
        .iter()
        .find(|r| r.runner_id == runner_id)
        .expect("stale runner must be reaped");
    assert_eq!(victim.project_id, project.id);
    assert_eq!(victim.previous_status, RunnerStatus::Running);

    let row: (RunnerStatus,) = sqlx::query_as("SELECT status FROM runners WHERE id = $1")
        .bind(runner_id)
        .fetch_one(db.pool())
        .await?;
    assert_eq!(row.0, RunnerStatus::Failed);

    let outbox_after = common::outbox_count(db.pool(), "runner.failed.").await?;
    assert!(
        outbox_after > outbox_before,
        "reap transaction must insert a runner.failed outbox row"
    );

    // One-shot: a second pass must not find the already-failed runner.
    let mut tx = db.begin().await?;
    let reaped_again = runner_repo::reap_stale(&mut tx, 60).await?;
    tx.commit().await?;
    assert!(
        reaped_again.iter().all(|r| r.runner_id != runner_id),
        "a reaped runner must not be reaped twice"
    );

    Ok(())
}

#[tokio::test]
#[ignore = "requires STRATAVORE_TEST_DATABASE_URL; run with -- --include-ignored"]
#[serial_test::serial]
async fn fresh_and_terminal_runners_are_not_reaped() -> anyhow::Result<()> {
    let db = common::connect().await?;
    let project = common::create_project(&db, 4).await?;

    // Fresh heartbeat: not eligible.
    let fresh_id = Uuid::new_v4();
    // Already stopped: not eligible either, however old the heartbeat.
    let stopped_id = Uuid::new_v4();

    let mut tx = db.begin().await?;
    runner_repo::insert(&mut tx, fresh_id, project.id, RestartPolicy::Never).await?;
    runner_repo::insert(&mut tx, stopped_id, project.id, RestartPolicy::Never).await?;
    tx.commit().await?;

    sqlx::query("UPDATE runners SET status = 'running', last_heartbeat_at = now() WHERE id = $1")
        .bind(fresh_id)
        .execute(db.pool())
        .await?;
    sqlx::query(
        "UPDATE runners SET status = 'stopped', last_heartbeat_at = now() - interval '1 hour' WHERE id = $1",
    )
    .bind(stopped_id)
    .execute(db.pool())
    .await?;

    let mut tx = db.begin().await?;
    let reaped = runner_repo::reap_stale(&mut tx, 60).await?;
    tx.commit().await?;

    assert!(reaped.iter().all(|r| r.runner_id != fresh_id));
    assert!(reaped.iter().all(|r| r.runner_id != stopped_id));

    Ok(())
}

#[tokio::test]
#[ignore = "requires STRATAVORE_TEST_DATABASE_URL; run with -- --include-ignored"]
#[serial_test::serial]
async fn never_heartbeated_runner_is_reaped_by_launch_age() -> anyhow::Result<()> {
    let db = common::connect().await?;
    let project = common::create_project(&db, 4).await?;

    let runner_id = Uuid::new_v4();
    let mut tx = db.begin().await?;
    runner_repo::insert(&mut tx, runner_id, project.id, RestartPolicy::Never).await?;
    tx.commit().await?;
    sqlx::query(
        "UPDATE runners SET launched_at = now() - interval '120 seconds' WHERE id = $1",
    )
    .bind(runner_id)
    .execute(db.pool())
    .await?;

    let mut tx = db.begin().await?;
    let reaped = runner_repo::reap_stale(&mut tx, 60).await?;
    tx.commit().await?;

    assert!(
        reaped.iter().any(|r| r.runner_id == runner_id),
        "a starting runner that never heartbeated must be reaped on launch age"
    );
    Ok(())
}
