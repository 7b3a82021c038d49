//! Scenario: launch admission under project quota and token budget.
//!
//! # Invariants under test
//! - A successful launch writes exactly one runner row and one
//!   `runner.started.*` outbox row, atomically.
//! - Concurrent launches on one project never overshoot `max_concurrent`
//!   (the project advisory lock serializes the count-then-insert).
//! - A budget rejection changes nothing: no runner row, no outbox row.
//! - After shutdown no supervisory entries remain and every launched runner
//!   has a terminal status.
//!
//! All tests skip gracefully when `STRATAVORE_TEST_DATABASE_URL` is not set.

mod common;

use std::time::Duration;

use stratavore_daemon::error::AppError;
use stratavore_daemon::model::{BudgetScope, Granularity, RestartPolicy, RunnerStatus};
use stratavore_daemon::runner::LaunchRequest;

fn launch_request(project_id: uuid::Uuid) -> LaunchRequest {
    LaunchRequest {
        project_id,
        flags: vec![],
        attach_stdio: false,
        estimated_tokens: Some(100),
        restart_policy: RestartPolicy::Never,
    }
}

#[tokio::test]
#[ignore = "requires STRATAVORE_TEST_DATABASE_URL; run with -- --include-ignored"]
#[serial_test::serial]
async fn launch_writes_runner_and_outbox_row_atomically() -> anyhow::Result<()> {
    let db = common::connect().await?;
    let project = common::create_project(&db, 2).await?;
    let manager = common::test_manager(&db, &["sleep", "2"]);

    let before = common::outbox_count(db.pool(), "runner.started.").await?;
    let runner = manager.launch(launch_request(project.id)).await?;
    let after = common::outbox_count(db.pool(), "runner.started.").await?;

    assert_eq!(after - before, 1, "exactly one runner.started outbox row");
    assert_eq!(runner.status, RunnerStatus::Starting);
    assert_eq!(runner.project_id, project.id);

    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*)::BIGINT FROM runners WHERE project_id = $1")
            .bind(project.id)
            .fetch_one(db.pool())
            .await?;
    assert_eq!(row.0, 1, "exactly one runner row");

    manager.shutdown(Duration::from_secs(10)).await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires STRATAVORE_TEST_DATABASE_URL; run with -- --include-ignored"]
#[serial_test::serial]
async fn third_launch_hits_quota() -> anyhow::Result<()> {
    let db = common::connect().await?;
    let project = common::create_project(&db, 2).await?;
    let manager = common::test_manager(&db, &["sleep", "5"]);

    manager.launch(launch_request(project.id)).await?;
    manager.launch(launch_request(project.id)).await?;

    let err = manager
        .launch(launch_request(project.id))
        .await
        .expect_err("third launch must exceed the quota");
    assert!(
        matches!(
            err,
            AppError::QuotaExceeded {
                active: 2,
                max_concurrent: 2
            }
        ),
        "unexpected error: {err:?}"
    );

    manager.shutdown(Duration::from_secs(10)).await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires STRATAVORE_TEST_DATABASE_URL; run with -- --include-ignored"]
#[serial_test::serial]
async fn exhausted_global_budget_blocks_launch_without_side_effects() -> anyhow::Result<()> {
    let db = common::connect().await?;
    let project = common::create_project(&db, 4).await?;
    let manager = common::test_manager(&db, &["sleep", "2"]);

    // Global daily budget with 950 of 1000 already consumed.
    let budget = stratavore_daemon::budget::BudgetEngine::new(db.clone());
    budget
        .define(BudgetScope::Global, "", Granularity::Daily, 1000)
        .await?;
    sqlx::query(
        "UPDATE token_budgets SET tokens_used = 950 WHERE scope = 'global' AND token_limit = 1000",
    )
    .execute(db.pool())
    .await?;

    let runners_before: (i64,) = sqlx::query_as("SELECT COUNT(*)::BIGINT FROM runners")
        .fetch_one(db.pool())
        .await?;
    let outbox_before = common::outbox_count(db.pool(), "runner.started.").await?;

    let err = manager
        .launch(launch_request(project.id))
        .await
        .expect_err("estimated 100 must not fit in the remaining 50");
    match err {
        AppError::BudgetExceeded { scope, used, limit } => {
            assert_eq!(scope, BudgetScope::Global);
            assert_eq!(used, 950);
            assert_eq!(limit, 1000);
        }
        other => panic!("expected BudgetExceeded, got {other:?}"),
    }

    let runners_after: (i64,) = sqlx::query_as("SELECT COUNT(*)::BIGINT FROM runners")
        .fetch_one(db.pool())
        .await?;
    let outbox_after = common::outbox_count(db.pool(), "runner.started.").await?;
    assert_eq!(runners_before, runners_after, "no runner row on rejection");
    assert_eq!(outbox_before, outbox_after, "no outbox row on rejection");

    // Clean up the global budget so other scenarios are unaffected.
    sqlx::query("DELETE FROM token_budgets WHERE scope = 'global'")
        .execute(db.pool())
        .await?;

    Ok(())
}

#[tokio::test]
#[ignore = "requires STRATAVORE_TEST_DATABASE_URL; run with -- --include-ignored"]
#[serial_test::serial]
async fn concurrent_launches_respect_quota() -> anyhow::Result<()> {
    let db = common::connect().await?;
    let project = common::create_project(&db, 3).await?;
    let manager = common::test_manager(&db, &["sleep", "5"]);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let manager = manager.clone();
        let project_id = project.id;
        handles.push(tokio::spawn(async move {
            manager.launch(launch_request(project_id)).await
        }));
    }

    let mut ok = 0;
    let mut quota = 0;
    for handle in handles {
        match handle.await? {
            Ok(_) => ok += 1,
            Err(AppError::QuotaExceeded { .. }) => quota += 1,
            Err(other) => panic!("unexpected admission error: {other:?}"),
        }
    }

    assert_eq!(ok, 3, "exactly maxConcurrent launches succeed");
    assert_eq!(quota, 7, "the rest fail with QuotaExceeded");

    let active: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*)::BIGINT FROM runners
        WHERE project_id = $1
          AND status IN ('starting', 'running', 'paused', 'stopping')
        "#,
    )
    .bind(project.id)
    .fetch_one(db.pool())
    .await?;
    assert_eq!(active.0, 3);

    manager.shutdown(Duration::from_secs(10)).await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires STRATAVORE_TEST_DATABASE_URL; run with -- --include-ignored"]
#[serial_test::serial]
async fn shutdown_leaves_no_supervision_and_only_terminal_statuses() -> anyhow::Result<()> {
    let db = common::connect().await?;
    let project = common::create_project(&db, 4).await?;
    let manager = common::test_manager(&db, &["sleep", "30"]);

    let r1 = manager.launch(launch_request(project.id)).await?;
    let r2 = manager.launch(launch_request(project.id)).await?;
    assert_eq!(manager.supervised_count().await, 2);

    manager.shutdown(Duration::from_secs(10)).await;

    assert_eq!(manager.supervised_count().await, 0);
    for runner_id in [r1.id, r2.id] {
        let row: (RunnerStatus,) = sqlx::query_as("SELECT status FROM runners WHERE id = $1")
            .bind(runner_id)
            .fetch_one(db.pool())
            .await?;
        assert!(
            row.0.is_terminal(),
            "runner {runner_id} left in non-terminal status {:?}",
            row.0
        );
    }

    Ok(())
}
