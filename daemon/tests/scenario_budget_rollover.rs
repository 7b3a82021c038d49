//! Scenario: budget period rollover.
//!
//! # Invariants under test
//! - Recording consumption past a window's end first opens the successor
//!   window with `used = 0`, then debits it; the expired row is untouched.
//! - Rollover is idempotent: repeated rolls open exactly one successor.
//!
//! All tests skip gracefully when `STRATAVORE_TEST_DATABASE_URL` is not set.

mod common;

use chrono::{Duration, Utc};
use stratavore_daemon::budget::{BudgetEngine, ScopeChain};
use stratavore_daemon::db::budget_repo;
use stratavore_daemon::model::{BudgetScope, Granularity};
use uuid::Uuid;

/// Budgets are keyed per scope; project scopes give each test its own key
/// space so the suites don't interfere.
fn scope_id() -> String {
    Uuid::new_v4().to_string()
}

#[tokio::test]
#[ignore = "requires STRATAVORE_TEST_DATABASE_URL; run with -- --include-ignored"]
#[serial_test::serial]
async fn record_past_window_end_rolls_then_debits() -> anyhow::Result<()> {
    let db = common::connect().await?;
    let engine = BudgetEngine::new(db.clone());

    let project_id = Uuid::new_v4();
    let scope_id = project_id.to_string();

    // An expired daily window with 80 of 100 used.
    let now = Utc::now();
    let window_end = now - Duration::days(1);
    let mut tx = db.begin().await?;
    budget_repo::insert_window(
        &mut tx,
        BudgetScope::Project,
        &scope_id,
        Granularity::Daily,
        100,
        80,
        window_end - Duration::days(1),
        window_end,
    )
    .await?;
    tx.commit().await?;

    let warnings = engine
        .record(&ScopeChain::for_project(project_id), 30)
        .await?;

    // The new window holds exactly the new consumption.
    let rows: Vec<(i64, i64)> = sqlx::query_as(
        r#"
        SELECT tokens_used, token_limit FROM token_budgets
        WHERE scope = 'project' AND scope_id = $1
        ORDER BY period_start ASC
        "#,
    )
    .bind(&scope_id)
    .fetch_all(db.pool())
    .await?;

    assert_eq!(rows.len(), 2, "expired row plus its successor");
    assert_eq!(rows[0], (80, 100), "expired window is untouched");
    assert_eq!(rows[1], (30, 100), "successor starts at zero, then debits 30");

    // 30 of 100 crosses no threshold.
    assert!(warnings.is_empty());
    Ok(())
}

#[tokio::test]
#[ignore = "requires STRATAVORE_TEST_DATABASE_URL; run with -- --include-ignored"]
#[serial_test::serial]
async fn roll_period_is_idempotent() -> anyhow::Result<()> {
    let db = common::connect().await?;
    let engine = BudgetEngine::new(db.clone());

    let scope_id = scope_id();
    let now = Utc::now();
    let mut tx = db.begin().await?;
    budget_repo::insert_window(
        &mut tx,
        BudgetScope::Project,
        &scope_id,
        Granularity::Hourly,
        500,
        10,
        now - Duration::hours(2),
        now - Duration::hours(1),
    )
    .await?;
    tx.commit().await?;

    engine.roll_period(now).await?;
    engine.roll_period(now).await?;
    engine.roll_period(now).await?;

    let count: (i64,) = sqlx::query_as(
        "SELECT COUNT(*)::BIGINT FROM token_budgets WHERE scope = 'project' AND scope_id = $1",
    )
    .bind(&scope_id)
    .fetch_one(db.pool())
    .await?;
    assert_eq!(count.0, 2, "exactly one successor window however often rolled");

    let fresh: (i64,) = sqlx::query_as(
        r#"
        SELECT tokens_used FROM token_budgets
        WHERE scope = 'project' AND scope_id = $1 AND period_end > $2
        "#,
    )
    .bind(&scope_id)
    .bind(now)
    .fetch_one(db.pool())
    .await?;
    assert_eq!(fresh.0, 0, "successor opens with used = 0");

    Ok(())
}

#[tokio::test]
#[ignore = "requires STRATAVORE_TEST_DATABASE_URL; run with -- --include-ignored"]
#[serial_test::serial]
async fn warnings_fire_once_per_threshold() -> anyhow::Result<()> {
    let db = common::connect().await?;
    let engine = BudgetEngine::new(db.clone());

    let project_id = Uuid::new_v4();
    engine
        .define(
            BudgetScope::Project,
            &project_id.to_string(),
            Granularity::Daily,
            1000,
        )
        .await?;
    let chain = ScopeChain::for_project(project_id);

    // 0 -> 700: below both thresholds.
    assert!(engine.record(&chain, 700).await?.is_empty());

    // 700 -> 800: crosses 75 only.
    let warnings = engine.record(&chain, 100).await?;
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].percent, 75);

    // 800 -> 950: crosses 90 only, 75 does not repeat.
    let warnings = engine.record(&chain, 150).await?;
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].percent, 90);

    // 950 -> 960: nothing new.
    assert!(engine.record(&chain, 10).await?.is_empty());

    Ok(())
}
