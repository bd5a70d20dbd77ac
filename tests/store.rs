use std::time::Duration;

use query_processor::lifecycle::LifecycleRecorder;
use query_processor::reaper::Reaper;
use query_processor::store::Store;

async fn seed_user(pool: &sqlx::PgPool, email: &str) -> anyhow::Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO users (email, hashed_password) VALUES ($1, 'hash') RETURNING id",
    )
    .bind(email)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

async fn seed_query(pool: &sqlx::PgPool, user_id: i64, status: &str) -> anyhow::Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO queries (user_id, query_text, db_username, db_password, db_tns, status)
         VALUES ($1, 'select 1', 'db', 'pw', 'host', $2)
         RETURNING id",
    )
    .bind(user_id)
    .bind(status)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

#[sqlx::test]
async fn list_pending_returns_fifo_order(pool: sqlx::PgPool) -> anyhow::Result<()> {
    let user = seed_user(&pool, "a@example.com").await?;
    let first = seed_query(&pool, user, "pending").await?;
    let second = seed_query(&pool, user, "pending").await?;
    seed_query(&pool, user, "running").await?;

    let store = Store::new(pool);
    let pending = store.list_pending().await?;

    assert_eq!(pending.iter().map(|q| q.id).collect::<Vec<_>>(), vec![first, second]);
    Ok(())
}

#[sqlx::test]
async fn running_counts_by_user_ignores_pending_and_terminal(pool: sqlx::PgPool) -> anyhow::Result<()> {
    let user = seed_user(&pool, "a@example.com").await?;
    seed_query(&pool, user, "pending").await?;
    seed_query(&pool, user, "running").await?;
    seed_query(&pool, user, "transferring").await?;
    seed_query(&pool, user, "completed").await?;

    let store = Store::new(pool);
    let counts = store.running_counts_by_user().await?;

    assert_eq!(counts.get(&user), Some(&2));
    Ok(())
}

#[sqlx::test]
async fn mark_completed_merges_metadata_without_clobbering_existing_keys(
    pool: sqlx::PgPool,
) -> anyhow::Result<()> {
    let user = seed_user(&pool, "a@example.com").await?;
    let query_id = seed_query(&pool, user, "transferring").await?;

    let store = Store::new(pool.clone());
    store
        .mark_completed(query_id, serde_json::json!({"rows": 10}))
        .await?;
    store
        .mark_completed(query_id, serde_json::json!({"columns": 3}))
        .await?;

    let row = store.query_by_id(query_id).await?;
    assert_eq!(row.status, query_processor::models::QueryStatus::Completed);
    assert_eq!(row.result_metadata.0["rows"], serde_json::json!(10));
    assert_eq!(row.result_metadata.0["columns"], serde_json::json!(3));
    Ok(())
}

#[sqlx::test]
async fn mark_failed_records_error_message(pool: sqlx::PgPool) -> anyhow::Result<()> {
    let user = seed_user(&pool, "a@example.com").await?;
    let query_id = seed_query(&pool, user, "running").await?;

    let store = Store::new(pool);
    store
        .mark_failed(query_id, "target connection refused", serde_json::json!({}))
        .await?;

    let row = store.query_by_id(query_id).await?;
    assert_eq!(row.status, query_processor::models::QueryStatus::Failed);
    assert_eq!(row.error_message.as_deref(), Some("target connection refused"));
    Ok(())
}

#[sqlx::test]
async fn find_stuck_only_returns_rows_older_than_threshold(pool: sqlx::PgPool) -> anyhow::Result<()> {
    let user = seed_user(&pool, "a@example.com").await?;
    let stuck_id = seed_query(&pool, user, "running").await?;
    seed_query(&pool, user, "pending").await?;

    sqlx::query("UPDATE queries SET updated_at = now() - interval '2 hours' WHERE id = $1")
        .bind(stuck_id)
        .execute(&pool)
        .await?;

    let store = Store::new(pool);
    let stuck = store.find_stuck(Duration::from_secs(3600)).await?;

    assert_eq!(stuck.iter().map(|q| q.id).collect::<Vec<_>>(), vec![stuck_id]);
    Ok(())
}

#[sqlx::test]
async fn rerun_inserts_isolated_pending_row(pool: sqlx::PgPool) -> anyhow::Result<()> {
    let user = seed_user(&pool, "a@example.com").await?;
    let original_id = seed_query(&pool, user, "completed").await?;

    let store = Store::new(pool);
    let original = store.query_by_id(original_id).await?;
    let rerun_id = store.rerun(&original).await?;

    assert_ne!(rerun_id, original_id);

    let rerun = store.query_by_id(rerun_id).await?;
    assert_eq!(rerun.status, query_processor::models::QueryStatus::Pending);
    assert_eq!(rerun.query_text, original.query_text);

    let original_after = store.query_by_id(original_id).await?;
    assert_eq!(original_after.status, query_processor::models::QueryStatus::Completed);
    Ok(())
}

#[sqlx::test]
async fn reaper_fails_every_running_and_transferring_row_on_startup(
    pool: sqlx::PgPool,
) -> anyhow::Result<()> {
    let user = seed_user(&pool, "a@example.com").await?;
    let running_id = seed_query(&pool, user, "running").await?;
    let transferring_id = seed_query(&pool, user, "transferring").await?;
    let pending_id = seed_query(&pool, user, "pending").await?;

    let store = Store::new(pool);
    let lifecycle = LifecycleRecorder::new(store.clone());
    let reaper = Reaper::new(store.clone(), lifecycle);

    let reaped = reaper.reconcile_on_startup().await?;
    assert_eq!(reaped, 2);

    assert_eq!(
        store.query_by_id(running_id).await?.status,
        query_processor::models::QueryStatus::Failed
    );
    assert_eq!(
        store.query_by_id(transferring_id).await?.status,
        query_processor::models::QueryStatus::Failed
    );
    assert_eq!(
        store.query_by_id(pending_id).await?.status,
        query_processor::models::QueryStatus::Pending
    );
    Ok(())
}
