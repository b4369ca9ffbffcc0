//! Integration tests for the PostgreSQL task store.
//!
//! These need a reachable `DATABASE_URL` and are ignored by default:
//! `cargo test -p rarcrack-db -- --ignored`.

use std::time::Duration;

use rarcrack_core::store::{StoreError, TaskStore};
use rarcrack_core::task::{NewTask, TaskStatus, TaskUpdate};
use rarcrack_db::PgTaskStore;
use sqlx::PgPool;

fn new_task(charset: &str, max_length: u8) -> NewTask {
    NewTask {
        charset: charset.to_string(),
        max_length,
        artifact_path: "/tmp/archive.rar".to_string(),
    }
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn create_then_find(pool: PgPool) {
    let store = PgTaskStore::new(pool);
    let created = store.create(&new_task("abc", 3)).await.unwrap();

    assert_eq!(created.status, TaskStatus::Pending);
    assert_eq!(created.progress, 0);

    let found = store.find_by_id(created.id).await.unwrap().unwrap();
    assert_eq!(found.charset, "abc");
    assert_eq!(found.max_length, 3);
    assert!(store.find_by_id(created.id + 1000).await.unwrap().is_none());
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn progress_is_monotonic_and_terminal_is_final(pool: PgPool) {
    let store = PgTaskStore::new(pool);
    let task = store.create(&new_task("ab", 2)).await.unwrap();

    assert!(store.update(task.id, &TaskUpdate::running(60)).await.unwrap());
    assert!(store.update(task.id, &TaskUpdate::running(20)).await.unwrap());
    let mid = store.find_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(mid.status, TaskStatus::Running);
    assert_eq!(mid.progress, 60);

    assert!(store
        .update(task.id, &TaskUpdate::completed(Some("ba".into())))
        .await
        .unwrap());
    assert!(!store
        .update(task.id, &TaskUpdate::failed("too late"))
        .await
        .unwrap());

    let done = store.find_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.progress, 100);
    assert_eq!(done.result.as_deref(), Some("ba"));
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn update_missing_task_is_not_found(pool: PgPool) {
    let store = PgTaskStore::new(pool);
    let err = store.update(424242, &TaskUpdate::running(1)).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(424242)));
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn claim_skips_claimed_and_started_tasks(pool: PgPool) {
    let store = PgTaskStore::new(pool);
    let first = store.create(&new_task("ab", 1)).await.unwrap();
    let second = store.create(&new_task("cd", 1)).await.unwrap();

    let claimed = store.claim_next_pending().await.unwrap().unwrap();
    assert_eq!(claimed.id, first.id);
    assert_eq!(claimed.status, TaskStatus::Pending);

    let claimed = store.claim_next_pending().await.unwrap().unwrap();
    assert_eq!(claimed.id, second.id);

    assert!(store.claim_next_pending().await.unwrap().is_none());
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn stale_claims_fail_and_renewed_claims_survive(pool: PgPool) {
    let store = PgTaskStore::new(pool);
    let abandoned = store.create(&new_task("ab", 2)).await.unwrap();
    let kept = store.create(&new_task("cd", 2)).await.unwrap();
    let unclaimed = store.create(&new_task("ef", 2)).await.unwrap();
    store.claim_next_pending().await.unwrap().unwrap();
    store.claim_next_pending().await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    store.renew_claims(&[kept.id]).await.unwrap();

    let failed = store
        .fail_stale_claims(Duration::from_millis(200), "worker lost")
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, abandoned.id);
    assert_eq!(failed[0].status, TaskStatus::Failed);
    assert_eq!(failed[0].result.as_deref(), Some("worker lost"));

    let kept = store.find_by_id(kept.id).await.unwrap().unwrap();
    assert_eq!(kept.status, TaskStatus::Pending);
    let unclaimed = store.find_by_id(unclaimed.id).await.unwrap().unwrap();
    assert_eq!(unclaimed.status, TaskStatus::Pending);
}
