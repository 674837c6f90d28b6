//! Postgres job store tests. Skipped unless `DATABASE_URL` is set.
//!
//! Every test gets its own schema so tests can run in parallel against one
//! database.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

use clinicflow_core::{JobPriority, JobStatus};
use clinicflow_infra::jobs::{
    JobFilter, JobRequestStore, JobStoreError, NewJobRequest, Pagination, PostgresJobRequestStore,
    SortOrder,
};

async fn store() -> Option<PostgresJobRequestStore> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set; skipping Postgres test");
        return None;
    };

    let schema = format!("clinicflow_test_{}", uuid::Uuid::now_v7().simple());
    let admin = sqlx::PgPool::connect(&url).await.unwrap();
    sqlx::query(&format!("CREATE SCHEMA {schema}"))
        .execute(&admin)
        .await
        .unwrap();
    admin.close().await;

    let options = PgConnectOptions::from_str(&url)
        .unwrap()
        .options([("search_path", schema.as_str())]);
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .unwrap();

    let store = PostgresJobRequestStore::new(pool);
    store.ensure_schema().await.unwrap();
    Some(store)
}

fn new_job(job_type: &str, priority: JobPriority) -> NewJobRequest {
    NewJobRequest::new(job_type, json!({"clinic_id": 1})).with_priority(priority)
}

#[tokio::test]
async fn concurrent_claims_on_one_job_have_one_winner() {
    let Some(store) = store().await else { return };
    let store = Arc::new(store);
    let job = store.enqueue(new_job("noop", JobPriority::Normal)).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move { store.claim_by_id(job.id).await }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let stored = store.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Running);
    assert_eq!(stored.attempts, 1);
}

#[tokio::test]
async fn concurrent_pollers_never_share_a_job() {
    let Some(store) = store().await else { return };
    let store = Arc::new(store);
    for _ in 0..10 {
        store.enqueue(new_job("noop", JobPriority::Normal)).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(job) = store.claim_next(None).await.unwrap() {
                claimed.push(job.id);
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    all.sort();
    let before = all.len();
    all.dedup();
    assert_eq!(before, 10);
    assert_eq!(all.len(), 10);
}

#[tokio::test]
async fn claims_follow_priority_then_schedule_then_age() {
    let Some(store) = store().await else { return };
    let past = Utc::now() - Duration::minutes(1);

    let low = store.enqueue(new_job("a", JobPriority::Low)).await.unwrap();
    let scheduled = store
        .enqueue(new_job("b", JobPriority::High).with_next_run_at(past))
        .await
        .unwrap();
    let high = store.enqueue(new_job("c", JobPriority::High)).await.unwrap();
    let critical = store.enqueue(new_job("d", JobPriority::Critical)).await.unwrap();

    let mut order = Vec::new();
    while let Some(job) = store.claim_next(None).await.unwrap() {
        order.push(job.id);
    }
    assert_eq!(order, vec![critical.id, high.id, scheduled.id, low.id]);
}

#[tokio::test]
async fn tier_filter_and_waiting_eligibility() {
    let Some(store) = store().await else { return };
    let normal = store.enqueue(new_job("a", JobPriority::Normal)).await.unwrap();

    assert!(store
        .claim_next(Some(&JobPriority::CRITICAL_TIER))
        .await
        .unwrap()
        .is_none());

    let claimed = store
        .claim_next(Some(&JobPriority::STANDARD_TIER))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, normal.id);

    let later = Utc::now() + Duration::hours(1);
    let parked = store
        .mark_waiting(normal.id, later, Some("quota".into()), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(parked.status, JobStatus::Waiting);
    assert!(store.claim_next(None).await.unwrap().is_none());
    assert!(store.claim_by_id(normal.id).await.unwrap().is_none());
}

#[tokio::test]
async fn excluded_ids_are_skipped_by_claims() {
    let Some(store) = store().await else { return };
    let first = store.enqueue(new_job("a", JobPriority::Critical)).await.unwrap();
    let second = store.enqueue(new_job("b", JobPriority::Low)).await.unwrap();

    let claimed = store
        .claim_next_excluding(None, &[first.id])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, second.id);
    assert!(store
        .claim_next_excluding(None, &[first.id])
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn oversized_max_attempts_is_rejected() {
    let Some(store) = store().await else { return };
    let err = store
        .enqueue(new_job("noop", JobPriority::Normal).with_max_attempts(u32::MAX))
        .await
        .unwrap_err();
    assert!(matches!(err, JobStoreError::Storage(msg) if msg.contains("max_attempts")));
}

#[tokio::test]
async fn terminal_writes_are_guarded() {
    let Some(store) = store().await else { return };
    let job = store.enqueue(new_job("noop", JobPriority::Normal)).await.unwrap();
    store.claim_by_id(job.id).await.unwrap().unwrap();

    let done = store
        .mark_completed(job.id, Some("log-1".into()), Some(json!({"ok": true})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.result_summary, Some(json!({"ok": true})));

    assert!(store.mark_completed(job.id, None, None).await.unwrap().is_none());
    assert!(store
        .mark_failed(job.id, "late".into(), None, None)
        .await
        .unwrap()
        .is_none());

    let err = store.mark_cancelled(job.id).await.unwrap_err();
    assert!(matches!(err, JobStoreError::InvalidTransition { from: JobStatus::Completed, .. }));

    let requeued = store
        .set_pending(job.id, None, Some(JobPriority::Critical))
        .await
        .unwrap();
    assert_eq!(requeued.status, JobStatus::Pending);
    assert_eq!(requeued.priority, JobPriority::Critical);
    assert!(requeued.completed_at.is_none());
}

#[tokio::test]
async fn startup_sweep_recovers_running_rows() {
    let Some(store) = store().await else { return };
    let job = store.enqueue(new_job("noop", JobPriority::Normal)).await.unwrap();
    store.claim_next(None).await.unwrap().unwrap();

    assert_eq!(store.reset_orphaned_running().await.unwrap(), 1);
    let recovered = store.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(recovered.status, JobStatus::Waiting);
    assert!(recovered.error_message.is_some());

    let reclaimed = store.claim_next(None).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, job.id);
    assert_eq!(reclaimed.attempts, 2);
}

#[tokio::test]
async fn listing_and_stats() {
    let Some(store) = store().await else { return };
    for _ in 0..3 {
        store.enqueue(new_job("meta_ads.sync", JobPriority::Normal)).await.unwrap();
    }
    let other = store.enqueue(new_job("ga.sync", JobPriority::Low)).await.unwrap();
    store.mark_cancelled(other.id).await.unwrap();

    let page = store
        .list(
            JobFilter {
                job_type: Some("meta_ads.sync".into()),
                ..Default::default()
            },
            Pagination::new(Some(2), None),
            SortOrder::NewestFirst,
        )
        .await
        .unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.jobs.len(), 2);
    assert!(page.has_more);
    assert!(page.jobs[0].created_at >= page.jobs[1].created_at);

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.pending, 3);
    assert_eq!(stats.cancelled, 1);
}
