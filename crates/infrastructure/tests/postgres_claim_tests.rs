//! PostgreSQL 上的认领语义，需要 Docker：`cargo test -- --ignored`

use std::collections::HashSet;

use chrono::Utc;
use transcoder_core::models::QueueEntry;
use transcoder_infrastructure::DatabaseManager;
use transcoder_testing_utils::{JobBuilder, PostgresTestContainer};

async fn setup() -> (PostgresTestContainer, DatabaseManager) {
    let container = PostgresTestContainer::start().await.unwrap();
    let db = DatabaseManager::new(&container.database_config())
        .await
        .unwrap();
    db.migrate().await.unwrap();
    (container, db)
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_concurrent_claims_never_overlap() {
    let (_container, db) = setup().await;
    let jobs = db.job_repository();
    for i in 0..20 {
        jobs.create(&JobBuilder::new(&format!("job-{i:02}")).build())
            .await
            .unwrap();
    }

    let now = Utc::now();
    let mut handles = Vec::new();
    for owner in ["i-1", "i-2", "i-3", "i-4"] {
        let jobs = db.job_repository();
        handles.push(tokio::spawn(async move {
            jobs.claim_pending(owner, 8, now).await.unwrap()
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for key in handle.await.unwrap() {
            total += 1;
            assert!(seen.insert(key), "一行被多个实例认领");
        }
    }
    // 并发认领可能少拿，剩余的行由下一次认领补齐
    for key in jobs.claim_pending("i-5", 20, now).await.unwrap() {
        total += 1;
        assert!(seen.insert(key), "一行被多个实例认领");
    }
    assert_eq!(total, 20);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_queue_claim_and_release_on_postgres() {
    let (_container, db) = setup().await;
    let queue = db.job_queue_repository();
    let now = Utc::now();
    for key in ["a", "b", "c"] {
        queue.push(&QueueEntry::new(key, 0, now)).await.unwrap();
    }

    let claimed = queue.claim("i-1", 10, now).await.unwrap();
    assert_eq!(claimed.len(), 3);
    assert!(queue.claim("i-2", 10, now).await.unwrap().is_empty());

    assert_eq!(queue.release_claims("i-1", &claimed).await.unwrap(), 3);
    assert_eq!(queue.claim("i-2", 10, now).await.unwrap().len(), 3);
}
