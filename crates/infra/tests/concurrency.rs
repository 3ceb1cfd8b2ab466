//! Races between concurrent callers of the in-memory store.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Barrier;

use ingestq_core::{ResourceId, WorkerId};
use ingestq_infra::jobs::{InMemoryJobStore, JobStatus, JobStore};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_enqueue_leaves_one_job_per_resource() {
    let store = InMemoryJobStore::arc();
    let resource = ResourceId::new();
    let callers = 16;
    let barrier = Arc::new(Barrier::new(callers));

    let mut tasks = Vec::new();
    for _ in 0..callers {
        let store = store.clone();
        let barrier = barrier.clone();
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            store.enqueue(resource).await.unwrap()
        }));
    }

    let mut ids = HashSet::new();
    for task in tasks {
        ids.insert(task.await.unwrap().id);
    }

    assert_eq!(ids.len(), 1);
    let stats = store.stats().await.unwrap();
    assert_eq!(stats.total(), 1);
    assert_eq!(stats.queued, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_eligible_job_is_claimed_exactly_once() {
    let store = InMemoryJobStore::arc();
    let job = store.enqueue(ResourceId::new()).await.unwrap();
    let claimers = 12;
    let barrier = Arc::new(Barrier::new(claimers));

    let mut tasks = Vec::new();
    for i in 0..claimers {
        let store = store.clone();
        let barrier = barrier.clone();
        tasks.push(tokio::spawn(async move {
            let worker = WorkerId::new(format!("w-{i}")).unwrap();
            barrier.wait().await;
            store.claim(&worker).await.unwrap()
        }));
    }

    let mut winners = Vec::new();
    for task in tasks {
        if let Some(claimed) = task.await.unwrap() {
            winners.push(claimed);
        }
    }

    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].id, job.id);

    let stored = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Processing);
    assert_eq!(stored.locked_by(), winners[0].locked_by());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claimers_partition_the_queue() {
    let store = InMemoryJobStore::arc();
    let jobs = 50;
    for _ in 0..jobs {
        store.enqueue(ResourceId::new()).await.unwrap();
    }

    let claimers = 8;
    let barrier = Arc::new(Barrier::new(claimers));
    let mut tasks = Vec::new();
    for i in 0..claimers {
        let store = store.clone();
        let barrier = barrier.clone();
        tasks.push(tokio::spawn(async move {
            let worker = WorkerId::new(format!("w-{i}")).unwrap();
            barrier.wait().await;
            let mut mine = Vec::new();
            while let Some(job) = store.claim(&worker).await.unwrap() {
                mine.push(job.id);
            }
            mine
        }));
    }

    let mut seen = HashSet::new();
    for task in tasks {
        for id in task.await.unwrap() {
            assert!(seen.insert(id), "job {id} was claimed twice");
        }
    }

    assert_eq!(seen.len(), jobs);
    assert_eq!(store.stats().await.unwrap().processing, jobs as u64);
}
