//! Concurrent access stress tests for the storage backends.
//!
//! These tests exercise compare-and-set under realistic multi-task contention
//! to detect lost updates and double winners. The usage limiter builds its
//! exactly-once guarantee on exactly these properties.

#![allow(clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use signet_storage::{FileBackend, MemoryBackend, StorageBackend, StorageError};
use tokio::task::JoinSet;

/// Number of concurrent tasks for most tests.
const CONCURRENCY: usize = 16;

/// Number of CAS rounds for the exactly-one-winner test.
const CAS_ROUNDS: usize = 50;

/// Increments per task in the counter tests.
const INCREMENTS_PER_TASK: usize = 25;

// ---------------------------------------------------------------------------
// Helper
// ---------------------------------------------------------------------------

/// Read-modify-CAS increment loop, retried on conflict.
async fn increment(backend: &dyn StorageBackend, key: &[u8]) -> u64 {
    loop {
        let current = backend.get(key).await.expect("get should succeed");
        let n: u64 = match &current {
            Some(bytes) => std::str::from_utf8(bytes).expect("utf-8").parse().expect("number"),
            None => 0,
        };
        let next = (n + 1).to_string().into_bytes();
        match backend.compare_and_set(key, current.as_deref(), next).await {
            Ok(()) => return n + 1,
            Err(StorageError::Conflict) => tokio::task::yield_now().await,
            Err(e) => panic!("unexpected CAS error: {e}"),
        }
    }
}

async fn run_parallel_increments(backend: Arc<dyn StorageBackend>) {
    let key = b"counter".to_vec();

    let mut set = JoinSet::new();
    for _ in 0..CONCURRENCY {
        let backend = Arc::clone(&backend);
        let key = key.clone();
        set.spawn(async move {
            let mut observed = Vec::with_capacity(INCREMENTS_PER_TASK);
            for _ in 0..INCREMENTS_PER_TASK {
                observed.push(increment(backend.as_ref(), &key).await);
            }
            observed
        });
    }

    let mut all = Vec::new();
    while let Some(result) = set.join_next().await {
        all.extend(result.expect("task should not panic"));
    }

    // Every increment observed a distinct post-value: no lost updates.
    all.sort_unstable();
    let expected: Vec<u64> = (1..=(CONCURRENCY * INCREMENTS_PER_TASK) as u64).collect();
    assert_eq!(all, expected);
}

// ---------------------------------------------------------------------------
// Test: Parallel CAS, exactly one winner per round
// ---------------------------------------------------------------------------

/// In each round the key holds a known value and `CONCURRENCY` tasks race to
/// CAS it. Exactly one task must succeed; all others must receive
/// `StorageError::Conflict`.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cas_exactly_one_winner_per_round() {
    let backend = MemoryBackend::new();
    let key = b"cas-key".to_vec();

    for round in 0..CAS_ROUNDS {
        let current_value = format!("round-{round}").into_bytes();
        backend.set(key.clone(), current_value.clone()).await.expect("setup set should succeed");

        let mut set = JoinSet::new();
        for task_id in 0..CONCURRENCY {
            let backend = backend.clone();
            let key = key.clone();
            let expected = current_value.clone();
            let new_val = format!("round-{round}-winner-{task_id}").into_bytes();
            set.spawn(async move { backend.compare_and_set(&key, Some(&expected), new_val).await });
        }

        let mut successes = 0usize;
        let mut conflicts = 0usize;
        while let Some(result) = set.join_next().await {
            match result.expect("task should not panic") {
                Ok(()) => successes += 1,
                Err(StorageError::Conflict) => conflicts += 1,
                Err(e) => panic!("unexpected error in CAS round {round}: {e}"),
            }
        }

        assert_eq!(successes, 1, "round {round}: exactly one CAS should succeed, got {successes}");
        assert_eq!(conflicts, CONCURRENCY - 1, "round {round}: all other CAS should conflict");
    }
}

// ---------------------------------------------------------------------------
// Test: Insert-if-absent race
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn insert_if_absent_has_single_winner() {
    let backend = MemoryBackend::new();

    let mut set = JoinSet::new();
    for task_id in 0..CONCURRENCY {
        let backend = backend.clone();
        set.spawn(async move {
            backend.compare_and_set(b"fresh", None, format!("task{task_id}").into_bytes()).await
        });
    }

    let mut winners = 0usize;
    while let Some(result) = set.join_next().await {
        if result.expect("task should not panic").is_ok() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

// ---------------------------------------------------------------------------
// Test: CAS-loop counters never lose an update
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_counter_has_no_lost_updates() {
    run_parallel_increments(Arc::new(MemoryBackend::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn file_counter_has_no_lost_updates_and_persists() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("counters.json");

    let backend = FileBackend::open(&path).await.expect("open");
    run_parallel_increments(Arc::new(backend.clone())).await;
    drop(backend);

    let reopened = FileBackend::open(&path).await.expect("reopen");
    let value = reopened.get(b"counter").await.expect("get").expect("counter should persist");
    let expected = (CONCURRENCY * INCREMENTS_PER_TASK).to_string();
    assert_eq!(&value[..], expected.as_bytes());
}
