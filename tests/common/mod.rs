//! Store contract checks shared by the in-memory and Postgres test suites.
//!
//! Every check expects an empty store.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use claimq::{ClaimOptions, Decision, Error, QueueStore, RetryPolicy, State, Backoff};
use serde_json::json;

pub fn opts(lease: Duration) -> ClaimOptions {
    ClaimOptions {
        lease_duration: lease,
        max_attempts: 3,
    }
}

/// K concurrent claimers against M units: no id handed out twice, and
/// exactly min(K, M) claims succeed.
pub async fn at_most_one_owner(store: Arc<dyn QueueStore>, claimers: usize, units: usize) {
    for n in 0..units {
        store.enqueue("echo", json!({ "n": n })).await.unwrap();
    }

    let mut handles = Vec::new();
    for k in 0..claimers {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .claim(&format!("claimer-{k}"), &opts(Duration::from_secs(60)))
                .await
                .unwrap()
                .unit
        }));
    }

    let mut claimed = Vec::new();
    for h in handles {
        if let Some(unit) = h.await.unwrap() {
            assert_eq!(unit.state, State::Owned);
            assert_eq!(unit.attempt_count, 1);
            claimed.push(unit.id);
        }
    }

    let distinct: HashSet<_> = claimed.iter().copied().collect();
    assert_eq!(distinct.len(), claimed.len(), "duplicate claims: {claimed:?}");
    assert_eq!(claimed.len(), claimers.min(units));
}

/// A claimed unit that is never settled becomes claimable after the lease,
/// and the stale owner can no longer settle it.
pub async fn no_loss_under_crash(store: Arc<dyn QueueStore>) {
    let id = store.enqueue("echo", json!({})).await.unwrap();
    let lease = Duration::from_millis(300);

    let first = store.claim("crashed", &opts(lease)).await.unwrap().unit.unwrap();
    assert_eq!(first.id, id);
    let stale = first.lease().unwrap();

    // Still leased: nobody else gets it.
    assert!(store.claim("rescuer", &opts(lease)).await.unwrap().unit.is_none());

    tokio::time::sleep(lease * 2).await;
    assert_eq!(store.stats().await.unwrap().expired_leases, 1);
    assert_eq!(store.expired_leases(10).await.unwrap()[0].id, id);

    let claim = store.claim("rescuer", &opts(lease)).await.unwrap();
    assert_eq!(claim.previous_owner.as_deref(), Some("crashed"));
    assert!(claim.abandoned.is_empty());
    let second = claim.unit.unwrap();
    assert_eq!(second.id, id);
    assert_eq!(second.attempt_count, 2);
    assert_eq!(second.owner.as_deref(), Some("rescuer"));

    let err = store.settle_completed(&stale).await.unwrap_err();
    assert!(matches!(err, Error::LeaseLost { .. }), "got {err:?}");

    store
        .settle_completed(&second.lease().unwrap())
        .await
        .unwrap();
    assert_eq!(store.get(id).await.unwrap().state, State::Completed);
}

/// Failing a unit max_attempts times leaves it `failed` and unclaimable.
pub async fn retry_exhaustion(store: Arc<dyn QueueStore>) {
    let id = store.enqueue("flaky", json!({})).await.unwrap();
    let policy = RetryPolicy {
        max_attempts: 3,
        backoff: Backoff::None,
    };

    for attempt in 1..=3 {
        let unit = store
            .claim("w", &opts(Duration::from_secs(60)))
            .await
            .unwrap()
            .unit
            .expect("unit should be claimable");
        assert_eq!(unit.attempt_count, attempt);
        let lease = unit.lease().unwrap();
        match policy.on_failure(&unit) {
            Decision::Requeue { delay } => store.requeue(&lease, "boom", delay).await.unwrap(),
            Decision::Abandon => store.settle_failed(&lease, "boom").await.unwrap(),
        }
    }

    assert!(store.claim("w", &opts(Duration::from_secs(60))).await.unwrap().unit.is_none());
    let unit = store.get(id).await.unwrap();
    assert_eq!(unit.state, State::Failed);
    assert_eq!(unit.attempt_count, 3);
    assert_eq!(unit.last_error.as_deref(), Some("boom"));
    assert!(unit.settled_at.is_some());
    assert!(unit.owner.is_none());
    assert_eq!(store.count_by_state(State::Failed).await.unwrap(), 1);
}

/// Older units are claimed first.
pub async fn fifo_preference(store: Arc<dyn QueueStore>) {
    let first = store.enqueue("echo", json!({"n": 1})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = store.enqueue("echo", json!({"n": 2})).await.unwrap();

    let o = opts(Duration::from_secs(60));
    assert_eq!(store.claim("w", &o).await.unwrap().unit.unwrap().id, first);
    assert_eq!(store.claim("w", &o).await.unwrap().unit.unwrap().id, second);
}

/// Pending and expired-lease candidates share one oldest-first ordering.
pub async fn fifo_across_expired_leases(store: Arc<dyn QueueStore>) {
    let long = opts(Duration::from_secs(60));
    let short = opts(Duration::from_millis(100));

    // Older expired lease beats newer pending unit.
    let older = store.enqueue("echo", json!({"n": 1})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let newer = store.enqueue("echo", json!({"n": 2})).await.unwrap();
    assert_eq!(store.claim("crashed", &short).await.unwrap().unit.unwrap().id, older);
    tokio::time::sleep(Duration::from_millis(250)).await;

    let claim = store.claim("w", &long).await.unwrap();
    assert_eq!(claim.unit.unwrap().id, older);
    assert_eq!(claim.previous_owner.as_deref(), Some("crashed"));
    let pending = store.claim("w", &long).await.unwrap().unit.unwrap();
    assert_eq!(pending.id, newer);

    // Older pending unit beats newer expired lease.
    let first = store.enqueue("echo", json!({"n": 3})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = store.enqueue("echo", json!({"n": 4})).await.unwrap();
    let held = store.claim("w", &long).await.unwrap().unit.unwrap();
    assert_eq!(held.id, first);
    let stuck = store.claim("crashed", &short).await.unwrap().unit.unwrap();
    assert_eq!(stuck.id, second);
    store
        .requeue(&held.lease().unwrap(), "retry", Duration::ZERO)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    let claim = store.claim("w", &long).await.unwrap();
    assert_eq!(claim.unit.unwrap().id, first);
    assert!(claim.previous_owner.is_none());
    let claim = store.claim("w", &long).await.unwrap();
    assert_eq!(claim.unit.unwrap().id, second);
    assert_eq!(claim.previous_owner.as_deref(), Some("crashed"));
}

/// Second settle is `AlreadySettled` and leaves `settled_at` alone.
pub async fn idempotent_settle(store: Arc<dyn QueueStore>) {
    let id = store.enqueue("echo", json!({})).await.unwrap();
    let unit = store
        .claim("w", &opts(Duration::from_secs(60)))
        .await
        .unwrap()
        .unit
        .unwrap();
    let lease = unit.lease().unwrap();

    store.settle_completed(&lease).await.unwrap();
    let settled_at = store.get(id).await.unwrap().settled_at;
    assert!(settled_at.is_some());

    tokio::time::sleep(Duration::from_millis(5)).await;
    let err = store.settle_completed(&lease).await.unwrap_err();
    assert!(matches!(err, Error::AlreadySettled(u) if u == id), "got {err:?}");
    let err = store.settle_failed(&lease, "late").await.unwrap_err();
    assert!(matches!(err, Error::AlreadySettled(_)), "got {err:?}");

    let unit = store.get(id).await.unwrap();
    assert_eq!(unit.state, State::Completed);
    assert_eq!(unit.settled_at, settled_at);
    assert!(unit.last_error.is_none());
}

/// An expired lease on a unit with no attempts left is failed, not reclaimed.
pub async fn expired_exhausted_unit_is_failed(store: Arc<dyn QueueStore>) {
    let id = store.enqueue("echo", json!({})).await.unwrap();
    let short = ClaimOptions {
        lease_duration: Duration::from_millis(100),
        max_attempts: 1,
    };

    store.claim("crashed", &short).await.unwrap().unit.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    let claim = store.claim("w", &short).await.unwrap();
    assert!(claim.unit.is_none());
    assert_eq!(claim.abandoned.len(), 1);
    assert_eq!(claim.abandoned[0].id, id);
    assert_eq!(claim.abandoned[0].owner, "crashed");
    assert_eq!(claim.abandoned[0].attempt, 1);
    let unit = store.get(id).await.unwrap();
    assert_eq!(unit.state, State::Failed);
    assert_eq!(unit.attempt_count, 1);
    assert_eq!(unit.last_error.as_deref(), Some("lease expired after 1 attempt"));
    assert!(unit.lease_expires_at.is_none());
}

/// Counts and `get` reflect the table.
pub async fn counts_and_lookup(store: Arc<dyn QueueStore>) {
    let a = store.enqueue("echo", json!({"a": true})).await.unwrap();
    store.enqueue("echo", json!({})).await.unwrap();
    store.enqueue("echo", json!({})).await.unwrap();

    let unit = store.get(a).await.unwrap();
    assert_eq!(unit.kind, "echo");
    assert_eq!(unit.payload, json!({"a": true}));
    assert_eq!(unit.state, State::Pending);
    assert_eq!(unit.attempt_count, 0);
    assert!(unit.owner.is_none());

    let claimed = store
        .claim("w", &opts(Duration::from_secs(60)))
        .await
        .unwrap()
        .unit
        .unwrap();
    store.settle_completed(&claimed.lease().unwrap()).await.unwrap();
    store
        .claim("w", &opts(Duration::from_secs(60)))
        .await
        .unwrap()
        .unit
        .unwrap();

    assert_eq!(store.count_by_state(State::Pending).await.unwrap(), 1);
    assert_eq!(store.count_by_state(State::Owned).await.unwrap(), 1);
    assert_eq!(store.count_by_state(State::Completed).await.unwrap(), 1);
    assert_eq!(store.count_by_state(State::Failed).await.unwrap(), 0);

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.owned, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.expired_leases, 0);

    let missing = claimq::UnitId(i64::MAX);
    assert!(matches!(store.get(missing).await, Err(Error::NotFound(_))));
}
