//! Queue store contract, exercised against the in-memory store.

mod common;

use std::sync::Arc;

use claimq::{MemoryStore, QueueStore};

fn store() -> Arc<dyn QueueStore> {
    Arc::new(MemoryStore::new())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claimers_never_share_a_unit() {
    common::at_most_one_owner(store(), 16, 16).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn more_claimers_than_units() {
    common::at_most_one_owner(store(), 20, 7).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn more_units_than_claimers() {
    common::at_most_one_owner(store(), 5, 30).await;
}

#[tokio::test]
async fn unsettled_unit_is_reclaimed_after_lease_expiry() {
    common::no_loss_under_crash(store()).await;
}

#[tokio::test]
async fn unit_fails_after_max_attempts() {
    common::retry_exhaustion(store()).await;
}

#[tokio::test]
async fn oldest_unit_is_claimed_first() {
    common::fifo_preference(store()).await;
}

#[tokio::test]
async fn expired_leases_and_pending_units_share_fifo_order() {
    common::fifo_across_expired_leases(store()).await;
}

#[tokio::test]
async fn settle_is_idempotent() {
    common::idempotent_settle(store()).await;
}

#[tokio::test]
async fn expired_lease_without_attempts_left_fails_the_unit() {
    common::expired_exhausted_unit_is_failed(store()).await;
}

#[tokio::test]
async fn counts_by_state() {
    common::counts_and_lookup(store()).await;
}

#[tokio::test]
async fn empty_store_claims_nothing() {
    let store = store();
    let claim = store
        .claim("w", &claimq::ClaimOptions::default())
        .await
        .unwrap();
    assert!(claim.unit.is_none());
    assert!(claim.abandoned.is_empty());
    assert!(store.health_check().await.is_ok());
}
