
use shardlease::clock::Clock;
use shardlease::coordinator::{AcquireOutcome, ClaimedWork, CoordinatorError, WorkCoordinator};
use shardlease::retry::RetryPolicy;
use shardlease::work_item::{Cursor, WorkItemStatus};
use shardlease::work_item_store::WorkItemStore;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;

async fn acquire(coordinator: &WorkCoordinator) -> ClaimedWork {
    match coordinator.acquire_next_item().await.unwrap() {
        AcquireOutcome::Acquired(claimed) => claimed,
        AcquireOutcome::NoWorkAvailable => panic!("expected claimable work"),
    }
}

#[shardlease::test]
async fn empty_store_has_no_work_and_is_complete() {
    let store = memory_store();
    let clock = manual_clock();
    let a = coordinator(&store, &clock, "a");
    assert!(matches!(
        a.acquire_next_item().await.unwrap(),
        AcquireOutcome::NoWorkAvailable
    ));
    assert!(a.is_migration_complete().await.unwrap());
}

#[shardlease::test]
async fn seed_creates_each_item_once() {
    let store = memory_store();
    let clock = manual_clock();
    let a = coordinator(&store, &clock, "a");
    let ids: Vec<_> = (0..3).map(|n| shard("books", n)).collect();

    assert_eq!(a.seed(&ids).await.unwrap(), 3);
    assert_eq!(a.seed(&ids).await.unwrap(), 0);

    let progress = a.progress().await.unwrap();
    assert_eq!(progress.total, 3);
    assert_eq!(progress.unclaimed, 3);
    assert!(!progress.is_complete());
}

#[shardlease::test]
async fn claim_leases_for_base_times_two_to_the_exponent() {
    let store = memory_store();
    let clock = manual_clock();
    let id = shard("books", 0);
    insert_with_exponent(&store, &id, 2, T0).await;

    let a = coordinator(&store, &clock, "a");
    let claimed = acquire(&a).await;
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.exponent, 2);
    assert_eq!(claimed.lease.duration, Duration::from_secs(240));
    assert_eq!(claimed.lease.acquired_at_ms, T0);
    assert_eq!(claimed.lease.expires_at_ms, T0 + 240_000);
    assert_eq!(claimed.num_attempts, 2);

    let stored = store.get(&id).await.unwrap();
    assert_eq!(stored.status, WorkItemStatus::Claimed);
    assert_eq!(stored.version, claimed.version);
    assert_eq!(stored.leased_by.as_deref(), Some("a"));
}

#[shardlease::test]
async fn expired_lease_is_reclaimed_and_old_holder_is_fenced() {
    let store = memory_store();
    let clock = manual_clock();
    let a = coordinator(&store, &clock, "a");
    let b = coordinator(&store, &clock, "b");
    a.seed(&[shard("books", 0)]).await.unwrap();

    let mut held_by_a = acquire(&a).await;
    a.checkpoint(&mut held_by_a, Cursor(5)).await.unwrap();

    // Live lease: nothing for b
    clock.advance(Duration::from_secs(59));
    assert!(matches!(
        b.acquire_next_item().await.unwrap(),
        AcquireOutcome::NoWorkAvailable
    ));
    assert!(!b.is_migration_complete().await.unwrap());

    // A stalls past its lease; b takes over and resumes from a's checkpoint
    clock.advance(Duration::from_secs(1));
    assert!(a.is_lease_expired(&held_by_a));
    let held_by_b = acquire(&b).await;
    assert_eq!(held_by_b.cursor, Cursor(5));
    assert_eq!(held_by_b.num_attempts, 2);

    let err = a.renew(&mut held_by_a).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::LeaseLost { op: "renew", .. }), "{err:?}");
    let err = a.checkpoint(&mut held_by_a, Cursor(9)).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::LeaseLost { .. }), "{err:?}");
    let err = a.complete(held_by_a).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::LeaseLost { op: "complete", .. }), "{err:?}");

    let stored = store.get(&shard("books", 0)).await.unwrap();
    assert_eq!(stored.status, WorkItemStatus::Claimed);
    assert_eq!(stored.leased_by.as_deref(), Some("b"));
    assert_eq!(stored.cursor, Cursor(5));

    b.complete(held_by_b).await.unwrap();
    assert!(b.is_migration_complete().await.unwrap());
}

#[shardlease::test]
async fn renewal_extends_from_now_and_bumps_version() {
    let store = memory_store();
    let clock = manual_clock();
    let a = coordinator(&store, &clock, "a");
    a.seed(&[shard("books", 0)]).await.unwrap();
    let mut claimed = acquire(&a).await;
    let first_version = claimed.version;

    clock.advance(Duration::from_secs(29));
    assert!(!a.needs_renewal(&claimed));
    assert_eq!(a.lease_remaining_ms(&claimed), 31_000);

    clock.advance(Duration::from_secs(2));
    assert!(a.needs_renewal(&claimed));

    let lease = a.renew(&mut claimed).await.unwrap();
    assert_eq!(lease.expires_at_ms, T0 + 31_000 + 60_000);
    assert_eq!(claimed.version, first_version + 1);
    assert!(!a.needs_renewal(&claimed));
    assert_eq!(
        store.get(&claimed.id).await.unwrap().lease_expiration_ms,
        lease.expires_at_ms
    );
}

#[shardlease::test]
async fn workers_claim_distinct_items_across_pages() {
    let store = memory_store();
    let clock = manual_clock();
    let ids: Vec<_> = (0..5).map(|n| shard("books", n)).collect();
    coordinator(&store, &clock, "seeder").seed(&ids).await.unwrap();

    let mut claimed = HashSet::new();
    for w in 0..5 {
        let worker = coordinator(&store, &clock, &format!("w{w}"));
        let item = acquire(&worker).await;
        assert!(claimed.insert(item.id.clone()), "{} claimed twice", item.id);
    }
    assert_eq!(claimed.len(), 5);

    let late = coordinator(&store, &clock, "late");
    assert!(matches!(
        late.acquire_next_item().await.unwrap(),
        AcquireOutcome::NoWorkAvailable
    ));
    let progress = late.progress().await.unwrap();
    assert_eq!(progress.claimed, 5);
    assert_eq!(progress.remaining(), 5);
}

#[shardlease::test]
async fn racing_acquirers_never_share_an_item() {
    let store = memory_store();
    let clock = manual_clock();
    let ids: Vec<_> = (0..4).map(|n| shard("books", n)).collect();
    coordinator(&store, &clock, "seeder").seed(&ids).await.unwrap();

    let mut handles = Vec::new();
    for w in 0..8 {
        let worker = coordinator(&store, &clock, &format!("w{w}"));
        handles.push(tokio::spawn(async move {
            worker.acquire_next_item().await.unwrap()
        }));
    }
    let mut won = Vec::new();
    for h in handles {
        if let AcquireOutcome::Acquired(claimed) = h.await.unwrap() {
            won.push(claimed.id);
        }
    }
    assert_eq!(won.len(), 4);
    let unique: HashSet<_> = won.iter().collect();
    assert_eq!(unique.len(), 4);
}

#[shardlease::test]
async fn transient_failures_are_retried_then_surface() {
    let inner = memory_store();
    let flaky = FlakyStore::new(Arc::clone(&inner));
    let store: Arc<dyn WorkItemStore> = flaky.clone();
    let clock = manual_clock();
    let a = coordinator(&store, &clock, "a");
    a.seed(&[shard("books", 0)]).await.unwrap();

    // Two failures fit in three attempts
    flaky.fail_next(2);
    let mut claimed = acquire(&a).await;

    flaky.fail_next(3);
    let err = a.checkpoint(&mut claimed, Cursor(3)).await.unwrap_err();
    assert!(
        matches!(err, CoordinatorError::StoreUnavailable { op: "checkpoint", .. }),
        "{err:?}"
    );

    // The lease is still ours once the outage passes
    a.checkpoint(&mut claimed, Cursor(3)).await.unwrap();
    assert_eq!(inner.get(&claimed.id).await.unwrap().cursor, Cursor(3));
}

#[shardlease::test]
async fn no_retry_when_policy_allows_a_single_attempt() {
    let flaky = FlakyStore::new(memory_store());
    let store: Arc<dyn WorkItemStore> = flaky.clone();
    let clock = manual_clock();
    let mut settings = test_settings();
    settings.store_retry = RetryPolicy::immediate(1);
    let a = WorkCoordinator::new(store, clock, settings, "a");

    flaky.fail_next(1);
    let err = a.seed(&[shard("books", 0)]).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::StoreUnavailable { .. }));
    assert_eq!(flaky.calls(), 1);
}

#[shardlease::test]
async fn completion_timing_sets_the_next_claims_exponent() {
    let store = memory_store();
    let clock = manual_clock();
    let a = coordinator(&store, &clock, "a");
    let slow = shard("books", 0);
    let fast = shard("books", 1);
    insert_with_exponent(&store, &slow, 1, T0).await;
    insert_with_exponent(&store, &fast, 2, T0).await;

    // 13s of prep in a 120s lease is over a tenth: grow
    let mut claimed = acquire(&a).await;
    assert_eq!(claimed.id, slow);
    let mut sample = claimed.time_sample();
    clock.advance(Duration::from_secs(13));
    sample.record_migration_start(clock.now_ms());
    assert_eq!(a.record_completion(&mut claimed, &sample), 2);
    assert_eq!(claimed.exponent, 1);
    assert_eq!(claimed.next_exponent(), 2);
    let id = claimed.id.clone();
    a.complete(claimed).await.unwrap();
    assert_eq!(store.get(&id).await.unwrap().next_acquisition_lease_exponent, 2);

    // Instant prep in a 240s lease: shrink, persisted by the release checkpoint
    let mut claimed = acquire(&a).await;
    assert_eq!(claimed.id, fast);
    let mut sample = claimed.time_sample();
    sample.record_migration_start(clock.now_ms());
    assert_eq!(a.record_completion(&mut claimed, &sample), 1);
    a.release(claimed, Cursor(7)).await.unwrap();
    let stored = store.get(&fast).await.unwrap();
    assert_eq!(stored.next_acquisition_lease_exponent, 1);
    assert_eq!(stored.cursor, Cursor(7));
    assert_eq!(stored.status, WorkItemStatus::Claimed);
}

#[shardlease::test]
async fn prep_that_never_finished_counts_until_now() {
    let store = memory_store();
    let clock = manual_clock();
    let a = coordinator(&store, &clock, "a");
    insert_with_exponent(&store, &shard("books", 0), 1, T0).await;

    let mut claimed = acquire(&a).await;
    let sample = claimed.time_sample();
    clock.advance(Duration::from_secs(30));
    assert_eq!(a.record_completion(&mut claimed, &sample), 2);
}

#[shardlease::test]
async fn released_item_stays_leased_until_expiry() {
    let store = memory_store();
    let clock = manual_clock();
    let a = coordinator(&store, &clock, "a");
    let b = coordinator(&store, &clock, "b");
    a.seed(&[shard("books", 0)]).await.unwrap();

    let claimed = acquire(&a).await;
    a.release(claimed, Cursor(4)).await.unwrap();
    assert!(matches!(
        b.acquire_next_item().await.unwrap(),
        AcquireOutcome::NoWorkAvailable
    ));

    clock.advance(Duration::from_secs(60));
    let resumed = acquire(&b).await;
    assert_eq!(resumed.cursor, Cursor(4));
}

#[shardlease::test]
async fn seeded_items_start_at_the_configured_exponent_and_adapt() {
    let store = memory_store();
    let clock = manual_clock();
    let mut settings = test_settings();
    settings.initial_exponent = 2;
    let a = Arc::new(WorkCoordinator::new(Arc::clone(&store), clock.clone(), settings, "a"));
    let fast = shard("books", 0);
    let slow = shard("books", 1);
    a.seed(&[fast.clone(), slow.clone()]).await.unwrap();
    assert_eq!(store.get(&fast).await.unwrap().next_acquisition_lease_exponent, 2);

    let mut claimed = acquire(&a).await;
    assert_eq!(claimed.id, fast);
    assert_eq!(claimed.lease.duration, Duration::from_secs(240));
    let mut sample = claimed.time_sample();
    sample.record_migration_start(clock.now_ms());
    assert_eq!(a.record_completion(&mut claimed, &sample), 1);
    a.checkpoint(&mut claimed, Cursor(1)).await.unwrap();
    // Reseeding never resets an item's exponent
    assert_eq!(a.seed(&[fast.clone()]).await.unwrap(), 0);
    assert_eq!(store.get(&fast).await.unwrap().next_acquisition_lease_exponent, 1);

    let mut claimed = acquire(&a).await;
    assert_eq!(claimed.id, slow);
    let mut sample = claimed.time_sample();
    clock.advance(Duration::from_secs(30));
    sample.record_migration_start(clock.now_ms());
    assert_eq!(a.record_completion(&mut claimed, &sample), 3);
    a.complete(claimed).await.unwrap();
    assert_eq!(store.get(&slow).await.unwrap().next_acquisition_lease_exponent, 3);
}

#[test]
fn default_settings_seed_above_the_floor() {
    assert_eq!(shardlease::coordinator::CoordinatorSettings::default().initial_exponent, 1);
}
