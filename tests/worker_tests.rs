
use shardlease::clock::ManualClock;
use shardlease::coordinator::WorkCoordinator;
use shardlease::documents::{MemoryDocumentSink, MemoryDocumentSource, NoopPreparer};
use shardlease::pipeline::{PipelineSettings, ShardMigrationPipeline};
use shardlease::work_item::{Cursor, LeaseGrant, WorkItemStatus};
use shardlease::work_item_store::WorkItemStore;
use shardlease::worker::{CycleOutcome, ExitReason, WorkerLoop, WorkerSettings};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;
use tokio::sync::watch;

fn worker_settings(max_idle_cycles: Option<u32>) -> WorkerSettings {
    WorkerSettings {
        idle_backoff: Duration::from_millis(1),
        max_idle_cycles,
    }
}

fn worker(
    store: &Arc<dyn WorkItemStore>,
    clock: &Arc<ManualClock>,
    name: &str,
    source: Arc<MemoryDocumentSource>,
    sink: Arc<MemoryDocumentSink>,
    settings: WorkerSettings,
    shutdown: watch::Receiver<bool>,
) -> WorkerLoop {
    let pipeline = ShardMigrationPipeline::new(
        coordinator(store, clock, name),
        Arc::new(NoopPreparer),
        source,
        sink,
        PipelineSettings {
            batch_size: 2,
            checkpoint_every_batches: 1,
            ..PipelineSettings::default()
        },
    );
    WorkerLoop::new(pipeline, settings, shutdown)
}

fn source_with(shards: &[(u32, usize)]) -> Arc<MemoryDocumentSource> {
    let mut source = MemoryDocumentSource::new();
    for (n, docs) in shards {
        source = source.with_shard(shard("books", *n), bodies(*docs));
    }
    Arc::new(source)
}

async fn seed(store: &Arc<dyn WorkItemStore>, clock: &Arc<ManualClock>, shards: &[u32]) {
    let ids: Vec<_> = shards.iter().map(|n| shard("books", *n)).collect();
    WorkCoordinator::new(Arc::clone(store), clock.clone(), test_settings(), "seeder")
        .seed(&ids)
        .await
        .unwrap();
}

#[shardlease::test]
async fn drains_every_item_then_stops() {
    let store = memory_store();
    let clock = manual_clock();
    seed(&store, &clock, &[0, 1, 2]).await;
    let sink = Arc::new(MemoryDocumentSink::new());
    let (_tx, rx) = watch::channel(false);
    let w = worker(
        &store,
        &clock,
        "a",
        source_with(&[(0, 3), (1, 0), (2, 5)]),
        sink.clone(),
        worker_settings(None),
        rx,
    );

    let summary = with_timeout!(5_000, { w.run().await });
    assert_eq!(summary.exit, ExitReason::MigrationComplete);
    assert_eq!(summary.completed, 3);
    assert_eq!(summary.documents_written, 8);
    assert_eq!(summary.failed_cycles, 0);
    assert_eq!(sink.document_count("books"), 8);

    for n in 0..3 {
        let item = store.get(&shard("books", n)).await.unwrap();
        assert_eq!(item.status, WorkItemStatus::Completed);
    }
}

#[shardlease::test]
async fn idle_while_others_hold_leases() {
    let store = memory_store();
    let clock = manual_clock();
    seed(&store, &clock, &[0]).await;
    let other = LeaseGrant {
        worker_id: "other".to_string(),
        acquired_at_ms: T0,
        expires_at_ms: T0 + 60_000,
        exponent: 0,
    };
    store
        .try_claim(&shard("books", 0), Some(1), &other)
        .await
        .unwrap();

    let (_tx, rx) = watch::channel(false);
    let w = worker(
        &store,
        &clock,
        "a",
        source_with(&[(0, 3)]),
        Arc::new(MemoryDocumentSink::new()),
        worker_settings(Some(2)),
        rx,
    );

    match w.run_once().await.unwrap() {
        CycleOutcome::Idle(progress) => {
            assert_eq!(progress.claimed, 1);
            assert_eq!(progress.remaining(), 1);
        }
        other => panic!("expected idle cycle, got {other:?}"),
    }

    let summary = with_timeout!(5_000, { w.run().await });
    assert_eq!(summary.exit, ExitReason::IdleLimit);
    assert_eq!(summary.idle_cycles, 2);
    assert_eq!(summary.completed, 0);
}

#[shardlease::test]
async fn shutdown_before_start_does_nothing() {
    let store = memory_store();
    let clock = manual_clock();
    seed(&store, &clock, &[0]).await;
    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();
    let sink = Arc::new(MemoryDocumentSink::new());
    let w = worker(
        &store,
        &clock,
        "a",
        source_with(&[(0, 3)]),
        sink.clone(),
        worker_settings(None),
        rx,
    );

    let summary = w.run().await;
    assert_eq!(summary.exit, ExitReason::Shutdown);
    assert_eq!(summary.cycles, 0);
    assert_eq!(sink.requests(), 0);
    let item = store.get(&shard("books", 0)).await.unwrap();
    assert_eq!(item.status, WorkItemStatus::Unclaimed);
}

#[shardlease::test]
async fn failed_cycle_only_abandons_that_item() {
    let store = memory_store();
    let clock = manual_clock();
    seed(&store, &clock, &[0, 1]).await;
    // Shard 0 has no documents anywhere, so its pipeline run errors out
    let sink = Arc::new(MemoryDocumentSink::new());
    let (_tx, rx) = watch::channel(false);
    let w = worker(
        &store,
        &clock,
        "a",
        source_with(&[(1, 4)]),
        sink.clone(),
        worker_settings(Some(1)),
        rx,
    );

    let summary = with_timeout!(5_000, { w.run().await });
    assert_eq!(summary.failed_cycles, 1);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.exit, ExitReason::IdleLimit);

    // The failed item waits out its lease for someone else
    let failed = store.get(&shard("books", 0)).await.unwrap();
    assert_eq!(failed.status, WorkItemStatus::Claimed);
    assert_eq!(failed.cursor, Cursor::START);
    assert_eq!(
        store.get(&shard("books", 1)).await.unwrap().status,
        WorkItemStatus::Completed
    );
}

#[shardlease::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_workers_split_the_work() {
    let store = memory_store();
    let clock = manual_clock();
    let shards: Vec<u32> = (0..6).collect();
    seed(&store, &clock, &shards).await;
    let source = source_with(&[(0, 3), (1, 4), (2, 1), (3, 6), (4, 2), (5, 5)]);
    let sink = Arc::new(MemoryDocumentSink::new());
    let (_tx, rx) = watch::channel(false);

    let a = worker(
        &store,
        &clock,
        "a",
        Arc::clone(&source),
        sink.clone(),
        worker_settings(None),
        rx.clone(),
    );
    let b = worker(
        &store,
        &clock,
        "b",
        source,
        sink.clone(),
        worker_settings(None),
        rx,
    );

    let (sa, sb) = with_timeout!(10_000, { tokio::join!(a.run(), b.run()) });
    assert_eq!(sa.exit, ExitReason::MigrationComplete);
    assert_eq!(sb.exit, ExitReason::MigrationComplete);
    assert_eq!(sa.completed + sb.completed, 6);
    // Leases never expire here, so nothing is delivered twice
    assert_eq!(sink.deliveries(), 21);
    assert_eq!(sink.document_count("books"), 21);
}
