use std::sync::{Arc, Mutex};
use std::time::Duration;

use annal::{
    CheckpointStore, ConsumerOptions, LogConsumer, Position, Record, Wal, WalOptions,
};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

fn options(dir: &std::path::Path) -> WalOptions {
    WalOptions {
        data_directory: dir.to_path_buf(),
        flush_interval: None,
        flush_batch_size: Some(1),
        segment_cleanup_interval: None,
        read_polling_interval: Duration::from_millis(10),
        ..WalOptions::default()
    }
}

async fn wait_until<F: Fn() -> bool>(check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn counting_consumer(
    wal: Wal,
    store: CheckpointStore,
) -> (LogConsumer, Arc<Mutex<Vec<u64>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let consumer = LogConsumer::new(wal, move |record: Record| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().unwrap().push(record.sequence_id);
            Ok(())
        }
    })
    .with_checkpoint(store);
    (consumer, seen)
}

#[tokio::test]
async fn restart_resumes_after_the_checkpointed_record() {
    let dir = tempdir().expect("tempdir");
    let wal = Wal::new(options(dir.path()));
    let checkpoint_path = dir.path().join("checkpoints").join("reader");

    for i in 0..3u8 {
        wal.append(&[i]).await.expect("append");
    }

    {
        let store = CheckpointStore::open(&checkpoint_path, None).expect("open store");
        let (consumer, seen) = counting_consumer(wal.clone(), store);
        consumer.start(ConsumerOptions::default()).await.expect("start");
        wait_until(|| seen.lock().unwrap().len() == 3).await;
        consumer.stop().await.expect("stop");
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    // More records arrive while the consumer is down.
    wal.append(b"late-4").await.expect("append");
    wal.append(b"late-5").await.expect("append");

    // A fresh consumer over the same store picks up exactly after the
    // last processed record.
    let store = CheckpointStore::open(&checkpoint_path, None).expect("reopen store");
    assert_eq!(store.load().expect("load"), Position::Sequence(3));
    let (consumer, seen) = counting_consumer(wal.clone(), store);
    consumer.start(ConsumerOptions::default()).await.expect("start");
    wait_until(|| seen.lock().unwrap().len() == 2).await;
    consumer.stop().await.expect("stop");
    assert_eq!(*seen.lock().unwrap(), vec![4, 5]);

    wal.dispose().await.expect("dispose");
}

#[tokio::test]
async fn override_checkpoint_rewinds_the_store() {
    let dir = tempdir().expect("tempdir");
    let wal = Wal::new(options(dir.path()));
    let checkpoint_path = dir.path().join("checkpoints").join("reader");

    for i in 0..5u8 {
        wal.append(&[i]).await.expect("append");
    }

    let store = CheckpointStore::open(&checkpoint_path, None).expect("open store");
    store.save(Position::Sequence(4)).expect("seed checkpoint");
    store.flush().expect("flush");

    let (consumer, seen) = counting_consumer(wal.clone(), store);
    consumer
        .start(ConsumerOptions {
            position: Position::Sequence(2),
            override_checkpoint: true,
        })
        .await
        .expect("start");
    wait_until(|| seen.lock().unwrap().len() == 3).await;
    consumer.stop().await.expect("stop");

    // Sequence 2 denotes the last processed record; 3..5 replay.
    assert_eq!(*seen.lock().unwrap(), vec![3, 4, 5]);

    wal.dispose().await.expect("dispose");
}

#[tokio::test]
async fn caller_position_used_when_store_is_empty() {
    let dir = tempdir().expect("tempdir");
    let wal = Wal::new(options(dir.path()));
    let checkpoint_path = dir.path().join("checkpoints").join("reader");

    for i in 0..4u8 {
        wal.append(&[i]).await.expect("append");
    }

    let store = CheckpointStore::open(&checkpoint_path, None).expect("open store");
    let (consumer, seen) = counting_consumer(wal.clone(), store);
    consumer
        .start(ConsumerOptions {
            position: Position::Sequence(2),
            override_checkpoint: false,
        })
        .await
        .expect("start");
    wait_until(|| seen.lock().unwrap().len() == 2).await;
    consumer.stop().await.expect("stop");
    assert_eq!(*seen.lock().unwrap(), vec![3, 4]);

    wal.dispose().await.expect("dispose");
}

#[tokio::test]
async fn run_stops_on_cancellation() {
    let dir = tempdir().expect("tempdir");
    let wal = Wal::new(options(dir.path()));
    let checkpoint_path = dir.path().join("checkpoints").join("reader");

    wal.append(b"only").await.expect("append");

    let store = CheckpointStore::open(&checkpoint_path, None).expect("open store");
    let (consumer, seen) = counting_consumer(wal.clone(), store);

    let cancel = CancellationToken::new();
    let stopper = {
        let cancel = cancel.clone();
        let seen = Arc::clone(&seen);
        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
            while seen.lock().unwrap().is_empty() {
                assert!(tokio::time::Instant::now() < deadline);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            cancel.cancel();
        })
    };

    consumer
        .run(ConsumerOptions::default(), cancel)
        .await
        .expect("run");
    stopper.await.expect("stopper");
    assert_eq!(*seen.lock().unwrap(), vec![1]);

    wal.dispose().await.expect("dispose");
}

#[tokio::test]
async fn timestamp_dimension_is_preserved_through_the_store() {
    let dir = tempdir().expect("tempdir");
    let wal = Wal::new(options(dir.path()));
    let checkpoint_path = dir.path().join("checkpoints").join("reader");

    let mut timestamps = Vec::new();
    for i in 0..3u8 {
        let (_, ts) = wal.append(&[i]).await.expect("append");
        timestamps.push(ts);
    }

    let store = CheckpointStore::open(&checkpoint_path, None).expect("open store");
    let (consumer, seen) = counting_consumer(wal.clone(), store);
    consumer
        .start(ConsumerOptions {
            position: Position::Timestamp(timestamps[0]),
            override_checkpoint: true,
        })
        .await
        .expect("start");
    wait_until(|| seen.lock().unwrap().len() == 2).await;
    consumer.stop().await.expect("stop");
    assert_eq!(*seen.lock().unwrap(), vec![2, 3]);

    // Progress was checkpointed in the timestamp dimension.
    let store = CheckpointStore::open(&checkpoint_path, None).expect("reopen store");
    assert_eq!(
        store.load().expect("load"),
        Position::Timestamp(timestamps[2])
    );

    wal.dispose().await.expect("dispose");
}
