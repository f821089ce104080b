use std::time::Duration;

use annal::{Error, ReadOptions, Wal, WalOptions};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

fn options(dir: &std::path::Path) -> WalOptions {
    WalOptions {
        data_directory: dir.to_path_buf(),
        flush_interval: None,
        // Every append reaches the file immediately so tailing readers
        // see it within one poll.
        flush_batch_size: Some(1),
        segment_cleanup_interval: None,
        read_polling_interval: Duration::from_millis(10),
        ..WalOptions::default()
    }
}

#[tokio::test]
async fn watcher_blocks_until_first_append_arrives() {
    let dir = tempdir().expect("tempdir");
    let wal = Wal::new(options(dir.path()));

    let mut stream = wal
        .read(ReadOptions {
            watch: true,
            ..ReadOptions::default()
        })
        .await
        .expect("read");

    // Nothing appended yet: the stream must block, not end.
    let blocked =
        tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
    assert!(blocked.is_err(), "watch stream ended on an empty log");

    let writer = wal.clone();
    let appender = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.append(b"wakeup").await.expect("append");
    });

    let record = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("delivery deadline")
        .expect("stream")
        .expect("record");
    assert_eq!(record.sequence_id, 1);
    assert_eq!(&*record.payload, b"wakeup");

    appender.await.expect("appender");
    drop(stream);
    wal.dispose().await.expect("dispose");
}

#[tokio::test]
async fn tail_follows_across_a_rollover() {
    let dir = tempdir().expect("tempdir");
    let wal = Wal::new(options(dir.path()));

    let mut stream = wal
        .read(ReadOptions {
            watch: true,
            ..ReadOptions::default()
        })
        .await
        .expect("read");

    let writer = wal.clone();
    let appender = tokio::spawn(async move {
        for i in 0..5u8 {
            writer.append(&[i; 16]).await.expect("append");
        }
        writer.rollover().await.expect("rollover");
        for i in 5..10u8 {
            writer.append(&[i; 16]).await.expect("append");
        }
    });

    let mut seen = Vec::new();
    for _ in 0..10 {
        let record = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("delivery deadline")
            .expect("stream")
            .expect("record");
        seen.push(record.sequence_id);
    }
    assert_eq!(seen, (1..=10).collect::<Vec<u64>>());

    appender.await.expect("appender");
    assert_eq!(wal.segments().await.expect("segments").len(), 2);

    drop(stream);
    wal.dispose().await.expect("dispose");
}

#[tokio::test]
async fn watcher_started_mid_log_sees_old_and_new_records() {
    let dir = tempdir().expect("tempdir");
    let wal = Wal::new(options(dir.path()));

    wal.append(b"old-1").await.expect("append");
    wal.append(b"old-2").await.expect("append");

    let mut stream = wal
        .read(ReadOptions {
            watch: true,
            ..ReadOptions::default()
        })
        .await
        .expect("read");

    assert_eq!(stream.next().await.expect("s").expect("r").sequence_id, 1);
    assert_eq!(stream.next().await.expect("s").expect("r").sequence_id, 2);

    wal.append(b"new-3").await.expect("append");
    let record = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("delivery deadline")
        .expect("stream")
        .expect("record");
    assert_eq!(record.sequence_id, 3);
    assert_eq!(&*record.payload, b"new-3");

    drop(stream);
    wal.dispose().await.expect("dispose");
}

#[tokio::test]
async fn cancellation_terminates_a_tailing_stream() {
    let dir = tempdir().expect("tempdir");
    let wal = Wal::new(options(dir.path()));
    wal.append(b"only").await.expect("append");

    let cancel = CancellationToken::new();
    let mut stream = wal
        .read(ReadOptions {
            watch: true,
            cancel: cancel.clone(),
            ..ReadOptions::default()
        })
        .await
        .expect("read");

    assert_eq!(stream.next().await.expect("s").expect("r").sequence_id, 1);

    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        })
    };

    match tokio::time::timeout(Duration::from_secs(2), stream.next()).await {
        Ok(Err(Error::Cancelled)) => {}
        other => panic!("expected cancellation, got {other:?}"),
    }

    canceller.await.expect("canceller");
    wal.dispose().await.expect("dispose");
}

#[tokio::test]
async fn two_watchers_both_see_every_record() {
    let dir = tempdir().expect("tempdir");
    let wal = Wal::new(options(dir.path()));

    let mut first = wal
        .read(ReadOptions {
            watch: true,
            ..ReadOptions::default()
        })
        .await
        .expect("read");
    let mut second = wal
        .read(ReadOptions {
            watch: true,
            ..ReadOptions::default()
        })
        .await
        .expect("read");

    let writer = wal.clone();
    let appender = tokio::spawn(async move {
        for i in 0..3u8 {
            writer.append(&[i]).await.expect("append");
            writer.rollover().await.expect("rollover");
        }
    });

    for stream in [&mut first, &mut second] {
        for expected in 1..=3u64 {
            let record = tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .expect("delivery deadline")
                .expect("stream")
                .expect("record");
            assert_eq!(record.sequence_id, expected);
        }
    }

    appender.await.expect("appender");
    drop(first);
    drop(second);
    wal.dispose().await.expect("dispose");
}
