//! Durable reader-position store.
//!
//! One checkpoint is 10 bytes on disk: a 2-byte magic (`ID` for a
//! sequence position, `TS` for a timestamp position) followed by the
//! 8-byte little-endian value. The file is memory-mapped and rewritten
//! in place; a dirty flag gates the flush so quiescent stores cost
//! nothing. An optional background task flushes periodically; with it
//! disabled the owner calls `flush` explicitly.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::mmap::MmapView;
use crate::{Error, Result};

pub const CHECKPOINT_LEN: usize = 10;

const MAGIC_SEQUENCE: [u8; 2] = *b"ID";
const MAGIC_TIMESTAMP: [u8; 2] = *b"TS";

/// A reader position in the log.
///
/// `Start` is the neutral position: no filter, read from the first
/// record. The two filtered dimensions are preserved through
/// checkpointing — a consumer that started on a timestamp keeps
/// checkpointing timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Position {
    #[default]
    Start,
    Sequence(u64),
    Timestamp(i64),
}

impl Position {
    fn encode(&self) -> [u8; CHECKPOINT_LEN] {
        let mut buf = [0u8; CHECKPOINT_LEN];
        match self {
            Position::Start => {}
            Position::Sequence(seq) => {
                buf[0..2].copy_from_slice(&MAGIC_SEQUENCE);
                buf[2..10].copy_from_slice(&seq.to_le_bytes());
            }
            Position::Timestamp(ts) => {
                buf[0..2].copy_from_slice(&MAGIC_TIMESTAMP);
                buf[2..10].copy_from_slice(&ts.to_le_bytes());
            }
        }
        buf
    }

    fn decode(buf: &[u8]) -> Position {
        if buf.len() < CHECKPOINT_LEN {
            return Position::Start;
        }
        match [buf[0], buf[1]] {
            MAGIC_SEQUENCE => {
                Position::Sequence(u64::from_le_bytes(buf[2..10].try_into().expect("slice length")))
            }
            MAGIC_TIMESTAMP => {
                Position::Timestamp(i64::from_le_bytes(buf[2..10].try_into().expect("slice length")))
            }
            _ => Position::Start,
        }
    }
}

pub struct CheckpointStore {
    inner: Arc<CheckpointInner>,
    cancel: CancellationToken,
}

struct CheckpointInner {
    view: Mutex<MmapView>,
    dirty: AtomicBool,
    flushed: tokio::sync::Notify,
    disposed: AtomicBool,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CheckpointStore {
    /// Opens (or creates) a checkpoint file. `flush_interval = None`
    /// disables the background flush; saves then require a manual
    /// [`flush`](CheckpointStore::flush) to become durable.
    pub fn open(path: &Path, flush_interval: Option<Duration>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        if file.metadata()?.len() < CHECKPOINT_LEN as u64 {
            file.set_len(CHECKPOINT_LEN as u64)?;
        }
        let view = MmapView::map_prefix(&file, CHECKPOINT_LEN)?;

        let inner = Arc::new(CheckpointInner {
            view: Mutex::new(view),
            dirty: AtomicBool::new(false),
            flushed: tokio::sync::Notify::new(),
            disposed: AtomicBool::new(false),
            task: Mutex::new(None),
        });
        let cancel = CancellationToken::new();

        if let Some(interval) = flush_interval {
            let task_inner = Arc::clone(&inner);
            let task_cancel = cancel.clone();
            let handle = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = task_cancel.cancelled() => return,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    if let Err(err) = flush_inner(&task_inner) {
                        log::warn!("checkpoint background flush failed: {err}");
                    }
                }
            });
            *inner.task.lock().expect("checkpoint task lock poisoned") = Some(handle);
        }

        Ok(Self { inner, cancel })
    }

    /// Persists `position` to the mapped view and marks it dirty. The
    /// bytes reach the OS on the next flush.
    pub fn save(&self, position: Position) -> Result<()> {
        self.ensure_live()?;
        let mut view = self
            .inner
            .view
            .lock()
            .map_err(|_| Error::Corrupt("checkpoint lock poisoned"))?;
        view.range_mut(0, CHECKPOINT_LEN)?
            .copy_from_slice(&position.encode());
        self.inner.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Reads the stored position; an empty or unrecognized file is the
    /// neutral [`Position::Start`].
    pub fn load(&self) -> Result<Position> {
        self.ensure_live()?;
        let view = self
            .inner
            .view
            .lock()
            .map_err(|_| Error::Corrupt("checkpoint lock poisoned"))?;
        Ok(Position::decode(view.as_slice()))
    }

    /// Flushes the view if dirty and wakes [`wait_for_flush`] waiters.
    ///
    /// [`wait_for_flush`]: CheckpointStore::wait_for_flush
    pub fn flush(&self) -> Result<()> {
        self.ensure_live()?;
        flush_inner(&self.inner)
    }

    /// Awaits the next flush completion (manual or background).
    pub async fn wait_for_flush(&self) -> Result<()> {
        self.ensure_live()?;
        self.inner.flushed.notified().await;
        Ok(())
    }

    /// Cancels the background task, performs a final flush and marks
    /// the store disposed. Further operations fail with
    /// [`Error::Disposed`].
    pub async fn dispose(&self) -> Result<()> {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();
        let task = self
            .inner
            .task
            .lock()
            .expect("checkpoint task lock poisoned")
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        flush_inner(&self.inner)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed);
        }
        Ok(())
    }
}

fn flush_inner(inner: &CheckpointInner) -> Result<()> {
    if inner.dirty.swap(false, Ordering::AcqRel) {
        let view = inner
            .view
            .lock()
            .map_err(|_| Error::Corrupt("checkpoint lock poisoned"))?;
        view.flush()?;
    }
    inner.flushed.notify_waiters();
    Ok(())
}
