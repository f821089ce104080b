//! The log engine.
//!
//! Coordinates one segment writer, the per-segment sparse indices and
//! any number of concurrent readers. Appends are serialized under the
//! write lock; the segment set is guarded by a reader/writer lock whose
//! write side is taken only during rollover, retention cleanup and
//! init. In-flight tailing readers are registered in a small slot map;
//! a rollover pushes the new segment into every slot's pending queue
//! and signals it, so tailers never depend on filesystem polling to
//! learn about a rollover that happened in-process.
//!
//! Lock order is writer lock, then segment set, then the reader
//! registry. Every path that takes more than one follows that order.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use tokio::sync::{Mutex, Notify, OnceCell, RwLock};
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::frame::{FRAME_OVERHEAD, MAX_PAYLOAD_LEN};
use crate::index::{rebuild_index, SparseIndex};
use crate::pool::BufferPool;
use crate::reader::{Record, SegmentReader, TailEvent};
use crate::segment::{
    discover_segments, parse_segment_filename, read_header, segment_filename, SegmentHeader,
};
use crate::writer::SegmentWriter;
use crate::{Error, Position, Result};

const NS_PER_SEC: i64 = 1_000_000_000;
const POOLED_BUFFERS: usize = 64;

/// Engine configuration. `None` disables an optional behavior.
#[derive(Debug, Clone)]
pub struct WalOptions {
    /// Segment storage location.
    pub data_directory: PathBuf,
    /// Size-based rollover threshold (framing included).
    pub max_segment_size_bytes: Option<u64>,
    /// Count-based rollover threshold.
    pub max_segment_message_count: Option<u64>,
    /// Age-based rollover; values under one second are raised to one.
    pub max_segment_time_span: Option<Duration>,
    /// Background flush cadence.
    pub flush_interval: Option<Duration>,
    /// Force a flush every N appends.
    pub flush_batch_size: Option<u64>,
    /// Record every Nth append in the segment's sparse index.
    pub sparse_index_interval: Option<u64>,
    /// Tail poll cadence for watching readers.
    pub read_polling_interval: Duration,
    /// Background retention cadence.
    pub segment_cleanup_interval: Option<Duration>,
    /// Age-based retention for sealed segments.
    pub segment_retention_period: Option<Duration>,
    /// Count-based retention for sealed segments.
    pub segment_retention_limit: Option<usize>,
    /// Hard per-record payload cap.
    pub max_entry_payload_size: Option<usize>,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            data_directory: PathBuf::from("wal"),
            max_segment_size_bytes: Some(64 * 1024 * 1024),
            max_segment_message_count: None,
            max_segment_time_span: Some(Duration::from_secs(24 * 60 * 60)),
            flush_interval: Some(Duration::from_secs(1)),
            flush_batch_size: Some(100),
            sparse_index_interval: Some(500),
            read_polling_interval: Duration::from_millis(500),
            segment_cleanup_interval: Some(Duration::from_secs(60 * 60)),
            segment_retention_period: Some(Duration::from_secs(7 * 24 * 60 * 60)),
            segment_retention_limit: None,
            max_entry_payload_size: None,
        }
    }
}

impl WalOptions {
    pub fn with_data_directory(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_directory: dir.into(),
            ..Self::default()
        }
    }
}

/// Why the engine started a new segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloverReason {
    NoWritableSegments,
    SegmentSizeLimitReached,
    SegmentTimeLimitReached,
    SegmentMessageCountLimitReached,
    Manual,
}

/// Snapshot of one segment's header, as returned by [`Wal::segments`].
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub path: PathBuf,
    /// Creation time parsed from the filename, unix seconds.
    pub created_at: i64,
    pub header: SegmentHeader,
}

/// Options for [`Wal::read`].
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Where to start: neutral, a sequence id or a timestamp.
    pub position: Position,
    /// Maximum records to deliver; `None` is unbounded.
    pub limit: Option<u64>,
    /// Keep tailing the active segment once caught up.
    pub watch: bool,
    /// Cooperative cancellation for the stream.
    pub cancel: CancellationToken,
}

#[derive(Clone)]
enum IndexSource {
    Frozen(Arc<SparseIndex>),
    Mutable(Arc<StdRwLock<SparseIndex>>),
}

impl IndexSource {
    fn seek(&self, position: Position) -> u64 {
        match (self, position) {
            (_, Position::Start) => 0,
            (IndexSource::Frozen(index), Position::Sequence(seq)) => index.seek_sequence(seq),
            (IndexSource::Frozen(index), Position::Timestamp(ts)) => index.seek_timestamp(ts),
            (IndexSource::Mutable(index), Position::Sequence(seq)) => index
                .read()
                .map(|index| index.seek_sequence(seq))
                .unwrap_or(0),
            (IndexSource::Mutable(index), Position::Timestamp(ts)) => index
                .read()
                .map(|index| index.seek_timestamp(ts))
                .unwrap_or(0),
        }
    }
}

struct PlannedSegment {
    path: PathBuf,
    index: Option<IndexSource>,
}

struct SealedSegment {
    path: PathBuf,
    created_at: i64,
    header: SegmentHeader,
    index: Arc<SparseIndex>,
}

struct ActiveHandle {
    path: PathBuf,
    created_at: i64,
    index: Arc<StdRwLock<SparseIndex>>,
}

#[derive(Default)]
struct SegmentSet {
    /// Chronological, oldest first.
    sealed: Vec<SealedSegment>,
    active: Option<ActiveHandle>,
}

struct ActiveWriter {
    writer: SegmentWriter,
    expires_at: Option<i64>,
    index: Arc<StdRwLock<SparseIndex>>,
}

#[derive(Default)]
struct WriterState {
    active: Option<ActiveWriter>,
}

struct ReaderSlot {
    pending: StdMutex<VecDeque<PathBuf>>,
    notify: Notify,
}

impl ReaderSlot {
    fn new() -> Self {
        Self {
            pending: StdMutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }
}

struct WalInner {
    options: WalOptions,
    clock: Arc<dyn Clock>,
    init: OnceCell<()>,
    /// Write lock: appends, flushes, rollover, seal, cleanup.
    writer: Mutex<WriterState>,
    /// Indices lock: the segment set; write side only at rollover,
    /// cleanup and init.
    segments: RwLock<SegmentSet>,
    readers: StdMutex<HashMap<u64, Arc<ReaderSlot>>>,
    next_reader_id: AtomicU64,
    last_sequence_id: AtomicU64,
    last_timestamp: AtomicI64,
    pool: Arc<BufferPool>,
    disposed: AtomicBool,
    tasks: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
    shutdown: CancellationToken,
}

/// An embedded, file-backed write-ahead log.
///
/// Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct Wal {
    inner: Arc<WalInner>,
}

impl Wal {
    pub fn new(options: WalOptions) -> Self {
        Self::with_clock(options, Arc::new(SystemClock))
    }

    /// Uses `clock` for record timestamps and time-based rollover.
    pub fn with_clock(options: WalOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(WalInner {
                options,
                clock,
                init: OnceCell::new(),
                writer: Mutex::new(WriterState::default()),
                segments: RwLock::new(SegmentSet::default()),
                readers: StdMutex::new(HashMap::new()),
                next_reader_id: AtomicU64::new(0),
                last_sequence_id: AtomicU64::new(0),
                last_timestamp: AtomicI64::new(-1),
                pool: BufferPool::new(POOLED_BUFFERS),
                disposed: AtomicBool::new(false),
                tasks: StdMutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn options(&self) -> &WalOptions {
        &self.inner.options
    }

    /// Initializes the engine from the data directory. Idempotent;
    /// `append` and `read` call this on first use.
    pub async fn init(&self) -> Result<()> {
        self.ensure_live()?;
        let this = self.clone();
        self.inner
            .init
            .get_or_try_init(|| async move { this.init_impl().await })
            .await?;
        Ok(())
    }

    async fn init_impl(&self) -> Result<()> {
        let options = &self.inner.options;
        std::fs::create_dir_all(&options.data_directory)?;
        let interval = options.sparse_index_interval.unwrap_or(0);

        let mut sealed_files = Vec::new();
        let mut writable_files = Vec::new();
        let mut max_seq = 0u64;
        let mut max_ts = -1i64;

        for found in discover_segments(&options.data_directory)? {
            let header = match read_header(&found.path) {
                Ok(header) => header,
                Err(Error::InvalidHeader(reason)) => {
                    log::warn!(
                        "skipping segment {} with invalid header: {reason}",
                        found.path.display()
                    );
                    continue;
                }
                Err(err) => return Err(err),
            };
            if !header.is_empty() {
                max_seq = max_seq.max(header.last_sequence_id);
                max_ts = max_ts.max(header.last_timestamp);
            }
            if header.read_only {
                sealed_files.push((found, header));
            } else {
                writable_files.push((found, header));
            }
        }

        // The newest writable file resumes as the active segment. More
        // than one writable file means a crash hit between installing a
        // new writer and sealing the old one; seal the strays now.
        let active_file = writable_files.pop();
        for (found, _) in writable_files {
            log::warn!("sealing stray writable segment {}", found.path.display());
            match SegmentWriter::open(&found.path).and_then(|mut writer| writer.seal()) {
                Ok(header) => sealed_files.push((found, header)),
                Err(err) => {
                    log::warn!(
                        "failed to seal stray segment {}: {err}",
                        found.path.display()
                    );
                }
            }
        }
        sealed_files.sort_by(|a, b| a.0.path.cmp(&b.0.path));

        let mut set = SegmentSet::default();
        for (found, header) in sealed_files {
            let index = Arc::new(rebuild_index(&found.path, interval)?);
            set.sealed.push(SealedSegment {
                path: found.path,
                created_at: found.created_at,
                header,
                index,
            });
        }

        let mut writer_state = WriterState::default();
        if let Some((found, _)) = active_file {
            // Open first: reopening truncates uncommitted tail bytes,
            // and the index scan must see the truncated file.
            let writer = SegmentWriter::open(&found.path)?;
            let index = Arc::new(StdRwLock::new(rebuild_index(&found.path, interval)?));
            set.active = Some(ActiveHandle {
                path: found.path.clone(),
                created_at: found.created_at,
                index: Arc::clone(&index),
            });
            writer_state.active = Some(ActiveWriter {
                writer,
                expires_at: segment_expiry(found.created_at, options.max_segment_time_span),
                index,
            });
        }

        self.inner.last_sequence_id.store(max_seq, Ordering::SeqCst);
        self.inner.last_timestamp.store(max_ts, Ordering::SeqCst);
        *self.inner.writer.lock().await = writer_state;
        *self.inner.segments.write().await = set;

        self.spawn_background_tasks();
        Ok(())
    }

    fn spawn_background_tasks(&self) {
        let mut tasks = self.inner.tasks.lock().expect("task list lock poisoned");

        // Tasks hold the engine weakly so a log dropped without dispose
        // still unwinds instead of being kept alive by its own timers.
        if let Some(interval) = self.inner.options.flush_interval {
            let weak = Arc::downgrade(&self.inner);
            let cancel = self.inner.shutdown.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    let wal = match weak.upgrade() {
                        Some(inner) => Wal { inner },
                        None => return,
                    };
                    if let Err(err) = wal.flush().await {
                        log::warn!("background flush failed: {err}");
                    }
                }
            }));
        }

        if let Some(interval) = self.inner.options.segment_cleanup_interval {
            let weak = Arc::downgrade(&self.inner);
            let cancel = self.inner.shutdown.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    let wal = match weak.upgrade() {
                        Some(inner) => Wal { inner },
                        None => return,
                    };
                    if let Err(err) = wal.cleanup().await {
                        log::warn!("background retention cleanup failed: {err}");
                    }
                }
            }));
        }
    }

    /// Appends one payload, returning its `(sequence_id, timestamp)`.
    ///
    /// Sequence ids are strictly monotonic across the whole log and
    /// survive restarts; timestamps never decrease.
    pub async fn append(&self, payload: &[u8]) -> Result<(u64, i64)> {
        self.ensure_live()?;
        self.init().await?;

        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::PayloadTooLarge);
        }
        if let Some(max) = self.inner.options.max_entry_payload_size {
            if payload.len() > max {
                return Err(Error::PayloadTooLarge);
            }
        }

        let mut state = self.inner.writer.lock().await;
        self.ensure_live()?;

        let frame_len = (FRAME_OVERHEAD + payload.len()) as u64;
        let now = self.inner.clock.now();
        if let Some(reason) = self.rollover_reason(&state, frame_len, now) {
            self.roll(&mut state, reason).await?;
        }

        let active = state
            .active
            .as_mut()
            .ok_or(Error::Corrupt("no active segment after rollover"))?;

        let sequence_id = self.inner.last_sequence_id.load(Ordering::Relaxed) + 1;
        let timestamp = now.max(self.inner.last_timestamp.load(Ordering::Relaxed));
        let written = active.writer.append(sequence_id, timestamp, payload)?;
        let header = active.writer.header();

        if let Some(interval) = nonzero(self.inner.options.sparse_index_interval) {
            if (header.message_count - 1) % interval == 0 {
                if let Ok(mut index) = active.index.write() {
                    index.push(sequence_id, timestamp, header.size_bytes - written);
                }
            }
        }

        if let Some(batch) = nonzero(self.inner.options.flush_batch_size) {
            if header.message_count % batch == 0 {
                active.writer.flush()?;
            }
        }

        self.inner
            .last_sequence_id
            .store(sequence_id, Ordering::SeqCst);
        self.inner.last_timestamp.store(timestamp, Ordering::SeqCst);
        Ok((sequence_id, timestamp))
    }

    /// First matching rollover condition, if any.
    fn rollover_reason(
        &self,
        state: &WriterState,
        incoming_frame_len: u64,
        now_ns: i64,
    ) -> Option<RolloverReason> {
        let options = &self.inner.options;
        let active = match &state.active {
            Some(active) => active,
            None => return Some(RolloverReason::NoWritableSegments),
        };
        let header = active.writer.header();

        if let Some(limit) = options.max_segment_size_bytes.filter(|&limit| limit > 0) {
            // Inclusive limit: a frame that lands exactly on the limit
            // still fits; the next one rolls.
            if header.size_bytes + incoming_frame_len > limit {
                return Some(RolloverReason::SegmentSizeLimitReached);
            }
        }
        if let Some(expires_at) = active.expires_at {
            if now_ns.div_euclid(NS_PER_SEC) >= expires_at {
                return Some(RolloverReason::SegmentTimeLimitReached);
            }
        }
        if let Some(limit) = nonzero(options.max_segment_message_count) {
            if header.message_count >= limit {
                return Some(RolloverReason::SegmentMessageCountLimitReached);
            }
        }
        None
    }

    /// Seals the current segment and starts a new one. Caller holds
    /// the write lock. The new writer is installed and in-flight
    /// readers are signalled before the old writer is sealed, so
    /// concurrent readers always have a segment to tail.
    async fn roll(&self, state: &mut WriterState, reason: RolloverReason) -> Result<()> {
        let options = &self.inner.options;
        let now = self.inner.clock.now();
        let created_at = now.div_euclid(NS_PER_SEC);
        let path = options.data_directory.join(segment_filename(now)?);

        let writer = SegmentWriter::open(&path)?;
        let index = Arc::new(StdRwLock::new(SparseIndex::new()));
        log::debug!("rolling over to {} ({reason:?})", path.display());

        let mut set = self.inner.segments.write().await;
        let previous = state.active.replace(ActiveWriter {
            writer,
            expires_at: segment_expiry(created_at, options.max_segment_time_span),
            index: Arc::clone(&index),
        });
        set.active = Some(ActiveHandle {
            path: path.clone(),
            created_at,
            index,
        });

        {
            let readers = self
                .inner
                .readers
                .lock()
                .map_err(|_| Error::Corrupt("reader registry poisoned"))?;
            for slot in readers.values() {
                slot.pending
                    .lock()
                    .map_err(|_| Error::Corrupt("reader slot poisoned"))?
                    .push_back(path.clone());
                slot.notify.notify_one();
            }
        }

        if let Some(mut previous) = previous {
            let sealed_path = previous.writer.path().to_path_buf();
            let seal_result = previous.writer.seal();
            let header = match &seal_result {
                Ok(header) => *header,
                // Keep the segment readable even if the seal failed
                // half-way; init repairs it on the next start.
                Err(_) => previous.writer.header(),
            };
            let frozen = previous
                .index
                .read()
                .map(|index| index.clone())
                .unwrap_or_default();
            set.sealed.push(SealedSegment {
                path: sealed_path,
                created_at: created_at_of(previous.writer.path()),
                header,
                index: Arc::new(frozen),
            });
            seal_result?;
        }
        Ok(())
    }

    /// Opens a record stream at `options.position`.
    ///
    /// Matching sealed segments are snapshotted under the indices lock
    /// and, when watching, the stream is registered for rollover
    /// notifications before the lock is released, so no segment can
    /// slip between the snapshot and the registration.
    pub async fn read(&self, options: ReadOptions) -> Result<LogStream> {
        self.ensure_live()?;
        self.init().await?;

        let set = self.inner.segments.read().await;
        let mut plan = VecDeque::new();
        for sealed in &set.sealed {
            if sealed.header.is_empty() {
                continue;
            }
            let matches = match options.position {
                Position::Start => true,
                Position::Sequence(seq) => sealed.header.last_sequence_id >= seq,
                Position::Timestamp(ts) => sealed.header.last_timestamp >= ts,
            };
            if matches {
                plan.push_back(PlannedSegment {
                    path: sealed.path.clone(),
                    index: Some(IndexSource::Frozen(Arc::clone(&sealed.index))),
                });
            }
        }
        if let Some(active) = &set.active {
            let matches = options.watch
                || match options.position {
                    Position::Start => true,
                    Position::Sequence(seq) => {
                        seq <= self.inner.last_sequence_id.load(Ordering::SeqCst)
                    }
                    Position::Timestamp(ts) => {
                        ts <= self.inner.last_timestamp.load(Ordering::SeqCst)
                    }
                };
            if matches {
                plan.push_back(PlannedSegment {
                    path: active.path.clone(),
                    index: Some(IndexSource::Mutable(Arc::clone(&active.index))),
                });
            }
        }

        let finished = plan.is_empty() && !options.watch;
        let slot = Arc::new(ReaderSlot::new());
        let reader_id = self.inner.next_reader_id.fetch_add(1, Ordering::Relaxed);
        if options.watch {
            self.inner
                .readers
                .lock()
                .map_err(|_| Error::Corrupt("reader registry poisoned"))?
                .insert(reader_id, Arc::clone(&slot));
        }
        drop(set);

        Ok(LogStream {
            inner: Arc::clone(&self.inner),
            reader_id,
            slot,
            plan,
            current: None,
            position: options.position,
            remaining: options.limit,
            watch: options.watch,
            first_segment: true,
            finished,
            cancel: options.cancel,
        })
    }

    /// Flushes the active segment's tail and header to the OS.
    pub async fn flush(&self) -> Result<()> {
        self.ensure_live()?;
        self.init().await?;
        let mut state = self.inner.writer.lock().await;
        if let Some(active) = state.active.as_mut() {
            active.writer.flush()?;
        }
        Ok(())
    }

    /// Seals the active segment and starts a new one.
    pub async fn rollover(&self) -> Result<()> {
        self.ensure_live()?;
        self.init().await?;
        let mut state = self.inner.writer.lock().await;
        self.roll(&mut state, RolloverReason::Manual).await
    }

    /// Applies the retention policy to sealed segments, returning the
    /// deleted paths. The active segment is never considered. Deletion
    /// failures are logged and retried on the next sweep; a segment's
    /// index is dropped only once its file is actually gone.
    pub async fn cleanup(&self) -> Result<Vec<PathBuf>> {
        self.ensure_live()?;
        self.init().await?;
        let _write = self.inner.writer.lock().await;
        let mut set = self.inner.segments.write().await;
        let options = &self.inner.options;

        let total = set.sealed.len();
        let mut expendable = vec![false; total];
        if let Some(limit) = options.segment_retention_limit.filter(|&limit| limit > 0) {
            if total > limit {
                for slot in expendable.iter_mut().take(total - limit) {
                    *slot = true;
                }
            }
        }
        if let Some(period) = options.segment_retention_period {
            let now = self.inner.clock.now().div_euclid(NS_PER_SEC);
            let period = period.as_secs() as i64;
            for (slot, sealed) in expendable.iter_mut().zip(&set.sealed) {
                if sealed.created_at + period < now {
                    *slot = true;
                }
            }
        }

        let mut deleted = Vec::new();
        let mut kept = Vec::new();
        for (expend, sealed) in expendable.into_iter().zip(set.sealed.drain(..)) {
            if !expend {
                kept.push(sealed);
                continue;
            }
            match std::fs::remove_file(&sealed.path) {
                Ok(()) => deleted.push(sealed.path),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    deleted.push(sealed.path)
                }
                Err(err) => {
                    log::warn!("failed to delete segment {}: {err}", sealed.path.display());
                    kept.push(sealed);
                }
            }
        }
        set.sealed = kept;
        Ok(deleted)
    }

    /// Header snapshots of every segment, oldest first, active last.
    pub async fn segments(&self) -> Result<Vec<SegmentInfo>> {
        self.ensure_live()?;
        self.init().await?;
        let state = self.inner.writer.lock().await;
        let set = self.inner.segments.read().await;

        let mut infos: Vec<SegmentInfo> = set
            .sealed
            .iter()
            .map(|sealed| SegmentInfo {
                path: sealed.path.clone(),
                created_at: sealed.created_at,
                header: sealed.header,
            })
            .collect();
        if let (Some(handle), Some(active)) = (&set.active, &state.active) {
            infos.push(SegmentInfo {
                path: handle.path.clone(),
                created_at: handle.created_at,
                header: active.writer.header(),
            });
        }
        Ok(infos)
    }

    /// Stops background tasks, flushes the active segment and marks
    /// the log disposed. Further operations fail with
    /// [`Error::Disposed`]; in-flight streams end on their next poll.
    pub async fn dispose(&self) -> Result<()> {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.shutdown.cancel();
        let tasks: Vec<_> = self
            .inner
            .tasks
            .lock()
            .map_err(|_| Error::Corrupt("task list lock poisoned"))?
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
        let mut state = self.inner.writer.lock().await;
        if let Some(active) = state.active.as_mut() {
            active.writer.flush()?;
        }
        Ok(())
    }

    fn ensure_live(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed);
        }
        Ok(())
    }
}

fn nonzero(value: Option<u64>) -> Option<u64> {
    value.filter(|&value| value > 0)
}

fn segment_expiry(created_at: i64, span: Option<Duration>) -> Option<i64> {
    span.map(|span| {
        let span = span.max(Duration::from_secs(1));
        created_at + span.as_secs() as i64
    })
}

fn created_at_of(path: &std::path::Path) -> i64 {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(parse_segment_filename)
        .unwrap_or(0)
}

/// What a tailing stream should do after waiting at the log head.
enum TailOutcome {
    Notified,
    Event(TailEvent),
}

/// Pull-based record stream returned by [`Wal::read`].
///
/// Delivers records in sequence order across segment boundaries. When
/// watching, blocks at the log head until new appends arrive; a
/// rollover moves the stream onto the next segment without dropping or
/// duplicating records. Dropping the stream unregisters it.
pub struct LogStream {
    inner: Arc<WalInner>,
    reader_id: u64,
    slot: Arc<ReaderSlot>,
    plan: VecDeque<PlannedSegment>,
    current: Option<SegmentReader>,
    position: Position,
    remaining: Option<u64>,
    watch: bool,
    first_segment: bool,
    finished: bool,
    cancel: CancellationToken,
}

impl LogStream {
    /// Next record, or `None` when the stream is exhausted.
    pub async fn next(&mut self) -> Result<Option<Record>> {
        loop {
            if self.inner.disposed.load(Ordering::Acquire) {
                self.finish();
                return Err(Error::Disposed);
            }
            if self.cancel.is_cancelled() {
                self.finish();
                return Err(Error::Cancelled);
            }
            if self.finished {
                return Ok(None);
            }
            if self.remaining == Some(0) {
                self.finish();
                return Ok(None);
            }

            if self.current.is_none() {
                if self.open_next_segment()? {
                    continue;
                }
                if !self.watch {
                    self.finish();
                    return Ok(None);
                }
                // Nothing to read yet; wait for the first rollover to
                // hand us a segment.
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        self.finish();
                        return Err(Error::Cancelled);
                    }
                    _ = self.slot.notify.notified() => {}
                }
                continue;
            }

            let slot = Arc::clone(&self.slot);
            let cancel = self.cancel.clone();
            let poll = self.inner.options.read_polling_interval;
            let reader = match self.current.as_mut() {
                Some(reader) => reader,
                None => continue,
            };

            let decoded = reader.next_record()?;
            if let Some(record) = decoded {
                if !self.matches_position(&record) {
                    continue;
                }
                if let Some(remaining) = self.remaining.as_mut() {
                    *remaining -= 1;
                }
                return Ok(Some(record));
            }

            // Out of bytes in the current segment.
            if !self.watch {
                self.current = None;
                continue;
            }

            let successor_queued = !slot
                .pending
                .lock()
                .map_err(|_| Error::Corrupt("reader slot poisoned"))?
                .is_empty();
            let outcome = if successor_queued {
                // A rollover already produced the next segment. Wait
                // for this file's seal (or its final growth) so appends
                // still in the writer's buffer cannot be skipped.
                TailOutcome::Event(reader.wait_for_tail(poll, &cancel).await?)
            } else {
                tokio::select! {
                    _ = slot.notify.notified() => TailOutcome::Notified,
                    event = reader.wait_for_tail(poll, &cancel) => TailOutcome::Event(event?),
                }
            };
            match outcome {
                TailOutcome::Notified => {}
                TailOutcome::Event(TailEvent::Grew) => {}
                TailOutcome::Event(TailEvent::Sealed) | TailOutcome::Event(TailEvent::Vanished) => {
                    self.current = None;
                }
            }
        }
    }

    /// Resyncs observed on the current segment (corrupt or partial
    /// frames skipped).
    pub fn resyncs(&self) -> u64 {
        self.current.as_ref().map_or(0, SegmentReader::resyncs)
    }

    fn matches_position(&self, record: &Record) -> bool {
        match self.position {
            Position::Start => true,
            Position::Sequence(seq) => record.sequence_id >= seq,
            Position::Timestamp(ts) => record.timestamp >= ts,
        }
    }

    /// Moves to the next planned segment (or, when watching, the next
    /// rollover-queued one). Returns false when nothing is available.
    fn open_next_segment(&mut self) -> Result<bool> {
        loop {
            let planned = match self.plan.pop_front() {
                Some(planned) => Some(planned),
                None if self.watch => self
                    .slot
                    .pending
                    .lock()
                    .map_err(|_| Error::Corrupt("reader slot poisoned"))?
                    .pop_front()
                    .map(|path| PlannedSegment { path, index: None }),
                None => None,
            };
            let planned = match planned {
                Some(planned) => planned,
                None => return Ok(false),
            };

            // The sparse index only helps on the first segment; later
            // segments are read from the start of their body.
            let offset = if self.first_segment {
                planned
                    .index
                    .as_ref()
                    .map_or(0, |index| index.seek(self.position))
            } else {
                0
            };
            self.first_segment = false;

            match SegmentReader::open(&planned.path, offset, Arc::clone(&self.inner.pool)) {
                Ok(reader) => {
                    self.current = Some(reader);
                    return Ok(true);
                }
                Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                    // Retention removed the file before we reached it;
                    // its records are gone by policy, not by accident.
                    log::warn!("segment {} vanished before read", planned.path.display());
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        if let Ok(mut readers) = self.inner.readers.lock() {
            readers.remove(&self.reader_id);
        }
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        self.finish();
    }
}
