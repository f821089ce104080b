//! Checkpointed record pump.
//!
//! A `LogConsumer` wraps a [`Wal`] and an optional [`CheckpointStore`]:
//! it resumes from the stored position, feeds every record to a
//! user-supplied async handler and persists progress after each one.
//! The checkpoint denotes the *last processed* record, so resuming
//! never re-delivers it.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{CheckpointStore, Position};
use crate::reader::Record;
use crate::wal::{ReadOptions, Wal};
use crate::{Error, Result};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type RecordHandler =
    Arc<dyn Fn(Record) -> BoxFuture<'static, std::result::Result<(), BoxError>> + Send + Sync>;
/// Receives the failing record's sequence id and the handler error;
/// returns true when the error was handled.
type ErrorHandler = Arc<dyn Fn(u64, &BoxError) -> bool + Send + Sync>;

/// Options for [`LogConsumer::start`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsumerOptions {
    /// Position to fall back to when the checkpoint store is empty (or
    /// to force, with `override_checkpoint`). Denotes the last
    /// processed record; delivery starts after it.
    pub position: Position,
    /// Ignore the stored checkpoint and start from `position`,
    /// overwriting the store.
    pub override_checkpoint: bool,
}

struct ConsumerState {
    task: Option<tokio::task::JoinHandle<()>>,
    cancel: Option<CancellationToken>,
}

pub struct LogConsumer {
    wal: Wal,
    checkpoint: Option<Arc<CheckpointStore>>,
    handler: RecordHandler,
    error_handler: Option<ErrorHandler>,
    state: Mutex<ConsumerState>,
}

impl LogConsumer {
    /// Creates a consumer invoking `handler` for every record.
    pub fn new<F, Fut>(wal: Wal, handler: F) -> Self
    where
        F: Fn(Record) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        Self {
            wal,
            checkpoint: None,
            handler: Arc::new(
                move |record| -> BoxFuture<'static, std::result::Result<(), BoxError>> {
                    Box::pin(handler(record))
                },
            ),
            error_handler: None,
            state: Mutex::new(ConsumerState {
                task: None,
                cancel: None,
            }),
        }
    }

    /// Persists progress through `store` after every handled record.
    pub fn with_checkpoint(mut self, store: CheckpointStore) -> Self {
        self.checkpoint = Some(Arc::new(store));
        self
    }

    /// Routes handler errors through `callback`; a `false` return (or
    /// no callback at all) logs the error instead.
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(u64, &BoxError) -> bool + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(callback));
        self
    }

    /// Resolves the starting position and launches the pump loop.
    /// Idempotent while running.
    pub async fn start(&self, options: ConsumerOptions) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.task.is_some() {
            return Ok(());
        }

        let (start_position, skip_initial) = self.resolve_start(options)?;

        let cancel = CancellationToken::new();
        let wal = self.wal.clone();
        let checkpoint = self.checkpoint.clone();
        let handler = Arc::clone(&self.handler);
        let error_handler = self.error_handler.clone();
        let loop_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            pump(
                wal,
                checkpoint,
                handler,
                error_handler,
                start_position,
                skip_initial,
                loop_cancel,
            )
            .await;
        });

        state.task = Some(task);
        state.cancel = Some(cancel);
        Ok(())
    }

    /// Pauses the pump and waits for it to go quiescent. Progress is
    /// flushed; `start` resumes from it.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = state.task.take() {
            let _ = task.await;
        }
        if let Some(checkpoint) = &self.checkpoint {
            checkpoint.flush()?;
        }
        Ok(())
    }

    /// Starts, waits for `cancel`, then stops.
    pub async fn run(&self, options: ConsumerOptions, cancel: CancellationToken) -> Result<()> {
        self.start(options).await?;
        cancel.cancelled().await;
        self.stop().await
    }

    /// Initial position plus whether the record sitting exactly at it
    /// must be dropped instead of re-delivered.
    fn resolve_start(&self, options: ConsumerOptions) -> Result<(Position, bool)> {
        if options.override_checkpoint {
            if let Some(checkpoint) = &self.checkpoint {
                checkpoint.save(options.position)?;
                checkpoint.flush()?;
            }
            return Ok((options.position, true));
        }

        let stored = match &self.checkpoint {
            Some(checkpoint) => checkpoint.load()?,
            None => Position::Start,
        };
        match stored {
            Position::Start => {
                let skip = !matches!(options.position, Position::Start);
                Ok((options.position, skip))
            }
            resumed => Ok((resumed, true)),
        }
    }
}

async fn pump(
    wal: Wal,
    checkpoint: Option<Arc<CheckpointStore>>,
    handler: RecordHandler,
    error_handler: Option<ErrorHandler>,
    start_position: Position,
    skip_initial: bool,
    cancel: CancellationToken,
) {
    let timestamp_dimension = matches!(start_position, Position::Timestamp(_));
    let mut position = start_position;
    let mut skip = skip_initial;

    let mut stream = match wal
        .read(ReadOptions {
            position,
            limit: None,
            watch: true,
            cancel: cancel.clone(),
        })
        .await
    {
        Ok(stream) => stream,
        Err(Error::Cancelled) | Err(Error::Disposed) => return,
        Err(err) => {
            log::error!("consumer failed to open log stream: {err}");
            return;
        }
    };

    loop {
        let record = match stream.next().await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(Error::Cancelled) | Err(Error::Disposed) => return,
            Err(err) => {
                log::error!("consumer stream failed: {err}");
                return;
            }
        };

        if skip && position_matches(position, &record) {
            // This record is the checkpointed one; it was already
            // processed in a previous run.
            skip = false;
            drop(record);
            continue;
        }

        let sequence_id = record.sequence_id;
        let timestamp = record.timestamp;
        if let Err(err) = (handler)(record).await {
            let handled = error_handler
                .as_ref()
                .map(|callback| callback(sequence_id, &err))
                .unwrap_or(false);
            if !handled {
                log::error!("record handler failed at sequence {sequence_id}: {err}");
            }
        }

        position = if timestamp_dimension {
            Position::Timestamp(timestamp)
        } else {
            Position::Sequence(sequence_id)
        };
        if let Some(checkpoint) = &checkpoint {
            if let Err(err) = checkpoint.save(position) {
                log::warn!("failed to save checkpoint: {err}");
            }
        }
    }
}

fn position_matches(position: Position, record: &Record) -> bool {
    match position {
        Position::Start => false,
        Position::Sequence(seq) => record.sequence_id == seq,
        Position::Timestamp(ts) => record.timestamp == ts,
    }
}
