//! Embedded, file-backed write-ahead log.
//!
//! A log is a durable, append-only, totally-ordered sequence of opaque
//! byte payloads, partitioned into rolling segment files. Every append
//! is assigned a strictly monotonic sequence id and a non-decreasing
//! timestamp and becomes visible to concurrent readers — including
//! readers tailing the active segment while it is being written.
//!
//! ```no_run
//! use annal::{ReadOptions, Wal, WalOptions};
//!
//! # async fn example() -> annal::Result<()> {
//! let wal = Wal::new(WalOptions::with_data_directory("./wal"));
//! let (sequence_id, timestamp) = wal.append(b"hello").await?;
//! println!("appended {sequence_id} at {timestamp}");
//!
//! let mut stream = wal.read(ReadOptions::default()).await?;
//! while let Some(record) = stream.next().await? {
//!     println!("{}: {} bytes", record.sequence_id, record.payload.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod clock;
pub mod driver;
pub mod error;
pub mod frame;
pub mod index;
pub mod mmap;
pub mod pool;
pub mod reader;
pub mod segment;
pub mod wal;
pub mod writer;

pub use checkpoint::{CheckpointStore, Position};
pub use clock::{Clock, SystemClock};
pub use driver::{BoxError, ConsumerOptions, LogConsumer};
pub use error::{Error, Result};
pub use pool::{BufferPool, PooledBuf};
pub use reader::{Record, SegmentReader};
pub use segment::SegmentHeader;
pub use wal::{LogStream, ReadOptions, RolloverReason, SegmentInfo, Wal, WalOptions};
pub use writer::SegmentWriter;
