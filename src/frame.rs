//! Record frame codec.
//!
//! One frame on disk:
//!
//! ```text
//! offset 0   magic "MSG!"
//! offset 4   payload length (i32, LE, >= 0)
//! offset 8   sequence id (u64, LE)
//! offset 16  timestamp (i64, LE, ns since UNIX epoch)
//! offset 24  payload (N bytes)
//! offset 24+N crc32 over bytes [0, 24+N)
//! ```
//!
//! Total frame size is `28 + N`. The decoder scans forward for the magic
//! and resynchronizes past rejected candidates, so a truncated or
//! garbage-overwritten tail (crashed writer) is skipped silently instead
//! of surfaced as an error.

use crate::{Error, Result};

pub const FRAME_MAGIC: [u8; 4] = *b"MSG!";
pub const FRAME_OVERHEAD: usize = 28;

pub const LEN_OFFSET: usize = 4;
pub const SEQ_OFFSET: usize = 8;
pub const TIMESTAMP_OFFSET: usize = 16;
pub const PAYLOAD_OFFSET: usize = 24;

pub const MAX_PAYLOAD_LEN: usize = i32::MAX as usize;

/// Outcome of one decode attempt over a byte window.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameOutcome<'a> {
    /// A complete, CRC-verified frame. `consumed` covers any skipped
    /// garbage before the magic plus the frame itself.
    Frame {
        sequence_id: u64,
        timestamp: i64,
        payload: &'a [u8],
        consumed: usize,
    },
    /// Not enough bytes to finish the candidate frame. The first
    /// `discard` bytes hold no frame start and can be dropped; the
    /// caller keeps the rest and refills.
    NeedMore { discard: usize },
    /// The candidate frame failed validation. Drop `discard` bytes
    /// (one past the rejected magic) and scan again.
    Resync { discard: usize },
}

pub fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Encodes one record frame into `buf`, returning the number of bytes
/// written (`28 + payload.len()`).
pub fn encode_record(
    buf: &mut Vec<u8>,
    sequence_id: u64,
    timestamp: i64,
    payload: &[u8],
) -> Result<usize> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(Error::PayloadTooLarge);
    }

    let start = buf.len();
    buf.reserve(FRAME_OVERHEAD + payload.len());
    buf.extend_from_slice(&FRAME_MAGIC);
    buf.extend_from_slice(&(payload.len() as i32).to_le_bytes());
    buf.extend_from_slice(&sequence_id.to_le_bytes());
    buf.extend_from_slice(&timestamp.to_le_bytes());
    buf.extend_from_slice(payload);
    let crc = crc32(&buf[start..]);
    buf.extend_from_slice(&crc.to_le_bytes());

    Ok(FRAME_OVERHEAD + payload.len())
}

/// Attempts to decode the first frame in `buf`.
///
/// Pure function over the window; no state. Garbage bytes before a magic
/// are skipped silently. When no magic is found, up to 3 trailing bytes
/// are retained in case a magic straddles the next refill.
pub fn try_decode(buf: &[u8]) -> FrameOutcome<'_> {
    let start = match find_magic(buf) {
        Some(start) => start,
        None => {
            return FrameOutcome::NeedMore {
                discard: buf.len().saturating_sub(FRAME_MAGIC.len() - 1),
            }
        }
    };

    let avail = buf.len() - start;
    if avail < PAYLOAD_OFFSET {
        return FrameOutcome::NeedMore { discard: start };
    }

    let len = i32::from_le_bytes(
        buf[start + LEN_OFFSET..start + LEN_OFFSET + 4]
            .try_into()
            .expect("slice length"),
    );
    if len < 0 {
        return FrameOutcome::Resync { discard: start + 1 };
    }
    let payload_len = len as usize;
    let total = FRAME_OVERHEAD + payload_len;
    if avail < total {
        return FrameOutcome::NeedMore { discard: start };
    }

    let body = &buf[start..start + PAYLOAD_OFFSET + payload_len];
    let stored = u32::from_le_bytes(
        buf[start + PAYLOAD_OFFSET + payload_len..start + total]
            .try_into()
            .expect("slice length"),
    );
    if crc32(body) != stored {
        return FrameOutcome::Resync { discard: start + 1 };
    }

    let sequence_id = u64::from_le_bytes(
        buf[start + SEQ_OFFSET..start + SEQ_OFFSET + 8]
            .try_into()
            .expect("slice length"),
    );
    let timestamp = i64::from_le_bytes(
        buf[start + TIMESTAMP_OFFSET..start + TIMESTAMP_OFFSET + 8]
            .try_into()
            .expect("slice length"),
    );

    FrameOutcome::Frame {
        sequence_id,
        timestamp,
        payload: &buf[start + PAYLOAD_OFFSET..start + PAYLOAD_OFFSET + payload_len],
        consumed: start + total,
    }
}

fn find_magic(buf: &[u8]) -> Option<usize> {
    if buf.len() < FRAME_MAGIC.len() {
        return None;
    }
    buf.windows(FRAME_MAGIC.len())
        .position(|window| window == FRAME_MAGIC)
}

/// Streaming accumulator the read pipeline feeds file chunks through.
///
/// Chunks may split a frame (or the magic itself) at any byte; the
/// decoder buffers the unconsumed remainder across calls. Resyncs are
/// counted, not surfaced: a crashed writer's partial tail is expected.
pub struct FrameDecoder {
    buf: Vec<u8>,
    resyncs: u64,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            resyncs: 0,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Decodes the next frame out of the buffered bytes, copying its
    /// payload into `payload` and returning `(sequence_id, timestamp)`.
    /// Returns `None` when more bytes are needed.
    pub fn try_next(&mut self, payload: &mut Vec<u8>) -> Option<(u64, i64)> {
        loop {
            match try_decode(&self.buf) {
                FrameOutcome::Frame {
                    sequence_id,
                    timestamp,
                    payload: body,
                    consumed,
                } => {
                    payload.clear();
                    payload.extend_from_slice(body);
                    self.buf.drain(..consumed);
                    return Some((sequence_id, timestamp));
                }
                FrameOutcome::NeedMore { discard } => {
                    if discard > 0 {
                        self.buf.drain(..discard);
                    }
                    return None;
                }
                FrameOutcome::Resync { discard } => {
                    self.resyncs += 1;
                    log::debug!("frame resync: skipping {discard} bytes");
                    self.buf.drain(..discard);
                }
            }
        }
    }

    /// Drops buffered partial data (cancellation, segment switch).
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }
}
