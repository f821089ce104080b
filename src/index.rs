//! Sparse per-segment seek index.
//!
//! Every Nth record of a segment contributes one `(sequence, timestamp,
//! body offset)` entry. Seeking returns the offset of an entry at or
//! before the target so the subsequent record scan lands on the target
//! or the first record after it. The index is an optimization only: a
//! segment can always be rescanned from offset 0, and a lost index is
//! rebuilt by exactly that scan.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::frame::{try_decode, FrameOutcome, FRAME_OVERHEAD};
use crate::segment::SEGMENT_HEADER_LEN;
use crate::Result;

const SCAN_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseEntry {
    pub sequence_id: u64,
    pub timestamp: i64,
    /// Byte offset of the frame start, relative to the segment body
    /// (first byte after the 128-byte header).
    pub offset: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SparseIndex {
    entries: Vec<SparseEntry>,
}

impl SparseIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry. Entries arrive in append order, so the list
    /// stays sorted by sequence and by timestamp.
    pub fn push(&mut self, sequence_id: u64, timestamp: i64, offset: u64) {
        self.entries.push(SparseEntry {
            sequence_id,
            timestamp,
            offset,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[SparseEntry] {
        &self.entries
    }

    /// Body offset to start scanning from for `target` sequence.
    ///
    /// Exact hit seeks to the entry itself; otherwise the previous
    /// entry's offset is used so the scan under-shoots, never
    /// over-shoots. No entry at or past the target seeks to the last
    /// entry; an empty index seeks to 0.
    pub fn seek_sequence(&self, target: u64) -> u64 {
        self.seek_by(|entry| entry.sequence_id >= target, |entry| {
            entry.sequence_id == target
        })
    }

    /// Body offset to start scanning from for `target` timestamp.
    pub fn seek_timestamp(&self, target: i64) -> u64 {
        self.seek_by(|entry| entry.timestamp >= target, |entry| {
            entry.timestamp == target
        })
    }

    fn seek_by(
        &self,
        at_or_past: impl Fn(&SparseEntry) -> bool,
        exact: impl Fn(&SparseEntry) -> bool,
    ) -> u64 {
        if self.entries.is_empty() {
            return 0;
        }
        let idx = self.entries.partition_point(|entry| !at_or_past(entry));
        if idx == self.entries.len() {
            return self.entries[idx - 1].offset;
        }
        if exact(&self.entries[idx]) {
            return self.entries[idx].offset;
        }
        if idx == 0 {
            0
        } else {
            self.entries[idx - 1].offset
        }
    }
}

/// Rebuilds a segment's sparse index by scanning its frames.
///
/// Used at init for the active segment's mutable index and for every
/// sealed segment's frozen index. `interval == 0` disables sampling and
/// yields an empty index. Corrupt tail bytes are skipped the same way
/// the read pipeline skips them, so offsets stay byte-exact.
pub fn rebuild_index(path: &Path, interval: u64) -> Result<SparseIndex> {
    let mut index = SparseIndex::new();
    if interval == 0 {
        return Ok(index);
    }

    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(SEGMENT_HEADER_LEN as u64))?;

    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; SCAN_CHUNK];
    // Body offset of buf[0].
    let mut base: u64 = 0;
    let mut ordinal: u64 = 0;
    let mut eof = false;

    loop {
        match try_decode(&buf) {
            FrameOutcome::Frame {
                sequence_id,
                timestamp,
                payload,
                consumed,
            } => {
                let frame_len = FRAME_OVERHEAD + payload.len();
                let frame_start = base + (consumed - frame_len) as u64;
                if ordinal % interval == 0 {
                    index.push(sequence_id, timestamp, frame_start);
                }
                ordinal += 1;
                base += consumed as u64;
                buf.drain(..consumed);
            }
            FrameOutcome::NeedMore { discard } => {
                base += discard as u64;
                buf.drain(..discard);
                if eof {
                    break;
                }
                let read = file.read(&mut chunk)?;
                if read == 0 {
                    eof = true;
                } else {
                    buf.extend_from_slice(&chunk[..read]);
                }
            }
            FrameOutcome::Resync { discard } => {
                base += discard as u64;
                buf.drain(..discard);
            }
        }
    }

    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_record;

    fn index_of(entries: &[(u64, i64, u64)]) -> SparseIndex {
        let mut index = SparseIndex::new();
        for &(seq, ts, offset) in entries {
            index.push(seq, ts, offset);
        }
        index
    }

    #[test]
    fn empty_index_seeks_to_zero() {
        let index = SparseIndex::new();
        assert_eq!(index.seek_sequence(500), 0);
        assert_eq!(index.seek_timestamp(500), 0);
    }

    #[test]
    fn exact_hit_seeks_to_entry() {
        let index = index_of(&[(100, 10, 0), (200, 20, 4_000), (300, 30, 8_000)]);
        assert_eq!(index.seek_sequence(200), 4_000);
        assert_eq!(index.seek_timestamp(30), 8_000);
    }

    #[test]
    fn between_entries_seeks_to_previous() {
        let index = index_of(&[(100, 10, 0), (200, 20, 4_000), (300, 30, 8_000)]);
        assert_eq!(index.seek_sequence(250), 4_000);
        assert_eq!(index.seek_timestamp(15), 0);
    }

    #[test]
    fn past_last_entry_seeks_to_last() {
        let index = index_of(&[(100, 10, 0), (200, 20, 4_000)]);
        assert_eq!(index.seek_sequence(9_999), 4_000);
        assert_eq!(index.seek_timestamp(9_999), 4_000);
    }

    #[test]
    fn before_first_entry_seeks_to_zero() {
        let index = index_of(&[(100, 10, 2_000), (200, 20, 4_000)]);
        assert_eq!(index.seek_sequence(50), 0);
        assert_eq!(index.seek_timestamp(5), 0);
    }

    #[test]
    fn rebuild_matches_append_order_sampling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.wal");

        let mut body = Vec::new();
        let mut offsets = Vec::new();
        for i in 0..10u64 {
            offsets.push(body.len() as u64);
            encode_record(&mut body, i + 1, (i as i64) * 100, &[i as u8; 32]).unwrap();
        }
        let mut file = vec![0u8; SEGMENT_HEADER_LEN];
        file.extend_from_slice(&body);
        std::fs::write(&path, &file).unwrap();

        let index = rebuild_index(&path, 4).unwrap();
        // Records 1, 5, 9 (ordinals 0, 4, 8).
        let seqs: Vec<u64> = index.entries().iter().map(|e| e.sequence_id).collect();
        assert_eq!(seqs, vec![1, 5, 9]);
        assert_eq!(index.entries()[0].offset, offsets[0]);
        assert_eq!(index.entries()[1].offset, offsets[4]);
        assert_eq!(index.entries()[2].offset, offsets[8]);
    }

    #[test]
    fn rebuild_skips_corrupt_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.wal");

        let mut body = Vec::new();
        encode_record(&mut body, 1, 100, b"intact").unwrap();
        let tail = body.len();
        encode_record(&mut body, 2, 200, b"damaged").unwrap();
        body[tail + 30] ^= 0xff;

        let mut file = vec![0u8; SEGMENT_HEADER_LEN];
        file.extend_from_slice(&body);
        std::fs::write(&path, &file).unwrap();

        let index = rebuild_index(&path, 1).unwrap();
        let seqs: Vec<u64> = index.entries().iter().map(|e| e.sequence_id).collect();
        assert_eq!(seqs, vec![1]);
    }

    #[test]
    fn rebuild_with_zero_interval_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.wal");
        std::fs::write(&path, vec![0u8; SEGMENT_HEADER_LEN]).unwrap();
        let index = rebuild_index(&path, 0).unwrap();
        assert!(index.is_empty());
    }
}
