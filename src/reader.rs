//! Per-segment read pipeline.
//!
//! A `SegmentReader` opens its own read-only handle on one segment file
//! (independent of the writer, so rollover and retention can progress
//! concurrently), seeks to a body offset supplied by the sparse index
//! and pulls fixed-size chunks through the frame decoder. At end of
//! file the owner decides whether to stop or tail: tailing polls the
//! file length and resumes when it grows, which is the only
//! change-detection mechanism needed — in-process rollovers are
//! signalled separately through the engine's reader registry.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::frame::FrameDecoder;
use crate::pool::{BufferPool, PooledBuf};
use crate::segment::SEGMENT_HEADER_LEN;
use crate::{Error, Result};

const READ_CHUNK: usize = 64 * 1024;

/// One record delivered to a reader.
///
/// The payload uniquely owns a buffer rented from the log's pool and
/// returns it when the record is dropped, so consumers should finish
/// with (or explicitly drop) each record before pulling the next.
#[derive(Debug)]
pub struct Record {
    pub sequence_id: u64,
    pub timestamp: i64,
    pub payload: PooledBuf,
}

/// What a tail wait observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailEvent {
    /// The file grew past the read position; resume decoding.
    Grew,
    /// The file carries the read-only bit: the segment was sealed and
    /// will never grow again.
    Sealed,
    /// The file was deleted (retention raced the reader to it).
    Vanished,
}

pub struct SegmentReader {
    path: PathBuf,
    file: File,
    decoder: FrameDecoder,
    chunk: Vec<u8>,
    /// Absolute file offset of the next byte to read.
    file_pos: u64,
    pool: Arc<BufferPool>,
}

impl SegmentReader {
    /// Opens `path` for sequential reading starting at `body_offset`
    /// bytes past the segment header.
    pub fn open(path: &Path, body_offset: u64, pool: Arc<BufferPool>) -> Result<Self> {
        let mut file = File::open(path)?;
        let start = SEGMENT_HEADER_LEN as u64 + body_offset;
        file.seek(SeekFrom::Start(start))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            decoder: FrameDecoder::new(),
            chunk: vec![0u8; READ_CHUNK],
            file_pos: start,
            pool,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decodes the next record from buffered and on-disk bytes.
    ///
    /// `Ok(None)` means end of the currently available data; a partial
    /// frame may remain buffered and will complete on a later call if
    /// the file grows.
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            let mut payload = self.pool.acquire();
            if let Some((sequence_id, timestamp)) = self.decoder.try_next(payload.as_mut_vec()) {
                return Ok(Some(Record {
                    sequence_id,
                    timestamp,
                    payload,
                }));
            }
            drop(payload);

            let read = self.file.read(&mut self.chunk)?;
            if read == 0 {
                return Ok(None);
            }
            self.file_pos += read as u64;
            self.decoder.extend(&self.chunk[..read]);
        }
    }

    /// Total frame resyncs observed while decoding this segment.
    pub fn resyncs(&self) -> u64 {
        self.decoder.resyncs()
    }

    /// Waits for the file to grow, get sealed, or vanish.
    ///
    /// Checks current state first so growth that happened while the
    /// caller was decoding is seen without sleeping. Cancellation is
    /// observed at every poll.
    pub async fn wait_for_tail(
        &mut self,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<TailEvent> {
        loop {
            match std::fs::metadata(&self.path) {
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(TailEvent::Vanished)
                }
                Err(err) => return Err(err.into()),
                Ok(meta) => {
                    if meta.len() > self.file_pos {
                        return Ok(TailEvent::Grew);
                    }
                    if meta.permissions().readonly() {
                        return Ok(TailEvent::Sealed);
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_record;
    use std::io::Write;

    fn write_segment(path: &Path, records: &[(u64, i64, &[u8])]) -> Vec<u64> {
        let mut body = Vec::new();
        let mut offsets = Vec::new();
        for &(seq, ts, payload) in records {
            offsets.push(body.len() as u64);
            encode_record(&mut body, seq, ts, payload).unwrap();
        }
        let mut file = vec![0u8; SEGMENT_HEADER_LEN];
        file.extend_from_slice(&body);
        std::fs::write(path, &file).unwrap();
        offsets
    }

    #[test]
    fn reads_all_records_from_body_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.wal");
        write_segment(
            &path,
            &[(1, 10, b"alpha"), (2, 20, b"bravo"), (3, 30, b"charlie")],
        );

        let pool = BufferPool::new(4);
        let mut reader = SegmentReader::open(&path, 0, pool).unwrap();
        let mut seen = Vec::new();
        while let Some(record) = reader.next_record().unwrap() {
            seen.push((record.sequence_id, record.timestamp, record.payload.to_vec()));
        }
        assert_eq!(
            seen,
            vec![
                (1, 10, b"alpha".to_vec()),
                (2, 20, b"bravo".to_vec()),
                (3, 30, b"charlie".to_vec()),
            ]
        );
    }

    #[test]
    fn body_offset_skips_earlier_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.wal");
        let offsets = write_segment(&path, &[(1, 10, b"first"), (2, 20, b"second")]);

        let pool = BufferPool::new(4);
        let mut reader = SegmentReader::open(&path, offsets[1], pool).unwrap();
        let record = reader.next_record().unwrap().unwrap();
        assert_eq!(record.sequence_id, 2);
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn partial_tail_completes_after_growth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.wal");
        write_segment(&path, &[(1, 10, b"whole")]);

        let mut frame = Vec::new();
        encode_record(&mut frame, 2, 20, b"split-frame").unwrap();
        let cut = frame.len() / 2;

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&frame[..cut]).unwrap();
        file.flush().unwrap();

        let pool = BufferPool::new(4);
        let mut reader = SegmentReader::open(&path, 0, pool).unwrap();
        assert_eq!(reader.next_record().unwrap().unwrap().sequence_id, 1);
        // Half a frame on disk: not decodable yet.
        assert!(reader.next_record().unwrap().is_none());

        file.write_all(&frame[cut..]).unwrap();
        file.flush().unwrap();
        let record = reader.next_record().unwrap().unwrap();
        assert_eq!(record.sequence_id, 2);
        assert_eq!(&*record.payload, b"split-frame");
    }

    #[tokio::test]
    async fn wait_for_tail_sees_growth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.wal");
        write_segment(&path, &[(1, 10, b"seed")]);

        let pool = BufferPool::new(4);
        let mut reader = SegmentReader::open(&path, 0, pool).unwrap();
        while reader.next_record().unwrap().is_some() {}

        let mut frame = Vec::new();
        encode_record(&mut frame, 2, 20, b"growth").unwrap();
        let path_clone = path.clone();
        let appender = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&path_clone)
                .unwrap();
            file.write_all(&frame).unwrap();
        });

        let cancel = CancellationToken::new();
        let event = reader
            .wait_for_tail(Duration::from_millis(5), &cancel)
            .await
            .unwrap();
        assert_eq!(event, TailEvent::Grew);
        appender.await.unwrap();
        assert_eq!(reader.next_record().unwrap().unwrap().sequence_id, 2);
    }

    #[tokio::test]
    async fn wait_for_tail_stops_on_sealed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.wal");
        write_segment(&path, &[(1, 10, b"only")]);

        let mut permissions = std::fs::metadata(&path).unwrap().permissions();
        permissions.set_readonly(true);
        std::fs::set_permissions(&path, permissions).unwrap();

        let pool = BufferPool::new(4);
        let mut reader = SegmentReader::open(&path, 0, pool).unwrap();
        while reader.next_record().unwrap().is_some() {}

        let cancel = CancellationToken::new();
        let event = reader
            .wait_for_tail(Duration::from_millis(5), &cancel)
            .await
            .unwrap();
        assert_eq!(event, TailEvent::Sealed);
    }

    #[tokio::test]
    async fn wait_for_tail_observes_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.wal");
        write_segment(&path, &[]);

        let pool = BufferPool::new(4);
        let mut reader = SegmentReader::open(&path, 0, pool).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        match reader
            .wait_for_tail(Duration::from_millis(5), &cancel)
            .await
        {
            Err(Error::Cancelled) => {}
            other => panic!("expected cancellation, got {other:?}"),
        }
    }
}
