//! Single-segment append path.
//!
//! A `SegmentWriter` owns one segment file opened read+write, a mapped
//! view over the 128-byte header, and a buffered tail positioned at
//! end-of-file. Appends frame the payload into the tail buffer and then
//! rewrite the header through the view; the header write is the commit
//! point, so a failed tail write leaves the segment's logical state
//! untouched and crash-recovery readers discard the partial frame bytes
//! by resync.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::frame::encode_record;
use crate::mmap::MmapView;
use crate::segment::{SegmentHeader, SEGMENT_HEADER_LEN};
use crate::{Error, Result};

#[derive(Debug)]
pub struct SegmentWriter {
    path: PathBuf,
    tail: Option<BufWriter<File>>,
    header_view: Option<MmapView>,
    header: SegmentHeader,
    header_dirty: bool,
    tail_dirty: bool,
    frame_buf: Vec<u8>,
}

impl SegmentWriter {
    /// Opens (or creates) a segment file for appending.
    ///
    /// A new or shorter-than-header file is extended to 128 bytes and
    /// given a fresh header. An existing header is decoded; a sealed
    /// segment fails with [`Error::SegmentSealed`] and is never
    /// reopened for writing. Bytes beyond `128 + size_bytes` are
    /// uncommitted tail from a crashed append and are truncated away.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;

        let len = file.metadata()?.len();
        let (header, header_dirty) = if len < SEGMENT_HEADER_LEN as u64 {
            file.set_len(SEGMENT_HEADER_LEN as u64)?;
            (SegmentHeader::default(), true)
        } else {
            let view = MmapView::map_prefix(&file, SEGMENT_HEADER_LEN)?;
            let header = SegmentHeader::decode(view.as_slice())?;
            if header.read_only {
                return Err(Error::SegmentSealed);
            }
            (header, false)
        };

        // The header is authoritative for how much of the tail is
        // committed; anything past it did not finish flushing.
        let committed_len = SEGMENT_HEADER_LEN as u64 + header.size_bytes;
        if file.metadata()?.len() != committed_len {
            file.set_len(committed_len)?;
        }

        let mut header_view = MmapView::map_prefix(&file, SEGMENT_HEADER_LEN)?;
        if header_dirty {
            header_view
                .range_mut(0, SEGMENT_HEADER_LEN)?
                .copy_from_slice(&header.encode());
        }

        let mut tail_file = file;
        tail_file.seek(SeekFrom::End(0))?;

        Ok(Self {
            path: path.to_path_buf(),
            tail: Some(BufWriter::new(tail_file)),
            header_view: Some(header_view),
            header,
            header_dirty,
            tail_dirty: false,
            frame_buf: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the in-memory header (may be ahead of disk until the
    /// next flush).
    pub fn header(&self) -> SegmentHeader {
        self.header
    }

    pub fn is_sealed(&self) -> bool {
        self.header.read_only
    }

    /// Appends one framed record, returning the frame length in bytes.
    ///
    /// Callers serialize appends and assign `sequence_id`/`timestamp`;
    /// this type only persists them.
    pub fn append(&mut self, sequence_id: u64, timestamp: i64, payload: &[u8]) -> Result<u64> {
        let tail = self.tail.as_mut().ok_or(Error::SegmentSealed)?;

        self.frame_buf.clear();
        let frame_len = encode_record(&mut self.frame_buf, sequence_id, timestamp, payload)?;
        tail.write_all(&self.frame_buf)?;
        self.tail_dirty = true;

        if self.header.is_empty() {
            self.header.first_sequence_id = sequence_id;
            self.header.first_timestamp = timestamp;
        }
        self.header.last_sequence_id = sequence_id;
        self.header.last_timestamp = timestamp;
        self.header.message_count += 1;
        self.header.size_bytes += frame_len as u64;
        self.write_header()?;

        Ok(frame_len as u64)
    }

    /// Flushes pending bytes to the OS: tail first, then the header
    /// view, so the header never claims frames the tail does not hold.
    /// Quiescent sides are skipped via their dirty flags.
    pub fn flush(&mut self) -> Result<()> {
        if self.tail_dirty {
            if let Some(tail) = self.tail.as_mut() {
                tail.flush()?;
            }
            self.tail_dirty = false;
        }
        if self.header_dirty {
            if let Some(view) = self.header_view.as_ref() {
                view.flush()?;
            }
            self.header_dirty = false;
        }
        Ok(())
    }

    /// Seals the segment: marks the header read-only, force-flushes,
    /// closes the handles and sets the filesystem read-only bit. A
    /// sealed segment cannot accept further appends and [`open`]
    /// refuses it.
    ///
    /// [`open`]: SegmentWriter::open
    pub fn seal(&mut self) -> Result<SegmentHeader> {
        if self.header.read_only {
            return Ok(self.header);
        }

        self.header.read_only = true;
        self.write_header()?;
        self.flush()?;

        // Drop the tail first so its BufWriter flushes before the file
        // handle goes away, then unmap the header view.
        self.tail = None;
        self.header_view = None;

        let mut permissions = std::fs::metadata(&self.path)?.permissions();
        permissions.set_readonly(true);
        std::fs::set_permissions(&self.path, permissions)?;

        Ok(self.header)
    }

    fn write_header(&mut self) -> Result<()> {
        let view = self
            .header_view
            .as_mut()
            .ok_or(Error::Corrupt("header view missing"))?;
        view.range_mut(0, SEGMENT_HEADER_LEN)?
            .copy_from_slice(&self.header.encode());
        self.header_dirty = true;
        Ok(())
    }
}
