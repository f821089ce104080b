//! Segment file layout, naming and discovery.
//!
//! A segment is one `.wal` file: a 128-byte header followed by record
//! frames. Files are named `YYYYMMDDhhmmss-<uuidv7hex>.wal`; the prefix
//! is the creation time truncated to the second and the UUIDv7 suffix is
//! derived from the same instant, so lexicographic order equals
//! chronological order.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use uuid::Uuid;

use crate::frame::crc32;
use crate::{Error, Result};

pub const SEGMENT_MAGIC: [u8; 4] = *b"WAL!";
pub const SEGMENT_VERSION: u32 = 1;
pub const SEGMENT_HEADER_LEN: usize = 128;
pub const SEGMENT_EXT: &str = "wal";

const CRC_OFFSET: usize = 124;
const STAMP_LEN: usize = 14;
const UUID_HEX_LEN: usize = 32;

const STAMP_FORMAT: &[FormatItem<'static>] =
    format_description!("[year][month][day][hour][minute][second]");

/// In-memory image of the 128-byte segment header.
///
/// `first_sequence_id` stays 0 and the timestamps stay −1 until the
/// first append, which is how a just-rolled empty segment is told apart
/// from one whose records start at the beginning of the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub first_sequence_id: u64,
    pub last_sequence_id: u64,
    pub first_timestamp: i64,
    pub last_timestamp: i64,
    pub message_count: u64,
    pub size_bytes: u64,
    pub read_only: bool,
}

impl Default for SegmentHeader {
    fn default() -> Self {
        Self {
            first_sequence_id: 0,
            last_sequence_id: 0,
            first_timestamp: -1,
            last_timestamp: -1,
            message_count: 0,
            size_bytes: 0,
            read_only: false,
        }
    }
}

impl SegmentHeader {
    pub fn is_empty(&self) -> bool {
        self.message_count == 0
    }

    pub fn encode(&self) -> [u8; SEGMENT_HEADER_LEN] {
        let mut buf = [0u8; SEGMENT_HEADER_LEN];
        buf[0..4].copy_from_slice(&SEGMENT_MAGIC);
        buf[4..8].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.first_sequence_id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.last_sequence_id.to_le_bytes());
        buf[24..32].copy_from_slice(&self.first_timestamp.to_le_bytes());
        buf[32..40].copy_from_slice(&self.last_timestamp.to_le_bytes());
        buf[40..48].copy_from_slice(&self.message_count.to_le_bytes());
        buf[48..56].copy_from_slice(&self.size_bytes.to_le_bytes());
        buf[56] = u8::from(self.read_only);
        let crc = crc32(&buf[..CRC_OFFSET]);
        buf[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SEGMENT_HEADER_LEN {
            return Err(Error::InvalidHeader("truncated header"));
        }
        if buf[0..4] != SEGMENT_MAGIC {
            return Err(Error::InvalidHeader("magic mismatch"));
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().expect("slice length"));
        if version != SEGMENT_VERSION {
            return Err(Error::InvalidHeader("unsupported version"));
        }
        let stored = u32::from_le_bytes(
            buf[CRC_OFFSET..SEGMENT_HEADER_LEN]
                .try_into()
                .expect("slice length"),
        );
        if crc32(&buf[..CRC_OFFSET]) != stored {
            return Err(Error::InvalidHeader("crc mismatch"));
        }

        Ok(Self {
            first_sequence_id: u64::from_le_bytes(buf[8..16].try_into().expect("slice length")),
            last_sequence_id: u64::from_le_bytes(buf[16..24].try_into().expect("slice length")),
            first_timestamp: i64::from_le_bytes(buf[24..32].try_into().expect("slice length")),
            last_timestamp: i64::from_le_bytes(buf[32..40].try_into().expect("slice length")),
            message_count: u64::from_le_bytes(buf[40..48].try_into().expect("slice length")),
            size_bytes: u64::from_le_bytes(buf[48..56].try_into().expect("slice length")),
            read_only: buf[56] != 0,
        })
    }
}

/// Reads and validates the header of a segment file on disk.
pub fn read_header(path: &Path) -> Result<SegmentHeader> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)?;
    let mut buf = [0u8; SEGMENT_HEADER_LEN];
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => return Err(Error::InvalidHeader("truncated header")),
            n => filled += n,
        }
    }
    SegmentHeader::decode(&buf)
}

/// Builds a segment filename for a creation instant (ns since epoch).
///
/// The UUIDv7 suffix is generated from the same instant as the stamp so
/// two segments created within the same second still sort in creation
/// order.
pub fn segment_filename(created_ns: i64) -> Result<String> {
    let seconds = created_ns.div_euclid(1_000_000_000);
    let subsec = created_ns.rem_euclid(1_000_000_000) as u32;
    let stamp = OffsetDateTime::from_unix_timestamp(seconds)
        .map_err(|_| Error::Corrupt("segment creation time out of range"))?
        .format(STAMP_FORMAT)
        .map_err(|_| Error::Corrupt("segment creation time unformattable"))?;
    let id = Uuid::new_v7(uuid::Timestamp::from_unix(
        uuid_context(),
        seconds as u64,
        subsec,
    ));
    Ok(format!("{stamp}-{}.{SEGMENT_EXT}", id.simple()))
}

/// Shared v7 context: keeps suffixes monotonic even when two segments
/// are created within the same millisecond, so name order always equals
/// creation order.
/// `uuid::ContextV7` is `!Sync` (its internal counters use `Cell`), so a
/// shared static needs an explicit lock around it.
struct SyncContextV7(Mutex<uuid::ContextV7>);

impl uuid::ClockSequence for SyncContextV7 {
    type Output = u64;

    fn generate_sequence(&self, seconds: u64, subsec_nanos: u32) -> Self::Output {
        self.0.lock().unwrap().generate_sequence(seconds, subsec_nanos)
    }

    fn generate_timestamp_sequence(&self, seconds: u64, subsec_nanos: u32) -> (Self::Output, u64, u32) {
        self.0.lock().unwrap().generate_timestamp_sequence(seconds, subsec_nanos)
    }
}

fn uuid_context() -> &'static SyncContextV7 {
    static CONTEXT: OnceLock<SyncContextV7> = OnceLock::new();
    CONTEXT.get_or_init(|| SyncContextV7(Mutex::new(uuid::ContextV7::new())))
}

/// Parses a segment filename back into its creation time (unix seconds).
/// Returns `None` for anything that is not a well-formed segment name.
pub fn parse_segment_filename(name: &str) -> Option<i64> {
    let stem = name.strip_suffix(".wal")?;
    if stem.len() != STAMP_LEN + 1 + UUID_HEX_LEN {
        return None;
    }
    let (stamp, rest) = stem.split_at(STAMP_LEN);
    let uuid_hex = rest.strip_prefix('-')?;
    if !stamp.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !uuid_hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let parsed = PrimitiveDateTime::parse(stamp, STAMP_FORMAT).ok()?;
    Some(parsed.assume_utc().unix_timestamp())
}

/// One `.wal` file found on disk.
#[derive(Debug, Clone)]
pub struct DiscoveredSegment {
    pub path: PathBuf,
    /// Creation time parsed from the filename, unix seconds.
    pub created_at: i64,
}

/// Enumerates segment files in `dir`, oldest first.
///
/// Non-segment files are ignored. Sorting is by filename, which the
/// naming scheme guarantees to be chronological.
pub fn discover_segments(dir: &Path) -> Result<Vec<DiscoveredSegment>> {
    let mut found: Vec<(String, DiscoveredSegment)> = Vec::new();

    if !dir.exists() {
        return Ok(Vec::new());
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(name) => name,
            None => continue,
        };
        if let Some(created_at) = parse_segment_filename(name) {
            found.push((
                name.to_owned(),
                DiscoveredSegment {
                    path: entry.path(),
                    created_at,
                },
            ));
        }
    }

    found.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(found.into_iter().map(|(_, seg)| seg).collect())
}
