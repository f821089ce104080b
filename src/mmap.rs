use std::fs::File;

use memmap2::{MmapMut, MmapOptions};

use crate::{Error, Result};

/// A writable mapping over the first `len` bytes of a file.
///
/// Used for the 128-byte segment header and the 10-byte checkpoint
/// file: small fixed regions that are rewritten in place and flushed
/// independently of the file's append tail.
#[derive(Debug)]
pub struct MmapView {
    map: MmapMut,
    len: usize,
}

impl MmapView {
    /// Maps the first `len` bytes of `file`. The file must already be
    /// at least `len` bytes long.
    pub fn map_prefix(file: &File, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Corrupt("mmap length must be non-zero"));
        }
        if (file.metadata()?.len() as usize) < len {
            return Err(Error::Corrupt("file shorter than mapped prefix"));
        }
        let map = unsafe { MmapOptions::new().len(len).map_mut(file)? };
        Ok(Self { map, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn range_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let end = offset
            .checked_add(len)
            .ok_or(Error::Corrupt("range overflow"))?;
        if end > self.len {
            return Err(Error::Corrupt("range out of bounds"));
        }
        Ok(&mut self.map[offset..end])
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Synchronous flush of the mapped range to the OS.
    pub fn flush(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }

    /// Schedules a flush without waiting for completion.
    pub fn flush_async(&self) -> Result<()> {
        self.map.flush_async()?;
        Ok(())
    }
}
