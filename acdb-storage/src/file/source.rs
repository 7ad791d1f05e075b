//! File access interface used by the search and lookup layers

use byteorder::{ByteOrder, LittleEndian};

use acdb_core::error::{Error, Result};

use super::types::{ChunkId, ChunkInfo};

/// Read-only access to one database file
///
/// The search layers never touch the file directly: they resolve chunks,
/// borrow zero-copy views, or copy ranges into caller-owned scratch buffers.
pub trait FileSource: Send + Sync {
    /// Total file length in bytes
    fn len(&self) -> u64;

    /// Resolve a chunk id to its absolute byte range
    fn chunk_info(&self, id: ChunkId) -> Result<ChunkInfo>;

    /// Zero-copy view of `len` bytes at `offset`
    fn file_view(&self, offset: u64, len: u64) -> Result<&[u8]>;

    /// Copy `dst.len()` bytes starting at `offset`, then advance `offset`
    fn read_buffer(&self, dst: &mut [u8], offset: &mut u64) -> Result<()> {
        let view = self.file_view(*offset, dst.len() as u64)?;
        dst.copy_from_slice(view);
        *offset += dst.len() as u64;
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn has_chunk(&self, id: ChunkId) -> bool {
        self.chunk_info(id).is_ok()
    }

    /// Whole chunk as a view
    fn chunk_view(&self, id: ChunkId) -> Result<&[u8]> {
        let info = self.chunk_info(id)?;
        self.file_view(info.offset, info.size)
    }

    fn read_u32(&self, offset: u64) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.file_view(offset, 4)?))
    }

    fn read_words(&self, offset: u64, count: usize) -> Result<Vec<u32>> {
        let view = self.file_view(offset, count as u64 * 4)?;
        let mut words = vec![0u32; count];
        LittleEndian::read_u32_into(view, &mut words);
        Ok(words)
    }
}

/// Bounds-checked slice of a byte buffer
pub(crate) fn view_of(data: &[u8], offset: u64, len: u64) -> Result<&[u8]> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| Error::bad_param("file range overflows"))?;
    if end > data.len() as u64 {
        return Err(Error::corrupt(format!(
            "range {:#x}..{:#x} past end of file ({} bytes)",
            offset,
            end,
            data.len()
        )));
    }
    Ok(&data[offset as usize..end as usize])
}
