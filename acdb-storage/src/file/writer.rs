//! Database file writer implementation

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use bytes::{BufMut, BytesMut};
use byteorder::{LittleEndian, WriteBytesExt};
use tracing::info;

use acdb_core::error::{Error, Result};
use acdb_core::utils::word_align;

use super::types::{ChunkId, DATABASE_MAGIC, DATABASE_VERSION, DIRECTORY_ENTRY_SIZE, HEADER_FIXED_SIZE};

/// Append-only little-endian word buffer used to lay out one chunk
#[derive(Debug, Default)]
pub struct WordBuffer {
    buffer: BytesMut,
}

impl WordBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current write position, which is the chunk-relative offset of the next word
    pub fn offset(&self) -> u32 {
        self.buffer.len() as u32
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn push(&mut self, word: u32) {
        self.buffer.put_u32_le(word);
    }

    pub fn push_all(&mut self, words: &[u32]) {
        for &word in words {
            self.buffer.put_u32_le(word);
        }
    }

    /// Raw bytes followed by zero padding up to the next word boundary
    pub fn push_bytes_padded(&mut self, bytes: &[u8]) {
        self.buffer.put_slice(bytes);
        let padding = word_align(bytes.len()) - bytes.len();
        self.buffer.put_bytes(0, padding);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer.to_vec()
    }
}

/// Assembles chunks into a complete database image
#[derive(Debug, Default)]
pub struct FileWriter {
    chunks: Vec<(ChunkId, Vec<u8>)>,
}

impl FileWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_chunk(&mut self, id: ChunkId, data: Vec<u8>) -> Result<()> {
        if self.chunks.iter().any(|(existing, _)| *existing == id) {
            return Err(Error::bad_param(format!("chunk {} added twice", id)));
        }
        if data.len() % 4 != 0 {
            return Err(Error::bad_param(format!("chunk {} is not a whole number of words", id)));
        }
        self.chunks.push((id, data));
        Ok(())
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Serialize header, directory, directory checksum and chunk bodies
    pub fn finish(self) -> Result<Vec<u8>> {
        let directory_size = self.chunks.len() * DIRECTORY_ENTRY_SIZE;
        let body_start = HEADER_FIXED_SIZE + directory_size + 4;
        let total = body_start + self.chunks.iter().map(|(_, data)| data.len()).sum::<usize>();
        if total > u32::MAX as usize {
            return Err(Error::bad_param("database image exceeds 4 GiB"));
        }

        let mut directory = Vec::with_capacity(directory_size);
        let mut offset = body_start as u32;
        for (id, data) in &self.chunks {
            directory.extend_from_slice(&id.as_bytes());
            directory.write_u32::<LittleEndian>(offset)?;
            directory.write_u32::<LittleEndian>(data.len() as u32)?;
            offset += data.len() as u32;
        }

        let mut image = Vec::with_capacity(total);
        image.extend_from_slice(DATABASE_MAGIC);
        image.write_u32::<LittleEndian>(DATABASE_VERSION)?;
        image.write_u32::<LittleEndian>(self.chunks.len() as u32)?;
        image.extend_from_slice(&directory);
        image.write_u32::<LittleEndian>(crc32fast::hash(&directory))?;
        for (_, data) in &self.chunks {
            image.extend_from_slice(data);
        }

        Ok(image)
    }

    /// Write the image to `path` via a temporary file and rename
    pub fn write_to(self, path: impl AsRef<Path>) -> Result<u64> {
        let path = path.as_ref();
        let chunk_count = self.chunks.len();
        let image = self.finish()?;

        let tmp_path = path.with_extension("tmp");
        {
            let file: File = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(&image)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, path)?;

        info!(
            "Finished writing database {}: {} chunks, {} bytes",
            path.display(),
            chunk_count,
            image.len()
        );
        Ok(image.len() as u64)
    }
}
