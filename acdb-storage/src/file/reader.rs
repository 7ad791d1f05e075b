//! Database file reader implementation

use std::fs::File;
use std::io::{Cursor, Read};
use std::ops::Deref;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};
use memmap2::{Mmap, MmapOptions};
use tracing::{debug, info};

use acdb_core::error::{Error, Result};

use super::source::{view_of, FileSource};
use super::types::{
    ChunkId, ChunkInfo, DatabaseProperties, DATABASE_MAGIC, DATABASE_VERSION,
    DIRECTORY_ENTRY_SIZE, HEADER_FIXED_SIZE,
};

/// Backing bytes of an open database
enum Backing {
    Mapped(Mmap),
    Memory(Vec<u8>),
}

impl Deref for Backing {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Backing::Mapped(mmap) => mmap,
            Backing::Memory(bytes) => bytes,
        }
    }
}

/// Chunk id → byte range directory parsed from the file header
#[derive(Debug, Clone, Default)]
pub struct ChunkDirectory {
    entries: Vec<ChunkInfo>,
}

impl ChunkDirectory {
    /// Parse and validate the header of `data`
    pub fn parse(data: &[u8], verify_checksum: bool) -> Result<Self> {
        if data.len() < HEADER_FIXED_SIZE + 4 {
            return Err(Error::corrupt("database file too small"));
        }

        let mut cursor = Cursor::new(data);
        let mut magic = [0u8; 4];
        cursor.read_exact(&mut magic)?;
        if &magic != DATABASE_MAGIC {
            return Err(Error::corrupt("invalid database magic number"));
        }

        let version = cursor.read_u32::<LittleEndian>()?;
        if version != DATABASE_VERSION {
            return Err(Error::corrupt(format!("unsupported database version: {}", version)));
        }

        let chunk_count = cursor.read_u32::<LittleEndian>()? as usize;
        let directory_end = HEADER_FIXED_SIZE + chunk_count * DIRECTORY_ENTRY_SIZE;
        if directory_end + 4 > data.len() {
            return Err(Error::corrupt(format!(
                "chunk directory of {} entries exceeds file size",
                chunk_count
            )));
        }

        let mut entries = Vec::with_capacity(chunk_count);
        for _ in 0..chunk_count {
            let mut id = [0u8; 4];
            cursor.read_exact(&mut id)?;
            let offset = cursor.read_u32::<LittleEndian>()? as u64;
            let size = cursor.read_u32::<LittleEndian>()? as u64;
            let info = ChunkInfo {
                id: ChunkId(id),
                offset,
                size,
            };

            if info.end() > data.len() as u64 {
                return Err(Error::corrupt(format!(
                    "chunk {} ends at {:#x}, past end of file",
                    info.id,
                    info.end()
                )));
            }
            if offset % 4 != 0 {
                return Err(Error::corrupt(format!("chunk {} is not word aligned", info.id)));
            }
            if entries.iter().any(|e: &ChunkInfo| e.id == info.id) {
                return Err(Error::corrupt(format!("duplicate chunk {}", info.id)));
            }
            entries.push(info);
        }

        let stored_crc = cursor.read_u32::<LittleEndian>()?;
        if verify_checksum {
            let computed = crc32fast::hash(&data[HEADER_FIXED_SIZE..directory_end]);
            if computed != stored_crc {
                return Err(Error::corrupt(format!(
                    "chunk directory checksum mismatch: stored {:#010x}, computed {:#010x}",
                    stored_crc, computed
                )));
            }
        }

        Ok(Self { entries })
    }

    pub fn get(&self, id: ChunkId) -> Option<ChunkInfo> {
        self.entries.iter().find(|e| e.id == id).copied()
    }

    pub fn entries(&self) -> &[ChunkInfo] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Open, read-only database file
pub struct DatabaseFile {
    path: Option<PathBuf>,
    data: Backing,
    directory: ChunkDirectory,
}

impl DatabaseFile {
    /// Memory-map a database file
    pub fn open(path: impl AsRef<Path>, verify_checksum: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;

        let mmap = unsafe {
            MmapOptions::new().map(&file).map_err(|e| Error::Io {
                message: format!("Failed to mmap database {}", path.display()),
                source: e,
            })?
        };

        let directory = ChunkDirectory::parse(&mmap, verify_checksum)?;
        info!(
            "Opened database {}: {} bytes, {} chunks",
            path.display(),
            mmap.len(),
            directory.len()
        );

        Ok(Self {
            path: Some(path),
            data: Backing::Mapped(mmap),
            directory,
        })
    }

    /// Wrap an in-memory database image
    pub fn from_bytes(bytes: Vec<u8>, verify_checksum: bool) -> Result<Self> {
        let directory = ChunkDirectory::parse(&bytes, verify_checksum)?;
        debug!("Loaded in-memory database: {} bytes, {} chunks", bytes.len(), directory.len());
        Ok(Self {
            path: None,
            data: Backing::Memory(bytes),
            directory,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn directory(&self) -> &ChunkDirectory {
        &self.directory
    }

    /// Read the `PROP` chunk and the optional `SHSG` chunk
    pub fn properties(&self) -> Result<DatabaseProperties> {
        let prop = self.chunk_info(ChunkId::PROPERTIES)?;
        if prop.size < 16 {
            return Err(Error::corrupt("properties chunk too small"));
        }
        let words = self.read_words(prop.offset, 4)?;

        let shared_subgraphs = match self.directory.get(ChunkId::SHARED_SUBGRAPHS) {
            Some(info) if !info.is_empty() => {
                let count = self.read_u32(info.offset)? as usize;
                info.absolute(4, count as u64 * 4)?;
                let mut ids = self.read_words(info.offset + 4, count)?;
                ids.sort_unstable();
                ids
            }
            _ => Vec::new(),
        };

        Ok(DatabaseProperties {
            database_id: words[0],
            vm_id: words[1],
            subgraph_id_min: words[2],
            subgraph_id_max: words[3],
            shared_subgraphs,
        })
    }
}

impl FileSource for DatabaseFile {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn chunk_info(&self, id: ChunkId) -> Result<ChunkInfo> {
        self.directory
            .get(id)
            .ok_or_else(|| Error::not_exist(format!("chunk {}", id)))
    }

    fn file_view(&self, offset: u64, len: u64) -> Result<&[u8]> {
        view_of(&self.data, offset, len)
    }
}

impl std::fmt::Debug for DatabaseFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseFile")
            .field("path", &self.path)
            .field("len", &self.data.len())
            .field("chunks", &self.directory.len())
            .finish()
    }
}
