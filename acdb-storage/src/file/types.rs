//! Database file types and constants

use std::fmt;

use acdb_core::error::{Error, Result};
use acdb_core::utils::fourcc;

pub const DATABASE_MAGIC: &[u8; 4] = b"ACDB";
pub const DATABASE_VERSION: u32 = acdb_core::FORMAT_VERSION;
/// magic + version + chunk count
pub const HEADER_FIXED_SIZE: usize = 12;
/// id + offset + size
pub const DIRECTORY_ENTRY_SIZE: usize = 12;
/// Marks an absent DOT2 table in calibration lookup entries
pub const NO_OFFSET: u32 = u32::MAX;

/// 4-byte chunk identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(pub [u8; 4]);

impl ChunkId {
    /// Database properties: database id, vm id, subgraph id range
    pub const PROPERTIES: ChunkId = ChunkId(*b"PROP");
    /// Imported shared subgraph ids
    pub const SHARED_SUBGRAPHS: ChunkId = ChunkId(*b"SHSG");
    pub const GKV_KEY_TABLE: ChunkId = ChunkId(*b"GKVK");
    pub const GKV_LUT: ChunkId = ChunkId(*b"GKVL");
    pub const SUBGRAPH_LISTS: ChunkId = ChunkId(*b"SGLS");
    /// Subgraph → module instance membership
    pub const SUBGRAPH_MODULES: ChunkId = ChunkId(*b"SGMI");
    pub const SUBGRAPH_CAL_INDEX: ChunkId = ChunkId(*b"SGCI");
    pub const SUBGRAPH_CAL_HEADERS: ChunkId = ChunkId(*b"SGCH");
    pub const CKV_KEY_TABLES: ChunkId = ChunkId(*b"CKVK");
    pub const CKV_LUTS: ChunkId = ChunkId(*b"CKVL");
    pub const TAG_INDEX: ChunkId = ChunkId(*b"TAGI");
    pub const TKV_KEY_TABLES: ChunkId = ChunkId(*b"TKVK");
    pub const TKV_LUTS: ChunkId = ChunkId(*b"TKVL");
    pub const DEF_TABLES: ChunkId = ChunkId(*b"DEFT");
    pub const DOT_TABLES: ChunkId = ChunkId(*b"DOTT");
    pub const DATA_POOL: ChunkId = ChunkId(*b"DPOL");
    /// Legacy driver module table
    pub const DRIVER_MODULES: ChunkId = ChunkId(*b"DRVM");

    pub fn as_bytes(&self) -> [u8; 4] {
        self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&fourcc(self.0))
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({})", self)
    }
}

/// Absolute byte range of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    pub id: ChunkId,
    pub offset: u64,
    pub size: u64,
}

impl ChunkInfo {
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Translate a chunk-relative range into an absolute offset
    ///
    /// Fails with `Corrupt` when the range leaves the chunk: offsets stored
    /// inside the file are only trusted after this check.
    pub fn absolute(&self, relative: u64, len: u64) -> Result<u64> {
        let end = relative.checked_add(len).ok_or_else(|| {
            Error::corrupt(format!("offset overflow in chunk {}", self.id))
        })?;
        if end > self.size {
            return Err(Error::corrupt(format!(
                "range {:#x}+{} exceeds chunk {} of {} bytes",
                relative, len, self.id, self.size
            )));
        }
        Ok(self.offset + relative)
    }
}

/// Database properties stored in the `PROP` chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseProperties {
    pub database_id: u32,
    pub vm_id: u32,
    pub subgraph_id_min: u32,
    pub subgraph_id_max: u32,
    /// Sorted ids of subgraphs imported from other databases
    pub shared_subgraphs: Vec<u32>,
}

impl DatabaseProperties {
    /// True when the subgraph is in this database's id range or imported
    pub fn owns_subgraph(&self, subgraph_id: u32) -> bool {
        (self.subgraph_id_min..=self.subgraph_id_max).contains(&subgraph_id)
            || self.shared_subgraphs.binary_search(&subgraph_id).is_ok()
    }
}
