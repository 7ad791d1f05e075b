//! Database files are immutable, chunked images produced offline and
//! memory-mapped at load time. Every table inside is a run of little-endian
//! u32 words sorted by its leading fields.
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Database File Structure                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                      Header                         │    │
//! │  │  ["ACDB"][version][chunk_count]                     │    │
//! │  │  Directory: [id][offset][size] × chunk_count        │    │
//! │  │  [crc32 of directory]                               │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! │                                                             │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Graph Chunks                       │    │
//! │  │  GKVK: key-id regions → GKVL value LUTs → SGLS      │    │
//! │  │  SGMI: [subgraph][module_iid][module_id]            │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! │                                                             │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │               Calibration Chunks                    │    │
//! │  │  SGCI: [subgraph][header_offset]                    │    │
//! │  │  SGCH: [subgraph][n][key_table, lut] × n            │    │
//! │  │  CKVK/CKVL, TAGI/TKVK/TKVL                          │    │
//! │  │  LUT entry: [values..][def][dot][dot2]              │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! │                                                             │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Payload Chunks                     │    │
//! │  │  DEFT: [n][module_iid, param_id] × n                │    │
//! │  │  DOTT: [n][pool_offset] × n                         │    │
//! │  │  DPOL: [size][bytes][pad]                           │    │
//! │  │  DRVM: [module_id][key][pool_offset]                │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!
//! Offsets stored inside chunks are relative to the chunk start.

mod builder;
mod reader;
mod source;
mod types;
mod writer;

pub use builder::{
    DatabaseBuilder, DatabaseLayout, DriverModuleSpec, GraphSpec, LutEntrySpec, ModuleSpec,
    ParamSpec, SubgraphSpec, TagSpec, VariantSpec,
};
pub use reader::{ChunkDirectory, DatabaseFile};
pub use source::FileSource;
#[cfg(test)]
pub(crate) use source::view_of;
pub use types::{
    ChunkId, ChunkInfo, DatabaseProperties, DATABASE_MAGIC, DATABASE_VERSION,
    DIRECTORY_ENTRY_SIZE, HEADER_FIXED_SIZE, NO_OFFSET,
};
pub use writer::{FileWriter, WordBuffer};
