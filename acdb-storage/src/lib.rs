//! # ACDB Storage
//!
//! Read path over immutable calibration database files plus the runtime
//! override heap layered on top of them.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Read Path                             │
//! │                                                             │
//! │  GKV ──> ContextManager ──> DatabaseContext                 │
//! │               │                   │                         │
//! │               ▼                   ▼                         │
//! │        select database      Matcher (GKV/CKV/TKV)           │
//! │                                   │                         │
//! │                                   ▼                         │
//! │                         Heap override? ──> data pool        │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Set Path                              │
//! │                                                             │
//! │  (GKV, CKV, data) ──> variant routing ──> Heap ──> DeltaFile│
//! │                                            (never the       │
//! │                                             database file)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod context;
pub mod delta_file;
pub mod file;
pub mod heap;
pub mod matcher;
pub mod store;
pub mod table;

pub use context::{ContextManager, DatabaseContext, DatabaseHandle};
pub use delta_file::{DeltaFile, PersistedDeltaMap, PersistedOverride};
pub use file::{ChunkId, DatabaseBuilder, DatabaseFile, FileSource, ParamSpec};
pub use heap::{DeltaMap, Heap, ModuleCalOverride, SubgraphDelta, SubgraphMembership};
pub use matcher::{compute_delta, CalHit, CalVariant, CkvDelta, Matcher};
pub use store::{unpack_blob, BlobEntry, CalibrationStore};
pub use table::{RecordLayout, SearchMode, TableHit, TableRecord, TableSearcher};
