//! # ACDB Core
//!
//! This crate provides the fundamental building blocks for the audio
//! calibration database runtime:
//! - Key vectors and identifier types
//! - Error types
//! - Configuration
//! - Metrics
//! - Common utilities
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                    acdb-core                    │
//! ├─────────────────────────────────────────────────┤
//! │  • types   - Key vectors, ids, graph info       │
//! │  • error   - Error taxonomy                     │
//! │  • config  - Runtime configuration              │
//! │  • metrics - Lookup/override counters           │
//! │  • utils   - Common utilities                   │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, OptionalExt, Result};
pub use metrics::{Metrics, MetricsSnapshot};
pub use types::{
    GraphInfo, KeyValuePair, KeyVector, KeyVectorDomain, ModuleId, ModuleInstanceId,
    ParamClass, ParameterId, SetSummary, SubgraphId, SubgraphParamData, TagId,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// On-disk format version understood by this build
pub const FORMAT_VERSION: u32 = 1;
