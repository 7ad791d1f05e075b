//! Delta file: optional on-disk copy of a context's heap
//!
//! ```text
//! ┌────────┬─────────┬──────────┬───────┬──────────────────────┐
//! │ "ACDD" │ version │ body_len │ crc32 │ bincode body         │
//! │ 4B     │ u32     │ u32      │ u32   │ Vec<PersistedDeltaMap>│
//! └────────┴─────────┴──────────┴───────┴──────────────────────┘
//! ```
//!
//! Saved after successful set calls when persistence is enabled and
//! replayed into the heap when the database is loaded again.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use acdb_core::config::DeltaConfig;
use acdb_core::error::{Error, Result};
use acdb_core::types::{
    KeyVector, KeyVectorDomain, ModuleInstanceId, ParamClass, ParameterId, SubgraphId,
    SubgraphParamData,
};

use crate::heap::{DeltaMap, Heap};

pub const DELTA_MAGIC: &[u8; 4] = b"ACDD";
pub const DELTA_VERSION: u32 = 1;
pub const DELTA_HEADER_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedOverride {
    pub subgraph_id: SubgraphId,
    pub module_iid: ModuleInstanceId,
    pub param_id: ParameterId,
    pub class: ParamClass,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedDeltaMap {
    pub domain: KeyVectorDomain,
    pub key_vector: KeyVector,
    pub overrides: Vec<PersistedOverride>,
}

impl PersistedDeltaMap {
    pub fn from_delta_map(map: &DeltaMap) -> Self {
        let mut overrides = Vec::new();
        for delta in map.subgraphs() {
            for (class, list) in [
                (ParamClass::NonGlobal, &delta.overrides),
                (ParamClass::Global, &delta.global_overrides),
            ] {
                overrides.extend(list.iter().map(|o| PersistedOverride {
                    subgraph_id: delta.subgraph_id,
                    module_iid: o.module_iid,
                    param_id: o.param_id,
                    class,
                    payload: o.payload.to_vec(),
                }));
            }
        }
        Self {
            domain: map.domain,
            key_vector: map.key_vector.clone(),
            overrides,
        }
    }

    /// Overrides split per class, ready to replay through `Heap::set_override`
    pub fn by_class(&self) -> Vec<(ParamClass, Vec<SubgraphParamData>)> {
        [ParamClass::NonGlobal, ParamClass::Global]
            .into_iter()
            .map(|class| {
                let data: Vec<SubgraphParamData> = self
                    .overrides
                    .iter()
                    .filter(|o| o.class == class)
                    .map(|o| {
                        SubgraphParamData::new(o.subgraph_id, o.module_iid, o.param_id, Bytes::from(o.payload.clone()))
                    })
                    .collect();
                (class, data)
            })
            .filter(|(_, data)| !data.is_empty())
            .collect()
    }
}

/// Delta file of one database
#[derive(Debug, Clone)]
pub struct DeltaFile {
    path: PathBuf,
    enabled: bool,
}

impl DeltaFile {
    pub fn new(path: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            path: path.into(),
            enabled,
        }
    }

    /// `<delta_dir>/<database id>.acdbdelta`
    pub fn for_database(config: &DeltaConfig, database_id: u32) -> Self {
        Self::new(
            config.delta_dir.join(format!("{:08x}.acdbdelta", database_id)),
            config.persist,
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_persist_enabled(&self) -> bool {
        self.enabled
    }

    /// Heap contents in a stable order
    pub fn snapshot(heap: &Heap) -> Vec<PersistedDeltaMap> {
        let mut maps: Vec<PersistedDeltaMap> = heap.delta_maps().map(PersistedDeltaMap::from_delta_map).collect();
        maps.sort_by(|a, b| (a.domain, &a.key_vector).cmp(&(b.domain, &b.key_vector)));
        maps
    }

    /// Write the heap via a temporary file and rename
    pub fn save(&self, heap: &Heap) -> Result<u64> {
        let maps = Self::snapshot(heap);
        let body = bincode::serialize(&maps).map_err(|e| Error::Serialization {
            message: format!("delta file body: {}", e),
        })?;

        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }

        let tmp_path = self.path.with_extension("tmp");
        {
            let file: File = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(DELTA_MAGIC)?;
            writer.write_u32::<LittleEndian>(DELTA_VERSION)?;
            writer.write_u32::<LittleEndian>(body.len() as u32)?;
            writer.write_u32::<LittleEndian>(crc32fast::hash(&body))?;
            writer.write_all(&body)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        let written = (DELTA_HEADER_SIZE + body.len()) as u64;
        info!(
            "Saved delta file {}: {} delta maps, {} bytes",
            self.path.display(),
            maps.len(),
            written
        );
        Ok(written)
    }

    /// Read persisted delta maps; a missing file holds none
    pub fn load(&self) -> Result<Vec<PersistedDeltaMap>> {
        if !self.path.exists() {
            debug!("No delta file at {}", self.path.display());
            return Ok(Vec::new());
        }

        let data = fs::read(&self.path)?;
        if data.len() < DELTA_HEADER_SIZE {
            return Err(Error::corrupt(format!("delta file {} too small", self.path.display())));
        }

        let mut cursor = Cursor::new(&data[..]);
        let mut magic = [0u8; 4];
        cursor.read_exact(&mut magic)?;
        if &magic != DELTA_MAGIC {
            return Err(Error::corrupt(format!("invalid delta file magic in {}", self.path.display())));
        }
        let version = cursor.read_u32::<LittleEndian>()?;
        if version != DELTA_VERSION {
            return Err(Error::corrupt(format!("unsupported delta file version: {}", version)));
        }
        let body_len = cursor.read_u32::<LittleEndian>()? as usize;
        let stored_crc = cursor.read_u32::<LittleEndian>()?;

        let body = &data[DELTA_HEADER_SIZE..];
        if body.len() != body_len {
            return Err(Error::corrupt(format!(
                "delta file body is {} bytes, header says {}",
                body.len(),
                body_len
            )));
        }
        let computed = crc32fast::hash(body);
        if computed != stored_crc {
            return Err(Error::corrupt(format!(
                "delta file checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored_crc, computed
            )));
        }

        let maps: Vec<PersistedDeltaMap> = bincode::deserialize(body).map_err(|e| Error::Serialization {
            message: format!("delta file body: {}", e),
        })?;
        info!("Loaded delta file {}: {} delta maps", self.path.display(), maps.len());
        Ok(maps)
    }
}
