//! # Calibration Store
//!
//! Client-facing entry points. Each call selects a database by its graph
//! key vector, walks the graph's subgraphs through the matcher, overlays
//! heap overrides on file payloads and packs the result.
//!
//! Output follows a two-call protocol: pass `None` to learn the required
//! size, then a buffer at least that large. A short buffer yields
//! `NeedMore` carrying the required size.
//!
//! ```text
//! blob := entry*
//! entry := module_iid u32 | param_id u32 | size u32 | error_code u32 | payload | pad to 4
//! ```

use std::fmt;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, Bytes};
use tracing::{debug, warn};

use acdb_core::config::Config;
use acdb_core::error::{Error, OptionalExt, Result};
use acdb_core::metrics::Metrics;
use acdb_core::types::{
    KeyVector, KeyVectorDomain, ModuleInstanceId, ParamClass, ParameterId, SetSummary, SubgraphId,
    SubgraphParamData, TagId,
};
use acdb_core::utils::word_align;

use crate::context::{ContextManager, DatabaseContext, DatabaseHandle};
use crate::file::DatabaseFile;
use crate::heap::Heap;
use crate::matcher::{compute_delta, CalHit, Matcher};

/// Bytes preceding each payload in a packed blob
pub const BLOB_ENTRY_HEADER_SIZE: usize = 16;

/// One parameter in a packed blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub module_iid: ModuleInstanceId,
    pub param_id: ParameterId,
    pub error_code: u32,
    pub payload: Bytes,
}

impl BlobEntry {
    pub fn encoded_len(&self) -> usize {
        BLOB_ENTRY_HEADER_SIZE + word_align(self.payload.len())
    }
}

/// Packed size of `entries`
pub fn blob_size(entries: &[BlobEntry]) -> usize {
    entries.iter().map(BlobEntry::encoded_len).sum()
}

/// Pack `entries` into `out`, or report the size when `out` is `None`
pub fn write_blob(entries: &[BlobEntry], out: Option<&mut [u8]>) -> Result<usize> {
    let required = blob_size(entries);
    let out = match out {
        None => return Ok(required),
        Some(out) => out,
    };
    if out.len() < required {
        return Err(Error::NeedMore {
            required,
            provided: out.len(),
        });
    }

    let mut cursor = &mut out[..required];
    for entry in entries {
        cursor.put_u32_le(entry.module_iid);
        cursor.put_u32_le(entry.param_id);
        cursor.put_u32_le(entry.payload.len() as u32);
        cursor.put_u32_le(entry.error_code);
        cursor.put_slice(&entry.payload);
        cursor.put_bytes(0, word_align(entry.payload.len()) - entry.payload.len());
    }
    Ok(required)
}

/// Parse a packed blob
pub fn unpack_blob(data: &[u8]) -> Result<Vec<BlobEntry>> {
    let mut entries = Vec::new();
    let mut cursor = Cursor::new(data);

    while (cursor.position() as usize) < data.len() {
        let truncated = |_| Error::corrupt("truncated blob entry header");
        let module_iid = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
        let param_id = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
        let size = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
        let error_code = cursor.read_u32::<LittleEndian>().map_err(truncated)?;

        let mut payload = vec![0u8; word_align(size)];
        cursor
            .read_exact(&mut payload)
            .map_err(|_| Error::corrupt(format!("blob payload of {} bytes truncated", size)))?;
        payload.truncate(size);

        entries.push(BlobEntry {
            module_iid,
            param_id,
            error_code,
            payload: Bytes::from(payload),
        });
    }
    Ok(entries)
}

/// Calibration retrieval and override facade over loaded databases
pub struct CalibrationStore {
    manager: ContextManager,
    metrics: Metrics,
}

impl CalibrationStore {
    pub fn new(config: Config) -> Result<Self> {
        let metrics = Metrics::new();
        let manager = ContextManager::with_metrics(config, metrics.clone())?;
        Ok(Self { manager, metrics })
    }

    pub fn manager(&self) -> &ContextManager {
        &self.manager
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn add_database(&self, path: impl AsRef<Path>) -> Result<DatabaseHandle> {
        self.manager.add_database(path)
    }

    pub fn add_database_file(&self, file: DatabaseFile) -> Result<DatabaseHandle> {
        self.manager.add_database_file(file)
    }

    pub fn remove_database(&self, handle: DatabaseHandle) -> Result<()> {
        self.manager.remove_database(handle)
    }

    /// Calibration for a usecase graph
    ///
    /// With an empty `ckv_prior` every variant matching `ckv_new` is
    /// returned. Otherwise only parameters of variants touched by the keys
    /// that changed are returned.
    pub fn get_calibration(
        &self,
        gkv: &KeyVector,
        ckv_new: &KeyVector,
        ckv_prior: &KeyVector,
        out: Option<&mut [u8]>,
    ) -> Result<usize> {
        self.metrics.record_lookup();
        let result = self
            .collect_calibration(gkv, ckv_new, ckv_prior)
            .and_then(|entries| self.pack(&entries, out));
        self.finish(result, || format!("calibration gkv {} ckv {}", gkv, ckv_new))
    }

    /// Tag-scoped data for a usecase graph
    pub fn get_tag_data(&self, gkv: &KeyVector, tag_id: TagId, tkv: &KeyVector, out: Option<&mut [u8]>) -> Result<usize> {
        self.metrics.record_lookup();
        let result = self
            .collect_tag_data(gkv, tag_id, tkv)
            .and_then(|entries| self.pack(&entries, out));
        self.finish(result, || format!("tag {:#x} gkv {} tkv {}", tag_id, gkv, tkv))
    }

    /// Payload of one module parameter
    pub fn get_parameter(
        &self,
        gkv: &KeyVector,
        ckv: &KeyVector,
        subgraph_id: SubgraphId,
        module_iid: ModuleInstanceId,
        param_id: ParameterId,
    ) -> Result<Bytes> {
        self.metrics.record_lookup();
        let result = (|| {
            let (context, graph) = self.manager.select_by_gkv(gkv)?;
            if !graph.contains(subgraph_id) {
                return Err(Error::not_exist(format!("subgraph {:#x} not in graph {}", subgraph_id, gkv)));
            }
            let matcher = context.matcher();
            let hit = matcher.resolve_parameter(subgraph_id, ckv, module_iid, param_id)?;
            let heap = context.heap();
            self.resolve_payload(&heap, &matcher, KeyVectorDomain::Calibration, &hit)
        })();
        self.finish(result, || {
            format!(
                "parameter {:#x} of module {:#x} in subgraph {:#x}",
                param_id, module_iid, subgraph_id
            )
        })
    }

    /// Override calibration of the variants `ckv` selects in the graph
    ///
    /// Each tuple is routed to the variant whose definitions include its
    /// parameter, falling back to the default variant. Tuples outside the
    /// graph, or for parameters no matching variant defines, are dropped.
    pub fn set_calibration(
        &self,
        gkv: &KeyVector,
        ckv: &KeyVector,
        data: &[SubgraphParamData],
        class: ParamClass,
    ) -> Result<SetSummary> {
        if !class.is_supported() {
            return Err(Error::bad_param(format!("parameter class {:?} is not supported", class)));
        }
        if data.is_empty() {
            return Err(Error::bad_param("no parameter data to set"));
        }

        let (context, graph) = self.manager.select_by_gkv(gkv)?;
        let mut summary = SetSummary::default();
        let mut groups: Vec<(KeyVector, Vec<SubgraphParamData>)> = Vec::new();
        {
            let matcher = context.matcher();
            for item in data {
                if !graph.contains(item.subgraph_id) {
                    summary.dropped += 1;
                    continue;
                }
                let hit = matcher
                    .resolve_parameter(item.subgraph_id, ckv, item.module_iid, item.param_id)
                    .optional()?;
                let Some(hit) = hit else {
                    debug!(
                        "No variant of subgraph {:#x} defines parameter {:#x} of module {:#x}",
                        item.subgraph_id, item.param_id, item.module_iid
                    );
                    summary.dropped += 1;
                    continue;
                };
                match groups.iter_mut().find(|(kv, _)| *kv == hit.variant_key) {
                    Some((_, items)) => items.push(item.clone()),
                    None => groups.push((hit.variant_key, vec![item.clone()])),
                }
            }
        }

        {
            let mut heap = context.heap_mut();
            for (key_vector, items) in &groups {
                let applied = heap.set_override(KeyVectorDomain::Calibration, key_vector, items, class, &*context)?;
                summary.merge(applied);
            }
        }

        self.metrics
            .record_overrides(summary.applied() as u64, summary.dropped as u64);
        if summary.applied() > 0 && context.persist_heap()?.is_some() {
            self.metrics.record_delta_save();
        }

        debug!(
            "Set calibration gkv {} ckv {}: {} replaced, {} appended, {} dropped",
            gkv, ckv, summary.replaced, summary.appended, summary.dropped
        );
        Ok(summary)
    }

    fn collect_calibration(&self, gkv: &KeyVector, ckv_new: &KeyVector, ckv_prior: &KeyVector) -> Result<Vec<BlobEntry>> {
        let (context, graph) = self.manager.select_by_gkv(gkv)?;
        let delta = compute_delta(ckv_new, ckv_prior)?;
        self.collect(&context, &graph.subgraphs, KeyVectorDomain::Calibration, |matcher, subgraph_id| {
            matcher.collect_subgraph_calibration(subgraph_id, ckv_new, &delta)
        })
    }

    fn collect_tag_data(&self, gkv: &KeyVector, tag_id: TagId, tkv: &KeyVector) -> Result<Vec<BlobEntry>> {
        let (context, graph) = self.manager.select_by_gkv(gkv)?;
        self.collect(&context, &graph.subgraphs, KeyVectorDomain::Tag, |matcher, subgraph_id| {
            matcher.collect_tag_data(subgraph_id, tag_id, tkv)
        })
    }

    /// Resolve each subgraph's hits to payloads; subgraphs without data are skipped
    fn collect<F>(
        &self,
        context: &Arc<DatabaseContext>,
        subgraphs: &[SubgraphId],
        domain: KeyVectorDomain,
        mut hits_for: F,
    ) -> Result<Vec<BlobEntry>>
    where
        F: FnMut(&Matcher<'_, DatabaseFile>, SubgraphId) -> Result<Vec<CalHit>>,
    {
        let matcher = context.matcher();
        let heap = context.heap();
        let mut entries = Vec::new();

        for &subgraph_id in subgraphs {
            let hits = match hits_for(&matcher, subgraph_id).optional()? {
                Some(hits) => hits,
                None => continue,
            };
            for hit in &hits {
                entries.push(BlobEntry {
                    module_iid: hit.module_iid,
                    param_id: hit.param_id,
                    error_code: 0,
                    payload: self.resolve_payload(&heap, &matcher, domain, hit)?,
                });
            }
        }

        if entries.is_empty() {
            return Err(Error::not_exist(format!("no {} data in subgraphs {:x?}", domain, subgraphs)));
        }
        Ok(entries)
    }

    /// Heap ordinary list, then heap global list, then the file's data pool
    fn resolve_payload(
        &self,
        heap: &Heap,
        matcher: &Matcher<'_, DatabaseFile>,
        domain: KeyVectorDomain,
        hit: &CalHit,
    ) -> Result<Bytes> {
        for class in [ParamClass::NonGlobal, ParamClass::Global] {
            let payload = heap
                .get_override(domain, &hit.variant_key, hit.subgraph_id, hit.module_iid, hit.param_id, class)
                .optional()?;
            if let Some(payload) = payload {
                self.metrics.record_heap_hit();
                return Ok(payload);
            }
        }

        let payload = matcher.read_payload(hit.pool_offset)?;
        self.metrics.record_file_read();
        Ok(Bytes::copy_from_slice(payload))
    }

    fn pack(&self, entries: &[BlobEntry], out: Option<&mut [u8]>) -> Result<usize> {
        let writing = out.is_some();
        let size = write_blob(entries, out)?;
        if writing {
            self.metrics.record_bytes_served(size as u64);
        }
        Ok(size)
    }

    /// Misses are logged here and nowhere below
    fn finish<T, F>(&self, result: Result<T>, describe: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        if let Err(e) = &result {
            if e.is_not_exist() {
                self.metrics.record_miss();
                warn!("Lookup exhausted for {}: {}", describe(), e);
            }
        }
        result
    }
}

impl fmt::Debug for CalibrationStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalibrationStore")
            .field("databases", &self.manager.len())
            .field("metrics", &self.metrics.snapshot())
            .finish()
    }
}
