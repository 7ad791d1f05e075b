//! # Key-Vector Matcher
//!
//! Two-stage lookup shared by the graph, calibration and tag key spaces:
//!
//! ```text
//!   sorted key vector
//!          │
//!          ▼
//!   ┌──────────────┐  key ids   ┌──────────────┐  values   ┌──────────────┐
//!   │ key id table │ ─────────▶ │  value LUT   │ ────────▶ │   targets    │
//!   │ GKVK / CKVK  │  lut off   │ GKVL / CKVL  │           │ SGLS | DEF+  │
//!   │ TKVK         │            │ TKVL         │           │ DOT(+DOT2)   │
//!   └──────────────┘            └──────────────┘           └──────────────┘
//! ```
//!
//! For calibration the first stage is per subgraph: each subgraph lists its
//! variants (one key table and one LUT each) and at most one of them has no
//! keys. That default variant fills in modules no matching variant covers.

use ahash::AHashMap;
use tracing::debug;

use acdb_core::config::SearchConfig;
use acdb_core::error::{Error, OptionalExt, Result, ResultExt};
use acdb_core::types::{
    GraphInfo, KeyVector, KeyVectorDomain, ModuleInstanceId, ParameterId, SubgraphId, TagId,
};

use crate::file::{ChunkId, ChunkInfo, FileSource, NO_OFFSET};
use crate::table::{CalIndexRecord, RecordLayout, SearchMode, TableSearcher, TagIndexRecord};

/// Key-id table chunk of a domain
pub fn key_table_chunk(domain: KeyVectorDomain) -> ChunkId {
    match domain {
        KeyVectorDomain::Graph => ChunkId::GKV_KEY_TABLE,
        KeyVectorDomain::Calibration => ChunkId::CKV_KEY_TABLES,
        KeyVectorDomain::Tag => ChunkId::TKV_KEY_TABLES,
    }
}

/// Value lookup table chunk of a domain
pub fn lut_chunk(domain: KeyVectorDomain) -> ChunkId {
    match domain {
        KeyVectorDomain::Graph => ChunkId::GKV_LUT,
        KeyVectorDomain::Calibration => ChunkId::CKV_LUTS,
        KeyVectorDomain::Tag => ChunkId::TKV_LUTS,
    }
}

/// Target words following the values in each LUT entry
pub fn target_words(domain: KeyVectorDomain) -> usize {
    match domain {
        KeyVectorDomain::Graph => 1,
        KeyVectorDomain::Calibration | KeyVectorDomain::Tag => 3,
    }
}

/// Targets of a calibration or tag LUT entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LutEntry {
    pub def_offset: u32,
    pub dot_offset: u32,
    /// Reserved persistent-global table; carried, never dereferenced
    pub dot2_offset: Option<u32>,
}

impl LutEntry {
    fn from_targets(targets: &[u32]) -> Result<Self> {
        match targets {
            [def, dot, dot2] => Ok(Self {
                def_offset: *def,
                dot_offset: *dot,
                dot2_offset: (*dot2 != NO_OFFSET).then_some(*dot2),
            }),
            _ => Err(Error::corrupt(format!("LUT entry has {} target words", targets.len()))),
        }
    }
}

/// One calibration variant of a subgraph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalVariant {
    /// Sorted key ids; empty for the default variant
    pub key_ids: Vec<u32>,
    pub key_table_offset: u32,
    pub lut_offset: u32,
}

impl CalVariant {
    pub fn is_default(&self) -> bool {
        self.key_ids.is_empty()
    }

    pub fn shares_key_with(&self, kv: &KeyVector) -> bool {
        self.key_ids.iter().any(|&key| kv.contains_key(key))
    }
}

/// A variant entry selected by a key vector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantMatch {
    /// The requested vector restricted to the variant's key ids
    pub key_vector: KeyVector,
    pub entry: LutEntry,
}

/// Where a parameter payload lives in the data pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamLocation {
    pub module_iid: ModuleInstanceId,
    pub param_id: ParameterId,
    pub pool_offset: u32,
}

/// Changed keys between two calibration vectors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CkvDelta {
    /// No prior vector was given
    pub first_time: bool,
    pub delta: KeyVector,
}

/// One parameter resolved for a subgraph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalHit {
    pub subgraph_id: SubgraphId,
    /// Key vector identifying the variant that supplied the parameter
    pub variant_key: KeyVector,
    pub module_iid: ModuleInstanceId,
    pub param_id: ParameterId,
    pub pool_offset: u32,
}

impl CalHit {
    fn new(subgraph_id: SubgraphId, variant_key: &KeyVector, location: ParamLocation) -> Self {
        Self {
            subgraph_id,
            variant_key: variant_key.clone(),
            module_iid: location.module_iid,
            param_id: location.param_id,
            pool_offset: location.pool_offset,
        }
    }
}

/// Module instances already provided by a matching non-default variant
///
/// Lives for one lookup call.
#[derive(Debug, Default)]
pub struct ModuleRefCounts {
    counts: AHashMap<ModuleInstanceId, u32>,
}

impl ModuleRefCounts {
    pub fn retain(&mut self, module_iid: ModuleInstanceId) {
        *self.counts.entry(module_iid).or_insert(0) += 1;
    }

    pub fn is_referenced(&self, module_iid: ModuleInstanceId) -> bool {
        self.counts.get(&module_iid).map_or(false, |&n| n > 0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Compare a new calibration vector against the previous one
///
/// With no prior vector every key counts as changed. Otherwise both vectors
/// must carry the same key ids, and the delta holds the keys whose value
/// differs; an empty delta is `NotExist`.
pub fn compute_delta(new: &KeyVector, prior: &KeyVector) -> Result<CkvDelta> {
    let new = new.sorted();
    reject_repeated_keys(KeyVectorDomain::Calibration, &new)?;
    if prior.is_empty() {
        return Ok(CkvDelta {
            first_time: true,
            delta: new,
        });
    }

    let prior = prior.sorted();
    reject_repeated_keys(KeyVectorDomain::Calibration, &prior)?;
    if new.key_ids() != prior.key_ids() {
        return Err(Error::bad_param(format!(
            "calibration key vectors {} and {} use different keys",
            new, prior
        )));
    }

    let delta: KeyVector = new
        .iter()
        .zip(prior.iter())
        .filter(|(n, p)| n.value != p.value)
        .map(|(n, _)| *n)
        .collect();
    if delta.is_empty() {
        return Err(Error::not_exist(format!("no calibration key changed in {}", new)));
    }

    Ok(CkvDelta {
        first_time: false,
        delta,
    })
}

/// A key id may appear once per vector
fn reject_repeated_keys(domain: KeyVectorDomain, key_vector: &KeyVector) -> Result<()> {
    if key_vector.has_duplicate_keys() {
        return Err(Error::bad_param(format!("{} {} repeats a key", domain, key_vector)));
    }
    Ok(())
}

/// Key-vector lookups against one database file
pub struct Matcher<'a, S: FileSource + ?Sized> {
    source: &'a S,
    searcher: TableSearcher<'a, S>,
}

impl<'a, S: FileSource + ?Sized> Matcher<'a, S> {
    pub fn new(source: &'a S, config: &SearchConfig) -> Self {
        Self {
            source,
            searcher: TableSearcher::new(source, config),
        }
    }

    pub fn searcher(&self) -> &TableSearcher<'a, S> {
        &self.searcher
    }

    /// Bounds-checked words at a chunk-relative offset
    fn chunk_words(&self, info: &ChunkInfo, relative: u64, count: usize) -> Result<Vec<u32>> {
        let absolute = info.absolute(relative, count as u64 * 4)?;
        self.source.read_words(absolute, count)
    }

    /// Stage 1 for graph key vectors: key-id set → GKV LUT offset
    ///
    /// The key table is a run of regions, one per key count. Regions whose
    /// arity differs from the request are skipped.
    pub fn search_graph_key_table(&self, key_ids: &[u32]) -> Result<u32> {
        let info = self.source.chunk_info(ChunkId::GKV_KEY_TABLE)?;
        let region_count = self.chunk_words(&info, 0, 1)?[0];
        let mut position = 4u64;

        for _ in 0..region_count {
            let header = self.chunk_words(&info, position, 2)?;
            let (key_count, record_count) = (header[0] as usize, header[1] as u64);
            let layout = RecordLayout::new(key_count + 1, key_count)?;
            let region_size = record_count * layout.stride_bytes() as u64;
            let table_offset = info.absolute(position + 8, region_size)?;

            if key_count == key_ids.len() && record_count > 0 {
                let hit = self
                    .searcher
                    .search(table_offset, region_size, &layout, key_ids, SearchMode::Any)?;
                return Ok(hit.word(key_count));
            }
            position += 8 + region_size;
        }

        Err(Error::not_exist(format!("graph key ids {:x?}", key_ids)))
    }

    /// Key ids of a CKV/TKV key table
    pub fn read_key_table(&self, domain: KeyVectorDomain, offset: u32) -> Result<Vec<u32>> {
        let info = self.source.chunk_info(key_table_chunk(domain))?;
        let count = self.chunk_words(&info, offset as u64, 1)?[0] as usize;
        self.chunk_words(&info, offset as u64 + 4, count)
    }

    /// Stage 2: exact value vector → target words
    pub fn search_value_table(&self, domain: KeyVectorDomain, lut_offset: u32, values: &[u32]) -> Result<Vec<u32>> {
        let info = self.source.chunk_info(lut_chunk(domain))?;
        let header = self.chunk_words(&info, lut_offset as u64, 2)?;
        let (key_count, entry_count) = (header[0] as usize, header[1] as u64);
        if key_count != values.len() {
            return Err(Error::corrupt(format!(
                "{} LUT at {:#x} holds {} keys, key table has {}",
                domain,
                lut_offset,
                key_count,
                values.len()
            )));
        }
        if entry_count == 0 {
            return Err(Error::not_exist(format!("{} LUT at {:#x} is empty", domain, lut_offset)));
        }

        let layout = RecordLayout::new(key_count + target_words(domain), key_count)?;
        let size = entry_count * layout.stride_bytes() as u64;
        let table_offset = info.absolute(lut_offset as u64 + 8, size)?;
        let hit = self
            .searcher
            .search(table_offset, size, &layout, values, SearchMode::Any)
            .with_context(|| format!("{} values {:x?}", domain, values))?;
        Ok(hit.words[key_count..].to_vec())
    }

    /// Resolve a usecase graph key vector to its subgraphs
    pub fn match_graph(&self, gkv: &KeyVector) -> Result<GraphInfo> {
        let gkv = gkv.sorted();
        reject_repeated_keys(KeyVectorDomain::Graph, &gkv)?;

        let lut_offset = self
            .search_graph_key_table(&gkv.key_ids())
            .with_context(|| format!("gkv {}", gkv))?;
        let targets = self.search_value_table(KeyVectorDomain::Graph, lut_offset, &gkv.values())?;

        let info = self.source.chunk_info(ChunkId::SUBGRAPH_LISTS)?;
        let list_offset = targets[0] as u64;
        let count = self.chunk_words(&info, list_offset, 1)?[0] as usize;
        let subgraphs = self.chunk_words(&info, list_offset + 4, count)?;

        debug!("GKV {} resolved to {} subgraphs", gkv, subgraphs.len());
        Ok(GraphInfo { subgraphs })
    }

    /// Calibration variants of a subgraph, in file order
    pub fn subgraph_variants(&self, subgraph_id: SubgraphId) -> Result<Vec<CalVariant>> {
        let index: CalIndexRecord = self
            .searcher
            .find(ChunkId::SUBGRAPH_CAL_INDEX, &[subgraph_id], SearchMode::Any)
            .with_context(|| format!("calibration of subgraph {:#x}", subgraph_id))?;

        let info = self.source.chunk_info(ChunkId::SUBGRAPH_CAL_HEADERS)?;
        let header_offset = index.header_offset as u64;
        let header = self.chunk_words(&info, header_offset, 2)?;
        if header[0] != subgraph_id {
            return Err(Error::corrupt(format!(
                "calibration header at {:#x} belongs to subgraph {:#x}, expected {:#x}",
                header_offset, header[0], subgraph_id
            )));
        }

        let variant_count = header[1] as usize;
        let pairs = self.chunk_words(&info, header_offset + 8, variant_count * 2)?;
        let mut variants = Vec::with_capacity(variant_count);
        for pair in pairs.chunks_exact(2) {
            variants.push(CalVariant {
                key_ids: self.read_key_table(KeyVectorDomain::Calibration, pair[0])?,
                key_table_offset: pair[0],
                lut_offset: pair[1],
            });
        }

        if variants.iter().filter(|v| v.is_default()).count() > 1 {
            return Err(Error::corrupt(format!(
                "subgraph {:#x} has more than one default variant",
                subgraph_id
            )));
        }
        Ok(variants)
    }

    /// Select a variant's entry with the keys of `ckv` it uses
    pub fn match_variant(&self, variant: &CalVariant, ckv: &KeyVector) -> Result<VariantMatch> {
        let ckv = ckv.sorted();
        reject_repeated_keys(KeyVectorDomain::Calibration, &ckv)?;
        let key_vector = ckv
            .restrict_to(&variant.key_ids)
            .ok_or_else(|| Error::not_exist(format!("ckv {} lacks variant keys {:x?}", ckv, variant.key_ids)))?;
        let targets = self.search_value_table(KeyVectorDomain::Calibration, variant.lut_offset, &key_vector.values())?;
        Ok(VariantMatch {
            key_vector,
            entry: LutEntry::from_targets(&targets)?,
        })
    }

    /// Select the tag entry whose key-id set equals `tkv`'s
    pub fn match_tag(&self, subgraph_id: SubgraphId, tag_id: TagId, tkv: &KeyVector) -> Result<VariantMatch> {
        let index: TagIndexRecord = self
            .searcher
            .find(ChunkId::TAG_INDEX, &[subgraph_id, tag_id], SearchMode::Any)
            .with_context(|| format!("tag {:#x} of subgraph {:#x}", tag_id, subgraph_id))?;

        let tkv = tkv.sorted();
        reject_repeated_keys(KeyVectorDomain::Tag, &tkv)?;
        let key_ids = self.read_key_table(KeyVectorDomain::Tag, index.key_table_offset)?;
        if tkv.key_ids() != key_ids {
            return Err(Error::not_exist(format!(
                "tkv {} does not use tag {:#x} keys {:x?}",
                tkv, tag_id, key_ids
            )));
        }

        let targets = self.search_value_table(KeyVectorDomain::Tag, index.lut_offset, &tkv.values())?;
        Ok(VariantMatch {
            key_vector: tkv,
            entry: LutEntry::from_targets(&targets)?,
        })
    }

    /// Join an entry's DEF list with its parallel DOT list
    pub fn read_param_locations(&self, entry: &LutEntry) -> Result<Vec<ParamLocation>> {
        let def = self.source.chunk_info(ChunkId::DEF_TABLES)?;
        let dot = self.source.chunk_info(ChunkId::DOT_TABLES)?;

        let def_count = self.chunk_words(&def, entry.def_offset as u64, 1)?[0] as usize;
        let dot_count = self.chunk_words(&dot, entry.dot_offset as u64, 1)?[0] as usize;
        if def_count != dot_count {
            return Err(Error::corrupt(format!(
                "DEF at {:#x} lists {} parameters, DOT at {:#x} lists {}",
                entry.def_offset, def_count, entry.dot_offset, dot_count
            )));
        }

        let pairs = self.chunk_words(&def, entry.def_offset as u64 + 4, def_count * 2)?;
        let offsets = self.chunk_words(&dot, entry.dot_offset as u64 + 4, dot_count)?;
        Ok(pairs
            .chunks_exact(2)
            .zip(offsets)
            .map(|(pair, pool_offset)| ParamLocation {
                module_iid: pair[0],
                param_id: pair[1],
                pool_offset,
            })
            .collect())
    }

    /// Payload bytes at a data-pool offset
    pub fn read_payload(&self, pool_offset: u32) -> Result<&'a [u8]> {
        let info = self.source.chunk_info(ChunkId::DATA_POOL)?;
        let size = self.chunk_words(&info, pool_offset as u64, 1)?[0] as u64;
        let absolute = info.absolute(pool_offset as u64 + 4, size)?;
        self.source.file_view(absolute, size)
    }

    /// Parameters a subgraph contributes for `ckv`
    ///
    /// Non-default variants are visited first, and only on a first-time
    /// lookup or when they share a key with the delta. The default variant
    /// comes last and only supplies modules no matching variant provides.
    pub fn collect_subgraph_calibration(
        &self,
        subgraph_id: SubgraphId,
        ckv: &KeyVector,
        delta: &CkvDelta,
    ) -> Result<Vec<CalHit>> {
        let variants = self.subgraph_variants(subgraph_id)?;
        let mut refs = ModuleRefCounts::default();
        let mut hits = Vec::new();
        let mut delta_touches_variant = false;
        let mut default_variant = None;

        for variant in &variants {
            if variant.is_default() {
                default_variant = Some(variant);
                continue;
            }

            let shares = variant.shares_key_with(&delta.delta);
            delta_touches_variant |= shares;

            let matched = match self.match_variant(variant, ckv).optional()? {
                Some(matched) => matched,
                None => continue,
            };
            let locations = self.read_param_locations(&matched.entry)?;
            for location in &locations {
                refs.retain(location.module_iid);
            }
            if delta.first_time || shares {
                hits.extend(
                    locations
                        .into_iter()
                        .map(|location| CalHit::new(subgraph_id, &matched.key_vector, location)),
                );
            }
        }

        if let Some(variant) = default_variant {
            if delta.first_time || delta_touches_variant {
                if let Some(matched) = self.match_variant(variant, ckv).optional()? {
                    let locations = self.read_param_locations(&matched.entry)?;
                    hits.extend(
                        locations
                            .into_iter()
                            .filter(|location| !refs.is_referenced(location.module_iid))
                            .map(|location| CalHit::new(subgraph_id, &matched.key_vector, location)),
                    );
                }
            }
        }

        debug!(
            "Subgraph {:#x}: {} parameters from {} variants, {} modules overridden",
            subgraph_id,
            hits.len(),
            variants.len(),
            refs.len()
        );
        Ok(hits)
    }

    /// The variant entry that supplies one parameter for `ckv`
    ///
    /// Matching non-default variants take precedence over the default one.
    pub fn resolve_parameter(
        &self,
        subgraph_id: SubgraphId,
        ckv: &KeyVector,
        module_iid: ModuleInstanceId,
        param_id: ParameterId,
    ) -> Result<CalHit> {
        let mut variants = self.subgraph_variants(subgraph_id)?;
        variants.sort_by_key(|v| v.is_default());

        for variant in &variants {
            let matched = match self.match_variant(variant, ckv).optional()? {
                Some(matched) => matched,
                None => continue,
            };
            let found = self
                .read_param_locations(&matched.entry)?
                .into_iter()
                .find(|l| l.module_iid == module_iid && l.param_id == param_id);
            if let Some(location) = found {
                return Ok(CalHit::new(subgraph_id, &matched.key_vector, location));
            }
        }

        Err(Error::not_exist(format!(
            "parameter {:#x} of module {:#x} in subgraph {:#x} for ckv {}",
            param_id, module_iid, subgraph_id, ckv
        )))
    }

    /// Parameters a subgraph stores under a tag for `tkv`
    pub fn collect_tag_data(&self, subgraph_id: SubgraphId, tag_id: TagId, tkv: &KeyVector) -> Result<Vec<CalHit>> {
        let matched = self.match_tag(subgraph_id, tag_id, tkv)?;
        Ok(self
            .read_param_locations(&matched.entry)?
            .into_iter()
            .map(|location| CalHit::new(subgraph_id, &matched.key_vector, location))
            .collect())
    }
}
