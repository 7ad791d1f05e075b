//! Database layout description and builder
//!
//! A [`DatabaseLayout`] is a plain description of graphs, subgraphs,
//! calibration variants, tags and driver modules. [`DatabaseBuilder`] fills
//! one in and encodes it into the chunked file format, sorting every table
//! by its key fields on the way out.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use acdb_core::error::{Error, Result};
use acdb_core::types::{KeyVector, ModuleId, ModuleInstanceId, ParameterId, SubgraphId, TagId};

use super::types::{ChunkId, NO_OFFSET};
use super::writer::{FileWriter, WordBuffer};

/// Complete description of one database
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseLayout {
    pub database_id: u32,
    pub vm_id: u32,
    /// Inclusive subgraph id range; derived from the subgraphs when absent
    pub subgraph_id_range: Option<(u32, u32)>,
    pub shared_subgraphs: Vec<SubgraphId>,
    pub graphs: Vec<GraphSpec>,
    pub subgraphs: Vec<SubgraphSpec>,
    pub driver_modules: Vec<DriverModuleSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSpec {
    pub key_vector: KeyVector,
    pub subgraphs: Vec<SubgraphId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubgraphSpec {
    pub id: SubgraphId,
    pub modules: Vec<ModuleSpec>,
    pub calibration: Vec<VariantSpec>,
    pub tags: Vec<TagSpec>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModuleSpec {
    pub module_iid: ModuleInstanceId,
    pub module_id: ModuleId,
}

/// One calibration variant: a key-id set and its value-vector entries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariantSpec {
    pub key_ids: Vec<u32>,
    pub entries: Vec<LutEntrySpec>,
}

/// Values aligned with the owning variant's `key_ids`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LutEntrySpec {
    pub values: Vec<u32>,
    pub params: Vec<ParamSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParamSpec {
    pub module_iid: ModuleInstanceId,
    pub param_id: ParameterId,
    pub payload: Vec<u8>,
}

impl ParamSpec {
    pub fn new(module_iid: ModuleInstanceId, param_id: ParameterId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            module_iid,
            param_id,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagSpec {
    pub tag_id: TagId,
    pub key_ids: Vec<u32>,
    pub entries: Vec<LutEntrySpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverModuleSpec {
    pub module_id: ModuleId,
    pub key: u32,
    pub payload: Vec<u8>,
}

/// Incremental builder over a [`DatabaseLayout`]
#[derive(Debug, Clone, Default)]
pub struct DatabaseBuilder {
    layout: DatabaseLayout,
}

impl DatabaseBuilder {
    pub fn new(database_id: u32) -> Self {
        Self {
            layout: DatabaseLayout {
                database_id,
                ..Default::default()
            },
        }
    }

    pub fn from_layout(layout: DatabaseLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &DatabaseLayout {
        &self.layout
    }

    pub fn vm_id(&mut self, vm_id: u32) -> &mut Self {
        self.layout.vm_id = vm_id;
        self
    }

    pub fn subgraph_range(&mut self, min: SubgraphId, max: SubgraphId) -> &mut Self {
        self.layout.subgraph_id_range = Some((min, max));
        self
    }

    pub fn shared_subgraph(&mut self, subgraph_id: SubgraphId) -> &mut Self {
        self.layout.shared_subgraphs.push(subgraph_id);
        self
    }

    /// Usecase graph selected by `gkv`
    pub fn graph(&mut self, gkv: &KeyVector, subgraphs: &[SubgraphId]) -> &mut Self {
        self.layout.graphs.push(GraphSpec {
            key_vector: gkv.clone(),
            subgraphs: subgraphs.to_vec(),
        });
        self
    }

    pub fn module(&mut self, subgraph_id: SubgraphId, module_iid: ModuleInstanceId, module_id: ModuleId) -> &mut Self {
        self.subgraph_mut(subgraph_id).modules.push(ModuleSpec { module_iid, module_id });
        self
    }

    /// Calibration entry for the variant keyed by `ckv`'s key ids
    ///
    /// An empty `ckv` adds to the default variant.
    pub fn calibration(&mut self, subgraph_id: SubgraphId, ckv: &KeyVector, params: Vec<ParamSpec>) -> &mut Self {
        let ckv = ckv.sorted();
        let key_ids = ckv.key_ids();
        let subgraph = self.subgraph_mut(subgraph_id);
        let variant = match subgraph.calibration.iter().position(|v| v.key_ids == key_ids) {
            Some(index) => &mut subgraph.calibration[index],
            None => {
                subgraph.calibration.push(VariantSpec {
                    key_ids,
                    entries: Vec::new(),
                });
                let last = subgraph.calibration.len() - 1;
                &mut subgraph.calibration[last]
            }
        };
        variant.entries.push(LutEntrySpec {
            values: ckv.values(),
            params,
        });
        self
    }

    /// Tag data entry selected by `tkv`
    pub fn tag(&mut self, subgraph_id: SubgraphId, tag_id: TagId, tkv: &KeyVector, params: Vec<ParamSpec>) -> &mut Self {
        let tkv = tkv.sorted();
        let key_ids = tkv.key_ids();
        let subgraph = self.subgraph_mut(subgraph_id);
        let entry = LutEntrySpec {
            values: tkv.values(),
            params,
        };
        match subgraph.tags.iter_mut().find(|t| t.tag_id == tag_id) {
            Some(tag) => tag.entries.push(entry),
            None => subgraph.tags.push(TagSpec {
                tag_id,
                key_ids,
                entries: vec![entry],
            }),
        }
        self
    }

    pub fn driver_module(&mut self, module_id: ModuleId, key: u32, payload: impl Into<Vec<u8>>) -> &mut Self {
        self.layout.driver_modules.push(DriverModuleSpec {
            module_id,
            key,
            payload: payload.into(),
        });
        self
    }

    fn subgraph_mut(&mut self, id: SubgraphId) -> &mut SubgraphSpec {
        let subgraphs = &mut self.layout.subgraphs;
        match subgraphs.iter().position(|s| s.id == id) {
            Some(index) => &mut subgraphs[index],
            None => {
                subgraphs.push(SubgraphSpec {
                    id,
                    ..Default::default()
                });
                let last = subgraphs.len() - 1;
                &mut subgraphs[last]
            }
        }
    }

    /// Encode the layout into a database image
    pub fn build(&self) -> Result<Vec<u8>> {
        encode(&self.layout)?.finish()
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<u64> {
        encode(&self.layout)?.write_to(path)
    }
}

/// DEF/DOT tables and the data pool they point into
#[derive(Default)]
struct DetailWriter {
    def: WordBuffer,
    dot: WordBuffer,
    pool: WordBuffer,
}

impl DetailWriter {
    fn payload(&mut self, bytes: &[u8]) -> u32 {
        let offset = self.pool.offset();
        self.pool.push(bytes.len() as u32);
        self.pool.push_bytes_padded(bytes);
        offset
    }

    /// Returns `(def_offset, dot_offset)`
    fn params(&mut self, params: &[ParamSpec]) -> Result<(u32, u32)> {
        let mut seen: Vec<(u32, u32)> = Vec::with_capacity(params.len());
        for param in params {
            let pair = (param.module_iid, param.param_id);
            if seen.contains(&pair) {
                return Err(Error::bad_param(format!(
                    "parameter {:#x} of module {:#x} listed twice in one entry",
                    param.param_id, param.module_iid
                )));
            }
            seen.push(pair);
        }

        let pool_offsets: Vec<u32> = params.iter().map(|p| self.payload(&p.payload)).collect();

        let def_offset = self.def.offset();
        self.def.push(params.len() as u32);
        for param in params {
            self.def.push(param.module_iid);
            self.def.push(param.param_id);
        }

        let dot_offset = self.dot.offset();
        self.dot.push(pool_offsets.len() as u32);
        self.dot.push_all(&pool_offsets);

        Ok((def_offset, dot_offset))
    }
}

/// Writes one key table + value LUT pair, returns `(key_table_offset, lut_offset)`
fn encode_variant(
    key_ids: &[u32],
    entries: &[LutEntrySpec],
    key_tables: &mut WordBuffer,
    luts: &mut WordBuffer,
    details: &mut DetailWriter,
) -> Result<(u32, u32)> {
    let mut order: Vec<usize> = (0..key_ids.len()).collect();
    order.sort_by_key(|&i| key_ids[i]);
    let sorted_keys: Vec<u32> = order.iter().map(|&i| key_ids[i]).collect();
    if sorted_keys.windows(2).any(|w| w[0] == w[1]) {
        return Err(Error::bad_param(format!("duplicate key id in variant {:?}", key_ids)));
    }
    if sorted_keys.is_empty() && entries.len() > 1 {
        return Err(Error::bad_param("default variant can hold only one entry"));
    }

    let mut rows: Vec<(Vec<u32>, &[ParamSpec])> = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.values.len() != key_ids.len() {
            return Err(Error::bad_param(format!(
                "entry has {} values for {} keys",
                entry.values.len(),
                key_ids.len()
            )));
        }
        let values: Vec<u32> = order.iter().map(|&i| entry.values[i]).collect();
        rows.push((values, &entry.params));
    }
    rows.sort_by(|a, b| a.0.cmp(&b.0));
    if rows.windows(2).any(|w| w[0].0 == w[1].0) {
        return Err(Error::bad_param(format!("duplicate value vector for keys {:?}", sorted_keys)));
    }

    let mut targets = Vec::with_capacity(rows.len());
    for (_, params) in &rows {
        targets.push(details.params(params)?);
    }

    let key_table_offset = key_tables.offset();
    key_tables.push(sorted_keys.len() as u32);
    key_tables.push_all(&sorted_keys);

    let lut_offset = luts.offset();
    luts.push(sorted_keys.len() as u32);
    luts.push(rows.len() as u32);
    for ((values, _), (def_offset, dot_offset)) in rows.iter().zip(targets) {
        luts.push_all(values);
        luts.push(def_offset);
        luts.push(dot_offset);
        luts.push(NO_OFFSET);
    }

    Ok((key_table_offset, lut_offset))
}

fn encode(layout: &DatabaseLayout) -> Result<FileWriter> {
    let mut details = DetailWriter::default();
    let mut writer = FileWriter::new();

    // Properties
    let (sg_min, sg_max) = match layout.subgraph_id_range {
        Some(range) => range,
        None => {
            let ids = layout
                .subgraphs
                .iter()
                .map(|s| s.id)
                .chain(layout.graphs.iter().flat_map(|g| g.subgraphs.iter().copied()));
            ids.fold(None, |acc: Option<(u32, u32)>, id| match acc {
                Some((lo, hi)) => Some((lo.min(id), hi.max(id))),
                None => Some((id, id)),
            })
            .unwrap_or((0, 0))
        }
    };
    let mut prop = WordBuffer::new();
    prop.push_all(&[layout.database_id, layout.vm_id, sg_min, sg_max]);
    writer.add_chunk(ChunkId::PROPERTIES, prop.into_vec())?;

    let mut shared = layout.shared_subgraphs.clone();
    shared.sort_unstable();
    shared.dedup();
    let mut shsg = WordBuffer::new();
    shsg.push(shared.len() as u32);
    shsg.push_all(&shared);
    writer.add_chunk(ChunkId::SHARED_SUBGRAPHS, shsg.into_vec())?;

    // Graph key vectors, grouped by key-id set
    let mut sgls = WordBuffer::new();
    let mut groups: BTreeMap<Vec<u32>, Vec<(Vec<u32>, u32)>> = BTreeMap::new();
    for graph in &layout.graphs {
        let gkv = graph.key_vector.sorted();
        if gkv.has_duplicate_keys() {
            return Err(Error::bad_param(format!("graph key vector {} repeats a key", gkv)));
        }
        let list_offset = sgls.offset();
        sgls.push(graph.subgraphs.len() as u32);
        sgls.push_all(&graph.subgraphs);
        groups.entry(gkv.key_ids()).or_default().push((gkv.values(), list_offset));
    }

    let mut gkvl = WordBuffer::new();
    let mut regions: BTreeMap<usize, Vec<(Vec<u32>, u32)>> = BTreeMap::new();
    for (key_ids, mut rows) in groups {
        rows.sort();
        if rows.windows(2).any(|w| w[0].0 == w[1].0) {
            return Err(Error::bad_param(format!("duplicate graph key vector for keys {:?}", key_ids)));
        }
        let lut_offset = gkvl.offset();
        gkvl.push(key_ids.len() as u32);
        gkvl.push(rows.len() as u32);
        for (values, list_offset) in &rows {
            gkvl.push_all(values);
            gkvl.push(*list_offset);
        }
        regions.entry(key_ids.len()).or_default().push((key_ids, lut_offset));
    }

    let mut gkvk = WordBuffer::new();
    gkvk.push(regions.len() as u32);
    for (key_count, records) in &regions {
        gkvk.push(*key_count as u32);
        gkvk.push(records.len() as u32);
        // BTreeMap iteration already yields key-id sets in ascending order
        for (key_ids, lut_offset) in records {
            gkvk.push_all(key_ids);
            gkvk.push(*lut_offset);
        }
    }
    writer.add_chunk(ChunkId::GKV_KEY_TABLE, gkvk.into_vec())?;
    writer.add_chunk(ChunkId::GKV_LUT, gkvl.into_vec())?;
    writer.add_chunk(ChunkId::SUBGRAPH_LISTS, sgls.into_vec())?;

    // Subgraph membership
    let mut modules: Vec<[u32; 3]> = layout
        .subgraphs
        .iter()
        .flat_map(|s| s.modules.iter().map(move |m| [s.id, m.module_iid, m.module_id]))
        .collect();
    modules.sort_unstable();
    if modules.windows(2).any(|w| w[0][..2] == w[1][..2]) {
        return Err(Error::bad_param("module instance listed twice in one subgraph"));
    }
    let mut sgmi = WordBuffer::new();
    for record in &modules {
        sgmi.push_all(record);
    }
    writer.add_chunk(ChunkId::SUBGRAPH_MODULES, sgmi.into_vec())?;

    // Calibration variants and tags
    let mut subgraphs: Vec<&SubgraphSpec> = layout.subgraphs.iter().collect();
    subgraphs.sort_by_key(|s| s.id);
    if subgraphs.windows(2).any(|w| w[0].id == w[1].id) {
        return Err(Error::bad_param("subgraph described twice"));
    }

    let mut sgci = WordBuffer::new();
    let mut sgch = WordBuffer::new();
    let mut ckvk = WordBuffer::new();
    let mut ckvl = WordBuffer::new();
    let mut tag_index: Vec<[u32; 4]> = Vec::new();
    let mut tkvk = WordBuffer::new();
    let mut tkvl = WordBuffer::new();

    for subgraph in &subgraphs {
        if !subgraph.calibration.is_empty() {
            let defaults = subgraph.calibration.iter().filter(|v| v.key_ids.is_empty()).count();
            if defaults > 1 {
                return Err(Error::bad_param(format!(
                    "subgraph {:#x} has {} default variants",
                    subgraph.id, defaults
                )));
            }

            let mut pairs = Vec::with_capacity(subgraph.calibration.len());
            for variant in &subgraph.calibration {
                pairs.push(encode_variant(
                    &variant.key_ids,
                    &variant.entries,
                    &mut ckvk,
                    &mut ckvl,
                    &mut details,
                )?);
            }

            sgci.push(subgraph.id);
            sgci.push(sgch.offset());
            sgch.push(subgraph.id);
            sgch.push(pairs.len() as u32);
            for (key_table_offset, lut_offset) in pairs {
                sgch.push(key_table_offset);
                sgch.push(lut_offset);
            }
        }

        for tag in &subgraph.tags {
            if tag_index.iter().any(|r| r[0] == subgraph.id && r[1] == tag.tag_id) {
                return Err(Error::bad_param(format!(
                    "tag {:#x} described twice for subgraph {:#x}",
                    tag.tag_id, subgraph.id
                )));
            }
            let (key_table_offset, lut_offset) =
                encode_variant(&tag.key_ids, &tag.entries, &mut tkvk, &mut tkvl, &mut details)?;
            tag_index.push([subgraph.id, tag.tag_id, key_table_offset, lut_offset]);
        }
    }

    tag_index.sort_unstable();
    let mut tagi = WordBuffer::new();
    for record in &tag_index {
        tagi.push_all(record);
    }

    // Driver modules keep duplicates; lookups return the first occurrence
    let mut drivers: Vec<[u32; 3]> = Vec::with_capacity(layout.driver_modules.len());
    for driver in &layout.driver_modules {
        drivers.push([driver.module_id, driver.key, details.payload(&driver.payload)]);
    }
    drivers.sort_by_key(|r| (r[0], r[1]));
    let mut drvm = WordBuffer::new();
    for record in &drivers {
        drvm.push_all(record);
    }

    writer.add_chunk(ChunkId::SUBGRAPH_CAL_INDEX, sgci.into_vec())?;
    writer.add_chunk(ChunkId::SUBGRAPH_CAL_HEADERS, sgch.into_vec())?;
    writer.add_chunk(ChunkId::CKV_KEY_TABLES, ckvk.into_vec())?;
    writer.add_chunk(ChunkId::CKV_LUTS, ckvl.into_vec())?;
    writer.add_chunk(ChunkId::TAG_INDEX, tagi.into_vec())?;
    writer.add_chunk(ChunkId::TKV_KEY_TABLES, tkvk.into_vec())?;
    writer.add_chunk(ChunkId::TKV_LUTS, tkvl.into_vec())?;
    writer.add_chunk(ChunkId::DEF_TABLES, details.def.into_vec())?;
    writer.add_chunk(ChunkId::DOT_TABLES, details.dot.into_vec())?;
    writer.add_chunk(ChunkId::DATA_POOL, details.pool.into_vec())?;
    writer.add_chunk(ChunkId::DRIVER_MODULES, drvm.into_vec())?;

    Ok(writer)
}
