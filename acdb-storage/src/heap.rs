//! # Heap Delta-Overlay Store
//!
//! Runtime overrides of file-resident calibration. The database file is
//! never rewritten; a set call lands here and later lookups consult the
//! heap before the file.
//!
//! ```text
//! Heap
//!  └─ domain (gkv | ckv | tkv)
//!      └─ key vector identity ──▶ DeltaMap { size, subgraph deltas }
//!                                   └─ SubgraphDelta
//!                                       ├─ overrides         (NonGlobal)
//!                                       └─ global_overrides  (Global)
//!                                           └─ (module_iid, param_id, payload)
//! ```
//!
//! Records are replaced in place or appended; there is no per-record
//! delete. `clear` releases everything.

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use tracing::debug;

use acdb_core::error::{Error, Result};
use acdb_core::types::{
    KeyVector, KeyVectorDomain, ModuleInstanceId, ParamClass, ParameterId, SetSummary,
    SubgraphId, SubgraphParamData,
};

/// Answers whether a subgraph contains a module instance
pub trait SubgraphMembership {
    fn contains_module(&self, subgraph_id: SubgraphId, module_iid: ModuleInstanceId) -> Result<bool>;
}

impl SubgraphMembership for AHashSet<(SubgraphId, ModuleInstanceId)> {
    fn contains_module(&self, subgraph_id: SubgraphId, module_iid: ModuleInstanceId) -> Result<bool> {
        Ok(self.contains(&(subgraph_id, module_iid)))
    }
}

/// One overridden parameter payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleCalOverride {
    pub module_iid: ModuleInstanceId,
    pub param_id: ParameterId,
    pub payload: Bytes,
}

/// Overrides of one subgraph under one key vector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubgraphDelta {
    pub subgraph_id: SubgraphId,
    pub overrides: Vec<ModuleCalOverride>,
    pub global_overrides: Vec<ModuleCalOverride>,
}

impl SubgraphDelta {
    fn new(subgraph_id: SubgraphId) -> Self {
        Self {
            subgraph_id,
            ..Default::default()
        }
    }

    /// Override list of a supported class
    pub fn list(&self, class: ParamClass) -> Option<&[ModuleCalOverride]> {
        match class {
            ParamClass::NonGlobal => Some(&self.overrides),
            ParamClass::Global => Some(&self.global_overrides),
            ParamClass::GlobalPersistent => None,
        }
    }

    fn list_mut(&mut self, class: ParamClass) -> Option<&mut Vec<ModuleCalOverride>> {
        match class {
            ParamClass::NonGlobal => Some(&mut self.overrides),
            ParamClass::Global => Some(&mut self.global_overrides),
            ParamClass::GlobalPersistent => None,
        }
    }

    pub fn find(&self, module_iid: ModuleInstanceId, param_id: ParameterId, class: ParamClass) -> Option<&ModuleCalOverride> {
        self.list(class)?
            .iter()
            .find(|o| o.module_iid == module_iid && o.param_id == param_id)
    }

    /// Payload bytes held by both lists
    pub fn payload_size(&self) -> usize {
        self.overrides
            .iter()
            .chain(self.global_overrides.iter())
            .map(|o| o.payload.len())
            .sum()
    }

    fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            subgraph_id: self.subgraph_id,
            overrides: try_clone_list(&self.overrides)?,
            global_overrides: try_clone_list(&self.global_overrides)?,
        })
    }
}

fn try_clone_list(list: &[ModuleCalOverride]) -> Result<Vec<ModuleCalOverride>> {
    let mut copy = Vec::new();
    copy.try_reserve_exact(list.len())?;
    copy.extend_from_slice(list);
    Ok(copy)
}

/// All overrides stored under one `(domain, key vector)` identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaMap {
    pub domain: KeyVectorDomain,
    pub key_vector: KeyVector,
    size: usize,
    subgraphs: Vec<SubgraphDelta>,
}

impl DeltaMap {
    fn new(domain: KeyVectorDomain, key_vector: KeyVector) -> Self {
        Self {
            domain,
            key_vector,
            size: 0,
            subgraphs: Vec::new(),
        }
    }

    /// Payload bytes currently held
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn subgraph_count(&self) -> usize {
        self.subgraphs.len()
    }

    pub fn subgraphs(&self) -> &[SubgraphDelta] {
        &self.subgraphs
    }

    pub fn subgraph(&self, subgraph_id: SubgraphId) -> Option<&SubgraphDelta> {
        self.subgraphs.iter().find(|s| s.subgraph_id == subgraph_id)
    }
}

/// Per-context override store
#[derive(Debug, Default)]
pub struct Heap {
    maps: AHashMap<KeyVectorDomain, AHashMap<KeyVector, DeltaMap>>,
    total_size: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delta_map(&self, domain: KeyVectorDomain, key_vector: &KeyVector) -> Option<&DeltaMap> {
        self.maps.get(&domain)?.get(key_vector)
    }

    pub fn subgraph_overrides(
        &self,
        domain: KeyVectorDomain,
        key_vector: &KeyVector,
        subgraph_id: SubgraphId,
    ) -> Option<&SubgraphDelta> {
        self.delta_map(domain, key_vector)?.subgraph(subgraph_id)
    }

    /// Override payload for one parameter
    pub fn get_override(
        &self,
        domain: KeyVectorDomain,
        key_vector: &KeyVector,
        subgraph_id: SubgraphId,
        module_iid: ModuleInstanceId,
        param_id: ParameterId,
        class: ParamClass,
    ) -> Result<Bytes> {
        if !class.is_supported() {
            return Err(Error::bad_param(format!("parameter class {:?} is not supported", class)));
        }
        self.subgraph_overrides(domain, key_vector, subgraph_id)
            .and_then(|delta| delta.find(module_iid, param_id, class))
            .map(|o| o.payload.clone())
            .ok_or_else(|| {
                Error::not_exist(format!(
                    "{} override {} subgraph {:#x} module {:#x} param {:#x}",
                    domain, key_vector, subgraph_id, module_iid, param_id
                ))
            })
    }

    /// Replace or append overrides under `(domain, key_vector)`
    ///
    /// Tuples addressed to a module the subgraph does not contain are
    /// dropped. Every allocation happens before the heap is touched, so an
    /// allocation failure leaves it unchanged.
    pub fn set_override<M: SubgraphMembership + ?Sized>(
        &mut self,
        domain: KeyVectorDomain,
        key_vector: &KeyVector,
        data: &[SubgraphParamData],
        class: ParamClass,
        membership: &M,
    ) -> Result<SetSummary> {
        if !class.is_supported() {
            return Err(Error::bad_param(format!("parameter class {:?} is not supported", class)));
        }
        if data.is_empty() {
            return Err(Error::bad_param("no parameter data to set"));
        }

        let mut summary = SetSummary::default();
        let existing = self.delta_map(domain, key_vector);

        // Stage copies of every touched subgraph delta
        let mut staged: Vec<SubgraphDelta> = Vec::new();
        let mut staged_old_size = 0usize;
        for item in data {
            if !membership.contains_module(item.subgraph_id, item.module_iid)? {
                debug!(
                    "Dropping override for module {:#x}: not in subgraph {:#x}",
                    item.module_iid, item.subgraph_id
                );
                summary.dropped += 1;
                continue;
            }

            let index = match staged.iter().position(|s| s.subgraph_id == item.subgraph_id) {
                Some(index) => index,
                None => {
                    let copy = match existing.and_then(|map| map.subgraph(item.subgraph_id)) {
                        Some(delta) => {
                            staged_old_size += delta.payload_size();
                            delta.try_clone()?
                        }
                        None => SubgraphDelta::new(item.subgraph_id),
                    };
                    staged.try_reserve(1)?;
                    staged.push(copy);
                    staged.len() - 1
                }
            };

            let list = staged[index]
                .list_mut(class)
                .ok_or_else(|| Error::bad_param("unsupported parameter class"))?;
            match list
                .iter_mut()
                .find(|o| o.module_iid == item.module_iid && o.param_id == item.param_id)
            {
                Some(slot) => {
                    slot.payload = item.payload.clone();
                    summary.replaced += 1;
                }
                None => {
                    list.try_reserve(1)?;
                    list.push(ModuleCalOverride {
                        module_iid: item.module_iid,
                        param_id: item.param_id,
                        payload: item.payload.clone(),
                    });
                    summary.appended += 1;
                }
            }
        }

        if staged.is_empty() {
            return Ok(summary);
        }

        let staged_new_size: usize = staged.iter().map(SubgraphDelta::payload_size).sum();
        let new_subgraphs = staged
            .iter()
            .filter(|s| existing.and_then(|map| map.subgraph(s.subgraph_id)).is_none())
            .count();

        let map = self.reserve_delta_map(domain, key_vector, new_subgraphs)?;

        // Commit
        for delta in staged {
            match map.subgraphs.iter_mut().find(|s| s.subgraph_id == delta.subgraph_id) {
                Some(slot) => *slot = delta,
                None => map.subgraphs.push(delta),
            }
        }
        map.size = map.size - staged_old_size + staged_new_size;
        let map_size = map.size;
        self.total_size = self.total_size - staged_old_size + staged_new_size;

        debug!(
            "Heap {} {}: {} replaced, {} appended, {} dropped, {} bytes",
            domain, key_vector, summary.replaced, summary.appended, summary.dropped, map_size
        );
        Ok(summary)
    }

    /// Delta map for `(domain, key_vector)` with room for `additional` subgraphs
    ///
    /// A missing map is built and reserved off-heap; linking it in is the
    /// last step and cannot fail.
    fn reserve_delta_map(
        &mut self,
        domain: KeyVectorDomain,
        key_vector: &KeyVector,
        additional: usize,
    ) -> Result<&mut DeltaMap> {
        if self.delta_map(domain, key_vector).is_none() {
            let mut fresh = DeltaMap::new(domain, key_vector.clone());
            fresh.subgraphs.try_reserve(additional)?;
            match self.maps.get_mut(&domain) {
                Some(domain_maps) => {
                    domain_maps.try_reserve(1)?;
                    domain_maps.insert(key_vector.clone(), fresh);
                }
                None => {
                    let mut domain_maps = AHashMap::new();
                    domain_maps.try_reserve(1)?;
                    self.maps.try_reserve(1)?;
                    domain_maps.insert(key_vector.clone(), fresh);
                    self.maps.insert(domain, domain_maps);
                }
            }
        }

        let map = self
            .maps
            .get_mut(&domain)
            .and_then(|domain_maps| domain_maps.get_mut(key_vector))
            .ok_or_else(|| Error::not_exist(format!("delta map {} {}", domain, key_vector)))?;
        map.subgraphs.try_reserve(additional)?;
        Ok(map)
    }

    pub fn delta_maps(&self) -> impl Iterator<Item = &DeltaMap> {
        self.maps.values().flat_map(|maps| maps.values())
    }

    /// Number of delta maps
    pub fn len(&self) -> usize {
        self.maps.values().map(|maps| maps.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payload bytes held across all delta maps
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn clear(&mut self) {
        self.maps.clear();
        self.total_size = 0;
    }
}
