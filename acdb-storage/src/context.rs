//! # Database Contexts
//!
//! A [`DatabaseContext`] is one loaded database: its mapped file, its
//! properties and its own heap. The [`ContextManager`] keeps up to 16 of
//! them in fixed registry slots.
//!
//! There is no "current" database. Every selection returns an
//! `Arc<DatabaseContext>` that the caller passes to the lookups it makes;
//! the `Arc` stays valid after the database is removed from the registry.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use acdb_core::config::{Config, SearchConfig};
use acdb_core::error::{Error, OptionalExt, Result};
use acdb_core::metrics::Metrics;
use acdb_core::types::{subgraph_database_id, GraphInfo, KeyVector, ModuleId, ModuleInstanceId, SubgraphId};

use crate::delta_file::DeltaFile;
use crate::file::{ChunkId, DatabaseFile, DatabaseProperties, FileSource};
use crate::heap::{Heap, SubgraphMembership};
use crate::matcher::Matcher;
use crate::table::{DriverModuleRecord, RecordLayout, SearchMode, SubgraphModuleRecord, TableHit, TableSearcher};

/// Handle returned when a database is loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DatabaseHandle(pub u32);

impl fmt::Display for DatabaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "db#{}", self.0)
    }
}

impl<S: FileSource + ?Sized> SubgraphMembership for TableSearcher<'_, S> {
    fn contains_module(&self, subgraph_id: SubgraphId, module_iid: ModuleInstanceId) -> Result<bool> {
        Ok(self
            .find::<SubgraphModuleRecord>(ChunkId::SUBGRAPH_MODULES, &[subgraph_id, module_iid], SearchMode::Any)
            .optional()?
            .is_some())
    }
}

/// One loaded database
#[derive(Debug)]
pub struct DatabaseContext {
    handle: DatabaseHandle,
    slot: usize,
    properties: DatabaseProperties,
    file: DatabaseFile,
    heap: RwLock<Heap>,
    delta_file: DeltaFile,
    search: SearchConfig,
}

impl DatabaseContext {
    fn new(handle: DatabaseHandle, slot: usize, file: DatabaseFile, config: &Config) -> Result<Self> {
        let properties = file.properties()?;
        let delta_file = DeltaFile::for_database(&config.delta, properties.database_id);

        let mut heap = Heap::new();
        if delta_file.is_persist_enabled() {
            let searcher = TableSearcher::new(&file, &config.search);
            for map in delta_file.load()? {
                for (class, data) in map.by_class() {
                    heap.set_override(map.domain, &map.key_vector, &data, class, &searcher)?;
                }
            }
            debug!(
                "Replayed {} delta maps into database {:#x}",
                heap.len(),
                properties.database_id
            );
        }

        Ok(Self {
            handle,
            slot,
            properties,
            file,
            heap: RwLock::new(heap),
            delta_file,
            search: config.search.clone(),
        })
    }

    pub fn handle(&self) -> DatabaseHandle {
        self.handle
    }

    /// Registry slot index
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn properties(&self) -> &DatabaseProperties {
        &self.properties
    }

    pub fn database_id(&self) -> u32 {
        self.properties.database_id
    }

    pub fn vm_id(&self) -> u32 {
        self.properties.vm_id
    }

    pub fn file(&self) -> &DatabaseFile {
        &self.file
    }

    pub fn delta_file(&self) -> &DeltaFile {
        &self.delta_file
    }

    pub fn searcher(&self) -> TableSearcher<'_, DatabaseFile> {
        TableSearcher::new(&self.file, &self.search)
    }

    pub fn matcher(&self) -> Matcher<'_, DatabaseFile> {
        Matcher::new(&self.file, &self.search)
    }

    /// Search one table of this database's file
    pub fn search_table(
        &self,
        table_offset: u64,
        table_size: u64,
        layout: &RecordLayout,
        key: &[u32],
        mode: SearchMode,
    ) -> Result<TableHit> {
        self.searcher().search(table_offset, table_size, layout, key, mode)
    }

    pub fn heap(&self) -> RwLockReadGuard<'_, Heap> {
        self.heap.read()
    }

    pub fn heap_mut(&self) -> RwLockWriteGuard<'_, Heap> {
        self.heap.write()
    }

    pub fn match_graph(&self, gkv: &KeyVector) -> Result<GraphInfo> {
        self.matcher().match_graph(gkv)
    }

    pub fn owns_subgraph(&self, subgraph_id: SubgraphId) -> bool {
        self.properties.owns_subgraph(subgraph_id)
    }

    pub fn contains_module(&self, subgraph_id: SubgraphId, module_iid: ModuleInstanceId) -> Result<bool> {
        self.searcher().contains_module(subgraph_id, module_iid)
    }

    /// First driver-module record for `module_id`
    pub fn find_driver_module(&self, module_id: ModuleId) -> Result<DriverModuleRecord> {
        self.searcher()
            .find(ChunkId::DRIVER_MODULES, &[module_id], SearchMode::First)
    }

    pub fn driver_module_payload(&self, module_id: ModuleId) -> Result<Bytes> {
        let record = self.find_driver_module(module_id)?;
        let payload = self.matcher().read_payload(record.pool_offset)?;
        Ok(Bytes::copy_from_slice(payload))
    }

    /// Save the heap when persistence is enabled; returns bytes written
    pub fn persist_heap(&self) -> Result<Option<u64>> {
        if !self.delta_file.is_persist_enabled() {
            return Ok(None);
        }
        let heap = self.heap.read();
        self.delta_file.save(&heap).map(Some)
    }
}

impl SubgraphMembership for DatabaseContext {
    fn contains_module(&self, subgraph_id: SubgraphId, module_iid: ModuleInstanceId) -> Result<bool> {
        DatabaseContext::contains_module(self, subgraph_id, module_iid)
    }
}

/// Registry of loaded databases
pub struct ContextManager {
    slots: RwLock<Vec<Option<Arc<DatabaseContext>>>>,
    next_handle: AtomicU32,
    config: Config,
    metrics: Metrics,
}

impl ContextManager {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_metrics(config, Metrics::new())
    }

    pub fn with_metrics(config: Config, metrics: Metrics) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            slots: RwLock::new(vec![None; config.database.max_databases]),
            next_handle: AtomicU32::new(1),
            config,
            metrics,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Memory-map and register a database file
    pub fn add_database(&self, path: impl AsRef<Path>) -> Result<DatabaseHandle> {
        let file = DatabaseFile::open(path, self.config.database.verify_checksum)?;
        self.add_database_file(file)
    }

    pub fn add_database_file(&self, file: DatabaseFile) -> Result<DatabaseHandle> {
        let properties = file.properties()?;
        let mut slots = self.slots.write();

        if slots.iter().flatten().any(|c| c.database_id() == properties.database_id) {
            return Err(Error::bad_param(format!(
                "database {:#x} is already loaded",
                properties.database_id
            )));
        }
        let slot = slots
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| Error::ResourceExhausted {
                resource: format!("database registry full ({} slots)", slots.len()),
            })?;

        let handle = DatabaseHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let context = DatabaseContext::new(handle, slot, file, &self.config)?;
        info!(
            "Loaded database {:#x} as {} in slot {} (vm {:#x}, subgraphs {:#x}..={:#x})",
            context.database_id(),
            handle,
            slot,
            context.vm_id(),
            context.properties().subgraph_id_min,
            context.properties().subgraph_id_max
        );
        slots[slot] = Some(Arc::new(context));

        self.metrics.update_databases(slots.iter().flatten().count() as u64);
        Ok(handle)
    }

    /// Drop a database from the registry; outstanding `Arc`s stay usable
    pub fn remove_database(&self, handle: DatabaseHandle) -> Result<()> {
        let mut slots = self.slots.write();
        let slot = slots
            .iter_mut()
            .find(|s| s.as_ref().map_or(false, |c| c.handle() == handle))
            .ok_or_else(|| Error::not_exist(format!("database {}", handle)))?;
        if let Some(context) = slot.take() {
            info!("Unloaded database {:#x} ({})", context.database_id(), handle);
        }

        self.metrics.update_databases(slots.iter().flatten().count() as u64);
        Ok(())
    }

    /// Number of loaded databases
    pub fn len(&self) -> usize {
        self.slots.read().iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Loaded contexts in slot order
    pub fn contexts(&self) -> Vec<Arc<DatabaseContext>> {
        self.slots.read().iter().flatten().cloned().collect()
    }

    pub fn select_by_handle(&self, handle: DatabaseHandle) -> Result<Arc<DatabaseContext>> {
        self.contexts()
            .into_iter()
            .find(|c| c.handle() == handle)
            .ok_or_else(|| Error::not_exist(format!("database {}", handle)))
    }

    pub fn select_by_index(&self, index: usize) -> Result<Arc<DatabaseContext>> {
        let slots = self.slots.read();
        let slot = slots.get(index).ok_or_else(|| {
            Error::bad_param(format!("slot {} out of range 0..{}", index, slots.len()))
        })?;
        slot.clone()
            .ok_or_else(|| Error::not_exist(format!("database in slot {}", index)))
    }

    /// First database that resolves `gkv`
    pub fn select_by_gkv(&self, gkv: &KeyVector) -> Result<(Arc<DatabaseContext>, GraphInfo)> {
        for context in self.contexts() {
            if let Some(info) = context.match_graph(gkv).optional()? {
                debug!("GKV {} selected database {:#x}", gkv, context.database_id());
                return Ok((context, info));
            }
        }
        Err(Error::not_exist(format!("no loaded database resolves gkv {}", gkv)))
    }

    /// Database owning every subgraph in `subgraph_ids`
    ///
    /// A single loaded database is selected unconditionally. A single id is
    /// routed by the database id embedded in it. Graphs spanning databases
    /// are not supported.
    pub fn select_by_subgraphs(&self, subgraph_ids: &[SubgraphId]) -> Result<Arc<DatabaseContext>> {
        if subgraph_ids.is_empty() {
            return Err(Error::bad_param("empty subgraph list"));
        }

        let contexts = self.contexts();
        if contexts.len() == 1 {
            return Ok(contexts[0].clone());
        }

        let found = if let [subgraph_id] = subgraph_ids {
            let database_id = subgraph_database_id(*subgraph_id);
            contexts.into_iter().find(|c| c.database_id() == database_id)
        } else {
            contexts
                .into_iter()
                .find(|c| subgraph_ids.iter().all(|&id| c.owns_subgraph(id)))
        };

        found.ok_or_else(|| {
            Error::not_exist(format!("no single database owns subgraphs {:x?}", subgraph_ids))
        })
    }

    /// First database whose driver-module table lists `module_id`
    pub fn select_by_driver_module(&self, module_id: ModuleId) -> Result<Arc<DatabaseContext>> {
        for context in self.contexts() {
            if context.find_driver_module(module_id).optional()?.is_some() {
                return Ok(context);
            }
        }
        Err(Error::not_exist(format!("driver module {:#x}", module_id)))
    }
}

impl fmt::Debug for ContextManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextManager")
            .field("databases", &self.len())
            .field("capacity", &self.config.database.max_databases)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{DatabaseBuilder, ParamSpec};

    fn database(id: u32, subgraphs: &[u32]) -> DatabaseFile {
        let mut builder = DatabaseBuilder::new(id);
        builder.graph(&KeyVector::from_pairs(&[(0xA, id)]), subgraphs);
        for &sg in subgraphs {
            builder.module(sg, 0x100 + sg, 0x7000);
            builder.calibration(sg, &KeyVector::empty(), vec![ParamSpec::new(0x100 + sg, 1, vec![0u8; 4])]);
        }
        DatabaseFile::from_bytes(builder.build().unwrap(), true).unwrap()
    }

    #[test]
    fn test_duplicate_database_id_rejected() {
        let manager = ContextManager::new(Config::default()).unwrap();
        manager.add_database_file(database(1, &[10])).unwrap();
        let err = manager.add_database_file(database(1, &[20])).unwrap_err();
        assert_eq!(err.error_code(), "BADPARAM");
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_registry_capacity() {
        let mut config = Config::default();
        config.database.max_databases = 2;
        let manager = ContextManager::new(config).unwrap();
        manager.add_database_file(database(1, &[10])).unwrap();
        manager.add_database_file(database(2, &[20])).unwrap();
        let err = manager.add_database_file(database(3, &[30])).unwrap_err();
        assert_eq!(err.error_code(), "RESOURCE_EXHAUSTED");
    }

    #[test]
    fn test_select_by_index_and_remove() {
        let manager = ContextManager::new(Config::default()).unwrap();
        let handle = manager.add_database_file(database(1, &[10])).unwrap();

        let context = manager.select_by_index(0).unwrap();
        assert_eq!(context.handle(), handle);
        assert!(manager.select_by_index(1).unwrap_err().is_not_exist());
        assert_eq!(manager.select_by_index(16).unwrap_err().error_code(), "BADPARAM");

        manager.remove_database(handle).unwrap();
        assert!(manager.is_empty());
        assert!(manager.remove_database(handle).unwrap_err().is_not_exist());
        // The context outlives its registry slot
        assert_eq!(context.database_id(), 1);
    }

    #[test]
    fn test_membership_lookup() {
        let manager = ContextManager::new(Config::default()).unwrap();
        manager.add_database_file(database(1, &[10, 11])).unwrap();
        let context = manager.select_by_index(0).unwrap();
        assert!(context.contains_module(10, 0x10A).unwrap());
        assert!(!context.contains_module(10, 0x10B).unwrap());
        assert!(context.contains_module(11, 0x10B).unwrap());
    }
}
