//! Shared database fixtures for the storage integration tests
#![allow(dead_code)]

use std::path::{Path, PathBuf};

use acdb_core::{Config, KeyVector};
use acdb_storage::file::{DatabaseBuilder, DatabaseFile, ParamSpec};
use acdb_storage::CalibrationStore;

pub const GKV_KEY: u32 = 0xA0;
pub const CKV_KEY: u32 = 0xC1;
pub const TKV_KEY: u32 = 0xD1;
pub const TAG_ID: u32 = 0x7A;

pub const MODULE_A: u32 = 0x100;
pub const MODULE_B: u32 = 0x200;
pub const MODULE_C: u32 = 0x300;
pub const PARAM_A: u32 = 0x01;
pub const PARAM_B: u32 = 0x02;
pub const PARAM_TAG: u32 = 0x05;

pub const PAYLOAD_X: &[u8] = b"XXXX";
pub const PAYLOAD_Y: &[u8] = b"YYYYYYYY";
pub const PAYLOAD_B: &[u8] = b"ZZ";
pub const PAYLOAD_TAG: &[u8] = b"TAG1";

pub const DRIVER_MODULE: u32 = 0x7001;

pub fn gkv(value: u32) -> KeyVector {
    KeyVector::from_pairs(&[(GKV_KEY, value)])
}

pub fn ckv(value: u32) -> KeyVector {
    KeyVector::from_pairs(&[(CKV_KEY, value)])
}

pub fn tkv(value: u32) -> KeyVector {
    KeyVector::from_pairs(&[(TKV_KEY, value)])
}

/// Graph `gkv(1)` over subgraphs 10, 11 and 12:
/// - 10: module A, default variant X and `[(CKV_KEY, 5)]` variant Y
/// - 11: module B, default variant only, plus tag data under `tkv(1)`
/// - 12: module C, no calibration
pub fn scenario_builder(database_id: u32) -> DatabaseBuilder {
    let mut builder = DatabaseBuilder::new(database_id);
    builder
        .vm_id(0x2)
        .graph(&gkv(1), &[10, 11, 12])
        .graph(&KeyVector::from_pairs(&[(GKV_KEY, 2), (0xA1, 1)]), &[11])
        .module(10, MODULE_A, 0x7001)
        .module(11, MODULE_B, 0x7002)
        .module(12, MODULE_C, 0x7003)
        .calibration(10, &KeyVector::empty(), vec![ParamSpec::new(MODULE_A, PARAM_A, PAYLOAD_X)])
        .calibration(10, &ckv(5), vec![ParamSpec::new(MODULE_A, PARAM_A, PAYLOAD_Y)])
        .calibration(11, &KeyVector::empty(), vec![ParamSpec::new(MODULE_B, PARAM_B, PAYLOAD_B)])
        .tag(11, TAG_ID, &tkv(1), vec![ParamSpec::new(MODULE_B, PARAM_TAG, PAYLOAD_TAG)])
        .driver_module(DRIVER_MODULE, 1, b"drv-b".to_vec())
        .driver_module(DRIVER_MODULE, 0, b"drv-a".to_vec())
        .driver_module(0x7002, 0, b"drv-c".to_vec());
    builder
}

pub fn scenario_database() -> DatabaseFile {
    DatabaseFile::from_bytes(scenario_builder(0).build().unwrap(), true).unwrap()
}

pub fn write_scenario(dir: &Path, database_id: u32) -> PathBuf {
    let path = dir.join(format!("scenario_{}.acdb", database_id));
    scenario_builder(database_id).write_to(&path).unwrap();
    path
}

pub fn scenario_store(config: Config) -> CalibrationStore {
    let store = CalibrationStore::new(config).unwrap();
    store.add_database_file(scenario_database()).unwrap();
    store
}
