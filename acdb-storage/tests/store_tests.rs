//! # Calibration Store Tests
//!
//! This test suite verifies:
//! - Two-call retrieval protocol and blob packing
//! - Heap overrides layered over file payloads
//! - Routing of set data to the owning calibration variant
//! - Delta persistence across store instances
//! - Lookup metrics

mod common;

use tempfile::TempDir;

use acdb_core::{Config, Error, KeyVector, KeyVectorDomain, ParamClass, SubgraphParamData};
use acdb_storage::{unpack_blob, BlobEntry, CalibrationStore};

use common::*;

fn fetch_calibration(store: &CalibrationStore, gkv: &KeyVector, new: &KeyVector, prior: &KeyVector) -> Vec<BlobEntry> {
    let size = store.get_calibration(gkv, new, prior, None).unwrap();
    let mut out = vec![0u8; size];
    let written = store.get_calibration(gkv, new, prior, Some(&mut out)).unwrap();
    assert_eq!(written, size);
    unpack_blob(&out).unwrap()
}

fn summary(entries: &[BlobEntry]) -> Vec<(u32, u32, Vec<u8>)> {
    entries
        .iter()
        .map(|e| (e.module_iid, e.param_id, e.payload.to_vec()))
        .collect()
}

fn override_a(payload: &'static [u8]) -> Vec<SubgraphParamData> {
    vec![SubgraphParamData::new(10, MODULE_A, PARAM_A, payload)]
}

#[test]
fn test_get_calibration_first_time() {
    let store = scenario_store(Config::default());
    let entries = fetch_calibration(&store, &gkv(1), &ckv(5), &KeyVector::empty());

    assert_eq!(
        summary(&entries),
        vec![
            (MODULE_A, PARAM_A, PAYLOAD_Y.to_vec()),
            (MODULE_B, PARAM_B, PAYLOAD_B.to_vec()),
        ]
    );
    assert!(entries.iter().all(|e| e.error_code == 0));
}

#[test]
fn test_two_call_protocol() {
    let store = scenario_store(Config::default());
    let required = store.get_calibration(&gkv(1), &ckv(5), &KeyVector::empty(), None).unwrap();
    // 16 + 8 for Y, 16 + 4 for the padded two-byte default
    assert_eq!(required, 44);

    let mut small = vec![0u8; 10];
    match store.get_calibration(&gkv(1), &ckv(5), &KeyVector::empty(), Some(&mut small)) {
        Err(Error::NeedMore { required, provided }) => {
            assert_eq!(required, 44);
            assert_eq!(provided, 10);
        }
        other => panic!("expected NeedMore, got {:?}", other),
    }
    assert_eq!(store.metrics().snapshot().bytes_served, 0);
}

#[test]
fn test_delta_calibration() {
    let store = scenario_store(Config::default());

    let entries = fetch_calibration(&store, &gkv(1), &ckv(5), &ckv(7));
    assert_eq!(summary(&entries), vec![(MODULE_A, PARAM_A, PAYLOAD_Y.to_vec())]);

    let err = store.get_calibration(&gkv(1), &ckv(5), &ckv(5), None).unwrap_err();
    assert!(err.is_not_exist());
}

#[test]
fn test_unknown_graph_records_miss() {
    let store = scenario_store(Config::default());
    let err = store.get_calibration(&gkv(9), &ckv(5), &KeyVector::empty(), None).unwrap_err();
    assert!(err.is_not_exist());

    let snapshot = store.metrics().snapshot();
    assert_eq!(snapshot.lookups, 1);
    assert_eq!(snapshot.lookup_misses, 1);
}

#[test]
fn test_set_routes_to_matching_variant() {
    let store = scenario_store(Config::default());
    let result = store
        .set_calibration(&gkv(1), &ckv(5), &override_a(b"NEW!"), ParamClass::NonGlobal)
        .unwrap();
    assert_eq!(result.appended, 1);
    assert_eq!(result.dropped, 0);

    let entries = fetch_calibration(&store, &gkv(1), &ckv(5), &KeyVector::empty());
    assert_eq!(entries[0].payload.as_ref(), b"NEW!");
    // The default variant is untouched
    let entries = fetch_calibration(&store, &gkv(1), &ckv(7), &KeyVector::empty());
    assert_eq!(entries[0].payload.as_ref(), PAYLOAD_X);

    let (context, _) = store.manager().select_by_gkv(&gkv(1)).unwrap();
    let heap = context.heap();
    assert_eq!(heap.len(), 1);
    let map = heap.delta_map(KeyVectorDomain::Calibration, &ckv(5)).unwrap();
    assert_eq!(map.subgraph_count(), 1);
    assert_eq!(map.size(), 4);
}

#[test]
fn test_set_falls_back_to_default_variant() {
    let store = scenario_store(Config::default());
    store
        .set_calibration(&gkv(1), &ckv(7), &override_a(b"DFLT"), ParamClass::NonGlobal)
        .unwrap();

    // Any CKV that lands on the default variant sees the override
    for value in [7, 9] {
        let entries = fetch_calibration(&store, &gkv(1), &ckv(value), &KeyVector::empty());
        assert_eq!(entries[0].payload.as_ref(), b"DFLT");
    }
    let entries = fetch_calibration(&store, &gkv(1), &ckv(5), &KeyVector::empty());
    assert_eq!(entries[0].payload.as_ref(), PAYLOAD_Y);
}

#[test]
fn test_set_replaces_instead_of_duplicating() {
    let store = scenario_store(Config::default());
    store
        .set_calibration(&gkv(1), &ckv(5), &override_a(b"one"), ParamClass::NonGlobal)
        .unwrap();
    let result = store
        .set_calibration(&gkv(1), &ckv(5), &override_a(b"second"), ParamClass::NonGlobal)
        .unwrap();
    assert_eq!((result.replaced, result.appended), (1, 0));

    let entries = fetch_calibration(&store, &gkv(1), &ckv(5), &KeyVector::empty());
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].payload.as_ref(), b"second");
}

#[test]
fn test_set_drops_foreign_tuples() {
    let store = scenario_store(Config::default());
    let data = vec![
        // Not in the graph
        SubgraphParamData::new(99, MODULE_A, PARAM_A, &b"a"[..]),
        // No variant defines this parameter
        SubgraphParamData::new(10, MODULE_A, 0x99, &b"b"[..]),
        // Module belongs to another subgraph
        SubgraphParamData::new(10, MODULE_B, PARAM_B, &b"c"[..]),
        // Subgraph without calibration
        SubgraphParamData::new(12, MODULE_C, PARAM_A, &b"d"[..]),
        SubgraphParamData::new(11, MODULE_B, PARAM_B, &b"ok"[..]),
    ];
    let result = store
        .set_calibration(&gkv(1), &ckv(5), &data, ParamClass::NonGlobal)
        .unwrap();
    assert_eq!(result.applied(), 1);
    assert_eq!(result.dropped, 4);

    let snapshot = store.metrics().snapshot();
    assert_eq!(snapshot.overrides_set, 1);
    assert_eq!(snapshot.overrides_dropped, 4);
}

#[test]
fn test_set_rejects_bad_requests() {
    let store = scenario_store(Config::default());
    let err = store
        .set_calibration(&gkv(1), &ckv(5), &override_a(b"x"), ParamClass::GlobalPersistent)
        .unwrap_err();
    assert_eq!(err.error_code(), "BADPARAM");

    let err = store
        .set_calibration(&gkv(1), &ckv(5), &[], ParamClass::NonGlobal)
        .unwrap_err();
    assert_eq!(err.error_code(), "BADPARAM");

    let err = store
        .set_calibration(&gkv(9), &ckv(5), &override_a(b"x"), ParamClass::NonGlobal)
        .unwrap_err();
    assert!(err.is_not_exist());

    let repeated = KeyVector::from_pairs(&[(CKV_KEY, 5), (CKV_KEY, 7)]);
    let err = store
        .set_calibration(&gkv(1), &repeated, &override_a(b"x"), ParamClass::NonGlobal)
        .unwrap_err();
    assert_eq!(err.error_code(), "BADPARAM");
    let err = store
        .get_calibration(&gkv(1), &repeated, &KeyVector::empty(), None)
        .unwrap_err();
    assert_eq!(err.error_code(), "BADPARAM");
}

#[test]
fn test_store_debug_output() {
    let store = scenario_store(Config::default());
    let rendered = format!("{:?}", store);
    assert!(rendered.starts_with("CalibrationStore"));
    assert!(rendered.contains("databases: 1"));
}

#[test]
fn test_global_overrides() {
    let store = scenario_store(Config::default());
    store
        .set_calibration(&gkv(1), &ckv(5), &override_a(b"GLOB"), ParamClass::Global)
        .unwrap();
    let entries = fetch_calibration(&store, &gkv(1), &ckv(5), &KeyVector::empty());
    assert_eq!(entries[0].payload.as_ref(), b"GLOB");

    // The ordinary list is consulted first
    store
        .set_calibration(&gkv(1), &ckv(5), &override_a(b"LOCL"), ParamClass::NonGlobal)
        .unwrap();
    let entries = fetch_calibration(&store, &gkv(1), &ckv(5), &KeyVector::empty());
    assert_eq!(entries[0].payload.as_ref(), b"LOCL");
}

#[test]
fn test_get_parameter() {
    let store = scenario_store(Config::default());
    let payload = store.get_parameter(&gkv(1), &ckv(5), 10, MODULE_A, PARAM_A).unwrap();
    assert_eq!(payload.as_ref(), PAYLOAD_Y);
    let payload = store.get_parameter(&gkv(1), &ckv(6), 10, MODULE_A, PARAM_A).unwrap();
    assert_eq!(payload.as_ref(), PAYLOAD_X);

    store
        .set_calibration(&gkv(1), &ckv(5), &override_a(b"NEW!"), ParamClass::NonGlobal)
        .unwrap();
    let payload = store.get_parameter(&gkv(1), &ckv(5), 10, MODULE_A, PARAM_A).unwrap();
    assert_eq!(payload.as_ref(), b"NEW!");

    assert!(store
        .get_parameter(&gkv(1), &ckv(5), 99, MODULE_A, PARAM_A)
        .unwrap_err()
        .is_not_exist());
    assert!(store
        .get_parameter(&gkv(1), &ckv(5), 12, MODULE_C, PARAM_A)
        .unwrap_err()
        .is_not_exist());
}

#[test]
fn test_get_tag_data() {
    let store = scenario_store(Config::default());
    let size = store.get_tag_data(&gkv(1), TAG_ID, &tkv(1), None).unwrap();
    assert_eq!(size, 20);

    let mut out = vec![0u8; size];
    store.get_tag_data(&gkv(1), TAG_ID, &tkv(1), Some(&mut out)).unwrap();
    let entries = unpack_blob(&out).unwrap();
    assert_eq!(summary(&entries), vec![(MODULE_B, PARAM_TAG, PAYLOAD_TAG.to_vec())]);

    assert!(store
        .get_tag_data(&gkv(1), TAG_ID, &tkv(2), None)
        .unwrap_err()
        .is_not_exist());
    assert!(store
        .get_tag_data(&gkv(1), 0x7B, &tkv(1), None)
        .unwrap_err()
        .is_not_exist());
}

#[test]
fn test_lookup_metrics() {
    let store = scenario_store(Config::default());
    store
        .set_calibration(&gkv(1), &ckv(5), &override_a(b"NEW!"), ParamClass::NonGlobal)
        .unwrap();
    fetch_calibration(&store, &gkv(1), &ckv(5), &KeyVector::empty());

    let snapshot = store.metrics().snapshot();
    // Size query and fill each resolve both parameters
    assert_eq!(snapshot.lookups, 2);
    assert_eq!(snapshot.heap_hits, 2);
    assert_eq!(snapshot.file_reads, 2);
    assert_eq!(snapshot.bytes_served, 40);
    assert_eq!(snapshot.delta_saves, 0);
    assert_eq!(snapshot.databases_loaded, 1);
}

#[test]
fn test_delta_persists_across_stores() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.delta.persist = true;
    config.delta.delta_dir = dir.path().to_path_buf();

    {
        let store = scenario_store(config.clone());
        store
            .set_calibration(&gkv(1), &ckv(5), &override_a(b"KEPT"), ParamClass::NonGlobal)
            .unwrap();
        store
            .set_calibration(
                &gkv(1),
                &ckv(7),
                &[SubgraphParamData::new(11, MODULE_B, PARAM_B, &b"GB"[..])],
                ParamClass::Global,
            )
            .unwrap();
        assert_eq!(store.metrics().snapshot().delta_saves, 2);

        let (context, _) = store.manager().select_by_gkv(&gkv(1)).unwrap();
        assert!(context.delta_file().path().exists());
    }

    let store = scenario_store(config);
    let entries = fetch_calibration(&store, &gkv(1), &ckv(5), &KeyVector::empty());
    assert_eq!(
        summary(&entries),
        vec![
            (MODULE_A, PARAM_A, b"KEPT".to_vec()),
            (MODULE_B, PARAM_B, b"GB".to_vec()),
        ]
    );
}

#[test]
fn test_persistence_disabled_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.delta.delta_dir = dir.path().to_path_buf();

    let store = scenario_store(config);
    store
        .set_calibration(&gkv(1), &ckv(5), &override_a(b"NEW!"), ParamClass::NonGlobal)
        .unwrap();
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
