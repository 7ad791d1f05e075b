//! # Database File Tests
//!
//! This test suite verifies:
//! - Builder output opens through the memory-mapped reader
//! - Header and chunk directory validation
//! - Layout validation in the builder
//! - Large randomized graph tables through the partitioned search path

mod common;

use std::fs;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use acdb_core::config::SearchConfig;
use acdb_core::KeyVector;
use acdb_storage::file::{
    ChunkId, DatabaseBuilder, DatabaseFile, DatabaseLayout, FileSource, FileWriter, ParamSpec,
    WordBuffer, HEADER_FIXED_SIZE,
};
use acdb_storage::Matcher;

use common::*;

#[test]
fn test_write_then_open_mapped() {
    let dir = TempDir::new().unwrap();
    let path = write_scenario(dir.path(), 3);

    let file = DatabaseFile::open(&path, true).unwrap();
    assert_eq!(file.path(), Some(path.as_path()));
    assert_eq!(file.directory().len(), 17);
    assert!(file.has_chunk(ChunkId::DATA_POOL));
    assert!(!file.has_chunk(ChunkId(*b"NONE")));

    let properties = file.properties().unwrap();
    assert_eq!(properties.database_id, 3);
    assert_eq!(properties.vm_id, 2);
    assert_eq!(properties.subgraph_id_min, 10);
    assert_eq!(properties.subgraph_id_max, 12);
    assert!(properties.owns_subgraph(11));
    assert!(!properties.owns_subgraph(13));
    assert!(properties.shared_subgraphs.is_empty());
}

#[test]
fn test_chunks_are_word_aligned_and_in_bounds() {
    let file = scenario_database();
    for info in file.directory().entries() {
        assert_eq!(info.offset % 4, 0, "chunk {}", info.id);
        assert_eq!(info.size % 4, 0, "chunk {}", info.id);
        assert!(info.end() <= file.len());
    }
}

#[test]
fn test_missing_chunk_is_not_exist() {
    let file = scenario_database();
    let err = file.chunk_info(ChunkId(*b"ZZZZ")).unwrap_err();
    assert!(err.is_not_exist());
}

#[test]
fn test_bad_magic_rejected() {
    let mut bytes = scenario_builder(0).build().unwrap();
    bytes[0] = b'X';
    let err = DatabaseFile::from_bytes(bytes, true).unwrap_err();
    assert_eq!(err.error_code(), "EFAILED");
}

#[test]
fn test_truncated_file_rejected() {
    let bytes = scenario_builder(0).build().unwrap();
    let err = DatabaseFile::from_bytes(bytes[..bytes.len() - 8].to_vec(), true).unwrap_err();
    assert_eq!(err.error_code(), "EFAILED");

    let err = DatabaseFile::from_bytes(bytes[..10].to_vec(), true).unwrap_err();
    assert_eq!(err.error_code(), "EFAILED");
}

#[test]
fn test_directory_checksum() {
    let mut bytes = scenario_builder(0).build().unwrap();
    let chunk_count = u32::from_le_bytes(bytes[8..12].try_into().unwrap()) as usize;
    let crc_at = HEADER_FIXED_SIZE + chunk_count * 12;
    bytes[crc_at] ^= 0x5A;

    let err = DatabaseFile::from_bytes(bytes.clone(), true).unwrap_err();
    assert!(err.to_string().contains("checksum"));
    assert!(DatabaseFile::from_bytes(bytes, false).is_ok());
}

#[test]
fn test_mmap_open_reports_corruption() {
    let dir = TempDir::new().unwrap();
    let path = write_scenario(dir.path(), 0);
    let mut bytes = fs::read(&path).unwrap();
    bytes[4] = 9;
    fs::write(&path, bytes).unwrap();

    let err = DatabaseFile::open(&path, true).unwrap_err();
    assert!(err.to_string().contains("version"));
}

#[test]
fn test_writer_rejects_bad_chunks() {
    let mut writer = FileWriter::new();
    writer.add_chunk(ChunkId::PROPERTIES, vec![0; 16]).unwrap();
    assert_eq!(
        writer.add_chunk(ChunkId::PROPERTIES, vec![0; 16]).unwrap_err().error_code(),
        "BADPARAM"
    );
    assert_eq!(
        writer.add_chunk(ChunkId::DATA_POOL, vec![0; 6]).unwrap_err().error_code(),
        "BADPARAM"
    );
    assert_eq!(writer.chunk_count(), 1);
}

#[test]
fn test_word_buffer_padding() {
    let mut buffer = WordBuffer::new();
    buffer.push(7);
    assert_eq!(buffer.offset(), 4);
    buffer.push_bytes_padded(b"abcde");
    assert_eq!(buffer.len(), 12);
    assert_eq!(&buffer.into_vec()[4..12], b"abcde\0\0\0");
}

#[test]
fn test_builder_rejects_two_default_variants() {
    let mut layout = scenario_builder(0).layout().clone();
    let subgraph = layout.subgraphs.iter_mut().find(|s| s.id == 10).unwrap();
    let default = subgraph.calibration.iter().find(|v| v.key_ids.is_empty()).unwrap().clone();
    subgraph.calibration.push(default);

    let err = DatabaseBuilder::from_layout(layout).build().unwrap_err();
    assert_eq!(err.error_code(), "BADPARAM");
}

#[test]
fn test_builder_rejects_duplicate_graph() {
    let mut builder = scenario_builder(0);
    builder.graph(&gkv(1), &[10]);
    assert_eq!(builder.build().unwrap_err().error_code(), "BADPARAM");
}

#[test]
fn test_builder_rejects_misaligned_values() {
    let mut layout = scenario_builder(0).layout().clone();
    let subgraph = layout.subgraphs.iter_mut().find(|s| s.id == 10).unwrap();
    let variant = subgraph.calibration.iter_mut().find(|v| !v.key_ids.is_empty()).unwrap();
    variant.entries[0].values.push(1);

    let err = DatabaseBuilder::from_layout(layout).build().unwrap_err();
    assert_eq!(err.error_code(), "BADPARAM");
}

#[test]
fn test_builder_rejects_repeated_param_in_entry() {
    let mut builder = DatabaseBuilder::new(0);
    builder.graph(&gkv(1), &[1]).module(1, 0x10, 1).calibration(
        1,
        &KeyVector::empty(),
        vec![ParamSpec::new(0x10, 1, vec![1u8]), ParamSpec::new(0x10, 1, vec![2u8])],
    );
    assert_eq!(builder.build().unwrap_err().error_code(), "BADPARAM");
}

#[test]
fn test_layout_json_round_trip() {
    let layout = scenario_builder(5).layout().clone();
    let json = serde_json::to_string_pretty(&layout).unwrap();
    let parsed: DatabaseLayout = serde_json::from_str(&json).unwrap();

    let original = scenario_builder(5).build().unwrap();
    let rebuilt = DatabaseBuilder::from_layout(parsed).build().unwrap();
    assert_eq!(original, rebuilt);
}

#[test]
fn test_build_is_order_independent() {
    let mut forward = DatabaseBuilder::new(1);
    let mut backward = DatabaseBuilder::new(1);
    let graphs: Vec<(u32, u32)> = (0..20).map(|i| (i, 100 + i)).collect();
    for &(value, subgraph) in &graphs {
        forward.graph(&gkv(value), &[subgraph]);
    }
    for &(value, subgraph) in graphs.iter().rev() {
        backward.graph(&gkv(value), &[subgraph]);
    }
    forward.subgraph_range(100, 119);
    backward.subgraph_range(100, 119);

    let forward = DatabaseFile::from_bytes(forward.build().unwrap(), true).unwrap();
    let backward = DatabaseFile::from_bytes(backward.build().unwrap(), true).unwrap();
    let config = SearchConfig::default();
    for &(value, subgraph) in &graphs {
        let a = Matcher::new(&forward, &config).match_graph(&gkv(value)).unwrap();
        let b = Matcher::new(&backward, &config).match_graph(&gkv(value)).unwrap();
        assert_eq!(a.subgraphs, vec![subgraph]);
        assert_eq!(a, b);
    }
}

#[test]
fn test_large_random_graph_table_partitioned() {
    let mut rng = StdRng::seed_from_u64(0xACDB);
    let mut builder = DatabaseBuilder::new(0);
    let mut expected = Vec::new();
    let mut used = std::collections::HashSet::new();

    while expected.len() < 2000 {
        let a = rng.gen_range(0..10_000u32);
        let b = rng.gen_range(0..4u32);
        if !used.insert((a, b)) {
            continue;
        }
        let subgraph = rng.gen_range(1..500u32);
        let kv = KeyVector::from_pairs(&[(0xB1, b), (0xB0, a)]);
        builder.graph(&kv, &[subgraph]);
        expected.push((kv, subgraph));
    }
    let file = DatabaseFile::from_bytes(builder.build().unwrap(), true).unwrap();

    // Force partitioned search with a scratch buffer that is not a stride multiple
    let config = SearchConfig {
        scratch_buffer_size: 1000,
        partition_threshold: 256,
    };
    let matcher = Matcher::new(&file, &config);
    for (kv, subgraph) in expected.iter().step_by(7) {
        let graph = matcher.match_graph(kv).unwrap();
        assert_eq!(graph.subgraphs, vec![*subgraph]);
    }

    let miss = KeyVector::from_pairs(&[(0xB0, 20_000), (0xB1, 0)]);
    assert!(matcher.match_graph(&miss).unwrap_err().is_not_exist());
}
