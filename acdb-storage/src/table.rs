//! # Table Search Engine
//!
//! Binary search over sorted, fixed-stride tables of little-endian u32
//! records. A record's leading `key_words` words are its search key; tables
//! are sorted ascending by that key, lexicographically word by word.
//!
//! Three strategies share the same comparison:
//! - whole-table search over a zero-copy view of the mapped file,
//! - first-occurrence (lower bound) search for tables that allow duplicates,
//! - partitioned search that copies stride-aligned partitions into a
//!   caller-owned scratch buffer and searches each in turn.
//!
//! ```text
//! table:   |rec 0|rec 1|rec 2|rec 3|rec 4|rec 5|rec 6|
//! scratch: |<-- partition 0 -->|<-- partition 1 -->|<- p2 ->|
//!          records are never split across partitions
//! ```

use std::cmp::Ordering;

use byteorder::{ByteOrder, LittleEndian};
use tracing::trace;

use acdb_core::config::SearchConfig;
use acdb_core::error::{Error, Result};

use crate::file::{ChunkId, FileSource};

/// Shape of one table record in u32 words
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    stride_words: usize,
    key_words: usize,
}

impl RecordLayout {
    /// Layout for compile-time record types; callers guarantee `key_words <= stride_words`
    pub const fn fixed(stride_words: usize, key_words: usize) -> Self {
        Self {
            stride_words,
            key_words,
        }
    }

    /// Layout for records whose arity is only known at runtime
    pub fn new(stride_words: usize, key_words: usize) -> Result<Self> {
        if stride_words == 0 {
            return Err(Error::bad_param("record stride must be non-zero"));
        }
        if key_words > stride_words {
            return Err(Error::bad_param(format!(
                "search key of {} words is longer than the {}-word record",
                key_words, stride_words
            )));
        }
        Ok(Self::fixed(stride_words, key_words))
    }

    pub fn stride_words(&self) -> usize {
        self.stride_words
    }

    pub fn key_words(&self) -> usize {
        self.key_words
    }

    pub fn stride_bytes(&self) -> usize {
        self.stride_words * 4
    }
}

/// Typed view of a fixed-layout table record
pub trait TableRecord: Sized {
    const LAYOUT: RecordLayout;

    /// Decode from exactly `LAYOUT.stride_words()` words
    fn from_words(words: &[u32]) -> Self;

    /// The leading key words
    fn key(&self) -> Vec<u32>;
}

/// How to treat runs of equal keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Any record with a matching key
    Any,
    /// The first record with a matching key
    First,
}

/// A located record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableHit {
    /// Record index within the table
    pub index: usize,
    /// Byte offset of the record relative to the table start
    pub offset: u64,
    /// The record's words
    pub words: Vec<u32>,
}

impl TableHit {
    pub fn decode<R: TableRecord>(&self) -> R {
        R::from_words(&self.words)
    }

    /// Word `i` of the record, zero when out of range
    pub fn word(&self, i: usize) -> u32 {
        self.words.get(i).copied().unwrap_or(0)
    }
}

fn validate(table_size: u64, layout: &RecordLayout, key: &[u32]) -> Result<usize> {
    if table_size == 0 {
        return Err(Error::bad_param("table size is zero"));
    }
    if layout.stride_words == 0 {
        return Err(Error::bad_param("record stride must be non-zero"));
    }
    if key.len() != layout.key_words || key.len() > layout.stride_words {
        return Err(Error::bad_param(format!(
            "search key of {} words does not fit a layout keyed on {} of {} words",
            key.len(),
            layout.key_words,
            layout.stride_words
        )));
    }
    let stride = layout.stride_bytes() as u64;
    if table_size % stride != 0 {
        return Err(Error::bad_param(format!(
            "table size {} is not a multiple of the {}-byte stride",
            table_size, stride
        )));
    }
    Ok((table_size / stride) as usize)
}

#[inline]
fn compare_record(region: &[u8], layout: &RecordLayout, index: usize, key: &[u32]) -> Ordering {
    let base = index * layout.stride_bytes();
    for (i, &want) in key.iter().enumerate() {
        let at = base + i * 4;
        let word = LittleEndian::read_u32(&region[at..at + 4]);
        match word.cmp(&want) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// True when records are in ascending key order (equal keys allowed)
pub fn is_sorted(region: &[u8], layout: &RecordLayout) -> bool {
    let stride = layout.stride_bytes();
    if stride == 0 {
        return true;
    }
    let count = region.len() / stride;
    let mut previous = vec![0u32; layout.key_words];
    let mut current = vec![0u32; layout.key_words];
    for index in 0..count {
        let base = index * stride;
        LittleEndian::read_u32_into(&region[base..base + layout.key_words * 4], &mut current);
        if index > 0 && current < previous {
            return false;
        }
        std::mem::swap(&mut previous, &mut current);
    }
    true
}

fn record_words(region: &[u8], layout: &RecordLayout, index: usize) -> Vec<u32> {
    let base = index * layout.stride_bytes();
    let mut words = vec![0u32; layout.stride_words];
    LittleEndian::read_u32_into(&region[base..base + layout.stride_bytes()], &mut words);
    words
}

/// Search a region already validated to hold `count` whole records
fn search_records(
    region: &[u8],
    count: usize,
    layout: &RecordLayout,
    key: &[u32],
    mode: SearchMode,
) -> Option<usize> {
    debug_assert!(
        is_sorted(&region[..count * layout.stride_bytes()], layout),
        "table region is not sorted by its {}-word key",
        layout.key_words
    );

    match mode {
        SearchMode::Any => {
            let (mut lo, mut hi) = (0usize, count);
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                match compare_record(region, layout, mid, key) {
                    Ordering::Less => lo = mid + 1,
                    Ordering::Greater => hi = mid,
                    Ordering::Equal => return Some(mid),
                }
            }
            None
        }
        SearchMode::First => {
            let (mut lo, mut hi) = (0usize, count);
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                if compare_record(region, layout, mid, key) == Ordering::Less {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            (lo < count && compare_record(region, layout, lo, key) == Ordering::Equal).then_some(lo)
        }
    }
}

fn search_region(region: &[u8], layout: &RecordLayout, key: &[u32], mode: SearchMode) -> Result<TableHit> {
    let count = validate(region.len() as u64, layout, key)?;
    match search_records(region, count, layout, key, mode) {
        Some(index) => Ok(TableHit {
            index,
            offset: (index * layout.stride_bytes()) as u64,
            words: record_words(region, layout, index),
        }),
        None => Err(Error::not_exist(format!("record with key {:x?}", key))),
    }
}

/// Whole-table search over an in-memory view
pub fn search(region: &[u8], layout: &RecordLayout, key: &[u32]) -> Result<TableHit> {
    search_region(region, layout, key, SearchMode::Any)
}

/// Whole-table search returning the first record among equal keys
pub fn search_first(region: &[u8], layout: &RecordLayout, key: &[u32]) -> Result<TableHit> {
    search_region(region, layout, key, SearchMode::First)
}

/// Partition-by-partition search through `scratch`
///
/// Each partition is the largest whole number of records that fits in
/// `scratch`. Partitions are read in file order and every one is examined
/// before reporting `NotExist`.
pub fn search_partitioned<S: FileSource + ?Sized>(
    source: &S,
    table_offset: u64,
    table_size: u64,
    layout: &RecordLayout,
    key: &[u32],
    scratch: &mut [u8],
    mode: SearchMode,
) -> Result<TableHit> {
    validate(table_size, layout, key)?;
    let stride = layout.stride_bytes();
    let records_per_partition = scratch.len() / stride;
    if records_per_partition == 0 {
        return Err(Error::bad_param(format!(
            "scratch buffer of {} bytes cannot hold one {}-byte record",
            scratch.len(),
            stride
        )));
    }
    let partition_bytes = (records_per_partition * stride) as u64;
    let partitions = (table_size + partition_bytes - 1) / partition_bytes;

    let mut offset = table_offset;
    for partition in 0..partitions {
        let len = partition_bytes.min(table_size - partition * partition_bytes) as usize;
        let buffer = &mut scratch[..len];
        source.read_buffer(buffer, &mut offset)?;

        if let Some(local) = search_records(buffer, len / stride, layout, key, mode) {
            let index = partition as usize * records_per_partition + local;
            trace!("Partition {} of {} holds record {}", partition, partitions, index);
            return Ok(TableHit {
                index,
                offset: (index * stride) as u64,
                words: record_words(buffer, layout, local),
            });
        }
    }

    Err(Error::not_exist(format!("record with key {:x?}", key)))
}

/// Chooses a search strategy per table for one file
pub struct TableSearcher<'a, S: FileSource + ?Sized> {
    source: &'a S,
    scratch_size: usize,
    partition_threshold: usize,
}

impl<'a, S: FileSource + ?Sized> TableSearcher<'a, S> {
    pub fn new(source: &'a S, config: &SearchConfig) -> Self {
        Self {
            source,
            scratch_size: config.scratch_buffer_size,
            partition_threshold: config.partition_threshold,
        }
    }

    pub fn source(&self) -> &'a S {
        self.source
    }

    /// Search the table at an absolute file range
    ///
    /// Tables above the partition threshold go through a scratch buffer
    /// allocated for this call; smaller ones are searched in place.
    pub fn search(
        &self,
        table_offset: u64,
        table_size: u64,
        layout: &RecordLayout,
        key: &[u32],
        mode: SearchMode,
    ) -> Result<TableHit> {
        if table_size as usize > self.partition_threshold {
            let mut scratch = vec![0u8; self.scratch_size.max(layout.stride_bytes())];
            search_partitioned(self.source, table_offset, table_size, layout, key, &mut scratch, mode)
        } else {
            let region = self.source.file_view(table_offset, table_size)?;
            search_region(region, layout, key, mode)
        }
    }

    /// Search a whole chunk; an absent or empty chunk is a miss
    pub fn search_chunk(&self, id: ChunkId, layout: &RecordLayout, key: &[u32], mode: SearchMode) -> Result<TableHit> {
        let info = self.source.chunk_info(id)?;
        if info.is_empty() {
            return Err(Error::not_exist(format!("chunk {} is empty", id)));
        }
        self.search(info.offset, info.size, layout, key, mode)
    }

    /// Typed lookup in a chunk holding `R` records
    pub fn find<R: TableRecord>(&self, id: ChunkId, key: &[u32], mode: SearchMode) -> Result<R> {
        self.search_chunk(id, &R::LAYOUT, key, mode).map(|hit| hit.decode())
    }
}

/// `SGCI`: subgraph → calibration header offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalIndexRecord {
    pub subgraph_id: u32,
    pub header_offset: u32,
}

impl TableRecord for CalIndexRecord {
    const LAYOUT: RecordLayout = RecordLayout::fixed(2, 1);

    fn from_words(words: &[u32]) -> Self {
        Self {
            subgraph_id: words[0],
            header_offset: words[1],
        }
    }

    fn key(&self) -> Vec<u32> {
        vec![self.subgraph_id]
    }
}

/// `TAGI`: (subgraph, tag) → TKV key table and LUT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagIndexRecord {
    pub subgraph_id: u32,
    pub tag_id: u32,
    pub key_table_offset: u32,
    pub lut_offset: u32,
}

impl TableRecord for TagIndexRecord {
    const LAYOUT: RecordLayout = RecordLayout::fixed(4, 2);

    fn from_words(words: &[u32]) -> Self {
        Self {
            subgraph_id: words[0],
            tag_id: words[1],
            key_table_offset: words[2],
            lut_offset: words[3],
        }
    }

    fn key(&self) -> Vec<u32> {
        vec![self.subgraph_id, self.tag_id]
    }
}

/// `SGMI`: module instance membership of a subgraph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubgraphModuleRecord {
    pub subgraph_id: u32,
    pub module_iid: u32,
    pub module_id: u32,
}

impl TableRecord for SubgraphModuleRecord {
    const LAYOUT: RecordLayout = RecordLayout::fixed(3, 2);

    fn from_words(words: &[u32]) -> Self {
        Self {
            subgraph_id: words[0],
            module_iid: words[1],
            module_id: words[2],
        }
    }

    fn key(&self) -> Vec<u32> {
        vec![self.subgraph_id, self.module_iid]
    }
}

/// `DRVM`: legacy driver module data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverModuleRecord {
    pub module_id: u32,
    pub key: u32,
    pub pool_offset: u32,
}

impl TableRecord for DriverModuleRecord {
    const LAYOUT: RecordLayout = RecordLayout::fixed(3, 1);

    fn from_words(words: &[u32]) -> Self {
        Self {
            module_id: words[0],
            key: words[1],
            pool_offset: words[2],
        }
    }

    fn key(&self) -> Vec<u32> {
        vec![self.module_id]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{view_of, ChunkInfo};

    struct MemorySource(Vec<u8>);

    impl FileSource for MemorySource {
        fn len(&self) -> u64 {
            self.0.len() as u64
        }

        fn chunk_info(&self, id: ChunkId) -> Result<ChunkInfo> {
            Err(Error::not_exist(format!("chunk {}", id)))
        }

        fn file_view(&self, offset: u64, len: u64) -> Result<&[u8]> {
            view_of(&self.0, offset, len)
        }
    }

    fn encode(records: &[Vec<u32>]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for record in records {
            for word in record {
                bytes.extend_from_slice(&word.to_le_bytes());
            }
        }
        bytes
    }

    fn pairs_table() -> Vec<u8> {
        encode(&[
            vec![1, 10, 100],
            vec![1, 20, 200],
            vec![2, 5, 300],
            vec![4, 1, 400],
            vec![7, 7, 500],
        ])
    }

    #[test]
    fn test_search_hits_and_misses() {
        let table = pairs_table();
        let layout = RecordLayout::new(3, 2).unwrap();

        let hit = search(&table, &layout, &[2, 5]).unwrap();
        assert_eq!(hit.index, 2);
        assert_eq!(hit.offset, 24);
        assert_eq!(hit.words, vec![2, 5, 300]);

        let hit = search(&table, &layout, &[7, 7]).unwrap();
        assert_eq!(hit.word(2), 500);

        assert!(search(&table, &layout, &[3, 0]).unwrap_err().is_not_exist());
        assert!(search(&table, &layout, &[8, 0]).unwrap_err().is_not_exist());
    }

    #[test]
    fn test_search_first_among_duplicates() {
        let table = encode(&[vec![1, 0], vec![3, 1], vec![3, 2], vec![3, 3], vec![9, 4]]);
        let layout = RecordLayout::new(2, 1).unwrap();

        let hit = search_first(&table, &layout, &[3]).unwrap();
        assert_eq!(hit.index, 1);
        assert_eq!(hit.word(1), 1);
    }

    #[test]
    fn test_bad_params() {
        let table = pairs_table();
        let layout = RecordLayout::new(3, 2).unwrap();

        let err = search(&[], &layout, &[1, 1]).unwrap_err();
        assert_eq!(err.error_code(), "BADPARAM");

        let err = search(&table, &layout, &[1]).unwrap_err();
        assert_eq!(err.error_code(), "BADPARAM");

        let err = search(&table[..table.len() - 4], &layout, &[1, 10]).unwrap_err();
        assert_eq!(err.error_code(), "BADPARAM");

        assert!(RecordLayout::new(0, 0).is_err());
        assert!(RecordLayout::new(2, 3).is_err());

        let source = MemorySource(table.clone());
        let mut scratch = [0u8; 8];
        let err = search_partitioned(&source, 0, table.len() as u64, &layout, &[1, 10], &mut scratch, SearchMode::Any)
            .unwrap_err();
        assert_eq!(err.error_code(), "BADPARAM");
    }

    #[test]
    fn test_partitioned_offsets_are_absolute_indices() {
        let table = pairs_table();
        let mut file = vec![0xAAu8; 16];
        file.extend_from_slice(&table);
        let source = MemorySource(file);
        let layout = RecordLayout::new(3, 2).unwrap();

        // 20 bytes of scratch hold one 12-byte record per partition
        let mut scratch = [0u8; 20];
        let hit = search_partitioned(&source, 16, table.len() as u64, &layout, &[4, 1], &mut scratch, SearchMode::Any)
            .unwrap();
        assert_eq!(hit.index, 3);
        assert_eq!(hit.offset, 36);
        assert_eq!(hit.words, vec![4, 1, 400]);
    }

    #[test]
    fn test_searcher_switches_to_partitions() {
        let records: Vec<Vec<u32>> = (0..64u32).map(|i| vec![i * 2, i]).collect();
        let table = encode(&records);
        let source = MemorySource(table.clone());
        let layout = RecordLayout::new(2, 1).unwrap();
        let config = SearchConfig {
            scratch_buffer_size: 40,
            partition_threshold: 64,
        };
        let searcher = TableSearcher::new(&source, &config);

        let hit = searcher.search(0, table.len() as u64, &layout, &[100], SearchMode::Any).unwrap();
        assert_eq!(hit.index, 50);
        assert!(searcher.search(0, table.len() as u64, &layout, &[101], SearchMode::Any).is_err());
    }

    #[test]
    fn test_typed_record_decode() {
        let table = encode(&[vec![3, 0x100, 0xAB], vec![3, 0x200, 0xCD]]);
        let hit = search(&table, &SubgraphModuleRecord::LAYOUT, &[3, 0x200]).unwrap();
        let record: SubgraphModuleRecord = hit.decode();
        assert_eq!(record.module_id, 0xCD);
        assert_eq!(record.key(), vec![3, 0x200]);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "not sorted")]
    fn test_unsorted_table_asserts() {
        let table = encode(&[vec![5, 0], vec![1, 0], vec![9, 0]]);
        let layout = RecordLayout::new(2, 1).unwrap();
        let _ = search(&table, &layout, &[9]);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn partitioned_search_matches_whole_table(
                mut keys in prop::collection::vec(0u32..64, 1..120),
                scratch_records in 1usize..40,
                scratch_slack in 0usize..12,
                probe in 0u32..70,
            ) {
                keys.sort_unstable();
                let records: Vec<Vec<u32>> = keys.iter().enumerate().map(|(i, &k)| vec![k, i as u32]).collect();
                let table = encode(&records);
                let layout = RecordLayout::new(2, 1).unwrap();
                let source = MemorySource(table.clone());

                // Scratch sizes deliberately include ones that are not a stride multiple
                let mut scratch = vec![0u8; scratch_records * layout.stride_bytes() + scratch_slack % layout.stride_bytes()];

                let whole = search_first(&table, &layout, &[probe]).ok();
                let parted = search_partitioned(
                    &source, 0, table.len() as u64, &layout, &[probe], &mut scratch, SearchMode::First,
                ).ok();
                prop_assert_eq!(whole, parted);
            }
        }
    }
}
