//! # Core Types
//!
//! Key vectors, identifiers and request/response structures shared by the
//! storage layer and its callers.
//!
//! A [`KeyVector`] is an ordered list of `(key_id, value)` pairs. Lookups and
//! comparisons require the vector to be sorted ascending by key id; callers
//! hand in vectors in any order and the storage layer sorts a copy first.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub type SubgraphId = u32;
pub type ModuleInstanceId = u32;
pub type ParameterId = u32;
pub type ModuleId = u32;
pub type TagId = u32;

/// Bit position of the database id field embedded in subgraph ids
pub const SUBGRAPH_DB_ID_SHIFT: u32 = 24;
/// Mask of the database id field embedded in subgraph ids
pub const SUBGRAPH_DB_ID_MASK: u32 = 0x0F00_0000;

/// Database id encoded in the reserved field of a subgraph id
pub fn subgraph_database_id(subgraph_id: SubgraphId) -> u32 {
    (subgraph_id & SUBGRAPH_DB_ID_MASK) >> SUBGRAPH_DB_ID_SHIFT
}

/// A single `(key_id, value)` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyValuePair {
    pub key: u32,
    pub value: u32,
}

impl KeyValuePair {
    pub const fn new(key: u32, value: u32) -> Self {
        Self { key, value }
    }
}

impl fmt::Display for KeyValuePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}={:#x}", self.key, self.value)
    }
}

impl FromStr for KeyValuePair {
    type Err = Error;

    /// Parses `key=value`, each side decimal or `0x` hex
    fn from_str(s: &str) -> Result<Self> {
        let (key, value) = s
            .split_once('=')
            .ok_or_else(|| Error::bad_param(format!("expected key=value, got '{}'", s)))?;
        Ok(Self {
            key: parse_u32(key.trim())?,
            value: parse_u32(value.trim())?,
        })
    }
}

/// Parse a decimal or `0x`-prefixed hexadecimal u32
pub fn parse_u32(s: &str) -> Result<u32> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse::<u32>(),
    };
    parsed.map_err(|e| Error::bad_param(format!("invalid number '{}': {}", s, e)))
}

/// Ordered `(key_id, value)` vector
///
/// Identity is full pair-wise equality, so two vectors with the same pairs in
/// a different order are different identities. Sort before comparing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyVector(Vec<KeyValuePair>);

impl KeyVector {
    pub fn new(pairs: Vec<KeyValuePair>) -> Self {
        Self(pairs)
    }

    /// The zero-length default variant
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn from_pairs(pairs: &[(u32, u32)]) -> Self {
        Self(pairs.iter().map(|&(key, value)| KeyValuePair::new(key, value)).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn pairs(&self) -> &[KeyValuePair] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyValuePair> {
        self.0.iter()
    }

    pub fn into_pairs(self) -> Vec<KeyValuePair> {
        self.0
    }

    /// Sort ascending by key id in place
    pub fn sort(&mut self) {
        self.0.sort_by_key(|pair| pair.key);
    }

    /// Sorted copy
    pub fn sorted(&self) -> Self {
        let mut copy = self.clone();
        copy.sort();
        copy
    }

    pub fn is_sorted(&self) -> bool {
        self.0.windows(2).all(|w| w[0].key <= w[1].key)
    }

    /// True when some key id appears more than once (requires sorted input)
    pub fn has_duplicate_keys(&self) -> bool {
        self.0.windows(2).any(|w| w[0].key == w[1].key)
    }

    pub fn key_ids(&self) -> Vec<u32> {
        self.0.iter().map(|pair| pair.key).collect()
    }

    pub fn values(&self) -> Vec<u32> {
        self.0.iter().map(|pair| pair.value).collect()
    }

    pub fn get(&self, key: u32) -> Option<u32> {
        self.0.iter().find(|pair| pair.key == key).map(|pair| pair.value)
    }

    pub fn contains_key(&self, key: u32) -> bool {
        self.0.iter().any(|pair| pair.key == key)
    }

    /// True when the two vectors have at least one key id in common
    pub fn shares_key_with(&self, other: &KeyVector) -> bool {
        self.0.iter().any(|pair| other.contains_key(pair.key))
    }

    /// Sub-vector holding exactly `key_ids`, in the order given
    ///
    /// Returns `None` when any requested key id is absent.
    pub fn restrict_to(&self, key_ids: &[u32]) -> Option<KeyVector> {
        key_ids
            .iter()
            .map(|&key| self.get(key).map(|value| KeyValuePair::new(key, value)))
            .collect::<Option<Vec<_>>>()
            .map(KeyVector)
    }
}

impl fmt::Display for KeyVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, pair) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", pair)?;
        }
        write!(f, "]")
    }
}

impl From<Vec<KeyValuePair>> for KeyVector {
    fn from(pairs: Vec<KeyValuePair>) -> Self {
        Self(pairs)
    }
}

impl FromIterator<KeyValuePair> for KeyVector {
    fn from_iter<I: IntoIterator<Item = KeyValuePair>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Which key space a vector selects in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyVectorDomain {
    /// Usecase graph selection (GKV)
    Graph,
    /// Calibration variant selection (CKV)
    Calibration,
    /// Tag-scoped data selection (TKV)
    Tag,
}

impl KeyVectorDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyVectorDomain::Graph => "gkv",
            KeyVectorDomain::Calibration => "ckv",
            KeyVectorDomain::Tag => "tkv",
        }
    }
}

impl fmt::Display for KeyVectorDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistence class of a parameter override
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamClass {
    /// Ordinary per-subgraph calibration
    NonGlobal,
    /// Globally shared calibration
    Global,
    /// Reserved DOT2 class; no file format exists for it
    GlobalPersistent,
}

impl ParamClass {
    pub fn is_supported(&self) -> bool {
        !matches!(self, ParamClass::GlobalPersistent)
    }
}

impl Default for ParamClass {
    fn default() -> Self {
        ParamClass::NonGlobal
    }
}

/// Usecase graph resolved from a GKV
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphInfo {
    pub subgraphs: Vec<SubgraphId>,
}

impl GraphInfo {
    pub fn contains(&self, subgraph_id: SubgraphId) -> bool {
        self.subgraphs.contains(&subgraph_id)
    }
}

/// One parameter payload addressed to a module instance in a subgraph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubgraphParamData {
    pub subgraph_id: SubgraphId,
    pub module_iid: ModuleInstanceId,
    pub param_id: ParameterId,
    pub payload: Bytes,
}

impl SubgraphParamData {
    pub fn new(
        subgraph_id: SubgraphId,
        module_iid: ModuleInstanceId,
        param_id: ParameterId,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            subgraph_id,
            module_iid,
            param_id,
            payload: payload.into(),
        }
    }
}

/// Outcome of a set call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetSummary {
    /// Records whose payload was replaced
    pub replaced: usize,
    /// Records appended
    pub appended: usize,
    /// Tuples dropped because the target does not own them
    pub dropped: usize,
}

impl SetSummary {
    pub fn applied(&self) -> usize {
        self.replaced + self.appended
    }

    pub fn merge(&mut self, other: SetSummary) {
        self.replaced += other.replaced;
        self.appended += other.appended;
        self.dropped += other.dropped;
    }
}
