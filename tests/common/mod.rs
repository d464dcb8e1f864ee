//! Element types shared by the integration tests

#![allow(dead_code)]

use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;

use spillsort::{
    ArenaSerializable, BudgetPolicy, FixedMemoryProbe, KeyExtractable, LineSerializable, Result,
    SpillError, VariableStore,
};

/// Line element: a `u64` key with an eight-digit tag
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sample {
    pub key: u64,
    pub tag: String,
}

impl Sample {
    pub fn new(key: u64, seq: usize) -> Self {
        Self {
            key,
            tag: format!("{:08}", seq),
        }
    }
}

impl KeyExtractable for Sample {
    type Key = u64;

    fn sort_key(&self) -> u64 {
        self.key
    }
}

impl LineSerializable for Sample {
    fn encode_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.tag.as_bytes());
    }

    fn decode(key: u64, payload: &[u8]) -> Result<Self> {
        let tag = String::from_utf8(payload.to_vec())
            .map_err(|e| SpillError::Integrity(e.to_string()))?;
        Ok(Self { key, tag })
    }

    fn heap_bytes(&self) -> usize {
        self.tag.capacity()
    }
}

/// Arena element: `[len: u8][key: u32 be][body...]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tile {
    pub key: u32,
    pub body: Vec<u8>,
}

impl ArenaSerializable for Tile {
    const HEADER_LEN: usize = 1;
    const MAX_ENCODED_LEN: usize = 255;

    fn encode_into(&self, dst: &mut [u8]) -> Option<usize> {
        let len = 5 + self.body.len();
        if len > dst.len() || len > Self::MAX_ENCODED_LEN {
            return None;
        }
        dst[0] = len as u8;
        dst[1..5].copy_from_slice(&self.key.to_be_bytes());
        dst[5..len].copy_from_slice(&self.body);
        Some(len)
    }

    fn encoded_len(header: &[u8]) -> usize {
        header[0] as usize
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < 5 {
            return Err(SpillError::Integrity("short tile".to_string()));
        }
        Ok(Self {
            key: u32::from_be_bytes([src[1], src[2], src[3], src[4]]),
            body: src[5..].to_vec(),
        })
    }
}

/// Big-endian keys order correctly as raw bytes
pub fn tile_key_bytes(a: &[u8], b: &[u8]) -> Ordering {
    a[1..5].cmp(&b[1..5])
}

pub fn tile_body(a: &Tile, b: &Tile) -> Ordering {
    a.body.cmp(&b.body)
}

/// Variable store with exact budgeting against `host_bytes` of free memory
pub fn sample_store(dir: &Path, byte_budget: u64, host_bytes: u64) -> VariableStore<Sample> {
    VariableStore::new(
        dir.join("store"),
        byte_budget,
        Arc::new(FixedMemoryProbe::new(host_bytes)),
    )
    .expect("store should be created")
    .budget_policy(BudgetPolicy::exact())
}

pub fn drain_samples(store: &VariableStore<Sample>) -> Vec<Sample> {
    let mut reader = store.make_reader().expect("reader should open");
    let mut out = Vec::new();
    while let Some(element) = reader.next_element().expect("element should decode") {
        out.push(element.clone());
    }
    out
}

pub fn is_non_decreasing(keys: &[u64]) -> bool {
    keys.windows(2).all(|w| w[0] <= w[1])
}
