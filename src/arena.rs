//! Byte arena with an offset table
//!
//! Encoded records are copied back to back into one preallocated buffer; the
//! offset table, indexed by insertion ordinal, marks where each record starts.
//! Every write is bounded by the space left in the buffer.

use std::collections::TryReserveError;

/// Preallocated record storage
pub struct Arena {
    /// Backing buffer, fully initialised to its capacity
    bytes: Vec<u8>,
    /// Bytes occupied by records
    used: usize,
    /// Start of each record, by insertion ordinal
    offsets: Vec<usize>,
    max_records: usize,
}

impl Arena {
    /// Allocate room for `capacity` bytes and `max_records` records.
    ///
    /// Returns an error rather than aborting when the allocation fails.
    pub fn try_with_capacity(capacity: usize, max_records: usize) -> Result<Self, TryReserveError> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(capacity)?;
        bytes.resize(capacity, 0);

        let mut offsets = Vec::new();
        offsets.try_reserve_exact(max_records)?;

        Ok(Self {
            bytes,
            used: 0,
            offsets,
            max_records,
        })
    }

    /// An arena that holds nothing
    pub fn empty() -> Self {
        Self {
            bytes: Vec::new(),
            used: 0,
            offsets: Vec::new(),
            max_records: 0,
        }
    }

    /// Copy an encoded record after the last one.
    ///
    /// Returns false, leaving the arena unchanged, if the offset table is full
    /// or the record does not fit in the remaining bytes.
    pub fn push(&mut self, record: &[u8]) -> bool {
        if record.is_empty() || self.offsets.len() >= self.max_records {
            return false;
        }
        let end = self.used + record.len();
        if end > self.bytes.len() {
            return false;
        }
        self.bytes[self.used..end].copy_from_slice(record);
        self.offsets.push(self.used);
        self.used = end;
        true
    }

    /// Bytes of the record inserted at `ordinal`.
    ///
    /// Panics if `ordinal >= self.len()`.
    pub fn record(&self, ordinal: usize) -> &[u8] {
        let start = self.offsets[ordinal];
        let end = self
            .offsets
            .get(ordinal + 1)
            .copied()
            .unwrap_or(self.used);
        &self.bytes[start..end]
    }

    /// Records in insertion order
    pub fn records(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (0..self.len()).map(move |ordinal| self.record(ordinal))
    }

    pub fn bytes_used(&self) -> usize {
        self.used
    }

    pub fn capacity_bytes(&self) -> usize {
        self.bytes.len()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::empty()
    }
}
