//! Forward-only readers over store contents
//!
//! Both readers hand out a reference that stays valid until the next call to
//! `next_element`. Memory-resident elements come first, then the backing file
//! is decoded in order. That order is only sorted after the store's `sort`.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::arena::Arena;
use crate::error::{Result, SpillError};
use crate::framing::{ArenaFraming, ArenaSerializable, Framing, LineFraming, LineSerializable};

/// Reader over a [`VariableStore`](crate::store::VariableStore)
pub struct Reader<'a, T: LineSerializable> {
    memory: std::slice::Iter<'a, T>,
    file: Option<BufReader<File>>,
    remaining_in_file: u64,
    framing: LineFraming<T::Key>,
    current: Option<T>,
}

impl<'a, T: LineSerializable> Reader<'a, T> {
    pub(crate) fn new(
        memory: &'a [T],
        path: &Path,
        in_file: u64,
        framing: LineFraming<T::Key>,
    ) -> Result<Self> {
        let file = if in_file > 0 {
            Some(BufReader::new(File::open(path)?))
        } else {
            None
        };

        Ok(Self {
            memory: memory.iter(),
            file,
            remaining_in_file: in_file,
            framing,
            current: None,
        })
    }

    pub fn has_next(&self) -> bool {
        !self.memory.as_slice().is_empty() || self.remaining_in_file > 0
    }

    /// Advance to the next element, or None once all elements were seen.
    pub fn next_element(&mut self) -> Result<Option<&T>> {
        if let Some(element) = self.memory.next() {
            return Ok(Some(element));
        }
        if self.remaining_in_file == 0 {
            return Ok(None);
        }
        let Some(file) = self.file.as_mut() else {
            return Ok(None);
        };

        let record = self
            .framing
            .read_record(file)?
            .ok_or_else(|| ended_early(self.remaining_in_file))?;
        self.current = Some(self.framing.decode_element(&record)?);
        self.remaining_in_file -= 1;
        Ok(self.current.as_ref())
    }
}

/// Reader over a [`FixedStore`](crate::fixed_store::FixedStore)
pub struct ArenaReader<'a, T: ArenaSerializable> {
    arena: &'a Arena,
    /// Sorted permutation of arena ordinals, if the arena was sorted
    order: Option<&'a [usize]>,
    next_ordinal: usize,
    file: Option<BufReader<File>>,
    remaining_in_file: u64,
    framing: ArenaFraming<T>,
    current: Option<T>,
}

impl<'a, T: ArenaSerializable> ArenaReader<'a, T> {
    pub(crate) fn new(
        arena: &'a Arena,
        order: Option<&'a [usize]>,
        path: &Path,
        in_file: u64,
    ) -> Result<Self> {
        let file = if in_file > 0 {
            Some(BufReader::new(File::open(path)?))
        } else {
            None
        };

        Ok(Self {
            arena,
            order,
            next_ordinal: 0,
            file,
            remaining_in_file: in_file,
            framing: ArenaFraming::new(),
            current: None,
        })
    }

    pub fn has_next(&self) -> bool {
        self.next_ordinal < self.arena.len() || self.remaining_in_file > 0
    }

    /// Advance to the next element, or None once all elements were seen.
    pub fn next_element(&mut self) -> Result<Option<&T>> {
        if self.next_ordinal < self.arena.len() {
            let ordinal = match self.order {
                Some(order) => order[self.next_ordinal],
                None => self.next_ordinal,
            };
            self.next_ordinal += 1;
            self.current = Some(T::decode(self.arena.record(ordinal))?);
            return Ok(self.current.as_ref());
        }
        if self.remaining_in_file == 0 {
            return Ok(None);
        }
        let Some(file) = self.file.as_mut() else {
            return Ok(None);
        };

        let record = self
            .framing
            .read_record(file)?
            .ok_or_else(|| ended_early(self.remaining_in_file))?;
        self.current = Some(T::decode(&record)?);
        self.remaining_in_file -= 1;
        Ok(self.current.as_ref())
    }
}

fn ended_early(missing: u64) -> SpillError {
    SpillError::Integrity(format!(
        "backing file ended with {} elements still expected",
        missing
    ))
}
