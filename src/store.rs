//! Adaptive element store
//!
//! A [`VariableStore`] buffers elements in memory while the budget allows and
//! appends them to its backing file once it does not. The switch is one-way:
//! after the first spilled element every later element goes to the file too,
//! while the elements already buffered stay in memory.
//!
//! Sorting a pure-memory store is an in-place sort. Otherwise the buffered
//! elements are appended to the file and the file is sorted on disk by a
//! [`MergeSorter`], after which the result replaces the backing file.

use std::cmp::Ordering;
use std::collections::TryReserveError;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};

use crate::budget::BudgetPolicy;
use crate::error::{Result, SpillError};
use crate::framing::{LineFraming, LineSerializable, RawLine};
use crate::merge::{MergeSorter, SortStats, move_file};
use crate::probe::MemoryProbe;
use crate::reader::Reader;

/// The budget is recomputed at insertion 0, 1 and every multiple of this.
pub const BUDGET_REFRESH_INTERVAL: u64 = 65_536;

/// Smallest number of slots the in-memory buffer grows by.
const MIN_GROWTH: usize = 16;

/// Where newly inserted elements go
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Residency {
    PureMemory,
    FileBacked,
}

impl Residency {
    /// Move to `FileBacked`. Returns true if this call made the transition.
    pub(crate) fn spill(&mut self) -> bool {
        let was_memory = *self == Residency::PureMemory;
        *self = Residency::FileBacked;
        was_memory
    }
}

#[derive(Debug)]
enum SpillReason {
    OverBudget { needed: u64, budget: u64 },
    AllocationFailed(TryReserveError),
}

/// Store for variable-size elements written as line records
pub struct VariableStore<T: LineSerializable> {
    path: PathBuf,
    residency: Residency,
    memory: Vec<T>,
    /// Heap bytes owned by the elements in `memory`
    heap_bytes: usize,
    byte_budget: u64,
    /// Effective budget, refreshed from the probe
    budget: u64,
    probe: Arc<dyn MemoryProbe>,
    policy: BudgetPolicy,
    heap_usage: Option<fn(&T) -> usize>,
    framing: LineFraming<T::Key>,
    /// Closed while a disk sort is running, reopened lazily afterwards
    writer: Option<BufWriter<File>>,
    scratch: Vec<u8>,
    inserted: u64,
    in_file: u64,
    threads: usize,
    #[cfg(test)]
    fail_reserve_at: Option<usize>,
}

impl<T: LineSerializable> VariableStore<T> {
    /// Create a store backed by `path`, truncating any existing file.
    ///
    /// At most `byte_budget` bytes of elements are held in memory, less if
    /// the probe reports less free memory.
    pub fn new(
        path: impl Into<PathBuf>,
        byte_budget: u64,
        probe: Arc<dyn MemoryProbe>,
    ) -> Result<Self> {
        let path = path.into();
        let writer = BufWriter::new(File::create(&path)?);

        Ok(Self {
            path,
            residency: Residency::PureMemory,
            memory: Vec::new(),
            heap_bytes: 0,
            byte_budget,
            budget: 0,
            probe,
            policy: BudgetPolicy::default(),
            heap_usage: None,
            framing: LineFraming::default(),
            writer: Some(writer),
            scratch: Vec::new(),
            inserted: 0,
            in_file: 0,
            threads: 1,
            #[cfg(test)]
            fail_reserve_at: None,
        })
    }

    #[must_use]
    pub fn budget_policy(mut self, policy: BudgetPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Count heap usage with `f` instead of [`LineSerializable::heap_bytes`].
    #[must_use]
    pub fn heap_usage(mut self, f: fn(&T) -> usize) -> Self {
        self.heap_usage = Some(f);
        self
    }

    #[must_use]
    pub fn terminator(mut self, terminator: u8) -> Self {
        self.framing = LineFraming::new(terminator);
        self
    }

    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_pure_memory(&self) -> bool {
        self.residency == Residency::PureMemory
    }

    /// Effective budget as of the last refresh
    pub fn budget(&self) -> u64 {
        self.budget
    }

    pub fn element_count_in_memory(&self) -> u64 {
        self.memory.len() as u64
    }

    pub fn element_count_in_file(&self) -> u64 {
        self.in_file
    }

    pub fn total_element_count(&self) -> u64 {
        self.element_count_in_memory() + self.in_file
    }

    /// Insert an element, in memory if the budget allows, else in the file.
    ///
    /// Elements are never dropped: the result is `Ok(true)` unless writing
    /// to the backing file fails.
    pub fn insert(&mut self, element: T) -> Result<bool> {
        if self.inserted <= 1 || self.inserted % BUDGET_REFRESH_INTERVAL == 0 {
            self.refresh_budget();
        }
        self.inserted += 1;

        if self.residency == Residency::PureMemory {
            let element_heap = self.heap_of(&element);
            match self.admit(element_heap) {
                Ok(()) => {
                    self.memory.push(element);
                    self.heap_bytes += element_heap;
                    return Ok(true);
                }
                Err(reason) => {
                    if self.residency.spill() {
                        info!(
                            "Store {} is now file-backed after {} in-memory elements: {:?}",
                            self.path.display(),
                            self.memory.len(),
                            reason
                        );
                    }
                }
            }
        }

        self.append_to_file(&element)?;
        Ok(true)
    }

    /// Flush buffered file writes.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Sort all elements by key.
    ///
    /// Afterwards a reader yields elements in `cmp` order. Ties between
    /// equal keys come out in no particular order. After a disk sort the
    /// store is file-backed; a failed sort leaves the backing file unusable.
    pub fn sort<C>(&mut self, tempdir: &Path, cmp: C) -> Result<SortStats>
    where
        C: Fn(&T::Key, &T::Key) -> Ordering + Sync,
    {
        if self.residency == Residency::PureMemory {
            self.memory
                .sort_unstable_by(|a, b| cmp(&a.sort_key(), &b.sort_key()));
            debug!("Sorted {} elements in memory", self.memory.len());
            return Ok(SortStats {
                records: self.memory.len() as u64,
                in_memory: true,
                ..SortStats::default()
            });
        }

        let memory = std::mem::take(&mut self.memory);
        for element in &memory {
            self.append_to_file(element)?;
        }
        drop(memory);
        self.heap_bytes = 0;

        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }

        let sorted = sorted_path(&self.path);
        let sorter = MergeSorter::new(self.framing.clone(), Arc::clone(&self.probe))
            .budget_policy(self.policy)
            .threads(self.threads);
        let by_key = |a: &RawLine<T::Key>, b: &RawLine<T::Key>| cmp(&a.key, &b.key);
        let stats = sorter.sort(&[&self.path], tempdir, &sorted, &by_key)?;
        move_file(&sorted, &self.path)?;

        if stats.records != self.in_file {
            return Err(SpillError::Integrity(format!(
                "sorted {} records but the store holds {}",
                stats.records, self.in_file
            )));
        }
        Ok(stats)
    }

    /// Forward-only reader: memory-resident elements first, then the file.
    ///
    /// Pending writes must be flushed first.
    pub fn make_reader(&self) -> Result<Reader<'_, T>> {
        if self
            .writer
            .as_ref()
            .is_some_and(|writer| !writer.buffer().is_empty())
        {
            return Err(SpillError::Integrity(
                "store has unflushed writes; call flush() before make_reader()".to_string(),
            ));
        }
        Reader::new(&self.memory, &self.path, self.in_file, self.framing.clone())
    }

    fn refresh_budget(&mut self) {
        let probed = self.policy.store_budget(self.probe.as_ref());
        self.budget = self.byte_budget.min(probed);
        debug!("Store budget refreshed to {} bytes", self.budget);
    }

    fn heap_of(&self, element: &T) -> usize {
        match self.heap_usage {
            Some(f) => f(element),
            None => element.heap_bytes(),
        }
    }

    /// Decide whether one more element with `element_heap` heap bytes may
    /// stay in memory, growing the buffer if it is full.
    fn admit(&mut self, element_heap: usize) -> std::result::Result<(), SpillReason> {
        let slot = std::mem::size_of::<T>() as u64;
        let tracked = (self.heap_bytes + element_heap) as u64;
        let capacity = self.memory.capacity();

        if self.memory.len() < capacity {
            let needed = capacity as u64 * slot + tracked;
            return if needed <= self.budget {
                Ok(())
            } else {
                Err(SpillReason::OverBudget {
                    needed,
                    budget: self.budget,
                })
            };
        }

        let additional = capacity.max(MIN_GROWTH);
        let needed = (capacity + additional) as u64 * slot + tracked;
        if needed > self.budget {
            return Err(SpillReason::OverBudget {
                needed,
                budget: self.budget,
            });
        }
        self.try_grow(additional)
            .map_err(SpillReason::AllocationFailed)
    }

    fn try_grow(&mut self, additional: usize) -> std::result::Result<(), TryReserveError> {
        #[cfg(test)]
        if self.fail_reserve_at == Some(self.memory.len()) {
            return self.memory.try_reserve_exact(usize::MAX);
        }
        self.memory.try_reserve_exact(additional)
    }

    fn append_to_file(&mut self, element: &T) -> Result<()> {
        let writer = append_writer(&mut self.writer, &self.path)?;
        self.framing
            .write_element(writer, element, &mut self.scratch)?;
        self.in_file += 1;
        Ok(())
    }
}

/// Writer for a backing file, reopened in append mode after a disk sort
/// closed it.
pub(crate) fn append_writer<'w>(
    slot: &'w mut Option<BufWriter<File>>,
    path: &Path,
) -> Result<&'w mut BufWriter<File>> {
    if slot.is_none() {
        let file = OpenOptions::new().append(true).open(path)?;
        *slot = Some(BufWriter::new(file));
    }
    slot.as_mut()
        .ok_or_else(|| SpillError::Integrity("backing file writer unavailable".to_string()))
}

/// Sibling of `path` that receives the sorted output before the rename
pub(crate) fn sorted_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".sorted");
    PathBuf::from(name)
}
