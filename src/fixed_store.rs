//! Fixed-capacity element store
//!
//! Same contract as [`VariableStore`](crate::store::VariableStore), but the
//! in-memory side is a preallocated [`Arena`] holding encoded records. An
//! in-memory sort permutes the offset table using a byte-level comparator and
//! never moves record bytes. Elements are only decoded to break byte-level
//! ties.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, warn};

use crate::arena::Arena;
use crate::budget::BudgetPolicy;
use crate::error::{Result, SpillError};
use crate::framing::{ArenaFraming, ArenaSerializable};
use crate::merge::{MergeSorter, SortStats, move_file};
use crate::probe::MemoryProbe;
use crate::reader::ArenaReader;
use crate::store::{Residency, append_writer, sorted_path};

/// Store for self-delimiting records with a fixed in-memory capacity
pub struct FixedStore<T: ArenaSerializable> {
    path: PathBuf,
    residency: Residency,
    arena: Arena,
    /// Sorted permutation of arena ordinals, cleared by later inserts
    order: Option<Vec<usize>>,
    probe: Arc<dyn MemoryProbe>,
    policy: BudgetPolicy,
    writer: Option<BufWriter<File>>,
    scratch: Vec<u8>,
    in_file: u64,
    threads: usize,
    _element: std::marker::PhantomData<fn() -> T>,
}

impl<T: ArenaSerializable> FixedStore<T> {
    /// Create a store backed by `path`, truncating any existing file.
    ///
    /// Up to `max_elements_in_memory` records totalling `arena_bytes` bytes
    /// are kept in memory. If the arena cannot be allocated the store starts
    /// out file-backed.
    pub fn new(
        path: impl Into<PathBuf>,
        max_elements_in_memory: usize,
        arena_bytes: usize,
        probe: Arc<dyn MemoryProbe>,
    ) -> Result<Self> {
        let path = path.into();
        let writer = BufWriter::new(File::create(&path)?);

        let (arena, residency) = match Arena::try_with_capacity(arena_bytes, max_elements_in_memory)
        {
            Ok(arena) => (arena, Residency::PureMemory),
            Err(e) => {
                warn!(
                    "Could not allocate a {} byte arena ({}); store {} starts file-backed",
                    arena_bytes,
                    e,
                    path.display()
                );
                (Arena::empty(), Residency::FileBacked)
            }
        };

        Ok(Self {
            path,
            residency,
            arena,
            order: None,
            probe,
            policy: BudgetPolicy::default(),
            writer: Some(writer),
            scratch: Vec::new(),
            in_file: 0,
            threads: 1,
            _element: std::marker::PhantomData,
        })
    }

    #[must_use]
    pub fn budget_policy(mut self, policy: BudgetPolicy) -> Self {
        self.policy = policy;
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

    pub fn element_count_in_memory(&self) -> u64 {
        self.arena.len() as u64
    }

    pub fn element_count_in_file(&self) -> u64 {
        self.in_file
    }

    pub fn total_element_count(&self) -> u64 {
        self.element_count_in_memory() + self.in_file
    }

    /// Insert an element into the arena, or the file once the arena is full.
    ///
    /// Returns `Ok(false)` only for an element whose encoding exceeds
    /// `T::MAX_ENCODED_LEN`; such an element is not stored, whether the store
    /// is in memory or file-backed.
    pub fn insert(&mut self, element: &T) -> Result<bool> {
        self.scratch.resize(T::MAX_ENCODED_LEN, 0);
        let written = match element.encode_into(&mut self.scratch) {
            Some(written) if written <= T::MAX_ENCODED_LEN => written,
            _ => {
                warn!("Rejected an element larger than {} bytes", T::MAX_ENCODED_LEN);
                return Ok(false);
            }
        };
        let record = &self.scratch[..written];
        let framed = ArenaFraming::<T>::record_len(record)?;
        if framed != written {
            return Err(SpillError::Integrity(format!(
                "element encoded {} bytes but its header declares {}",
                written, framed
            )));
        }

        if self.residency == Residency::PureMemory {
            if self.arena.push(record) {
                self.order = None;
                return Ok(true);
            }
            if self.residency.spill() {
                info!(
                    "Store {} is now file-backed after {} in-memory elements \
                     ({} of {} arena bytes used)",
                    self.path.display(),
                    self.arena.len(),
                    self.arena.bytes_used(),
                    self.arena.capacity_bytes()
                );
            }
        }

        append_writer(&mut self.writer, &self.path)?.write_all(record)?;
        self.in_file += 1;
        Ok(true)
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Sort all elements.
    ///
    /// `byte_cmp` orders encoded records directly; when it reports `Equal`
    /// both records are decoded and `elem_cmp` decides. A record that fails
    /// to decode fails the sort and leaves the stored order unchanged.
    pub fn sort<B, E>(&mut self, tempdir: &Path, byte_cmp: B, elem_cmp: E) -> Result<SortStats>
    where
        B: Fn(&[u8], &[u8]) -> Ordering + Sync,
        E: Fn(&T, &T) -> Ordering + Sync,
    {
        // First decode failure seen by the comparator
        let failure: Mutex<Option<SpillError>> = Mutex::new(None);
        let cmp = |a: &[u8], b: &[u8]| {
            byte_cmp(a, b).then_with(|| {
                decoded_cmp::<T, E>(a, b, &elem_cmp).unwrap_or_else(|e| {
                    failure
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .get_or_insert(e);
                    Ordering::Equal
                })
            })
        };
        let take_failure = || failure.lock().unwrap_or_else(PoisonError::into_inner).take();

        if self.residency == Residency::PureMemory {
            let mut order: Vec<usize> = Vec::new();
            match order.try_reserve_exact(self.arena.len()) {
                Ok(()) => {
                    order.extend(0..self.arena.len());
                    let arena = &self.arena;
                    order.sort_unstable_by(|&a, &b| cmp(arena.record(a), arena.record(b)));
                    if let Some(e) = take_failure() {
                        return Err(e);
                    }
                    debug!("Sorted {} arena records in memory", order.len());
                    self.order = Some(order);
                    return Ok(SortStats {
                        records: self.arena.len() as u64,
                        in_memory: true,
                        ..SortStats::default()
                    });
                }
                Err(e) => {
                    warn!("No memory for the sort permutation ({}); sorting on disk", e);
                    self.residency.spill();
                }
            }
        }

        // Flush arena records in insertion order, then release the arena
        let arena = std::mem::take(&mut self.arena);
        self.order = None;
        for record in arena.records() {
            append_writer(&mut self.writer, &self.path)?.write_all(record)?;
            self.in_file += 1;
        }
        drop(arena);

        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }

        let sorted = sorted_path(&self.path);
        let sorter = MergeSorter::new(ArenaFraming::<T>::new(), Arc::clone(&self.probe))
            .budget_policy(self.policy)
            .threads(self.threads);
        let by_bytes = |a: &Vec<u8>, b: &Vec<u8>| cmp(a.as_slice(), b.as_slice());
        let sorted_stats = sorter.sort(&[&self.path], tempdir, &sorted, &by_bytes);
        if let Some(e) = take_failure() {
            if sorted.exists() {
                std::fs::remove_file(&sorted)?;
            }
            return Err(e);
        }
        let stats = sorted_stats?;
        move_file(&sorted, &self.path)?;

        if stats.records != self.in_file {
            return Err(SpillError::Integrity(format!(
                "sorted {} records but the store holds {}",
                stats.records, self.in_file
            )));
        }
        Ok(stats)
    }

    /// Forward-only reader: arena records first, then the file.
    ///
    /// Pending writes must be flushed first.
    pub fn make_reader(&self) -> Result<ArenaReader<'_, T>> {
        if self
            .writer
            .as_ref()
            .is_some_and(|writer| !writer.buffer().is_empty())
        {
            return Err(SpillError::Integrity(
                "store has unflushed writes; call flush() before make_reader()".to_string(),
            ));
        }
        ArenaReader::new(&self.arena, self.order.as_deref(), &self.path, self.in_file)
    }
}

/// Order two encoded records by their decoded elements
fn decoded_cmp<T, E>(a: &[u8], b: &[u8], elem_cmp: &E) -> Result<Ordering>
where
    T: ArenaSerializable,
    E: Fn(&T, &T) -> Ordering,
{
    Ok(elem_cmp(&T::decode(a)?, &T::decode(b)?))
}
