//! External merge sort
//!
//! Sorting a file that does not fit in memory happens in two phases:
//!
//! 1. **Split**: stream records into a batch bounded by the chunk budget,
//!    sort the batch through an index permutation and write it to
//!    `<tempdir>/<n>-0`.
//! 2. **Merge**: pair adjacent chunks and 2-way merge each pair into
//!    `<tempdir>/<position>-<round>`, halving the chunk count per round until
//!    a single file is left, which is then moved onto the output path.
//!
//! Every 2-way merge verifies that nothing was lost or duplicated.

use std::cmp::Ordering;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use rayon::prelude::*;

use crate::budget::BudgetPolicy;
use crate::error::{Result, SpillError};
use crate::framing::Framing;
use crate::probe::MemoryProbe;

/// Buffer size for chunk readers and writers.
const IO_BUFFER_SIZE: usize = 64 * 1024;

/// Statistics from a sort operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SortStats {
    /// Records in the sorted output.
    pub records: u64,
    /// Chunk files produced by the split phase.
    pub chunks_written: usize,
    /// Merge rounds performed.
    pub merge_rounds: usize,
    /// Whether the sort completed without touching disk.
    pub in_memory: bool,
}

/// Disk-based sorter for files written in one [`Framing`].
pub struct MergeSorter<F> {
    framing: F,
    probe: Arc<dyn MemoryProbe>,
    policy: BudgetPolicy,
    /// Hard cap applied on top of the probed chunk budget.
    chunk_memory_limit: Option<u64>,
    threads: usize,
}

impl<F: Framing> MergeSorter<F> {
    pub fn new(framing: F, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            framing,
            probe,
            policy: BudgetPolicy::default(),
            chunk_memory_limit: None,
            threads: 1,
        }
    }

    #[must_use]
    pub fn budget_policy(mut self, policy: BudgetPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Never let a split batch grow beyond `limit` bytes.
    #[must_use]
    pub fn chunk_memory_limit(mut self, limit: u64) -> Self {
        self.chunk_memory_limit = Some(limit);
        self
    }

    /// Sort chunks on the rayon pool when `threads > 1`.
    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Current split batch budget in bytes, recomputed from the probe.
    pub fn chunk_budget(&self) -> u64 {
        let probed = self.policy.chunk_budget(self.probe.as_ref());
        match self.chunk_memory_limit {
            Some(limit) => probed.min(limit),
            None => probed,
        }
    }

    /// Bytes a record is charged in a split batch, including its slot in the
    /// sort permutation.
    pub fn record_cost(&self, record: &F::Record) -> usize {
        self.framing.footprint(record) + std::mem::size_of::<usize>()
    }

    /// Sort `inputs` into `output`, using `tempdir` for chunk files.
    ///
    /// All chunk files are removed by the time this returns successfully.
    pub fn sort<P, C>(
        &self,
        inputs: &[P],
        tempdir: &Path,
        output: &Path,
        cmp: &C,
    ) -> Result<SortStats>
    where
        P: AsRef<Path>,
        C: Fn(&F::Record, &F::Record) -> Ordering + Sync,
    {
        info!("Phase 1: splitting {} input file(s) into sorted chunks", inputs.len());
        let (chunks, records) = self.split(inputs, tempdir, cmp)?;
        let chunks_written = chunks.len();

        info!("Phase 2: merging {} chunks", chunks_written);
        let merge_rounds = self.merge_sorted_chunks(tempdir, chunks, output, cmp, true)?;

        info!(
            "Sort complete: {} records, {} chunks, {} merge rounds",
            records, chunks_written, merge_rounds
        );
        Ok(SortStats {
            records,
            chunks_written,
            merge_rounds,
            in_memory: false,
        })
    }

    /// Split phase: returns the chunk files in the order they were written.
    pub fn split_into_sorted_chunks<P, C>(
        &self,
        inputs: &[P],
        tempdir: &Path,
        cmp: &C,
    ) -> Result<Vec<PathBuf>>
    where
        P: AsRef<Path>,
        C: Fn(&F::Record, &F::Record) -> Ordering + Sync,
    {
        self.split(inputs, tempdir, cmp).map(|(chunks, _)| chunks)
    }

    fn split<P, C>(&self, inputs: &[P], tempdir: &Path, cmp: &C) -> Result<(Vec<PathBuf>, u64)>
    where
        P: AsRef<Path>,
        C: Fn(&F::Record, &F::Record) -> Ordering + Sync,
    {
        let budget = self.chunk_budget();
        if budget == 0 {
            return Err(SpillError::Configuration(
                "chunk memory budget is zero; not enough free memory to sort".to_string(),
            ));
        }
        let budget = usize::try_from(budget).unwrap_or(usize::MAX);
        debug!("Chunk budget: {} bytes", budget);

        fs::create_dir_all(tempdir)?;

        let mut chunks = Vec::new();
        let mut batch: Vec<F::Record> = Vec::new();
        let mut batch_bytes = 0usize;
        let mut total = 0u64;

        for input in inputs {
            let file = File::open(input.as_ref())?;
            let mut reader = BufReader::with_capacity(IO_BUFFER_SIZE, file);

            while let Some(record) = self.framing.read_record(&mut reader)? {
                let cost = self.record_cost(&record);
                // A single oversized record still forms a batch of its own
                if !batch.is_empty() && batch_bytes + cost > budget {
                    chunks.push(self.write_chunk(&mut batch, tempdir, chunks.len(), cmp)?);
                    batch_bytes = 0;
                }
                batch_bytes += cost;
                batch.push(record);
                total += 1;
            }
        }

        if !batch.is_empty() {
            chunks.push(self.write_chunk(&mut batch, tempdir, chunks.len(), cmp)?);
        }

        info!("Split {} records into {} chunks", total, chunks.len());
        Ok((chunks, total))
    }

    /// Sort one batch and write it as chunk `seq`, leaving `batch` empty.
    fn write_chunk<C>(
        &self,
        batch: &mut Vec<F::Record>,
        tempdir: &Path,
        seq: usize,
        cmp: &C,
    ) -> Result<PathBuf>
    where
        C: Fn(&F::Record, &F::Record) -> Ordering + Sync,
    {
        // Permute indices so large payloads never move during the sort
        let mut order: Vec<usize> = (0..batch.len()).collect();
        {
            let records = batch.as_slice();
            let by_record = |a: &usize, b: &usize| cmp(&records[*a], &records[*b]);
            if self.threads > 1 {
                order.par_sort_unstable_by(by_record);
            } else {
                order.sort_unstable_by(by_record);
            }
        }

        let path = chunk_path(tempdir, seq, 0);
        let mut writer = BufWriter::with_capacity(IO_BUFFER_SIZE, File::create(&path)?);
        for &i in &order {
            self.framing.write_record(&mut writer, &batch[i])?;
        }
        writer.flush()?;

        debug!("Wrote chunk {} ({} records)", path.display(), order.len());
        batch.clear();
        Ok(path)
    }

    /// Merge phase: repeatedly 2-way merge adjacent chunks into `output`.
    ///
    /// Files produced by this merge are always deleted once consumed. The
    /// caller's `chunks` are deleted only when `delete_chunks` is set;
    /// otherwise they are left untouched, including when a single chunk is
    /// simply copied to `output`. Returns the number of merge rounds.
    pub fn merge_sorted_chunks<C>(
        &self,
        tempdir: &Path,
        chunks: Vec<PathBuf>,
        output: &Path,
        cmp: &C,
        delete_chunks: bool,
    ) -> Result<usize>
    where
        C: Fn(&F::Record, &F::Record) -> Ordering,
    {
        if chunks.is_empty() {
            File::create(output)?;
            return Ok(0);
        }

        fs::create_dir_all(tempdir)?;

        // (path, may be deleted once consumed)
        let mut current: Vec<(PathBuf, bool)> =
            chunks.into_iter().map(|path| (path, delete_chunks)).collect();
        let mut round = 0usize;

        while current.len() > 1 {
            round += 1;
            let mut next = Vec::with_capacity(current.len().div_ceil(2));

            for (position, pair) in current.chunks(2).enumerate() {
                if let [(left, left_owned), (right, right_owned)] = pair {
                    let merged = chunk_path(tempdir, position, round);
                    merge_two_files(&self.framing, left, right, &merged, cmp)?;
                    if *left_owned {
                        fs::remove_file(left)?;
                    }
                    if *right_owned {
                        fs::remove_file(right)?;
                    }
                    next.push((merged, true));
                } else if let [carried] = pair {
                    next.push(carried.clone());
                }
            }

            debug!("Merge round {} left {} files", round, next.len());
            current = next;
        }

        if let Some((last, owned)) = current.pop() {
            if owned {
                move_file(&last, output)?;
            } else {
                fs::copy(&last, output)?;
            }
        }

        Ok(round)
    }
}

/// Merge two sorted files into `output`, returning the records written.
///
/// On equal records the one from `left` is written first. The output must
/// hold exactly the records and bytes of both inputs; anything else is an
/// integrity fault.
pub fn merge_two_files<F, C>(
    framing: &F,
    left: &Path,
    right: &Path,
    output: &Path,
    cmp: &C,
) -> Result<u64>
where
    F: Framing,
    C: Fn(&F::Record, &F::Record) -> Ordering,
{
    let left_len = fs::metadata(left)?.len();
    let right_len = fs::metadata(right)?.len();

    let mut left_in = BufReader::with_capacity(IO_BUFFER_SIZE, File::open(left)?);
    let mut right_in = BufReader::with_capacity(IO_BUFFER_SIZE, File::open(right)?);
    let mut out = BufWriter::with_capacity(IO_BUFFER_SIZE, File::create(output)?);

    let mut left_read = 0u64;
    let mut right_read = 0u64;
    let mut written = 0u64;

    let mut left_head = framing.read_record(&mut left_in)?;
    let mut right_head = framing.read_record(&mut right_in)?;
    left_read += u64::from(left_head.is_some());
    right_read += u64::from(right_head.is_some());

    loop {
        let take_right = match (&left_head, &right_head) {
            (Some(l), Some(r)) => cmp(r, l) == Ordering::Less,
            (Some(_), None) => false,
            (None, Some(_)) => true,
            (None, None) => break,
        };

        if take_right {
            if let Some(record) = right_head.take() {
                framing.write_record(&mut out, &record)?;
            }
            right_head = framing.read_record(&mut right_in)?;
            right_read += u64::from(right_head.is_some());
        } else {
            if let Some(record) = left_head.take() {
                framing.write_record(&mut out, &record)?;
            }
            left_head = framing.read_record(&mut left_in)?;
            left_read += u64::from(left_head.is_some());
        }
        written += 1;
    }

    let out = out.into_inner().map_err(|e| e.into_error())?;
    let out_len = out.metadata()?.len();

    if written != left_read + right_read {
        return Err(SpillError::Integrity(format!(
            "merge of {} and {} wrote {} records, expected {} + {}",
            left.display(),
            right.display(),
            written,
            left_read,
            right_read
        )));
    }
    if out_len != left_len + right_len {
        return Err(SpillError::Integrity(format!(
            "merge of {} and {} wrote {} bytes, expected {} + {}",
            left.display(),
            right.display(),
            out_len,
            left_len,
            right_len
        )));
    }

    debug!(
        "Merged {} + {} records into {}",
        left_read,
        right_read,
        output.display()
    );
    Ok(written)
}

/// Path of the chunk at `position` produced in merge `round` (0 = split).
pub fn chunk_path(tempdir: &Path, position: usize, round: usize) -> PathBuf {
    tempdir.join(format!("{}-{}", position, round))
}

/// Rename `from` onto `to`, copying when they sit on different filesystems.
pub(crate) fn move_file(from: &Path, to: &Path) -> Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            fs::copy(from, to)?;
            fs::remove_file(from)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{LineFraming, RawLine};
    use crate::probe::FixedMemoryProbe;
    use tempfile::TempDir;

    fn by_key(a: &RawLine<u32>, b: &RawLine<u32>) -> Ordering {
        a.key.cmp(&b.key)
    }

    fn write_lines(path: &Path, records: &[(u32, &str)]) {
        let framing = LineFraming::<u32>::default();
        let mut out = File::create(path).unwrap();
        for (key, payload) in records {
            let record = RawLine {
                key: *key,
                payload: payload.as_bytes().to_vec(),
            };
            framing.write_record(&mut out, &record).unwrap();
        }
    }

    fn read_lines(path: &Path) -> Vec<RawLine<u32>> {
        let framing = LineFraming::<u32>::default();
        let mut input = BufReader::new(File::open(path).unwrap());
        let mut records = Vec::new();
        while let Some(record) = framing.read_record(&mut input).unwrap() {
            records.push(record);
        }
        records
    }

    fn keys(path: &Path) -> Vec<u32> {
        read_lines(path).into_iter().map(|r| r.key).collect()
    }

    fn sorter(host_bytes: u64) -> MergeSorter<LineFraming<u32>> {
        MergeSorter::new(
            LineFraming::default(),
            Arc::new(FixedMemoryProbe::new(host_bytes)),
        )
        .budget_policy(BudgetPolicy::exact())
    }

    #[test]
    fn test_merge_two_interleaved() {
        let dir = TempDir::new().unwrap();
        let left = dir.path().join("left");
        let right = dir.path().join("right");
        let out = dir.path().join("out");
        write_lines(&left, &[(1, "a"), (3, "c"), (5, "e"), (7, "g")]);
        write_lines(&right, &[(2, "b"), (4, "d"), (6, "f"), (8, "h")]);

        let framing = LineFraming::<u32>::default();
        let written = merge_two_files(&framing, &left, &right, &out, &by_key).unwrap();

        assert_eq!(written, 8);
        assert_eq!(keys(&out), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_merge_ties_favor_left() {
        let dir = TempDir::new().unwrap();
        let left = dir.path().join("left");
        let right = dir.path().join("right");
        let out = dir.path().join("out");
        write_lines(&left, &[(1, "left")]);
        write_lines(&right, &[(1, "right")]);

        let framing = LineFraming::<u32>::default();
        merge_two_files(&framing, &left, &right, &out, &by_key).unwrap();

        let records = read_lines(&out);
        assert_eq!(records[0].payload, b"left");
        assert_eq!(records[1].payload, b"right");
    }

    #[test]
    fn test_merge_with_empty_side() {
        let dir = TempDir::new().unwrap();
        let left = dir.path().join("left");
        let right = dir.path().join("right");
        let out = dir.path().join("out");
        write_lines(&left, &[]);
        write_lines(&right, &[(4, "x"), (9, "y")]);

        let framing = LineFraming::<u32>::default();
        let written = merge_two_files(&framing, &left, &right, &out, &by_key).unwrap();
        assert_eq!(written, 2);
        assert_eq!(keys(&out), vec![4, 9]);
    }

    #[test]
    fn test_merge_missing_input_is_io_error() {
        let dir = TempDir::new().unwrap();
        let left = dir.path().join("left");
        write_lines(&left, &[(1, "a")]);

        let framing = LineFraming::<u32>::default();
        let err = merge_two_files(
            &framing,
            &left,
            &dir.path().join("missing"),
            &dir.path().join("out"),
            &by_key,
        )
        .unwrap_err();
        assert!(matches!(err, SpillError::Io(_)));
    }

    #[test]
    fn test_merge_corrupt_input_is_integrity_error() {
        let dir = TempDir::new().unwrap();
        let left = dir.path().join("left");
        let right = dir.path().join("right");
        write_lines(&left, &[(1, "a")]);
        fs::write(&right, [0u8, 1]).unwrap();

        let framing = LineFraming::<u32>::default();
        let err = merge_two_files(&framing, &left, &right, &dir.path().join("out"), &by_key)
            .unwrap_err();
        assert!(matches!(err, SpillError::Integrity(_)));
    }

    #[test]
    fn test_chunk_path_pattern() {
        let path = chunk_path(Path::new("/scratch"), 3, 2);
        assert_eq!(path, PathBuf::from("/scratch/3-2"));
    }

    #[test]
    fn test_split_names_chunks_by_sequence() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("input");
        write_lines(&input, &[(5, "e"), (1, "a"), (4, "d"), (2, "b"), (3, "c")]);

        let sorter = sorter(0);
        let record = RawLine {
            key: 0u32,
            payload: b"a".to_vec(),
        };
        // Two records per chunk
        let limit = 2 * sorter.record_cost(&record) as u64;
        let sorter = MergeSorter::new(
            LineFraming::<u32>::default(),
            Arc::new(FixedMemoryProbe::new(u64::MAX)),
        )
        .budget_policy(BudgetPolicy::exact())
        .chunk_memory_limit(limit);

        let tmp = dir.path().join("tmp");
        let chunks = sorter
            .split_into_sorted_chunks(&[&input], &tmp, &by_key)
            .unwrap();

        assert_eq!(
            chunks,
            vec![tmp.join("0-0"), tmp.join("1-0"), tmp.join("2-0")]
        );
        assert_eq!(keys(&chunks[0]), vec![1, 5]);
        assert_eq!(keys(&chunks[1]), vec![2, 4]);
        assert_eq!(keys(&chunks[2]), vec![3]);
    }

    #[test]
    fn test_split_zero_budget_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("input");
        write_lines(&input, &[(1, "a")]);

        let err = sorter(1)
            .split_into_sorted_chunks(&[&input], dir.path(), &by_key)
            .unwrap_err();
        assert!(matches!(err, SpillError::Configuration(_)));
    }

    #[test]
    fn test_merge_keeps_caller_chunks_when_asked() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let c = dir.path().join("c");
        write_lines(&a, &[(1, "x"), (6, "x")]);
        write_lines(&b, &[(2, "x"), (5, "x")]);
        write_lines(&c, &[(3, "x"), (4, "x")]);

        let tmp = dir.path().join("tmp");
        let out = dir.path().join("out");
        let rounds = sorter(1 << 20)
            .merge_sorted_chunks(&tmp, vec![a.clone(), b.clone(), c.clone()], &out, &by_key, false)
            .unwrap();

        assert_eq!(rounds, 2);
        assert_eq!(keys(&out), vec![1, 2, 3, 4, 5, 6]);
        assert!(a.exists() && b.exists() && c.exists());
        assert_eq!(fs::read_dir(&tmp).unwrap().count(), 0);
    }

    #[test]
    fn test_merge_deletes_caller_chunks_when_asked() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        write_lines(&a, &[(2, "x")]);
        write_lines(&b, &[(1, "x")]);

        let tmp = dir.path().join("tmp");
        let out = dir.path().join("out");
        sorter(1 << 20)
            .merge_sorted_chunks(&tmp, vec![a.clone(), b.clone()], &out, &by_key, true)
            .unwrap();

        assert_eq!(keys(&out), vec![1, 2]);
        assert!(!a.exists() && !b.exists());
    }

    #[test]
    fn test_merge_single_kept_chunk_is_copied() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        write_lines(&a, &[(1, "x"), (2, "y")]);

        let out = dir.path().join("out");
        let rounds = sorter(1 << 20)
            .merge_sorted_chunks(dir.path(), vec![a.clone()], &out, &by_key, false)
            .unwrap();

        assert_eq!(rounds, 0);
        assert!(a.exists());
        assert_eq!(keys(&out), vec![1, 2]);
    }

    #[test]
    fn test_merge_no_chunks_creates_empty_output() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out");
        sorter(1 << 20)
            .merge_sorted_chunks(dir.path(), Vec::new(), &out, &by_key, true)
            .unwrap();
        assert_eq!(fs::metadata(&out).unwrap().len(), 0);
    }

    #[test]
    fn test_sort_many_chunks_cleans_up() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("input");
        let records: Vec<(u32, &str)> = (0..50u32).rev().map(|k| (k * 7 % 50, "p")).collect();
        write_lines(&input, &records);

        let probe_record = RawLine {
            key: 0u32,
            payload: b"p".to_vec(),
        };
        let cost = sorter(0).record_cost(&probe_record) as u64;
        let sorter = sorter(2 * 6 * cost).threads(4);

        let tmp = dir.path().join("tmp");
        let out = dir.path().join("out");
        let stats = sorter.sort(&[&input], &tmp, &out, &by_key).unwrap();

        assert_eq!(stats.records, 50);
        assert_eq!(stats.chunks_written, 9);
        assert_eq!(stats.merge_rounds, 4);
        assert_eq!(keys(&out), (0..50).collect::<Vec<_>>());
        assert!(input.exists());
        assert_eq!(fs::read_dir(&tmp).unwrap().count(), 0);
    }
}
