//! External merge sort through the public API

use std::cmp::Ordering;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use proptest::prelude::*;
use tempfile::TempDir;

use spillsort::{
    ArenaFraming, BudgetPolicy, FixedMemoryProbe, Framing, LineFraming, MergeSorter, RawLine,
    SpillError, merge_two_files,
};

fn by_key(a: &RawLine<i64>, b: &RawLine<i64>) -> Ordering {
    a.key.cmp(&b.key)
}

fn write_keys(path: &Path, keys: &[i64]) {
    let framing = LineFraming::<i64>::default();
    let mut out = File::create(path).unwrap();
    for key in keys {
        let record = RawLine {
            key: *key,
            payload: format!("k{}", key).into_bytes(),
        };
        framing.write_record(&mut out, &record).unwrap();
    }
}

fn read_keys(path: &Path) -> Vec<i64> {
    let framing = LineFraming::<i64>::default();
    let mut input = BufReader::new(File::open(path).unwrap());
    let mut keys = Vec::new();
    while let Some(record) = framing.read_record(&mut input).unwrap() {
        assert_eq!(record.payload, format!("k{}", record.key).into_bytes());
        keys.push(record.key);
    }
    keys
}

#[test]
fn test_two_presorted_files_interleave() {
    let dir = TempDir::new().unwrap();
    let (left, right, out) = (dir.path().join("a"), dir.path().join("b"), dir.path().join("c"));
    write_keys(&left, &[1, 3, 5, 7]);
    write_keys(&right, &[2, 4, 6, 8]);

    let framing = LineFraming::<i64>::default();
    let written = merge_two_files(&framing, &left, &right, &out, &by_key).unwrap();

    assert_eq!(written, 8);
    assert_eq!(read_keys(&out), vec![1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn test_negative_keys_order_numerically() {
    let dir = TempDir::new().unwrap();
    let (left, right, out) = (dir.path().join("a"), dir.path().join("b"), dir.path().join("c"));
    write_keys(&left, &[-10, 0, 10]);
    write_keys(&right, &[-5, 5]);

    merge_two_files(&LineFraming::<i64>::default(), &left, &right, &out, &by_key).unwrap();

    assert_eq!(read_keys(&out), vec![-10, -5, 0, 5, 10]);
}

#[test]
fn test_sort_several_inputs_into_one_output() {
    let dir = TempDir::new().unwrap();
    let inputs = [dir.path().join("in0"), dir.path().join("in1"), dir.path().join("in2")];
    write_keys(&inputs[0], &[9, 1, 8]);
    write_keys(&inputs[1], &[]);
    write_keys(&inputs[2], &[7, 2, 6, 3, 5, 4]);
    let out = dir.path().join("out");

    let sorter = MergeSorter::new(
        LineFraming::<i64>::default(),
        Arc::new(FixedMemoryProbe::new(256)),
    )
    .budget_policy(BudgetPolicy::exact());
    let stats = sorter.sort(&inputs, &dir.path().join("tmp"), &out, &by_key).unwrap();

    assert_eq!(stats.records, 9);
    assert!(stats.chunks_written > 1);
    assert_eq!(read_keys(&out), (1..=9).collect::<Vec<i64>>());
    // Caller inputs are read, never consumed
    assert!(inputs.iter().all(|p| p.exists()));
}

#[test]
fn test_device_memory_caps_chunk_budget() {
    let sorter = MergeSorter::new(
        LineFraming::<i64>::default(),
        Arc::new(FixedMemoryProbe::with_device(1 << 30, 1 << 20)),
    )
    .budget_policy(BudgetPolicy::exact());

    assert_eq!(sorter.chunk_budget(), 1 << 19);
}

#[test]
fn test_arena_framing_sorts_raw_records() {
    // [len][key]: a two-byte self-delimiting record
    struct Byte;
    impl spillsort::ArenaSerializable for Byte {
        const HEADER_LEN: usize = 1;
        const MAX_ENCODED_LEN: usize = 2;

        fn encode_into(&self, _dst: &mut [u8]) -> Option<usize> {
            None
        }

        fn encoded_len(header: &[u8]) -> usize {
            header[0] as usize
        }

        fn decode(_src: &[u8]) -> spillsort::Result<Self> {
            Ok(Byte)
        }
    }

    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in");
    std::fs::write(&input, [2, 30, 2, 10, 2, 20]).unwrap();
    let out = dir.path().join("out");

    let sorter = MergeSorter::new(
        ArenaFraming::<Byte>::new(),
        Arc::new(FixedMemoryProbe::new(1 << 20)),
    )
    .budget_policy(BudgetPolicy::exact());
    let by_bytes = |a: &Vec<u8>, b: &Vec<u8>| a.cmp(b);
    sorter.sort(&[&input], dir.path(), &out, &by_bytes).unwrap();

    assert_eq!(std::fs::read(&out).unwrap(), vec![2, 10, 2, 20, 2, 30]);
}

#[test]
fn test_truncated_chunk_is_integrity_fault() {
    let dir = TempDir::new().unwrap();
    let (left, right, out) = (dir.path().join("a"), dir.path().join("b"), dir.path().join("c"));
    write_keys(&left, &[1, 2]);
    // Half a key
    std::fs::write(&right, [0u8; 4]).unwrap();

    let framing = LineFraming::<i64>::default();
    let err = merge_two_files(&framing, &left, &right, &out, &by_key).unwrap_err();
    assert!(matches!(err, SpillError::Integrity(_)));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn proptest_merge_keeps_every_record(
        mut left in proptest::collection::vec(-1000i64..1000, 0..60),
        mut right in proptest::collection::vec(-1000i64..1000, 0..60),
    ) {
        left.sort_unstable();
        right.sort_unstable();
        let dir = TempDir::new().unwrap();
        let (l, r, out) = (dir.path().join("a"), dir.path().join("b"), dir.path().join("c"));
        write_keys(&l, &left);
        write_keys(&r, &right);

        let framing = LineFraming::<i64>::default();
        let written = merge_two_files(&framing, &l, &r, &out, &by_key).unwrap();
        prop_assert_eq!(written, (left.len() + right.len()) as u64);

        let mut expected = [left, right].concat();
        expected.sort_unstable();
        prop_assert_eq!(read_keys(&out), expected);
    }
}
