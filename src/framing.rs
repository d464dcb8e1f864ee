//! Record framing
//!
//! Two on-disk encodings are supported:
//!
//! - **Line**: `[native-endian key][payload][terminator]`. The key has a fixed
//!   width so it can be read and compared without touching the payload.
//! - **Arena**: records packed back to back with no delimiter. Each record
//!   starts with a header from which its own length can be derived.
//!
//! Element types opt in through [`LineSerializable`] or [`ArenaSerializable`];
//! the merge engine only ever sees a [`Framing`] and its raw records.

use std::fmt;
use std::io::{self, BufRead, Read, Write};
use std::marker::PhantomData;

use crate::error::{Result, SpillError};

/// Fixed-width integer key stored at the front of a line record
pub trait SortKey: Copy + Ord + Send + Sync + fmt::Debug {
    /// Encoded width in bytes
    const WIDTH: usize;

    fn write_ne<W: Write>(&self, out: &mut W) -> io::Result<()>;

    fn read_ne<R: Read>(input: &mut R) -> io::Result<Self>;
}

macro_rules! impl_sort_key {
    ($($t:ty),*) => {
        $(
            impl SortKey for $t {
                const WIDTH: usize = std::mem::size_of::<$t>();

                fn write_ne<W: Write>(&self, out: &mut W) -> io::Result<()> {
                    out.write_all(&self.to_ne_bytes())
                }

                fn read_ne<R: Read>(input: &mut R) -> io::Result<Self> {
                    let mut raw = [0u8; <$t as SortKey>::WIDTH];
                    input.read_exact(&mut raw)?;
                    Ok(<$t>::from_ne_bytes(raw))
                }
            }
        )*
    };
}

impl_sort_key!(u32, u64, i32, i64);

/// Produces a sort key without a full encode/decode round
pub trait KeyExtractable {
    type Key: SortKey;

    fn sort_key(&self) -> Self::Key;
}

/// Element stored as a line record
pub trait LineSerializable: KeyExtractable + Sized {
    /// Append the payload bytes. They must not contain the line terminator.
    fn encode_payload(&self, out: &mut Vec<u8>);

    fn decode(key: Self::Key, payload: &[u8]) -> Result<Self>;

    /// Heap bytes owned by the element beyond `size_of::<Self>()`
    fn heap_bytes(&self) -> usize {
        0
    }
}

/// Element stored as a self-delimiting contiguous record
pub trait ArenaSerializable: Sized {
    /// Bytes needed before [`ArenaSerializable::encoded_len`] can answer
    const HEADER_LEN: usize;

    /// Upper bound on any single encoding
    const MAX_ENCODED_LEN: usize;

    /// Encode into `dst`, returning the bytes written, or `None` if it did not fit.
    fn encode_into(&self, dst: &mut [u8]) -> Option<usize>;

    /// Total record length given its first `HEADER_LEN` bytes
    fn encoded_len(header: &[u8]) -> usize;

    fn decode(src: &[u8]) -> Result<Self>;
}

/// How the merge engine reads, writes and accounts for records
pub trait Framing: Sync {
    type Record: Send + Sync;

    /// Read the next record, returning None at a clean end of input
    fn read_record<R: BufRead>(&self, input: &mut R) -> Result<Option<Self::Record>>;

    fn write_record<W: Write>(&self, out: &mut W, record: &Self::Record) -> Result<()>;

    /// Bytes charged against a split batch budget for holding `record`
    fn footprint(&self, record: &Self::Record) -> usize;
}

/// A line record with its payload left encoded
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawLine<K> {
    pub key: K,
    pub payload: Vec<u8>,
}

/// `[key][payload][terminator]` framing
pub struct LineFraming<K> {
    terminator: u8,
    _key: PhantomData<fn() -> K>,
}

impl<K: SortKey> LineFraming<K> {
    pub fn new(terminator: u8) -> Self {
        Self {
            terminator,
            _key: PhantomData,
        }
    }

    /// Write an element directly, using `scratch` to hold its payload
    pub fn write_element<T, W>(
        &self,
        out: &mut W,
        element: &T,
        scratch: &mut Vec<u8>,
    ) -> Result<()>
    where
        T: LineSerializable<Key = K>,
        W: Write,
    {
        scratch.clear();
        element.encode_payload(scratch);
        self.write_parts(out, element.sort_key(), scratch)
    }

    /// Decode an element from a raw record
    pub fn decode_element<T>(&self, record: &RawLine<K>) -> Result<T>
    where
        T: LineSerializable<Key = K>,
    {
        T::decode(record.key, &record.payload)
    }

    fn write_parts<W: Write>(&self, out: &mut W, key: K, payload: &[u8]) -> Result<()> {
        if payload.contains(&self.terminator) {
            return Err(SpillError::Integrity(format!(
                "payload for key {:?} contains the record terminator {:#04x}",
                key, self.terminator
            )));
        }
        key.write_ne(out)?;
        out.write_all(payload)?;
        out.write_all(&[self.terminator])?;
        Ok(())
    }
}

impl<K: SortKey> Default for LineFraming<K> {
    fn default() -> Self {
        Self::new(b'\n')
    }
}

impl<K> Clone for LineFraming<K> {
    fn clone(&self) -> Self {
        Self {
            terminator: self.terminator,
            _key: PhantomData,
        }
    }
}

impl<K: SortKey> Framing for LineFraming<K> {
    type Record = RawLine<K>;

    fn read_record<R: BufRead>(&self, input: &mut R) -> Result<Option<RawLine<K>>> {
        if input.fill_buf()?.is_empty() {
            return Ok(None);
        }

        let key = K::read_ne(input).map_err(|e| truncated(e, "key"))?;

        let mut payload = Vec::new();
        input.read_until(self.terminator, &mut payload)?;
        if payload.last() != Some(&self.terminator) {
            return Err(SpillError::Integrity(format!(
                "record with key {:?} is missing its terminator",
                key
            )));
        }
        payload.pop();

        Ok(Some(RawLine { key, payload }))
    }

    fn write_record<W: Write>(&self, out: &mut W, record: &RawLine<K>) -> Result<()> {
        self.write_parts(out, record.key, &record.payload)
    }

    fn footprint(&self, record: &RawLine<K>) -> usize {
        std::mem::size_of::<RawLine<K>>() + record.payload.len()
    }
}

/// Contiguous self-delimiting framing for [`ArenaSerializable`] elements
pub struct ArenaFraming<T> {
    _element: PhantomData<fn() -> T>,
}

impl<T: ArenaSerializable> ArenaFraming<T> {
    pub fn new() -> Self {
        Self {
            _element: PhantomData,
        }
    }

    /// Length of the record starting at `bytes`, validated against the bounds
    pub fn record_len(bytes: &[u8]) -> Result<usize> {
        if bytes.len() < T::HEADER_LEN {
            return Err(SpillError::Integrity("truncated record header".to_string()));
        }
        let len = T::encoded_len(&bytes[..T::HEADER_LEN]);
        if len < T::HEADER_LEN || len > T::MAX_ENCODED_LEN {
            return Err(SpillError::Integrity(format!(
                "record length {} outside [{}, {}]",
                len,
                T::HEADER_LEN,
                T::MAX_ENCODED_LEN
            )));
        }
        Ok(len)
    }
}

impl<T: ArenaSerializable> Default for ArenaFraming<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ArenaSerializable> Framing for ArenaFraming<T> {
    type Record = Vec<u8>;

    fn read_record<R: BufRead>(&self, input: &mut R) -> Result<Option<Vec<u8>>> {
        if input.fill_buf()?.is_empty() {
            return Ok(None);
        }

        let mut record = vec![0u8; T::HEADER_LEN];
        input
            .read_exact(&mut record)
            .map_err(|e| truncated(e, "header"))?;
        let len = Self::record_len(&record)?;
        record.resize(len, 0);
        input
            .read_exact(&mut record[T::HEADER_LEN..])
            .map_err(|e| truncated(e, "body"))?;

        Ok(Some(record))
    }

    fn write_record<W: Write>(&self, out: &mut W, record: &Vec<u8>) -> Result<()> {
        out.write_all(record)?;
        Ok(())
    }

    fn footprint(&self, record: &Vec<u8>) -> usize {
        std::mem::size_of::<Vec<u8>>() + record.len()
    }
}

fn truncated(e: io::Error, part: &str) -> SpillError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        SpillError::Integrity(format!("record {} truncated at end of file", part))
    } else {
        SpillError::Io(e)
    }
}
