use std::io::{self, BufRead};

use crate::error::Result;
use crate::framing::{KeyExtractable, LineSerializable};

/// Reads records from input, splitting on the specified delimiter
pub struct RecordReader<R> {
    reader: R,
    delimiter: u8,
    buffer: Vec<u8>,
}

impl<R: BufRead> RecordReader<R> {
    pub fn new(reader: R, delimiter: u8) -> Self {
        Self {
            reader,
            delimiter,
            buffer: Vec::new(),
        }
    }

    /// Read the next record, returning None at EOF
    pub fn read_record(&mut self) -> io::Result<Option<&[u8]>> {
        self.buffer.clear();
        let bytes_read = self.reader.read_until(self.delimiter, &mut self.buffer)?;

        if bytes_read == 0 {
            return Ok(None);
        }

        // Strip delimiter if present at end
        if self.buffer.last() == Some(&self.delimiter) {
            self.buffer.pop();
        }

        Ok(Some(&self.buffer))
    }
}

/// An input line together with its parsed integer key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyedLine {
    pub key: i64,
    pub line: Vec<u8>,
}

impl KeyExtractable for KeyedLine {
    type Key = i64;

    fn sort_key(&self) -> i64 {
        self.key
    }
}

impl LineSerializable for KeyedLine {
    fn encode_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.line);
    }

    fn decode(key: i64, payload: &[u8]) -> Result<Self> {
        Ok(KeyedLine {
            key,
            line: payload.to_vec(),
        })
    }

    fn heap_bytes(&self) -> usize {
        self.line.capacity()
    }
}
