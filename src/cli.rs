use clap::Parser;

use crate::error::{Result, SpillError};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "spillsort",
    about = "Sort lines by an integer key, spilling to disk when memory runs short"
)]
pub struct Args {
    /// Field holding the integer sort key (1-indexed)
    #[arg(short = 'k', long = "key", value_name = "FIELD", default_value = "1")]
    pub key: String,

    /// Use SEP as field separator
    #[arg(short = 't', long = "field-separator", value_name = "SEP")]
    pub delimiter: Option<String>,

    /// Reverse the result of comparisons
    #[arg(short = 'r', long)]
    pub reverse: bool,

    /// Use NUL as line delimiter
    #[arg(short = 'z', long = "zero-terminated")]
    pub zero_terminated: bool,

    /// Keep at most SIZE bytes of lines in memory (K, M, G suffixes)
    #[arg(short = 'S', long = "buffer-size", value_name = "SIZE", default_value = "1G")]
    pub buffer_size: String,

    /// Free memory never touched while buffering (K, M, G suffixes)
    #[arg(long = "reserve", value_name = "SIZE", default_value = "1G")]
    pub reserve: String,

    /// Create the private scratch directory inside DIR
    #[arg(short = 'T', long = "temporary-directory", value_name = "DIR")]
    pub temp_dir: Option<String>,

    /// Sort chunks with N threads
    #[arg(long = "parallel", value_name = "N", default_value_t = 1)]
    pub parallel: usize,

    /// Write result to FILE instead of stdout
    #[arg(short = 'o', long, value_name = "FILE")]
    pub output: Option<String>,

    /// Input files
    #[arg(value_name = "FILE")]
    pub files: Vec<String>,
}

impl Args {
    /// Parse -t argument, handling '\0' escape for NUL byte
    pub fn field_separator(&self) -> Result<Option<u8>> {
        let Some(s) = &self.delimiter else {
            return Ok(None);
        };
        match s.as_bytes() {
            [byte] => Ok(Some(*byte)),
            [b'\\', escape] => match escape {
                b't' => Ok(Some(b'\t')),
                b'0' => Ok(Some(0u8)),
                b'\\' => Ok(Some(b'\\')),
                _ => Err(SpillError::InvalidDelimiter),
            },
            _ => Err(SpillError::InvalidDelimiter),
        }
    }

    /// Get the record delimiter (newline or NUL)
    pub fn record_delimiter(&self) -> u8 {
        if self.zero_terminated { 0u8 } else { b'\n' }
    }
}

/// Parse a size like "512", "64K", "1M" or "2G" into bytes.
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let invalid = || SpillError::InvalidBufferSize(s.to_string());

    let (digits, multiplier) = match s.char_indices().last() {
        None => return Err(invalid()),
        Some((idx, c)) if c.is_ascii_alphabetic() => {
            let multiplier: u64 = match c.to_ascii_uppercase() {
                'K' => 1 << 10,
                'M' => 1 << 20,
                'G' => 1 << 30,
                'T' => 1 << 40,
                _ => return Err(invalid()),
            };
            (&s[..idx], multiplier)
        }
        Some(_) => (s, 1),
    };

    let base: u64 = digits.parse().map_err(|_| invalid())?;
    base.checked_mul(multiplier).ok_or_else(invalid)
}
