use crate::error::{Result, SpillError};

/// Field selected by the -k argument
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyField {
    /// Field number (1-indexed)
    pub field: usize,
}

impl Default for KeyField {
    fn default() -> Self {
        Self { field: 1 }
    }
}

impl KeyField {
    /// Parse a key specification like "2" or "2,2"
    ///
    /// Only single-field keys are supported, so an end field must match the
    /// start field.
    pub fn parse(s: &str) -> Result<Self> {
        let (start, end) = match s.split_once(',') {
            Some((start, end)) => (start, Some(end)),
            None => (s, None),
        };

        let field = parse_field(start)?;
        if field == 0 {
            return Err(SpillError::InvalidKey(
                "field number must be >= 1".to_string(),
            ));
        }
        if let Some(end) = end {
            if parse_field(end)? != field {
                return Err(SpillError::InvalidKey(format!(
                    "key must be a single field: {}",
                    s
                )));
            }
        }

        Ok(KeyField { field })
    }

    /// Integer key of `record`. Missing or non-numeric fields give 0.
    pub fn extract(&self, record: &[u8], field_separator: Option<u8>) -> i64 {
        let fields = split_fields(record, field_separator);
        self.field
            .checked_sub(1)
            .and_then(|index| fields.get(index))
            .map(|field| parse_leading_integer(field))
            .unwrap_or(0)
    }
}

/// Parse "FIELD", tolerating a trailing `n` modifier
fn parse_field(s: &str) -> Result<usize> {
    let digits = s.strip_suffix('n').unwrap_or(s);
    digits
        .parse()
        .map_err(|_| SpillError::InvalidKey(format!("invalid field number: {}", s)))
}

/// Parse the leading integer of a field
///
/// - Skips leading blanks (space and tab)
/// - Accepts one optional sign
/// - Stops at the first non-digit
/// - Saturates at the `i64` range
/// - Returns 0 when no digits follow
pub fn parse_leading_integer(s: &[u8]) -> i64 {
    let s = match s.iter().position(|&b| b != b' ' && b != b'\t') {
        Some(start) => &s[start..],
        None => return 0,
    };

    let (negative, digits) = match s.first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };

    let mut value: i64 = 0;
    for &b in digits.iter().take_while(|b| b.is_ascii_digit()) {
        let digit = i64::from(b - b'0');
        value = if negative {
            value.saturating_mul(10).saturating_sub(digit)
        } else {
            value.saturating_mul(10).saturating_add(digit)
        };
    }
    value
}

/// Split record into fields based on separator
fn split_fields(record: &[u8], separator: Option<u8>) -> Vec<&[u8]> {
    match separator {
        Some(sep) => record.split(|&b| b == sep).collect(),
        // Default: runs of blanks separate fields, leading blanks are skipped
        None => record
            .split(|&b| b == b' ' || b == b'\t')
            .filter(|field| !field.is_empty())
            .collect(),
    }
}
