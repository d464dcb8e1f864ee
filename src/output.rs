use std::fs::File;
use std::io::{self, BufWriter, Write};

use bstr::ByteSlice;
use log::trace;

use crate::error::Result;
use crate::input::KeyedLine;
use crate::reader::Reader;

/// Drain `reader` into `writer`, one line per record.
///
/// Returns the number of lines written.
pub fn write_records<W: Write>(
    writer: W,
    reader: &mut Reader<'_, KeyedLine>,
    delimiter: u8,
) -> Result<u64> {
    let mut writer = BufWriter::new(writer);
    let mut written = 0u64;

    while let Some(record) = reader.next_element()? {
        trace!("{:>20} {}", record.key, record.line.as_bstr());
        writer.write_all(&record.line)?;
        writer.write_all(&[delimiter])?;
        written += 1;
    }

    writer.flush()?;
    Ok(written)
}

/// Open output file or return stdout
pub fn open_output(path: Option<&str>) -> io::Result<Box<dyn Write>> {
    match path {
        Some(path) => {
            let file = File::create(path)?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(io::stdout())),
    }
}
