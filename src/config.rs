use std::path::PathBuf;

use crate::budget::{BudgetPolicy, MIB};
use crate::cli::{Args, parse_size};
use crate::error::Result;
use crate::key::KeyField;

/// Runtime configuration derived from CLI arguments
#[derive(Clone, Debug)]
pub struct Config {
    pub key: KeyField,
    pub field_separator: Option<u8>,
    pub record_delimiter: u8,
    pub reverse: bool,
    /// Upper bound on bytes of lines held in memory
    pub buffer_size: u64,
    pub policy: BudgetPolicy,
    pub temp_dir: Option<PathBuf>,
    pub threads: usize,
    pub output_file: Option<String>,
    pub input_files: Vec<String>,
}

impl Config {
    /// Build configuration from parsed CLI arguments
    pub fn from_args(args: &Args) -> Result<Self> {
        let policy = BudgetPolicy {
            host_margin: parse_size(&args.reserve)?,
            granularity: MIB,
            ..BudgetPolicy::default()
        };

        Ok(Config {
            key: KeyField::parse(&args.key)?,
            field_separator: args.field_separator()?,
            record_delimiter: args.record_delimiter(),
            reverse: args.reverse,
            buffer_size: parse_size(&args.buffer_size)?,
            policy,
            temp_dir: args.temp_dir.as_ref().map(PathBuf::from),
            threads: args.parallel.max(1),
            output_file: args.output.clone(),
            input_files: args.files.clone(),
        })
    }
}
