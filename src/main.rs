use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use env_logger::Env;
use log::{debug, info};

use spillsort::cli::Args;
use spillsort::compare::KeyOrder;
use spillsort::config::Config;
use spillsort::error::Result;
use spillsort::input::{KeyedLine, RecordReader};
use spillsort::output;
use spillsort::probe::SystemMemoryProbe;
use spillsort::store::VariableStore;

/// Set up SIGPIPE handling for Unix systems
/// This prevents "broken pipe" errors when output is piped to commands like `head`
#[cfg(unix)]
fn setup_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }
}

#[cfg(not(unix))]
fn setup_sigpipe() {
    // Windows doesn't have SIGPIPE
}

fn main() {
    setup_sigpipe();
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();

    if let Err(e) = run() {
        eprintln!("spillsort: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_args(&args)?;

    let scratch_parent = config
        .temp_dir
        .as_deref()
        .unwrap_or_else(|| Path::new("."));
    let scratch = tempfile::Builder::new()
        .prefix(".spillsort-")
        .tempdir_in(scratch_parent)?;
    debug!("Scratch directory {}", scratch.path().display());

    let mut store = VariableStore::<KeyedLine>::new(
        scratch.path().join("store"),
        config.buffer_size,
        Arc::new(SystemMemoryProbe::new()),
    )?
    .budget_policy(config.policy)
    .terminator(config.record_delimiter)
    .threads(config.threads);

    if config.input_files.is_empty() {
        load(&mut store, io::stdin().lock(), &config)?;
    } else {
        for path in &config.input_files {
            if path == "-" {
                load(&mut store, io::stdin().lock(), &config)?;
            } else {
                load(&mut store, BufReader::new(File::open(path)?), &config)?;
            }
        }
    }
    info!(
        "Loaded {} lines ({} in memory, {} spilled)",
        store.total_element_count(),
        store.element_count_in_memory(),
        store.element_count_in_file()
    );

    let order = KeyOrder::new(config.reverse);
    let stats = store.sort(scratch.path(), |a, b| order.compare(a, b))?;
    info!(
        "Sorted {} lines: in_memory={} chunks={} merge_rounds={}",
        stats.records, stats.in_memory, stats.chunks_written, stats.merge_rounds
    );
    store.flush()?;

    let mut out = output::open_output(config.output_file.as_deref())?;
    let mut reader = store.make_reader()?;
    output::write_records(&mut out, &mut reader, config.record_delimiter)?;
    drop(reader);
    drop(store);

    scratch.close()?;
    Ok(())
}

fn load<R: BufRead>(store: &mut VariableStore<KeyedLine>, input: R, config: &Config) -> Result<()> {
    let mut records = RecordReader::new(input, config.record_delimiter);
    while let Some(record) = records.read_record()? {
        let key = config.key.extract(record, config.field_separator);
        store.insert(KeyedLine {
            key,
            line: record.to_vec(),
        })?;
    }
    Ok(())
}
