use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpillError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record counts or framing disagree across a transformation.
    #[error("integrity fault: {0}")]
    Integrity(String),

    /// A computed memory budget left no room to make progress.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("Invalid key specification: {0}")]
    InvalidKey(String),

    #[error("Invalid field delimiter: must be a single byte")]
    InvalidDelimiter,

    #[error("Invalid buffer size: {0}")]
    InvalidBufferSize(String),
}

pub type Result<T> = std::result::Result<T, SpillError>;
