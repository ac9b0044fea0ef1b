use thiserror::Error;

/// A non-fatal finding surfaced by the consistency checker or by best-effort
/// recovery during conversion. Does not abort a conversion by itself.
#[derive(Error, Debug, Clone)]
pub enum Warning {
    #[error("block {block} is marked allocated but is not referenced by any catalog or extents record")]
    OrphanedBlock { block: u32 },

    #[error("CNID {cnid} extent at index {index} overlaps a block already claimed by CNID {other}")]
    OverlappingExtent { cnid: u32, index: usize, other: u32 },

    #[error("text encoding conversion for CNID {cnid} fell back to MacRoman: {reason}")]
    EncodingFallback { cnid: u32, reason: String },

    #[error("catalog thread for CNID {cnid} is missing; entry will be unreachable by path")]
    MissingThread { cnid: u32 },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed source volume: {0}")]
    MalformedSource(String),

    #[error("inconsistent source volume ({} warning(s)): {first}", .warnings.len(), first = .warnings.first().map(|w| w.to_string()).unwrap_or_default())]
    InconsistentSource { warnings: Vec<Warning> },

    #[error("text encoding conversion failed: {0}")]
    EncodingFailure(String),

    #[error("insufficient space on destination volume: need {needed} blocks, have {available}")]
    InsufficientSpace { needed: u64, available: u64 },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid signature: 0x{0:04X}")]
    InvalidSignature(u16),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),
}

pub type Result<T> = std::result::Result<T, Error>;
