use thiserror::Error;

/// Errors surfaced by the construction and I/O layers. GPU-load denial and
/// soft-RAM pressure are handled internally and never reach this type.
#[derive(Debug, Error)]
pub enum Error {
    /// Unreadable file, malformed header or out-of-range input coordinates.
    #[error("input error: {0}")]
    Input(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A broken internal assumption. Indicates a bug, not a usable-input
    /// condition.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// `traverse_down` would shift the sentinel bit out of the code width.
    #[error("morton overflow descending below level {0}")]
    MortonOverflow(u8),

    #[error("gpu error: {0}")]
    Gpu(String),
}

pub type Result<T> = std::result::Result<T, Error>;
