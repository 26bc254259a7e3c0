use thiserror::Error;

/// Top-level demo-driver errors.
///
/// This enum represents failures that occur during orchestration
/// (argument handling, file I/O, the load itself).
#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error while reading PE file")]
    Io(#[from] std::io::Error),

    #[error("failed to load PE image")]
    Load(#[from] PeError),
}

/// PE loading and lookup errors.
///
/// These errors represent failures while validating, mapping, fixing up,
/// or starting a PE image. Malformed structures inside the image surface
/// as `OutOfBounds`/`RelocationOutOfBounds` instead of faulting.
#[derive(Debug, Error)]
pub enum PeError {
    #[error("buffer too small for a DOS header")]
    BufferTooSmall,

    #[error("invalid DOS signature")]
    InvalidDosSignature,

    #[error("invalid NT signature")]
    InvalidNtSignature,

    #[error("unsupported optional header magic {0:#06x}")]
    UnsupportedOptionalMagic(u16),

    #[error("image machine {0:#06x} does not match the host architecture")]
    MachineMismatch(u16),

    #[error("structure extends beyond its containing region")]
    OutOfBounds,

    #[error("failed to allocate {0:#x} bytes for the image")]
    AllocationFailed(usize),

    #[error("relocation target lies outside the mapped image")]
    RelocationOutOfBounds,

    #[error("failed to load imported module '{0}'")]
    DependencyLoadFailed(String),

    #[error("failed to resolve import '{symbol}' from '{dll}'")]
    ImportResolveFailed { dll: String, symbol: String },

    #[error("failed to change memory protection for section {index}")]
    SectionProtectionFailed { index: usize },

    #[error("DLL entry point reported failure on process attach")]
    EntryPointFailed,
}
