use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, VhdxError>;

/// Everything that can go wrong decoding a VHDX file or chain.
///
/// Strict-mode-only variants (the ones the teacher's source downgrades to a
/// warning under `ignore_faults`) sit next to the handful that stay fatal no
/// matter the mode, because they can't be locally recovered from: `Io`,
/// `OutOfRange`, `InferredSizeTooLarge`, `InvalidBitmapState`,
/// `UnresolvedSector`.
#[derive(Debug, Error)]
pub enum VhdxError {
    #[error("short read at offset {offset}: wanted {wanted} bytes, got {got}")]
    ShortRead {
        offset: u64,
        wanted: usize,
        got: usize,
    },

    #[error("bad magic in {section}: expected {expected:?}, got {got:?}")]
    BadMagic {
        section: &'static str,
        expected: &'static [u8],
        got: Vec<u8>,
    },

    #[error("unsupported {section} version: expected {expected}, got {got}")]
    UnsupportedVersion {
        section: &'static str,
        expected: u16,
        got: u16,
    },

    #[error("invalid GUID string {0:?}")]
    InvalidGuid(String),

    #[error("region table has {count} entries, over the 2047 limit")]
    RegionTableOverflow { count: u32 },

    #[error("duplicate region table key {0}")]
    DuplicateRegionKey(uuid::Uuid),

    #[error("region table copies do not match")]
    RegionTableMismatch,

    #[error("bad metadata: {0}")]
    BadMetadata(String),

    #[error("duplicate metadata key {0}")]
    DuplicateMetadataKey(&'static str),

    #[error("no metadata region and no fallback metadata supplied")]
    NoMetadata,

    #[error("fallback metadata is missing required field {0}")]
    MissingFallbackFields(&'static str),

    #[error("inferred virtual disk size {inferred} exceeds ceiling {ceiling}")]
    InferredSizeTooLarge { inferred: u64, ceiling: u64 },

    #[error("sector {sector} is out of range (disk has {sector_count} sectors)")]
    OutOfRange { sector: i64, sector_count: u64 },

    #[error("invalid sector bitmap BAT entry state {0}")]
    InvalidBitmapState(u8),

    #[error("invalid BAT entry state {0}")]
    InvalidBatEntryState(u8),

    #[error("block too short to contain sector at byte offset {offset}: wanted {wanted} bytes, got {got}")]
    TruncatedBlock {
        offset: usize,
        wanted: usize,
        got: usize,
    },

    #[error("no layer in the chain claimed sector {0}")]
    UnresolvedSector(u64),

    #[error("missing required region {0}")]
    MissingRegion(&'static str),

    #[error("the base of a chain must not be a differencing disk")]
    DifferencingBase,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("parse error in {section}: {message}")]
    Parse {
        section: &'static str,
        message: String,
    },
}

/// Converts a borrowed-input `nom` failure into an owned [`VhdxError::Parse`].
///
/// `nom`'s error type borrows from the buffer it failed on, which cannot
/// outlive that buffer; every call site that runs a `nom` parser over a
/// stack buffer converts at the boundary instead of trying to propagate the
/// borrow, which is what the teacher's own half-finished `Error<I>` wrapper
/// in the original `src/error.rs` was reaching for.
pub(crate) fn parse_err<I: std::fmt::Debug>(
    section: &'static str,
) -> impl FnOnce(nom::Err<nom::error::Error<I>>) -> VhdxError {
    move |e| VhdxError::Parse {
        section,
        message: format!("{e:?}"),
    }
}
