use thiserror::Error;

/// Crate-wide error kinds, per the error handling design: each is a distinct
/// failure mode that the CLI shim maps to a stderr diagnostic and exit code 1.
#[derive(Error, Debug)]
pub enum DemuxError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("format error: {0}")]
    Format(String),

    #[error(
        "inconsistent barcode length: entry {name} has idx1/idx2 length \
         ({idx1_len}, {idx2_len}), expected ({expected_idx1_len}, \
         {expected_idx2_len})"
    )]
    InconsistentBarcodeLength {
        name: String,
        idx1_len: usize,
        idx2_len: usize,
        expected_idx1_len: usize,
        expected_idx2_len: usize,
    },

    #[error(
        "barcode tag mismatch within template {qname}: saw both {a:?} and \
         {b:?}"
    )]
    BarcodeTagMismatch { qname: String, a: String, b: String },

    #[error("tag {tag} exists with a different type than requested")]
    TagTypeMismatch { tag: String },

    #[error("duplicate tag {tag} on record {qname}")]
    DuplicateTag { tag: String, qname: String },

    #[error("invalid CIGAR: {0}")]
    InvalidCigar(String),

    #[error("invalid MD tag: {0}")]
    InvalidMd(String),

    #[error("invalid query name: {0}")]
    InvalidQueryName(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("thread pool failure: {0}")]
    ThreadPoolFailure(String),

    #[error("filter magic mismatch: expected one of RGF2/RGF3, got {0:?}")]
    FilterMagicMismatch(Vec<u8>),

    #[error("source read error: {0}")]
    SourceRead(String),
}

pub type DemuxResult<T> = Result<T, DemuxError>;
