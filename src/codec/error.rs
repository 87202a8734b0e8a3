//! Codec error types.

/// Failure to encode or decode a stored value.
///
/// Readers surface these per record instead of aborting a range read.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Unknown variant type tag: {0}")]
    UnknownTypeTag(String),

    #[error("Type tag mismatch: column says {expected}, payload says {found}")]
    TagMismatch { expected: String, found: String },

    #[error("Truncated value: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    #[error("String payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("Invalid timestamp: secs={secs}, nanos={nanos}")]
    InvalidTimestamp { secs: i64, nanos: u32 },

    #[error("Array element type mismatch: expected {expected}, found {found}")]
    MixedArray { expected: &'static str, found: String },

    #[error("Arrays of Null are not supported")]
    NullArray,

    #[error("Nested arrays are not supported")]
    NestedArray,

    #[error("Array claims {count} elements but only {available} bytes follow")]
    ArrayTooLong { count: usize, available: usize },

    #[error("Payload of {0} bytes exceeds the u32 length prefix")]
    TooLarge(usize),
}
