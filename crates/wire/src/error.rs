//! Wire-level error types.

use thiserror::Error;

/// Errors raised while reducing or producing wire objects.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WireError {
    /// No reducer is registered for the given tag.
    #[error("no reducer registered for tag `{tag}`")]
    MissingReducer { tag: String },

    /// No producer is registered for the given tag.
    #[error("no producer registered for tag `{tag}`")]
    MissingProducer { tag: String },

    /// A byte-level decoding failure.
    #[error("io: {0}")]
    Io(#[from] svi_io::IoError),

    /// A structurally invalid reduced object.
    #[error("malformed wire object: {message}")]
    Malformed { message: String },

    /// A numeric index with no corresponding enum value.
    #[error("unknown {what} index {index}")]
    UnknownIndex { what: &'static str, index: u64 },

    /// A value-model failure while rebuilding an object.
    #[error("produce: {0}")]
    Produce(#[from] svi_core::SviError),

    /// Input that does not begin with the SBI marker.
    #[error("input does not carry the SBI marker")]
    NotBinaryInput,
}

impl WireError {
    pub fn missing_reducer(tag: impl Into<String>) -> Self {
        Self::MissingReducer { tag: tag.into() }
    }

    pub fn missing_producer(tag: impl Into<String>) -> Self {
        Self::MissingProducer { tag: tag.into() }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    pub fn unknown_index(what: &'static str, index: u64) -> Self {
        Self::UnknownIndex { what, index }
    }
}

/// Result type for wire operations.
pub type WireResult<T> = std::result::Result<T, WireError>;
