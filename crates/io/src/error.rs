//! Error types for binary encoding and decoding.

use thiserror::Error;

/// Errors produced while reading or writing the binary map format.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IoError {
    /// The input ended before a complete value was read.
    #[error("unexpected end of input at offset {offset} (needed {needed} more byte(s))")]
    EndOfInput { offset: usize, needed: usize },

    /// An unknown value-kind byte.
    #[error("invalid value kind {kind:#04x} at offset {offset}")]
    InvalidKind { kind: u8, offset: usize },

    /// A declared length exceeding the remaining input.
    #[error("declared length {declared} exceeds remaining input {remaining}")]
    LengthOverrun { declared: usize, remaining: usize },

    /// String bytes that are not valid UTF-8.
    #[error("invalid UTF-8 in string value at offset {offset}")]
    InvalidUtf8 { offset: usize },

    /// A variable-length integer wider than 64 bits.
    #[error("variable-length integer overflows 64 bits at offset {offset}")]
    VarIntOverflow { offset: usize },

    /// A map field read with the wrong expected kind.
    #[error("field {field} holds a {actual}, expected a {expected}")]
    WrongFieldKind {
        field: u8,
        expected: &'static str,
        actual: &'static str,
    },

    /// A required map field that is absent.
    #[error("required field {field} is missing")]
    MissingField { field: u8 },
}

impl IoError {
    pub fn end_of_input(offset: usize, needed: usize) -> Self {
        Self::EndOfInput { offset, needed }
    }

    pub fn missing_field(field: u8) -> Self {
        Self::MissingField { field }
    }
}

/// Result type for io operations.
pub type IoResult<T> = std::result::Result<T, IoError>;
