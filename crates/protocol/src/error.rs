//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Magic number at the head of a frame did not match `MAGIC`
    #[error("bad magic number")]
    BadMagic,

    /// Major version differs from what this implementation speaks
    #[error("incompatible protocol version: peer major {got}, expected {expected}")]
    BadVersion { expected: u8, got: u8 },

    /// Declared payload length exceeds the wire maximum
    #[error("payload length {length} exceeds maximum of {max}")]
    LengthOverflow { length: u32, max: u32 },

    /// Fewer bytes were available than the frame declared
    #[error("frame truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Command code does not match any entry in the canonical command table
    #[error("unknown command code {0:#06x}")]
    UnknownCommand(u16),

    /// A payload field carried a value outside the range its type defines
    #[error("invalid value for field {field}: {value}")]
    InvalidFieldValue { field: &'static str, value: u32 },

    /// A fixed-size string field contained non-UTF-8 bytes before its terminator
    #[error("fixed string field is not valid UTF-8")]
    InvalidUtf8,

    /// I/O error while reading or writing a frame
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
