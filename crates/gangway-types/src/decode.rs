use core::fmt;
use std::io;

/// Reason a protocol frame could not be decoded.
///
/// Incompleteness is never an error: decoders signal "need more data" by
/// other means and only produce a `DecodeError` for input that can never
/// become valid.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DecodeError {
    UnsupportedVersion { actual: u8, expected: u8 },
    UnsupportedAddressType { actual: u8 },
    FieldTooLong { field: &'static str, max: usize },
    NotAscii { field: &'static str },
    Malformed { field: &'static str, reason: &'static str },
    Oversized { limit: usize },
}

impl std::error::Error for DecodeError {}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnsupportedVersion { actual, expected } => {
                write!(f, "unsupported version: {actual} (expected: {expected})")
            }
            DecodeError::UnsupportedAddressType { actual } => {
                write!(f, "unsupported address type: {actual}")
            }
            DecodeError::FieldTooLong { field, max } => {
                write!(f, "field `{field}` longer than {max} bytes")
            }
            DecodeError::NotAscii { field } => write!(f, "field `{field}` is not ASCII"),
            DecodeError::Malformed { field, reason } => write!(f, "invalid `{field}`: {reason}"),
            DecodeError::Oversized { limit } => write!(f, "frame exceeds {limit} bytes"),
        }
    }
}

impl From<DecodeError> for io::Error {
    fn from(e: DecodeError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, e)
    }
}

/// Outcome attached to every decoded protocol message.
///
/// A failed decode still produces a message (with placeholder fields), so a
/// single terminal value always reaches the consumer; this carries the cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeResult {
    Success,
    Failure(DecodeError),
}

impl DecodeResult {
    pub fn is_success(&self) -> bool {
        matches!(self, DecodeResult::Success)
    }

    pub fn failure(&self) -> Option<&DecodeError> {
        match self {
            DecodeResult::Success => None,
            DecodeResult::Failure(cause) => Some(cause),
        }
    }
}
