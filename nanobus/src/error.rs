use std::{fmt, io};

use crate::message::FieldCode;
use crate::protocol::TypeCode;

/// The error type for `nanobus`.
///
/// Errors are plain values; nothing is thrown across component boundaries.
/// Socket-level failures mark the connection as broken, while codec failures
/// only affect the message they were raised for.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// An I/O error on the underlying socket.
    InputOutput(io::Error),

    /// A deadline expired before the operation could complete.
    ///
    /// When this happens in the middle of a framed message the stream
    /// position is no longer trustworthy and the connection should be
    /// discarded.
    Timeout(String),

    /// The server terminated the SASL authentication dialog.
    AuthRejected(String),

    /// The requested bus has no transport endpoint this crate can reach.
    UnsupportedBus(String),

    /// The next signature code disagrees with the requested type.
    WrongSignature {
        /// The type the caller asked for.
        expected: TypeCode,
        /// The type announced by the signature.
        actual: TypeCode,
    },

    /// A type code outside the implemented set.
    UnsupportedType(TypeCode),

    /// A header field required by the message kind is absent.
    MissingField(FieldCode),

    /// The remaining bytes cannot satisfy a declared length.
    ShortRead {
        /// Bytes the decoder needed.
        needed: usize,
        /// Bytes that were actually left.
        available: usize,
    },

    /// The peer sent bytes that do not form a valid message or SASL line.
    Malformed(String),
}

/// Alias for a `Result` with the error type [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InputOutput(e) => write!(f, "I/O error: {e}"),
            Error::Timeout(op) => write!(f, "timeout during {op}"),
            Error::AuthRejected(why) => write!(f, "authentication rejected: {why}"),
            Error::UnsupportedBus(why) => write!(f, "unsupported bus: {why}"),
            Error::WrongSignature { expected, actual } => {
                write!(f, "wrong signature: expected '{expected}', got '{actual}'")
            }
            Error::UnsupportedType(code) => write!(f, "unsupported type '{code}'"),
            Error::MissingField(code) => write!(f, "missing header field: {code}"),
            Error::ShortRead { needed, available } => {
                write!(f, "short read: needed {needed} bytes, {available} available")
            }
            Error::Malformed(why) => write!(f, "malformed data: {why}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::InputOutput(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::InputOutput(e)
    }
}
