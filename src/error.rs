use std::error;
use std::fmt;
use std::io;
use std::str::Utf8Error;

use crate::signature::SignatureError;

/// Result alias using an [`Error`] as the error type by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised by this crate.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    #[inline]
    pub(crate) fn new(kind: ErrorKind) -> Error {
        Self { kind }
    }

    /// The D-Bus error name carried by an error reply, such as
    /// `org.freedesktop.DBus.Error.UnknownMethod`.
    ///
    /// Returns `None` for errors which did not originate in an error reply.
    pub fn error_name(&self) -> Option<&str> {
        match &self.kind {
            ErrorKind::ResponseError(name, _) => Some(name),
            _ => None,
        }
    }

    /// Test if the error was caused by the session having been closed.
    pub fn is_closed(&self) -> bool {
        matches!(self.kind, ErrorKind::Closed)
    }

    /// Test if the error is a call timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::CallTimedOut)
    }
}

impl From<SignatureError> for Error {
    #[inline]
    fn from(error: SignatureError) -> Self {
        Self::new(ErrorKind::Signature(error))
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(error: io::Error) -> Self {
        Self::new(ErrorKind::Io(error))
    }
}

impl From<Utf8Error> for Error {
    #[inline]
    fn from(error: Utf8Error) -> Self {
        Self::new(ErrorKind::Utf8(error))
    }
}

impl From<ErrorKind> for Error {
    #[inline]
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ErrorKind::Io(error) => error.fmt(f),
            ErrorKind::Signature(error) => error.fmt(f),
            ErrorKind::Utf8(error) => error.fmt(f),
            ErrorKind::BufferUnderflow => write!(f, "Buffer underflow"),
            ErrorKind::NotNullTerminated => write!(f, "String is not null terminated"),
            ErrorKind::InvalidBool(value) => write!(f, "Invalid boolean value {value}"),
            ErrorKind::InvalidEndianness(byte) => {
                write!(f, "Invalid endianness marker {byte:#04x}")
            }
            ErrorKind::InvalidMessageType(byte) => {
                write!(f, "Message type {byte} is out of range")
            }
            ErrorKind::InvalidFieldCode(code) => {
                write!(f, "Unknown header field code {code}")
            }
            ErrorKind::InvalidFieldSignature(code) => {
                write!(f, "Unexpected value signature for header field code {code}")
            }
            ErrorKind::ZeroSerial => write!(f, "Zero in header serial"),
            ErrorKind::ArrayTooLong(length) => {
                write!(f, "Array of length {length} is too long (max is 67108864)")
            }
            ErrorKind::BodyTooLong(length) => {
                write!(f, "Body of length {length} is too long (max is 134217728)")
            }
            ErrorKind::ArrayOutOfBounds => {
                write!(f, "Array contents exceeded the declared byte length")
            }
            ErrorKind::TrailingBody => {
                write!(f, "Message body was not fully consumed by its signature")
            }
            ErrorKind::UnsupportedAddress => write!(f, "Address type not supported"),
            ErrorKind::InvalidAuth => write!(f, "Authentication handshake failed"),
            ErrorKind::AuthTimedOut => write!(f, "Authentication handshake timed out"),
            ErrorKind::CallTimedOut => write!(f, "Call timed out"),
            ErrorKind::Closed => write!(f, "Connection closed"),
            ErrorKind::InvalidReply => write!(f, "Unexpected method reply body"),
            ErrorKind::ResponseError(name, message) => {
                if message.is_empty() {
                    write!(f, "{name}")
                } else {
                    write!(f, "{name}: {message}")
                }
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Io(error) => Some(error),
            ErrorKind::Signature(error) => Some(error),
            ErrorKind::Utf8(error) => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum ErrorKind {
    Io(io::Error),
    Signature(SignatureError),
    Utf8(Utf8Error),
    /// A typed read went past the end of the buffer.
    BufferUnderflow,
    NotNullTerminated,
    InvalidBool(u32),
    InvalidEndianness(u8),
    InvalidMessageType(u8),
    InvalidFieldCode(u8),
    InvalidFieldSignature(u8),
    ZeroSerial,
    ArrayTooLong(u32),
    BodyTooLong(u32),
    ArrayOutOfBounds,
    TrailingBody,
    UnsupportedAddress,
    InvalidAuth,
    AuthTimedOut,
    CallTimedOut,
    Closed,
    InvalidReply,
    /// An error reply surfaced from a method call, carrying the error name
    /// and the human-readable message from the reply body.
    ResponseError(Box<str>, Box<str>),
}
