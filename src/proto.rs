//! Low level details of the D-Bus wire protocol.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// The major protocol version this implementation speaks.
pub(crate) const PROTOCOL_VERSION: u8 = 1;

/// The maximum length of an array in bytes.
pub(crate) const MAX_ARRAY_LENGTH: u32 = 1u32 << 26;
/// The maximum length of a message body in bytes.
pub(crate) const MAX_BODY_LENGTH: u32 = 1u32 << 27;

/// The endianness of a message.
///
/// The first byte of every message declares the byte order used for every
/// multi-byte quantity in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endianness {
    /// Little endian, marker byte `l`.
    Little,
    /// Big endian, marker byte `B`.
    Big,
}

impl Endianness {
    /// The marker byte used on the wire.
    #[inline]
    pub fn to_byte(self) -> u8 {
        match self {
            Endianness::Little => b'l',
            Endianness::Big => b'B',
        }
    }

    /// Decode an endianness marker byte.
    #[inline]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'l' => Some(Endianness::Little),
            b'B' => Some(Endianness::Big),
            _ => None,
        }
    }
}

/// The type of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Type code `0`, never valid on the wire.
    Invalid,
    /// Method call. This message type may prompt a reply.
    MethodCall,
    /// Method reply with returned data.
    MethodReturn,
    /// Error reply. If the first argument exists and is a string, it is an
    /// error message.
    Error,
    /// Signal emission.
    Signal,
    /// Any type code above `4`.
    Unknown,
}

impl MessageType {
    /// Map a raw type byte to a message type.
    #[inline]
    pub fn from_raw(byte: u8) -> Self {
        match byte {
            0 => MessageType::Invalid,
            1 => MessageType::MethodCall,
            2 => MessageType::MethodReturn,
            3 => MessageType::Error,
            4 => MessageType::Signal,
            _ => MessageType::Unknown,
        }
    }

    /// The raw type byte, if the type can appear on the wire.
    #[inline]
    pub fn to_raw(self) -> Option<u8> {
        match self {
            MessageType::MethodCall => Some(1),
            MessageType::MethodReturn => Some(2),
            MessageType::Error => Some(3),
            MessageType::Signal => Some(4),
            MessageType::Invalid | MessageType::Unknown => None,
        }
    }

    /// The value used for the `type` key of a match rule.
    pub(crate) fn match_rule_value(self) -> &'static str {
        match self {
            MessageType::MethodCall => "method_call",
            MessageType::MethodReturn => "method_return",
            MessageType::Error => "error",
            MessageType::Signal => "signal",
            MessageType::Invalid | MessageType::Unknown => "",
        }
    }
}

/// Flags inside of a D-Bus message.
///
/// # Examples
///
/// ```
/// use busio::Flags;
///
/// let flags = Flags::EMPTY;
/// assert!(!(flags & Flags::NO_REPLY_EXPECTED));
///
/// let flags = Flags::EMPTY | Flags::NO_REPLY_EXPECTED;
/// assert!(flags & Flags::NO_REPLY_EXPECTED);
/// assert!(!(flags & Flags::NO_AUTO_START));
/// ```
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Flags(pub(crate) u8);

impl Flags {
    /// An empty set of flags.
    pub const EMPTY: Self = Self(0);
    /// This message does not expect method return replies or error replies,
    /// even if it is of a type that can have a reply; the reply should be
    /// omitted.
    pub const NO_REPLY_EXPECTED: Self = Self(1);
    /// The bus must not launch an owner for the destination name in response
    /// to this message.
    pub const NO_AUTO_START: Self = Self(2);
    /// The caller is prepared to wait for interactive authorization, which
    /// might take a considerable time to complete.
    pub const ALLOW_INTERACTIVE_AUTHORIZATION: Self = Self(4);

    /// The raw flag mask.
    #[inline]
    pub fn to_raw(self) -> u8 {
        self.0
    }

    /// Construct a flag set from a raw mask.
    #[inline]
    pub fn from_raw(byte: u8) -> Self {
        Self(byte)
    }
}

impl BitOr for Flags {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Flags {
    type Output = bool;

    #[inline]
    fn bitand(self, rhs: Self) -> bool {
        self.0 & rhs.0 != 0
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_set();
        let mut bits = self.0;

        for (flag, name) in [
            (Flags::NO_REPLY_EXPECTED, "NO_REPLY_EXPECTED"),
            (Flags::NO_AUTO_START, "NO_AUTO_START"),
            (
                Flags::ALLOW_INTERACTIVE_AUTHORIZATION,
                "ALLOW_INTERACTIVE_AUTHORIZATION",
            ),
        ] {
            if bits & flag.0 != 0 {
                f.entry(&name);
                bits ^= flag.0;
            }
        }

        if bits != 0 {
            f.entry(&bits);
        }

        f.finish()
    }
}

/// A header field code.
///
/// Each header field is a struct of this code and a variant holding the
/// field's fixed value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum FieldCode {
    /// The object to send a call to, or the object a signal is emitted from.
    Path = 1,
    /// The interface to invoke a method call on, or that a signal is emitted
    /// from.
    Interface = 2,
    /// The member, either the method name or signal name.
    Member = 3,
    /// The name of the error that occurred, for errors.
    ErrorName = 4,
    /// The serial number of the message this message is a reply to.
    ReplySerial = 5,
    /// The name of the connection this message is intended for.
    Destination = 6,
    /// Unique name of the sending connection.
    Sender = 7,
    /// The signature of the message body.
    Signature = 8,
    /// The number of Unix file descriptors that accompany the message.
    UnixFds = 9,
}

impl FieldCode {
    /// Decode a raw field code. Code `0` is invalid and codes above `9` are
    /// unknown; both decode to `None`.
    #[inline]
    pub fn from_raw(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(FieldCode::Path),
            2 => Some(FieldCode::Interface),
            3 => Some(FieldCode::Member),
            4 => Some(FieldCode::ErrorName),
            5 => Some(FieldCode::ReplySerial),
            6 => Some(FieldCode::Destination),
            7 => Some(FieldCode::Sender),
            8 => Some(FieldCode::Signature),
            9 => Some(FieldCode::UnixFds),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endianness_markers() {
        assert_eq!(Endianness::Little.to_byte(), 0x6c);
        assert_eq!(Endianness::Big.to_byte(), 0x42);
        assert_eq!(Endianness::from_byte(b'l'), Some(Endianness::Little));
        assert_eq!(Endianness::from_byte(b'B'), Some(Endianness::Big));
        assert_eq!(Endianness::from_byte(b'x'), None);
    }

    #[test]
    fn message_type_range() {
        assert_eq!(MessageType::from_raw(0), MessageType::Invalid);
        assert_eq!(MessageType::from_raw(4), MessageType::Signal);
        assert_eq!(MessageType::from_raw(5), MessageType::Unknown);
        assert_eq!(MessageType::Signal.to_raw(), Some(4));
        assert_eq!(MessageType::Unknown.to_raw(), None);
    }

    #[test]
    fn field_codes() {
        assert_eq!(FieldCode::from_raw(0), None);
        assert_eq!(FieldCode::from_raw(9), Some(FieldCode::UnixFds));
        assert_eq!(FieldCode::from_raw(10), None);
    }
}
