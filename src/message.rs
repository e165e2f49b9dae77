//! Message framing: the fixed-layout header, the header-field array and the
//! signature-driven body.

use crate::error::{ErrorKind, Result};
use crate::proto::{Endianness, FieldCode, Flags, MessageType, PROTOCOL_VERSION};
use crate::reader::ByteReader;
use crate::value::Value;
use crate::writer::ByteWriter;

/// The typed header fields of a message.
///
/// Each field has a fixed value type on the wire: `path` is an object path,
/// `reply_serial` and `unix_fds` are `u32`, `signature` is a signature and
/// everything else is a string.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Fields {
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub reply_serial: Option<u32>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    pub signature: Option<String>,
    pub unix_fds: Option<u32>,
}

/// A message header.
///
/// The on-wire form is the fixed 16-byte prefix followed by the header-field
/// array, padded to an 8-byte boundary at its end.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub endianness: Endianness,
    pub message_type: MessageType,
    pub flags: Flags,
    pub version: u8,
    pub body_length: u32,
    /// Non-zero for live messages. A zero serial is assigned by the session
    /// when the message is sent.
    pub serial: u32,
    pub fields: Fields,
}

impl Header {
    /// Construct a header of the given type with no fields set.
    pub fn new(message_type: MessageType) -> Self {
        Self {
            endianness: Endianness::Little,
            message_type,
            flags: Flags::EMPTY,
            version: PROTOCOL_VERSION,
            body_length: 0,
            serial: 0,
            fields: Fields::default(),
        }
    }

    /// Marshal the header into `buf`, including the trailing padding to an
    /// 8-byte boundary.
    pub fn marshal(&self, buf: &mut ByteWriter) -> Result<()> {
        let Some(message_type) = self.message_type.to_raw() else {
            return Err(ErrorKind::InvalidMessageType(0).into());
        };

        if self.serial == 0 {
            return Err(ErrorKind::ZeroSerial.into());
        }

        buf.write_byte(self.endianness.to_byte());
        buf.write_byte(message_type);
        buf.write_byte(self.flags.to_raw());
        buf.write_byte(self.version);
        buf.write_u32(self.body_length);
        buf.write_u32(self.serial);

        // The header-field array: outer u32 length, 8-aligned struct elements
        // of (byte code, variant value).
        buf.align(4);
        let length_at = buf.len();
        buf.write_u32(0);
        buf.align(8);
        let start = buf.len();

        if let Some(path) = &self.fields.path {
            write_field(buf, FieldCode::Path, "o", |buf| buf.write_object_path(path));
        }

        if let Some(interface) = &self.fields.interface {
            write_field(buf, FieldCode::Interface, "s", |buf| buf.write_str(interface));
        }

        if let Some(member) = &self.fields.member {
            write_field(buf, FieldCode::Member, "s", |buf| buf.write_str(member));
        }

        if let Some(error_name) = &self.fields.error_name {
            write_field(buf, FieldCode::ErrorName, "s", |buf| buf.write_str(error_name));
        }

        if let Some(reply_serial) = self.fields.reply_serial {
            write_field(buf, FieldCode::ReplySerial, "u", |buf| {
                buf.write_u32(reply_serial)
            });
        }

        if let Some(destination) = &self.fields.destination {
            write_field(buf, FieldCode::Destination, "s", |buf| {
                buf.write_str(destination)
            });
        }

        if let Some(sender) = &self.fields.sender {
            write_field(buf, FieldCode::Sender, "s", |buf| buf.write_str(sender));
        }

        if let Some(signature) = &self.fields.signature {
            write_field(buf, FieldCode::Signature, "g", |buf| {
                buf.write_signature(signature)
            });
        }

        if let Some(unix_fds) = self.fields.unix_fds {
            write_field(buf, FieldCode::UnixFds, "u", |buf| buf.write_u32(unix_fds));
        }

        buf.set_u32(length_at, (buf.len() - start) as u32);

        // The body is aligned to 8 from the start of the message.
        buf.align(8);
        Ok(())
    }

    /// Unmarshal a header, leaving the cursor at the first byte of the body.
    pub fn unmarshal(buf: &mut ByteReader<'_>) -> Result<Header> {
        let endian_byte = buf.read_byte()?;

        let Some(endianness) = Endianness::from_byte(endian_byte) else {
            return Err(ErrorKind::InvalidEndianness(endian_byte).into());
        };

        buf.set_endianness(endianness);

        let type_byte = buf.read_byte()?;
        let message_type = MessageType::from_raw(type_byte);

        if message_type.to_raw().is_none() {
            return Err(ErrorKind::InvalidMessageType(type_byte).into());
        }

        let flags = Flags::from_raw(buf.read_byte()?);
        let version = buf.read_byte()?;
        let body_length = buf.read_u32()?;
        let serial = buf.read_u32()?;

        if serial == 0 {
            return Err(ErrorKind::ZeroSerial.into());
        }

        let mut fields = Fields::default();

        buf.consume_array(8, |buf| {
            let code_byte = buf.read_byte()?;

            let Some(code) = FieldCode::from_raw(code_byte) else {
                return Err(ErrorKind::InvalidFieldCode(code_byte).into());
            };

            let signature = buf.read_signature()?;

            match (code, signature.as_str()) {
                (FieldCode::Path, "o") => fields.path = Some(buf.read_object_path()?),
                (FieldCode::Interface, "s") => fields.interface = Some(buf.read_str()?),
                (FieldCode::Member, "s") => fields.member = Some(buf.read_str()?),
                (FieldCode::ErrorName, "s") => fields.error_name = Some(buf.read_str()?),
                (FieldCode::ReplySerial, "u") => fields.reply_serial = Some(buf.read_u32()?),
                (FieldCode::Destination, "s") => fields.destination = Some(buf.read_str()?),
                (FieldCode::Sender, "s") => fields.sender = Some(buf.read_str()?),
                (FieldCode::Signature, "g") => fields.signature = Some(buf.read_signature()?),
                (FieldCode::UnixFds, "u") => fields.unix_fds = Some(buf.read_u32()?),
                _ => return Err(ErrorKind::InvalidFieldSignature(code_byte).into()),
            }

            Ok(())
        })?;

        buf.align(8)?;

        Ok(Header {
            endianness,
            message_type,
            flags,
            version,
            body_length,
            serial,
            fields,
        })
    }
}

fn write_field<F>(buf: &mut ByteWriter, code: FieldCode, signature: &str, value: F)
where
    F: FnOnce(&mut ByteWriter),
{
    buf.align(8);
    buf.write_byte(code as u8);
    buf.write_signature(signature);
    value(buf);
}

/// A message: a [`Header`] plus a body of zero or more values.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: Header,
    pub body: Vec<Value>,
}

impl Message {
    /// Construct a method call to `member` on the object at `path`.
    ///
    /// # Examples
    ///
    /// ```
    /// use busio::{Message, MessageType};
    ///
    /// let m = Message::method_call("/org/freedesktop/DBus", "Hello")
    ///     .with_destination("org.freedesktop.DBus");
    ///
    /// assert_eq!(m.header.message_type, MessageType::MethodCall);
    /// assert_eq!(m.path(), Some("/org/freedesktop/DBus"));
    /// ```
    pub fn method_call(path: impl Into<String>, member: impl Into<String>) -> Self {
        let mut header = Header::new(MessageType::MethodCall);
        header.fields.path = Some(path.into());
        header.fields.member = Some(member.into());

        Self {
            header,
            body: Vec::new(),
        }
    }

    /// Construct a signal emission of `member` from the object at `path`.
    pub fn signal(
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        let mut header = Header::new(MessageType::Signal);
        header.fields.path = Some(path.into());
        header.fields.interface = Some(interface.into());
        header.fields.member = Some(member.into());

        Self {
            header,
            body: Vec::new(),
        }
    }

    /// Convert this message into a method-return reply with an empty body.
    ///
    /// The reply serial is taken from this message's serial and the
    /// destination from its sender; the serial is assigned when the reply is
    /// sent.
    #[must_use]
    pub fn method_return(&self) -> Self {
        let mut header = Header::new(MessageType::MethodReturn);
        header.endianness = self.header.endianness;
        header.fields.reply_serial = Some(self.header.serial);
        header.fields.destination = self.header.fields.sender.clone();

        Self {
            header,
            body: Vec::new(),
        }
    }

    /// Convert this message into an error reply carrying `error_name`.
    #[must_use]
    pub fn error_reply(&self, error_name: impl Into<String>) -> Self {
        let mut m = self.method_return();
        m.header.message_type = MessageType::Error;
        m.header.fields.error_name = Some(error_name.into());
        m
    }

    #[must_use]
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.header.fields.destination = Some(destination.into());
        self
    }

    #[must_use]
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.header.fields.interface = Some(interface.into());
        self
    }

    #[must_use]
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.header.fields.sender = Some(sender.into());
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.header.flags = flags;
        self
    }

    #[must_use]
    pub fn with_endianness(mut self, endianness: Endianness) -> Self {
        self.header.endianness = endianness;
        self
    }

    #[must_use]
    pub fn with_serial(mut self, serial: u32) -> Self {
        self.header.serial = serial;
        self
    }

    /// Replace the body of the message.
    #[must_use]
    pub fn with_body(mut self, body: Vec<Value>) -> Self {
        self.body = body;
        self
    }

    /// Append one value to the body.
    #[must_use]
    pub fn with_arg(mut self, value: Value) -> Self {
        self.body.push(value);
        self
    }

    pub fn path(&self) -> Option<&str> {
        self.header.fields.path.as_deref()
    }

    pub fn interface(&self) -> Option<&str> {
        self.header.fields.interface.as_deref()
    }

    pub fn member(&self) -> Option<&str> {
        self.header.fields.member.as_deref()
    }

    pub fn error_name(&self) -> Option<&str> {
        self.header.fields.error_name.as_deref()
    }

    pub fn destination(&self) -> Option<&str> {
        self.header.fields.destination.as_deref()
    }

    pub fn sender(&self) -> Option<&str> {
        self.header.fields.sender.as_deref()
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.header.fields.reply_serial
    }

    pub fn serial(&self) -> u32 {
        self.header.serial
    }

    /// The signature of the body: the concatenation of its values'
    /// signatures.
    pub fn body_signature(&self) -> String {
        let mut out = String::new();

        for value in &self.body {
            value.write_signature(&mut out);
        }

        out
    }

    /// Marshal the message: header, padding, body, with the body byte count
    /// patched into the fixed header once known.
    ///
    /// If a body is present and the header carries no signature field, the
    /// signature is filled in from the body.
    pub fn marshal(&self) -> Result<Vec<u8>> {
        let mut header = self.header.clone();

        if header.fields.signature.is_none() && !self.body.is_empty() {
            header.fields.signature = Some(self.body_signature());
        }

        let mut buf = ByteWriter::with_capacity(header.endianness, 128);
        header.marshal(&mut buf)?;

        let body_start = buf.len();

        for value in &self.body {
            value.write_to(&mut buf)?;
        }

        let body_length = buf.len() - body_start;

        if body_length > crate::proto::MAX_BODY_LENGTH as usize {
            return Err(ErrorKind::BodyTooLong(body_length as u32).into());
        }

        buf.set_u32(4, body_length as u32);
        Ok(buf.take_bytes())
    }

    /// Unmarshal one complete message from the reader.
    ///
    /// The body is decoded under the header's signature field; an empty or
    /// absent signature means an absent body.
    pub fn unmarshal(buf: &mut ByteReader<'_>) -> Result<Message> {
        let header = Header::unmarshal(buf)?;

        let body = match header.fields.signature.as_deref() {
            Some(signature) if !signature.is_empty() => {
                let start = buf.pos();
                let values = buf.read_values(signature)?;

                if buf.pos() - start != header.body_length as usize {
                    return Err(ErrorKind::TrailingBody.into());
                }

                values
            }
            _ => Vec::new(),
        };

        Ok(Message { header, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_call_header_round_trip() {
        for endianness in [Endianness::Little, Endianness::Big] {
            let mut header = Header::new(MessageType::MethodCall);
            header.endianness = endianness;
            header.serial = 0x42;
            header.body_length = 0xABCDEF12;
            header.fields.destination = Some("org.freewilly.Fish".into());
            header.fields.path = Some("/org.freewilly.Fish".into());
            header.fields.interface = Some("org.freedesktop.DBus.Properties".into());
            header.fields.member = Some("Test".into());

            let mut buf = ByteWriter::new(endianness);
            header.marshal(&mut buf).unwrap();
            let bytes = buf.take_bytes();

            assert_eq!(bytes.len() % 8, 0);
            assert_eq!(bytes[0], endianness.to_byte());

            let mut buf = ByteReader::new(&bytes, Endianness::Little);
            let back = Header::unmarshal(&mut buf).unwrap();
            assert_eq!(back, header);
        }
    }

    #[test]
    fn message_round_trip_patches_body_length() {
        let m = Message::method_call("/org/example/Object", "Frobnicate")
            .with_destination("org.example.Service")
            .with_interface("org.example.Iface")
            .with_serial(7)
            .with_arg(Value::Uint32(3))
            .with_arg(Value::Str("hi".into()));

        let bytes = m.marshal().unwrap();

        // Body length patched at offset 4: u32 then aligned string.
        let body_length = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        assert_eq!(body_length, 4 + 4 + 2 + 1);

        let mut buf = ByteReader::new(&bytes, Endianness::Little);
        let back = Message::unmarshal(&mut buf).unwrap();

        assert_eq!(back.header.message_type, MessageType::MethodCall);
        assert_eq!(back.header.fields.signature.as_deref(), Some("us"));
        assert_eq!(back.serial(), 7);
        assert_eq!(back.body, m.body);
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn empty_body_round_trip() {
        let m = Message::signal("/org/example/Object", "org.example.Iface", "Changed")
            .with_serial(3);

        let bytes = m.marshal().unwrap();
        let mut buf = ByteReader::new(&bytes, Endianness::Little);
        let back = Message::unmarshal(&mut buf).unwrap();

        assert_eq!(back.body, vec![]);
        assert_eq!(back.header.body_length, 0);
        assert_eq!(back.member(), Some("Changed"));
    }

    #[test]
    fn reply_derivation() {
        let call = Message::method_call("/org/example/Object", "Frobnicate")
            .with_sender(":1.33")
            .with_destination("org.example.Service")
            .with_serial(11);

        let reply = call.method_return();
        assert_eq!(reply.header.message_type, MessageType::MethodReturn);
        assert_eq!(reply.reply_serial(), Some(11));
        assert_eq!(reply.destination(), Some(":1.33"));

        let error = call.error_reply("org.example.Error.Nope");
        assert_eq!(error.header.message_type, MessageType::Error);
        assert_eq!(error.error_name(), Some("org.example.Error.Nope"));
        assert_eq!(error.reply_serial(), Some(11));
    }

    #[test]
    fn rejects_bad_wire_headers() {
        let m = Message::method_call("/a", "B").with_serial(1);
        let bytes = m.marshal().unwrap();

        // Bad endianness marker.
        let mut bad = bytes.clone();
        bad[0] = b'x';
        let mut buf = ByteReader::new(&bad, Endianness::Little);
        assert!(Message::unmarshal(&mut buf).is_err());

        // Message type out of range.
        let mut bad = bytes.clone();
        bad[1] = 9;
        let mut buf = ByteReader::new(&bad, Endianness::Little);
        assert!(Message::unmarshal(&mut buf).is_err());

        // Zero serial.
        let mut bad = bytes.clone();
        bad[8..12].copy_from_slice(&[0, 0, 0, 0]);
        let mut buf = ByteReader::new(&bad, Endianness::Little);
        assert!(Message::unmarshal(&mut buf).is_err());
    }

    #[test]
    fn rejects_unknown_field_code() {
        let m = Message::method_call("/a", "B").with_serial(1);
        let bytes = m.marshal().unwrap();

        // The first field element starts at offset 16: patch its code byte.
        let mut bad = bytes.clone();
        bad[16] = 10;
        let mut buf = ByteReader::new(&bad, Endianness::Little);
        assert!(Message::unmarshal(&mut buf).is_err());

        let mut bad = bytes;
        bad[16] = 0;
        let mut buf = ByteReader::new(&bad, Endianness::Little);
        assert!(Message::unmarshal(&mut buf).is_err());
    }

    #[test]
    fn explicit_signature_field_is_kept() {
        let m = Message::method_call("/a", "B")
            .with_serial(2)
            .with_arg(Value::ObjectPath("/obj".into()));

        let bytes = m.marshal().unwrap();
        let mut buf = ByteReader::new(&bytes, Endianness::Little);
        let back = Message::unmarshal(&mut buf).unwrap();

        assert_eq!(back.header.fields.signature.as_deref(), Some("o"));
        assert_eq!(back.body, vec![Value::ObjectPath("/obj".into())]);
    }
}
