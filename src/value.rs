//! The dynamic value model.
//!
//! A [`Value`] is a tagged sum with one variant per basic type code plus the
//! container forms. Every value knows its own signature, so marshaling never
//! re-parses a signature string; unmarshaling is driven by the parse tree
//! produced by the signature module.

use crate::error::{ErrorKind, Result};
use crate::proto::MAX_ARRAY_LENGTH;
use crate::reader::ByteReader;
use crate::signature::{alignment_of_code, SignatureError, SignatureErrorKind, TypeNode};
use crate::writer::ByteWriter;

/// A single marshalable D-Bus value.
///
/// # Examples
///
/// ```
/// use busio::Value;
///
/// let value = Value::Struct(vec![
///     Value::Uint32(101),
///     Value::array("y", vec![Value::Byte(1), Value::Byte(2)]),
/// ]);
///
/// assert_eq!(value.signature(), "(uay)");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Bool(bool),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    /// An index into the out-of-band file descriptor array.
    UnixFd(u32),
    Str(String),
    ObjectPath(String),
    Signature(String),
    /// A variant wraps exactly one value together with its signature.
    Variant(Box<Value>),
    /// An ordered sequence of fields. Must not be empty.
    Struct(Vec<Value>),
    /// An array whose elements all share `item_signature`.
    Array {
        item_signature: String,
        items: Vec<Value>,
    },
    /// A key-value pair; only legal as the element of an array. The key must
    /// be a basic type and the value must not itself be a dict entry.
    DictEntry(Box<Value>, Box<Value>),
}

impl Value {
    /// Construct an array over elements of the given item signature.
    ///
    /// The item signature is carried explicitly so that empty arrays still
    /// marshal under the right element type.
    pub fn array(item_signature: impl Into<String>, items: Vec<Value>) -> Self {
        Value::Array {
            item_signature: item_signature.into(),
            items,
        }
    }

    /// Construct a dictionary: an array of dict entries.
    ///
    /// # Examples
    ///
    /// ```
    /// use busio::Value;
    ///
    /// let dict = Value::dictionary("q", "s", vec![
    ///     (Value::Uint16(1), Value::Str("aa".into())),
    ///     (Value::Uint16(2), Value::Str("bb".into())),
    /// ]);
    ///
    /// assert_eq!(dict.signature(), "a{qs}");
    /// ```
    pub fn dictionary(
        key_signature: &str,
        value_signature: &str,
        entries: Vec<(Value, Value)>,
    ) -> Self {
        let items = entries
            .into_iter()
            .map(|(key, value)| Value::DictEntry(Box::new(key), Box::new(value)))
            .collect();

        Value::Array {
            item_signature: format!("{{{key_signature}{value_signature}}}"),
            items,
        }
    }

    /// Construct a variant wrapping `value`.
    pub fn variant(value: Value) -> Self {
        Value::Variant(Box::new(value))
    }

    /// The string this value holds, if it is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(value) => Some(value),
            _ => None,
        }
    }

    /// The `u32` this value holds, if it is one.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Uint32(value) => Some(*value),
            _ => None,
        }
    }

    /// The boolean this value holds, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Render this value's signature into `out`.
    pub fn write_signature(&self, out: &mut String) {
        match self {
            Value::Byte(..) => out.push('y'),
            Value::Bool(..) => out.push('b'),
            Value::Int16(..) => out.push('n'),
            Value::Uint16(..) => out.push('q'),
            Value::Int32(..) => out.push('i'),
            Value::Uint32(..) => out.push('u'),
            Value::Int64(..) => out.push('x'),
            Value::Uint64(..) => out.push('t'),
            Value::Double(..) => out.push('d'),
            Value::UnixFd(..) => out.push('h'),
            Value::Str(..) => out.push('s'),
            Value::ObjectPath(..) => out.push('o'),
            Value::Signature(..) => out.push('g'),
            Value::Variant(..) => out.push('v'),
            Value::Struct(fields) => {
                out.push('(');
                for field in fields {
                    field.write_signature(out);
                }
                out.push(')');
            }
            Value::Array { item_signature, .. } => {
                out.push('a');
                out.push_str(item_signature);
            }
            Value::DictEntry(key, value) => {
                out.push('{');
                key.write_signature(out);
                value.write_signature(out);
                out.push('}');
            }
        }
    }

    /// The signature of this value.
    pub fn signature(&self) -> String {
        let mut out = String::new();
        self.write_signature(&mut out);
        out
    }

    /// Marshal this value into `buf`.
    pub fn write_to(&self, buf: &mut ByteWriter) -> Result<()> {
        match self {
            Value::Byte(value) => buf.write_byte(*value),
            Value::Bool(value) => buf.write_bool(*value),
            Value::Int16(value) => buf.write_i16(*value),
            Value::Uint16(value) => buf.write_u16(*value),
            Value::Int32(value) => buf.write_i32(*value),
            Value::Uint32(value) => buf.write_u32(*value),
            Value::Int64(value) => buf.write_i64(*value),
            Value::Uint64(value) => buf.write_u64(*value),
            Value::Double(value) => buf.write_f64(*value),
            Value::UnixFd(value) => buf.write_unix_fd(*value),
            Value::Str(value) => buf.write_str(value),
            Value::ObjectPath(value) => buf.write_object_path(value),
            Value::Signature(value) => buf.write_signature(value),
            Value::Variant(value) => {
                buf.write_signature(&value.signature());
                value.write_to(buf)?;
            }
            Value::Struct(fields) => {
                if fields.is_empty() {
                    return Err(SignatureError::new(SignatureErrorKind::StructHasNoFields).into());
                }

                buf.align(8);

                for field in fields {
                    field.write_to(buf)?;
                }
            }
            Value::Array {
                item_signature,
                items,
            } => {
                let Some(&code) = item_signature.as_bytes().first() else {
                    return Err(SignatureError::new(SignatureErrorKind::UnexpectedEnd).into());
                };

                buf.align(4);
                let length_at = buf.len();
                buf.write_u32(0);
                buf.align(alignment_of_code(code));
                let start = buf.len();

                for item in items {
                    item.write_to(buf)?;
                }

                let length = buf.len() - start;

                if length > MAX_ARRAY_LENGTH as usize {
                    return Err(ErrorKind::ArrayTooLong(length as u32).into());
                }

                buf.set_u32(length_at, length as u32);
            }
            Value::DictEntry(key, value) => {
                buf.align(8);
                key.write_to(buf)?;
                value.write_to(buf)?;
            }
        }

        Ok(())
    }
}

/// Read one value under the given parse-tree node.
pub(crate) fn read_node(buf: &mut ByteReader<'_>, node: &TypeNode) -> Result<Value> {
    let value = match node {
        TypeNode::Byte => Value::Byte(buf.read_byte()?),
        TypeNode::Bool => Value::Bool(buf.read_bool()?),
        TypeNode::Int16 => Value::Int16(buf.read_i16()?),
        TypeNode::Uint16 => Value::Uint16(buf.read_u16()?),
        TypeNode::Int32 => Value::Int32(buf.read_i32()?),
        TypeNode::Uint32 => Value::Uint32(buf.read_u32()?),
        TypeNode::Int64 => Value::Int64(buf.read_i64()?),
        TypeNode::Uint64 => Value::Uint64(buf.read_u64()?),
        TypeNode::Double => Value::Double(buf.read_f64()?),
        TypeNode::UnixFd => Value::UnixFd(buf.read_unix_fd()?),
        TypeNode::Str => Value::Str(buf.read_str()?),
        TypeNode::ObjectPath => Value::ObjectPath(buf.read_object_path()?),
        TypeNode::Signature => Value::Signature(buf.read_signature()?),
        TypeNode::Variant => buf.read_variant()?,
        TypeNode::Struct(fields) => {
            buf.align(8)?;
            let mut values = Vec::with_capacity(fields.len());

            for field in fields {
                values.push(read_node(buf, field)?);
            }

            Value::Struct(values)
        }
        TypeNode::DictEntry(key, value) => {
            buf.align(8)?;
            let key = read_node(buf, key)?;
            let value = read_node(buf, value)?;
            Value::DictEntry(Box::new(key), Box::new(value))
        }
        TypeNode::Array(item) => {
            let is_dict = matches!(**item, TypeNode::DictEntry(..));
            let mut items = Vec::new();

            buf.consume_array(item.alignment(), |buf| {
                let value = read_node(buf, item)?;

                // Dict-entry arrays accumulate as an ordered map where a
                // duplicate key replaces the earlier value in place.
                if is_dict {
                    if let Value::DictEntry(key, ..) = &value {
                        if let Some(at) = items.iter().position(|existing| {
                            matches!(existing, Value::DictEntry(k, ..) if k == key)
                        }) {
                            items[at] = value;
                            return Ok(());
                        }
                    }
                }

                items.push(value);
                Ok(())
            })?;

            Value::Array {
                item_signature: item.signature(),
                items,
            }
        }
    };

    Ok(value)
}

#[cfg(test)]
mod tests {
    use quickcheck::{Arbitrary, Gen};

    use super::*;
    use crate::proto::Endianness;

    fn round_trip(value: &Value, endianness: Endianness) -> Value {
        let mut buf = ByteWriter::new(endianness);
        value.write_to(&mut buf).unwrap();
        let bytes = buf.take_bytes();

        let mut buf = ByteReader::new(&bytes, endianness);
        let mut values = buf.read_values(&value.signature()).unwrap();
        assert_eq!(buf.remaining(), 0);
        assert_eq!(values.len(), 1);
        values.remove(0)
    }

    #[test]
    fn struct_round_trip() {
        let value = Value::Struct(vec![
            Value::Uint32(101),
            Value::array("y", vec![Value::Byte(1), Value::Byte(2), Value::Byte(3)]),
            Value::Struct(vec![Value::Str("foo".into()), Value::Str("bar".into())]),
            Value::dictionary(
                "q",
                "s",
                vec![
                    (Value::Uint16(1), Value::Str("aa".into())),
                    (Value::Uint16(2), Value::Str("bb".into())),
                ],
            ),
            Value::Str("hello".into()),
        ]);

        assert_eq!(value.signature(), "(uay(ss)a{qs}s)");

        for endianness in [Endianness::Little, Endianness::Big] {
            assert_eq!(round_trip(&value, endianness), value);
        }
    }

    #[test]
    fn variant_round_trip() {
        let value = Value::variant(Value::Struct(vec![
            Value::Int64(-12),
            Value::variant(Value::Str("nested".into())),
        ]));

        assert_eq!(value.signature(), "v");
        assert_eq!(round_trip(&value, Endianness::Little), value);
    }

    #[test]
    fn empty_array_round_trip() {
        let value = Value::array("(us)", vec![]);
        assert_eq!(value.signature(), "a(us)");
        assert_eq!(round_trip(&value, Endianness::Big), value);
    }

    #[test]
    fn array_of_arrays_round_trip() {
        let value = Value::array(
            "ai",
            vec![
                Value::array("i", vec![Value::Int32(-1), Value::Int32(2)]),
                Value::array("i", vec![]),
            ],
        );

        assert_eq!(round_trip(&value, Endianness::Little), value);
    }

    #[test]
    fn duplicate_dict_keys_last_write_wins() {
        let value = Value::dictionary(
            "s",
            "u",
            vec![
                (Value::Str("a".into()), Value::Uint32(1)),
                (Value::Str("b".into()), Value::Uint32(2)),
                (Value::Str("a".into()), Value::Uint32(3)),
            ],
        );

        let expected = Value::dictionary(
            "s",
            "u",
            vec![
                (Value::Str("a".into()), Value::Uint32(3)),
                (Value::Str("b".into()), Value::Uint32(2)),
            ],
        );

        assert_eq!(round_trip(&value, Endianness::Little), expected);
    }

    #[test]
    fn empty_struct_is_rejected() {
        let mut buf = ByteWriter::new(Endianness::Little);
        assert!(Value::Struct(vec![]).write_to(&mut buf).is_err());
    }

    #[test]
    fn array_wire_form() {
        // u32 length, pad to the 8-byte element boundary, one u64.
        let value = Value::array("t", vec![Value::Uint64(9)]);
        let mut buf = ByteWriter::new(Endianness::Little);
        value.write_to(&mut buf).unwrap();

        assert_eq!(
            buf.get(),
            &[8, 0, 0, 0, 0, 0, 0, 0, 9, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[derive(Debug, Clone)]
    struct ArbValue(Value);

    impl Arbitrary for ArbValue {
        fn arbitrary(g: &mut Gen) -> Self {
            ArbValue(arbitrary_value(g, 3))
        }
    }

    fn arbitrary_string(g: &mut Gen) -> String {
        String::arbitrary(g).replace('\0', "")
    }

    fn arbitrary_value(g: &mut Gen, depth: usize) -> Value {
        let choices = if depth == 0 { 13 } else { 17 };

        match u8::arbitrary(g) % choices {
            0 => Value::Byte(u8::arbitrary(g)),
            1 => Value::Bool(bool::arbitrary(g)),
            2 => Value::Int16(i16::arbitrary(g)),
            3 => Value::Uint16(u16::arbitrary(g)),
            4 => Value::Int32(i32::arbitrary(g)),
            5 => Value::Uint32(u32::arbitrary(g)),
            6 => Value::Int64(i64::arbitrary(g)),
            7 => Value::Uint64(u64::arbitrary(g)),
            8 => {
                let value = f64::arbitrary(g);
                Value::Double(if value.is_nan() { 0.0 } else { value })
            }
            9 => Value::UnixFd(u32::arbitrary(g)),
            10 => Value::Str(arbitrary_string(g)),
            11 => Value::ObjectPath("/arbitrary/path".into()),
            12 => Value::Signature("a{sv}".into()),
            13 => Value::variant(arbitrary_value(g, depth - 1)),
            14 => {
                let len = usize::arbitrary(g) % 3 + 1;
                Value::Struct(
                    (0..len)
                        .map(|_| arbitrary_value(g, depth - 1))
                        .collect(),
                )
            }
            15 => {
                // All elements of one array share a signature, so generate a
                // prototype and repeat it.
                let prototype = arbitrary_value(g, depth - 1);
                let len = usize::arbitrary(g) % 3;
                Value::array(prototype.signature(), vec![prototype; len])
            }
            _ => {
                let len = usize::arbitrary(g) % 3;
                let value = arbitrary_value(g, depth - 1);
                let value_signature = value.signature();

                Value::dictionary(
                    "u",
                    &value_signature,
                    (0..len)
                        .map(|n| (Value::Uint32(n as u32), value.clone()))
                        .collect(),
                )
            }
        }
    }

    quickcheck::quickcheck! {
        fn prop_round_trip_little(value: ArbValue) -> bool {
            round_trip(&value.0, Endianness::Little) == value.0
        }

        fn prop_round_trip_big(value: ArbValue) -> bool {
            round_trip(&value.0, Endianness::Big) == value.0
        }
    }
}
