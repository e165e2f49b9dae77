//! The D-Bus signature grammar.
//!
//! A signature is a sequence of *single complete types*: one basic type code,
//! `v`, `(...)`, `a` followed by a single complete type, or `{KV}` as the
//! element of an array. Parsing is a single left-to-right walk producing a
//! [`TypeNode`] tree which both the reader and the writer drive off.

use std::error;
use std::fmt;

/// Maximum nesting depth of containers in a signature.
const MAX_DEPTH: usize = 32;

/// Maximum length of a signature in bytes.
const MAX_LENGTH: usize = 255;

/// An error raised while parsing a signature.
#[derive(Debug, PartialEq, Eq)]
pub struct SignatureError {
    kind: SignatureErrorKind,
}

impl SignatureError {
    #[inline]
    pub(crate) fn new(kind: SignatureErrorKind) -> Self {
        Self { kind }
    }
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use SignatureErrorKind::*;

        match self.kind {
            SignatureTooLong => write!(f, "Signature is longer than 255 bytes"),
            UnknownTypeCode(code) => write!(f, "Unknown type code {:?}", code as char),
            UnexpectedEnd => write!(f, "Unexpected end of signature"),
            ExceededMaxDepth => write!(f, "Exceeded maximum container depth"),
            StructHasNoFields => write!(f, "Struct has no fields"),
            StructEndedButNotStarted => write!(f, "Struct ended but not started"),
            StructStartedButNotEnded => write!(f, "Struct started but not ended"),
            DictEndedButNotStarted => write!(f, "Dict ended but not started"),
            DictStartedButNotEnded => write!(f, "Dict started but not ended"),
            DictEntryHasNoFields => write!(f, "Dict entry has no fields"),
            DictEntryHasOnlyOneField => write!(f, "Dict entry has only one field"),
            DictEntryHasTooManyFields => write!(f, "Dict entry has too many fields"),
            DictEntryNotInsideArray => write!(f, "Dict entry not inside array"),
            DictKeyMustBeBasicType => write!(f, "Dict key must be a basic type"),
            NotSingleCompleteType => {
                write!(f, "Signature is not exactly one single complete type")
            }
        }
    }
}

impl error::Error for SignatureError {}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SignatureErrorKind {
    SignatureTooLong,
    UnknownTypeCode(u8),
    UnexpectedEnd,
    ExceededMaxDepth,
    StructHasNoFields,
    StructEndedButNotStarted,
    StructStartedButNotEnded,
    DictEndedButNotStarted,
    DictStartedButNotEnded,
    DictEntryHasNoFields,
    DictEntryHasOnlyOneField,
    DictEntryHasTooManyFields,
    DictEntryNotInsideArray,
    DictKeyMustBeBasicType,
    NotSingleCompleteType,
}

/// One single complete type in a parsed signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TypeNode {
    Byte,
    Bool,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Double,
    UnixFd,
    Str,
    ObjectPath,
    Signature,
    Variant,
    Struct(Vec<TypeNode>),
    DictEntry(Box<TypeNode>, Box<TypeNode>),
    Array(Box<TypeNode>),
}

impl TypeNode {
    /// Natural alignment of a value of this type, measured from the start of
    /// the message.
    pub(crate) fn alignment(&self) -> usize {
        match self {
            TypeNode::Byte | TypeNode::Signature | TypeNode::Variant => 1,
            TypeNode::Int16 | TypeNode::Uint16 => 2,
            TypeNode::Bool
            | TypeNode::Int32
            | TypeNode::Uint32
            | TypeNode::UnixFd
            | TypeNode::Str
            | TypeNode::ObjectPath
            | TypeNode::Array(..) => 4,
            TypeNode::Int64
            | TypeNode::Uint64
            | TypeNode::Double
            | TypeNode::Struct(..)
            | TypeNode::DictEntry(..) => 8,
        }
    }

    pub(crate) fn is_basic(&self) -> bool {
        !matches!(
            self,
            TypeNode::Struct(..) | TypeNode::DictEntry(..) | TypeNode::Array(..) | TypeNode::Variant
        )
    }

    /// Render the signature of this node into `out`.
    pub(crate) fn write_signature(&self, out: &mut String) {
        match self {
            TypeNode::Byte => out.push('y'),
            TypeNode::Bool => out.push('b'),
            TypeNode::Int16 => out.push('n'),
            TypeNode::Uint16 => out.push('q'),
            TypeNode::Int32 => out.push('i'),
            TypeNode::Uint32 => out.push('u'),
            TypeNode::Int64 => out.push('x'),
            TypeNode::Uint64 => out.push('t'),
            TypeNode::Double => out.push('d'),
            TypeNode::UnixFd => out.push('h'),
            TypeNode::Str => out.push('s'),
            TypeNode::ObjectPath => out.push('o'),
            TypeNode::Signature => out.push('g'),
            TypeNode::Variant => out.push('v'),
            TypeNode::Struct(fields) => {
                out.push('(');
                for field in fields {
                    field.write_signature(out);
                }
                out.push(')');
            }
            TypeNode::DictEntry(key, value) => {
                out.push('{');
                key.write_signature(out);
                value.write_signature(out);
                out.push('}');
            }
            TypeNode::Array(item) => {
                out.push('a');
                item.write_signature(out);
            }
        }
    }

    pub(crate) fn signature(&self) -> String {
        let mut out = String::new();
        self.write_signature(&mut out);
        out
    }
}

/// Element alignment keyed on the first byte of a type's signature.
///
/// Used by array writers which know their element signature but hold no parse
/// tree for it.
pub(crate) fn alignment_of_code(code: u8) -> usize {
    match code {
        b'y' | b'g' | b'v' => 1,
        b'n' | b'q' => 2,
        b'b' | b'i' | b'u' | b'h' | b's' | b'o' | b'a' => 4,
        b'x' | b't' | b'd' | b'(' | b'{' => 8,
        _ => 1,
    }
}

/// Parse a signature into the single complete types it contains.
///
/// The empty signature parses to an empty sequence.
pub(crate) fn parse_signature(signature: &str) -> Result<Vec<TypeNode>, SignatureError> {
    use SignatureErrorKind::*;

    if signature.len() > MAX_LENGTH {
        return Err(SignatureError::new(SignatureTooLong));
    }

    let bytes = signature.as_bytes();
    let mut pos = 0;
    let mut nodes = Vec::new();

    while pos < bytes.len() {
        nodes.push(parse_one(bytes, &mut pos, 0, false)?);
    }

    Ok(nodes)
}

/// Parse a signature which must consist of exactly one single complete type.
pub(crate) fn parse_single(signature: &str) -> Result<TypeNode, SignatureError> {
    let mut nodes = parse_signature(signature)?;

    if nodes.len() != 1 {
        return Err(SignatureError::new(
            SignatureErrorKind::NotSingleCompleteType,
        ));
    }

    Ok(nodes.remove(0))
}

fn parse_one(
    bytes: &[u8],
    pos: &mut usize,
    depth: usize,
    inside_array: bool,
) -> Result<TypeNode, SignatureError> {
    use SignatureErrorKind::*;

    if depth > MAX_DEPTH {
        return Err(SignatureError::new(ExceededMaxDepth));
    }

    let Some(&b) = bytes.get(*pos) else {
        return Err(SignatureError::new(UnexpectedEnd));
    };

    *pos += 1;

    let node = match b {
        b'y' => TypeNode::Byte,
        b'b' => TypeNode::Bool,
        b'n' => TypeNode::Int16,
        b'q' => TypeNode::Uint16,
        b'i' => TypeNode::Int32,
        b'u' => TypeNode::Uint32,
        b'x' => TypeNode::Int64,
        b't' => TypeNode::Uint64,
        b'd' => TypeNode::Double,
        b'h' => TypeNode::UnixFd,
        b's' => TypeNode::Str,
        b'o' => TypeNode::ObjectPath,
        b'g' => TypeNode::Signature,
        b'v' => TypeNode::Variant,
        b'a' => {
            let item = parse_one(bytes, pos, depth + 1, true)?;
            TypeNode::Array(Box::new(item))
        }
        b'(' => {
            let mut fields = Vec::new();

            loop {
                match bytes.get(*pos) {
                    None => return Err(SignatureError::new(StructStartedButNotEnded)),
                    Some(b')') => {
                        *pos += 1;
                        break;
                    }
                    Some(..) => {
                        fields.push(parse_one(bytes, pos, depth + 1, false)?);
                    }
                }
            }

            if fields.is_empty() {
                return Err(SignatureError::new(StructHasNoFields));
            }

            TypeNode::Struct(fields)
        }
        b'{' => {
            if !inside_array {
                return Err(SignatureError::new(DictEntryNotInsideArray));
            }

            if bytes.get(*pos) == Some(&b'}') {
                return Err(SignatureError::new(DictEntryHasNoFields));
            }

            let key = parse_one(bytes, pos, depth + 1, false)?;

            if !key.is_basic() {
                return Err(SignatureError::new(DictKeyMustBeBasicType));
            }

            if bytes.get(*pos) == Some(&b'}') {
                return Err(SignatureError::new(DictEntryHasOnlyOneField));
            }

            let value = parse_one(bytes, pos, depth + 1, false)?;

            match bytes.get(*pos) {
                Some(b'}') => {
                    *pos += 1;
                }
                Some(..) => return Err(SignatureError::new(DictEntryHasTooManyFields)),
                None => return Err(SignatureError::new(DictStartedButNotEnded)),
            }

            TypeNode::DictEntry(Box::new(key), Box::new(value))
        }
        b')' => return Err(SignatureError::new(StructEndedButNotStarted)),
        b'}' => return Err(SignatureError::new(DictEndedButNotStarted)),
        b => return Err(SignatureError::new(UnknownTypeCode(b))),
    };

    Ok(node)
}
