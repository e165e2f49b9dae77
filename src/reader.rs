use crate::error::{ErrorKind, Result};
use crate::proto::{Endianness, MAX_ARRAY_LENGTH};
use crate::signature::{parse_signature, parse_single};
use crate::value::{read_node, Value};

macro_rules! read_number {
    ($(#[$meta:meta])* $name:ident, $ty:ty) => {
        $(#[$meta])*
        pub fn $name(&mut self) -> Result<$ty> {
            const N: usize = std::mem::size_of::<$ty>();

            self.align(N)?;
            let bytes = self.take(N)?;
            let mut array = [0u8; N];
            array.copy_from_slice(bytes);

            Ok(match self.endianness {
                Endianness::Little => <$ty>::from_le_bytes(array),
                Endianness::Big => <$ty>::from_be_bytes(array),
            })
        }
    };
}

/// A cursor over a borrowed byte buffer holding marshaled values.
///
/// Typed reads are the inverses of the [`ByteWriter`] writes: each aligns the
/// cursor to the natural alignment of the type first. Alignment is measured
/// from the start of the buffer, or from the point last rebased with
/// [`mark_start`], since D-Bus alignment is always relative to the first byte
/// of the message.
///
/// [`ByteWriter`]: crate::ByteWriter
/// [`mark_start`]: Self::mark_start
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
    base: usize,
    endianness: Endianness,
}

impl<'a> ByteReader<'a> {
    /// Construct a reader over `data`.
    pub fn new(data: &'a [u8], endianness: Endianness) -> Self {
        Self {
            data,
            pos: 0,
            base: 0,
            endianness,
        }
    }

    /// The endianness multi-byte reads decode with.
    #[inline]
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Switch decoding endianness, used once a header's endian marker has
    /// been read.
    #[inline]
    pub fn set_endianness(&mut self, endianness: Endianness) {
        self.endianness = endianness;
    }

    /// The current cursor position.
    #[inline]
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Bytes between the cursor and the end of the buffer.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Rebase the buffer at the current cursor so that subsequent alignment
    /// is measured from here.
    pub fn mark_start(&mut self) {
        self.base = self.pos;
    }

    /// Advance the cursor to the next multiple of `align` relative to the
    /// alignment base.
    pub fn align(&mut self, align: usize) -> Result<()> {
        let padding = crate::utils::padding_to(align, self.pos - self.base);
        self.advance(padding)
    }

    /// Advance the cursor by `n` bytes.
    pub fn advance(&mut self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(ErrorKind::BufferUnderflow.into());
        }

        self.pos += n;
        Ok(())
    }

    /// Take `n` bytes off the front of the buffer.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ErrorKind::BufferUnderflow.into());
        }

        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        let bytes = self.take(1)?;
        Ok(bytes[0])
    }

    read_number!(read_u16, u16);
    read_number!(read_i16, i16);
    read_number!(read_u32, u32);
    read_number!(read_i32, i32);
    read_number!(read_u64, u64);
    read_number!(read_i64, i64);

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// Booleans are a `u32` holding `0` or `1`; everything else is invalid.
    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(ErrorKind::InvalidBool(value).into()),
        }
    }

    pub fn read_unix_fd(&mut self) -> Result<u32> {
        self.read_u32()
    }

    /// Read a string: `u32` byte length, UTF-8 bytes, one NUL.
    pub fn read_str(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        let string = std::str::from_utf8(bytes)?;
        self.skip_nul()?;
        Ok(string.to_owned())
    }

    pub fn read_object_path(&mut self) -> Result<String> {
        self.read_str()
    }

    /// Read a signature: `u8` length with no alignment, bytes, one NUL.
    pub fn read_signature(&mut self) -> Result<String> {
        let len = self.read_byte()? as usize;
        let bytes = self.take(len)?;
        let string = std::str::from_utf8(bytes)?;
        self.skip_nul()?;
        Ok(string.to_owned())
    }

    /// Read an array frame: `u32` byte length, alignment to the element
    /// boundary, then `per_item` until exactly `byte length` bytes past the
    /// post-alignment point have been consumed.
    ///
    /// Advancing past the declared length is a codec error.
    pub fn consume_array<F>(&mut self, item_align: usize, mut per_item: F) -> Result<()>
    where
        F: FnMut(&mut Self) -> Result<()>,
    {
        let len = self.read_u32()?;

        if len > MAX_ARRAY_LENGTH {
            return Err(ErrorKind::ArrayTooLong(len).into());
        }

        let len = len as usize;
        self.align(item_align)?;
        let start = self.pos;

        while self.pos - start < len {
            per_item(self)?;

            if self.pos - start > len {
                return Err(ErrorKind::ArrayOutOfBounds.into());
            }

            if self.pos - start < len {
                self.align(item_align)?;

                if self.pos - start > len {
                    return Err(ErrorKind::ArrayOutOfBounds.into());
                }
            }
        }

        Ok(())
    }

    /// Read a variant: a signature holding exactly one single complete type,
    /// then one value of that type.
    pub fn read_variant(&mut self) -> Result<Value> {
        let signature = self.read_signature()?;
        let node = parse_single(&signature)?;
        read_node(self, &node)
    }

    /// Read as many single complete types as `signature` contains.
    pub fn read_values(&mut self, signature: &str) -> Result<Vec<Value>> {
        let nodes = parse_signature(signature)?;
        let mut values = Vec::with_capacity(nodes.len());

        for node in &nodes {
            values.push(read_node(self, node)?);
        }

        Ok(values)
    }

    fn skip_nul(&mut self) -> Result<()> {
        if self.read_byte()? != 0 {
            return Err(ErrorKind::NotNullTerminated.into());
        }

        Ok(())
    }
}
