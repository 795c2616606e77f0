//! Big-endian, length-prefixed primitives for the ticket wire format.
//!
//! [`Writer`] appends fixed-width integers and length-prefixed byte strings to
//! a buffer. [`Reader`] is a bounds-checked cursor over a borrowed buffer;
//! every read either advances the cursor or fails with a [`DecodeError`]
//! without consuming anything.

use crate::spec::ValidationError;
use thiserror::Error;

/// Errors raised while decoding wire payloads.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// The buffer ended before a field was complete.
    #[error("Truncated input: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Bytes the field required.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// A tag byte held a value outside its defined set.
    #[error("Unknown {what} discriminant: {value}")]
    UnknownDiscriminant {
        /// Which tag was being read.
        what: &'static str,
        /// The offending value.
        value: u8,
    },

    /// A length prefix disagreed with the structure it describes.
    #[error("Inconsistent {what} length: expected {expected}, found {actual}")]
    InconsistentLength {
        /// Which field carried the length.
        what: &'static str,
        /// Length the structure requires.
        expected: usize,
        /// Length found on the wire.
        actual: usize,
    },

    /// A text field was not valid UTF-8.
    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    /// An embedded structured payload could not be parsed.
    #[error("Invalid structured payload: {0}")]
    InvalidStructure(String),

    /// The decoded fields do not form a valid value.
    #[error("Decoded value is invalid: {0}")]
    InvalidField(#[from] ValidationError),

    /// A raw ledger transaction could not be decoded.
    #[error("Invalid transaction payload: {0}")]
    Transaction(String),
}

/// Append-only encoder.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    /// Create an empty writer.
    #[must_use]
    pub const fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Append one byte.
    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Append a big-endian `u16`.
    pub fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Append a big-endian `u64`.
    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Append a big-endian two's complement `i64`.
    pub fn put_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Append raw bytes with no prefix.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Consume the writer, returning the encoded bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Bounds-checked decoding cursor.
#[derive(Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Start reading `data` at `offset`.
    #[must_use]
    pub const fn at(data: &'a [u8], offset: usize) -> Self {
        Self { data, pos: offset }
    }

    /// Current offset into the buffer.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left after the cursor.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Read exactly `n` bytes.
    ///
    /// # Errors
    ///
    /// [`DecodeError::Truncated`] when fewer than `n` bytes remain.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let remaining = self.remaining();
        if n > remaining {
            return Err(DecodeError::Truncated { needed: n, remaining });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Read one byte.
    ///
    /// # Errors
    ///
    /// [`DecodeError::Truncated`] at end of input.
    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.array::<1>()?[0])
    }

    /// Read a big-endian `u16`.
    ///
    /// # Errors
    ///
    /// [`DecodeError::Truncated`] at end of input.
    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        self.array().map(u16::from_be_bytes)
    }

    /// Read a big-endian `u64`.
    ///
    /// # Errors
    ///
    /// [`DecodeError::Truncated`] at end of input.
    pub fn u64(&mut self) -> Result<u64, DecodeError> {
        self.array().map(u64::from_be_bytes)
    }

    /// Read a big-endian `i64`.
    ///
    /// # Errors
    ///
    /// [`DecodeError::Truncated`] at end of input.
    pub fn i64(&mut self) -> Result<i64, DecodeError> {
        self.array().map(i64::from_be_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_big_endian() {
        let mut w = Writer::new();
        w.put_u16(0x0102);
        w.put_u64(3);
        w.put_i64(-1);
        let bytes = w.into_bytes();
        assert_eq!(&bytes[..2], &[0x01, 0x02]);
        assert_eq!(&bytes[2..10], &[0, 0, 0, 0, 0, 0, 0, 3]);
        assert_eq!(&bytes[10..], &[0xff; 8]);
    }

    #[test]
    fn reads_from_offset() {
        let data = [0xaa, 0x00, 0x05];
        let mut r = Reader::at(&data, 1);
        assert_eq!(r.u16(), Ok(5));
        assert_eq!(r.position(), 3);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn truncated_read_does_not_advance() {
        let data = [0x00, 0x01, 0x02];
        let mut r = Reader::at(&data, 0);
        assert_eq!(r.u64(), Err(DecodeError::Truncated { needed: 8, remaining: 3 }));
        assert_eq!(r.position(), 0);
        assert_eq!(r.u8(), Ok(0));
    }
}
