//! Typed big-endian field encoding
//!
//! Every multi-byte field on the wire is big-endian. GUIDs are written as their
//! four sub-fields (`u32`, `u16`, `u16`, then 8 raw bytes) through the same
//! writers, so a GUID on the wire reads the same as its canonical text form.
//!
//! Only types that implement [`Scalar`] can be written or read, so an attempt to
//! put an unsupported type on the wire fails to compile.

use thiserror::Error;
use uuid::Uuid;

use crate::Address;

/// Errors from reading typed fields out of a buffer
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer ended before the field did
    #[error("needed {needed} bytes but only {available} remain")]
    Truncated { needed: usize, available: usize },
    /// A byte did not map onto any variant of an enumerated field
    #[error("{value:#04x} is not a valid {kind}")]
    InvalidValue { kind: &'static str, value: u8 },
}

/// A fixed-size value with a wire encoding.
pub trait Scalar: Sized {
    /// Encoded size in bytes
    const SIZE: usize;

    fn encode(&self, out: &mut Vec<u8>);

    /// `bytes` is exactly [`Self::SIZE`] long.
    fn decode(bytes: &[u8]) -> Result<Self, DecodeError>;
}

macro_rules! be_scalar {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Scalar for $ty {
                const SIZE: usize = core::mem::size_of::<$ty>();

                #[inline]
                fn encode(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_be_bytes());
                }

                #[inline]
                fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
                    let mut raw = [0u8; core::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    Ok(<$ty>::from_be_bytes(raw))
                }
            }
        )*
    };
}

be_scalar!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl Scalar for bool {
    const SIZE: usize = 1;

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(u8::from(*self));
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(bytes[0] != 0)
    }
}

impl Scalar for Address {
    const SIZE: usize = 2;

    fn encode(&self, out: &mut Vec<u8>) {
        self.0.encode(out);
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        u16::decode(bytes).map(Address)
    }
}

impl Scalar for Uuid {
    const SIZE: usize = 16;

    fn encode(&self, out: &mut Vec<u8>) {
        let (d1, d2, d3, d4) = self.as_fields();
        d1.encode(out);
        d2.encode(out);
        d3.encode(out);
        out.extend_from_slice(d4);
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let d1 = u32::decode(&bytes[0..4])?;
        let d2 = u16::decode(&bytes[4..6])?;
        let d3 = u16::decode(&bytes[6..8])?;
        let mut d4 = [0u8; 8];
        d4.copy_from_slice(&bytes[8..16]);
        Ok(Uuid::from_fields(d1, d2, d3, &d4))
    }
}

/// Appends `s` as UTF-8 followed by a NUL terminator.
pub fn encode_str(s: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

/// A read cursor over a borrowed buffer
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Start reading at `pos`, clamped to the end of the buffer.
    pub fn at(buf: &'a [u8], pos: usize) -> Self {
        Self {
            buf,
            pos: pos.min(buf.len()),
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn read<T: Scalar>(&mut self) -> Result<T, DecodeError> {
        let bytes = self.read_bytes(T::SIZE)?;
        T::decode(bytes)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let rest = self.remaining();
        if rest.len() < len {
            return Err(DecodeError::Truncated {
                needed: len,
                available: rest.len(),
            });
        }
        self.pos += len;
        Ok(&rest[..len])
    }

    /// Reads a NUL-terminated UTF-8 string, consuming the terminator.
    ///
    /// Returns an empty string, without moving the cursor, if no terminator is
    /// found before the end of the buffer. Invalid UTF-8 is replaced lossily.
    pub fn read_str(&mut self) -> String {
        let rest = self.remaining();
        match rest.iter().position(|&b| b == 0) {
            Some(n) => {
                self.pos += n + 1;
                String::from_utf8_lossy(&rest[..n]).into_owned()
            }
            None => String::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use uuid::Uuid;

    use super::{encode_str, DecodeError, Reader, Scalar};

    fn encoded<T: Scalar>(v: T) -> Vec<u8> {
        let mut out = vec![];
        v.encode(&mut out);
        out
    }

    #[test]
    fn big_endian() {
        assert_eq!(encoded(0x1234u16), [0x12, 0x34]);
        assert_eq!(encoded(0xDEAD_BEEFu32), [0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(encoded(-2i16), [0xFF, 0xFE]);
        assert_eq!(encoded(1.0f32), [0x3F, 0x80, 0x00, 0x00]);
        assert_eq!(encoded(true), [0x01]);
    }

    #[test]
    fn guid_fields() {
        let guid = Uuid::from_u128(0xA1EE332D_5C7C_42FE_9519_54BDAC40CF21);
        let bytes = encoded(guid);
        assert_eq!(
            bytes,
            [
                0xA1, 0xEE, 0x33, 0x2D, 0x5C, 0x7C, 0x42, 0xFE, 0x95, 0x19, 0x54, 0xBD, 0xAC, 0x40,
                0xCF, 0x21
            ]
        );
        let mut rdr = Reader::new(&bytes);
        assert_eq!(rdr.read::<Uuid>().unwrap(), guid);
        assert!(rdr.is_empty());
    }

    #[test]
    fn mixed_reads() {
        let mut buf = vec![];
        7u8.encode(&mut buf);
        (-40_000i32).encode(&mut buf);
        encode_str("Network.Router", &mut buf);
        0.5f64.encode(&mut buf);

        let mut rdr = Reader::new(&buf);
        assert_eq!(rdr.read::<u8>(), Ok(7));
        assert_eq!(rdr.read::<i32>(), Ok(-40_000));
        assert_eq!(rdr.read_str(), "Network.Router");
        assert_eq!(rdr.read::<f64>(), Ok(0.5));
        assert_eq!(
            rdr.read::<u16>(),
            Err(DecodeError::Truncated {
                needed: 2,
                available: 0
            })
        );
    }

    #[test]
    fn unterminated_string() {
        let buf = b"no terminator";
        let mut rdr = Reader::new(buf);
        assert_eq!(rdr.read_str(), "");
        assert_eq!(rdr.position(), 0);

        let mut rdr = Reader::new(b"\0tail");
        assert_eq!(rdr.read_str(), "");
        assert_eq!(rdr.position(), 1);
    }
}
