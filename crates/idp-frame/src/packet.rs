//! Packets and the packet builder
//!
//! On the wire, every frame looks like this:
//!
//! ```text
//! offset  size  field
//! 0       1     STX (0x02)
//! 1       4     total length, u32 BE, STX through the trailer
//! 5       1     flags (bit 0: CRC trailer present)
//! 6       2     source address, u16 BE
//! 8       2     destination address, u16 BE
//! 10      N     payload
//! 10+N    1     ETX (0x03)
//! 11+N    4     CRC trailer, u32 BE (only with the CRC flag)
//! ```
//!
//! A [`PacketBuf`] is the append-only builder, a [`Packet`] is the sealed,
//! immutable result. Packets share their storage, so cloning one to hand it to
//! several links is cheap.

use core::{fmt, ops::BitOr};
use std::sync::Arc;

use thiserror::Error;

use crate::{
    check::{Crc32, FrameCheck},
    scalar::{encode_str, Scalar},
    Address,
};

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;

/// Bytes before the payload: STX, length, flags, source, destination
pub const HEADER_LEN: usize = 10;
/// Header plus ETX, the size of a frame with an empty payload
pub const FRAME_OVERHEAD: usize = HEADER_LEN + 1;
/// Size of the optional CRC trailer
pub const CRC_LEN: usize = 4;

/// Frame-level flags
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub const NONE: Self = Self(0x00);
    pub const CRC: Self = Self(0x01);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn has_crc(self) -> bool {
        self.contains(Self::CRC)
    }

    /// Length of the trailer these flags call for
    pub const fn trailer_len(self) -> usize {
        if self.has_crc() {
            CRC_LEN
        } else {
            0
        }
    }
}

impl BitOr for PacketFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for PacketFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_crc() {
            write!(f, "PacketFlags(CRC|{:#04x})", self.0)
        } else {
            write!(f, "PacketFlags({:#04x})", self.0)
        }
    }
}

/// Errors from validating a complete frame held in memory
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum FrameError {
    #[error("frame of {0} bytes is below the minimum frame size")]
    TooShort(usize),
    #[error("frame does not start with STX")]
    MissingStx,
    #[error("declared length {declared} does not match the {actual} bytes given")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("frame does not end with ETX")]
    MissingEtx,
    #[error("frame check mismatch, expected {expected:#010x}, got {received:#010x}")]
    CheckMismatch { expected: u32, received: u32 },
}

/// A sealed, immutable frame
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    data: Arc<[u8]>,
}

impl Packet {
    /// Frame `payload`, with a CRC-32 trailer if `flags` asks for one.
    pub fn encode(
        payload: &[u8],
        flags: PacketFlags,
        source: Address,
        destination: Address,
    ) -> Self {
        Self::encode_with(payload, flags, source, destination, &Crc32)
    }

    pub fn encode_with(
        payload: &[u8],
        flags: PacketFlags,
        source: Address,
        destination: Address,
        check: &dyn FrameCheck,
    ) -> Self {
        let mut buf = PacketBuf::new(payload.len(), flags, source, destination);
        buf.extend_from_slice(payload);
        buf.seal_with(check);
        buf.freeze()
    }

    /// Validate a complete frame, checking any CRC trailer as CRC-32.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        Self::from_bytes_with(bytes, &Crc32)
    }

    pub fn from_bytes_with(bytes: &[u8], check: &dyn FrameCheck) -> Result<Self, FrameError> {
        if bytes.len() < FRAME_OVERHEAD {
            return Err(FrameError::TooShort(bytes.len()));
        }
        if bytes[0] != STX {
            return Err(FrameError::MissingStx);
        }
        let declared = declared_length(bytes);
        if declared != bytes.len() {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: bytes.len(),
            });
        }
        let flags = PacketFlags(bytes[5]);
        let trailer = flags.trailer_len();
        if bytes.len() < FRAME_OVERHEAD + trailer {
            return Err(FrameError::TooShort(bytes.len()));
        }
        let etx = bytes.len() - 1 - trailer;
        if bytes[etx] != ETX {
            return Err(FrameError::MissingEtx);
        }
        if flags.has_crc() {
            verify_trailer(bytes, check)?;
        }
        Ok(Self::from_validated(bytes.to_vec()))
    }

    /// Wrap bytes that have already been checked by the parser or builder.
    pub(crate) fn from_validated(data: Vec<u8>) -> Self {
        Self { data: data.into() }
    }

    /// The whole frame, STX through the trailer
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Total frame length, as declared in the header
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Does this packet carry an empty payload?
    pub fn is_empty(&self) -> bool {
        self.payload().is_empty()
    }

    pub fn flags(&self) -> PacketFlags {
        PacketFlags(self.data[5])
    }

    pub fn source(&self) -> Address {
        Address(u16::from_be_bytes([self.data[6], self.data[7]]))
    }

    pub fn destination(&self) -> Address {
        Address(u16::from_be_bytes([self.data[8], self.data[9]]))
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[HEADER_LEN..self.etx_index()]
    }

    /// The CRC trailer, if this frame carries one
    pub fn crc(&self) -> Option<u32> {
        if !self.flags().has_crc() {
            return None;
        }
        let n = self.data.len();
        let mut raw = [0u8; CRC_LEN];
        raw.copy_from_slice(&self.data[n - CRC_LEN..]);
        Some(u32::from_be_bytes(raw))
    }

    fn etx_index(&self) -> usize {
        self.data.len() - 1 - self.flags().trailer_len()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("source", &self.source())
            .field("destination", &self.destination())
            .field("flags", &self.flags())
            .field("payload_len", &self.payload().len())
            .finish()
    }
}

pub(crate) fn declared_length(header: &[u8]) -> usize {
    u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize
}

/// Compare the trailer of a complete CRC-flagged frame against `check`.
pub(crate) fn verify_trailer(frame: &[u8], check: &dyn FrameCheck) -> Result<(), FrameError> {
    let (body, trailer) = frame.split_at(frame.len() - CRC_LEN);
    let received = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let expected = check.compute(body);
    if expected == received {
        Ok(())
    } else {
        Err(FrameError::CheckMismatch { expected, received })
    }
}

/// An append-only frame under construction
///
/// The header is written up front from the declared payload length. Once the
/// payload is in, [`PacketBuf::seal`] appends ETX and the trailer. Sealing a
/// second time does nothing.
#[derive(Debug, Clone)]
pub struct PacketBuf {
    data: Vec<u8>,
    total: usize,
    flags: PacketFlags,
    sealed: bool,
}

impl PacketBuf {
    pub fn new(payload_len: usize, flags: PacketFlags, source: Address, destination: Address) -> Self {
        let total = FRAME_OVERHEAD + payload_len + flags.trailer_len();
        let mut data = Vec::with_capacity(total);
        data.push(STX);
        data.extend_from_slice(&(total as u32).to_be_bytes());
        data.push(flags.bits());
        source.encode(&mut data);
        destination.encode(&mut data);
        Self {
            data,
            total,
            flags,
            sealed: false,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    fn declared_payload_len(&self) -> usize {
        self.total - FRAME_OVERHEAD - self.flags.trailer_len()
    }

    /// # Panics
    ///
    /// Panics if the buffer is sealed.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> &mut Self {
        assert!(!self.sealed, "write to a sealed packet");
        self.data.extend_from_slice(bytes);
        self
    }

    /// # Panics
    ///
    /// Panics if the buffer is sealed.
    pub fn write<T: Scalar>(&mut self, value: T) -> &mut Self {
        assert!(!self.sealed, "write to a sealed packet");
        value.encode(&mut self.data);
        self
    }

    /// # Panics
    ///
    /// Panics if the buffer is sealed.
    pub fn write_str(&mut self, s: &str) -> &mut Self {
        assert!(!self.sealed, "write to a sealed packet");
        encode_str(s, &mut self.data);
        self
    }

    /// Seal with the default CRC-32 frame check.
    pub fn seal(&mut self) {
        self.seal_with(&Crc32)
    }

    /// # Panics
    ///
    /// Panics if the payload written does not match the length declared in
    /// [`PacketBuf::new`].
    pub fn seal_with(&mut self, check: &dyn FrameCheck) {
        if self.sealed {
            return;
        }
        assert_eq!(
            self.data.len(),
            HEADER_LEN + self.declared_payload_len(),
            "payload does not match the declared length"
        );
        self.data.push(ETX);
        if self.flags.has_crc() {
            let crc = check.compute(&self.data);
            self.data.extend_from_slice(&crc.to_be_bytes());
        }
        self.sealed = true;
    }

    /// Seal if needed, and hand back the finished packet.
    pub fn freeze(mut self) -> Packet {
        self.seal();
        Packet::from_validated(self.data)
    }
}

#[cfg(test)]
mod test {
    use super::{FrameError, Packet, PacketBuf, PacketFlags, CRC_LEN, ETX, FRAME_OVERHEAD, STX};
    use crate::{
        check::{Crc32, FrameCheck},
        Address,
    };

    #[test]
    fn layout() {
        let pkt = Packet::encode(&[0xAA, 0xBB], PacketFlags::NONE, Address(0x0102), Address(0x0304));
        assert_eq!(
            pkt.as_bytes(),
            &[STX, 0, 0, 0, 13, 0x00, 0x01, 0x02, 0x03, 0x04, 0xAA, 0xBB, ETX]
        );
        assert_eq!(pkt.len(), FRAME_OVERHEAD + 2);
        assert_eq!(pkt.source(), Address(0x0102));
        assert_eq!(pkt.destination(), Address(0x0304));
        assert_eq!(pkt.payload(), &[0xAA, 0xBB]);
        assert_eq!(pkt.crc(), None);
    }

    #[test]
    fn crc_trailer() {
        let pkt = Packet::encode(b"hi", PacketFlags::CRC, Address::MASTER, Address(7));
        assert_eq!(pkt.len(), FRAME_OVERHEAD + 2 + CRC_LEN);
        let bytes = pkt.as_bytes();
        assert_eq!(bytes[bytes.len() - 1 - CRC_LEN], ETX);
        let expected = Crc32.compute(&bytes[..bytes.len() - CRC_LEN]);
        assert_eq!(pkt.crc(), Some(expected));
        assert_eq!(pkt.payload(), b"hi");

        let round = Packet::from_bytes(bytes).unwrap();
        assert_eq!(round, pkt);

        let mut tampered = bytes.to_vec();
        tampered[10] ^= 0x01;
        assert!(matches!(
            Packet::from_bytes(&tampered),
            Err(FrameError::CheckMismatch { .. })
        ));
    }

    #[test]
    fn seal_is_idempotent() {
        let mut buf = PacketBuf::new(3, PacketFlags::CRC, Address(2), Address(3));
        buf.write(0x12u8).write(0x3456u16);
        buf.seal();
        let once = buf.clone().freeze();
        buf.seal();
        buf.seal();
        let thrice = buf.freeze();
        assert_eq!(once, thrice);
        assert_eq!(once.len(), FRAME_OVERHEAD + 3 + CRC_LEN);
    }

    #[test]
    #[should_panic(expected = "sealed")]
    fn write_after_seal() {
        let mut buf = PacketBuf::new(0, PacketFlags::NONE, Address(2), Address(3));
        buf.seal();
        buf.write(1u8);
    }

    #[test]
    fn rejects_malformed() {
        let good = Packet::encode(&[1, 2, 3], PacketFlags::NONE, Address(2), Address(3));
        let bytes = good.as_bytes();

        assert_eq!(Packet::from_bytes(&bytes[..5]), Err(FrameError::TooShort(5)));

        let mut no_stx = bytes.to_vec();
        no_stx[0] = 0x00;
        assert_eq!(Packet::from_bytes(&no_stx), Err(FrameError::MissingStx));

        let mut no_etx = bytes.to_vec();
        let last = no_etx.len() - 1;
        no_etx[last] = 0x04;
        assert_eq!(Packet::from_bytes(&no_etx), Err(FrameError::MissingEtx));

        let mut extra = bytes.to_vec();
        extra.push(0);
        assert_eq!(
            Packet::from_bytes(&extra),
            Err(FrameError::LengthMismatch {
                declared: 14,
                actual: 15
            })
        );
    }
}
