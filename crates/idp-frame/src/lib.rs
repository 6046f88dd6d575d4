//! Wire framing for the IDP protocol
//!
//! This crate holds the pieces of IDP that only care about bytes:
//!
//! * [`Packet`] and [`PacketBuf`], the sealed frame and its builder
//! * [`FrameParser`], which turns a byte stream into packets and resyncs on errors
//! * [`Scalar`] and [`Reader`], the typed big-endian field codec
//! * [`FrameCheck`], the pluggable trailer check (CRC-32 by default)
//!
//! Everything about commands, transactions and routing lives in the `idp` crate.

pub mod address;
pub mod check;
pub mod packet;
pub mod parser;
pub mod scalar;

pub use address::Address;
pub use check::{Crc32, FrameCheck};
pub use packet::{
    FrameError, Packet, PacketBuf, PacketFlags, CRC_LEN, ETX, FRAME_OVERHEAD, HEADER_LEN, STX,
};
pub use parser::{DropReason, FeedResult, FrameParser, DEFAULT_MAX_FRAME_LEN};
pub use scalar::{encode_str, DecodeError, Reader, Scalar};
