//! Push-fed frame parser
//!
//! Bytes from a link are fed in whatever chunks the transport hands over. The
//! parser holds at most one frame in flight, resuming mid-frame across chunk
//! boundaries, and resynchronizes on the next STX whenever framing is broken.

use crate::{
    check::{Crc32, FrameCheck},
    packet::{declared_length, verify_trailer, FRAME_OVERHEAD, HEADER_LEN},
    Packet, PacketFlags, ETX, STX,
};

/// Frames declaring more than this many bytes are discarded by default
pub const DEFAULT_MAX_FRAME_LEN: u32 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitForStx,
    WaitForLength,
    WaitForFlags,
    WaitForSource,
    WaitForDestination,
    WaitForPayload,
    WaitForEtx,
    WaitForCrc,
}

/// Why a partially received frame was thrown away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The declared length exceeds the configured maximum
    Oversized(u32),
    /// The declared length is too small for the flags given
    Undersized(u32),
    /// The byte where ETX belongs held something else
    MissingEtx(u8),
    /// The CRC trailer did not match
    CheckMismatch,
}

/// The result of feeding the parser.
#[derive(Debug)]
pub enum FeedResult<'input> {
    /// Consumed all data, still pending.
    Consumed,

    /// A frame was completed. Contains the remaining section of input, if any.
    Packet {
        packet: Packet,
        remaining: &'input [u8],
    },

    /// A partial frame was dropped and the parser went back to hunting for
    /// STX. Contains the remaining section of input, if any.
    Dropped {
        reason: DropReason,
        remaining: &'input [u8],
    },
}

/// A state machine turning a byte stream into [`Packet`]s
pub struct FrameParser {
    state: State,
    frame: Vec<u8>,
    length: usize,
    max_len: u32,
    check: Box<dyn FrameCheck>,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> Self {
        Self::with_max_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_len(max_len: u32) -> Self {
        Self {
            state: State::WaitForStx,
            frame: Vec::new(),
            length: 0,
            max_len,
            check: Box::new(Crc32),
        }
    }

    /// Replace the CRC-32 frame check used for CRC-flagged frames.
    pub fn with_check(mut self, check: impl FrameCheck + 'static) -> Self {
        self.check = Box::new(check);
        self
    }

    /// Is the parser between frames?
    pub fn is_idle(&self) -> bool {
        self.state == State::WaitForStx
    }

    /// Drop any partial frame and go back to hunting for STX.
    pub fn reset(&mut self) {
        self.state = State::WaitForStx;
        self.frame.clear();
        self.length = 0;
    }

    /// Feed a chunk of bytes, stopping after the first completed or dropped
    /// frame. Call again with `remaining` until [`FeedResult::Consumed`].
    pub fn feed<'input>(&mut self, mut input: &'input [u8]) -> FeedResult<'input> {
        while !input.is_empty() {
            if self.state == State::WaitForStx {
                let Some(n) = input.iter().position(|&b| b == STX) else {
                    return FeedResult::Consumed;
                };
                self.frame.clear();
                self.frame.push(STX);
                input = &input[n + 1..];
                self.state = State::WaitForLength;
                continue;
            }

            let target = self.target();
            input = self.fill(input, target);
            if self.frame.len() < target {
                return FeedResult::Consumed;
            }

            match self.state {
                State::WaitForStx => {}
                State::WaitForLength => {
                    let length = declared_length(&self.frame);
                    if length > self.max_len as usize {
                        return self.drop_frame(DropReason::Oversized(length as u32), input);
                    }
                    self.length = length;
                    self.state = State::WaitForFlags;
                }
                State::WaitForFlags => {
                    let flags = PacketFlags::from_bits(self.frame[5]);
                    if self.length < FRAME_OVERHEAD + flags.trailer_len() {
                        let length = self.length as u32;
                        return self.drop_frame(DropReason::Undersized(length), input);
                    }
                    self.state = State::WaitForSource;
                }
                State::WaitForSource => self.state = State::WaitForDestination,
                State::WaitForDestination => {
                    self.frame.reserve_exact(self.length - HEADER_LEN);
                    self.state = State::WaitForPayload;
                }
                State::WaitForPayload => self.state = State::WaitForEtx,
                State::WaitForEtx => {
                    let byte = self.frame[self.frame.len() - 1];
                    if byte != ETX {
                        return self.drop_frame(DropReason::MissingEtx(byte), input);
                    }
                    if self.flags().has_crc() {
                        self.state = State::WaitForCrc;
                    } else {
                        return self.emit(input);
                    }
                }
                State::WaitForCrc => {
                    if verify_trailer(&self.frame, self.check.as_ref()).is_err() {
                        return self.drop_frame(DropReason::CheckMismatch, input);
                    }
                    return self.emit(input);
                }
            }
        }
        FeedResult::Consumed
    }

    /// Feed a chunk and collect every frame completed within it, skipping drops.
    pub fn parse(&mut self, mut input: &[u8]) -> Vec<Packet> {
        let mut out = vec![];
        loop {
            input = match self.feed(input) {
                FeedResult::Consumed => break,
                FeedResult::Packet { packet, remaining } => {
                    out.push(packet);
                    remaining
                }
                FeedResult::Dropped { remaining, .. } => remaining,
            };
        }
        out
    }

    fn flags(&self) -> PacketFlags {
        PacketFlags::from_bits(self.frame[5])
    }

    /// How many bytes of the frame must be held before leaving the current state
    fn target(&self) -> usize {
        match self.state {
            State::WaitForStx => 1,
            State::WaitForLength => 5,
            State::WaitForFlags => 6,
            State::WaitForSource => 8,
            State::WaitForDestination => HEADER_LEN,
            State::WaitForPayload => self.length - 1 - self.flags().trailer_len(),
            State::WaitForEtx => self.length - self.flags().trailer_len(),
            State::WaitForCrc => self.length,
        }
    }

    fn fill<'input>(&mut self, input: &'input [u8], target: usize) -> &'input [u8] {
        let want = target.saturating_sub(self.frame.len()).min(input.len());
        let (take, rest) = input.split_at(want);
        self.frame.extend_from_slice(take);
        rest
    }

    fn emit<'input>(&mut self, remaining: &'input [u8]) -> FeedResult<'input> {
        let data = core::mem::take(&mut self.frame);
        self.reset();
        FeedResult::Packet {
            packet: Packet::from_validated(data),
            remaining,
        }
    }

    fn drop_frame<'input>(&mut self, reason: DropReason, remaining: &'input [u8]) -> FeedResult<'input> {
        self.reset();
        FeedResult::Dropped { reason, remaining }
    }
}
