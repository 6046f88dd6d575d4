//! Transactions: the command layer carried in a packet payload
//!
//! ```text
//! payload offset  size  field
//! 0               2     command id, u16 BE
//! 2               4     transaction id, u32 BE
//! 6               1     flags (bit 0: response expected)
//! 7               ...   arguments
//! ```
//!
//! Responses use command id `0xA000`, and start their arguments with the response
//! code and the id of the command being answered.

use idp_frame::{encode_str, Address, DecodeError, Packet, PacketFlags, Reader, Scalar};

use crate::well_known::{Command, CommandFlags, ResponseCode};

/// Size of the transaction header at the start of every payload
pub const TRANSACTION_HEADER_LEN: usize = 7;
/// Where a response keeps its response code
pub const RESPONSE_CODE_OFFSET: usize = TRANSACTION_HEADER_LEN;

/// An append-only transaction, turned into a [`Packet`] when sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingTransaction {
    command: Command,
    transaction_id: u32,
    flags: CommandFlags,
    packet_flags: PacketFlags,
    payload: Vec<u8>,
}

impl OutgoingTransaction {
    pub fn new(command: impl Into<Command>, transaction_id: u32, flags: CommandFlags) -> Self {
        let command = command.into();
        let mut payload = Vec::with_capacity(32);
        command.id().encode(&mut payload);
        transaction_id.encode(&mut payload);
        flags.encode(&mut payload);
        Self {
            command,
            transaction_id,
            flags,
            packet_flags: PacketFlags::NONE,
            payload,
        }
    }

    /// A request that expects a response
    pub fn request(command: impl Into<Command>, transaction_id: u32) -> Self {
        Self::new(command, transaction_id, CommandFlags::RESPONSE_EXPECTED)
    }

    /// A response to `incoming`, pre-seeded with [`ResponseCode::Ok`] and the
    /// echoed command id.
    pub fn response_to(incoming: &IncomingTransaction) -> Self {
        let mut out = Self::new(
            Command::Response,
            incoming.transaction_id(),
            CommandFlags::NONE,
        );
        out.write(ResponseCode::Ok).write(incoming.command_id());
        out
    }

    /// Ask for a CRC trailer on the packet this becomes.
    pub fn with_crc(mut self) -> Self {
        self.packet_flags = PacketFlags::CRC;
        self
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn command_id(&self) -> u16 {
        self.command.id()
    }

    pub fn transaction_id(&self) -> u32 {
        self.transaction_id
    }

    pub fn flags(&self) -> CommandFlags {
        self.flags
    }

    pub fn is_response(&self) -> bool {
        self.command == Command::Response
    }

    pub fn write<T: Scalar>(&mut self, value: T) -> &mut Self {
        value.encode(&mut self.payload);
        self
    }

    pub fn with<T: Scalar>(mut self, value: T) -> Self {
        self.write(value);
        self
    }

    /// Write a NUL-terminated UTF-8 string.
    pub fn write_str(&mut self, s: &str) -> &mut Self {
        encode_str(s, &mut self.payload);
        self
    }

    pub fn with_str(mut self, s: &str) -> Self {
        self.write_str(s);
        self
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.payload.extend_from_slice(bytes);
        self
    }

    /// Overwrite already-written bytes at payload offset `index`.
    ///
    /// # Panics
    ///
    /// Panics if the value would extend past what has been written.
    pub fn write_at<T: Scalar>(&mut self, index: usize, value: T) -> &mut Self {
        let mut scratch = Vec::with_capacity(T::SIZE);
        value.encode(&mut scratch);
        let end = index + scratch.len();
        assert!(
            end <= self.payload.len(),
            "patch at {index}..{end} past the end of a {}-byte transaction",
            self.payload.len()
        );
        self.payload[index..end].copy_from_slice(&scratch);
        self
    }

    /// # Panics
    ///
    /// Panics unless this is a response with its code slot written.
    pub fn set_response_code(&mut self, code: ResponseCode) -> &mut Self {
        assert!(self.is_response(), "response code on a non-response transaction");
        self.write_at(RESPONSE_CODE_OFFSET, code)
    }

    pub fn response_code(&self) -> Option<ResponseCode> {
        if !self.is_response() {
            return None;
        }
        let raw = *self.payload.get(RESPONSE_CODE_OFFSET)?;
        ResponseCode::try_from(raw).ok()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn to_packet(&self, source: Address, destination: Address) -> Packet {
        Packet::encode(&self.payload, self.packet_flags, source, destination)
    }
}

/// A read cursor over a received packet's transaction
#[derive(Debug, Clone)]
pub struct IncomingTransaction {
    packet: Packet,
    command: Command,
    transaction_id: u32,
    flags: CommandFlags,
    pos: usize,
}

impl IncomingTransaction {
    pub fn parse(packet: Packet) -> Result<Self, DecodeError> {
        let mut rdr = Reader::new(packet.payload());
        let command = Command::from_id(rdr.read::<u16>()?);
        let transaction_id = rdr.read::<u32>()?;
        let flags = rdr.read::<CommandFlags>()?;
        let pos = rdr.position();
        Ok(Self {
            packet,
            command,
            transaction_id,
            flags,
            pos,
        })
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    pub fn source(&self) -> Address {
        self.packet.source()
    }

    pub fn destination(&self) -> Address {
        self.packet.destination()
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn command_id(&self) -> u16 {
        self.command.id()
    }

    pub fn transaction_id(&self) -> u32 {
        self.transaction_id
    }

    pub fn flags(&self) -> CommandFlags {
        self.flags
    }

    pub fn response_expected(&self) -> bool {
        self.flags.response_expected()
    }

    pub fn read<T: Scalar>(&mut self) -> Result<T, DecodeError> {
        let mut rdr = Reader::at(self.packet.payload(), self.pos);
        let value = rdr.read()?;
        self.pos = rdr.position();
        Ok(value)
    }

    /// Read a NUL-terminated string; empty if no terminator remains.
    pub fn read_str(&mut self) -> String {
        let mut rdr = Reader::at(self.packet.payload(), self.pos);
        let s = rdr.read_str();
        self.pos = rdr.position();
        s
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&[u8], DecodeError> {
        let mut rdr = Reader::at(self.packet.payload(), self.pos);
        let bytes = rdr.read_bytes(len)?;
        self.pos = rdr.position();
        Ok(bytes)
    }

    /// Arguments not yet read
    pub fn remaining(&self) -> &[u8] {
        &self.packet.payload()[self.pos..]
    }
}

/// A received response, with its code and echoed command id already read
#[derive(Debug, Clone)]
pub struct Response {
    transaction: IncomingTransaction,
    code: ResponseCode,
    request: Command,
}

impl Response {
    pub fn parse(mut transaction: IncomingTransaction) -> Result<Self, DecodeError> {
        let code = transaction.read::<ResponseCode>()?;
        let request = Command::from_id(transaction.read::<u16>()?);
        Ok(Self {
            transaction,
            code,
            request,
        })
    }

    pub fn code(&self) -> ResponseCode {
        self.code
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    /// The command this response answers
    pub fn request(&self) -> Command {
        self.request
    }

    pub fn transaction_id(&self) -> u32 {
        self.transaction.transaction_id()
    }

    pub fn source(&self) -> Address {
        self.transaction.source()
    }

    pub fn destination(&self) -> Address {
        self.transaction.destination()
    }

    pub fn read<T: Scalar>(&mut self) -> Result<T, DecodeError> {
        self.transaction.read()
    }

    pub fn read_str(&mut self) -> String {
        self.transaction.read_str()
    }

    pub fn transaction(&self) -> &IncomingTransaction {
        &self.transaction
    }
}
