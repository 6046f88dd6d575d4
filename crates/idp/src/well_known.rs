//! Well-known command ids, response codes and identities

use core::fmt;

use idp_frame::{DecodeError, Scalar};
use uuid::Uuid;

/// GUID every router reports from GetNodeInfo
pub const ROUTER_GUID: Uuid = Uuid::from_u128(0xA1EE332D_5C7C_42FE_9519_54BDAC40CF21);
pub const ROUTER_NAME: &str = "Network.Router";

/// GUID the master reports from GetNodeInfo
pub const MASTER_GUID: Uuid = Uuid::from_u128(0x554C0A67_F228_47B5_8155_8C5436D533DA);
pub const MASTER_NAME: &str = "Network.Master";

/// A command id
///
/// The protocol reserves `0xA000..=0xA00A`. Anything else is carried as
/// [`Command::Other`]; applications should keep their own ids at or above
/// [`Command::APPLICATION_BASE`]. Use [`Command::from_id`] (or `From<u16>`) so a
/// reserved id never ends up wrapped in `Other`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    Response,
    Ping,
    GetNodeInfo,
    QueryInterface,
    Reset,
    RecommendEnumeration,
    RouterDetect,
    RouterEnumerateNode,
    RouterPrepareToEnumerateAdaptors,
    RouterEnumerateAdaptor,
    MarkAdaptorConnected,
    Other(u16),
}

impl Command {
    pub const APPLICATION_BASE: u16 = 0xD000;

    pub const fn id(self) -> u16 {
        match self {
            Command::Response => 0xA000,
            Command::Ping => 0xA001,
            Command::GetNodeInfo => 0xA002,
            Command::QueryInterface => 0xA003,
            Command::Reset => 0xA004,
            Command::RecommendEnumeration => 0xA005,
            Command::RouterDetect => 0xA006,
            Command::RouterEnumerateNode => 0xA007,
            Command::RouterPrepareToEnumerateAdaptors => 0xA008,
            Command::RouterEnumerateAdaptor => 0xA009,
            Command::MarkAdaptorConnected => 0xA00A,
            Command::Other(id) => id,
        }
    }

    pub const fn from_id(id: u16) -> Self {
        match id {
            0xA000 => Command::Response,
            0xA001 => Command::Ping,
            0xA002 => Command::GetNodeInfo,
            0xA003 => Command::QueryInterface,
            0xA004 => Command::Reset,
            0xA005 => Command::RecommendEnumeration,
            0xA006 => Command::RouterDetect,
            0xA007 => Command::RouterEnumerateNode,
            0xA008 => Command::RouterPrepareToEnumerateAdaptors,
            0xA009 => Command::RouterEnumerateAdaptor,
            0xA00A => Command::MarkAdaptorConnected,
            other => Command::Other(other),
        }
    }

    pub const fn is_application(self) -> bool {
        self.id() >= Self::APPLICATION_BASE
    }
}

impl From<u16> for Command {
    fn from(id: u16) -> Self {
        Command::from_id(id)
    }
}

impl From<Command> for u16 {
    fn from(cmd: Command) -> Self {
        cmd.id()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Other(id) => write!(f, "{id:#06X}"),
            named => fmt::Debug::fmt(named, f),
        }
    }
}

/// Result of handling a command, carried in every response
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResponseCode {
    Ok = 0,
    UnknownCommand = 1,
    InvalidParameters = 2,
    UnknownError = 3,
    NotReady = 4,
    /// The handler will send its own reply; no automatic response goes out.
    Deferred = 5,
    Internal = 6,
}

impl ResponseCode {
    pub fn is_ok(self) -> bool {
        self == ResponseCode::Ok
    }
}

impl TryFrom<u8> for ResponseCode {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => ResponseCode::Ok,
            1 => ResponseCode::UnknownCommand,
            2 => ResponseCode::InvalidParameters,
            3 => ResponseCode::UnknownError,
            4 => ResponseCode::NotReady,
            5 => ResponseCode::Deferred,
            6 => ResponseCode::Internal,
            value => {
                return Err(DecodeError::InvalidValue {
                    kind: "response code",
                    value,
                })
            }
        })
    }
}

impl Scalar for ResponseCode {
    const SIZE: usize = 1;

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(*self as u8);
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        ResponseCode::try_from(bytes[0])
    }
}

/// Transaction-level flags
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct CommandFlags(u8);

impl CommandFlags {
    pub const NONE: Self = Self(0x00);
    pub const RESPONSE_EXPECTED: Self = Self(0x01);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn response_expected(self) -> bool {
        (self.0 & Self::RESPONSE_EXPECTED.0) != 0
    }
}

impl Scalar for CommandFlags {
    const SIZE: usize = 1;

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.0);
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(Self(bytes[0]))
    }
}

/// Capability bits trailing a GetNodeInfo reply
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const NONE: Self = Self(0x00);
    pub const ROUTER: Self = Self(0x01);
    pub const MASTER: Self = Self(0x02);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl Scalar for Capabilities {
    const SIZE: usize = 1;

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.0);
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(Self(bytes[0]))
    }
}

/// What a node reports about itself from GetNodeInfo
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub guid: Uuid,
    pub name: String,
    pub capabilities: Capabilities,
}

impl Identity {
    pub fn new(guid: Uuid, name: impl Into<String>) -> Self {
        Self {
            guid,
            name: name.into(),
            capabilities: Capabilities::NONE,
        }
    }

    pub fn router() -> Self {
        Self {
            guid: ROUTER_GUID,
            name: ROUTER_NAME.into(),
            capabilities: Capabilities::ROUTER,
        }
    }

    pub fn master() -> Self {
        Self {
            guid: MASTER_GUID,
            name: MASTER_NAME.into(),
            capabilities: Capabilities::MASTER,
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Command, ResponseCode, MASTER_GUID, ROUTER_GUID};

    #[test]
    fn command_ids() {
        for id in 0xA000..=0xA00A {
            let cmd = Command::from_id(id);
            assert!(!matches!(cmd, Command::Other(_)));
            assert_eq!(cmd.id(), id);
        }
        assert_eq!(Command::from(0x1234u16), Command::Other(0x1234));
        assert!(Command::Other(0xD001).is_application());
        assert!(!Command::Ping.is_application());
        assert_eq!(Command::RouterDetect.to_string(), "RouterDetect");
        assert_eq!(Command::Other(0xD001).to_string(), "0xD001");
    }

    #[test]
    fn response_codes() {
        for raw in 0..=6u8 {
            assert_eq!(ResponseCode::try_from(raw).unwrap() as u8, raw);
        }
        assert!(ResponseCode::try_from(7u8).is_err());
    }

    #[test]
    fn identities() {
        assert_eq!(
            ROUTER_GUID.hyphenated().to_string(),
            "a1ee332d-5c7c-42fe-9519-54bdac40cf21"
        );
        assert_eq!(
            MASTER_GUID.hyphenated().to_string(),
            "554c0a67-f228-47b5-8155-8c5436d533da"
        );
    }
}
