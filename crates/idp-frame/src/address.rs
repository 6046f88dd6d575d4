//! Node addresses
//!
//! Every device on an IDP network is reachable through a single 16-bit address.
//! A handful of values are reserved:
//!
//! | Value    | Meaning                                             |
//! | :------- | :-------------------------------------------------- |
//! | `0x0000` | Broadcast, delivered to every enumerated node       |
//! | `0x0001` | The master node                                     |
//! | `0xFFFE` | Router poll, only ever handled by the next router   |
//! | `0xFFFF` | Unassigned, the address of a node nobody enumerated |
//!
//! Every other value must be unique across the live network.

use core::fmt;

/// A 16-bit node address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub u16);

impl Address {
    pub const BROADCAST: Self = Self(0x0000);
    pub const MASTER: Self = Self(0x0001);
    pub const ROUTER_POLL: Self = Self(0xFFFE);
    pub const UNASSIGNED: Self = Self(0xFFFF);

    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn is_broadcast(self) -> bool {
        self.0 == Self::BROADCAST.0
    }

    #[inline]
    pub const fn is_unassigned(self) -> bool {
        self.0 == Self::UNASSIGNED.0
    }

    #[inline]
    pub const fn is_assigned(self) -> bool {
        !self.is_unassigned()
    }

    /// Is this one of the reserved sentinel values?
    pub const fn is_reserved(self) -> bool {
        matches!(self.0, 0x0000 | 0x0001 | 0xFFFE | 0xFFFF)
    }
}

impl Default for Address {
    fn default() -> Self {
        Self::UNASSIGNED
    }
}

impl From<u16> for Address {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<Address> for u16 {
    fn from(value: Address) -> Self {
        value.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::BROADCAST => f.write_str("Address(BROADCAST)"),
            Self::MASTER => f.write_str("Address(MASTER)"),
            Self::ROUTER_POLL => f.write_str("Address(ROUTER_POLL)"),
            Self::UNASSIGNED => f.write_str("Address(UNASSIGNED)"),
            Self(n) => write!(f, "Address({n:#06X})"),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06X}", self.0)
    }
}
