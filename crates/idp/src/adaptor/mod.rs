//! Adaptors
//!
//! An adaptor is one port of a router: whatever carries packets to the device on
//! the other end of a link. The router owns the bookkeeping for each port (its
//! [`AdaptorFlags`]); the adaptor only needs to move packets.
//!
//! Inbound, an adaptor hands received packets to the router through the
//! [`AdaptorPort`] it is given when registered. Ports feed the router's single
//! ingress queue, so adaptors never touch router state directly.

use core::fmt;
use std::sync::Arc;

use idp_frame::Packet;

use crate::router::{Ingress, RouterHandle};

pub mod link;
pub mod stream;

/// Router-local identifier of an adaptor
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct AdaptorId(pub u16);

impl fmt::Display for AdaptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "adaptor#{}", self.0)
    }
}

/// The per-port enumeration state kept by the router
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AdaptorFlags {
    /// The link is up
    pub active: bool,
    /// A device behind this port has been found and addressed
    pub enumerated: bool,
    /// Visited during the current adaptor sweep
    pub renumerated: bool,
}

/// A link a router can send packets out of
pub trait Adaptor: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Send `packet` to the other end of the link.
    ///
    /// Returns false if the link is down or refused the packet.
    fn transmit(&self, packet: Packet) -> bool;

    /// Called once, when the adaptor is registered with a router.
    fn bind(&self, port: AdaptorPort) {
        let _ = port;
    }
}

/// The router-facing side of an adaptor
#[derive(Clone)]
pub struct AdaptorPort {
    id: AdaptorId,
    router: RouterHandle,
}

impl AdaptorPort {
    pub(crate) fn new(id: AdaptorId, router: RouterHandle) -> Self {
        Self { id, router }
    }

    pub fn id(&self) -> AdaptorId {
        self.id
    }

    /// Hand a received packet to the router.
    pub fn deliver(&self, packet: Packet) -> bool {
        self.router.send(Ingress::Packet {
            adaptor: Some(self.id),
            packet,
        })
    }

    /// Report the link coming up or going down.
    ///
    /// A port that comes up starts over: it is neither enumerated nor swept.
    pub fn set_active(&self, active: bool) -> bool {
        self.router.send(Ingress::SetActive {
            adaptor: self.id,
            active,
        })
    }
}

impl fmt::Debug for AdaptorPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptorPort").field("id", &self.id).finish()
    }
}

/// Shorthand for the adaptor trait objects routers hold
pub type SharedAdaptor = Arc<dyn Adaptor>;
