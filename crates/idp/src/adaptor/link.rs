//! In-process links
//!
//! A pair of adaptors wired back to back, for connecting routers inside one
//! process. Whatever one end transmits is delivered to the router the other
//! end is registered with. Both ends report active once both are registered.

use std::sync::Arc;

use idp_frame::Packet;
use log::debug;

use crate::{
    adaptor::{Adaptor, AdaptorPort},
    Lock,
};

struct Shared {
    ports: [Lock<Option<AdaptorPort>>; 2],
}

/// One end of an in-process link
pub struct LinkAdaptor {
    name: String,
    side: usize,
    shared: Arc<Shared>,
}

/// Create both ends of a link.
pub fn pair(a: impl Into<String>, b: impl Into<String>) -> (Arc<LinkAdaptor>, Arc<LinkAdaptor>) {
    let shared = Arc::new(Shared {
        ports: [Lock::new(None), Lock::new(None)],
    });
    let a = Arc::new(LinkAdaptor {
        name: a.into(),
        side: 0,
        shared: shared.clone(),
    });
    let b = Arc::new(LinkAdaptor {
        name: b.into(),
        side: 1,
        shared,
    });
    (a, b)
}

impl LinkAdaptor {
    fn port(&self, side: usize) -> Option<AdaptorPort> {
        self.shared.ports[side].with_lock(|p| p.clone())
    }

    /// Cut the link. Both routers see their port go inactive, and nothing
    /// crosses the link afterwards.
    pub fn sever(&self) {
        for side in 0..2 {
            if let Some(port) = self.shared.ports[side].with_lock(|p| p.take()) {
                port.set_active(false);
            }
        }
    }
}

impl Adaptor for LinkAdaptor {
    fn name(&self) -> &str {
        &self.name
    }

    fn transmit(&self, packet: Packet) -> bool {
        match self.port(1 - self.side) {
            Some(peer) => peer.deliver(packet),
            None => {
                debug!("{}: no peer, dropping {packet:?}", self.name);
                false
            }
        }
    }

    fn bind(&self, port: AdaptorPort) {
        self.shared.ports[self.side].with_lock(|p| *p = Some(port));
        if let (Some(mine), Some(peer)) = (self.port(self.side), self.port(1 - self.side)) {
            mine.set_active(true);
            peer.set_active(true);
        }
    }
}
