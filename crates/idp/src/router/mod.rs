//! Routers
//!
//! A router is a node with ports. It bridges the local nodes it owns and the
//! adaptors registered with it, learning which port each source address lives
//! behind, and it answers the router commands the master uses to discover the
//! network.
//!
//! Everything that wants to hand the router a packet (its own local nodes,
//! and every adaptor) goes through one ingress channel. The single
//! [`RouterWorker`] on the other end is the only place routes are learned and
//! packets are routed; replies produced while routing are queued and drained
//! in order, never by recursing into the router.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use idp_frame::{Address, Packet};
use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::{
    adaptor::{AdaptorFlags, AdaptorId, AdaptorPort, SharedAdaptor},
    config::IdpConfig,
    node::{LocalNode, Node, NodeCore, NodeState, PacketTransmit},
    transaction::OutgoingTransaction,
    well_known::{Command, CommandFlags, Identity, ResponseCode},
};

mod worker;

pub use worker::RouterWorker;

/// What the router's worker consumes
pub(crate) enum Ingress {
    /// A packet from a local node (`adaptor: None`) or from an adaptor
    Packet {
        adaptor: Option<AdaptorId>,
        packet: Packet,
    },
    /// An adaptor's link came up or went down
    SetActive { adaptor: AdaptorId, active: bool },
}

/// The sending side of a router's ingress channel
#[derive(Clone)]
pub(crate) struct RouterHandle {
    tx: mpsc::UnboundedSender<Ingress>,
}

impl RouterHandle {
    pub(crate) fn send(&self, msg: Ingress) -> bool {
        self.tx.send(msg).is_ok()
    }
}

/// The transmit capability handed to nodes owned by a router
struct LocalTransmit {
    router: RouterHandle,
}

impl PacketTransmit for LocalTransmit {
    fn transmit(&self, packet: Packet) -> bool {
        self.router.send(Ingress::Packet {
            adaptor: None,
            packet,
        })
    }
}

struct AdaptorSlot {
    adaptor: SharedAdaptor,
    flags: AdaptorFlags,
}

/// Where one packet should go
#[derive(Default)]
pub(crate) struct RoutePlan {
    pub(crate) adaptors: Vec<(AdaptorId, SharedAdaptor)>,
    pub(crate) nodes: Vec<Arc<dyn LocalNode>>,
    pub(crate) to_self: bool,
}

impl RoutePlan {
    pub(crate) fn is_empty(&self) -> bool {
        self.adaptors.is_empty() && self.nodes.is_empty() && !self.to_self
    }
}

/// A router's node state: its tables, plus the plain node core
pub struct RouterState {
    core: NodeCore,
    unenumerated: Vec<Arc<dyn LocalNode>>,
    enumerated: BTreeMap<Address, Arc<dyn LocalNode>>,
    adaptors: BTreeMap<AdaptorId, AdaptorSlot>,
    routes: HashMap<Address, AdaptorId>,
    next_adaptor: u16,
    currently_enumerating: Option<AdaptorId>,
    last_adaptor: Option<AdaptorId>,
}

impl NodeState for RouterState {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn on_reset(&mut self) {
        let demoted: Vec<Address> = self
            .enumerated
            .keys()
            .copied()
            .filter(|a| *a != Address::MASTER)
            .collect();
        for address in demoted {
            if let Some(node) = self.enumerated.remove(&address) {
                node.set_address(Address::UNASSIGNED);
                node.set_enumerated(false);
                self.unenumerated.push(node);
            }
        }
        for slot in self.adaptors.values_mut() {
            slot.flags.enumerated = false;
            slot.flags.renumerated = false;
        }
        self.currently_enumerating = None;
        self.core.set_address(Address::UNASSIGNED);
        self.core.set_enumerated(false);
    }
}

impl RouterState {
    fn new() -> Self {
        Self {
            core: NodeCore::new(Identity::router()),
            unenumerated: Vec::new(),
            enumerated: BTreeMap::new(),
            adaptors: BTreeMap::new(),
            routes: HashMap::new(),
            next_adaptor: 0,
            currently_enumerating: None,
            last_adaptor: None,
        }
    }

    fn insert_node(&mut self, node: Arc<dyn LocalNode>) -> bool {
        let key = node.key();
        let known = self.unenumerated.iter().any(|n| n.key() == key)
            || self.enumerated.values().any(|n| n.key() == key);
        if known {
            return false;
        }

        let address = node.address();
        if address.is_unassigned() {
            self.unenumerated.push(node);
            return true;
        }
        if address == self.core.address() || self.enumerated.contains_key(&address) {
            return false;
        }
        self.enumerated.insert(address, node);
        true
    }

    fn take_node(&mut self, key: usize) -> Option<Arc<dyn LocalNode>> {
        if let Some(pos) = self.unenumerated.iter().position(|n| n.key() == key) {
            return Some(self.unenumerated.remove(pos));
        }
        let address = self
            .enumerated
            .iter()
            .find(|(_, n)| n.key() == key)
            .map(|(a, _)| *a)?;
        self.enumerated.remove(&address)
    }

    fn insert_adaptor(&mut self, adaptor: SharedAdaptor) -> AdaptorId {
        let id = AdaptorId(self.next_adaptor);
        self.next_adaptor += 1;
        self.adaptors.insert(
            id,
            AdaptorSlot {
                adaptor,
                flags: AdaptorFlags::default(),
            },
        );
        id
    }

    pub(crate) fn set_adaptor_active(&mut self, id: AdaptorId, active: bool) {
        let Some(slot) = self.adaptors.get_mut(&id) else {
            return;
        };
        if active && !slot.flags.active {
            slot.flags.enumerated = false;
            slot.flags.renumerated = false;
        }
        slot.flags.active = active;
        debug!(
            "{}: {id} ({}) {}",
            self.core.address(),
            slot.adaptor.name(),
            if active { "up" } else { "down" }
        );
    }

    /// Remember that `source` lives behind `adaptor`.
    pub(crate) fn learn(&mut self, source: Address, adaptor: AdaptorId) {
        if source.is_unassigned() {
            return;
        }
        self.last_adaptor = Some(adaptor);
        if source == Address::MASTER && self.routes.contains_key(&source) {
            return;
        }
        if self.routes.insert(source, adaptor) != Some(adaptor) {
            debug!("{}: learned {source} via {adaptor}", self.core.address());
        }
    }

    /// Decide where `packet`, which arrived on `ingress`, goes next.
    pub(crate) fn plan(&self, packet: &Packet, ingress: Option<AdaptorId>) -> RoutePlan {
        let me = self.core.address();
        let dst = packet.destination();
        let mut plan = RoutePlan::default();

        if dst.is_broadcast() && me.is_assigned() {
            let origin = self.routes.get(&packet.source()).copied();
            plan.adaptors = self
                .adaptors
                .iter()
                .filter(|(id, _)| Some(**id) != origin && Some(**id) != ingress)
                .map(|(id, slot)| (*id, slot.adaptor.clone()))
                .collect();
            plan.nodes = self.enumerated.values().cloned().collect();
            plan.to_self = true;
            return plan;
        }

        if dst == Address::ROUTER_POLL || dst == me {
            plan.to_self = true;
            return plan;
        }

        if let Some(node) = self.enumerated.get(&dst) {
            plan.nodes.push(node.clone());
            return plan;
        }

        let target = match self.routes.get(&dst) {
            Some(id) => Some(*id),
            // uplink
            None if me.is_assigned() && dst.is_assigned() => self.adaptors.keys().next().copied(),
            None => None,
        };
        if let Some(id) = target.filter(|id| Some(*id) != ingress) {
            if let Some(slot) = self.adaptors.get(&id) {
                plan.adaptors.push((id, slot.adaptor.clone()));
            }
        }
        plan
    }
}

/// A handle to a router
///
/// Clones share the same router. Packets only move while its
/// [`RouterWorker`] is being driven.
#[derive(Clone)]
pub struct Router {
    node: Node<RouterState>,
    handle: RouterHandle,
}

impl Router {
    pub fn new() -> (Self, RouterWorker) {
        Self::with_config(&IdpConfig::default())
    }

    pub fn with_config(config: &IdpConfig) -> (Self, RouterWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = RouterHandle { tx };
        let node = Node::with_config(RouterState::new(), &config.node);
        register_router_commands(&node);

        let router = Router { node, handle };
        router.node.attach(router.transmitter());
        let worker = RouterWorker::new(router.clone(), rx, config.router.max_queue_depth);
        (router, worker)
    }

    /// The router's own node
    pub fn node(&self) -> &Node<RouterState> {
        &self.node
    }

    pub fn address(&self) -> Address {
        self.node.address()
    }

    /// A transmit capability that feeds this router's ingress
    pub fn transmitter(&self) -> Arc<dyn PacketTransmit> {
        Arc::new(LocalTransmit {
            router: self.handle.clone(),
        })
    }

    /// Take ownership of a local node, and attach it to this router.
    ///
    /// Nodes without an address wait to be handed one by RouterEnumerateNode.
    /// Returns false if the node is already owned, or its address is taken.
    pub fn add_node<S: NodeState>(&self, node: &Node<S>) -> bool {
        let local: Arc<dyn LocalNode> = Arc::new(node.clone());
        let added = self.node.with_state(|s| s.insert_node(local));
        if added {
            node.attach(self.transmitter());
            info!("{}: added local node {}", self.address(), node.address());
        }
        added
    }

    pub fn remove_node<S: NodeState>(&self, node: &Node<S>) -> bool {
        let key = LocalNode::key(node);
        match self.node.with_state(|s| s.take_node(key)) {
            Some(removed) => {
                removed.detach();
                true
            }
            None => false,
        }
    }

    /// Register a new port.
    ///
    /// The adaptor is bound to the returned port before this returns. It
    /// starts inactive; the transport reports the link coming up.
    pub fn add_adaptor(&self, adaptor: SharedAdaptor) -> AdaptorPort {
        let id = self.node.with_state(|s| s.insert_adaptor(adaptor.clone()));
        let port = AdaptorPort::new(id, self.handle.clone());
        info!("{}: registered {id} ({})", self.address(), adaptor.name());
        adaptor.bind(port.clone());
        port
    }

    pub fn remove_adaptor(&self, id: AdaptorId) -> bool {
        self.node.with_state(|s| {
            s.routes.retain(|_, a| *a != id);
            if s.currently_enumerating == Some(id) {
                s.currently_enumerating = None;
            }
            if s.last_adaptor == Some(id) {
                s.last_adaptor = None;
            }
            s.adaptors.remove(&id).is_some()
        })
    }

    pub fn adaptor_flags(&self, id: AdaptorId) -> Option<AdaptorFlags> {
        self.node.with_state(|s| s.adaptors.get(&id).map(|slot| slot.flags))
    }

    /// The port `address` was last seen behind
    pub fn route_for(&self, address: Address) -> Option<AdaptorId> {
        self.node.with_state(|s| s.routes.get(&address).copied())
    }

    /// Addresses of the local nodes that have been enumerated
    pub fn local_addresses(&self) -> Vec<Address> {
        self.node.with_state(|s| s.enumerated.keys().copied().collect())
    }

    /// How many local nodes are still waiting for an address
    pub fn unenumerated_count(&self) -> usize {
        self.node.with_state(|s| s.unenumerated.len())
    }
}

fn register_router_commands(node: &Node<RouterState>) {
    node.register_command(Command::RouterDetect, |state: &mut RouterState, inc, out| {
        let Ok(candidate) = inc.read::<Address>() else {
            return ResponseCode::InvalidParameters;
        };
        if state.core.address().is_assigned() {
            out.write(false);
            return ResponseCode::Ok;
        }
        if candidate.is_reserved() {
            out.write(false);
            return ResponseCode::InvalidParameters;
        }

        state.core.set_address(candidate);
        info!("router claimed {candidate}");
        out.write(true).set_response_code(ResponseCode::Ok);
        state.core.queue(inc.source(), out);
        ResponseCode::Deferred
    });

    node.register_command(Command::RouterEnumerateNode, |state: &mut RouterState, inc, out| {
        let Ok(proposed) = inc.read::<Address>() else {
            return ResponseCode::InvalidParameters;
        };
        if state.unenumerated.is_empty() {
            out.write(false);
            return ResponseCode::Ok;
        }
        let taken = proposed == state.core.address() || state.enumerated.contains_key(&proposed);
        if taken || proposed.is_reserved() {
            out.write(false);
            return ResponseCode::InvalidParameters;
        }

        let node = state.unenumerated.remove(0);
        node.set_address(proposed);
        state.enumerated.insert(proposed, node);
        debug!("{}: local node enumerated as {proposed}", state.core.address());

        out.write(true).set_response_code(ResponseCode::Ok);
        state.core.queue_from(proposed, inc.source(), out);
        ResponseCode::Deferred
    });

    node.register_command(
        Command::RouterPrepareToEnumerateAdaptors,
        |state: &mut RouterState, _, _| {
            for slot in state.adaptors.values_mut().filter(|s| !s.flags.active) {
                slot.flags.renumerated = false;
            }
            ResponseCode::Ok
        },
    );

    node.register_command(Command::RouterEnumerateAdaptor, |state: &mut RouterState, inc, out| {
        let (Ok(proposed), Ok(detect_tid)) = (inc.read::<Address>(), inc.read::<u32>()) else {
            return ResponseCode::InvalidParameters;
        };
        let requester = inc.source();

        let next = state.adaptors.iter_mut().find(|(_, s)| !s.flags.renumerated);
        let Some((&id, slot)) = next else {
            out.write(false);
            return ResponseCode::Ok;
        };
        slot.flags.renumerated = true;

        let mut probed = false;
        if !slot.flags.enumerated {
            let probe = OutgoingTransaction::new(Command::RouterDetect, detect_tid, CommandFlags::NONE)
                .with(proposed);
            probed = slot.adaptor.transmit(probe.to_packet(requester, Address::UNASSIGNED));
            if probed {
                state.currently_enumerating = Some(id);
            }
        }
        debug!("{}: swept {id}, probed: {probed}", state.core.address());

        out.write(true).write(probed).set_response_code(ResponseCode::Ok);
        state.core.queue(requester, out);
        ResponseCode::Deferred
    });

    node.register_command(Command::MarkAdaptorConnected, |state: &mut RouterState, _, _| {
        let target = state.currently_enumerating.take().or(state.last_adaptor);
        match target.and_then(|id| state.adaptors.get_mut(&id).map(|slot| (id, slot))) {
            Some((id, slot)) => {
                slot.flags.enumerated = true;
                debug!("{}: {id} connected", state.core.address());
                ResponseCode::Ok
            }
            None => {
                warn!("{}: no adaptor to mark connected", state.core.address());
                ResponseCode::NotReady
            }
        }
    });
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use idp_frame::{Address, Packet};

    use super::Router;
    use crate::{
        adaptor::{Adaptor, AdaptorId},
        node::Node,
        transaction::{IncomingTransaction, OutgoingTransaction, Response},
        well_known::{Command, CommandFlags, ResponseCode},
        Lock,
    };

    const GUID: uuid::Uuid = uuid::Uuid::from_u128(0x1111_2222_3333_4444_5555_6666_7777_8888);

    struct Tap {
        sent: Lock<Vec<Packet>>,
    }

    impl Default for Tap {
        fn default() -> Self {
            Self {
                sent: Lock::new(Vec::new()),
            }
        }
    }

    impl Tap {
        fn take(&self) -> Vec<Packet> {
            self.sent.with_lock(core::mem::take)
        }
    }

    impl Adaptor for Tap {
        fn name(&self) -> &str {
            "tap"
        }

        fn transmit(&self, packet: Packet) -> bool {
            self.sent.with_lock(|s| s.push(packet));
            true
        }
    }

    fn response(pkt: &Packet) -> Response {
        Response::parse(IncomingTransaction::parse(pkt.clone()).unwrap()).unwrap()
    }

    #[test]
    fn detect_claims_once() {
        let (router, mut worker) = Router::new();
        let tap = Arc::new(Tap::default());
        let port = router.add_adaptor(tap.clone());

        let detect = OutgoingTransaction::request(Command::RouterDetect, 3).with(Address(2));
        port.deliver(detect.to_packet(Address::MASTER, Address::UNASSIGNED));
        worker.process_pending();

        assert_eq!(router.address(), Address(2));
        let sent = tap.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].source(), Address(2));
        let mut resp = response(&sent[0]);
        assert!(resp.is_ok());
        assert_eq!(resp.read::<bool>(), Ok(true));

        let again = OutgoingTransaction::request(Command::RouterDetect, 4).with(Address(9));
        port.deliver(again.to_packet(Address::MASTER, Address::ROUTER_POLL));
        worker.process_pending();
        assert_eq!(router.address(), Address(2));
        let mut resp = response(&tap.take()[0]);
        assert_eq!(resp.read::<bool>(), Ok(false));
    }

    #[test]
    fn enumerate_local_nodes() {
        let (router, mut worker) = Router::new();
        router.node().set_address(Address(2));
        let tap = Arc::new(Tap::default());
        let port = router.add_adaptor(tap.clone());
        let leaf = Node::with_identity(GUID, "Test.Leaf");
        assert!(router.add_node(&leaf));
        assert!(!router.add_node(&leaf));

        // collision with the router itself
        let req = OutgoingTransaction::request(Command::RouterEnumerateNode, 1).with(Address(2));
        port.deliver(req.to_packet(Address::MASTER, Address(2)));
        worker.process_pending();
        let mut resp = response(&tap.take()[0]);
        assert_eq!(resp.code(), ResponseCode::InvalidParameters);
        assert_eq!(resp.read::<bool>(), Ok(false));

        let req = OutgoingTransaction::request(Command::RouterEnumerateNode, 2).with(Address(3));
        port.deliver(req.to_packet(Address::MASTER, Address(2)));
        worker.process_pending();
        let sent = tap.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].source(), Address(3));
        assert_eq!(leaf.address(), Address(3));
        assert_eq!(router.local_addresses(), vec![Address(3)]);

        let req = OutgoingTransaction::request(Command::RouterEnumerateNode, 3).with(Address(4));
        port.deliver(req.to_packet(Address::MASTER, Address(2)));
        worker.process_pending();
        let mut resp = response(&tap.take()[0]);
        assert!(resp.is_ok());
        assert_eq!(resp.read::<bool>(), Ok(false));
    }

    #[test]
    fn learning_and_broadcast_exclusion() {
        let (router, mut worker) = Router::new();
        router.node().set_address(Address(2));
        let a = Arc::new(Tap::default());
        let b = Arc::new(Tap::default());
        let c = Arc::new(Tap::default());
        let pa = router.add_adaptor(a.clone());
        let pb = router.add_adaptor(b.clone());
        let _pc = router.add_adaptor(c.clone());

        let ping = OutgoingTransaction::new(Command::Ping, 1, CommandFlags::NONE);
        pb.deliver(ping.to_packet(Address(7), Address(2)));
        worker.process_pending();
        assert_eq!(router.route_for(Address(7)), Some(AdaptorId(1)));

        pb.deliver(ping.to_packet(Address(7), Address::BROADCAST));
        worker.process_pending();
        assert_eq!(a.take().len(), 1);
        assert!(b.take().is_empty());
        assert_eq!(c.take().len(), 1);

        // a learned route wins over the uplink
        pa.deliver(ping.to_packet(Address(9), Address(7)));
        worker.process_pending();
        assert_eq!(b.take().len(), 1);
        assert!(a.take().is_empty());
    }

    #[test]
    fn uplink_fallback() {
        let (router, mut worker) = Router::new();
        let up = Arc::new(Tap::default());
        let down = Arc::new(Tap::default());
        let _ = router.add_adaptor(up.clone());
        let pdown = router.add_adaptor(down.clone());
        let ping = OutgoingTransaction::new(Command::Ping, 1, CommandFlags::NONE);

        // unassigned routers never fall back
        pdown.deliver(ping.to_packet(Address(5), Address(40)));
        worker.process_pending();
        assert!(up.take().is_empty());

        router.node().set_address(Address(2));
        pdown.deliver(ping.to_packet(Address(5), Address(40)));
        pdown.deliver(ping.to_packet(Address(5), Address::UNASSIGNED));
        worker.process_pending();
        let sent = up.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination(), Address(40));
        assert!(down.take().is_empty());
    }

    #[test]
    fn reset_demotes_local_nodes() {
        let (router, mut worker) = Router::new();
        router.node().set_address(Address(2));
        let leaf = Node::with_identity(GUID, "Test.Leaf");
        leaf.set_address(Address(3));
        let master = Node::with_identity(GUID, "Test.Master");
        master.set_address(Address::MASTER);
        router.add_node(&leaf);
        router.add_node(&master);

        let reset = OutgoingTransaction::new(Command::Reset, 1, CommandFlags::NONE);
        master.send_request(Address::BROADCAST, &reset);
        worker.process_pending();

        assert_eq!(router.address(), Address::UNASSIGNED);
        assert_eq!(leaf.address(), Address::UNASSIGNED);
        assert_eq!(router.local_addresses(), vec![Address::MASTER]);
        assert_eq!(router.unenumerated_count(), 1);
    }
}
