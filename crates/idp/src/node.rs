//! Nodes
//!
//! A [`Node`] is an addressable endpoint: its state, a [`Dispatcher`] holding
//! the command handlers, and an optional transmit capability to hand packets
//! to the network. Routers and the master are nodes too, carrying extra state
//! through the [`NodeState`] trait.
//!
//! Node handles are cheap to clone; all clones share the same state. The state
//! lock is only ever held for the duration of a handler or an accessor, never
//! across a transmit or an await.

use std::{sync::Arc, time::Duration};

use idp_frame::{Address, Packet};
use log::{debug, warn};
use tokio::{
    sync::watch,
    time::Instant,
};
use uuid::Uuid;

use crate::{
    config::NodeConfig,
    dispatcher::{Dispatcher, ResponseStream},
    transaction::{IncomingTransaction, OutgoingTransaction, Response},
    well_known::{Command, CommandFlags, Identity, ResponseCode},
    Lock,
};

/// Something that can take a packet off a node's hands
pub trait PacketTransmit: Send + Sync {
    /// Returns false if the packet could not be queued.
    fn transmit(&self, packet: Packet) -> bool;
}

/// The state every node carries
pub struct NodeCore {
    address: Address,
    enabled: bool,
    identity: Identity,
    next_transaction_id: u32,
    last_ping: Instant,
    enumerated: watch::Sender<bool>,
    outbox: Vec<Packet>,
}

impl NodeCore {
    pub fn new(identity: Identity) -> Self {
        let (enumerated, _) = watch::channel(false);
        Self {
            address: Address::UNASSIGNED,
            enabled: true,
            identity,
            next_transaction_id: 1,
            last_ping: Instant::now(),
            enumerated,
            outbox: Vec::new(),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn set_address(&mut self, address: Address) {
        self.address = address;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn create_transaction_id(&mut self) -> u32 {
        let id = self.next_transaction_id;
        // zero is never handed out
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1).max(1);
        id
    }

    pub fn last_ping(&self) -> Instant {
        self.last_ping
    }

    pub fn stamp_ping(&mut self) {
        self.last_ping = Instant::now();
    }

    /// Has the master fetched this node's info since its last reset?
    pub fn is_enumerated(&self) -> bool {
        *self.enumerated.borrow()
    }

    pub fn set_enumerated(&mut self, enumerated: bool) {
        self.enumerated.send_replace(enumerated);
    }

    pub fn subscribe_enumerated(&self) -> watch::Receiver<bool> {
        self.enumerated.subscribe()
    }

    /// Queue `tx` for `destination`, sent from this node's address.
    ///
    /// Queued packets go out after the current handler returns, ahead of any
    /// automatic reply.
    pub fn queue(&mut self, destination: Address, tx: &OutgoingTransaction) {
        let source = self.address;
        self.queue_from(source, destination, tx);
    }

    pub fn queue_from(&mut self, source: Address, destination: Address, tx: &OutgoingTransaction) {
        self.outbox.push(tx.to_packet(source, destination));
    }

    pub fn take_outbox(&mut self) -> Vec<Packet> {
        core::mem::take(&mut self.outbox)
    }
}

/// State owned by a [`Node`]
pub trait NodeState: Send + 'static {
    fn core(&self) -> &NodeCore;
    fn core_mut(&mut self) -> &mut NodeCore;

    /// Run when a Reset command arrives, or the watchdog fires.
    ///
    /// By default the node forgets its address and waits to be enumerated again.
    fn on_reset(&mut self) {
        let core = self.core_mut();
        core.set_address(Address::UNASSIGNED);
        core.set_enumerated(false);
    }
}

impl NodeState for NodeCore {
    fn core(&self) -> &NodeCore {
        self
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        self
    }
}

/// Everything one call to [`Node::process_packet`] wants sent
#[derive(Debug, Default)]
pub struct Processed {
    /// Packets handlers queued explicitly
    pub outbound: Vec<Packet>,
    /// The automatic reply
    pub response: Option<Packet>,
}

impl Processed {
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.response.is_none()
    }

    /// Everything to send, in order
    pub fn into_packets(self) -> impl Iterator<Item = Packet> {
        self.outbound.into_iter().chain(self.response)
    }
}

struct Slot<S> {
    state: S,
    dispatcher: Dispatcher<S>,
}

struct NodeInner<S> {
    slot: Lock<Slot<S>>,
    responses: ResponseStream,
    transmit: Lock<Option<Arc<dyn PacketTransmit>>>,
    config: NodeConfig,
}

/// A handle to an addressable node
pub struct Node<S: NodeState = NodeCore> {
    inner: Arc<NodeInner<S>>,
}

impl<S: NodeState> Clone for Node<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Node<NodeCore> {
    /// A plain node with the built-in commands
    pub fn with_identity(guid: Uuid, name: impl Into<String>) -> Self {
        Node::new(NodeCore::new(Identity::new(guid, name)))
    }
}

impl<S: NodeState> Node<S> {
    pub fn new(state: S) -> Self {
        Self::with_config(state, &NodeConfig::default())
    }

    pub fn with_config(state: S, config: &NodeConfig) -> Self {
        let responses = ResponseStream::new();
        let mut dispatcher = Dispatcher::new(responses.clone());
        register_builtins(&mut dispatcher);
        Self {
            inner: Arc::new(NodeInner {
                slot: Lock::new(Slot { state, dispatcher }),
                responses,
                transmit: Lock::new(None),
                config: config.clone(),
            }),
        }
    }

    /// Run `f` with the node state locked.
    ///
    /// `f` must not call back into this node.
    pub fn with_state<U>(&self, f: impl FnOnce(&mut S) -> U) -> U {
        self.inner.slot.with_lock(|slot| f(&mut slot.state))
    }

    pub fn address(&self) -> Address {
        self.with_state(|s| s.core().address())
    }

    pub fn set_address(&self, address: Address) {
        self.with_state(|s| s.core_mut().set_address(address))
    }

    pub fn is_enabled(&self) -> bool {
        self.with_state(|s| s.core().is_enabled())
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.with_state(|s| s.core_mut().set_enabled(enabled))
    }

    pub fn identity(&self) -> Identity {
        self.with_state(|s| s.core().identity().clone())
    }

    pub fn is_enumerated(&self) -> bool {
        self.with_state(|s| s.core().is_enumerated())
    }

    pub fn create_transaction_id(&self) -> u32 {
        self.with_state(|s| s.core_mut().create_transaction_id())
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn responses(&self) -> &ResponseStream {
        &self.inner.responses
    }

    /// Register (or replace) the handler for `command`.
    pub fn register_command<F>(&self, command: impl Into<Command>, handler: F)
    where
        F: FnMut(&mut S, &mut IncomingTransaction, &mut OutgoingTransaction) -> ResponseCode
            + Send
            + 'static,
    {
        let command = command.into();
        self.inner
            .slot
            .with_lock(|slot| slot.dispatcher.register_command(command, handler));
    }

    /// Register (or replace) the handler for responses echoing `command`.
    pub fn register_response_handler<F>(&self, command: impl Into<Command>, handler: F)
    where
        F: FnMut(&mut S, &mut Response) + Send + 'static,
    {
        let command = command.into();
        self.inner
            .slot
            .with_lock(|slot| slot.dispatcher.register_response_handler(command, handler));
    }

    pub fn attach(&self, transmit: Arc<dyn PacketTransmit>) {
        self.inner.transmit.with_lock(|t| *t = Some(transmit));
    }

    pub fn detach(&self) {
        self.inner.transmit.with_lock(|t| *t = None);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.transmit.with_lock(|t| t.is_some())
    }

    fn transmitter(&self) -> Option<Arc<dyn PacketTransmit>> {
        self.inner.transmit.with_lock(|t| t.clone())
    }

    /// Send `tx` from this node's own address.
    ///
    /// Returns false if the node is disabled, detached, or the transmit
    /// capability refused the packet.
    pub fn send_request(&self, destination: Address, tx: &OutgoingTransaction) -> bool {
        let source = self.address();
        self.send_request_from(source, destination, tx)
    }

    /// Send `tx` with an explicit source address.
    pub fn send_request_from(
        &self,
        source: Address,
        destination: Address,
        tx: &OutgoingTransaction,
    ) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let Some(transmit) = self.transmitter() else {
            return false;
        };
        transmit.transmit(tx.to_packet(source, destination))
    }

    /// Send `tx` and wait for its response, with the configured timeout.
    ///
    /// Returns whether the request went out, and the response if one arrived
    /// in time.
    pub async fn send_request_async(
        &self,
        destination: Address,
        tx: &OutgoingTransaction,
    ) -> (bool, Option<Response>) {
        let timeout = self.inner.config.response_timeout();
        self.send_request_with_timeout(destination, tx, timeout).await
    }

    pub async fn send_request_with_timeout(
        &self,
        destination: Address,
        tx: &OutgoingTransaction,
        timeout: Duration,
    ) -> (bool, Option<Response>) {
        let pending = self.inner.responses.subscribe(tx.transaction_id(), timeout);
        if !self.send_request(destination, tx) {
            return (false, None);
        }
        (true, pending.wait().await)
    }

    /// Dispatch `packet`, returning everything that should be sent in reply.
    ///
    /// Disabled nodes ignore packets.
    pub fn process_packet(&self, packet: &Packet) -> Processed {
        self.inner.slot.with_lock(|slot| {
            if !slot.state.core().is_enabled() {
                return Processed::default();
            }
            let response = slot.dispatcher.process_payload(&mut slot.state, packet);
            let outbound = slot.state.core_mut().take_outbox();
            Processed { outbound, response }
        })
    }

    /// Dispatch `packet` and transmit the results through this node's own
    /// transmit capability.
    pub fn handle_packet(&self, packet: &Packet) {
        let processed = self.process_packet(packet);
        if processed.is_empty() {
            return;
        }
        let Some(transmit) = self.transmitter() else {
            debug!("{}: detached, dropping replies", self.address());
            return;
        };
        for pkt in processed.into_packets() {
            transmit.transmit(pkt);
        }
    }

    /// Periodic upkeep, driven by the application.
    ///
    /// Pings the master so it knows this node is alive. With a watchdog
    /// configured, a node that has not been pinged for too long resets itself.
    pub fn poll_tick(&self) {
        let watchdog = self.inner.config.watchdog();
        let (address, expired) = self.with_state(|s| {
            let core = s.core();
            let expired = match watchdog {
                Some(limit) => core.address().is_assigned() && core.last_ping().elapsed() > limit,
                None => false,
            };
            (core.address(), expired)
        });

        if expired {
            warn!("{address}: no ping from the master in time, resetting");
            self.with_state(|s| s.on_reset());
            return;
        }

        if address.is_unassigned() || address == Address::MASTER || !self.is_enabled() {
            return;
        }
        let tid = self.create_transaction_id();
        let ping = OutgoingTransaction::new(Command::Ping, tid, CommandFlags::NONE);
        self.send_request(Address::MASTER, &ping);
    }

    /// Find the node implementing `guid`.
    ///
    /// Broadcasts QueryInterface and takes the first node that answers OK.
    /// `None` if nobody answers within the response timeout.
    pub async fn query_interface(&self, guid: Uuid) -> Option<Address> {
        let tid = self.create_transaction_id();
        let query = OutgoingTransaction::request(Command::QueryInterface, tid).with(guid);
        let (_, response) = self.send_request_async(Address::BROADCAST, &query).await;
        let found = response.filter(|r| r.is_ok()).map(|r| r.source());
        debug!("{}: interface {guid} at {found:?}", self.address());
        found
    }

    /// [`Node::wait_for_enumeration`] with the configured enumeration timeout.
    pub async fn wait_until_enumerated(&self) -> bool {
        let timeout = self.inner.config.enumeration_timeout();
        self.wait_for_enumeration(timeout).await
    }

    /// Wait until the master has enumerated this node, nudging it with
    /// RecommendEnumeration while waiting.
    pub async fn wait_for_enumeration(&self, timeout: Duration) -> bool {
        let mut rx = self.with_state(|s| s.core().subscribe_enumerated());
        let deadline = Instant::now() + timeout;
        let interval = self.inner.config.recommend_interval();
        loop {
            if *rx.borrow_and_update() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            let tid = self.create_transaction_id();
            let nudge = OutgoingTransaction::new(Command::RecommendEnumeration, tid, CommandFlags::NONE);
            self.send_request(Address::MASTER, &nudge);

            let wait = interval.min(deadline - now);
            if let Ok(Err(_)) = tokio::time::timeout(wait, rx.changed()).await {
                // the node state went away
                return false;
            }
        }
    }
}

fn register_builtins<S: NodeState>(dispatcher: &mut Dispatcher<S>) {
    dispatcher.register_command(Command::Ping, |state: &mut S, _, _| {
        state.core_mut().stamp_ping();
        ResponseCode::Ok
    });
    dispatcher.register_response_handler(Command::Ping, |state: &mut S, response| {
        if response.is_ok() {
            state.core_mut().stamp_ping();
        }
    });
    dispatcher.register_command(Command::GetNodeInfo, |state: &mut S, _, out| {
        let identity = state.core().identity();
        out.write(identity.guid)
            .write_str(&identity.name)
            .write(identity.capabilities);
        state.core_mut().set_enumerated(true);
        ResponseCode::Ok
    });
    dispatcher.register_command(Command::QueryInterface, |state: &mut S, inc, out| {
        match inc.read::<Uuid>() {
            Ok(guid) if guid == state.core().identity().guid => {
                out.write(guid);
                ResponseCode::Ok
            }
            Ok(_) => ResponseCode::Deferred,
            Err(_) => ResponseCode::InvalidParameters,
        }
    });
    dispatcher.register_command(Command::Reset, |state: &mut S, _, _| {
        state.on_reset();
        ResponseCode::Ok
    });
}

/// A node a router can own, whatever its state type
pub trait LocalNode: Send + Sync {
    fn address(&self) -> Address;
    fn set_address(&self, address: Address);
    fn set_enumerated(&self, enumerated: bool);
    fn attach(&self, transmit: Arc<dyn PacketTransmit>);
    fn detach(&self);
    fn process_packet(&self, packet: &Packet) -> Processed;
    /// Identifies the shared node state behind a handle
    fn key(&self) -> usize;
}

impl<S: NodeState> LocalNode for Node<S> {
    fn address(&self) -> Address {
        Node::address(self)
    }

    fn set_address(&self, address: Address) {
        Node::set_address(self, address)
    }

    fn set_enumerated(&self, enumerated: bool) {
        self.with_state(|s| s.core_mut().set_enumerated(enumerated))
    }

    fn attach(&self, transmit: Arc<dyn PacketTransmit>) {
        Node::attach(self, transmit)
    }

    fn detach(&self) {
        Node::detach(self)
    }

    fn process_packet(&self, packet: &Packet) -> Processed {
        Node::process_packet(self, packet)
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}
