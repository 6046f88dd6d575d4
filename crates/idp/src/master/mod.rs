//! The master node
//!
//! The master owns the address space. It discovers the network router by
//! router, handing out addresses as it goes, keeps a [`Topology`] of what it
//! found, and evicts nodes that stop answering pings.
//!
//! Discovery is a sequential walk: the driver repeatedly picks the first node
//! (in pre-order) that is not [`EnumerationState::Idle`] and takes one step
//! for it, until everything is idle.

use std::sync::Arc;

use idp_frame::Address;
use log::{debug, info, warn};
use maitake_sync::WaitQueue;
use tokio::{select, sync::Notify};

use crate::{
    config::{IdpConfig, MasterConfig},
    node::{Node, NodeCore, NodeState},
    transaction::{OutgoingTransaction, Response},
    well_known::{Command, CommandFlags, Identity, ResponseCode, ROUTER_GUID},
};

pub mod topology;

pub use topology::{AddressPool, EnumerationState, NodeInfo, Topology};

pub struct MasterState {
    core: NodeCore,
    topology: Topology,
    enumerating: bool,
}

impl NodeState for MasterState {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    // The master keeps its address through a network reset.
    fn on_reset(&mut self) {}
}

impl MasterState {
    pub fn topology(&self) -> &Topology {
        &self.topology
    }
}

/// Clears the enumerating flag however a pass ends
struct PassGuard<'a> {
    node: &'a Node<MasterState>,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.node.with_state(|s| s.enumerating = false);
    }
}

/// A handle to the master node
#[derive(Clone)]
pub struct Master {
    node: Node<MasterState>,
    config: MasterConfig,
    recommended: Arc<Notify>,
}

impl Default for Master {
    fn default() -> Self {
        Self::new()
    }
}

impl Master {
    pub fn new() -> Self {
        Self::with_config(&IdpConfig::default())
    }

    pub fn with_config(config: &IdpConfig) -> Self {
        let identity = Identity::master();
        let mut core = NodeCore::new(identity.clone());
        core.set_address(Address::MASTER);
        core.set_enumerated(true);
        let state = MasterState {
            core,
            topology: Topology::new(&identity),
            enumerating: false,
        };
        let node = Node::with_config(state, &config.node);
        let recommended = Arc::new(Notify::new());

        node.register_command(Command::Ping, |state: &mut MasterState, inc, _| {
            if state.topology.touch(inc.source()) {
                ResponseCode::Ok
            } else {
                ResponseCode::NotReady
            }
        });
        node.register_response_handler(Command::Ping, |state: &mut MasterState, resp| {
            if resp.source() != Address::MASTER {
                state.topology.touch(resp.source());
            }
        });
        let notify = recommended.clone();
        node.register_command(Command::RecommendEnumeration, move |_: &mut MasterState, inc, _| {
            debug!("enumeration recommended by {}", inc.source());
            notify.notify_one();
            ResponseCode::Ok
        });

        Self {
            node,
            config: config.master.clone(),
            recommended,
        }
    }

    /// The master's own node, to hand to the root router
    pub fn node(&self) -> &Node<MasterState> {
        &self.node
    }

    pub fn is_enumerating(&self) -> bool {
        self.node.with_state(|s| s.enumerating)
    }

    pub fn has_node(&self, address: Address) -> bool {
        self.node.with_state(|s| s.topology.contains(address))
    }

    pub fn node_info(&self, address: Address) -> Option<NodeInfo> {
        self.node.with_state(|s| s.topology.get(address).cloned())
    }

    /// The tree reachable from the master, in pre-order
    pub fn tree(&self) -> Vec<NodeInfo> {
        self.node
            .with_state(|s| s.topology.walk().into_iter().map(|(_, i)| i.clone()).collect())
    }

    pub fn render_tree(&self) -> String {
        self.node.with_state(|s| s.topology.render())
    }

    /// Run discovery passes whenever a node recommends one, until `closer`
    /// is closed.
    pub async fn run(&self, closer: Arc<WaitQueue>) {
        info!("Started master discovery task");
        loop {
            select! {
                _n = self.recommended.notified() => {},
                _c = closer.wait() => break,
            }
            self.enumerate_network().await;
        }
        warn!("Master discovery task stopped");
    }

    /// Walk the network, addressing everything that has not been found yet.
    ///
    /// Returns false without doing anything if the master is detached or a
    /// pass is already running.
    pub async fn enumerate_network(&self) -> bool {
        if !self.node.is_connected() {
            return false;
        }
        let started = self.node.with_state(|s| {
            if s.enumerating {
                return false;
            }
            s.enumerating = true;
            s.topology.reseed();
            true
        });
        if !started {
            return false;
        }
        let _guard = PassGuard { node: &self.node };

        info!("Enumerating network");
        loop {
            let next = self.node.with_state(|s| {
                s.topology
                    .next_pending()
                    .map(|i| (i.address, i.state, i.is_router()))
            });
            let Some((address, state, is_router)) = next else {
                break;
            };

            if address == Address::MASTER {
                self.set_state(address, EnumerationState::DetectingRouter);
                if !self.detect_router().await {
                    self.set_state(address, EnumerationState::Pending);
                    break;
                }
                continue;
            }
            if !is_router {
                self.set_state(address, EnumerationState::Idle);
                continue;
            }

            match state {
                EnumerationState::Pending | EnumerationState::EnumeratingNodes => {
                    self.set_state(address, EnumerationState::EnumeratingNodes);
                    self.enumerate_router_node(address).await;
                }
                EnumerationState::StartEnumeratingAdaptors => self.prepare_adaptors(address).await,
                EnumerationState::EnumeratingAdaptors => self.enumerate_router_adaptor(address).await,
                EnumerationState::DetectingRouter | EnumerationState::Idle => {
                    self.set_state(address, EnumerationState::Idle)
                }
            }
        }
        info!("Network:\n{}", self.render_tree());
        true
    }

    /// Broadcast a ping; replies keep nodes alive.
    pub fn poll_network(&self) -> bool {
        let tid = self.node.create_transaction_id();
        self.node
            .send_request(Address::BROADCAST, &OutgoingTransaction::request(Command::Ping, tid))
    }

    /// Evict nodes not heard from within the node timeout.
    pub fn invalidate_nodes(&self) -> Vec<Address> {
        let timeout = self.config.node_timeout();
        let evicted = self.node.with_state(|s| s.topology.evict_stale(timeout));
        for address in &evicted {
            info!("Node {address} timed out");
        }
        evicted
    }

    pub fn tick(&self) -> Vec<Address> {
        self.poll_network();
        self.invalidate_nodes()
    }

    /// Tell every node to forget its address, and forget the topology.
    pub fn reset_network(&self) -> bool {
        let tid = self.node.create_transaction_id();
        let reset = OutgoingTransaction::new(Command::Reset, tid, CommandFlags::NONE);
        if !self.node.send_request(Address::BROADCAST, &reset) {
            return false;
        }
        self.node.with_state(|s| s.topology.clear());
        info!("Network reset");
        true
    }

    fn set_state(&self, address: Address, state: EnumerationState) {
        self.node.with_state(|s| s.topology.set_state(address, state));
    }

    fn allocate(&self) -> Option<Address> {
        let address = self.node.with_state(|s| s.topology.allocate());
        if address.is_none() {
            warn!("Address space exhausted");
        }
        address
    }

    fn release(&self, address: Address) {
        self.node.with_state(|s| s.topology.release(address));
    }

    async fn request(&self, destination: Address, tx: OutgoingTransaction) -> (bool, Option<Response>) {
        self.node
            .send_request_with_timeout(destination, &tx, self.config.response_timeout())
            .await
    }

    async fn detect_router(&self) -> bool {
        let Some(address) = self.allocate() else {
            return false;
        };
        let tid = self.node.create_transaction_id();
        let tx = OutgoingTransaction::request(Command::RouterDetect, tid).with(address);
        let (_, resp) = self.request(Address::UNASSIGNED, tx).await;
        if !confirmed(resp) {
            debug!("No root router answered");
            self.release(address);
            return false;
        }
        self.set_state(Address::MASTER, EnumerationState::Idle);
        self.on_node_added(Address::MASTER, address).await;
        true
    }

    async fn enumerate_router_node(&self, router: Address) {
        let Some(address) = self.allocate() else {
            self.set_state(router, EnumerationState::Idle);
            return;
        };
        let tid = self.node.create_transaction_id();
        let tx = OutgoingTransaction::request(Command::RouterEnumerateNode, tid).with(address);
        let (sent, resp) = self.request(router, tx).await;
        if !sent {
            self.release(address);
            self.set_state(router, EnumerationState::Idle);
            return;
        }
        if confirmed(resp) {
            self.on_node_added(router, address).await;
        } else {
            self.release(address);
            self.set_state(router, EnumerationState::StartEnumeratingAdaptors);
        }
    }

    async fn prepare_adaptors(&self, router: Address) {
        let tid = self.node.create_transaction_id();
        let tx = OutgoingTransaction::request(Command::RouterPrepareToEnumerateAdaptors, tid);
        let (_, resp) = self.request(router, tx).await;
        let next = match resp {
            Some(r) if r.is_ok() => EnumerationState::EnumeratingAdaptors,
            _ => EnumerationState::Idle,
        };
        self.set_state(router, next);
    }

    async fn enumerate_router_adaptor(&self, router: Address) {
        let Some(address) = self.allocate() else {
            self.set_state(router, EnumerationState::Idle);
            return;
        };

        // the probed router answers the nested detect straight to us
        let detect_tid = self.node.create_transaction_id();
        let detect = self
            .node
            .responses()
            .subscribe(detect_tid, self.config.probe_timeout());

        let tid = self.node.create_transaction_id();
        let tx = OutgoingTransaction::request(Command::RouterEnumerateAdaptor, tid)
            .with(address)
            .with(detect_tid);
        let (sent, resp) = self.request(router, tx).await;
        let (found, probed) = match resp {
            Some(mut r) if r.is_ok() => (
                r.read::<bool>().unwrap_or(false),
                r.read::<bool>().unwrap_or(false),
            ),
            _ => (false, false),
        };

        if !sent || !found {
            // no adaptors left
            self.release(address);
            self.set_state(router, EnumerationState::Idle);
            return;
        }
        if !probed || !confirmed(detect.wait().await) {
            self.release(address);
            return;
        }

        let mark = self.node.create_transaction_id();
        let parent = OutgoingTransaction::new(Command::MarkAdaptorConnected, mark, CommandFlags::NONE);
        self.node.send_request(router, &parent);
        let mark = self.node.create_transaction_id();
        let child = OutgoingTransaction::new(Command::MarkAdaptorConnected, mark, CommandFlags::NONE);
        self.node.send_request(address, &child);

        self.on_node_added(router, address).await;
    }

    async fn on_node_added(&self, parent: Address, address: Address) {
        self.node.with_state(|s| s.topology.add_child(parent, address));

        let tid = self.node.create_transaction_id();
        let (_, resp) = self
            .request(address, OutgoingTransaction::request(Command::GetNodeInfo, tid))
            .await;
        let Some(mut resp) = resp.filter(|r| r.is_ok()) else {
            warn!("No node info from {address}");
            return;
        };
        let Ok(guid) = resp.read::<uuid::Uuid>() else {
            warn!("Malformed node info from {address}");
            return;
        };
        let name = resp.read_str();
        let state = if guid == ROUTER_GUID {
            EnumerationState::Pending
        } else {
            EnumerationState::Idle
        };

        info!("Found {name} at {address}, under {parent}");
        self.node.with_state(|s| {
            if let Some(info) = s.topology.get_mut(address) {
                info.guid = guid;
                info.name = name;
                info.state = state;
            }
            s.topology.touch(address);
        });
    }
}

fn confirmed(resp: Option<Response>) -> bool {
    match resp {
        Some(mut r) if r.is_ok() => r.read::<bool>().unwrap_or(false),
        _ => false,
    }
}
