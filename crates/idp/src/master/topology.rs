//! The master's picture of the network
//!
//! Nodes live in an arena keyed by address. Each entry names its parent by
//! address and owns the ordered list of its children's addresses. The root is
//! the master itself, at [`Address::MASTER`].

use std::{collections::HashMap, fmt::Write, time::Duration};

use idp_frame::Address;
use log::debug;
use tokio::time::Instant;
use uuid::Uuid;

use crate::well_known::{Identity, ROUTER_GUID};

/// Where discovery stands for one node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnumerationState {
    Pending,
    DetectingRouter,
    EnumeratingNodes,
    StartEnumeratingAdaptors,
    EnumeratingAdaptors,
    Idle,
}

#[derive(Clone, Debug)]
pub struct NodeInfo {
    pub address: Address,
    pub guid: Uuid,
    pub name: String,
    pub parent: Option<Address>,
    pub children: Vec<Address>,
    pub state: EnumerationState,
    pub last_seen: Instant,
}

impl NodeInfo {
    fn new(address: Address, parent: Option<Address>, state: EnumerationState) -> Self {
        Self {
            address,
            guid: Uuid::nil(),
            name: String::new(),
            parent,
            children: Vec::new(),
            state,
            last_seen: Instant::now(),
        }
    }

    pub fn is_router(&self) -> bool {
        self.guid == ROUTER_GUID
    }

    pub fn is_root(&self) -> bool {
        self.address == Address::MASTER
    }
}

/// Hands out node addresses
///
/// Released addresses are reused last-in first-out before the pool grows.
#[derive(Debug)]
pub struct AddressPool {
    next: u16,
    free: Vec<Address>,
}

impl Default for AddressPool {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressPool {
    pub fn new() -> Self {
        Self {
            next: 2,
            free: Vec::new(),
        }
    }

    pub fn allocate(&mut self) -> Option<Address> {
        if let Some(address) = self.free.pop() {
            return Some(address);
        }
        if self.next >= Address::ROUTER_POLL.0 {
            return None;
        }
        let address = Address(self.next);
        self.next += 1;
        Some(address)
    }

    pub fn release(&mut self, address: Address) {
        if address.is_reserved() || address.0 >= self.next || self.free.contains(&address) {
            return;
        }
        self.free.push(address);
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

pub struct Topology {
    nodes: HashMap<Address, NodeInfo>,
    pool: AddressPool,
}

impl Topology {
    pub fn new(root: &Identity) -> Self {
        let mut info = NodeInfo::new(Address::MASTER, None, EnumerationState::Pending);
        info.guid = root.guid;
        info.name = root.name.clone();
        let mut nodes = HashMap::new();
        nodes.insert(Address::MASTER, info);
        Self {
            nodes,
            pool: AddressPool::new(),
        }
    }

    pub fn root(&self) -> Option<&NodeInfo> {
        self.nodes.get(&Address::MASTER)
    }

    pub fn get(&self, address: Address) -> Option<&NodeInfo> {
        self.nodes.get(&address)
    }

    pub fn get_mut(&mut self, address: Address) -> Option<&mut NodeInfo> {
        self.nodes.get_mut(&address)
    }

    pub fn contains(&self, address: Address) -> bool {
        self.nodes.contains_key(&address)
    }

    /// Every known node, orphans included
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    pub fn allocate(&mut self) -> Option<Address> {
        self.pool.allocate()
    }

    pub fn release(&mut self, address: Address) {
        self.pool.release(address)
    }

    /// Record a confirmed node under `parent`. It starts out Idle until its
    /// node info says otherwise.
    pub fn add_child(&mut self, parent: Address, address: Address) -> bool {
        if self.nodes.contains_key(&address) {
            return false;
        }
        let Some(p) = self.nodes.get_mut(&parent) else {
            return false;
        };
        p.children.push(address);
        self.nodes.insert(
            address,
            NodeInfo::new(address, Some(parent), EnumerationState::Idle),
        );
        true
    }

    pub fn set_state(&mut self, address: Address, state: EnumerationState) {
        if let Some(info) = self.nodes.get_mut(&address) {
            info.state = state;
        }
    }

    /// Stamp `address` as alive. Returns false for unknown nodes.
    pub fn touch(&mut self, address: Address) -> bool {
        match self.nodes.get_mut(&address) {
            Some(info) => {
                info.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// The tree reachable from the root, in pre-order, with depths
    pub fn walk(&self) -> Vec<(usize, &NodeInfo)> {
        let mut out = Vec::new();
        let mut stack = vec![(0, Address::MASTER)];
        while let Some((depth, address)) = stack.pop() {
            let Some(info) = self.nodes.get(&address) else {
                continue;
            };
            out.push((depth, info));
            stack.extend(info.children.iter().rev().map(|c| (depth + 1, *c)));
        }
        out
    }

    /// The first node, in pre-order, that discovery is not done with
    pub fn next_pending(&self) -> Option<&NodeInfo> {
        self.walk()
            .into_iter()
            .map(|(_, info)| info)
            .find(|info| info.state != EnumerationState::Idle)
    }

    /// Prepare for a fresh discovery pass.
    pub fn reseed(&mut self) {
        for info in self.nodes.values_mut() {
            info.state = if info.is_root() {
                if info.children.is_empty() {
                    EnumerationState::Pending
                } else {
                    EnumerationState::Idle
                }
            } else if info.is_router() {
                EnumerationState::Pending
            } else {
                EnumerationState::Idle
            };
        }
    }

    /// Drop every non-root node not seen within `timeout`, returning their
    /// addresses to the pool. Children of an evicted node stay known, but
    /// are no longer reachable from the root.
    pub fn evict_stale(&mut self, timeout: Duration) -> Vec<Address> {
        let mut stale: Vec<Address> = self
            .nodes
            .values()
            .filter(|info| !info.is_root() && info.last_seen.elapsed() > timeout)
            .map(|info| info.address)
            .collect();
        stale.sort();

        for address in &stale {
            let Some(info) = self.nodes.remove(address) else {
                continue;
            };
            if let Some(parent) = info.parent.and_then(|p| self.nodes.get_mut(&p)) {
                parent.children.retain(|c| c != address);
            }
            for child in &info.children {
                if let Some(orphan) = self.nodes.get_mut(child) {
                    orphan.parent = None;
                }
            }
            self.pool.release(*address);
            debug!("evicted {address} ({})", info.name);
        }
        stale
    }

    /// Forget everything but the root, and start handing out addresses
    /// from scratch.
    pub fn clear(&mut self) {
        self.nodes.retain(|a, _| *a == Address::MASTER);
        if let Some(root) = self.nodes.get_mut(&Address::MASTER) {
            root.children.clear();
            root.state = EnumerationState::Pending;
        }
        self.pool = AddressPool::new();
    }

    /// The tree as an indented listing, one `-->Name (address)` per line
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (depth, info) in self.walk() {
            let _ = writeln!(
                out,
                "{:indent$}-->{} ({})",
                "",
                info.name,
                info.address,
                indent = depth * 2
            );
        }
        out
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use idp_frame::Address;

    use super::{AddressPool, EnumerationState, Topology};
    use crate::well_known::{Identity, ROUTER_GUID};

    #[test]
    fn lifo_allocator() {
        let mut pool = AddressPool::new();
        assert_eq!(pool.allocate(), Some(Address(2)));
        assert_eq!(pool.allocate(), Some(Address(3)));
        assert_eq!(pool.allocate(), Some(Address(4)));
        pool.release(Address(2));
        pool.release(Address(4));
        assert_eq!(pool.allocate(), Some(Address(4)));
        assert_eq!(pool.allocate(), Some(Address(2)));
        assert_eq!(pool.allocate(), Some(Address(5)));

        // never handed out, never taken back
        pool.release(Address(100));
        pool.release(Address::MASTER);
        assert_eq!(pool.free_count(), 0);
    }

    fn sample() -> Topology {
        let mut topo = Topology::new(&Identity::master());
        assert_eq!(topo.allocate(), Some(Address(2)));
        assert!(topo.add_child(Address::MASTER, Address(2)));
        let router = topo.get_mut(Address(2)).unwrap();
        router.guid = ROUTER_GUID;
        router.name = "Network.Router".into();
        for a in [3, 4] {
            assert_eq!(topo.allocate(), Some(Address(a)));
            assert!(topo.add_child(Address(2), Address(a)));
            topo.get_mut(Address(a)).unwrap().name = format!("Leaf{a}");
        }
        topo
    }

    #[test]
    fn preorder_and_render() {
        let mut topo = sample();
        topo.set_state(Address::MASTER, EnumerationState::Idle);
        let order: Vec<Address> = topo.walk().into_iter().map(|(_, i)| i.address).collect();
        assert_eq!(order, vec![Address::MASTER, Address(2), Address(3), Address(4)]);

        assert!(topo.next_pending().is_none());
        topo.set_state(Address(4), EnumerationState::Pending);
        assert_eq!(topo.next_pending().map(|i| i.address), Some(Address(4)));

        let text = topo.render();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "-->Network.Master (0x0001)");
        assert_eq!(lines[1], "  -->Network.Router (0x0002)");
        assert_eq!(lines[2], "    -->Leaf3 (0x0003)");
    }

    #[test]
    fn reseed() {
        let mut topo = sample();
        topo.reseed();
        assert_eq!(topo.get(Address::MASTER).unwrap().state, EnumerationState::Idle);
        assert_eq!(topo.get(Address(2)).unwrap().state, EnumerationState::Pending);
        assert_eq!(topo.get(Address(3)).unwrap().state, EnumerationState::Idle);

        let mut empty = Topology::new(&Identity::master());
        empty.set_state(Address::MASTER, EnumerationState::Idle);
        empty.reseed();
        assert_eq!(empty.root().unwrap().state, EnumerationState::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_orphans_children() {
        let mut topo = sample();
        tokio::time::advance(Duration::from_secs(10)).await;
        topo.touch(Address(3));
        topo.touch(Address(4));

        let evicted = topo.evict_stale(Duration::from_secs(5));
        assert_eq!(evicted, vec![Address(2)]);
        assert!(topo.root().unwrap().children.is_empty());
        assert_eq!(topo.get(Address(3)).unwrap().parent, None);
        assert_eq!(topo.walk().len(), 1);
        assert_eq!(topo.len(), 3);
        assert_eq!(topo.allocate(), Some(Address(2)));
    }
}
