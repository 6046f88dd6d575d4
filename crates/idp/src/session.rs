//! Client/server sessions
//!
//! A server is any node that answers QueryInterface for its own GUID. A
//! [`Client`] finds it with [`Node::query_interface`], then opens a session
//! with Connect and closes it with Disconnect. The server side,
//! [`ServerSession`], remembers which address is connected.

use std::sync::Arc;

use idp_frame::Address;
use log::{debug, info};
use uuid::Uuid;

use crate::{
    node::{Node, NodeCore, NodeState},
    transaction::OutgoingTransaction,
    well_known::{Command, ResponseCode},
    Lock,
};

/// Opens a session with a server
pub const CONNECT: Command = Command::Other(0xD000);
/// Closes a session with a server
pub const DISCONNECT: Command = Command::Other(0xD001);

/// The server end of a session, tracking the connected client
pub struct ServerSession<S: NodeState = NodeCore> {
    node: Node<S>,
    client: Arc<Lock<Address>>,
}

impl<S: NodeState> ServerSession<S> {
    /// Register the Connect and Disconnect handlers on `node`.
    ///
    /// A Connect from any address takes over the session.
    pub fn new(node: &Node<S>) -> Self {
        let client = Arc::new(Lock::new(Address::UNASSIGNED));

        let connected = client.clone();
        node.register_command(CONNECT, move |state: &mut S, inc, _| {
            let source = inc.source();
            connected.with_lock(|c| *c = source);
            info!("{}: client {source} connected", state.core().address());
            ResponseCode::Ok
        });
        let disconnected = client.clone();
        node.register_command(DISCONNECT, move |state: &mut S, inc, _| {
            disconnected.with_lock(|c| *c = Address::UNASSIGNED);
            info!("{}: client {} disconnected", state.core().address(), inc.source());
            ResponseCode::Ok
        });

        Self {
            node: node.clone(),
            client,
        }
    }

    pub fn node(&self) -> &Node<S> {
        &self.node
    }

    pub fn client(&self) -> Address {
        self.client.with_lock(|c| *c)
    }

    pub fn is_client_connected(&self) -> bool {
        self.client().is_assigned()
    }

    /// Look up a client by its interface GUID, and adopt it if no client is
    /// connected yet.
    pub async fn find_client(&self, guid: Uuid) -> Option<Address> {
        let found = self.node.query_interface(guid).await?;
        self.client.with_lock(|c| {
            if c.is_unassigned() {
                *c = found;
            }
        });
        Some(found)
    }
}

/// The client end of a session
pub struct Client<S: NodeState = NodeCore> {
    node: Node<S>,
    server: Lock<Address>,
}

impl<S: NodeState> Client<S> {
    /// A client sending through `node`, with no server located yet
    pub fn new(node: Node<S>) -> Self {
        Self::with_server(node, Address::UNASSIGNED)
    }

    pub fn with_server(node: Node<S>, server: Address) -> Self {
        Self {
            node,
            server: Lock::new(server),
        }
    }

    pub fn node(&self) -> &Node<S> {
        &self.node
    }

    pub fn server(&self) -> Address {
        self.server.with_lock(|s| *s)
    }

    /// Find the server implementing `guid` and send to it from now on.
    ///
    /// On failure the client forgets any server it had.
    pub async fn locate(&self, guid: Uuid) -> bool {
        let found = self.node.query_interface(guid).await;
        let server = found.unwrap_or(Address::UNASSIGNED);
        self.server.with_lock(|s| *s = server);
        found.is_some()
    }

    /// Open a session with the located server.
    pub async fn connect(&self) -> bool {
        self.session_request(CONNECT).await
    }

    /// Close the session with the located server.
    pub async fn disconnect(&self) -> bool {
        self.session_request(DISCONNECT).await
    }

    /// Send `tx` to the located server.
    pub fn send_request(&self, tx: &OutgoingTransaction) -> bool {
        self.node.send_request(self.server(), tx)
    }

    async fn session_request(&self, command: Command) -> bool {
        let server = self.server();
        if server.is_unassigned() {
            debug!("{}: no server located for {command}", self.node.address());
            return false;
        }
        let tid = self.node.create_transaction_id();
        let tx = OutgoingTransaction::request(command, tid);
        match self.node.send_request_async(server, &tx).await {
            (true, Some(response)) => response.is_ok(),
            _ => false,
        }
    }
}
