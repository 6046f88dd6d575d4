//! Command dispatch and response correlation
//!
//! Every node owns a [`Dispatcher`]: a table of command handlers, a table of
//! per-command response handlers, and a [`ResponseStream`] that correlates
//! responses nobody registered a handler for with the tasks waiting on them.
//!
//! Handlers get mutable access to the node state they were registered on, plus
//! the incoming transaction and a response transaction that has already been
//! seeded with [`ResponseCode::Ok`] and the echoed command id. The code they
//! return is patched into that response, unless it is [`ResponseCode::Deferred`],
//! in which case the handler is responsible for any reply.

use std::{collections::HashMap, sync::Arc, time::Duration};

use idp_frame::Packet;
use log::{debug, trace, warn};
use tokio::sync::oneshot;

use crate::{
    node::NodeState,
    transaction::{IncomingTransaction, OutgoingTransaction, Response},
    well_known::{Command, ResponseCode},
    Lock,
};

/// A command handler, run with the owning node's state locked
pub type CommandHandler<S> = Box<
    dyn FnMut(&mut S, &mut IncomingTransaction, &mut OutgoingTransaction) -> ResponseCode + Send,
>;

/// A response handler for one echoed command id
pub type ResponseHandler<S> = Box<dyn FnMut(&mut S, &mut Response) + Send>;

pub struct Dispatcher<S> {
    commands: HashMap<u16, CommandHandler<S>>,
    responses: HashMap<u16, ResponseHandler<S>>,
    stream: ResponseStream,
}

impl<S: NodeState> Dispatcher<S> {
    pub fn new(stream: ResponseStream) -> Self {
        Self {
            commands: HashMap::new(),
            responses: HashMap::new(),
            stream,
        }
    }

    /// Register (or replace) the handler for `command`.
    ///
    /// Responses are always routed by the dispatcher itself, so a handler for
    /// [`Command::Response`] is refused.
    pub fn register_command<F>(&mut self, command: impl Into<Command>, handler: F)
    where
        F: FnMut(&mut S, &mut IncomingTransaction, &mut OutgoingTransaction) -> ResponseCode
            + Send
            + 'static,
    {
        let command = command.into();
        if command == Command::Response {
            warn!("refusing to register a command handler for Response");
            return;
        }
        self.commands.insert(command.id(), Box::new(handler));
    }

    /// Register (or replace) the handler for responses echoing `command`.
    ///
    /// Such responses no longer reach the [`ResponseStream`].
    pub fn register_response_handler<F>(&mut self, command: impl Into<Command>, handler: F)
    where
        F: FnMut(&mut S, &mut Response) + Send + 'static,
    {
        self.responses.insert(command.into().id(), Box::new(handler));
    }

    pub fn unregister_command(&mut self, command: impl Into<Command>) -> bool {
        self.commands.remove(&command.into().id()).is_some()
    }

    pub fn unregister_response_handler(&mut self, command: impl Into<Command>) -> bool {
        self.responses.remove(&command.into().id()).is_some()
    }

    pub fn handles(&self, command: impl Into<Command>) -> bool {
        self.commands.contains_key(&command.into().id())
    }

    pub fn responses(&self) -> &ResponseStream {
        &self.stream
    }

    /// Run the handler for `packet`, returning the automatic reply, if any.
    ///
    /// * Unknown commands are always answered with UnknownCommand, whether or
    ///   not a response was asked for.
    /// * Known commands are answered only if the request asked for a response
    ///   and the handler did not return Deferred.
    /// * Responses go to their response handler, or to the response stream.
    pub fn process_payload(&mut self, state: &mut S, packet: &Packet) -> Option<Packet> {
        let mut incoming = match IncomingTransaction::parse(packet.clone()) {
            Ok(t) => t,
            Err(e) => {
                warn!(
                    "{}: dropping undecodable transaction from {}: {e}",
                    state.core().address(),
                    packet.source()
                );
                return None;
            }
        };

        let command = incoming.command();
        if command == Command::Response {
            self.dispatch_response(state, incoming);
            return None;
        }

        let mut outgoing = OutgoingTransaction::response_to(&incoming);
        let Some(handler) = self.commands.get_mut(&command.id()) else {
            debug!(
                "{}: unknown command {command} from {}",
                state.core().address(),
                incoming.source()
            );
            outgoing.set_response_code(ResponseCode::UnknownCommand);
            return Some(outgoing.to_packet(state.core().address(), incoming.source()));
        };

        let code = handler(state, &mut incoming, &mut outgoing);
        if !incoming.response_expected() || code == ResponseCode::Deferred {
            return None;
        }
        outgoing.set_response_code(code);
        Some(outgoing.to_packet(state.core().address(), incoming.source()))
    }

    fn dispatch_response(&mut self, state: &mut S, incoming: IncomingTransaction) {
        let mut response = match Response::parse(incoming) {
            Ok(r) => r,
            Err(e) => {
                warn!("{}: dropping malformed response: {e}", state.core().address());
                return;
            }
        };

        if let Some(handler) = self.responses.get_mut(&response.request().id()) {
            handler(state, &mut response);
            return;
        }

        let tid = response.transaction_id();
        let request = response.request();
        if !self.stream.publish(response) {
            trace!(
                "{}: nobody waiting on {request} response, tid {tid}",
                state.core().address()
            );
        }
    }
}

#[derive(Default)]
struct Waiters {
    next_key: u64,
    waiting: HashMap<u32, (u64, oneshot::Sender<Response>)>,
}

/// Responses without a dedicated handler, keyed by transaction id
///
/// A wait must be armed with [`ResponseStream::subscribe`] *before* the
/// request goes out, otherwise a fast reply can slip past it.
#[derive(Clone)]
pub struct ResponseStream {
    inner: Arc<Lock<Waiters>>,
}

impl Default for ResponseStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseStream {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Lock::new(Waiters::default())),
        }
    }

    /// Arm a wait for the response to `transaction_id`.
    ///
    /// A later subscription for the same id replaces this one.
    pub fn subscribe(&self, transaction_id: u32, timeout: Duration) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        let key = self.inner.with_lock(|w| {
            w.next_key += 1;
            let key = w.next_key;
            if w.waiting.insert(transaction_id, (key, tx)).is_some() {
                debug!("replacing an armed wait for tid {transaction_id}");
            }
            key
        });
        PendingResponse {
            stream: self.clone(),
            transaction_id,
            key,
            rx,
            timeout,
        }
    }

    /// Hand `response` to whoever is waiting on its transaction id.
    ///
    /// Returns false if nobody was.
    pub fn publish(&self, response: Response) -> bool {
        let tid = response.transaction_id();
        let waiter = self.inner.with_lock(|w| w.waiting.remove(&tid));
        match waiter {
            Some((_, tx)) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Number of armed waits
    pub fn waiting(&self) -> usize {
        self.inner.with_lock(|w| w.waiting.len())
    }
}

/// An armed wait for one response
///
/// Dropping it, or letting it time out, disarms the wait.
pub struct PendingResponse {
    stream: ResponseStream,
    transaction_id: u32,
    key: u64,
    rx: oneshot::Receiver<Response>,
    timeout: Duration,
}

impl PendingResponse {
    pub fn transaction_id(&self) -> u32 {
        self.transaction_id
    }

    /// Wait for the response, or `None` once the timeout passes.
    pub async fn wait(mut self) -> Option<Response> {
        tokio::time::timeout(self.timeout, &mut self.rx)
            .await
            .ok()?
            .ok()
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        let (tid, key) = (self.transaction_id, self.key);
        self.stream.inner.with_lock(|w| {
            if matches!(w.waiting.get(&tid), Some((k, _)) if *k == key) {
                w.waiting.remove(&tid);
            }
        });
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use idp_frame::Address;

    use super::{Dispatcher, ResponseStream};
    use crate::{
        node::NodeCore,
        transaction::{IncomingTransaction, OutgoingTransaction, Response},
        well_known::{Command, CommandFlags, Identity, ResponseCode},
    };

    fn core(address: u16) -> NodeCore {
        let mut core = NodeCore::new(Identity::new(uuid::Uuid::nil(), "test"));
        core.set_address(Address(address));
        core
    }

    fn parse_response(pkt: idp_frame::Packet) -> Response {
        Response::parse(IncomingTransaction::parse(pkt).unwrap()).unwrap()
    }

    #[test]
    fn ping_reply_bytes() {
        let mut state = core(2);
        let mut disp = Dispatcher::<NodeCore>::new(ResponseStream::new());
        disp.register_command(Command::Ping, |_, _, _| ResponseCode::Ok);

        let req = OutgoingTransaction::request(Command::Ping, 42).to_packet(Address::MASTER, Address(2));
        let reply = disp.process_payload(&mut state, &req).unwrap();
        assert_eq!(
            reply.as_bytes(),
            &[
                0x02, 0x00, 0x00, 0x00, 0x15, 0x00, 0x00, 0x02, 0x00, 0x01, 0xA0, 0x00, 0x00, 0x00,
                0x00, 0x2A, 0x00, 0x00, 0xA0, 0x01, 0x03
            ]
        );
    }

    #[test]
    fn unknown_command_always_answered() {
        let mut state = core(2);
        let mut disp = Dispatcher::<NodeCore>::new(ResponseStream::new());

        for flags in [CommandFlags::NONE, CommandFlags::RESPONSE_EXPECTED] {
            let req = OutgoingTransaction::new(0x1234u16, 7, flags).to_packet(Address::MASTER, Address(2));
            let reply = disp.process_payload(&mut state, &req).unwrap();
            assert_eq!(reply.destination(), Address::MASTER);
            let resp = parse_response(reply);
            assert_eq!(resp.code(), ResponseCode::UnknownCommand);
            assert_eq!(resp.request(), Command::Other(0x1234));
            assert_eq!(resp.transaction_id(), 7);
        }
    }

    #[test]
    fn response_expected_gates_reply() {
        let mut state = core(2);
        let mut disp = Dispatcher::<NodeCore>::new(ResponseStream::new());
        disp.register_command(0xD001u16, |_, _, out| {
            out.write(5u8);
            ResponseCode::Ok
        });

        let quiet = OutgoingTransaction::new(0xD001u16, 1, CommandFlags::NONE).to_packet(Address::MASTER, Address(2));
        assert!(disp.process_payload(&mut state, &quiet).is_none());

        let loud = OutgoingTransaction::request(0xD001u16, 2).to_packet(Address::MASTER, Address(2));
        let mut resp = parse_response(disp.process_payload(&mut state, &loud).unwrap());
        assert!(resp.is_ok());
        assert_eq!(resp.read::<u8>(), Ok(5));
    }

    #[test]
    fn deferred_suppresses_reply() {
        let mut state = core(2);
        let mut disp = Dispatcher::<NodeCore>::new(ResponseStream::new());
        disp.register_command(0xD002u16, |state: &mut NodeCore, inc, out| {
            out.write(true);
            state.queue(inc.source(), out);
            ResponseCode::Deferred
        });

        let req = OutgoingTransaction::request(0xD002u16, 3).to_packet(Address::MASTER, Address(2));
        assert!(disp.process_payload(&mut state, &req).is_none());
        let queued = state.take_outbox();
        assert_eq!(queued.len(), 1);
        let mut resp = parse_response(queued[0].clone());
        assert_eq!(resp.code(), ResponseCode::Ok);
        assert_eq!(resp.read::<bool>(), Ok(true));
    }

    #[test]
    fn response_handler_takes_precedence() {
        let mut state = core(1);
        let stream = ResponseStream::new();
        let mut disp = Dispatcher::<NodeCore>::new(stream.clone());
        disp.register_response_handler(Command::Ping, |state: &mut NodeCore, _| state.stamp_ping());

        let _pending = stream.subscribe(9, Duration::from_secs(1));
        let incoming = IncomingTransaction::parse(
            OutgoingTransaction::request(Command::Ping, 9).to_packet(Address::MASTER, Address(2)),
        )
        .unwrap();
        let reply = OutgoingTransaction::response_to(&incoming).to_packet(Address(2), Address::MASTER);
        assert!(disp.process_payload(&mut state, &reply).is_none());
        // Handled by the response handler, the armed wait is still there
        assert_eq!(stream.waiting(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out() {
        let stream = ResponseStream::new();
        let timeout = Duration::from_millis(250);
        let start = tokio::time::Instant::now();
        let pending = stream.subscribe(1, timeout);
        assert_eq!(stream.waiting(), 1);
        assert!(pending.wait().await.is_none());
        assert!(start.elapsed() >= timeout);
        assert_eq!(stream.waiting(), 0);
    }

    #[tokio::test]
    async fn wait_resolves() {
        let mut state = core(1);
        let stream = ResponseStream::new();
        let mut disp = Dispatcher::<NodeCore>::new(stream.clone());

        let pending = stream.subscribe(77, Duration::from_secs(5));
        let incoming = IncomingTransaction::parse(
            OutgoingTransaction::request(0xD100u16, 77).to_packet(Address::MASTER, Address(2)),
        )
        .unwrap();
        let reply = OutgoingTransaction::response_to(&incoming)
            .with(0xBEEFu16)
            .to_packet(Address(2), Address::MASTER);
        assert!(disp.process_payload(&mut state, &reply).is_none());

        let mut resp = pending.wait().await.unwrap();
        assert_eq!(resp.source(), Address(2));
        assert_eq!(resp.read::<u16>(), Ok(0xBEEF));
    }
}
