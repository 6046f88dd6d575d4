use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use idp::{
    Adaptor, AdaptorId, Address, Command, CommandFlags, IdpConfig, IncomingTransaction, Node,
    OutgoingTransaction, Packet, Response, ResponseCode, Router,
};
use uuid::Uuid;

const LEAF: Uuid = Uuid::from_u128(0x5EED_0000_0000_0000_0000_0000_0000_0001);

struct Tap {
    name: String,
    sent: Mutex<Vec<Packet>>,
}

impl Tap {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn take(&self) -> Vec<Packet> {
        core::mem::take(&mut *self.sent.lock().unwrap())
    }
}

impl Adaptor for Tap {
    fn name(&self) -> &str {
        &self.name
    }

    fn transmit(&self, packet: Packet) -> bool {
        self.sent.lock().unwrap().push(packet);
        true
    }
}

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn response(pkt: &Packet) -> Response {
    Response::parse(IncomingTransaction::parse(pkt.clone()).unwrap()).unwrap()
}

#[test]
fn broadcast_skips_learned_port() {
    init_logs();
    let (router, mut worker) = Router::new();
    router.node().set_address(Address(2));
    let one = Tap::new("one");
    let two = Tap::new("two");
    let p1 = router.add_adaptor(one.clone());
    let _p2 = router.add_adaptor(two.clone());

    let hello = OutgoingTransaction::new(Command::Ping, 1, CommandFlags::NONE);
    p1.deliver(hello.to_packet(Address(0x10), Address(2)));
    worker.process_pending();
    assert_eq!(router.route_for(Address(0x10)), Some(AdaptorId(0)));

    let bcast = OutgoingTransaction::new(Command::Ping, 2, CommandFlags::NONE);
    p1.deliver(bcast.to_packet(Address(0x10), Address::BROADCAST));
    worker.process_pending();
    assert!(one.take().is_empty());
    let fwd = two.take();
    assert_eq!(fwd.len(), 1);
    assert_eq!(fwd[0].source(), Address(0x10));
    assert!(fwd[0].destination().is_broadcast());
}

#[test]
fn broadcast_not_echoed_when_router_answers() {
    init_logs();
    let (router, mut worker) = Router::new();
    router.node().set_address(Address(2));
    let one = Tap::new("one");
    let two = Tap::new("two");
    let p1 = router.add_adaptor(one.clone());
    let _p2 = router.add_adaptor(two.clone());

    // nothing handles 0xD100, so the router answers it even unasked
    let hello = OutgoingTransaction::new(0xD100u16, 1, CommandFlags::NONE);
    p1.deliver(hello.to_packet(Address(0x10), Address(2)));
    let bcast = OutgoingTransaction::new(0xD100u16, 2, CommandFlags::NONE);
    p1.deliver(bcast.to_packet(Address(0x10), Address::BROADCAST));
    worker.process_pending();

    let back = one.take();
    assert_eq!(back.len(), 2);
    for pkt in &back {
        assert!(!pkt.destination().is_broadcast());
        assert_eq!(pkt.source(), Address(2));
        assert_eq!(pkt.destination(), Address(0x10));
        assert_eq!(response(pkt).code(), ResponseCode::UnknownCommand);
    }
    let fwd = two.take();
    assert_eq!(fwd.len(), 1);
    assert!(fwd[0].destination().is_broadcast());
}

#[test]
fn broadcast_replies_are_queued() {
    init_logs();
    let (router, mut worker) = Router::new();
    router.node().set_address(Address(2));
    let up = Tap::new("up");
    let port = router.add_adaptor(up.clone());

    for a in 3..8 {
        let leaf = Node::with_identity(LEAF, format!("Leaf{a}"));
        leaf.set_address(Address(a));
        assert!(router.add_node(&leaf));
    }

    let ping = OutgoingTransaction::request(Command::Ping, 9);
    port.deliver(ping.to_packet(Address::MASTER, Address::BROADCAST));
    assert_eq!(worker.process_pending(), 7);

    let replies = up.take();
    let mut sources: Vec<u16> = replies.iter().map(|p| p.source().as_u16()).collect();
    sources.sort();
    assert_eq!(sources, vec![2, 3, 4, 5, 6, 7]);
    for pkt in &replies {
        let resp = response(pkt);
        assert_eq!(resp.code(), ResponseCode::Ok);
        assert_eq!(resp.transaction_id(), 9);
        assert_eq!(resp.destination(), Address::MASTER);
    }
}

#[test]
fn work_queue_overflow_drops() {
    init_logs();
    let config = IdpConfig::from_toml_str("[router]\nmax_queue_depth = 2\n").unwrap();
    let (router, mut worker) = Router::with_config(&config);
    router.node().set_address(Address(2));
    let up = Tap::new("up");
    let port = router.add_adaptor(up.clone());
    for a in 3..8 {
        let leaf = Node::with_identity(LEAF, "Leaf");
        leaf.set_address(Address(a));
        router.add_node(&leaf);
    }

    let ping = OutgoingTransaction::request(Command::Ping, 1);
    port.deliver(ping.to_packet(Address::MASTER, Address::BROADCAST));
    worker.process_pending();
    assert_eq!(up.take().len(), 2);
}

#[tokio::test]
async fn unknown_command_from_local_node() {
    init_logs();
    let (router, mut worker) = Router::new();
    router.node().set_address(Address(2));
    let up = Tap::new("up");
    let _ = router.add_adaptor(up.clone());
    let leaf = Node::with_identity(LEAF, "Leaf");
    leaf.set_address(Address(3));
    router.add_node(&leaf);

    // fire-and-forget, but unknown commands are always answered
    let pending = leaf.responses().subscribe(77, Duration::from_secs(1));
    let odd = OutgoingTransaction::new(0x1234u16, 77, CommandFlags::NONE);
    assert!(leaf.send_request(Address(2), &odd));
    worker.process_pending();

    // the reply is delivered straight back to the local node
    assert!(up.take().is_empty());
    let resp = pending.wait().await.unwrap();
    assert_eq!(resp.code(), ResponseCode::UnknownCommand);
    assert_eq!(resp.request(), Command::Other(0x1234));
    assert_eq!(resp.source(), Address(2));
}

#[test]
fn router_poll_stays_local() {
    init_logs();
    let (router, mut worker) = Router::new();
    let up = Tap::new("up");
    let down = Tap::new("down");
    let _ = router.add_adaptor(up.clone());
    let pdown = router.add_adaptor(down.clone());

    let info = OutgoingTransaction::request(Command::GetNodeInfo, 4);
    pdown.deliver(info.to_packet(Address(0x30), Address::ROUTER_POLL));
    worker.process_pending();

    // answered even while unassigned, and never sent upstream
    let sent = down.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].source(), Address::UNASSIGNED);
    assert!(up.take().is_empty());

    router.node().set_address(Address(2));
    pdown.deliver(info.to_packet(Address(0x30), Address::ROUTER_POLL));
    worker.process_pending();
    assert!(up.take().is_empty());
    let sent = down.take();
    assert_eq!(sent.len(), 1);
    let mut resp = response(&sent[0]);
    assert_eq!(resp.source(), Address(2));
    assert_eq!(resp.read::<Uuid>(), Ok(idp::well_known::ROUTER_GUID));
    assert_eq!(resp.read_str(), "Network.Router");
}
