use std::{collections::VecDeque, sync::Arc};

use idp_frame::Packet;
use log::{debug, info, trace, warn};
use maitake_sync::WaitQueue;
use tokio::{select, sync::mpsc};

use crate::{
    adaptor::AdaptorId,
    node::Processed,
    router::{Ingress, Router},
    well_known::Command,
};

struct Work {
    ingress: Option<AdaptorId>,
    packet: Packet,
}

/// The single consumer of a router's ingress
///
/// Either spawn [`RouterWorker::run`], or call
/// [`RouterWorker::process_pending`] by hand to step the router
/// deterministically.
pub struct RouterWorker {
    router: Router,
    rx: mpsc::UnboundedReceiver<Ingress>,
    queue: VecDeque<Work>,
    max_queue_depth: usize,
}

impl RouterWorker {
    pub(crate) fn new(
        router: Router,
        rx: mpsc::UnboundedReceiver<Ingress>,
        max_queue_depth: usize,
    ) -> Self {
        Self {
            router,
            rx,
            queue: VecDeque::new(),
            max_queue_depth,
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Route packets until `closer` is closed.
    pub async fn run(mut self, closer: Arc<WaitQueue>) {
        info!("Started router worker");
        loop {
            let rxf = self.rx.recv();
            let clf = closer.wait();

            let msg = select! {
                m = rxf => match m {
                    Some(m) => m,
                    None => break,
                },
                _c = clf => {
                    break;
                }
            };
            self.ingest(msg);
            self.process_pending();
        }
        warn!("Router worker {} stopped", self.router.address());
    }

    /// Route everything already waiting, without blocking.
    ///
    /// Returns how many packets were routed.
    pub fn process_pending(&mut self) -> usize {
        let mut routed = 0;
        while let Ok(msg) = self.rx.try_recv() {
            routed += self.ingest(msg);
        }
        routed
    }

    fn ingest(&mut self, msg: Ingress) -> usize {
        match msg {
            Ingress::Packet { adaptor, packet } => {
                if let Some(id) = adaptor {
                    let source = packet.source();
                    self.router.node.with_state(|s| s.learn(source, id));
                }
                self.push(Work {
                    ingress: adaptor,
                    packet,
                });
                self.drain()
            }
            Ingress::SetActive { adaptor, active } => {
                self.router
                    .node
                    .with_state(|s| s.set_adaptor_active(adaptor, active));
                0
            }
        }
    }

    fn push(&mut self, work: Work) {
        if self.queue.len() >= self.max_queue_depth {
            warn!(
                "{}: work queue full, dropping {:?}",
                self.router.address(),
                work.packet
            );
            return;
        }
        self.queue.push_back(work);
    }

    fn drain(&mut self) -> usize {
        let mut routed = 0;
        while let Some(work) = self.queue.pop_front() {
            self.route(work);
            routed += 1;
        }
        routed
    }

    fn route(&mut self, work: Work) {
        let Work { ingress, packet } = work;
        let plan = self.router.node.with_state(|s| s.plan(&packet, ingress));
        trace!(
            "{}: {} -> {} {}",
            self.router.address(),
            packet.source(),
            packet.destination(),
            command_of(&packet)
        );
        if plan.is_empty() {
            debug!(
                "{}: no route for {:?}",
                self.router.address(),
                packet
            );
            return;
        }

        for (id, adaptor) in plan.adaptors {
            if !adaptor.transmit(packet.clone()) {
                debug!("{}: {id} ({}) refused packet", self.router.address(), adaptor.name());
            }
        }
        for node in plan.nodes {
            let processed = node.process_packet(&packet);
            self.enqueue(processed);
        }
        if plan.to_self {
            let processed = self.router.node.process_packet(&packet);
            self.enqueue(processed);
        }
    }

    fn enqueue(&mut self, processed: Processed) {
        for packet in processed.into_packets() {
            self.push(Work {
                ingress: None,
                packet,
            });
        }
    }
}

fn command_of(packet: &Packet) -> Command {
    match packet.payload() {
        [hi, lo, ..] => Command::from_id(u16::from_be_bytes([*hi, *lo])),
        _ => Command::Other(0),
    }
}
