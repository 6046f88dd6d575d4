//! Byte-stream adaptors
//!
//! Runs any tokio `AsyncRead + AsyncWrite` (a serial port, a TCP stream, a
//! pipe) as a router port. Outgoing packets are written whole by a tx worker;
//! an rx worker feeds whatever arrives through a [`FrameParser`] and delivers
//! every completed packet to the router.
//!
//! Either worker stopping closes the shared closer, which stops the other one
//! and marks the port inactive.

use std::sync::Arc;

use idp_frame::{FeedResult, FrameParser, Packet};
use log::{debug, error, info, trace, warn};
use maitake_sync::WaitQueue;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    select,
    sync::mpsc,
};

use crate::{
    adaptor::{Adaptor, AdaptorId, AdaptorPort},
    config::ParserConfig,
    router::Router,
};

/// The router-side handle of a stream adaptor
pub struct StreamAdaptor {
    name: String,
    tx: mpsc::UnboundedSender<Packet>,
    closer: Arc<WaitQueue>,
}

impl Adaptor for StreamAdaptor {
    fn name(&self) -> &str {
        &self.name
    }

    fn transmit(&self, packet: Packet) -> bool {
        if self.closer.is_closed() {
            return false;
        }
        self.tx.send(packet).is_ok()
    }
}

struct TxWorker<T> {
    name: String,
    tx: WriteHalf<T>,
    rx: mpsc::UnboundedReceiver<Packet>,
    closer: Arc<WaitQueue>,
}

struct RxWorker<T> {
    port: AdaptorPort,
    name: String,
    skt: ReadHalf<T>,
    parser: FrameParser,
    read_buffer: usize,
    closer: Arc<WaitQueue>,
}

impl<T: AsyncWrite> TxWorker<T> {
    async fn run(mut self) {
        self.run_inner().await;
        warn!("Closing adaptor {}", self.name);
        self.closer.close();
    }

    async fn run_inner(&mut self) {
        info!("Started tx_worker for {}", self.name);
        loop {
            let rxf = self.rx.recv();
            let clf = self.closer.wait();

            let packet = select! {
                r = rxf => match r {
                    Some(p) => p,
                    None => break,
                },
                _c = clf => {
                    break;
                }
            };

            trace!("sending pkt len:{} on {}", packet.len(), self.name);
            if let Err(e) = self.tx.write_all(packet.as_bytes()).await {
                error!("{}: write failed: {e:?}", self.name);
                break;
            }
        }
    }
}

impl<T: AsyncRead> RxWorker<T> {
    async fn run(mut self) {
        let close = self.closer.clone();

        // Wait for the receiver to hit an error, or for the transmitter to
        // signal that it did
        select! {
            _run = self.run_inner() => {
                self.closer.close();
            },
            _clf = close.wait() => {},
        }

        self.port.set_active(false);
    }

    async fn run_inner(&mut self) {
        let mut raw_buf = vec![0u8; self.read_buffer].into_boxed_slice();

        loop {
            let rd = self.skt.read(&mut raw_buf);
            let close = self.closer.wait();

            let ct = select! {
                r = rd => {
                    match r {
                        Ok(0) => {
                            warn!("recv run {} closed", self.name);
                            return;
                        }
                        Err(e) => {
                            error!("recv run {} failed: {e:?}", self.name);
                            return;
                        }
                        Ok(ct) => ct,
                    }
                }
                _c = close => {
                    return;
                }
            };

            let mut window = &raw_buf[..ct];
            'frame: while !window.is_empty() {
                window = match self.parser.feed(window) {
                    FeedResult::Consumed => break 'frame,
                    FeedResult::Dropped { reason, remaining } => {
                        debug!("{}: dropped frame: {reason:?}", self.name);
                        remaining
                    }
                    FeedResult::Packet { packet, remaining } => {
                        self.port.deliver(packet);
                        remaining
                    }
                };
            }
        }
    }
}

/// Register `stream` as a new port of `router` and start its workers.
///
/// Returns the port id, and the closer that stops both workers when closed.
pub fn register_stream_adaptor<T>(
    router: &Router,
    name: impl Into<String>,
    stream: T,
    config: &ParserConfig,
) -> (AdaptorId, Arc<WaitQueue>)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let name = name.into();
    let (rx, tx) = tokio::io::split(stream);
    let (queue_tx, queue_rx) = mpsc::unbounded_channel();
    let closer = Arc::new(WaitQueue::new());

    let port = router.add_adaptor(Arc::new(StreamAdaptor {
        name: name.clone(),
        tx: queue_tx,
        closer: closer.clone(),
    }));
    port.set_active(true);

    let rx_worker = RxWorker {
        port: port.clone(),
        name: name.clone(),
        skt: rx,
        parser: config.parser(),
        read_buffer: config.read_buffer,
        closer: closer.clone(),
    };
    let tx_worker = TxWorker {
        name,
        tx,
        rx: queue_rx,
        closer: closer.clone(),
    };

    tokio::task::spawn(rx_worker.run());
    tokio::task::spawn(tx_worker.run());

    (port.id(), closer)
}
