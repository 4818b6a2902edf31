//! Utilities for testing code based on this crate: an in-memory datagram network with loss
//!  injection, a sink that records send requests, and a handler that collects received packets.
//!  They are used for testing the crate itself, and exported for application testing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Semaphore};
use tracing::trace;
use crate::dispatch::socket::DatagramSocket;
use crate::dispatch::{PacketSink, SendRequest, TAG_LEN};
use crate::lock::LockStrategy;
use crate::packet::sequence_id::SequenceId;
use crate::packet::{ChannelKind, InboundPacket};
use crate::peer::{PacketHandler, Peer};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// decides whether a datagram is lost: `(from, to, datagram) -> drop?`
pub type DropFilter = Box<dyn Fn(SocketAddr, SocketAddr, &[u8]) -> bool + Send + Sync>;

/// Connects [MemorySocket]s by address. Datagrams to addresses without a socket are lost, like
///  they would be on a real network.
#[derive(Default)]
pub struct MemoryNetwork {
    sockets: Mutex<FxHashMap<SocketAddr, mpsc::UnboundedSender<(SocketAddr, Bytes)>>>,
    drop_filter: Mutex<Option<DropFilter>>,
    num_dropped: AtomicUsize,
}

impl MemoryNetwork {
    pub fn new() -> Arc<MemoryNetwork> {
        Default::default()
    }

    pub fn bind(self: &Arc<Self>, addr: SocketAddr) -> Arc<MemorySocket> {
        self.do_bind(addr, None)
    }

    /// Every send on the returned socket waits for a permit from `gate`, which allows tests to
    ///  hold sends in flight
    pub fn bind_gated(self: &Arc<Self>, addr: SocketAddr, gate: Arc<Semaphore>) -> Arc<MemorySocket> {
        self.do_bind(addr, Some(gate))
    }

    fn do_bind(self: &Arc<Self>, addr: SocketAddr, gate: Option<Arc<Semaphore>>) -> Arc<MemorySocket> {
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.sockets).insert(addr, sender);

        Arc::new(MemorySocket {
            addr,
            network: self.clone(),
            inbox: tokio::sync::Mutex::new(receiver),
            gate,
        })
    }

    pub fn set_drop_filter(&self, filter: impl Fn(SocketAddr, SocketAddr, &[u8]) -> bool + Send + Sync + 'static) {
        *lock(&self.drop_filter) = Some(Box::new(filter));
    }

    pub fn num_dropped(&self) -> usize {
        self.num_dropped.load(Ordering::SeqCst)
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, datagram: &[u8]) {
        let is_dropped = lock(&self.drop_filter).as_ref()
            .map(|filter| filter(from, to, datagram))
            .unwrap_or(false);
        if is_dropped {
            trace!("memory network: dropping datagram from {:?} to {:?}", from, to);
            self.num_dropped.fetch_add(1, Ordering::SeqCst);
            return;
        }

        match lock(&self.sockets).get(&to) {
            Some(inbox) => {
                let _ = inbox.send((from, Bytes::copy_from_slice(datagram)));
            }
            None => trace!("memory network: no socket bound to {:?}", to),
        }
    }
}

pub struct MemorySocket {
    addr: SocketAddr,
    network: Arc<MemoryNetwork>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<(SocketAddr, Bytes)>>,
    gate: Option<Arc<Semaphore>>,
}

#[async_trait]
impl DatagramSocket for MemorySocket {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) -> std::io::Result<()> {
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e))?;
        }
        self.network.deliver(self.addr, to, datagram);
        Ok(())
    }

    async fn recv_datagram(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        let (from, datagram) = self.inbox.lock().await
            .recv().await
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "memory network is gone"))?;

        // like UDP, excess bytes are discarded
        let len = datagram.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram[..len]);
        Ok((len, from))
    }

    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.addr)
    }
}

/// Decodes the packet in a framed datagram, assuming it was sent without compression
pub fn decode_uncompressed(datagram: &[u8]) -> Option<InboundPacket> {
    let packet = datagram.get(TAG_LEN..)?;
    InboundPacket::decode(Bytes::copy_from_slice(packet)).ok()
}

/// Decodes the packet of a recorded send request
pub fn decode_request(request: &SendRequest) -> InboundPacket {
    match InboundPacket::decode(request.datagram.clone()) {
        Ok(packet) => packet,
        Err(e) => panic!("recorded an invalid packet: {}", e),
    }
}

/// A [PacketSink] that records all send requests without sending them
pub struct RecordingSink {
    max_packet_len: usize,
    requests: Mutex<Vec<SendRequest>>,
}

impl RecordingSink {
    pub fn new(max_packet_len: usize) -> Arc<RecordingSink> {
        Arc::new(RecordingSink {
            max_packet_len,
            requests: Default::default(),
        })
    }

    /// returns recorded requests, clearing the internal buffer
    pub fn take_requests(&self) -> Vec<SendRequest> {
        std::mem::take(&mut *lock(&self.requests))
    }
}

impl PacketSink for RecordingSink {
    fn post_send(&self, request: SendRequest) {
        lock(&self.requests).push(request);
    }

    fn max_packet_len(&self) -> usize {
        self.max_packet_len
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReceivedPacket {
    pub from: SocketAddr,
    pub kind: ChannelKind,
    pub sequence_id: SequenceId,
    pub operation_id: u64,
    /// the part of the payload the application wrote
    pub payload: Vec<u8>,
}

/// A [PacketHandler] that collects everything it receives
#[derive(Default)]
pub struct CollectingHandler {
    received: Mutex<Vec<ReceivedPacket>>,
    expired: Mutex<Vec<SocketAddr>>,
}

impl CollectingHandler {
    pub fn new() -> Arc<CollectingHandler> {
        Default::default()
    }

    pub fn received(&self) -> Vec<ReceivedPacket> {
        lock(&self.received).clone()
    }

    pub fn expired(&self) -> Vec<SocketAddr> {
        lock(&self.expired).clone()
    }

    /// Polls until at least `n` packets were received, returning them, or `None` on timeout
    pub async fn wait_for_packets(&self, n: usize, timeout: Duration) -> Option<Vec<ReceivedPacket>> {
        tokio::time::timeout(timeout, async {
            loop {
                let received = self.received();
                if received.len() >= n {
                    return received;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }).await
            .ok()
    }
}

impl<L: LockStrategy> PacketHandler<L> for CollectingHandler {
    fn on_receive(&self, peer: &Arc<Peer<L>>, packet: InboundPacket) {
        lock(&self.received).push(ReceivedPacket {
            from: peer.addr(),
            kind: packet.kind(),
            sequence_id: packet.sequence_id(),
            operation_id: packet.operation_id(),
            payload: packet.remaining().to_vec(),
        });
    }

    fn on_peer_expired(&self, addr: SocketAddr) {
        lock(&self.expired).push(addr);
    }
}
