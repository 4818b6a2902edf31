use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::anyhow;
use tokio::net::{lookup_host, UdpSocket};
use tokio::runtime::Handle;
use tracing::{debug, info};
use crate::config::PeerNetConfig;
use crate::dispatch::socket::DatagramSocket;
use crate::dispatch::stats::DispatchStatsSnapshot;
use crate::dispatch::{DispatchEngine, PacketSink, TransportContext};
use crate::lock::{BlockingLock, LockStrategy};
use crate::peer::{PacketHandler, Peer};
use crate::registry::PeerRegistry;

/// EndPoint is where the parts of the protocol come together: it owns the socket, the dispatch
///  engine that moves datagrams between socket and peers, and the registry of peers. It is the
///  application's entry point for talking to peers.
pub struct EndPoint<L: LockStrategy = BlockingLock> {
    config: Arc<PeerNetConfig>,
    registry: Arc<PeerRegistry<L>>,
    engine: DispatchEngine,
}

impl<L: LockStrategy> EndPoint<L> {
    /// Binds a UDP socket to the configured address and starts dispatching
    pub async fn bind(config: Arc<PeerNetConfig>, handler: Arc<dyn PacketHandler<L>>) -> anyhow::Result<EndPoint<L>> {
        config.validate()?;

        let socket = UdpSocket::bind(config.self_addr).await
            .map_err(|e| anyhow!("error binding to {:?}: {}", config.self_addr, e))?;
        info!("bound socket to {:?}", socket.local_addr()?);

        Self::with_socket(config, Arc::new(socket), handler)
    }

    /// Starts dispatching on an existing socket. This must be called from inside a tokio runtime,
    ///  which is where peers' ticks run.
    pub fn with_socket(config: Arc<PeerNetConfig>, socket: Arc<dyn DatagramSocket>, handler: Arc<dyn PacketHandler<L>>) -> anyhow::Result<EndPoint<L>> {
        config.validate()?;

        let context = Arc::new(TransportContext::new(config.as_ref(), socket)?);
        let registry = PeerRegistry::new(config.clone(), context.clone(), handler, Handle::current());
        let engine = DispatchEngine::start(context, registry.clone(), config.worker_threads);

        Ok(EndPoint {
            config,
            registry,
            engine,
        })
    }

    pub fn config(&self) -> &Arc<PeerNetConfig> {
        &self.config
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.engine.context().local_addr()
    }

    /// the maximum encoded length of a packet that peers of this end point can send
    pub fn max_packet_len(&self) -> usize {
        self.engine.context().max_packet_len()
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.engine.stats()
    }

    /// Resolves a host name and returns the peer at the resolved address, creating it if
    ///  necessary. Addresses of the socket's own IP family are preferred.
    pub async fn discover_peer(&self, host: &str, port: u16) -> anyhow::Result<Arc<Peer<L>>> {
        let candidates = lookup_host((host, port)).await?
            .collect::<Vec<_>>();
        let is_ipv6 = self.local_addr()?.is_ipv6();

        let addr = candidates.iter()
            .find(|addr| addr.is_ipv6() == is_ipv6)
            .or_else(|| candidates.first())
            .copied()
            .ok_or_else(|| anyhow!("{}:{} does not resolve to an address", host, port))?;

        debug!("resolved {}:{} to {:?}", host, port, addr);
        Ok(self.peer(addr))
    }

    /// returns the peer for an address, creating it if it does not exist yet
    pub fn peer(&self, addr: SocketAddr) -> Arc<Peer<L>> {
        self.registry.get_or_create(addr)
    }

    pub fn get_peer(&self, addr: SocketAddr) -> Option<Arc<Peer<L>>> {
        self.registry.get(addr)
    }

    pub fn peers(&self) -> Vec<Arc<Peer<L>>> {
        self.registry.all()
    }

    /// Removes a peer and waits for its tick to finish. Returns `false` if there is no peer
    ///  for the address. If the remote side keeps sending, a new peer is created.
    pub async fn disconnect(&self, addr: SocketAddr) -> bool {
        match self.registry.remove(addr) {
            Some(peer) => {
                peer.stop().await;
                info!("disconnected from {:?}", addr);
                true
            }
            None => false,
        }
    }

    /// Stops dispatching and all peers. Sends that were not transmitted yet are discarded.
    pub async fn shutdown(&self) {
        info!("shutting down end point");
        self.engine.shutdown();
        for peer in self.registry.remove_all() {
            peer.stop().await;
        }
    }
}

impl<L: LockStrategy> Drop for EndPoint<L> {
    fn drop(&mut self) {
        self.engine.shutdown();
        self.registry.remove_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use crate::config::CompressionKind;
    use crate::dispatch::TAG_LEN;
    use crate::packet::sequence_id::SequenceId;
    use crate::packet::ChannelKind;
    use crate::test_util::{decode_uncompressed, CollectingHandler, MemoryNetwork};

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, n], 9200))
    }

    fn config(self_addr: SocketAddr, compression: CompressionKind) -> Arc<PeerNetConfig> {
        let mut config = PeerNetConfig::new(self_addr);
        config.initial_rtt = Duration::from_millis(20);
        config.min_tick_interval = Duration::from_millis(10);
        config.worker_threads = 2;
        config.compression = compression;
        Arc::new(config)
    }

    fn memory_end_point(network: &Arc<MemoryNetwork>, self_addr: SocketAddr, handler: Arc<CollectingHandler>) -> EndPoint {
        EndPoint::<BlockingLock>::with_socket(config(self_addr, CompressionKind::None), network.bind(self_addr), handler).unwrap()
    }

    fn send_numbers(peer: &Peer, kind: ChannelKind, numbers: impl Iterator<Item = u32>) {
        for n in numbers {
            let mut packet = peer.create_packet(kind);
            packet.write(n);
            peer.send(packet).unwrap();
        }
    }

    fn payloads(kind: ChannelKind, received: &[crate::test_util::ReceivedPacket]) -> Vec<Vec<u8>> {
        received.iter()
            .filter(|p| p.kind == kind)
            .map(|p| p.payload.clone())
            .collect()
    }

    fn expected_payloads(numbers: impl Iterator<Item = u32>) -> Vec<Vec<u8>> {
        numbers.map(|n| n.to_be_bytes().to_vec()).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ordered_end_to_end() {
        let network = MemoryNetwork::new();
        let handler_a = CollectingHandler::new();
        let handler_b = CollectingHandler::new();
        let a = memory_end_point(&network, addr(1), handler_a.clone());
        let b = memory_end_point(&network, addr(2), handler_b.clone());

        send_numbers(&a.peer(addr(2)), ChannelKind::Ordered, 0..20);

        let received = handler_b.wait_for_packets(20, TIMEOUT).await.unwrap();
        assert_eq!(payloads(ChannelKind::Ordered, &received), expected_payloads(0..20));
        assert!(received.iter().all(|p| p.from == addr(1)));

        // the receiving side knows the sender from its first datagram
        assert!(b.get_peer(addr(1)).is_some());
        assert!(handler_a.received().is_empty());

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_lost_ordered_packet_is_recovered() {
        let network = MemoryNetwork::new();
        let dropped = AtomicBool::new(false);
        network.set_drop_filter(move |from, _, datagram| {
            let is_second_ordered_data = from == addr(1)
                && decode_uncompressed(datagram)
                .map(|packet| packet.kind() == ChannelKind::Ordered
                    && packet.sequence_id() == SequenceId::from_raw(2)
                    && packet.remaining().first() == Some(&0))
                .unwrap_or(false);
            is_second_ordered_data && !dropped.swap(true, Ordering::SeqCst)
        });

        let handler_b = CollectingHandler::new();
        let a = memory_end_point(&network, addr(1), CollectingHandler::new());
        let b = memory_end_point(&network, addr(2), handler_b.clone());

        send_numbers(&a.peer(addr(2)), ChannelKind::Ordered, 0..5);

        let received = handler_b.wait_for_packets(5, TIMEOUT).await.unwrap();
        assert_eq!(payloads(ChannelKind::Ordered, &received), expected_payloads(0..5));
        assert_eq!(network.num_dropped(), 1);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_all_channel_kinds() {
        let network = MemoryNetwork::new();
        let handler_b = CollectingHandler::new();
        let a = memory_end_point(&network, addr(1), CollectingHandler::new());
        let b = memory_end_point(&network, addr(2), handler_b.clone());

        // one at a time: reliable and unreliable channels drop packets that are overtaken
        let peer = a.peer(addr(2));
        for (i, (kind, n)) in [(ChannelKind::Reliable, 0..3), (ChannelKind::Unreliable, 10..13)].into_iter()
            .flat_map(|(kind, numbers)| numbers.map(move |n| (kind, n)))
            .enumerate()
        {
            send_numbers(&peer, kind, n..n+1);
            handler_b.wait_for_packets(i + 1, TIMEOUT).await.unwrap();
        }

        let received = handler_b.received();
        assert_eq!(payloads(ChannelKind::Reliable, &received), expected_payloads(0..3));
        assert_eq!(payloads(ChannelKind::Unreliable, &received), expected_payloads(10..13));

        // keep-alive pings are answered, which provides RTT samples
        tokio::time::timeout(TIMEOUT, async {
            while peer.channel(ChannelKind::KeepAlive).last_acked_id() == SequenceId::ZERO {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }).await.unwrap();

        let stats = a.stats();
        assert!(stats.sends_posted >= 6);
        assert_eq!(stats.sends_failed, 0);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect() {
        let network = MemoryNetwork::new();
        let a = memory_end_point(&network, addr(1), CollectingHandler::new());

        let peer = a.peer(addr(2));
        assert_eq!(a.peers().len(), 1);

        assert!(a.disconnect(addr(2)).await);
        assert!(!peer.is_running());
        assert!(a.get_peer(addr(2)).is_none());
        assert!(!a.disconnect(addr(2)).await);
    }

    #[tokio::test]
    async fn test_shutdown_stops_peers() {
        let network = MemoryNetwork::new();
        let a = memory_end_point(&network, addr(1), CollectingHandler::new());
        let peers = (2..5).map(|n| a.peer(addr(n))).collect::<Vec<_>>();

        a.shutdown().await;
        assert!(a.peers().is_empty());
        assert!(peers.iter().all(|p| !p.is_running()));
        assert!(peers[0].send(peers[0].create_packet(ChannelKind::Unreliable)).is_err());
    }

    #[tokio::test]
    async fn test_max_packet_len() {
        let network = MemoryNetwork::new();
        let a = memory_end_point(&network, addr(1), CollectingHandler::new());
        assert_eq!(a.max_packet_len(), a.config().max_datagram_size - TAG_LEN);
        assert_eq!(a.peer(addr(2)).max_packet_len(), a.max_packet_len());
    }

    #[tokio::test]
    async fn test_discover_peer() {
        let network = MemoryNetwork::new();
        let a = memory_end_point(&network, addr(1), CollectingHandler::new());

        let peer = a.discover_peer("127.0.0.1", 9300).await.unwrap();
        assert_eq!(peer.addr(), SocketAddr::from(([127, 0, 0, 1], 9300)));
        assert!(Arc::ptr_eq(&peer, &a.get_peer(peer.addr()).unwrap()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_udp_loopback() {
        let localhost = SocketAddr::from(([127, 0, 0, 1], 0));
        let handler_b = CollectingHandler::new();
        let a = EndPoint::<BlockingLock>::bind(config(localhost, CompressionKind::Lz4), CollectingHandler::new()).await.unwrap();
        let b = EndPoint::<BlockingLock>::bind(config(localhost, CompressionKind::Lz4), handler_b.clone()).await.unwrap();
        let b_addr = b.local_addr().unwrap();
        assert_ne!(b_addr.port(), 0);

        send_numbers(&a.peer(b_addr), ChannelKind::Ordered, 0..10);

        let received = handler_b.wait_for_packets(10, TIMEOUT).await.unwrap();
        assert_eq!(payloads(ChannelKind::Ordered, &received), expected_payloads(0..10));
        assert!(received.iter().all(|p| p.from == a.local_addr().unwrap()));

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let occupied = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let config = config(occupied.local_addr().unwrap(), CompressionKind::Lz4);

        assert!(EndPoint::<BlockingLock>::bind(config, CollectingHandler::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let mut config = PeerNetConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)));
        config.worker_threads = 0;

        assert!(EndPoint::<BlockingLock>::bind(Arc::new(config), CollectingHandler::new()).await.is_err());
    }
}
