use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use anyhow::{anyhow, bail};
use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use crate::channel::Channel;
use crate::config::PeerNetConfig;
use crate::dispatch::{InFlight, PacketSink, SendRequest};
use crate::lock::{BlockingLock, LockStrategy};
use crate::packet::header::PacketHeader;
use crate::packet::sequence_id::SequenceId;
use crate::packet::{ChannelKind, InboundPacket, OutboundPacket, PayloadKind};
use crate::registry::PeerRegistry;
use crate::rtt::RttEstimator;

/// Application callback for received packets.
///
/// `on_receive` is called from a peer's tick, in arrival order per channel (sequence order for
///  the ordered channel). It should not block: ticks of different peers share the runtime's
///  threads.
pub trait PacketHandler<L: LockStrategy = BlockingLock>: Send + Sync + 'static {
    fn on_receive(&self, peer: &Arc<Peer<L>>, packet: InboundPacket);

    /// called once when a peer is dropped because it stopped acknowledging keep-alive pings
    fn on_peer_expired(&self, _addr: SocketAddr) {}
}

struct Timing {
    rtt: RttEstimator,
    tick_interval: Duration,
}

/// The channels of a single remote address, and the periodic tick that drives them.
///
/// A peer is *active* from creation until it is closed, either explicitly or because it stopped
///  acknowledging keep-alive pings. A closed peer ignores received datagrams and does not tick;
///  it does not become active again.
pub struct Peer<L: LockStrategy = BlockingLock> {
    addr: SocketAddr,
    config: Arc<PeerNetConfig>,
    channels: [Channel<L>; 4],
    timing: L::Lock<Timing>,
    running: AtomicBool,
    tick_task: Mutex<Option<JoinHandle<()>>>,
    sink: Arc<dyn PacketSink>,
    handler: Arc<dyn PacketHandler<L>>,
    registry: Weak<PeerRegistry<L>>,
    myself: Weak<Peer<L>>,
}

impl<L: LockStrategy> Drop for Peer<L> {
    fn drop(&mut self) {
        if let Some(tick_task) = self.lock_tick_task().take() {
            tick_task.abort();
        }
    }
}

impl<L: LockStrategy> Peer<L> {
    pub(crate) fn new(
        addr: SocketAddr,
        config: Arc<PeerNetConfig>,
        sink: Arc<dyn PacketSink>,
        handler: Arc<dyn PacketHandler<L>>,
        registry: Weak<PeerRegistry<L>>,
    ) -> Arc<Peer<L>> {
        let window = config.max_reorder_window;
        let timing = Timing {
            rtt: RttEstimator::new(config.initial_rtt, config.rtt_smoothing),
            tick_interval: config.initial_rtt.max(config.min_tick_interval),
        };

        Arc::new_cyclic(|myself| Peer {
            addr,
            channels: ChannelKind::ALL.map(|kind| Channel::new(kind, window)),
            timing: L::new_lock(timing),
            running: AtomicBool::new(true),
            tick_task: Mutex::new(None),
            config,
            sink,
            handler,
            registry,
            myself: myself.clone(),
        })
    }

    /// Spawns the tick task. The task holds only a weak reference to the peer, so it does not
    ///  keep the peer alive.
    pub(crate) fn start_ticking(&self, runtime: &Handle) {
        let peer = self.myself.clone();
        let tick_task = runtime.spawn(async move {
            loop {
                let interval = match peer.upgrade() {
                    Some(peer) if peer.is_running() => peer.tick_interval(),
                    _ => break,
                };
                tokio::time::sleep(interval).await;

                match peer.upgrade() {
                    Some(peer) if peer.is_running() => peer.on_tick(),
                    _ => break,
                }
            }
            trace!("tick task terminated");
        });

        if let Some(prev) = self.lock_tick_task().replace(tick_task) {
            prev.abort();
        }
    }

    fn lock_tick_task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.tick_task.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn channel(&self, kind: ChannelKind) -> &Channel<L> {
        &self.channels[u16::from(kind) as usize]
    }

    pub fn rtt(&self) -> Duration {
        L::with_lock(&self.timing, |timing| timing.rtt.average())
    }

    pub fn tick_interval(&self) -> Duration {
        L::with_lock(&self.timing, |timing| timing.tick_interval)
    }

    /// the maximum value for [OutboundPacket::encoded_len] that [Peer::send] accepts
    pub fn max_packet_len(&self) -> usize {
        self.sink.max_packet_len()
    }

    /// Creates a packet with the next sequence id of the given channel.
    ///
    /// If the packet is dropped without being sent (or `send` rejects it), the id is released:
    ///  acknowledged channels send a placeholder in its place, so the receiver does not wait
    ///  for it.
    pub fn create_packet(&self, kind: ChannelKind) -> OutboundPacket {
        let mut packet = self.channel(kind).new_packet();

        let peer = self.myself.clone();
        packet.set_on_abandon(move |sequence_id| {
            if let Some(peer) = peer.upgrade() {
                peer.release_reserved(kind, sequence_id);
            }
        });
        packet
    }

    fn release_reserved(&self, kind: ChannelKind, sequence_id: SequenceId) {
        let channel = self.channel(kind);
        if !kind.is_acknowledged() {
            channel.forget(sequence_id);
            return;
        }
        if !self.is_running() {
            return;
        }

        debug!("peer {:?}: {:?} packet #{} was not sent - sending a placeholder", self.addr, kind, sequence_id);
        let datagram = channel.commit(channel.new_skip_packet(sequence_id));
        self.post_retained(kind, sequence_id, datagram);
    }

    /// Sends a packet created by [Peer::create_packet]. A rejected packet's sequence id is
    ///  released.
    pub fn send(&self, packet: OutboundPacket) -> anyhow::Result<()> {
        if !self.is_running() {
            bail!("peer {:?} is closed", self.addr);
        }
        if packet.kind() == ChannelKind::KeepAlive {
            bail!("keep-alive packets are sent by the peer's tick");
        }
        if packet.encoded_len() > self.max_packet_len() {
            bail!("packet of length {} exceeds the maximum packet length of {}", packet.encoded_len(), self.max_packet_len());
        }

        let kind = packet.kind();
        let sequence_id = packet.sequence_id();
        let datagram = self.channel(kind).commit(packet);

        let token = if kind == ChannelKind::Unreliable {
            let peer = self.myself.clone();
            InFlight::on_release(move || {
                if let Some(peer) = peer.upgrade() {
                    peer.channel(ChannelKind::Unreliable).on_send_completed(sequence_id);
                }
            })
        }
        else {
            InFlight::untracked()
        };

        trace!("peer {:?}: sending {:?} packet #{}", self.addr, kind, sequence_id);
        self.sink.post_send(SendRequest {
            to: self.addr,
            kind,
            sequence_id,
            datagram,
            token,
        });
        Ok(())
    }

    /// sends a packet that is not retained for retransmission
    fn send_internal(&self, packet: OutboundPacket) {
        self.sink.post_send(SendRequest {
            to: self.addr,
            kind: packet.kind(),
            sequence_id: packet.sequence_id(),
            datagram: packet.encode(),
            token: InFlight::untracked(),
        });
    }

    /// posts a datagram that the channel retains, so it is not tracked in flight
    fn post_retained(&self, kind: ChannelKind, sequence_id: SequenceId, datagram: Bytes) {
        trace!("peer {:?}: posting {:?} packet #{}", self.addr, kind, sequence_id);

        self.sink.post_send(SendRequest {
            to: self.addr,
            kind,
            sequence_id,
            datagram,
            token: InFlight::untracked(),
        });
    }

    /// Handles a decompressed datagram from this peer's address
    pub fn receive_datagram(&self, datagram: Bytes) {
        if !self.is_running() {
            trace!("peer {:?} is closed - ignoring datagram", self.addr);
            return;
        }

        let packet = match InboundPacket::decode(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("peer {:?}: dropping packet with invalid header: {}", self.addr, e);
                return;
            }
        };
        trace!("peer {:?}: received {:?}", self.addr, packet);

        let result = match packet.kind() {
            ChannelKind::KeepAlive => self.on_keep_alive(packet),
            ChannelKind::Ordered | ChannelKind::Reliable => self.on_acknowledged(packet),
            ChannelKind::Unreliable => {
                self.channel(ChannelKind::Unreliable).receive(packet);
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("peer {:?}: dropping malformed packet: {}", self.addr, e);
        }
    }

    fn on_keep_alive(&self, mut packet: InboundPacket) -> anyhow::Result<()> {
        let channel = self.channel(ChannelKind::KeepAlive);

        if packet.read::<bool>()? {
            let highest_received_by_peer = SequenceId::from_raw(packet.read::<u64>()?);

            // answered even if it is a duplicate: the previous answer may have been lost
            self.send_internal(channel.new_ack_packet(packet.sequence_id()));
            channel.receive(packet);

            // the peer has seen our pings up to this id, which acknowledges them even if the
            //  acks got lost
            if highest_received_by_peer > SequenceId::ZERO {
                channel.ack(highest_received_by_peer);
            }
        }
        else if let Some(rtt) = channel.keep_alive_ack(packet.sequence_id(), Instant::now()) {
            let average = L::with_lock(&self.timing, |timing| {
                timing.rtt.add_sample(rtt);
                timing.rtt.average()
            });
            trace!("peer {:?}: RTT sample {:?}, average {:?}", self.addr, rtt, average);
        }
        Ok(())
    }

    fn on_acknowledged(&self, mut packet: InboundPacket) -> anyhow::Result<()> {
        let kind = packet.kind();
        let channel = self.channel(kind);

        let raw_payload_kind = packet.read::<u8>()?;
        let payload_kind = PayloadKind::try_from(raw_payload_kind)
            .map_err(|_| anyhow!("invalid payload kind {}", raw_payload_kind))?;

        if payload_kind == PayloadKind::Ack {
            let acked_id = packet.sequence_id();
            let num_missing = packet.read::<u16>()?;
            let missing = (0..num_missing)
                .map(|_| packet.read::<u64>().map(SequenceId::from_raw))
                .collect::<anyhow::Result<Vec<_>>>()?;

            if let Some((sequence_id, datagram)) = channel.ack(acked_id) {
                self.post_retained(kind, sequence_id, datagram);
            }
            if !missing.is_empty() {
                debug!("peer {:?}: {:?} packets {:?} are reported missing", self.addr, kind, missing);
                for (sequence_id, datagram) in channel.resend(&missing) {
                    self.post_retained(kind, sequence_id, datagram);
                }
            }
        }
        else {
            if payload_kind == PayloadKind::Skip {
                trace!("peer {:?}: {:?} packet #{} is a placeholder", self.addr, kind, packet.sequence_id());
                packet.mark_skip();
            }
            channel.receive(packet);

            // acknowledging everything received so far also covers duplicates whose ack was lost
            let acked_id = channel.highest_in_id();
            if acked_id > SequenceId::ZERO {
                let mut ack = channel.new_ack_packet(acked_id);
                ack.write(0u16);
                self.send_internal(ack);
            }
        }
        Ok(())
    }

    /// The periodic work for this peer: liveness check, RTT based interval, keep-alive ping,
    ///  negative acks, and handing received packets to the application
    pub fn on_tick(&self) {
        let num_unacknowledged = self.channel(ChannelKind::KeepAlive).outstanding_count();
        if num_unacknowledged > self.config.keep_alive_ceiling {
            warn!("peer {:?}: {} keep-alive pings are unacknowledged - considering the peer unreachable", self.addr, num_unacknowledged);
            self.expire();
            return;
        }

        let tick_interval = L::with_lock(&self.timing, |timing| {
            timing.tick_interval = timing.rtt.tick_interval(self.config.min_tick_interval);
            timing.tick_interval
        });
        trace!("peer {:?}: tick, next in {:?}", self.addr, tick_interval);

        self.send_ping();
        self.send_negative_ack();

        let Some(myself) = self.myself.upgrade() else {
            return;
        };
        for kind in [ChannelKind::Ordered, ChannelKind::Reliable, ChannelKind::Unreliable] {
            for packet in self.channel(kind).drain_ready() {
                self.handler.on_receive(&myself, packet);
            }
        }
    }

    fn send_ping(&self) {
        let channel = self.channel(ChannelKind::KeepAlive);
        let mut ping = channel.new_packet();
        ping.write(true)
            .write(channel.highest_in_id().to_raw());

        let sequence_id = ping.sequence_id();
        let datagram = channel.commit(ping);
        self.post_retained(ChannelKind::KeepAlive, sequence_id, datagram);
    }

    /// Lists ids the ordered channel is missing, as many as fit into a single packet
    fn send_negative_ack(&self) {
        let channel = self.channel(ChannelKind::Ordered);
        let mut missing = channel.missing_ids();
        if missing.is_empty() {
            return;
        }

        let fixed_len = PacketHeader::SERIALIZED_LEN + 1 + size_of::<u16>();
        let max_fitting = self.max_packet_len().saturating_sub(fixed_len) / size_of::<u64>();
        missing.truncate(self.config.max_naks_per_packet.min(max_fitting));

        trace!("peer {:?}: requesting missing packets {:?}", self.addr, missing);
        let mut ack = channel.new_ack_packet(channel.highest_in_id());
        ack.write(missing.len() as u16);
        for id in missing {
            ack.write(id.to_raw());
        }
        self.send_internal(ack);
    }

    fn expire(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.addr);
        }
        info!("peer {:?} expired", self.addr);
        self.handler.on_peer_expired(self.addr);
    }

    /// Stops the peer without waiting for a tick that may currently be running
    pub fn close(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            debug!("closing peer {:?}", self.addr);
        }
        if let Some(tick_task) = self.lock_tick_task().take() {
            tick_task.abort();
        }
    }

    /// Stops the peer. When this returns, no tick is running for this peer, and none will run
    ///  in the future.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Release);

        let tick_task = self.lock_tick_task().take();
        if let Some(tick_task) = tick_task {
            tick_task.abort();
            let _ = tick_task.await;
        }
        debug!("peer {:?} stopped", self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::MockPacketSink;
    use crate::lock::SpinLock;
    use crate::test_util::{decode_request, CollectingHandler, RecordingSink};
    use rstest::rstest;

    fn addr() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 2], 9100))
    }

    fn config() -> Arc<PeerNetConfig> {
        let mut config = PeerNetConfig::new(SocketAddr::from(([10, 0, 0, 1], 9100)));
        config.initial_rtt = Duration::from_millis(100);
        config.min_tick_interval = Duration::from_millis(20);
        config.keep_alive_ceiling = 3;
        Arc::new(config)
    }

    fn new_peer<L: LockStrategy>(sink: Arc<dyn PacketSink>, handler: Arc<dyn PacketHandler<L>>) -> Arc<Peer<L>> {
        Peer::new(addr(), config(), sink, handler, Weak::new())
    }

    /// builds datagrams the way the remote side would
    fn remote_data(remote: &Channel, payload: u32) -> Bytes {
        let mut packet = remote.new_packet();
        packet.write(payload);
        remote.commit(packet)
    }

    fn ack_datagram(kind: ChannelKind, acked: u64, missing: &[u64]) -> Bytes {
        let mut packet = OutboundPacket::new(kind, SequenceId::from_raw(acked));
        packet.write(true).write(missing.len() as u16);
        for id in missing {
            packet.write(*id);
        }
        packet.encode()
    }

    #[test]
    fn test_send_rejects_oversized() {
        let mut sink = MockPacketSink::new();
        sink.expect_max_packet_len().return_const(100usize);
        sink.expect_post_send().never();

        let peer = new_peer::<BlockingLock>(Arc::new(sink), CollectingHandler::new());
        let mut packet = peer.create_packet(ChannelKind::Unreliable);
        packet.write_slice(&[0; 100]);
        assert!(peer.send(packet).is_err());
    }

    #[test]
    fn test_send_posts_request() {
        let mut sink = MockPacketSink::new();
        sink.expect_max_packet_len().return_const(1000usize);
        sink.expect_post_send()
            .once()
            .withf(|request| request.to == addr() && request.kind == ChannelKind::Reliable && request.sequence_id == SequenceId::FIRST)
            .return_const(());

        let peer = new_peer::<BlockingLock>(Arc::new(sink), CollectingHandler::new());
        let mut packet = peer.create_packet(ChannelKind::Reliable);
        packet.write(5u32);
        peer.send(packet).unwrap();
        assert_eq!(peer.channel(ChannelKind::Reliable).outstanding_count(), 1);
    }

    #[test]
    fn test_unsent_ordered_packets_do_not_stall_receiver() {
        let sink_a = RecordingSink::new(200);
        let a = new_peer::<BlockingLock>(sink_a.clone(), CollectingHandler::new());
        let handler_b = CollectingHandler::new();
        let b = new_peer::<BlockingLock>(RecordingSink::new(200), handler_b.clone());

        let mut oversized = a.create_packet(ChannelKind::Ordered);
        oversized.write_slice(&[0; 500]);
        assert!(a.send(oversized).is_err());
        for n in 0..3u32 {
            let mut packet = a.create_packet(ChannelKind::Ordered);
            packet.write(n);
            a.send(packet).unwrap();
        }
        drop(a.create_packet(ChannelKind::Ordered));
        let mut packet = a.create_packet(ChannelKind::Ordered);
        packet.write(3u32);
        a.send(packet).unwrap();

        let requests = sink_a.take_requests();
        assert_eq!(requests.iter().map(|r| r.sequence_id.to_raw()).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5, 6]);
        for request in requests {
            b.receive_datagram(request.datagram.clone());
        }
        b.on_tick();

        let received = handler_b.received();
        assert_eq!(received.iter().map(|p| p.sequence_id.to_raw()).collect::<Vec<_>>(), vec![2, 3, 4, 6]);
        assert_eq!(received[3].payload, 3u32.to_be_bytes().to_vec());
        assert!(b.channel(ChannelKind::Ordered).missing_ids().is_empty());
        assert_eq!(b.channel(ChannelKind::Ordered).highest_in_id(), SequenceId::from_raw(6));
    }

    #[test]
    fn test_placeholder_is_resent_on_negative_ack() {
        let sink = RecordingSink::new(200);
        let peer = new_peer::<BlockingLock>(sink.clone(), CollectingHandler::new());
        drop(peer.create_packet(ChannelKind::Ordered));
        peer.send(peer.create_packet(ChannelKind::Ordered)).unwrap();
        sink.take_requests();

        peer.receive_datagram(ack_datagram(ChannelKind::Ordered, 0, &[1]));
        let mut resent = sink.take_requests().iter()
            .map(decode_request)
            .find(|p| p.sequence_id() == SequenceId::FIRST)
            .unwrap();
        assert_eq!(resent.read::<u8>().unwrap(), u8::from(PayloadKind::Skip));
    }

    #[test]
    fn test_application_keep_alive_is_rejected() {
        let sink = RecordingSink::new(1000);
        let peer = new_peer::<BlockingLock>(sink.clone(), CollectingHandler::new());

        assert!(peer.send(peer.create_packet(ChannelKind::KeepAlive)).is_err());
        assert_eq!(peer.channel(ChannelKind::KeepAlive).outstanding_count(), 0);
        assert!(sink.take_requests().is_empty());
    }

    #[test]
    fn test_closed_peer() {
        let sink = RecordingSink::new(1000);
        let peer = new_peer::<BlockingLock>(sink.clone(), CollectingHandler::new());
        peer.close();

        let remote = Channel::<BlockingLock>::new(ChannelKind::Unreliable, 100);
        peer.receive_datagram(remote_data(&remote, 1));
        assert_eq!(peer.channel(ChannelKind::Unreliable).highest_in_id(), SequenceId::ZERO);

        assert!(peer.send(peer.create_packet(ChannelKind::Unreliable)).is_err());
        assert!(sink.take_requests().is_empty());
    }

    #[test]
    fn test_unreliable_evicted_after_send() {
        let sink = RecordingSink::new(1000);
        let peer = new_peer::<BlockingLock>(sink.clone(), CollectingHandler::new());

        peer.send(peer.create_packet(ChannelKind::Unreliable)).unwrap();
        assert_eq!(peer.channel(ChannelKind::Unreliable).outstanding_count(), 1);

        for request in sink.take_requests() {
            request.token.release();
        }
        assert_eq!(peer.channel(ChannelKind::Unreliable).outstanding_count(), 0);
    }

    #[test]
    fn test_ping_is_answered() {
        let sink = RecordingSink::new(1000);
        let peer = new_peer::<BlockingLock>(sink.clone(), CollectingHandler::new());

        let mut ping = OutboundPacket::new(ChannelKind::KeepAlive, SequenceId::from_raw(4));
        ping.write(true).write(0u64);
        peer.receive_datagram(ping.encode());

        let requests = sink.take_requests();
        assert_eq!(requests.len(), 1);
        let mut ack = decode_request(&requests[0]);
        assert_eq!(ack.kind(), ChannelKind::KeepAlive);
        assert_eq!(ack.sequence_id(), SequenceId::from_raw(4));
        assert!(!ack.read::<bool>().unwrap());
        assert!(ack.remaining().is_empty());

        assert_eq!(peer.channel(ChannelKind::KeepAlive).highest_in_id(), SequenceId::from_raw(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_ack_updates_rtt() {
        let sink = RecordingSink::new(1000);
        let peer = new_peer::<BlockingLock>(sink.clone(), CollectingHandler::new());

        peer.on_tick();
        let ping = decode_request(&sink.take_requests()[0]);
        assert_eq!(ping.kind(), ChannelKind::KeepAlive);

        tokio::time::advance(Duration::from_millis(40)).await;
        let mut ack = OutboundPacket::new(ChannelKind::KeepAlive, ping.sequence_id());
        ack.write(false);
        peer.receive_datagram(ack.encode());

        // 100 - 100/6 + 40/6
        let expected_millis = 100.0 - 100.0 / 6.0 + 40.0 / 6.0;
        assert!((peer.rtt().as_secs_f64() * 1000.0 - expected_millis).abs() < 1e-3);
        assert_eq!(peer.channel(ChannelKind::KeepAlive).outstanding_count(), 0);

        peer.on_tick();
        assert_eq!(peer.tick_interval(), peer.rtt());
    }

    #[test]
    fn test_ping_carries_highest_received_id() {
        let sink = RecordingSink::new(1000);
        let peer = new_peer::<BlockingLock>(sink.clone(), CollectingHandler::new());

        let mut remote_ping = OutboundPacket::new(ChannelKind::KeepAlive, SequenceId::from_raw(7));
        remote_ping.write(true).write(0u64);
        peer.receive_datagram(remote_ping.encode());
        sink.take_requests();

        peer.on_tick();
        let mut ping = decode_request(&sink.take_requests()[0]);
        assert!(ping.read::<bool>().unwrap());
        assert_eq!(ping.read::<u64>().unwrap(), 7);
    }

    #[test]
    fn test_ping_acks_own_pings() {
        let sink = RecordingSink::new(1000);
        let peer = new_peer::<BlockingLock>(sink.clone(), CollectingHandler::new());
        for _ in 0..3 {
            peer.on_tick();
        }
        assert_eq!(peer.channel(ChannelKind::KeepAlive).outstanding_count(), 3);

        let mut remote_ping = OutboundPacket::new(ChannelKind::KeepAlive, SequenceId::FIRST);
        remote_ping.write(true).write(2u64);
        peer.receive_datagram(remote_ping.encode());
        assert_eq!(peer.channel(ChannelKind::KeepAlive).outstanding_count(), 1);
    }

    #[rstest]
    #[case::reliable(ChannelKind::Reliable, vec![1, 3, 2], vec![1, 3, 3])]
    #[case::ordered(ChannelKind::Ordered, vec![1, 3, 2], vec![1, 1, 3])]
    fn test_data_is_acked(#[case] kind: ChannelKind, #[case] order: Vec<usize>, #[case] expected_acks: Vec<u64>) {
        let sink = RecordingSink::new(1000);
        let peer = new_peer::<BlockingLock>(sink.clone(), CollectingHandler::new());

        let remote = Channel::<BlockingLock>::new(kind, 100);
        let datagrams = (1..=3).map(|n| remote_data(&remote, n)).collect::<Vec<_>>();
        for n in order {
            peer.receive_datagram(datagrams[n - 1].clone());
        }

        let acks = sink.take_requests().iter()
            .map(|request| {
                let mut ack = decode_request(request);
                assert_eq!(ack.kind(), kind);
                assert!(ack.read::<bool>().unwrap());
                assert_eq!(ack.read::<u16>().unwrap(), 0);
                ack.sequence_id().to_raw()
            })
            .collect::<Vec<_>>();
        assert_eq!(acks, expected_acks);
    }

    #[test]
    fn test_tick_delivers_to_handler() {
        let sink = RecordingSink::new(1000);
        let handler = CollectingHandler::new();
        let peer = new_peer::<SpinLock>(sink.clone(), handler.clone());

        let remote = Channel::<BlockingLock>::new(ChannelKind::Ordered, 100);
        let datagrams = (1..=3).map(|n| remote_data(&remote, n * 10)).collect::<Vec<_>>();
        peer.receive_datagram(datagrams[2].clone());
        peer.receive_datagram(datagrams[0].clone());
        assert!(handler.received().is_empty());

        peer.on_tick();
        assert_eq!(handler.received().iter().map(|p| p.sequence_id.to_raw()).collect::<Vec<_>>(), vec![1]);

        peer.receive_datagram(datagrams[1].clone());
        peer.on_tick();

        let received = handler.received();
        assert_eq!(received.iter().map(|p| p.sequence_id.to_raw()).collect::<Vec<_>>(), vec![1, 2, 3]);
        // the data flag was consumed, the payload is the application's
        assert_eq!(received[1].payload, 20u32.to_be_bytes().to_vec());
        assert!(received.iter().all(|p| p.from == addr() && p.kind == ChannelKind::Ordered));
    }

    #[test]
    fn test_tick_sends_negative_ack() {
        let sink = RecordingSink::new(1000);
        let peer = new_peer::<BlockingLock>(sink.clone(), CollectingHandler::new());

        let remote = Channel::<BlockingLock>::new(ChannelKind::Ordered, 100);
        let datagrams = (1..=5).map(|n| remote_data(&remote, n)).collect::<Vec<_>>();
        for n in [1, 3, 5] {
            peer.receive_datagram(datagrams[n - 1].clone());
        }
        sink.take_requests();

        peer.on_tick();
        let mut nak = sink.take_requests().iter()
            .map(decode_request)
            .find(|p| p.kind() == ChannelKind::Ordered)
            .unwrap();
        assert_eq!(nak.sequence_id(), SequenceId::FIRST);
        assert!(nak.read::<bool>().unwrap());
        assert_eq!(nak.read::<u16>().unwrap(), 2);
        assert_eq!(nak.read::<u64>().unwrap(), 2);
        assert_eq!(nak.read::<u64>().unwrap(), 4);
    }

    #[test]
    fn test_negative_ack_triggers_resend() {
        let sink = RecordingSink::new(1000);
        let peer = new_peer::<BlockingLock>(sink.clone(), CollectingHandler::new());

        for n in 0..5u32 {
            let mut packet = peer.create_packet(ChannelKind::Ordered);
            packet.write(n);
            peer.send(packet).unwrap();
        }
        let sent = sink.take_requests();

        peer.receive_datagram(ack_datagram(ChannelKind::Ordered, 1, &[2, 4]));

        let resent = sink.take_requests().iter()
            .map(|request| request.sequence_id.to_raw())
            .collect::<Vec<_>>();
        // the latest packet because it is not covered by the ack, plus the missing ones
        assert_eq!(resent, vec![5, 2, 4]);
        assert_eq!(peer.channel(ChannelKind::Ordered).last_acked_id(), SequenceId::FIRST);
        assert_eq!(sent.len(), 5);
    }

    #[test]
    fn test_malformed_ack_is_dropped() {
        let sink = RecordingSink::new(1000);
        let peer = new_peer::<BlockingLock>(sink.clone(), CollectingHandler::new());
        for _ in 0..3 {
            peer.send(peer.create_packet(ChannelKind::Reliable)).unwrap();
        }
        sink.take_requests();

        // announces two missing ids, but contains only one
        let mut ack = OutboundPacket::new(ChannelKind::Reliable, SequenceId::from_raw(2));
        ack.write(true).write(2u16).write(1u64);
        peer.receive_datagram(ack.encode());

        assert!(sink.take_requests().is_empty());
        assert_eq!(peer.channel(ChannelKind::Reliable).last_acked_id(), SequenceId::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_after_keep_alive_ceiling() {
        let sink = RecordingSink::new(1000);
        let handler = CollectingHandler::new();
        let registry = PeerRegistry::<BlockingLock>::new(config(), sink.clone(), handler.clone(), Handle::current());

        let peer = registry.get_or_create(addr());
        assert!(peer.is_running());

        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(!peer.is_running());
        assert!(registry.get(addr()).is_none());
        assert_eq!(handler.expired(), vec![addr()]);

        // ceiling + 1 pings went out unanswered before the peer was given up on
        let num_pings = sink.take_requests().iter()
            .filter(|r| r.kind == ChannelKind::KeepAlive)
            .count();
        assert_eq!(num_pings, 4);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(sink.take_requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_ticks() {
        let sink = RecordingSink::new(1000);
        let peer = new_peer::<BlockingLock>(sink.clone(), CollectingHandler::new());
        peer.start_ticking(&Handle::current());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!sink.take_requests().is_empty());

        peer.stop().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(sink.take_requests().is_empty());
        assert!(!peer.is_running());
    }
}
