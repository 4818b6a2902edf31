pub mod reorder_buffer;

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::channel::reorder_buffer::ReorderBuffer;
use crate::lock::{BlockingLock, LockStrategy};
use crate::packet::sequence_id::SequenceId;
use crate::packet::{ChannelKind, InboundPacket, OutboundPacket, PayloadKind};

struct Outstanding {
    created_at: Instant,
    /// `None` until the packet was handed over for sending
    datagram: Option<Bytes>,
}

struct OutboundState {
    next_out_id: SequenceId,
    last_acked_id: SequenceId,
    outstanding: BTreeMap<SequenceId, Outstanding>,
}

impl OutboundState {
    fn highest_issued_id(&self) -> SequenceId {
        self.next_out_id.prev()
            .unwrap_or(SequenceId::ZERO)
    }

    /// Applies a cumulative ack, returning false if it was stale or out of range
    fn prune(&mut self, kind: ChannelKind, id: SequenceId) -> bool {
        if id <= self.last_acked_id {
            trace!("{:?}: stale ack #{} (already acked up to #{})", kind, id, self.last_acked_id);
            return false;
        }
        if id > self.highest_issued_id() {
            warn!("{:?}: received ack for #{}, but the highest id ever sent is #{} - ignoring", kind, id, self.highest_issued_id());
            return false;
        }

        self.last_acked_id = id;
        self.outstanding = self.outstanding.split_off(&id.next());
        true
    }
}

enum Delivery {
    KeepAlive,
    Unreliable,
    Reliable,
    Ordered(ReorderBuffer),
}

struct InboundState {
    /// highest id received (unordered kinds) or delivered without gaps (ordered)
    highest_in_id: SequenceId,
    delivery: Delivery,
    /// packets accepted for the application, waiting for the peer's next tick
    ready: VecDeque<InboundPacket>,
}

/// Protocol state of one delivery class towards a single peer.
///
/// Outbound and inbound state are guarded separately, so sending and receiving on the same
///  channel do not contend with each other. The channel does no I/O: operations return the
///  datagrams that need to go out, and the peer posts them.
pub struct Channel<L: LockStrategy = BlockingLock> {
    kind: ChannelKind,
    outbound: L::Lock<OutboundState>,
    inbound: L::Lock<InboundState>,
}

impl<L: LockStrategy> Channel<L> {
    pub fn new(kind: ChannelKind, max_reorder_window: u64) -> Channel<L> {
        let delivery = match kind {
            ChannelKind::KeepAlive => Delivery::KeepAlive,
            ChannelKind::Unreliable => Delivery::Unreliable,
            ChannelKind::Reliable => Delivery::Reliable,
            ChannelKind::Ordered => Delivery::Ordered(ReorderBuffer::new(max_reorder_window)),
        };

        Channel {
            kind,
            outbound: L::new_lock(OutboundState {
                next_out_id: SequenceId::FIRST,
                last_acked_id: SequenceId::ZERO,
                outstanding: Default::default(),
            }),
            inbound: L::new_lock(InboundState {
                highest_in_id: SequenceId::ZERO,
                delivery,
                ready: Default::default(),
            }),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Reserves the next sequence id and registers it as outstanding. For acknowledged kinds,
    ///  the data flag is written to the payload.
    pub fn new_packet(&self) -> OutboundPacket {
        let mut packet = L::with_lock(&self.outbound, |outbound| {
            let id = outbound.next_out_id;
            outbound.next_out_id = id.next();

            let packet = OutboundPacket::new(self.kind, id);
            outbound.outstanding.insert(id, Outstanding {
                created_at: packet.created_at(),
                datagram: None,
            });
            packet
        });

        if self.kind.is_acknowledged() {
            packet.write(u8::from(PayloadKind::Data));
        }
        packet
    }

    /// An ack doesn't consume a sequence id: its header carries the id that is acknowledged
    pub fn new_ack_packet(&self, acked_id: SequenceId) -> OutboundPacket {
        let mut packet = OutboundPacket::new(self.kind, acked_id);
        if self.kind == ChannelKind::KeepAlive {
            packet.write(false);
        }
        else {
            packet.write(u8::from(PayloadKind::Ack));
        }
        packet
    }

    /// a placeholder for a reserved id that is not going to be sent
    pub fn new_skip_packet(&self, sequence_id: SequenceId) -> OutboundPacket {
        let mut packet = OutboundPacket::new(self.kind, sequence_id);
        packet.write(u8::from(PayloadKind::Skip));
        packet
    }

    /// Encodes a packet for sending, keeping the datagram for resubmission until it is acked
    pub fn commit(&self, mut packet: OutboundPacket) -> Bytes {
        packet.disarm();
        let datagram = packet.encode();
        L::with_lock(&self.outbound, |outbound| {
            match outbound.outstanding.get_mut(&packet.sequence_id()) {
                Some(entry) => entry.datagram = Some(datagram.clone()),
                None => debug!("{:?}: packet #{} was acknowledged before it was sent", self.kind, packet.sequence_id()),
            }
        });
        datagram
    }

    /// Registers a received packet. Returns false if it was a duplicate or stale and was
    ///  discarded.
    ///
    /// Accepted packets of the data kinds become available through [Channel::drain_ready]: in
    ///  arrival order for reliable and unreliable, in sequence order for ordered channels.
    pub fn receive(&self, packet: InboundPacket) -> bool {
        L::with_lock(&self.inbound, |inbound| {
            let id = packet.sequence_id();

            match &mut inbound.delivery {
                Delivery::Ordered(reorder_buffer) => {
                    reorder_buffer.on_packet(&mut inbound.highest_in_id, packet, &mut inbound.ready)
                }
                unordered => {
                    if id <= inbound.highest_in_id {
                        trace!("{:?}: discarding packet #{}, already received up to #{}", self.kind, id, inbound.highest_in_id);
                        return false;
                    }
                    inbound.highest_in_id = id;
                    if !matches!(unordered, Delivery::KeepAlive) {
                        inbound.ready.push_back(packet);
                    }
                    true
                }
            }
        })
    }

    /// Handles the reply to one of our keep-alive pings, returning the round trip time if the
    ///  ping was still outstanding
    pub fn keep_alive_ack(&self, id: SequenceId, now: Instant) -> Option<Duration> {
        L::with_lock(&self.outbound, |outbound| {
            let rtt = outbound.outstanding.get(&id)
                .map(|entry| now.saturating_duration_since(entry.created_at));
            outbound.prune(self.kind, id);
            rtt
        })
    }

    /// Cumulative ack: all packets up to and including `id` arrived. If the most recently sent
    ///  packet is still unacknowledged afterwards, its datagram is returned for resubmission.
    pub fn ack(&self, id: SequenceId) -> Option<(SequenceId, Bytes)> {
        L::with_lock(&self.outbound, |outbound| {
            if !outbound.prune(self.kind, id) {
                return None;
            }
            if !self.kind.is_acknowledged() {
                return None;
            }

            let latest = outbound.highest_issued_id();
            let resubmit = outbound.outstanding.get(&latest)
                .and_then(|entry| entry.datagram.clone())
                .map(|datagram| (latest, datagram));
            if resubmit.is_some() {
                debug!("{:?}: ack #{} does not cover #{} - resubmitting", self.kind, id, latest);
            }
            resubmit
        })
    }

    /// the datagrams for those of the requested ids that are still outstanding
    pub fn resend(&self, ids: &[SequenceId]) -> Vec<(SequenceId, Bytes)> {
        L::with_lock(&self.outbound, |outbound| {
            ids.iter()
                .filter_map(|id| {
                    let datagram = outbound.outstanding.get(id)
                        .and_then(|entry| entry.datagram.clone());
                    if datagram.is_none() {
                        trace!("{:?}: requested packet #{} is no longer available for resending", self.kind, id);
                    }
                    datagram.map(|datagram| (*id, datagram))
                })
                .collect()
        })
    }

    /// Releases a reserved id that will never be sent
    pub fn forget(&self, id: SequenceId) {
        L::with_lock(&self.outbound, |outbound| {
            if let Some(entry) = outbound.outstanding.remove(&id) {
                if entry.datagram.is_some() {
                    warn!("{:?}: forgetting packet #{} although it was sent", self.kind, id);
                }
            }
        });
    }

    /// Unreliable packets are not acknowledged, so they are evicted once the transport is done
    ///  with them. Earlier ids are evicted too: they were either sent, or never will be.
    pub fn on_send_completed(&self, id: SequenceId) {
        if self.kind != ChannelKind::Unreliable {
            return;
        }
        L::with_lock(&self.outbound, |outbound| {
            outbound.outstanding = outbound.outstanding.split_off(&id.next());
        });
    }

    pub fn missing_ids(&self) -> Vec<SequenceId> {
        L::with_lock(&self.inbound, |inbound| match &inbound.delivery {
            Delivery::Ordered(reorder_buffer) => reorder_buffer.missing_ids(),
            _ => vec![],
        })
    }

    /// packets for the application, without placeholders for packets that were never sent
    pub fn drain_ready(&self) -> Vec<InboundPacket> {
        L::with_lock(&self.inbound, |inbound| {
            inbound.ready.drain(..)
                .filter(|packet| !packet.is_skip())
                .collect()
        })
    }

    pub fn outstanding_count(&self) -> usize {
        L::with_lock(&self.outbound, |outbound| outbound.outstanding.len())
    }

    pub fn highest_in_id(&self) -> SequenceId {
        L::with_lock(&self.inbound, |inbound| inbound.highest_in_id)
    }

    pub fn last_acked_id(&self) -> SequenceId {
        L::with_lock(&self.outbound, |outbound| outbound.last_acked_id)
    }
}
