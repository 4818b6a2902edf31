pub mod header;
pub mod sequence_id;
pub mod wire_value;

use std::fmt::{Debug, Formatter};
use bytes::{Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::time::Instant;
use crate::packet::header::PacketHeader;
use crate::packet::sequence_id::SequenceId;
use crate::packet::wire_value::WireValue;

/// The delivery class of a packet. The numeric value is the tag on the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum ChannelKind {
    KeepAlive = 0,
    Ordered = 1,
    Reliable = 2,
    Unreliable = 3,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 4] = [ChannelKind::KeepAlive, ChannelKind::Ordered, ChannelKind::Reliable, ChannelKind::Unreliable];

    /// Reliable and ordered packets are acknowledged by the receiver, and their payload starts
    ///  with a flag telling acks apart from data
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, ChannelKind::Reliable | ChannelKind::Ordered)
    }
}

/// The first payload byte of reliable and ordered packets
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PayloadKind {
    Data = 0,
    Ack = 1,
    /// takes the place of a packet that was created but never sent, so an ordered receiver
    ///  does not wait for it
    Skip = 2,
}

/// A packet under construction. It is obtained from a peer (which assigns the sequence id),
///  filled with `write()` and handed back to the peer for sending.
///
/// The sequence id is reserved when the packet is created. If the packet is dropped without
///  being sent, its abandon action releases the id.
pub struct OutboundPacket {
    header: PacketHeader,
    created_at: Instant,
    payload: BytesMut,
    on_abandon: Option<Box<dyn FnOnce(SequenceId) + Send>>,
}

impl Drop for OutboundPacket {
    fn drop(&mut self) {
        if let Some(on_abandon) = self.on_abandon.take() {
            on_abandon(self.header.sequence_id);
        }
    }
}

impl Debug for OutboundPacket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "OutboundPacket{{{:?}#{}, payload:{:?}}}", self.header.kind, self.header.sequence_id, self.payload.as_ref())
    }
}

impl OutboundPacket {
    pub(crate) fn new(kind: ChannelKind, sequence_id: SequenceId) -> OutboundPacket {
        OutboundPacket {
            header: PacketHeader::new(kind, sequence_id, 0),
            created_at: Instant::now(),
            payload: BytesMut::new(),
            on_abandon: None,
        }
    }

    pub(crate) fn set_on_abandon(&mut self, action: impl FnOnce(SequenceId) + Send + 'static) {
        self.on_abandon = Some(Box::new(action));
    }

    /// called when the packet is sent
    pub(crate) fn disarm(&mut self) {
        self.on_abandon = None;
    }

    pub fn kind(&self) -> ChannelKind {
        self.header.kind
    }

    pub fn sequence_id(&self) -> SequenceId {
        self.header.sequence_id
    }

    pub fn operation_id(&self) -> u64 {
        self.header.operation_id
    }

    pub fn set_operation_id(&mut self, operation_id: u64) -> &mut Self {
        self.header.operation_id = operation_id;
        self
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn write<T: WireValue>(&mut self, value: T) -> &mut Self {
        value.put(&mut self.payload);
        self
    }

    /// appends raw bytes without a length prefix
    pub fn write_slice(&mut self, data: &[u8]) -> &mut Self {
        self.payload.extend_from_slice(data);
        self
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// the length of the packet on the wire, before compression
    pub fn encoded_len(&self) -> usize {
        PacketHeader::SERIALIZED_LEN + self.payload.len()
    }

    pub(crate) fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.header.ser(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

/// A received packet. Reading advances through the payload.
pub struct InboundPacket {
    header: PacketHeader,
    received_at: Instant,
    payload: Bytes,
    is_skip: bool,
}

impl Debug for InboundPacket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "InboundPacket{{{:?}#{}, payload:{:?}}}", self.header.kind, self.header.sequence_id, self.payload.as_ref())
    }
}

impl InboundPacket {
    pub fn decode(mut datagram: Bytes) -> anyhow::Result<InboundPacket> {
        let header = PacketHeader::deser(&mut datagram)?;
        Ok(InboundPacket {
            header,
            received_at: Instant::now(),
            payload: datagram,
            is_skip: false,
        })
    }

    /// Marks a placeholder packet: it takes up its sequence id, but is not handed to the
    ///  application
    pub(crate) fn mark_skip(&mut self) {
        self.is_skip = true;
    }

    pub fn is_skip(&self) -> bool {
        self.is_skip
    }

    pub fn kind(&self) -> ChannelKind {
        self.header.kind
    }

    pub fn sequence_id(&self) -> SequenceId {
        self.header.sequence_id
    }

    pub fn operation_id(&self) -> u64 {
        self.header.operation_id
    }

    /// the sender's creation timestamp in micros since the UNIX epoch
    pub fn created_micros(&self) -> u64 {
        self.header.created_micros
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    pub fn read<T: WireValue>(&mut self) -> anyhow::Result<T> {
        T::try_get(&mut self.payload)
    }

    /// the part of the payload that was not read yet
    pub fn remaining(&self) -> &[u8] {
        &self.payload
    }
}
