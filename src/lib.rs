//! A datagram transport that multiplexes several delivery guarantees per remote peer over a
//!  single UDP socket, driven by a completion-based dispatch engine with pre-allocated buffers.
//!
//! ## Delivery classes
//!
//! Each peer has one *channel* per delivery class:
//! * *Unreliable*: packets are delivered in arrival order, duplicates and packets older than the
//!    newest one received are dropped. No acknowledgement, no retransmission.
//! * *Reliable*: like *Unreliable*, but packets are acknowledged, and the sender resubmits its
//!    most recent packet when an ack shows that it is still outstanding.
//! * *Ordered*: packets are acknowledged and delivered in sequence order. Packets arriving
//!    early are buffered until the gap before them is filled, and missing packets are requested
//!    through negative acks.
//! * *KeepAlive*: control class. Pings are sent periodically and answered immediately; the round
//!    trip times of these pings drive the interval of the peer's periodic tick, and a peer that
//!    does not answer is eventually dropped.
//!
//! There is no handshake: a peer comes into existence on the first datagram received from (or
//!  sent to) its address.
//!
//! ## Framing
//!
//! Every UDP payload starts with the channel kind as a `u16` (BE), followed by the compressed
//!  packet. After decompression, a packet has the following layout (all numbers BE):
//!
//! ```ascii
//!  0: channel kind (u16): 0 keep-alive, 1 ordered, 2 reliable, 3 unreliable
//!  2: sequence id (u64) - per peer and channel, starting at 1
//! 10: operation id (u64) - opaque correlation id for the application
//! 18: creation timestamp (u64) - micros since the UNIX epoch
//! 26: payload
//! ```
//!
//! *KeepAlive* payload:
//! ```ascii
//! ping: [true (u8)][highest keep-alive sequence id received from the peer (u64)]
//! ack:  [false (u8)]      - the header's sequence id is the ping that is acknowledged
//! ```
//!
//! *Ordered* and *Reliable* payload start with a one byte payload kind:
//! ```ascii
//! data: [0 (u8)][application payload]
//! ack:  [1 (u8)][number of missing ids (u16)][missing id (u64)]*
//! skip: [2 (u8)]
//! ```
//! For an ack, the header's sequence id is the cumulative ack, i.e. all packets up to and
//!  including it were received. The list of missing ids works as a negative ack: the sender
//!  resends those that it still has.
//!
//! A *skip* packet takes the place of a packet whose sequence id was reserved by
//!  `create_packet` but that was never sent (rejected by `send`, or dropped). It is sequenced
//!  and acknowledged like data, but not handed to the application.
//!
//! ## Dispatch
//!
//! Sending and receiving is done by a fixed number of worker tasks that process completion
//!  events from a shared queue (see [dispatch]). Datagrams are staged in slots from two fixed
//!  size pools (send / receive); when no send slot is available, the send request is re-queued
//!  rather than blocking a worker.

pub mod channel;
pub mod config;
pub mod dispatch;
pub mod end_point;
pub mod lock;
pub mod packet;
pub mod peer;
pub mod registry;
pub mod rtt;
pub mod test_util;
