//! The dispatch engine moves datagrams between peers and the socket.
//!
//! All I/O is expressed as *completion events* on a shared queue, processed by a fixed number
//!  of worker tasks:
//! * `BeginSend`: a peer wants a datagram sent. The worker takes a slot from the send pool,
//!    writes the channel tag and the compressed packet into it, and submits the transmit.
//!    If no slot is free, the event goes back into the queue: workers never wait for a slot.
//! * `SendCompleted`: the socket is done with a slot. The slot goes back to the pool, and the
//!    request's in-flight token is released.
//! * `ReceiveCompleted`: a datagram arrived in a receive slot. The worker decompresses it into
//!    its private scratch buffer, immediately posts the next receive on the same slot, and
//!    hands the datagram to the peer it came from. After a socket error, the receive is
//!    reposted with an exponential backoff instead.
//!
//! Every receive slot has a receive posted at all times, so the number of receive slots is the
//!  number of datagrams that can be buffered between socket and workers.

pub mod compression;
pub mod slot_pool;
pub mod socket;
pub mod stats;
mod worker;

use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use anyhow::bail;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use num_enum::IntoPrimitive;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};
use crate::config::PeerNetConfig;
use crate::dispatch::compression::{create_compression, Compression};
use crate::dispatch::slot_pool::{Slot, SlotDirection, SlotPool};
use crate::dispatch::socket::DatagramSocket;
use crate::dispatch::stats::{DispatchStats, DispatchStatsSnapshot};
use crate::dispatch::worker::Worker;
use crate::packet::header::PacketHeader;
use crate::packet::sequence_id::SequenceId;
use crate::packet::ChannelKind;

/// every datagram starts with the channel kind as a u16
pub const TAG_LEN: usize = size_of::<u16>();

/// Held by a send request until the dispatch engine is done with it, and released exactly once
///  when the send completes (successfully or not). Release runs the registered action, e.g.
///  evicting an unreliable packet from its channel.
pub struct InFlight {
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl InFlight {
    /// a token without a release action: the datagram is simply dropped after sending
    pub fn untracked() -> InFlight {
        InFlight { on_release: None }
    }

    pub fn on_release(action: impl FnOnce() + Send + 'static) -> InFlight {
        InFlight { on_release: Some(Box::new(action)) }
    }

    pub fn release(mut self) {
        if let Some(action) = self.on_release.take() {
            action();
        }
    }
}

impl Debug for InFlight {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "InFlight{{tracked:{}}}", self.on_release.is_some())
    }
}

/// an encoded packet on its way to the socket
#[derive(Debug)]
pub struct SendRequest {
    pub to: SocketAddr,
    pub kind: ChannelKind,
    pub sequence_id: SequenceId,
    pub datagram: Bytes,
    pub token: InFlight,
}

/// The way peers hand over datagrams for sending, introduced as a trait to allow testing peers
///  without a dispatch engine
#[cfg_attr(test, automock)]
pub trait PacketSink: Send + Sync + 'static {
    fn post_send(&self, request: SendRequest);

    /// the maximum length of an encoded packet that fits into a single datagram
    fn max_packet_len(&self) -> usize;
}

/// Receives the decompressed datagrams, typically resolving the peer they belong to
pub trait DatagramReceiver: Send + Sync + 'static {
    fn on_datagram(&self, from: SocketAddr, datagram: Bytes);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive)]
#[repr(u8)]
pub enum CompletionKind {
    BeginSend = 1,
    SendCompleted = 2,
    ReceiveCompleted = 3,
}

#[derive(Debug)]
pub enum Completion {
    BeginSend(SendRequest),
    SendCompleted {
        slot: Slot,
        request: SendRequest,
        result: std::io::Result<()>,
    },
    ReceiveCompleted {
        slot: Slot,
        result: std::io::Result<SocketAddr>,
    },
}

impl Completion {
    pub fn kind(&self) -> CompletionKind {
        match self {
            Completion::BeginSend(_) => CompletionKind::BeginSend,
            Completion::SendCompleted { .. } => CompletionKind::SendCompleted,
            Completion::ReceiveCompleted { .. } => CompletionKind::ReceiveCompleted,
        }
    }
}

/// Unbounded multi-producer queue; consumers take turns on the receiving end
pub struct CompletionQueue {
    sender: mpsc::UnboundedSender<Completion>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Completion>>,
}

impl Default for CompletionQueue {
    fn default() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        CompletionQueue {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
        }
    }
}

impl CompletionQueue {
    pub fn post(&self, completion: Completion) {
        if let Err(e) = self.sender.send(completion) {
            debug!("completion queue is closed - discarding {:?} event", e.0.kind());
        }
    }

    pub async fn next(&self) -> Option<Completion> {
        self.receiver.lock().await
            .recv().await
    }
}

/// Finds the biggest packet length that is guaranteed to fit into a datagram after compression
///  and tagging
pub fn max_packet_len(compression: &dyn Compression, max_datagram_size: usize) -> anyhow::Result<usize> {
    let available = max_datagram_size.saturating_sub(TAG_LEN);
    let mut result = available;
    while compression.max_compressed_len(result) > available {
        if result == 0 {
            bail!("a datagram size of {} leaves no room for compressed data", max_datagram_size);
        }
        result -= 1;
    }

    if result <= PacketHeader::SERIALIZED_LEN {
        bail!("a datagram size of {} leaves no room for packet payload", max_datagram_size);
    }
    Ok(result)
}

/// Everything the dispatch engine shares between its workers and I/O tasks: the socket, the
///  codec, both slot pools and the completion queue. Its lifetime is the engine's.
pub struct TransportContext {
    socket: Arc<dyn DatagramSocket>,
    compression: Box<dyn Compression>,
    send_slots: SlotPool,
    receive_slots: SlotPool,
    queue: CompletionQueue,
    stats: DispatchStats,
    max_packet_len: usize,
    shutdown: watch::Sender<bool>,
    /// number of receive errors since the last successful receive
    receive_error_streak: AtomicU32,
}

/// upper bound for the delay before a receive is reposted after socket errors
const MAX_RECEIVE_BACKOFF: Duration = Duration::from_secs(1);

/// exponential backoff starting at 1ms, so a persistently failing socket does not keep a
///  worker busy
fn receive_backoff(error_streak: u32) -> Duration {
    Duration::from_millis(1u64 << error_streak.min(10))
        .min(MAX_RECEIVE_BACKOFF)
}

impl TransportContext {
    pub fn new(config: &PeerNetConfig, socket: Arc<dyn DatagramSocket>) -> anyhow::Result<TransportContext> {
        let compression = create_compression(config.compression);
        let max_packet_len = max_packet_len(compression.as_ref(), config.max_datagram_size)?;
        debug!("max packet length is {} for {:?} compression", max_packet_len, config.compression);

        let (shutdown, _) = watch::channel(false);

        Ok(TransportContext {
            socket,
            compression,
            send_slots: SlotPool::new(SlotDirection::Send, config.max_outstanding_sends, config.max_datagram_size),
            receive_slots: SlotPool::new(SlotDirection::Receive, config.max_pending_receives, config.max_datagram_size),
            queue: Default::default(),
            stats: Default::default(),
            max_packet_len,
            shutdown,
            receive_error_streak: AtomicU32::new(0),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    pub fn num_free_send_slots(&self) -> usize {
        self.send_slots.num_free()
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn post_receive(self: &Arc<Self>, slot: Slot) {
        self.post_receive_after(slot, Duration::ZERO);
    }

    /// returns the delay before reposting the failed receive
    fn on_receive_error(&self) -> Duration {
        self.stats.on_receive_error();
        let streak = self.receive_error_streak.fetch_add(1, Ordering::Relaxed);
        receive_backoff(streak)
    }

    fn on_receive_succeeded(&self) {
        self.receive_error_streak.store(0, Ordering::Relaxed);
    }

    fn post_receive_after(self: &Arc<Self>, mut slot: Slot, delay: Duration) {
        if self.is_shut_down() {
            self.receive_slots.release(slot);
            return;
        }

        let context = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let received = tokio::select! {
                result = async {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    context.socket.recv_datagram(slot.buf_mut()).await
                } => Some(result),
                _ = shutdown.wait_for(|is_shut_down| *is_shut_down) => None,
            };

            match received {
                Some(result) => {
                    let result = result.map(|(len, from)| {
                        slot.set_len(len);
                        from
                    });
                    context.queue.post(Completion::ReceiveCompleted { slot, result });
                }
                None => {
                    trace!("shutting down - receive slot #{} is not reposted", slot.id());
                    context.receive_slots.release(slot);
                }
            }
        });
    }

    fn submit_send(self: &Arc<Self>, slot: Slot, request: SendRequest) {
        let context = self.clone();
        tokio::spawn(async move {
            let result = context.socket.send_datagram(request.to, slot.data()).await;
            context.queue.post(Completion::SendCompleted { slot, request, result });
        });
    }
}

impl PacketSink for TransportContext {
    fn post_send(&self, request: SendRequest) {
        trace!("posting {:?} #{} to {:?}", request.kind, request.sequence_id, request.to);
        self.stats.on_send_posted();
        self.queue.post(Completion::BeginSend(request));
    }

    fn max_packet_len(&self) -> usize {
        self.max_packet_len
    }
}

/// Owns the worker tasks. Dropping the engine stops them.
pub struct DispatchEngine {
    context: Arc<TransportContext>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DispatchEngine {
    /// Posts a receive on every receive slot and spawns the workers. This must be called from
    ///  inside a tokio runtime.
    pub fn start(context: Arc<TransportContext>, receiver: Arc<dyn DatagramReceiver>, num_workers: usize) -> DispatchEngine {
        let mut num_receives = 0;
        while let Some(slot) = context.receive_slots.try_acquire() {
            context.post_receive(slot);
            num_receives += 1;
        }

        let workers = (0..num_workers)
            .map(|worker_id| {
                let worker = Worker::new(worker_id, context.clone(), receiver.clone());
                tokio::spawn(worker.run())
            })
            .collect();

        info!("dispatch engine started with {} workers and {} pending receives", num_workers, num_receives);
        DispatchEngine {
            context,
            workers: Mutex::new(workers),
        }
    }

    pub fn context(&self) -> &Arc<TransportContext> {
        &self.context
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.context.stats.snapshot()
    }

    /// Stops the workers and pending receives. Events still in the queue are discarded.
    pub fn shutdown(&self) {
        self.context.shutdown.send_replace(true);

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        if !workers.is_empty() {
            info!("shutting down dispatch engine");
        }
        for worker in workers {
            worker.abort();
        }
    }
}

impl Drop for DispatchEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
