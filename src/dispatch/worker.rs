use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::{anyhow, bail};
use bytes::{Buf, Bytes};
use tracing::{debug, error, trace, warn};
use crate::dispatch::slot_pool::Slot;
use crate::dispatch::{Completion, DatagramReceiver, SendRequest, TransportContext, TAG_LEN};
use crate::packet::ChannelKind;

/// Processes completion events. Each worker has its own scratch buffer for decompression, so
///  the only state shared between workers is the transport context.
pub(crate) struct Worker {
    id: usize,
    context: Arc<TransportContext>,
    receiver: Arc<dyn DatagramReceiver>,
    scratch: Vec<u8>,
}

impl Worker {
    pub(crate) fn new(id: usize, context: Arc<TransportContext>, receiver: Arc<dyn DatagramReceiver>) -> Worker {
        let scratch = vec![0; context.receive_slots.slot_size()];
        Worker {
            id,
            context,
            receiver,
            scratch,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("worker #{} started", self.id);

        while let Some(completion) = self.context.queue.next().await {
            trace!("worker #{}: processing completion event {}", self.id, u8::from(completion.kind()));

            match completion {
                Completion::BeginSend(request) => self.on_begin_send(request).await,
                Completion::SendCompleted { slot, request, result } => self.on_send_completed(slot, request, result),
                Completion::ReceiveCompleted { slot, result } => self.on_receive_completed(slot, result),
            }
        }

        debug!("worker #{}: completion queue closed", self.id);
    }

    async fn on_begin_send(&self, request: SendRequest) {
        let Some(mut slot) = self.context.send_slots.try_acquire() else {
            // give in-flight sends a chance to complete before trying again
            self.context.stats.on_slot_retry();
            tokio::task::yield_now().await;
            self.context.queue.post(Completion::BeginSend(request));
            return;
        };

        match self.write_datagram(&mut slot, &request) {
            Ok(len) => {
                slot.set_len(len);
                self.context.submit_send(slot, request);
            }
            Err(e) => {
                warn!("dropping {:?} packet #{} for {:?}: {}", request.kind, request.sequence_id, request.to, e);
                self.context.send_slots.release(slot);
                self.context.stats.on_send_dropped();
                request.token.release();
            }
        }
    }

    fn write_datagram(&self, slot: &mut Slot, request: &SendRequest) -> anyhow::Result<usize> {
        let buf = slot.buf_mut();
        if buf.len() < TAG_LEN {
            bail!("slot is too small for the channel tag");
        }

        buf[..TAG_LEN].copy_from_slice(&u16::from(request.kind).to_be_bytes());
        let compressed_len = self.context.compression.compress_into(&request.datagram, &mut buf[TAG_LEN..])?;
        Ok(TAG_LEN + compressed_len)
    }

    fn on_send_completed(&self, slot: Slot, request: SendRequest, result: std::io::Result<()>) {
        self.context.send_slots.release(slot);

        match result {
            Ok(()) => {
                trace!("sent {:?} packet #{} to {:?}", request.kind, request.sequence_id, request.to);
                self.context.stats.on_send_transmitted();
            }
            Err(e) => {
                error!("error sending {:?} packet #{} to {:?}: {}", request.kind, request.sequence_id, request.to, e);
                self.context.stats.on_send_failed();
            }
        }

        request.token.release();
    }

    fn on_receive_completed(&mut self, slot: Slot, result: std::io::Result<SocketAddr>) {
        let from = match result {
            Ok(from) => from,
            Err(e) => {
                let delay = self.context.on_receive_error();
                error!("socket error on receive, retrying in {:?}: {}", delay, e);
                self.context.post_receive_after(slot, delay);
                return;
            }
        };

        self.context.on_receive_succeeded();
        self.context.stats.on_datagram_received();
        trace!("received {} bytes from {:?}", slot.len(), from);

        let decoded = self.decode(slot.data());
        self.context.post_receive(slot);

        match decoded {
            Ok(datagram) => self.receiver.on_datagram(from, datagram),
            Err(e) => {
                warn!("dropping datagram from {:?}: {}", from, e);
                self.context.stats.on_datagram_dropped();
            }
        }
    }

    /// checks the channel tag and decompresses the packet following it
    fn decode(&mut self, mut data: &[u8]) -> anyhow::Result<Bytes> {
        let tag = data.try_get_u16()
            .map_err(|_| anyhow!("incomplete channel tag"))?;
        let kind = ChannelKind::try_from(tag)
            .map_err(|_| anyhow!("unknown channel kind tag {}", tag))?;

        let len = self.context.compression.decompress_into(data, &mut self.scratch)?;
        let packet = &self.scratch[..len];

        if packet.get(..TAG_LEN) != Some(&tag.to_be_bytes()[..]) {
            bail!("packet does not match its {:?} channel tag", kind);
        }
        Ok(Bytes::copy_from_slice(packet))
    }
}
