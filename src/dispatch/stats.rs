use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by the dispatch engine. They are updated with relaxed ordering, so a
///  snapshot is not guaranteed to be consistent across counters.
#[derive(Default, Debug)]
pub struct DispatchStats {
    sends_posted: AtomicU64,
    sends_transmitted: AtomicU64,
    sends_failed: AtomicU64,
    sends_dropped: AtomicU64,
    slot_retries: AtomicU64,
    datagrams_received: AtomicU64,
    datagrams_dropped: AtomicU64,
    receive_errors: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DispatchStatsSnapshot {
    pub sends_posted: u64,
    /// sends handed to the socket successfully
    pub sends_transmitted: u64,
    /// sends the socket reported an error for
    pub sends_failed: u64,
    /// sends that never reached the socket, e.g. because compression failed
    pub sends_dropped: u64,
    /// number of times a send was re-queued because no send slot was available
    pub slot_retries: u64,
    pub datagrams_received: u64,
    /// received datagrams that were discarded before reaching a peer
    pub datagrams_dropped: u64,
    /// receives the socket reported an error for
    pub receive_errors: u64,
}

impl DispatchStatsSnapshot {
    /// number of posted sends that have not reached a final state yet
    pub fn sends_in_flight(&self) -> u64 {
        self.sends_posted
            .saturating_sub(self.sends_transmitted + self.sends_failed + self.sends_dropped)
    }
}

impl DispatchStats {
    pub(crate) fn on_send_posted(&self) {
        self.sends_posted.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn on_send_transmitted(&self) {
        self.sends_transmitted.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn on_send_failed(&self) {
        self.sends_failed.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn on_send_dropped(&self) {
        self.sends_dropped.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn on_slot_retry(&self) {
        self.slot_retries.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn on_datagram_received(&self) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn on_datagram_dropped(&self) {
        self.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn on_receive_error(&self) {
        self.receive_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            sends_posted: self.sends_posted.load(Ordering::Relaxed),
            sends_transmitted: self.sends_transmitted.load(Ordering::Relaxed),
            sends_failed: self.sends_failed.load(Ordering::Relaxed),
            sends_dropped: self.sends_dropped.load(Ordering::Relaxed),
            slot_retries: self.slot_retries.load(Ordering::Relaxed),
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            datagrams_dropped: self.datagrams_dropped.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
        }
    }
}
