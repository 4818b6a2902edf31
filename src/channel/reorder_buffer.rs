use std::cmp::max;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{trace, warn};
use crate::packet::sequence_id::SequenceId;
use crate::packet::InboundPacket;

/// Inbound state of an ordered channel: packets that arrived ahead of a gap, and the ids that
///  make up the gaps.
///
/// The *frontier* (owned by the channel, passed in) is the highest id up to which everything
///  was delivered. Invariants:
/// * all ids in `pending` and `missing` are between the frontier (excl) and `highest_seen` (incl)
/// * every id in that range is in exactly one of `pending` and `missing`
/// * `highest_seen - frontier <= window`, which bounds the memory held for a peer that never
///    fills a gap
pub struct ReorderBuffer {
    pending: BTreeMap<SequenceId, InboundPacket>,
    missing: BTreeSet<SequenceId>,
    highest_seen: SequenceId,
    window: u64,
}

impl ReorderBuffer {
    pub fn new(window: u64) -> ReorderBuffer {
        ReorderBuffer {
            pending: Default::default(),
            missing: Default::default(),
            highest_seen: SequenceId::ZERO,
            window,
        }
    }

    pub fn missing_ids(&self) -> Vec<SequenceId> {
        self.missing.iter().cloned().collect()
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn highest_seen(&self) -> SequenceId {
        self.highest_seen
    }

    /// Registers a received packet, appending everything that became deliverable to `deliver`
    ///  in sequence order. Returns false for packets that were already delivered or buffered.
    pub fn on_packet(&mut self, frontier: &mut SequenceId, packet: InboundPacket, deliver: &mut VecDeque<InboundPacket>) -> bool {
        let id = packet.sequence_id();

        if id <= *frontier {
            trace!("packet #{} was already delivered - discarding", id);
            return false;
        }
        if self.pending.contains_key(&id) {
            trace!("packet #{} is already buffered - discarding", id);
            return false;
        }

        self.missing.remove(&id);

        if id == frontier.next() {
            *frontier = id;
            deliver.push_back(packet);
            self.drain(frontier, deliver);
        }
        else {
            // everything between the previously highest known id and this one is missing,
            //  except ids the window gives up on right away
            let first_in_window = id.checked_minus(self.window)
                .map(|lower_bound| lower_bound.next())
                .unwrap_or(SequenceId::FIRST);
            let gap_start = max(max(self.highest_seen, *frontier).next(), first_in_window);
            for gap in gap_start.to(id) {
                if !self.pending.contains_key(&gap) {
                    self.missing.insert(gap);
                }
            }
            trace!("packet #{} arrived ahead of #{} - buffering", id, frontier.next());
            self.pending.insert(id, packet);
        }

        self.highest_seen = max(self.highest_seen, id);
        self.enforce_window(frontier, deliver);
        true
    }

    fn drain(&mut self, frontier: &mut SequenceId, deliver: &mut VecDeque<InboundPacket>) {
        while let Some(packet) = self.pending.remove(&frontier.next()) {
            *frontier = frontier.next();
            deliver.push_back(packet);
        }
    }

    /// If the gap between frontier and highest seen packet exceeds the window, the packets
    ///  missing at the start of the window are given up on and the frontier moves forward
    fn enforce_window(&mut self, frontier: &mut SequenceId, deliver: &mut VecDeque<InboundPacket>) {
        let lower_bound = match self.highest_seen.checked_minus(self.window) {
            Some(lower_bound) if lower_bound > *frontier => lower_bound,
            _ => return,
        };

        let still_missing = self.missing.split_off(&lower_bound.next());
        let given_up = std::mem::replace(&mut self.missing, still_missing);
        warn!("reorder window exceeded: giving up on {} missing packets up to #{}", given_up.len(), lower_bound);

        let still_pending = self.pending.split_off(&lower_bound.next());
        for (_, packet) in std::mem::replace(&mut self.pending, still_pending) {
            deliver.push_back(packet);
        }

        *frontier = lower_bound;
        self.drain(frontier, deliver);
    }
}
