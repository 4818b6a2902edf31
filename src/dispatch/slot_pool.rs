use std::fmt::{Debug, Formatter};
use std::sync::Mutex;
use tracing::{trace, warn};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SlotDirection {
    Send,
    Receive,
}

/// A pre-allocated, fixed-size buffer that stages a single datagram. A slot is owned by exactly
///  one party at a time: its pool, a worker, or an I/O operation in flight.
pub struct Slot {
    id: usize,
    direction: SlotDirection,
    buf: Box<[u8]>,
    len: usize,
}

impl Debug for Slot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Slot{{{:?}#{}, len:{}}}", self.direction, self.id, self.len)
    }
}

impl Slot {
    fn new(id: usize, direction: SlotDirection, capacity: usize) -> Slot {
        Slot {
            id,
            direction,
            buf: vec![0; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn direction(&self) -> SlotDirection {
        self.direction
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.capacity());
        self.len = len;
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// the full underlying buffer, regardless of `len`, for writing into
    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// A fixed number of slots, all allocated up front. The pool never grows: when all slots are
///  taken, `try_acquire()` returns `None` and it is up to the caller to retry later.
pub struct SlotPool {
    direction: SlotDirection,
    slot_size: usize,
    num_slots: usize,
    free: Mutex<Vec<Slot>>,
}

impl SlotPool {
    pub fn new(direction: SlotDirection, num_slots: usize, slot_size: usize) -> SlotPool {
        let free = (0..num_slots)
            .map(|id| Slot::new(id, direction, slot_size))
            .collect();

        SlotPool {
            direction,
            slot_size,
            num_slots,
            free: Mutex::new(free),
        }
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    pub fn num_free(&self) -> usize {
        self.lock_free().len()
    }

    pub fn try_acquire(&self) -> Option<Slot> {
        let slot = self.lock_free().pop();
        match &slot {
            Some(slot) => trace!("acquired {:?}", slot),
            None => trace!("{:?} pool exhausted", self.direction),
        }
        slot
    }

    pub fn release(&self, mut slot: Slot) {
        if slot.direction != self.direction || slot.capacity() != self.slot_size {
            warn!("{:?} does not belong to this {:?} pool - discarding", slot, self.direction);
            return;
        }

        slot.clear();
        let mut free = self.lock_free();
        if free.len() < self.num_slots {
            free.push(slot);
        }
        else {
            warn!("{:?} pool is full: discarding returned slot", self.direction);
        }
    }

    fn lock_free(&self) -> std::sync::MutexGuard<'_, Vec<Slot>> {
        self.free.lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
