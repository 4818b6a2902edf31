use std::fmt::{Display, Formatter};
use std::ops::Add;

/// Per-channel packet id. Ids start at 1 - 0 is reserved for 'nothing sent / received yet'.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct SequenceId(u64);

impl Display for SequenceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceId {
    pub const ZERO: SequenceId = SequenceId(0);
    pub const FIRST: SequenceId = SequenceId(1);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }

    /// The following id. `u64::MAX` is its own successor, so ids from the network can not
    ///  overflow.
    pub fn next(&self) -> SequenceId {
        SequenceId(self.0.saturating_add(1))
    }

    /// the previous id, or `None` for ZERO
    pub fn prev(&self) -> Option<SequenceId> {
        self.0.checked_sub(1).map(SequenceId)
    }

    pub fn checked_minus(&self, other: u64) -> Option<SequenceId> {
        self.0.checked_sub(other).map(SequenceId)
    }

    /// number of ids from `other` (exclusive) to `self` (inclusive), 0 if `other` is not smaller
    pub fn distance_from(&self, other: SequenceId) -> u64 {
        self.0.saturating_sub(other.0)
    }

    /// iterates from self (inclusive) to `upper` (exclusive)
    pub fn to(&self, upper: SequenceId) -> impl Iterator<Item = SequenceId> {
        (self.0..upper.0).map(SequenceId)
    }
}

impl Add<u64> for SequenceId {
    type Output = SequenceId;

    fn add(self, rhs: u64) -> Self::Output {
        SequenceId(self.0.saturating_add(rhs))
    }
}
