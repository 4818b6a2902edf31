use std::time::{SystemTime, UNIX_EPOCH};
use anyhow::anyhow;
use bytes::{Buf, BufMut};
use crate::packet::sequence_id::SequenceId;
use crate::packet::ChannelKind;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PacketHeader {
    pub kind: ChannelKind,
    pub sequence_id: SequenceId,
    pub operation_id: u64,
    /// micros since epoch
    pub created_micros: u64,
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = size_of::<u16>() + 3 * size_of::<u64>();

    pub fn new(kind: ChannelKind, sequence_id: SequenceId, operation_id: u64) -> PacketHeader {
        PacketHeader {
            kind,
            sequence_id,
            operation_id,
            created_micros: Self::micros_since_epoch(),
        }
    }

    fn micros_since_epoch() -> u64 {
        // a clock before the epoch is not worth failing for: the timestamp is informational
        SystemTime::now().duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.kind.into());
        buf.put_u64(self.sequence_id.to_raw());
        buf.put_u64(self.operation_id);
        buf.put_u64(self.created_micros);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let raw_kind = buf.try_get_u16()?;
        let kind = ChannelKind::try_from(raw_kind)
            .map_err(|_| anyhow!("invalid channel kind {}", raw_kind))?;
        let sequence_id = SequenceId::from_raw(buf.try_get_u64()?);
        let operation_id = buf.try_get_u64()?;
        let created_micros = buf.try_get_u64()?;

        Ok(PacketHeader {
            kind,
            sequence_id,
            operation_id,
            created_micros,
        })
    }
}
