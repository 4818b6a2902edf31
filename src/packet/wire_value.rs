use anyhow::bail;
use bytes::{Buf, BufMut, Bytes};

/// A value that can be written to and read from a packet's payload. This is the extension
///  point for application level serialization: implement it for your own types in terms of the
///  primitive implementations.
pub trait WireValue: Sized {
    fn put<B: BufMut>(&self, buf: &mut B);

    fn try_get<B: Buf>(buf: &mut B) -> anyhow::Result<Self>;
}

macro_rules! wire_value_impl {
    ($ty:ty, $putter:ident, $try_getter:ident) => {
        impl WireValue for $ty {
            fn put<B: BufMut>(&self, buf: &mut B) {
                buf.$putter(*self);
            }

            fn try_get<B: Buf>(buf: &mut B) -> anyhow::Result<Self> {
                Ok(buf.$try_getter()?)
            }
        }
    }
}

wire_value_impl!(u8, put_u8, try_get_u8);
wire_value_impl!(u16, put_u16, try_get_u16);
wire_value_impl!(u32, put_u32, try_get_u32);
wire_value_impl!(u64, put_u64, try_get_u64);
wire_value_impl!(i8, put_i8, try_get_i8);
wire_value_impl!(i16, put_i16, try_get_i16);
wire_value_impl!(i32, put_i32, try_get_i32);
wire_value_impl!(i64, put_i64, try_get_i64);
wire_value_impl!(f32, put_f32, try_get_f32);
wire_value_impl!(f64, put_f64, try_get_f64);

impl WireValue for bool {
    fn put<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(*self as u8);
    }

    fn try_get<B: Buf>(buf: &mut B) -> anyhow::Result<Self> {
        match buf.try_get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            n => bail!("invalid bool value {}", n),
        }
    }
}

fn try_get_len<B: Buf>(buf: &mut B) -> anyhow::Result<usize> {
    let len = buf.try_get_u32()? as usize;
    if len > buf.remaining() {
        bail!("length prefix {} exceeds the remaining {} bytes", len, buf.remaining());
    }
    Ok(len)
}

impl WireValue for Bytes {
    fn put<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(self.len() as u32);
        buf.put_slice(self);
    }

    fn try_get<B: Buf>(buf: &mut B) -> anyhow::Result<Self> {
        let len = try_get_len(buf)?;
        Ok(buf.copy_to_bytes(len))
    }
}

impl WireValue for Vec<u8> {
    fn put<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(self.len() as u32);
        buf.put_slice(self);
    }

    fn try_get<B: Buf>(buf: &mut B) -> anyhow::Result<Self> {
        let len = try_get_len(buf)?;
        Ok(buf.copy_to_bytes(len).to_vec())
    }
}

impl WireValue for String {
    fn put<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(self.len() as u32);
        buf.put_slice(self.as_bytes());
    }

    fn try_get<B: Buf>(buf: &mut B) -> anyhow::Result<Self> {
        let len = try_get_len(buf)?;
        let raw = buf.copy_to_bytes(len);
        Ok(String::from_utf8(raw.to_vec())?)
    }
}
