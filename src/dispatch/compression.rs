use anyhow::bail;
use crate::config::CompressionKind;

/// Compresses packets into send slots, and decompresses received datagrams into a worker's
///  scratch buffer. Implementations must be stateless, they are shared between workers.
pub trait Compression: Send + Sync + 'static {
    /// upper bound for the compressed size of `len` bytes of input
    fn max_compressed_len(&self, len: usize) -> usize;

    fn compress_into(&self, input: &[u8], output: &mut [u8]) -> anyhow::Result<usize>;

    fn decompress_into(&self, input: &[u8], output: &mut [u8]) -> anyhow::Result<usize>;
}

pub fn create_compression(kind: CompressionKind) -> Box<dyn Compression> {
    match kind {
        CompressionKind::None => Box::new(NoCompression),
        CompressionKind::Lz4 => Box::new(Lz4Compression),
    }
}

pub struct NoCompression;

impl NoCompression {
    fn copy(input: &[u8], output: &mut [u8]) -> anyhow::Result<usize> {
        if input.len() > output.len() {
            bail!("{} bytes do not fit into a buffer of {} bytes", input.len(), output.len());
        }
        output[..input.len()].copy_from_slice(input);
        Ok(input.len())
    }
}

impl Compression for NoCompression {
    fn max_compressed_len(&self, len: usize) -> usize {
        len
    }

    fn compress_into(&self, input: &[u8], output: &mut [u8]) -> anyhow::Result<usize> {
        Self::copy(input, output)
    }

    fn decompress_into(&self, input: &[u8], output: &mut [u8]) -> anyhow::Result<usize> {
        Self::copy(input, output)
    }
}

/// LZ4 block format without a size prefix: the decompressed size is bounded by the receiving
///  buffer
pub struct Lz4Compression;

impl Compression for Lz4Compression {
    fn max_compressed_len(&self, len: usize) -> usize {
        lz4_flex::block::get_maximum_output_size(len)
    }

    fn compress_into(&self, input: &[u8], output: &mut [u8]) -> anyhow::Result<usize> {
        Ok(lz4_flex::block::compress_into(input, output)?)
    }

    fn decompress_into(&self, input: &[u8], output: &mut [u8]) -> anyhow::Result<usize> {
        Ok(lz4_flex::block::decompress_into(input, output)?)
    }
}
