use crate::map::Algorithm;
use crate::Error;

/// Codec for compressed pclusters. `dst` is sized to the decoded length of the extent and the
/// return value is how many bytes were produced. With `partial` the stream may decode to more
/// than `dst` holds and decoding stops once `dst` is full.
pub trait Decompressor: Send + Sync {
    fn decompress(
        &self,
        algorithm: Algorithm,
        src: &[u8],
        dst: &mut [u8],
        partial: bool,
    ) -> Result<usize, Error>;
}

/// Whatever this build can decode; today that is lz4 behind the `lz4` feature.
pub struct BuiltinDecompressor;

impl Decompressor for BuiltinDecompressor {
    fn decompress(
        &self,
        algorithm: Algorithm,
        src: &[u8],
        dst: &mut [u8],
        partial: bool,
    ) -> Result<usize, Error> {
        match algorithm {
            Algorithm::Lz4 => lz4(src, dst, partial),
            _ => Err(Error::UnsupportedLayout("no decompressor for algorithm")),
        }
    }
}

#[cfg(feature = "lz4")]
fn lz4(src: &[u8], dst: &mut [u8], partial: bool) -> Result<usize, Error> {
    let res = if partial {
        lzzzz::lz4::decompress_partial(src, dst, dst.len())
    } else {
        lzzzz::lz4::decompress(src, dst)
    };
    res.map_err(|_| Error::StructuralCorruption("malformed lz4 stream"))
}

#[cfg(not(feature = "lz4"))]
fn lz4(_src: &[u8], _dst: &mut [u8], _partial: bool) -> Result<usize, Error> {
    Err(Error::UnsupportedLayout("built without lz4"))
}
