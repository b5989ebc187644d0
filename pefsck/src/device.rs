use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use memmap2::Mmap;

use crate::Error;

/// Positional, read-only access to an image or one of its extra blob devices. Reads that run
/// past the end of the device fail with `UnexpectedEof` rather than returning short.
pub trait Device: Send + Sync {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error>;

    fn read_block(&self, blkszbits: u8, index: u64, buf: &mut [u8]) -> Result<(), Error> {
        let offset = index
            .checked_mul(1u64 << blkszbits)
            .ok_or_else(unexpected_eof)?;
        self.read_at(offset, buf)
    }
}

fn unexpected_eof() -> Error {
    io::Error::from(io::ErrorKind::UnexpectedEof).into()
}

fn read_slice(data: &[u8], offset: u64, buf: &mut [u8]) -> Result<(), Error> {
    let start = usize::try_from(offset).map_err(|_| unexpected_eof())?;
    let src = start
        .checked_add(buf.len())
        .and_then(|end| data.get(start..end))
        .ok_or_else(unexpected_eof)?;
    buf.copy_from_slice(src);
    Ok(())
}

impl Device for Vec<u8> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        read_slice(self, offset, buf)
    }
}

impl Device for Mmap {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        read_slice(self, offset, buf)
    }
}

impl Device for File {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        self.read_exact_at(buf, offset)?;
        Ok(())
    }
}
