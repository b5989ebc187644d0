use std::fmt;
use std::mem::size_of;

use zerocopy::FromBytes;

use crate::disk::{
    crc32c, Superblock, EROFS_SUPER_MAGIC_V1, EROFS_SUPER_OFFSET, FEATURE_COMPAT_SB_CHKSUM,
    SUPERBLOCK_CHECKSUM_OFFSET,
};
use crate::Error;

pub const MIN_BLKSZBITS: u8 = 9;
pub const MAX_BLKSZBITS: u8 = 16;

// the parsed, host endian view of the on disk superblock; only the things we act on
#[derive(Debug, Clone)]
pub struct SuperblockInfo {
    pub blkszbits: u8,
    pub root_nid: u64,
    pub packed_nid: u64,
    pub meta_blkaddr: u32,
    pub xattr_blkaddr: u32,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub build_time: u64,
    pub build_time_nsec: u32,
    pub blocks: u32,
    pub extra_devices: u16,
    pub devt_slotoff: u16,
    pub checksum: u32,
}

fn superblock_bytes(raw: &[u8]) -> Result<&[u8], Error> {
    raw.get(EROFS_SUPER_OFFSET..EROFS_SUPER_OFFSET + size_of::<Superblock>())
        .ok_or(Error::InvalidInput("image too small to hold a superblock"))
}

impl SuperblockInfo {
    /// `raw` is the head of the image, at least through the end of the superblock.
    pub fn parse(raw: &[u8]) -> Result<SuperblockInfo, Error> {
        let sb = Superblock::read_from_bytes(superblock_bytes(raw)?)
            .map_err(|_| Error::InvalidInput("image too small to hold a superblock"))?;
        if sb.magic.get() != EROFS_SUPER_MAGIC_V1 {
            return Err(Error::InvalidInput("bad superblock magic"));
        }
        if !(MIN_BLKSZBITS..=MAX_BLKSZBITS).contains(&sb.blkszbits) {
            return Err(Error::InvalidInput("unsupported block size"));
        }
        Ok(SuperblockInfo {
            blkszbits: sb.blkszbits,
            root_nid: sb.root_nid.get().into(),
            packed_nid: sb.packed_nid.get(),
            meta_blkaddr: sb.meta_blkaddr.get(),
            xattr_blkaddr: sb.xattr_blkaddr.get(),
            feature_compat: sb.feature_compat.get(),
            feature_incompat: sb.feature_incompat.get(),
            build_time: sb.build_time.get(),
            build_time_nsec: sb.build_time_nsec.get(),
            blocks: sb.blocks.get(),
            extra_devices: sb.extra_devices.get(),
            devt_slotoff: sb.devt_slotoff.get(),
            checksum: sb.checksum.get(),
        })
    }

    pub fn block_size(&self) -> u64 {
        1u64 << self.blkszbits
    }

    pub fn has_compat(&self, feature: u32) -> bool {
        self.feature_compat & feature != 0
    }

    pub fn has_incompat(&self, feature: u32) -> bool {
        self.feature_incompat & feature != 0
    }

    pub fn has_checksum(&self) -> bool {
        self.has_compat(FEATURE_COMPAT_SB_CHKSUM)
    }
}

/// End (exclusive) of the checksummed region. Small block sizes still cover the whole superblock.
pub fn checksum_end(blkszbits: u8) -> usize {
    std::cmp::max(
        1usize << blkszbits,
        EROFS_SUPER_OFFSET + size_of::<Superblock>(),
    )
}

pub fn compute_checksum(raw: &[u8]) -> Result<u32, Error> {
    let info = SuperblockInfo::parse(raw)?;
    let region = raw
        .get(EROFS_SUPER_OFFSET..checksum_end(info.blkszbits))
        .ok_or(Error::InvalidInput("first block is truncated"))?;
    let (head, rest) = region.split_at(SUPERBLOCK_CHECKSUM_OFFSET);
    let zero = [0u8; 4];
    Ok(crc32c(
        u32::MAX,
        head.iter().chain(zero.iter()).chain(rest[zero.len()..].iter()),
    ))
}

/// Recompute the superblock checksum and compare it with the stored value. This does not look at
/// the SB_CHKSUM feature bit; callers decide whether the checksum applies.
pub fn verify(raw: &[u8]) -> Result<(), Error> {
    let stored = SuperblockInfo::parse(raw)?.checksum;
    let computed = compute_checksum(raw)?;
    if stored != computed {
        return Err(Error::ChecksumMismatch { stored, computed });
    }
    Ok(())
}

impl fmt::Display for SuperblockInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Superblock:")?;
        writeln!(f, "    checksum: {:08x}", self.checksum)?;
        writeln!(f, "  block size: {} ({})", self.blkszbits, self.block_size())?;
        writeln!(f, "    root_nid: {}", self.root_nid)?;
        writeln!(f, "  packed_nid: {}", self.packed_nid)?;
        writeln!(f, "      blocks: {}", self.blocks)?;
        writeln!(f, "  extra devs: {}", self.extra_devices)
    }
}
