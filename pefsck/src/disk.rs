use std::mem::size_of;

use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::Error;

pub const EROFS_SUPER_OFFSET: usize = 1024;
pub const EROFS_SUPER_MAGIC_V1: u32 = 0xe0f5e1e2;
pub const INODE_SLOT_BITS: u32 = 5;
// holes in chunk indexes, and inodes with only tail data, use this as their block address
pub const EROFS_NULL_ADDR: u32 = u32::MAX;
pub const EROFS_NAME_LEN: usize = 255;

pub const FEATURE_COMPAT_SB_CHKSUM: u32 = 0x0000_0001;
pub const FEATURE_INCOMPAT_ZERO_PADDING: u32 = 0x0000_0001;
pub const FEATURE_INCOMPAT_BIG_PCLUSTER: u32 = 0x0000_0002;
pub const FEATURE_INCOMPAT_CHUNKED_FILE: u32 = 0x0000_0004;
pub const FEATURE_INCOMPAT_DEVICE_TABLE: u32 = 0x0000_0008;
pub const FEATURE_INCOMPAT_ZTAILPACKING: u32 = 0x0000_0010;
pub const FEATURE_INCOMPAT_FRAGMENTS: u32 = 0x0000_0020;

pub const CHUNK_FORMAT_BLKBITS_MASK: u16 = 0x001f;
pub const CHUNK_FORMAT_INDEXES: u16 = 0x0020;
pub const CHUNK_FORMAT_ALL: u16 = CHUNK_FORMAT_BLKBITS_MASK | CHUNK_FORMAT_INDEXES;

// lcluster index advise bits
pub const LI_LCLUSTER_TYPE_MASK: u16 = 0x0003;
pub const LI_PARTIAL_REF: u16 = 1 << 15;
// set in delta[0] of the first NONHEAD lcluster of a big pcluster, the rest is the block count
pub const LI_D0_CBLKCNT: u16 = 1 << 11;

// map header advise bits
pub const ADVISE_COMPACTED_2B: u16 = 0x0001;
pub const ADVISE_BIG_PCLUSTER_1: u16 = 0x0002;
pub const ADVISE_BIG_PCLUSTER_2: u16 = 0x0004;
pub const ADVISE_INLINE_PCLUSTER: u16 = 0x0008;
pub const ADVISE_INTERLACED_PCLUSTER: u16 = 0x0010;
pub const ADVISE_FRAGMENT_PCLUSTER: u16 = 0x0020;
pub const FRAGMENT_INODE_BIT: u8 = 7;

// NOTES:
// - a nid is not a number, it is the offset of the inode from meta_blkaddr in 32 byte slots. The
// root nid in the superblock is usually something small like 36 and the inode it points at will
// have an unrelated ino
// - the xattr body of an inode sits directly after the inode record: a 12 byte header, then
// shared_count u32 ids, then inline entries each padded to 4 bytes. The inode stores its length as
// xattr_icount where len = 12 + (icount - 1) * 4, so icount == 1 (just a header) is reserved
// - dirents are laid out per block: all the Dirent records first, then the names. The first
// dirent's nameoff tells you how many records there are. Names are not nul terminated except
// maybe the last one in a block if it ends early
// - chunk based inodes keep an index table right after the xattrs, aligned to its entry size
// - legacy compressed inodes have an 8 byte aligned MapHeader after the xattrs, then 8 bytes we
// don't care about, then one LogicalClusterIndex per lcluster
// - the checksum is crc32c (castagnoli) starting from u32::MAX with no final xor, over the first
// block from byte 1024 on with the checksum field zeroed

#[derive(Debug, FromBytes, Immutable, KnownLayout, IntoBytes)]
#[repr(C)]
pub struct Superblock {
    pub(crate) magic: U32,
    pub(crate) checksum: U32,
    pub(crate) feature_compat: U32,
    pub(crate) blkszbits: u8,
    pub(crate) sb_extslots: u8,
    pub(crate) root_nid: U16,
    pub(crate) inos: U64,
    pub(crate) build_time: U64,
    pub(crate) build_time_nsec: U32,
    pub(crate) blocks: U32,
    pub(crate) meta_blkaddr: U32,  // block number not addr
    pub(crate) xattr_blkaddr: U32, // block number not addr
    pub(crate) uuid: [u8; 16],
    pub(crate) volume_name: [u8; 16],
    pub(crate) feature_incompat: U32,
    pub(crate) available_compr_algs_or_lz4_max_distance: U16,
    pub(crate) extra_devices: U16,
    pub(crate) devt_slotoff: U16,
    pub(crate) dirblkbits: u8,
    pub(crate) xattr_prefix_count: u8,
    pub(crate) xattr_prefix_start: U32,
    pub(crate) packed_nid: U64,
    pub(crate) xattr_filter_reserved: u8,
    pub(crate) _reserved2: [u8; 23],
}

pub const SUPERBLOCK_CHECKSUM_OFFSET: usize = 4;

#[derive(Debug, FromBytes, Immutable, KnownLayout, IntoBytes)]
#[repr(C)]
pub struct DeviceSlot {
    pub(crate) tag: [u8; 64],
    pub(crate) blocks: U32,
    pub(crate) mapped_blkaddr: U32,
    pub(crate) _reserved: [u8; 56],
}

#[derive(Debug, FromBytes, Immutable, KnownLayout, IntoBytes)]
#[repr(C)]
pub struct InodeCompact {
    pub(crate) format_layout: U16,
    pub(crate) xattr_count: U16,
    pub(crate) mode: U16,
    pub(crate) nlink: U16,
    pub(crate) size: U32,
    pub(crate) _reserved: U32,
    pub(crate) info: [u8; 4],
    pub(crate) ino: U32,
    pub(crate) uid: U16,
    pub(crate) gid: U16,
    pub(crate) _reserved2: U32,
}

#[derive(Debug, FromBytes, Immutable, KnownLayout, IntoBytes)]
#[repr(C)]
pub struct InodeExtended {
    pub(crate) format_layout: U16,
    pub(crate) xattr_count: U16,
    pub(crate) mode: U16,
    pub(crate) _reserved: U16,
    pub(crate) size: U64,
    pub(crate) info: [u8; 4],
    pub(crate) ino: U32,
    pub(crate) uid: U32,
    pub(crate) gid: U32,
    pub(crate) mtime: U64,
    pub(crate) mtime_nsec: U32,
    pub(crate) nlink: U32,
    pub(crate) _reserved2: [u8; 16],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    FlatPlain = 0,
    CompressedFull = 1,
    FlatInline = 2,
    CompressedCompact = 3,
    ChunkBased = 4,
}

impl Layout {
    pub fn is_compressed(&self) -> bool {
        matches!(self, Layout::CompressedFull | Layout::CompressedCompact)
    }
}

impl TryFrom<u16> for Layout {
    type Error = Error;
    fn try_from(x: u16) -> Result<Layout, Error> {
        use Layout::*;
        match x {
            0 => Ok(FlatPlain),
            1 => Ok(CompressedFull),
            2 => Ok(FlatInline),
            3 => Ok(CompressedCompact),
            4 => Ok(ChunkBased),
            _ => Err(Error::InvalidInput("unknown data layout")),
        }
    }
}

pub fn format_layout(extended: bool, layout: Layout) -> u16 {
    (extended as u16) | ((layout as u16) << 1)
}

#[derive(Debug, FromBytes, Immutable, KnownLayout, IntoBytes)]
#[repr(C)]
pub struct XattrHeader {
    pub(crate) name_filter: U32,
    pub(crate) shared_count: u8,
    pub(crate) _reserved: [u8; 7],
    // u32 shared_xattrs[]
}

#[derive(Debug, FromBytes, Immutable, KnownLayout, IntoBytes)]
#[repr(C)]
pub struct XattrEntry {
    pub(crate) name_len: u8,
    pub(crate) name_index: u8,
    pub(crate) value_size: U16,
    // u8 name[]
}

impl XattrEntry {
    /// Bytes this entry occupies including its name, value and padding.
    pub fn total_size(&self) -> usize {
        round_up(
            (size_of::<XattrEntry>() + usize::from(self.name_len) + usize::from(self.value_size))
                as u64,
            size_of::<XattrEntry>() as u64,
        ) as usize
    }
}

pub fn xattr_count_to_len(count: u16) -> usize {
    if count == 0 {
        0
    } else {
        size_of::<XattrHeader>() + (count as usize - 1) * size_of::<XattrEntry>()
    }
}

#[derive(Debug, FromBytes, Immutable, KnownLayout, IntoBytes)]
#[repr(C)]
pub struct Dirent {
    pub(crate) nid: U64,
    pub(crate) name_offset: U16,
    pub(crate) file_type: u8,
    pub(crate) _reserved: u8,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DirentFileType {
    Unknown = 0,
    RegularFile = 1,
    Directory = 2,
    CharacterDevice = 3,
    BlockDevice = 4,
    Fifo = 5,
    Socket = 6,
    Symlink = 7,
}

impl TryFrom<u8> for DirentFileType {
    type Error = Error;
    fn try_from(x: u8) -> Result<DirentFileType, Error> {
        use DirentFileType::*;
        match x {
            0 => Ok(Unknown),
            1 => Ok(RegularFile),
            2 => Ok(Directory),
            3 => Ok(CharacterDevice),
            4 => Ok(BlockDevice),
            5 => Ok(Fifo),
            6 => Ok(Socket),
            7 => Ok(Symlink),
            _ => Err(Error::StructuralCorruption("invalid dirent file type")),
        }
    }
}

#[derive(Debug, FromBytes, Immutable, KnownLayout, IntoBytes)]
#[repr(C)]
pub struct MapHeader {
    // union of { fragment_offset: U32, { _reserved: U16, idata_size: U16 } }
    pub(crate) fragment_offset_or_data_size: [u8; 4],
    pub(crate) advise: U16,
    // bit 0-3: algorithm of head 1
    // bit 4-7: algorithm of head 2
    pub(crate) algorithm: u8,
    // bit 0-2: logical cluster bits - blkszbits
    // if bit 7 is set, then this whole 8 byte struct is interpreted as le64 with the high bit
    // cleared as the fragment offset
    pub(crate) cluster_bits: u8,
}

impl MapHeader {
    pub fn fragment_offset(&self) -> u32 {
        u32::from_le_bytes(self.fragment_offset_or_data_size)
    }

    pub fn idata_size(&self) -> u16 {
        let b = self.fragment_offset_or_data_size;
        u16::from_le_bytes([b[2], b[3]])
    }

    pub fn is_fragment_inode(&self) -> bool {
        self.cluster_bits >> FRAGMENT_INODE_BIT != 0
    }

    pub fn whole_fragment_offset(&self) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.as_bytes());
        u64::from_le_bytes(raw) & !(1u64 << 63)
    }
}

// where the full (legacy) lcluster indexes begin relative to the end of the inode + xattrs
pub fn full_index_start(inode_end: u64) -> u64 {
    round_up(inode_end, 8) + size_of::<MapHeader>() as u64 + 8
}

// compacted indexes follow the map header directly
pub fn compact_index_start(inode_end: u64) -> u64 {
    round_up(inode_end, 8) + size_of::<MapHeader>() as u64
}

#[derive(Debug, FromBytes, Immutable, KnownLayout, IntoBytes)]
#[repr(C)]
pub struct LogicalClusterIndex {
    pub(crate) advise: U16,
    pub(crate) cluster_offset: U16,
    // union of { blkaddr: U32, delta: [U16; 2] }
    pub(crate) block_addr_or_delta: [u8; 4],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalClusterType {
    Plain = 0,
    Head1 = 1,
    NonHead = 2,
    Head2 = 3,
}

impl LogicalClusterType {
    pub fn from_raw(x: u16) -> LogicalClusterType {
        use LogicalClusterType::*;
        match x & LI_LCLUSTER_TYPE_MASK {
            0 => Plain,
            1 => Head1,
            2 => NonHead,
            _ => Head2,
        }
    }
}

impl LogicalClusterIndex {
    pub fn typ(&self) -> LogicalClusterType {
        LogicalClusterType::from_raw(self.advise.get())
    }

    pub fn block_addr(&self) -> u32 {
        u32::from_le_bytes(self.block_addr_or_delta)
    }

    pub fn delta(&self) -> [u16; 2] {
        let b = self.block_addr_or_delta;
        [u16::from_le_bytes([b[0], b[1]]), u16::from_le_bytes([b[2], b[3]])]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, Immutable, KnownLayout, IntoBytes)]
#[repr(C)]
pub struct ChunkIndex {
    pub(crate) advise: U16,
    pub(crate) device_id: U16,
    pub(crate) blkaddr: U32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    Lz4 = 0,
    Lzma = 1,
    Deflate = 2,
    Zstd = 3,
}

pub fn round_up(x: u64, align: u64) -> u64 {
    x.div_ceil(align) * align
}

// Bitwise CRC32C with no final xor. Inputs are at most a block (superblock) or a 16 byte
// fragment taste, so no table.
pub(crate) fn crc32c<'a>(seed: u32, data: impl IntoIterator<Item = &'a u8>) -> u32 {
    let poly = 0x82F63B78;
    let mut crc = seed;
    for x in data {
        crc ^= *x as u32;
        for _ in 0..8 {
            crc = (crc >> 1) ^ (if crc & 1 == 0 { 0 } else { poly });
        }
    }
    crc
}
