use std::cmp::min;
use std::mem::size_of;

use log::{debug, error};
use zerocopy::FromBytes;

use crate::disk::{
    round_up, ChunkIndex, CompressionType, Layout, CHUNK_FORMAT_BLKBITS_MASK,
    CHUNK_FORMAT_INDEXES, EROFS_NULL_ADDR,
};
use crate::erofs::Erofs;
use crate::inode::Inode;
use crate::zmap::ZInfo;
use crate::Error;

/// Where the bytes of an extent live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Physical {
    // nothing on disk; reads as zeros
    Hole,
    Device { device: u16, addr: u64 },
    // tail data packed into the metadata area after the inode
    Inline { addr: u64 },
    // byte offset into the data of the packed inode
    Fragment { offset: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Lz4,
    Lzma,
    Deflate,
    Zstd,
    // uncompressed pcluster, data starts at the beginning
    Shifted,
    // uncompressed pcluster, data rotated by the block offset of the extent
    Interlaced,
    Unknown(u8),
}

impl Algorithm {
    pub(crate) fn from_raw(x: u8) -> Algorithm {
        match x {
            x if x == CompressionType::Lz4 as u8 => Algorithm::Lz4,
            x if x == CompressionType::Lzma as u8 => Algorithm::Lzma,
            x if x == CompressionType::Deflate as u8 => Algorithm::Deflate,
            x if x == CompressionType::Zstd as u8 => Algorithm::Zstd,
            x => Algorithm::Unknown(x),
        }
    }
}

/// One logical extent of a file and where it comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapBlocks {
    pub la: u64,
    pub llen: u64,
    pub plen: u64,
    pub physical: Physical,
    pub compressed: bool,
    pub algorithm: Option<Algorithm>,
    // llen reaches the end of the pcluster's output
    pub full_mapped: bool,
    // the pcluster is shared and decodes to more than this extent
    pub partial_ref: bool,
}

impl MapBlocks {
    pub(crate) fn flat(la: u64, len: u64, physical: Physical) -> MapBlocks {
        MapBlocks {
            la,
            llen: len,
            plen: len,
            physical,
            compressed: false,
            algorithm: None,
            full_mapped: true,
            partial_ref: false,
        }
    }

    fn beyond_eof(size: u64) -> MapBlocks {
        MapBlocks::flat(size, 0, Physical::Hole)
    }

    pub fn is_mapped(&self) -> bool {
        !matches!(self.physical, Physical::Hole)
    }

    pub fn end(&self) -> u64 {
        self.la + self.llen
    }
}

/// Layout aware logical to physical mapping for one inode.
pub struct ExtentMapper<'a> {
    fs: &'a Erofs,
    inode: &'a Inode,
    layout: Layout,
    zinfo: Option<ZInfo>,
}

impl<'a> ExtentMapper<'a> {
    pub fn new(fs: &'a Erofs, inode: &'a Inode) -> Result<ExtentMapper<'a>, Error> {
        let layout = inode.layout().inspect_err(|_| {
            error!("unknown datalayout @ nid {}", inode.nid);
        })?;
        let zinfo = if layout.is_compressed() {
            Some(ZInfo::load(fs, inode, layout)?)
        } else {
            None
        };
        Ok(ExtentMapper {
            fs,
            inode,
            layout,
            zinfo,
        })
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Map the extent containing `la`. The result never ends past the inode size; asking at or
    /// beyond the end gives an unmapped, empty extent at `size`.
    pub fn map_range(&self, la: u64) -> Result<MapBlocks, Error> {
        let size = self.inode.size;
        if la >= size {
            return Ok(MapBlocks::beyond_eof(size));
        }
        let mut map = match &self.zinfo {
            Some(z) => z.map(self.fs, self.inode, la)?,
            None => {
                let map = match self.layout {
                    Layout::ChunkBased => self.map_chunk(la)?,
                    _ => self.map_flat(la)?,
                };
                if map.llen != map.plen {
                    error!(
                        "broken chunk length la {} llen {} plen {} @ nid {}",
                        map.la, map.llen, map.plen, self.inode.nid
                    );
                    return Err(Error::StructuralCorruption("broken chunk length"));
                }
                map
            }
        };
        if map.la > la {
            return Err(Error::StructuralCorruption(
                "extent starts after the requested offset",
            ));
        }
        // the last lcluster can be divided into 3 parts
        if map.end() > size {
            map.llen = size - map.la;
        }
        debug!("nid {} la {} -> {:?}", self.inode.nid, la, map);
        Ok(map)
    }

    fn map_flat(&self, la: u64) -> Result<MapBlocks, Error> {
        let fs = self.fs;
        let bits = fs.sb.blkszbits;
        let size = self.inode.size;
        let inline = self.layout == Layout::FlatInline;
        let nblocks = fs.blk_round_up(size);
        let lastblk = nblocks - u64::from(inline);
        let tail_start = lastblk << bits;

        if la < tail_start {
            let blkaddr = self.inode.raw_blkaddr();
            if blkaddr == EROFS_NULL_ADDR {
                return Err(Error::StructuralCorruption(
                    "flat inode data without a block address",
                ));
            }
            let addr = (u64::from(blkaddr) << bits) + la;
            Ok(MapBlocks::flat(
                la,
                tail_start - la,
                Physical::Device { device: 0, addr },
            ))
        } else if inline {
            let addr = fs.iloc(self.inode.nid)?
                + self.inode.inode_isize()
                + self.inode.xattr_isize as u64
                + fs.blkoff(la);
            let plen = size - la;
            // inline data should be located in the same meta block
            if fs.blkoff(addr) + plen > fs.block_size() {
                error!(
                    "inline data crosses block boundary @ nid {}",
                    self.inode.nid
                );
                return Err(Error::StructuralCorruption(
                    "inline data crosses a block boundary",
                ));
            }
            Ok(MapBlocks::flat(la, plen, Physical::Inline { addr }))
        } else {
            Err(Error::StructuralCorruption("flat mapping past the last block"))
        }
    }

    fn map_chunk(&self, la: u64) -> Result<MapBlocks, Error> {
        let fs = self.fs;
        let bits = fs.sb.blkszbits;
        let format = self.inode.chunk_format();
        let indexed = format & CHUNK_FORMAT_INDEXES != 0;
        let unit = if indexed {
            size_of::<ChunkIndex>() as u64
        } else {
            size_of::<u32>() as u64
        };
        let chunkbits = u32::from(bits) + u32::from(format & CHUNK_FORMAT_BLKBITS_MASK);
        let chunknr = la >> chunkbits;
        let table = round_up(
            fs.iloc(self.inode.nid)? + self.inode.inode_isize() + self.inode.xattr_isize as u64,
            unit,
        );
        let pos = table + chunknr * unit;
        let la = chunknr << chunkbits;
        let plen = min(
            1u64 << chunkbits,
            round_up(self.inode.size - la, fs.block_size()),
        );

        let mut raw = [0u8; size_of::<ChunkIndex>()];
        let raw = &mut raw[..unit as usize];
        fs.read_at(pos, raw)?;
        let (device, blkaddr) = if indexed {
            let idx = ChunkIndex::read_from_bytes(&raw[..])
                .map_err(|_| Error::StructuralCorruption("chunk index"))?;
            (fs.mask_device_id(idx.device_id.get()), idx.blkaddr.get())
        } else {
            (0, u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
        };

        let physical = if blkaddr == EROFS_NULL_ADDR {
            Physical::Hole
        } else {
            Physical::Device {
                device,
                addr: u64::from(blkaddr) << bits,
            }
        };
        Ok(MapBlocks::flat(la, plen, physical))
    }
}
