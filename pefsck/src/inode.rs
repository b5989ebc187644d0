use std::fmt;
use std::mem::size_of;

use log::error;
use rustix::fs::FileType;
use zerocopy::FromBytes;

use crate::disk::{
    xattr_count_to_len, InodeCompact, InodeExtended, Layout, XattrEntry, XattrHeader,
    CHUNK_FORMAT_ALL, CHUNK_FORMAT_BLKBITS_MASK,
};
use crate::erofs::Erofs;
use crate::Error;

/// Host view of one on disk inode record. Read fresh on every visit and owned by the caller.
#[derive(Debug, Clone)]
pub struct Inode {
    pub nid: u64,
    pub extended: bool,
    // kept raw so an unknown layout is only rejected by whoever tries to map the data
    raw_layout: u16,
    pub mode: u16,
    pub nlink: u32,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u64,
    pub mtime_nsec: u32,
    pub ino: u32,
    pub xattr_isize: usize,
    info: [u8; 4],
}

impl Inode {
    pub fn layout(&self) -> Result<Layout, Error> {
        Layout::try_from(self.raw_layout)
    }

    pub fn inode_isize(&self) -> u64 {
        if self.extended {
            size_of::<InodeExtended>() as u64
        } else {
            size_of::<InodeCompact>() as u64
        }
    }

    pub fn file_type(&self) -> FileType {
        FileType::from_raw_mode(self.mode.into())
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == FileType::Directory
    }

    pub fn raw_blkaddr(&self) -> u32 {
        u32::from_le_bytes(self.info)
    }

    /// new_encode_dev layout: minor low byte, then 12 bits of major, then the rest of minor
    pub fn rdev(&self) -> u64 {
        match self.file_type() {
            FileType::CharacterDevice | FileType::BlockDevice => {
                let dev = self.raw_blkaddr();
                let major = (dev & 0xfff00) >> 8;
                let minor = (dev & 0xff) | ((dev >> 12) & 0xfff00);
                rustix::fs::makedev(major, minor)
            }
            _ => 0,
        }
    }

    pub fn chunk_format(&self) -> u16 {
        u16::from_le_bytes([self.info[0], self.info[1]])
    }
}

impl Erofs {
    pub fn read_inode(&self, nid: u64) -> Result<Inode, Error> {
        let pos = self.iloc(nid)?;
        let mut raw = [0u8; size_of::<InodeExtended>()];
        self.read_at(pos, &mut raw[..size_of::<InodeCompact>()])?;
        let format_layout = u16::from_le_bytes([raw[0], raw[1]]);

        let mut inode = if format_layout & 1 == 0 {
            let c = InodeCompact::read_from_bytes(&raw[..size_of::<InodeCompact>()])
                .map_err(|_| Error::StructuralCorruption("inode record"))?;
            Inode {
                nid,
                extended: false,
                raw_layout: (format_layout >> 1) & 0x7,
                mode: c.mode.get(),
                nlink: c.nlink.get().into(),
                size: c.size.get().into(),
                uid: c.uid.get().into(),
                gid: c.gid.get().into(),
                mtime: self.sb.build_time,
                mtime_nsec: self.sb.build_time_nsec,
                ino: c.ino.get(),
                xattr_isize: xattr_count_to_len(c.xattr_count.get()),
                info: c.info,
            }
        } else {
            self.read_at(
                pos + size_of::<InodeCompact>() as u64,
                &mut raw[size_of::<InodeCompact>()..],
            )?;
            let e = InodeExtended::read_from_bytes(&raw[..])
                .map_err(|_| Error::StructuralCorruption("inode record"))?;
            Inode {
                nid,
                extended: true,
                raw_layout: (format_layout >> 1) & 0x7,
                mode: e.mode.get(),
                nlink: e.nlink.get(),
                size: e.size.get(),
                uid: e.uid.get(),
                gid: e.gid.get(),
                mtime: e.mtime.get(),
                mtime_nsec: e.mtime_nsec.get(),
                ino: e.ino.get(),
                xattr_isize: xattr_count_to_len(e.xattr_count.get()),
                info: e.info,
            }
        };

        match inode.file_type() {
            FileType::RegularFile | FileType::Directory | FileType::Symlink => {}
            FileType::CharacterDevice | FileType::BlockDevice => {}
            FileType::Fifo | FileType::Socket => {
                inode.info = [0; 4];
            }
            _ => {
                error!("bogus i_mode ({:o}) @ nid {}", inode.mode, nid);
                return Err(Error::StructuralCorruption("bogus i_mode"));
            }
        }

        // the kernel keeps sizes in a signed loff_t
        if inode.size > i64::MAX as u64 {
            return Err(Error::StructuralCorruption("inode size overflows"));
        }

        if let Ok(Layout::ChunkBased) = inode.layout() {
            let format = inode.chunk_format();
            if format & !CHUNK_FORMAT_ALL != 0 {
                error!("unsupported chunk format {:x} @ nid {}", format, nid);
                return Err(Error::UnsupportedLayout("chunk format"));
            }
            if u32::from(self.sb.blkszbits) + u32::from(format & CHUNK_FORMAT_BLKBITS_MASK) > 63 {
                return Err(Error::StructuralCorruption("chunk size overflows"));
            }
        }
        Ok(inode)
    }

    pub fn verify_xattr(&self, inode: &Inode) -> Result<(), Error> {
        let addr = self.iloc(inode.nid)? + inode.inode_isize();
        walk_xattr_body(inode.xattr_isize, addr, self.block_size(), |pos, buf| {
            self.read_at(pos, buf)
        })
        .inspect_err(|e| {
            if !e.is_io() {
                error!("xattr body of nid {} is broken: {}", inode.nid, e);
            }
        })
    }
}

/// Walk an xattr body of `xattr_isize` bytes starting at byte `addr` and check that every entry
/// fits. `read` fetches bytes at an absolute position.
pub(crate) fn walk_xattr_body<F>(
    xattr_isize: usize,
    addr: u64,
    block_size: u64,
    mut read: F,
) -> Result<(), Error>
where
    F: FnMut(u64, &mut [u8]) -> Result<(), Error>,
{
    let hdr_size = size_of::<XattrHeader>();
    let entry_size = size_of::<XattrEntry>();
    if xattr_isize == hdr_size {
        return Err(Error::UnsupportedLayout("xattr body with only a header"));
    }
    if xattr_isize < hdr_size {
        if xattr_isize != 0 {
            return Err(Error::StructuralCorruption("bogus xattr ibody"));
        }
        return Ok(());
    }

    let mut raw = [0u8; size_of::<XattrHeader>()];
    read(addr, &mut raw)?;
    let header = XattrHeader::read_from_bytes(&raw[..])
        .map_err(|_| Error::StructuralCorruption("xattr header"))?;

    let mut ofs = (addr & (block_size - 1)) + hdr_size as u64;
    let mut addr = addr + hdr_size as u64;
    let mut remaining = (xattr_isize - hdr_size) as i64;
    for _ in 0..header.shared_count {
        if ofs >= block_size {
            if ofs != block_size {
                return Err(Error::StructuralCorruption(
                    "unaligned xattr entry in shared area",
                ));
            }
            ofs = 0;
        }
        ofs += entry_size as u64;
        addr += entry_size as u64;
        remaining -= entry_size as i64;
    }
    if remaining < 0 {
        return Err(Error::StructuralCorruption(
            "shared xattr count exceeds xattr body",
        ));
    }

    while remaining > 0 {
        let mut raw = [0u8; size_of::<XattrEntry>()];
        read(addr, &mut raw)?;
        let entry = XattrEntry::read_from_bytes(&raw[..])
            .map_err(|_| Error::StructuralCorruption("xattr entry"))?;
        let size = entry.total_size() as i64;
        if remaining < size {
            return Err(Error::StructuralCorruption(
                "xattr entry beyond xattr_isize",
            ));
        }
        addr += size as u64;
        remaining -= size;
    }
    Ok(())
}

impl fmt::Display for Inode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Inode {}:", self.nid)?;
        writeln!(f, " layout: {:?}", self.layout())?;
        writeln!(f, "   mode: {:o}", self.mode)?;
        writeln!(f, "    uid: {}", self.uid)?;
        writeln!(f, "    gid: {}", self.gid)?;
        writeln!(f, "  nlink: {}", self.nlink)?;
        writeln!(f, "   size: {}", self.size)?;
        writeln!(f, "  mtime: {} {}ns", self.mtime, self.mtime_nsec)
    }
}
