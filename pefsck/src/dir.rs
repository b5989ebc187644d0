use std::cmp::min;
use std::mem::size_of;

use log::{debug, error};
use zerocopy::FromBytes;

use crate::disk::{Dirent, DirentFileType, EROFS_NAME_LEN};
use crate::erofs::Erofs;
use crate::inode::Inode;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirentItem<'a> {
    pub nid: u64,
    pub file_type: DirentFileType,
    pub name: &'a [u8],
}

impl DirentItem<'_> {
    pub fn is_dot(&self) -> bool {
        self.name == b"."
    }

    pub fn is_dotdot(&self) -> bool {
        self.name == b".."
    }
}

/// Validating iterator over the entries of one directory block. `block` is the used part of the
/// block, shorter than the block size only for the last block of a directory. Iteration stops
/// after the first error.
pub struct DirentBlock<'a> {
    block: &'a [u8],
    count: usize,
    i: usize,
    prev: Option<&'a [u8]>,
    failed: bool,
}

fn corrupt(msg: &'static str) -> Error {
    Error::StructuralCorruption(msg)
}

impl<'a> DirentBlock<'a> {
    pub fn new(block: &'a [u8]) -> Result<DirentBlock<'a>, Error> {
        let first = dirent_at(block, 0)?;
        let nameoff0 = usize::from(first.name_offset.get());
        if nameoff0 < size_of::<Dirent>() || nameoff0 >= block.len() {
            return Err(corrupt("invalid de[0].nameoff"));
        }
        if nameoff0 % size_of::<Dirent>() != 0 {
            return Err(corrupt("de[0].nameoff is not a multiple of the dirent size"));
        }
        Ok(DirentBlock {
            block,
            count: nameoff0 / size_of::<Dirent>(),
            i: 0,
            prev: None,
            failed: false,
        })
    }

    fn entry(&mut self) -> Result<DirentItem<'a>, Error> {
        let de = dirent_at(self.block, self.i)?;
        let nameoff = usize::from(de.name_offset.get());
        let name = if self.i + 1 < self.count {
            let next = usize::from(dirent_at(self.block, self.i + 1)?.name_offset.get());
            self.block
                .get(nameoff..next)
                .ok_or(corrupt("dirent name out of bounds"))?
        } else {
            // the last name runs to the end of the block unless nul terminated
            let rest = self
                .block
                .get(nameoff..)
                .ok_or(corrupt("dirent name out of bounds"))?;
            let len = rest.iter().position(|x| *x == 0).unwrap_or(rest.len());
            &rest[..min(len, rest.len())]
        };
        if nameoff < self.count * size_of::<Dirent>() {
            return Err(corrupt("dirent name overlaps the dirent table"));
        }
        if name.is_empty() || name.len() > EROFS_NAME_LEN {
            return Err(corrupt("invalid dirent name length"));
        }
        if name.iter().any(|x| *x == b'/' || *x == 0) {
            return Err(corrupt("dirent name contains '/' or nul"));
        }
        let file_type = DirentFileType::try_from(de.file_type)?;
        if let Some(prev) = self.prev {
            if prev >= name {
                return Err(corrupt("dirents are not in ascending order"));
            }
        }
        self.prev = Some(name);
        Ok(DirentItem {
            nid: de.nid.get(),
            file_type,
            name,
        })
    }
}

impl<'a> Iterator for DirentBlock<'a> {
    type Item = Result<DirentItem<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.i >= self.count {
            return None;
        }
        let ret = self.entry();
        self.i += 1;
        if ret.is_err() {
            self.failed = true;
        }
        Some(ret)
    }
}

fn dirent_at(block: &[u8], i: usize) -> Result<Dirent, Error> {
    let raw = block
        .get(i * size_of::<Dirent>()..(i + 1) * size_of::<Dirent>())
        .ok_or(corrupt("dirent table out of bounds"))?;
    Dirent::read_from_bytes(raw).map_err(|_| corrupt("dirent"))
}

impl Erofs {
    /// Walk every dirent of directory `inode`, one block at a time. `.` must point at the
    /// directory and `..` at `pnid`; both must be present. `f` is called for every other entry
    /// and its errors stop the walk.
    pub fn iterate_dir<F>(&self, inode: &Inode, pnid: u64, mut f: F) -> Result<(), Error>
    where
        F: FnMut(DirentItem<'_>) -> Result<(), Error>,
    {
        let bs = self.block_size();
        let mut block = vec![];
        let mut dot = false;
        let mut dotdot = false;
        let mut pos = 0;
        while pos < inode.size {
            let len = min(bs, inode.size - pos) as usize;
            block.clear();
            block.try_reserve(len)?;
            block.resize(len, 0);
            self.read_data(inode, pos, &mut block)?;
            let entries = DirentBlock::new(&block).inspect_err(|e| {
                error!("bad dirent block @ nid {} pos {}: {}", inode.nid, pos, e);
            })?;
            for item in entries {
                let item = item.inspect_err(|e| {
                    error!("bad dirent @ nid {} pos {}: {}", inode.nid, pos, e);
                })?;
                debug!(
                    "nid {} dirent {:?} -> {}",
                    inode.nid,
                    String::from_utf8_lossy(item.name),
                    item.nid
                );
                if item.is_dot() {
                    if item.nid != inode.nid {
                        error!("`.' of nid {} points at {}", inode.nid, item.nid);
                        return Err(corrupt("`.' does not point at its directory"));
                    }
                    dot = true;
                } else if item.is_dotdot() {
                    if item.nid != pnid {
                        error!(
                            "`..' of nid {} points at {}, expected {}",
                            inode.nid, item.nid, pnid
                        );
                        return Err(corrupt("`..' does not point at the parent"));
                    }
                    dotdot = true;
                } else {
                    f(item)?;
                }
            }
            pos += bs;
        }
        if !dot || !dotdot {
            error!("`.' or `..' dirent is missing @ nid {}", inode.nid);
            return Err(corrupt("`.' or `..' dirent is missing"));
        }
        Ok(())
    }
}
