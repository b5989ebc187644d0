use std::cmp::min;
use std::iter;

use log::error;

use crate::disk::FEATURE_INCOMPAT_ZERO_PADDING;
use crate::erofs::Erofs;
use crate::inode::Inode;
use crate::map::{Algorithm, ExtentMapper, MapBlocks, Physical};
use crate::Error;

/// Largest uncompressed slice handed to a decoder at once.
pub const MAX_RAW_EXTENT: u64 = 1 << 20;

/// Split an uncompressed extent into slices of at most `MAX_RAW_EXTENT` bytes, lazily.
/// Compressed extents come back whole since a pcluster has to be decoded in one go.
pub fn raw_slices(map: &MapBlocks) -> impl Iterator<Item = MapBlocks> + '_ {
    let mut next = Some(0u64);
    iter::from_fn(move || {
        let off = next?;
        let left = map.llen - off;
        if map.compressed || left <= MAX_RAW_EXTENT {
            next = None;
            if off == 0 {
                return Some(map.clone());
            }
            return Some(slice(map, off, left));
        }
        next = Some(off + MAX_RAW_EXTENT);
        Some(slice(map, off, MAX_RAW_EXTENT))
    })
}

fn slice(map: &MapBlocks, off: u64, len: u64) -> MapBlocks {
    let physical = match map.physical {
        Physical::Device { device, addr } => Physical::Device {
            device,
            addr: addr + off,
        },
        Physical::Inline { addr } => Physical::Inline { addr: addr + off },
        x => x,
    };
    MapBlocks::flat(map.la + off, len, physical)
}

/// The bytes an extent decoded to: `out` for compressed extents, `raw` otherwise, trimmed to the
/// logical length.
pub fn decoded_bytes<'a>(map: &MapBlocks, raw: &'a [u8], out: &'a [u8]) -> &'a [u8] {
    let data = if map.compressed { out } else { raw };
    &data[..min(map.llen as usize, data.len())]
}

fn resize(buf: &mut Vec<u8>, len: u64) -> Result<(), Error> {
    let len = usize::try_from(len).map_err(|_| Error::ResourceExhaustion)?;
    buf.clear();
    buf.try_reserve(len)?;
    buf.resize(len, 0);
    Ok(())
}

impl Erofs {
    /// Read the physical bytes of an extent into `raw`. Holes read as `llen` zeros.
    pub fn read_raw(&self, map: &MapBlocks, raw: &mut Vec<u8>) -> Result<(), Error> {
        match map.physical {
            Physical::Hole => resize(raw, map.llen),
            Physical::Device { device, addr } => {
                resize(raw, map.plen)?;
                let (device, addr) = self.map_device(device, addr)?;
                self.read_dev(device, addr, raw)
            }
            Physical::Inline { addr } => {
                resize(raw, map.plen)?;
                self.read_at(addr, raw)
            }
            Physical::Fragment { .. } => {
                raw.clear();
                Ok(())
            }
        }
    }

    /// Fetch and, if needed, decompress one extent. Afterwards `decoded_bytes` gives the
    /// logical content.
    pub fn decode_extent(
        &self,
        inode: &Inode,
        map: &MapBlocks,
        raw: &mut Vec<u8>,
        out: &mut Vec<u8>,
    ) -> Result<(), Error> {
        if !map.compressed {
            return self.read_raw(map, raw);
        }
        resize(out, map.llen)?;
        if let Physical::Fragment { offset } = map.physical {
            raw.clear();
            return self.read_fragment(inode, offset, out);
        }
        if !map.is_mapped() {
            return Err(Error::StructuralCorruption("compressed extent without data"));
        }
        self.read_raw(map, raw)?;

        let llen = out.len();
        let bs = self.block_size() as usize;
        match map.algorithm {
            Some(Algorithm::Shifted) => {
                let src = raw
                    .get(..llen)
                    .ok_or(Error::StructuralCorruption("plain pcluster too short"))?;
                out.copy_from_slice(src);
            }
            Some(Algorithm::Interlaced) => {
                if raw.len() > bs || llen > bs {
                    return Err(Error::StructuralCorruption(
                        "interlaced pcluster larger than a block",
                    ));
                }
                let skip = self.blkoff(map.la) as usize;
                let right = min(bs - skip, llen);
                let (head, tail) = out.split_at_mut(right);
                head.copy_from_slice(
                    raw.get(skip..skip + right)
                        .ok_or(Error::StructuralCorruption("interlaced pcluster too short"))?,
                );
                tail.copy_from_slice(
                    raw.get(..tail.len())
                        .ok_or(Error::StructuralCorruption("interlaced pcluster too short"))?,
                );
            }
            Some(algorithm) => {
                let zero_padding = self.sb.has_incompat(FEATURE_INCOMPAT_ZERO_PADDING);
                let mut margin = 0;
                if zero_padding {
                    let first = &raw[..min(bs, raw.len())];
                    margin = first.iter().take_while(|x| **x == 0).count();
                    if margin >= raw.len() {
                        error!("invalid zero padding @ nid {} la {}", inode.nid, map.la);
                        return Err(Error::StructuralCorruption("pcluster is all padding"));
                    }
                }
                let partial = !map.full_mapped || map.partial_ref || !zero_padding;
                let n = self
                    .codec
                    .decompress(algorithm, &raw[margin..], out, partial)
                    .inspect_err(|e| {
                        error!(
                            "failed to decompress {:?} extent @ nid {} la {}: {}",
                            algorithm, inode.nid, map.la, e
                        );
                    })?;
                if n != llen {
                    error!(
                        "decompressed {} bytes, expected {} @ nid {} la {}",
                        n, llen, inode.nid, map.la
                    );
                    return Err(Error::StructuralCorruption("short decompression"));
                }
            }
            None => {
                return Err(Error::StructuralCorruption(
                    "compressed extent without an algorithm",
                ))
            }
        }
        Ok(())
    }

    fn read_fragment(&self, inode: &Inode, offset: u64, out: &mut [u8]) -> Result<(), Error> {
        if self.sb.packed_nid == 0 || inode.nid == self.sb.packed_nid {
            error!("fragment of nid {} has no packed inode to live in", inode.nid);
            return Err(Error::StructuralCorruption("fragment without a packed inode"));
        }
        let packed = self.read_inode(self.sb.packed_nid)?;
        self.read_data(&packed, offset, out)
    }

    /// Read `buf.len()` bytes of file content at `offset`.
    pub fn read_data(&self, inode: &Inode, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        let end = offset
            .checked_add(buf.len() as u64)
            .filter(|end| *end <= inode.size)
            .ok_or(Error::StructuralCorruption("read past the end of the inode"))?;
        let mapper = ExtentMapper::new(self, inode)?;
        let mut raw = vec![];
        let mut out = vec![];
        let mut pos = offset;
        while pos < end {
            let map = mapper.map_range(pos)?;
            if map.la > pos || map.end() <= pos {
                return Err(Error::StructuralCorruption(
                    "extent does not cover the read position",
                ));
            }
            let n = (min(end, map.end()) - pos) as usize;
            let skip = pos - map.la;
            let dst = &mut buf[(pos - offset) as usize..][..n];
            match map.physical {
                Physical::Hole => dst.fill(0),
                Physical::Device { device, addr } if !map.compressed => {
                    let (device, addr) = self.map_device(device, addr + skip)?;
                    self.read_dev(device, addr, dst)?;
                }
                Physical::Inline { addr } if !map.compressed => {
                    self.read_at(addr + skip, dst)?;
                }
                _ => {
                    self.decode_extent(inode, &map, &mut raw, &mut out)?;
                    let skip = skip as usize;
                    dst.copy_from_slice(&decoded_bytes(&map, &raw, &out)[skip..skip + n]);
                }
            }
            pos += n as u64;
        }
        Ok(())
    }
}
