// Mapping for compressed inodes with full (8 byte) or compacted (2 or 4 byte) lcluster indexes.
//
// Each lcluster of the file has one index. A HEAD (or PLAIN) index marks where a pcluster's
// output starts inside that lcluster (clusterofs) and where the pcluster lives (blkaddr). NONHEAD
// indexes in between carry delta[0], the distance back to their head, and delta[1], the distance
// forward to the next head. Mapping an offset is: load its lcluster, walk back to the head, then
// (for fiemap style lookups) walk forward to find where the extent ends.
//
// Compacted indexes come in packs: 2 entries in 8 bytes or 16 entries in 32 bytes. Each entry is
// `encodebits` wide, a 2 bit type above `lobits` of clusterofs or delta[0], and the pack ends in
// a le32 base blkaddr. Heads do not store their blkaddr; it is the base plus the blocks of the
// pclusters before them in the pack. The last entry of a pack keeps delta[1] instead of delta[0].
// Packs start with 4 byte entries up to a 32 byte boundary, then 2 byte packs (if advised) and
// 4 byte packs for the rest.

use std::cmp::max;
use std::mem::size_of;

use log::error;
use zerocopy::FromBytes;

use crate::disk::{
    compact_index_start, full_index_start, round_up, Layout, LogicalClusterIndex,
    LogicalClusterType, MapHeader, ADVISE_BIG_PCLUSTER_1, ADVISE_BIG_PCLUSTER_2,
    ADVISE_COMPACTED_2B, ADVISE_FRAGMENT_PCLUSTER,
    ADVISE_INLINE_PCLUSTER, ADVISE_INTERLACED_PCLUSTER, LI_D0_CBLKCNT, LI_PARTIAL_REF,
};
use crate::erofs::Erofs;
use crate::inode::Inode;
use crate::map::{Algorithm, MapBlocks, Physical};
use crate::Error;

const MAX_ALGORITHM: u8 = 4;
// compacted entries in 4 byte packs
const COMPACT_4B_MAX_LCLUSTERBITS: u32 = 14;
// compacted entries in 2 byte packs
const COMPACT_2B_MAX_LCLUSTERBITS: u32 = 12;
const COMPACT_ALIGN: u64 = 32;

#[derive(Debug, Clone)]
pub(crate) struct ZInfo {
    advise: u16,
    algorithms: [u8; 2],
    lclusterbits: u32,
    blkszbits: u32,
    compact: bool,
    index_start: u64,
    // lcn of the head of the tail extent, once known
    tail_headlcn: Option<u64>,
    idata_off: u64,
    idata_size: u64,
    fragment_offset: u64,
}

struct Recorder {
    lcn: u64,
    typ: LogicalClusterType,
    headtype: LogicalClusterType,
    clusterofs: u64,
    delta: [u16; 2],
    pblk: u32,
    compressedblks: u32,
    partial_ref: bool,
    next_pack_off: u64,
}

impl Recorder {
    fn new() -> Recorder {
        Recorder {
            lcn: 0,
            typ: LogicalClusterType::Plain,
            headtype: LogicalClusterType::Plain,
            clusterofs: 0,
            delta: [0, 0],
            pblk: 0,
            compressedblks: 0,
            partial_ref: false,
            next_pack_off: 0,
        }
    }
}

struct Lookup {
    map: MapBlocks,
    headlcn: u64,
    next_pack_off: u64,
    pblk: u32,
}

impl ZInfo {
    pub(crate) fn load(fs: &Erofs, inode: &Inode, layout: Layout) -> Result<ZInfo, Error> {
        let inode_end = fs.iloc(inode.nid)? + inode.inode_isize() + inode.xattr_isize as u64;
        let mut raw = [0u8; size_of::<MapHeader>()];
        fs.read_at(round_up(inode_end, 8), &mut raw)?;
        let h = MapHeader::read_from_bytes(&raw[..])
            .map_err(|_| Error::StructuralCorruption("map header"))?;
        let blkszbits = u32::from(fs.sb.blkszbits);

        if h.is_fragment_inode() {
            return Ok(ZInfo {
                advise: ADVISE_FRAGMENT_PCLUSTER,
                algorithms: [0, 0],
                lclusterbits: blkszbits,
                blkszbits,
                compact: false,
                index_start: 0,
                tail_headlcn: Some(0),
                idata_off: 0,
                idata_size: 0,
                fragment_offset: h.whole_fragment_offset(),
            });
        }

        let advise = h.advise.get();
        let compact = layout == Layout::CompressedCompact;
        let algorithms = [h.algorithm & 0xf, h.algorithm >> 4];
        if algorithms[0] >= MAX_ALGORITHM {
            error!(
                "unknown HEAD1 format {} @ nid {}",
                algorithms[0], inode.nid
            );
            return Err(Error::UnsupportedLayout("unknown compression algorithm"));
        }

        let lclusterbits = blkszbits + u32::from(h.cluster_bits & 0x7);
        if compact {
            if (advise & ADVISE_BIG_PCLUSTER_1 == 0) != (advise & ADVISE_BIG_PCLUSTER_2 == 0) {
                error!(
                    "big pcluster head1/2 of compact indexes differ @ nid {}",
                    inode.nid
                );
                return Err(Error::StructuralCorruption(
                    "inconsistent big pclusters in compact indexes",
                ));
            }
            if lclusterbits > COMPACT_4B_MAX_LCLUSTERBITS {
                error!(
                    "lcluster size 2^{} too large for compact indexes @ nid {}",
                    lclusterbits, inode.nid
                );
                return Err(Error::UnsupportedLayout("lcluster too large for compact indexes"));
            }
        }

        let mut z = ZInfo {
            advise,
            algorithms,
            lclusterbits,
            blkszbits,
            compact,
            index_start: if compact {
                compact_index_start(inode_end)
            } else {
                full_index_start(inode_end)
            },
            tail_headlcn: None,
            idata_off: 0,
            idata_size: 0,
            fragment_offset: 0,
        };

        if advise & ADVISE_INLINE_PCLUSTER != 0 {
            z.idata_size = h.idata_size().into();
            let map = z.find_tail(fs, inode)?;
            if map.plen == 0 || fs.blkoff(z.idata_off) + map.plen > fs.block_size() {
                error!(
                    "invalid tail-packing pclustersize {} @ nid {}",
                    map.plen, inode.nid
                );
                return Err(Error::StructuralCorruption(
                    "invalid tail-packing pclustersize",
                ));
            }
        }
        if advise & ADVISE_FRAGMENT_PCLUSTER != 0 {
            z.fragment_offset = h.fragment_offset().into();
            z.find_tail(fs, inode)?;
        }
        Ok(z)
    }

    fn has(&self, advise: u16) -> bool {
        self.advise & advise != 0
    }

    fn find_tail(&mut self, fs: &Erofs, inode: &Inode) -> Result<MapBlocks, Error> {
        let found = self.lookup(fs, inode, 0, true)?;
        self.tail_headlcn = Some(found.headlcn);
        if self.has(ADVISE_INLINE_PCLUSTER) {
            self.idata_off = found.next_pack_off;
        }
        // full indexes keep the high half of the fragment offset in the tail head's blkaddr
        if self.has(ADVISE_FRAGMENT_PCLUSTER) && !self.compact {
            self.fragment_offset |= u64::from(found.pblk) << 32;
        }
        Ok(found.map)
    }

    pub(crate) fn map(&self, fs: &Erofs, inode: &Inode, la: u64) -> Result<MapBlocks, Error> {
        if self.has(ADVISE_FRAGMENT_PCLUSTER) && self.tail_headlcn == Some(0) {
            return Ok(MapBlocks {
                la: 0,
                llen: inode.size,
                plen: 0,
                physical: Physical::Fragment {
                    offset: self.fragment_offset,
                },
                compressed: true,
                algorithm: None,
                full_mapped: true,
                partial_ref: false,
            });
        }
        Ok(self.lookup(fs, inode, la, false)?.map)
    }

    fn load_cluster(
        &self,
        fs: &Erofs,
        inode: &Inode,
        m: &mut Recorder,
        lcn: u64,
    ) -> Result<(), Error> {
        if self.compact {
            self.load_compact_cluster(fs, inode, m, lcn)
        } else {
            self.load_full_cluster(fs, inode, m, lcn)
        }
    }

    fn load_full_cluster(
        &self,
        fs: &Erofs,
        inode: &Inode,
        m: &mut Recorder,
        lcn: u64,
    ) -> Result<(), Error> {
        let total = inode.size.div_ceil(1u64 << self.lclusterbits);
        if lcn > total {
            error!("lcluster {} out of range @ nid {}", lcn, inode.nid);
            return Err(Error::StructuralCorruption("lcluster out of range"));
        }
        let pos = self.index_start + lcn * size_of::<LogicalClusterIndex>() as u64;
        let mut raw = [0u8; size_of::<LogicalClusterIndex>()];
        fs.read_at(pos, &mut raw)?;
        let di = LogicalClusterIndex::read_from_bytes(&raw[..])
            .map_err(|_| Error::StructuralCorruption("lcluster index"))?;

        m.lcn = lcn;
        m.next_pack_off = pos + size_of::<LogicalClusterIndex>() as u64;
        m.typ = di.typ();
        match m.typ {
            LogicalClusterType::NonHead => {
                m.clusterofs = 1 << self.lclusterbits;
                m.delta = di.delta();
                if m.delta[0] & LI_D0_CBLKCNT != 0 {
                    if !self.has(ADVISE_BIG_PCLUSTER_1 | ADVISE_BIG_PCLUSTER_2) {
                        return Err(Error::StructuralCorruption(
                            "CBLKCNT without big pclusters",
                        ));
                    }
                    m.compressedblks = u32::from(m.delta[0] & !LI_D0_CBLKCNT);
                    m.delta[0] = 1;
                }
            }
            _ => {
                if di.advise.get() & LI_PARTIAL_REF != 0 {
                    m.partial_ref = true;
                }
                m.clusterofs = di.cluster_offset.get().into();
                m.pblk = di.block_addr();
            }
        }
        Ok(())
    }

    fn load_compact_cluster(
        &self,
        fs: &Erofs,
        inode: &Inode,
        m: &mut Recorder,
        lcn: u64,
    ) -> Result<(), Error> {
        let total = inode.size.div_ceil(1u64 << self.lclusterbits);
        if lcn >= total {
            error!("lcluster {} out of range @ nid {}", lcn, inode.nid);
            return Err(Error::StructuralCorruption("lcluster out of range"));
        }
        let ebase = self.index_start;
        let initial_4b = (COMPACT_ALIGN - ebase % COMPACT_ALIGN) % COMPACT_ALIGN / 4;
        let compacted_2b = if self.has(ADVISE_COMPACTED_2B) && initial_4b < total {
            (total - initial_4b) / 16 * 16
        } else {
            0
        };

        let (pos, entry_size) = if lcn < initial_4b {
            (ebase + lcn * 4, 4)
        } else if lcn - initial_4b < compacted_2b {
            (ebase + initial_4b * 4 + (lcn - initial_4b) * 2, 2)
        } else {
            let rest = lcn - initial_4b - compacted_2b;
            (ebase + initial_4b * 4 + compacted_2b * 2 + rest * 4, 4)
        };
        self.unpack_compact(fs, inode, m, lcn, pos, entry_size)
    }

    fn unpack_compact(
        &self,
        fs: &Erofs,
        inode: &Inode,
        m: &mut Recorder,
        lcn: u64,
        pos: u64,
        entry_size: u64,
    ) -> Result<(), Error> {
        let vcnt: usize = match entry_size {
            4 if self.lclusterbits <= COMPACT_4B_MAX_LCLUSTERBITS => 2,
            2 if self.lclusterbits <= COMPACT_2B_MAX_LCLUSTERBITS => 16,
            _ => {
                error!("unsupported compact index width @ nid {}", inode.nid);
                return Err(Error::UnsupportedLayout("compact index width"));
            }
        };
        let pack_size = vcnt as u64 * entry_size;
        let pack_start = pos / pack_size * pack_size;
        let mut buf = [0u8; COMPACT_ALIGN as usize];
        let pack = &mut buf[..pack_size as usize];
        fs.read_at(pack_start, pack)?;
        let pack = CompactPack::new(pack, self.lclusterbits, vcnt);

        m.lcn = lcn;
        m.next_pack_off = pack_start + pack_size;
        let i = ((pos - pack_start) / entry_size) as usize;
        let (lo, typ) = pack.entry(i);
        m.typ = typ;

        if typ == LogicalClusterType::NonHead {
            m.clusterofs = 1 << self.lclusterbits;
            m.delta[1] = pack.lookahead(i);
            if lo & LI_D0_CBLKCNT != 0 {
                if !self.has(ADVISE_BIG_PCLUSTER_1) {
                    return Err(Error::StructuralCorruption("CBLKCNT without big pclusters"));
                }
                m.compressedblks = u32::from(lo & !LI_D0_CBLKCNT);
                m.delta[0] = 1;
            } else if i + 1 != vcnt {
                m.delta[0] = lo;
            } else {
                // the last entry keeps delta[1], so delta[0] comes from the one before it
                m.delta[0] = match pack.entry(i - 1) {
                    (lo, LogicalClusterType::NonHead) if lo & LI_D0_CBLKCNT != 0 => 2,
                    (lo, LogicalClusterType::NonHead) => lo.saturating_add(1),
                    _ => 1,
                };
            }
            return Ok(());
        }

        m.clusterofs = lo.into();
        m.delta[0] = 0;
        let nblk = if self.has(ADVISE_BIG_PCLUSTER_1) {
            pack.blocks_before_big(i).ok_or_else(|| {
                error!("bogus big pcluster in compact pack @ nid {}", inode.nid);
                Error::StructuralCorruption("bogus big pcluster in compact indexes")
            })?
        } else {
            pack.blocks_before(i)
        };
        m.pblk = pack.base().wrapping_add(nblk);
        Ok(())
    }

    // walk back from m.lcn to the head of its extent, returning the extent's logical start
    fn lookback(
        &self,
        fs: &Erofs,
        inode: &Inode,
        m: &mut Recorder,
        distance: u16,
    ) -> Result<u64, Error> {
        let mut distance = u64::from(distance);
        while m.lcn >= distance {
            let lcn = m.lcn - distance;
            self.load_cluster(fs, inode, m, lcn)?;
            if m.typ == LogicalClusterType::NonHead {
                if m.delta[0] == 0 {
                    error!("invalid lookback distance 0 @ nid {}", inode.nid);
                    return Err(Error::StructuralCorruption("invalid lookback distance 0"));
                }
                distance = m.delta[0].into();
                continue;
            }
            m.headtype = m.typ;
            return Ok((lcn << self.lclusterbits) | m.clusterofs);
        }
        error!("bogus lookback distance @ nid {}", inode.nid);
        Err(Error::StructuralCorruption("bogus lookback distance"))
    }

    fn compressed_len(&self, fs: &Erofs, inode: &Inode, m: &mut Recorder) -> Result<u64, Error> {
        let big = match m.headtype {
            LogicalClusterType::Head1 => self.has(ADVISE_BIG_PCLUSTER_1),
            LogicalClusterType::Head2 => self.has(ADVISE_BIG_PCLUSTER_2),
            _ => false,
        };
        if !big {
            return Ok(1 << self.lclusterbits);
        }

        if m.compressedblks == 0 && (m.lcn + 1) << self.lclusterbits >= inode.size {
            m.compressedblks = 1;
        }
        if m.compressedblks == 0 {
            let lcn = m.lcn + 1;
            self.load_cluster(fs, inode, m, lcn)?;
            match m.typ {
                LogicalClusterType::NonHead => {
                    if m.delta[0] != 1 {
                        error!("bogus CBLKCNT @ lcn {} of nid {}", lcn, inode.nid);
                        return Err(Error::StructuralCorruption("bogus CBLKCNT"));
                    }
                    if m.compressedblks == 0 {
                        error!("cannot find CBLKCNT @ lcn {} of nid {}", lcn, inode.nid);
                        return Err(Error::StructuralCorruption("cannot find CBLKCNT"));
                    }
                }
                // the next lcluster is a head already so this pcluster is one lcluster long
                _ => m.compressedblks = 1 << (self.lclusterbits - self.blkszbits),
            }
        }
        Ok(u64::from(m.compressedblks) << self.blkszbits)
    }

    // scan forward to the next head to find where the extent starting at `la` ends
    fn decompressed_len(
        &self,
        fs: &Erofs,
        inode: &Inode,
        m: &mut Recorder,
        la: u64,
    ) -> Result<u64, Error> {
        let bits = self.lclusterbits;
        let headlcn = la >> bits;
        let mut lcn = m.lcn;
        loop {
            // the last pcluster has no next head
            match lcn.checked_mul(1 << bits) {
                Some(start) if start < inode.size => {}
                _ => return Ok(inode.size - la),
            }
            self.load_cluster(fs, inode, m, lcn)?;
            if m.typ != LogicalClusterType::NonHead {
                if lcn != headlcn {
                    break;
                }
                m.delta[1] = 1;
            }
            lcn += u64::from(m.delta[1]);
            if m.delta[1] == 0 {
                break;
            }
        }
        ((lcn << bits) + m.clusterofs)
            .checked_sub(la)
            .ok_or(Error::StructuralCorruption("extent ends before it starts"))
    }

    fn lookup(
        &self,
        fs: &Erofs,
        inode: &Inode,
        la: u64,
        find_tail: bool,
    ) -> Result<Lookup, Error> {
        let bits = self.lclusterbits;
        let ztailpacking = self.has(ADVISE_INLINE_PCLUSTER);
        let fragment = self.has(ADVISE_FRAGMENT_PCLUSTER);
        let ofs = if find_tail {
            inode
                .size
                .checked_sub(1)
                .ok_or(Error::StructuralCorruption("tail lookup on an empty file"))?
        } else {
            la
        };
        let initial_lcn = ofs >> bits;
        let endoff = ofs & ((1 << bits) - 1);

        let mut m = Recorder::new();
        self.load_cluster(fs, inode, &mut m, initial_lcn)?;
        let next_pack_off = m.next_pack_off;

        let mut end = (m.lcn + 1) << bits;
        let mut full_mapped = false;
        let map_la = match m.typ {
            LogicalClusterType::NonHead => {
                let distance = m.delta[0];
                self.lookback(fs, inode, &mut m, distance)?
            }
            _ if endoff >= m.clusterofs => {
                m.headtype = m.typ;
                // special EOF lclusters of ztailpacking files can have 3 parts
                if ztailpacking && end > inode.size {
                    end = inode.size;
                }
                (m.lcn << bits) | m.clusterofs
            }
            _ => {
                // the offset belongs to the previous extent
                if m.lcn == 0 {
                    error!("invalid logical cluster 0 @ nid {}", inode.nid);
                    return Err(Error::StructuralCorruption("invalid logical cluster 0"));
                }
                end = (m.lcn << bits) | m.clusterofs;
                full_mapped = true;
                self.lookback(fs, inode, &mut m, 1)?
            }
        };
        let llen = end
            .checked_sub(map_la)
            .ok_or(Error::StructuralCorruption("extent ends before it starts"))?;

        let headlcn = m.lcn;
        let pblk = m.pblk;
        let tail_headlcn = if find_tail {
            Some(headlcn)
        } else {
            self.tail_headlcn
        };
        let is_tail = tail_headlcn == Some(headlcn);
        let (physical, plen) = if ztailpacking && is_tail {
            let addr = if find_tail {
                next_pack_off
            } else {
                self.idata_off
            };
            (Physical::Inline { addr }, self.idata_size)
        } else if fragment && is_tail {
            (
                Physical::Fragment {
                    offset: self.fragment_offset,
                },
                0,
            )
        } else {
            let plen = self.compressed_len(fs, inode, &mut m)?;
            (
                Physical::Device {
                    device: 0,
                    addr: u64::from(pblk) << self.blkszbits,
                },
                plen,
            )
        };

        let algorithm = if m.headtype == LogicalClusterType::Plain {
            if !matches!(physical, Physical::Fragment { .. }) && llen > plen {
                error!(
                    "plain pcluster shorter than its extent @ nid {}",
                    inode.nid
                );
                return Err(Error::StructuralCorruption(
                    "plain pcluster shorter than its extent",
                ));
            }
            if self.has(ADVISE_INTERLACED_PCLUSTER) {
                Algorithm::Interlaced
            } else {
                Algorithm::Shifted
            }
        } else if m.headtype == LogicalClusterType::Head2 {
            Algorithm::from_raw(self.algorithms[1])
        } else {
            Algorithm::from_raw(self.algorithms[0])
        };

        let mut map = MapBlocks {
            la: map_la,
            llen,
            plen,
            physical,
            compressed: true,
            algorithm: Some(algorithm),
            full_mapped,
            partial_ref: m.partial_ref,
        };
        if !find_tail {
            map.llen = self.decompressed_len(fs, inode, &mut m, map_la)?;
            map.full_mapped = true;
        }
        Ok(Lookup {
            map,
            headlcn,
            next_pack_off,
            pblk,
        })
    }
}

// One pack of compacted lcluster indexes.
struct CompactPack<'a> {
    bytes: &'a [u8],
    lobits: u32,
    encodebits: usize,
    vcnt: usize,
}

impl<'a> CompactPack<'a> {
    fn new(bytes: &'a [u8], lclusterbits: u32, vcnt: usize) -> CompactPack<'a> {
        CompactPack {
            bytes,
            lobits: max(lclusterbits, LI_D0_CBLKCNT.ilog2() + 1),
            encodebits: (bytes.len() - 4) * 8 / vcnt,
            vcnt,
        }
    }

    fn entry(&self, i: usize) -> (u16, LogicalClusterType) {
        let bit = self.encodebits * i;
        let b = &self.bytes[bit / 8..bit / 8 + 4];
        let v = u32::from_le_bytes([b[0], b[1], b[2], b[3]]) >> (bit % 8);
        let lo = (v & ((1 << self.lobits) - 1)) as u16;
        (lo, LogicalClusterType::from_raw((v >> self.lobits) as u16))
    }

    fn base(&self) -> u32 {
        let b = &self.bytes[self.bytes.len() - 4..];
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    // nonheads from `i` up to the next head, extended by the last entry's delta[1]
    fn lookahead(&self, i: usize) -> u16 {
        let mut d1 = 0u16;
        let mut lo = 0;
        for j in i..self.vcnt {
            let (l, typ) = self.entry(j);
            if typ != LogicalClusterType::NonHead {
                return d1;
            }
            lo = l;
            d1 += 1;
        }
        if lo & LI_D0_CBLKCNT == 0 {
            d1 = (d1 + lo).saturating_sub(1);
        }
        d1
    }

    // 1 + pclusters whose heads sit before `i` in this pack, one block each
    fn blocks_before(&self, i: usize) -> u32 {
        let mut nblk = 1;
        let mut i = i as isize;
        while i > 0 {
            i -= 1;
            let (lo, typ) = self.entry(i as usize);
            if typ == LogicalClusterType::NonHead {
                i -= lo as isize;
            }
            if i >= 0 {
                nblk += 1;
            }
        }
        nblk
    }

    // blocks of the big pclusters before `i` in this pack, sized by their CBLKCNT
    fn blocks_before_big(&self, i: usize) -> Option<u32> {
        let mut nblk = 0u32;
        let mut i = i as isize;
        while i > 0 {
            i -= 1;
            let (lo, typ) = self.entry(i as usize);
            if typ == LogicalClusterType::NonHead {
                if lo & LI_D0_CBLKCNT != 0 {
                    i -= 1;
                    nblk += u32::from(lo & !LI_D0_CBLKCNT);
                    continue;
                }
                // big pclusters never have a plain delta[0] of 1
                if lo <= 1 {
                    return None;
                }
                i -= lo as isize - 2;
                continue;
            }
            nblk += 1;
        }
        Some(nblk)
    }
}
