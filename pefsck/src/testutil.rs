// A small image writer for tests. It lays out a superblock, a data area starting at block 1 and a
// metadata area after the data, and lets tests describe inodes directly in on-disk terms
// (lcluster indexes, chunk tables, raw xattr bodies) so corrupt shapes are easy to produce.

use std::collections::HashMap;
use std::mem::size_of;

use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{FromZeros, IntoBytes};

use crate::device::Device;
use crate::disk::{
    format_layout, round_up, ChunkIndex, DeviceSlot, Dirent, InodeCompact, InodeExtended,
    Layout, LogicalClusterType, Superblock, CHUNK_FORMAT_INDEXES, EROFS_NULL_ADDR,
    EROFS_SUPER_MAGIC_V1, EROFS_SUPER_OFFSET, FEATURE_COMPAT_SB_CHKSUM,
    FEATURE_INCOMPAT_CHUNKED_FILE, FEATURE_INCOMPAT_DEVICE_TABLE, FEATURE_INCOMPAT_FRAGMENTS,
    INODE_SLOT_BITS, LI_D0_CBLKCNT, LI_PARTIAL_REF, SUPERBLOCK_CHECKSUM_OFFSET,
    ADVISE_BIG_PCLUSTER_1, ADVISE_COMPACTED_2B,
};
use crate::erofs::Erofs;
use crate::superblock::compute_checksum;

pub const BLKSZBITS: u8 = 12;
pub const BLOCK_SIZE: usize = 1 << BLKSZBITS;
pub const BUILD_TIME: u64 = 1_700_000_000;

pub type NodeId = usize;

#[derive(Debug, Clone, Copy)]
pub struct Lcluster {
    advise: u16,
    clusterofs: u16,
    raw: [u8; 4],
}

impl Lcluster {
    pub fn head(typ: LogicalClusterType, clusterofs: u16, blkaddr: u32) -> Lcluster {
        Lcluster {
            advise: typ as u16,
            clusterofs,
            raw: blkaddr.to_le_bytes(),
        }
    }

    pub fn nonhead(d0: u16, d1: u16) -> Lcluster {
        let mut raw = [0u8; 4];
        raw[..2].copy_from_slice(&d0.to_le_bytes());
        raw[2..].copy_from_slice(&d1.to_le_bytes());
        Lcluster {
            advise: LogicalClusterType::NonHead as u16,
            clusterofs: 0,
            raw,
        }
    }

    pub fn partial_ref(mut self) -> Lcluster {
        self.advise |= LI_PARTIAL_REF;
        self
    }

    fn typ(&self) -> LogicalClusterType {
        LogicalClusterType::from_raw(self.advise)
    }

    fn delta(&self) -> [u16; 2] {
        [
            u16::from_le_bytes([self.raw[0], self.raw[1]]),
            u16::from_le_bytes([self.raw[2], self.raw[3]]),
        ]
    }

    fn blkaddr(&self) -> u32 {
        u32::from_le_bytes(self.raw)
    }
}

// One pack of compacted indexes: `entries` padded to `vcnt` with zeroed PLAIN entries, then the
// le32 base blkaddr that makes every head in the pack decode to its own blkaddr.
fn compact_pack(
    entries: &[Lcluster],
    vcnt: usize,
    size: usize,
    lclusterbits: u32,
    big: bool,
) -> Vec<u8> {
    let mut entries = entries.to_vec();
    entries.resize(vcnt, Lcluster::head(LogicalClusterType::Plain, 0, 0));
    let lobits = lclusterbits.max(12) as usize;
    let encodebits = (vcnt * size * 8 - 32) / vcnt;
    let mut out = vec![0u8; vcnt * size];
    let mut base = None;
    for (i, l) in entries.iter().enumerate() {
        let lo = if l.typ() == LogicalClusterType::NonHead {
            let d = l.delta();
            if d[0] & LI_D0_CBLKCNT == 0 && i + 1 == vcnt {
                d[1].min((1 << lobits) - 1)
            } else {
                d[0]
            }
        } else {
            // blocks of the pclusters before this head that start in this pack
            let before = &entries[..i];
            let nblk: u32 = if big {
                before
                    .iter()
                    .enumerate()
                    .map(|(k, x)| match x.typ() {
                        LogicalClusterType::NonHead if x.delta()[0] & LI_D0_CBLKCNT != 0 => {
                            u32::from(x.delta()[0] & !LI_D0_CBLKCNT)
                        }
                        LogicalClusterType::NonHead => 0,
                        _ if k + 1 == i => 1,
                        _ if before[k + 1].typ() != LogicalClusterType::NonHead => 1,
                        _ => 0,
                    })
                    .sum()
            } else {
                1 + before
                    .iter()
                    .filter(|x| x.typ() != LogicalClusterType::NonHead)
                    .count() as u32
            };
            let b = l.blkaddr().wrapping_sub(nblk);
            if l.blkaddr() != 0 {
                assert!(base.is_none() || base == Some(b), "heads of a pack disagree");
                base = Some(b);
            }
            l.clusterofs
        };
        let v = ((l.typ() as usize) << lobits) | usize::from(lo);
        for bit in 0..lobits + 2 {
            if v >> bit & 1 != 0 {
                let at = i * encodebits + bit;
                out[at / 8] |= 1 << (at % 8);
            }
        }
    }
    let n = out.len();
    out[n - 4..].copy_from_slice(&base.unwrap_or(0).to_le_bytes());
    out
}

// compacted indexes starting at absolute position `ebase`, laid out the way the reader expects
fn compact_indexes(
    lclusters: &[Lcluster],
    ebase: usize,
    advise: u16,
    lclusterbits: u32,
) -> Vec<u8> {
    let total = lclusters.len();
    let big = advise & ADVISE_BIG_PCLUSTER_1 != 0;
    let initial_4b = ((32 - ebase % 32) % 32 / 4).min(total);
    let compacted_2b = if advise & ADVISE_COMPACTED_2B != 0 && initial_4b < total {
        (total - initial_4b) / 16 * 16
    } else {
        0
    };
    let mut out = vec![];
    let (head, rest) = lclusters.split_at(initial_4b);
    let (two, tail) = rest.split_at(compacted_2b);
    for pack in head.chunks(2) {
        out.extend(compact_pack(pack, 2, 4, lclusterbits, big));
    }
    for pack in two.chunks(16) {
        out.extend(compact_pack(pack, 16, 2, lclusterbits, big));
    }
    for pack in tail.chunks(2) {
        out.extend(compact_pack(pack, 2, 4, lclusterbits, big));
    }
    out
}

#[derive(Debug, Clone)]
enum Body {
    Flat {
        data: Vec<u8>,
        inline: bool,
    },
    Special {
        rdev: u32,
    },
    Dir {
        entries: Vec<(String, NodeId)>,
    },
    Chunks {
        size: u64,
        format: u16,
        table: Vec<u8>,
    },
    Compressed {
        size: u64,
        layout: Layout,
        header: [u8; 8],
        lclusters: Vec<Lcluster>,
        tail: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
pub struct Node {
    mode: u16,
    uid: u32,
    gid: u32,
    extended: bool,
    mtime: (u64, u32),
    xattrs: Vec<u8>,
    body: Body,
}

impl Node {
    fn new(mode: u16, body: Body) -> Node {
        Node {
            mode,
            uid: 0,
            gid: 0,
            extended: false,
            mtime: (BUILD_TIME, 0),
            xattrs: vec![],
            body,
        }
    }

    /// Regular file with its tail packed after the inode.
    pub fn file(data: Vec<u8>) -> Node {
        Node::new(0o100644, Body::Flat { data, inline: true })
    }

    pub fn symlink(target: &str) -> Node {
        Node::new(
            0o120777,
            Body::Flat {
                data: target.as_bytes().to_vec(),
                inline: true,
            },
        )
    }

    /// Device, fifo or socket node; `rdev` is the raw new_encode_dev value.
    pub fn special(mode: u16, rdev: u32) -> Node {
        Node::new(mode, Body::Special { rdev })
    }

    pub fn dir(entries: Vec<(&str, NodeId)>) -> Node {
        let entries = entries
            .into_iter()
            .map(|(name, id)| (name.to_string(), id))
            .collect();
        Node::new(0o040755, Body::Dir { entries })
    }

    /// Chunk based file with an 8 byte index table; entries are (device, blkaddr) or a hole.
    pub fn chunked(size: u64, chunkbits: u16, entries: Vec<Option<(u16, u32)>>) -> Node {
        let mut table = vec![];
        for e in entries {
            let mut idx = ChunkIndex::new_zeroed();
            match e {
                Some((device, blkaddr)) => {
                    idx.device_id = U16::new(device);
                    idx.blkaddr = U32::new(blkaddr);
                }
                None => idx.blkaddr = U32::new(EROFS_NULL_ADDR),
            }
            table.extend_from_slice(idx.as_bytes());
        }
        Node::chunked_raw(size, chunkbits | CHUNK_FORMAT_INDEXES, table)
    }

    pub fn chunked_raw(size: u64, format: u16, table: Vec<u8>) -> Node {
        Node::new(
            0o100644,
            Body::Chunks {
                size,
                format,
                table,
            },
        )
    }

    /// File with full lcluster indexes. `algorithm` packs head1 in the low nibble and head2 in
    /// the high nibble.
    pub fn compressed(size: u64, advise: u16, algorithm: u8, lclusters: Vec<Lcluster>) -> Node {
        let mut header = [0u8; 8];
        header[4..6].copy_from_slice(&advise.to_le_bytes());
        header[6] = algorithm;
        Node::new(
            0o100644,
            Body::Compressed {
                size,
                layout: Layout::CompressedFull,
                header,
                lclusters,
                tail: vec![],
            },
        )
    }

    /// File whose whole content lives in the packed inode at `offset`.
    pub fn whole_fragment(size: u64, offset: u64) -> Node {
        Node::new(
            0o100644,
            Body::Compressed {
                size,
                layout: Layout::CompressedFull,
                header: (offset | (1 << 63)).to_le_bytes(),
                lclusters: vec![],
                tail: vec![],
            },
        )
    }

    pub fn plain(mut self) -> Node {
        if let Body::Flat { inline, .. } = &mut self.body {
            *inline = false;
        }
        self
    }

    pub fn compact(mut self) -> Node {
        if let Body::Compressed { layout, .. } = &mut self.body {
            *layout = Layout::CompressedCompact;
        }
        self
    }

    /// Pack `data` after the lcluster indexes as the tail pcluster.
    pub fn inline_tail(mut self, data: Vec<u8>) -> Node {
        if let Body::Compressed { header, tail, .. } = &mut self.body {
            header[2..4].copy_from_slice(&(data.len() as u16).to_le_bytes());
            *tail = data;
        }
        self
    }

    pub fn fragment_offset(mut self, offset: u32) -> Node {
        if let Body::Compressed { header, .. } = &mut self.body {
            header[..4].copy_from_slice(&offset.to_le_bytes());
        }
        self
    }

    pub fn cluster_bits(mut self, bits: u8) -> Node {
        if let Body::Compressed { header, .. } = &mut self.body {
            header[7] = bits;
        }
        self
    }

    pub fn mode(mut self, mode: u16) -> Node {
        self.mode = mode;
        self
    }

    pub fn owner(mut self, uid: u32, gid: u32) -> Node {
        self.uid = uid;
        self.gid = gid;
        if uid > u16::MAX.into() || gid > u16::MAX.into() {
            self.extended = true;
        }
        self
    }

    pub fn mtime(mut self, sec: u64, nsec: u32) -> Node {
        self.mtime = (sec, nsec);
        self.extended = true;
        self
    }

    pub fn extended(mut self) -> Node {
        self.extended = true;
        self
    }

    /// Raw xattr body, header included. Its length must be 12 + 4n.
    pub fn xattrs(mut self, body: Vec<u8>) -> Node {
        self.xattrs = body;
        self
    }

    fn size(&self, dir_sizes: &HashMap<NodeId, u64>, id: NodeId) -> u64 {
        match &self.body {
            Body::Flat { data, .. } => data.len() as u64,
            Body::Special { .. } => 0,
            Body::Dir { .. } => dir_sizes.get(&id).copied().unwrap_or(0),
            Body::Chunks { size, .. } | Body::Compressed { size, .. } => *size,
        }
    }

    fn layout(&self) -> Layout {
        match &self.body {
            Body::Flat { data, inline } => {
                if *inline && data.len() % BLOCK_SIZE != 0 {
                    Layout::FlatInline
                } else {
                    Layout::FlatPlain
                }
            }
            Body::Special { .. } | Body::Dir { .. } => Layout::FlatPlain,
            Body::Chunks { .. } => Layout::ChunkBased,
            Body::Compressed { layout, .. } => *layout,
        }
    }

    fn inode_isize(&self) -> usize {
        if self.extended {
            size_of::<InodeExtended>()
        } else {
            size_of::<InodeCompact>()
        }
    }

    fn file_type(&self) -> u8 {
        match self.mode & 0o170000 {
            0o100000 => 1,
            0o040000 => 2,
            0o020000 => 3,
            0o060000 => 4,
            0o010000 => 5,
            0o140000 => 6,
            0o120000 => 7,
            _ => 0,
        }
    }

    // bytes that follow the inode record and xattrs; `at` is the absolute position they start at
    fn trailer(&self, at: usize) -> Vec<u8> {
        let mut out = vec![];
        match &self.body {
            Body::Flat { data, .. } if self.layout() == Layout::FlatInline => {
                out.extend_from_slice(&data[data.len() / BLOCK_SIZE * BLOCK_SIZE..]);
            }
            Body::Chunks { format, table, .. } => {
                let unit = if format & CHUNK_FORMAT_INDEXES != 0 { 8 } else { 4 };
                out.resize(round_up(at as u64, unit) as usize - at, 0);
                out.extend_from_slice(table);
            }
            Body::Compressed {
                header,
                lclusters,
                tail,
                ..
            } => {
                out.resize(round_up(at as u64, 8) as usize - at, 0);
                out.extend_from_slice(header);
                if header[7] & 0x80 == 0 && self.layout() == Layout::CompressedCompact {
                    let advise = u16::from_le_bytes([header[4], header[5]]);
                    let lclusterbits = u32::from(BLKSZBITS) + u32::from(header[7] & 0x7);
                    out.extend(compact_indexes(lclusters, at + out.len(), advise, lclusterbits));
                    out.extend_from_slice(tail);
                } else if header[7] & 0x80 == 0 {
                    out.extend_from_slice(&[0; 8]);
                    for l in lclusters {
                        out.extend_from_slice(&l.advise.to_le_bytes());
                        out.extend_from_slice(&l.clusterofs.to_le_bytes());
                        out.extend_from_slice(&l.raw);
                    }
                    out.extend_from_slice(tail);
                }
            }
            _ => {}
        }
        out
    }
}

/// One block of dirents in the order given, names packed after the records.
pub fn dirent_block(entries: &[(&str, u64, u8)]) -> Vec<u8> {
    let mut out = vec![];
    let mut nameoff = entries.len() * size_of::<Dirent>();
    for (name, nid, file_type) in entries {
        let mut d = Dirent::new_zeroed();
        d.nid = U64::new(*nid);
        d.name_offset = U16::new(nameoff as u16);
        d.file_type = *file_type;
        out.extend_from_slice(d.as_bytes());
        nameoff += name.len();
    }
    for (name, _, _) in entries {
        out.extend_from_slice(name.as_bytes());
    }
    out
}

// sorted entries split into blocks the way mkfs does it
fn dir_blocks(entries: &mut [(String, u64, u8)]) -> Vec<Vec<u8>> {
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    let mut blocks = vec![];
    let mut start = 0;
    let mut used = 0;
    for i in 0..entries.len() {
        let need = size_of::<Dirent>() + entries[i].0.len();
        if used + need > BLOCK_SIZE {
            blocks.push(&entries[start..i]);
            start = i;
            used = 0;
        }
        used += need;
    }
    blocks.push(&entries[start..]);
    blocks
        .into_iter()
        .map(|chunk| {
            let refs: Vec<(&str, u64, u8)> = chunk
                .iter()
                .map(|(n, nid, t)| (n.as_str(), *nid, *t))
                .collect();
            dirent_block(&refs)
        })
        .collect()
}

pub struct Image {
    pub bytes: Vec<u8>,
    pub nids: Vec<u64>,
    pub devices: Vec<Vec<u8>>,
    meta_base: usize,
    data_at: Vec<Option<usize>>,
}

impl Image {
    /// Byte position of the inode record of `id`.
    pub fn inode_offset(&self, id: NodeId) -> usize {
        self.meta_base + ((self.nids[id] as usize) << INODE_SLOT_BITS)
    }

    /// Byte position of the first data block of `id`, for flat files and directories.
    pub fn data_offset(&self, id: NodeId) -> usize {
        self.data_at[id].unwrap()
    }

    /// Open a copy of the image with its extra devices attached.
    pub fn erofs(&self) -> Erofs {
        let devices = self
            .devices
            .iter()
            .map(|d| Box::new(d.clone()) as Box<dyn Device>)
            .collect();
        Erofs::open(Box::new(self.bytes.clone()))
            .unwrap()
            .with_devices(devices)
            .unwrap()
    }
}

#[derive(Default)]
pub struct ImageBuilder {
    nodes: Vec<Node>,
    data: Vec<u8>,
    blkaddr: Vec<Option<u32>>,
    root: Option<NodeId>,
    packed: Option<NodeId>,
    incompat: u32,
    devices: Vec<(u32, u32)>,
    device_data: Vec<(u16, u32, Vec<u8>)>,
}

impl ImageBuilder {
    pub fn new() -> ImageBuilder {
        ImageBuilder::default()
    }

    pub fn extra_device(mut self, blocks: u32, mapped_blkaddr: u32) -> ImageBuilder {
        self.devices.push((blocks, mapped_blkaddr));
        self.incompat |= FEATURE_INCOMPAT_DEVICE_TABLE;
        self
    }

    pub fn incompat(&mut self, feature: u32) {
        self.incompat |= feature;
    }

    /// Append block padded data to the primary device and return its first block.
    pub fn add_data(&mut self, data: &[u8]) -> u32 {
        let blkaddr = (1 + self.data.len() / BLOCK_SIZE) as u32;
        self.data.extend_from_slice(data);
        self.data.resize(round_up(self.data.len() as u64, BLOCK_SIZE as u64) as usize, 0);
        blkaddr
    }

    /// Write `data` at block `blkaddr` of extra device `device` (1 based).
    pub fn device_data(&mut self, device: u16, blkaddr: u32, data: &[u8]) {
        self.device_data.push((device, blkaddr, data.to_vec()));
    }

    pub fn add(&mut self, node: Node) -> NodeId {
        let blkaddr = match &node.body {
            Body::Flat { data, .. } => {
                let full = match node.layout() {
                    Layout::FlatInline => data.len() / BLOCK_SIZE * BLOCK_SIZE,
                    _ => data.len(),
                };
                if full > 0 {
                    Some(self.add_data(&data[..full]))
                } else {
                    None
                }
            }
            _ => None,
        };
        if let Body::Chunks { .. } = node.body {
            self.incompat |= FEATURE_INCOMPAT_CHUNKED_FILE;
        }
        self.nodes.push(node);
        self.blkaddr.push(blkaddr);
        self.nodes.len() - 1
    }

    pub fn root(&mut self, entries: Vec<(&str, NodeId)>) -> NodeId {
        let id = self.add(Node::dir(entries));
        self.root = Some(id);
        id
    }

    pub fn packed(&mut self, id: NodeId) {
        self.packed = Some(id);
        self.incompat |= FEATURE_INCOMPAT_FRAGMENTS;
    }

    pub fn build(mut self) -> Image {
        if self.root.is_none() {
            self.root(vec![]);
        }
        let root = self.root.unwrap();

        // metadata layout; slot 0 stays unused so no nid is 0
        let mut records = vec![];
        let mut cursor = 1 << INODE_SLOT_BITS;
        for node in &self.nodes {
            let fixed = node.inode_isize() + node.xattrs.len();
            let mut len = fixed + node.trailer(cursor + fixed).len();
            if cursor % BLOCK_SIZE + len > BLOCK_SIZE && len <= BLOCK_SIZE {
                cursor = round_up(cursor as u64, BLOCK_SIZE as u64) as usize;
                len = fixed + node.trailer(cursor + fixed).len();
            }
            records.push(cursor);
            cursor = round_up((cursor + len) as u64, 1 << INODE_SLOT_BITS) as usize;
        }
        let nids: Vec<u64> = records.iter().map(|x| (x >> INODE_SLOT_BITS) as u64).collect();

        let mut parent = HashMap::new();
        parent.insert(root, root);
        for (id, node) in self.nodes.iter().enumerate() {
            if let Body::Dir { entries } = &node.body {
                for (_, child) in entries {
                    parent.insert(*child, id);
                }
            }
        }

        let mut dir_sizes = HashMap::new();
        for id in 0..self.nodes.len() {
            let Body::Dir { entries } = &self.nodes[id].body else {
                continue;
            };
            let mut list = vec![
                (".".to_string(), nids[id], 2),
                ("..".to_string(), nids[*parent.get(&id).unwrap_or(&id)], 2),
            ];
            for (name, child) in entries {
                list.push((
                    name.clone(),
                    nids[*child],
                    self.nodes[*child].file_type(),
                ));
            }
            let blocks = dir_blocks(&mut list);
            let size = (blocks.len() - 1) * BLOCK_SIZE + blocks[blocks.len() - 1].len();
            let mut padded = vec![];
            for b in &blocks {
                padded.resize(round_up(padded.len() as u64, BLOCK_SIZE as u64) as usize, 0);
                padded.extend_from_slice(b);
            }
            let blkaddr = self.add_data(&padded);
            self.blkaddr[id] = Some(blkaddr);
            dir_sizes.insert(id, size as u64);
        }

        let meta_blkaddr = 1 + self.data.len() / BLOCK_SIZE;
        let meta_base = meta_blkaddr * BLOCK_SIZE;
        let mut meta = vec![0u8; round_up(cursor as u64, BLOCK_SIZE as u64) as usize];
        for (id, node) in self.nodes.iter().enumerate() {
            let at = records[id];
            let size = node.size(&dir_sizes, id);
            let info = match &node.body {
                Body::Special { rdev } => rdev.to_le_bytes(),
                Body::Chunks { format, .. } => {
                    let mut info = [0u8; 4];
                    info[..2].copy_from_slice(&format.to_le_bytes());
                    info
                }
                Body::Compressed { .. } => [0; 4],
                _ => self.blkaddr[id].unwrap_or(EROFS_NULL_ADDR).to_le_bytes(),
            };
            let xattr_count = if node.xattrs.is_empty() {
                0
            } else {
                ((node.xattrs.len() - 12) / 4 + 1) as u16
            };
            let nlink = if matches!(node.body, Body::Dir { .. }) { 2 } else { 1 };
            let mut record = if node.extended {
                let mut e = InodeExtended::new_zeroed();
                e.format_layout = U16::new(format_layout(true, node.layout()));
                e.xattr_count = U16::new(xattr_count);
                e.mode = U16::new(node.mode);
                e.size = U64::new(size);
                e.info = info;
                e.ino = U32::new(id as u32 + 1);
                e.uid = U32::new(node.uid);
                e.gid = U32::new(node.gid);
                e.mtime = U64::new(node.mtime.0);
                e.mtime_nsec = U32::new(node.mtime.1);
                e.nlink = U32::new(nlink);
                e.as_bytes().to_vec()
            } else {
                let mut c = InodeCompact::new_zeroed();
                c.format_layout = U16::new(format_layout(false, node.layout()));
                c.xattr_count = U16::new(xattr_count);
                c.mode = U16::new(node.mode);
                c.nlink = U16::new(nlink as u16);
                c.size = U32::new(size as u32);
                c.info = info;
                c.ino = U32::new(id as u32 + 1);
                c.uid = U16::new(node.uid as u16);
                c.gid = U16::new(node.gid as u16);
                c.as_bytes().to_vec()
            };
            record.extend_from_slice(&node.xattrs);
            let trailer_at = meta_base + at + record.len();
            record.extend_from_slice(&node.trailer(trailer_at));
            meta[at..at + record.len()].copy_from_slice(&record);
        }

        let mut sb = Superblock::new_zeroed();
        sb.magic = U32::new(EROFS_SUPER_MAGIC_V1);
        sb.feature_compat = U32::new(FEATURE_COMPAT_SB_CHKSUM);
        sb.blkszbits = BLKSZBITS;
        sb.root_nid = U16::new(nids[root] as u16);
        sb.build_time = U64::new(BUILD_TIME);
        sb.meta_blkaddr = U32::new(meta_blkaddr as u32);
        sb.feature_incompat = U32::new(self.incompat);
        sb.extra_devices = U16::new(self.devices.len() as u16);
        let slot_start = EROFS_SUPER_OFFSET + size_of::<Superblock>();
        sb.devt_slotoff = U16::new((slot_start / size_of::<DeviceSlot>()) as u16);
        sb.packed_nid = U64::new(self.packed.map(|id| nids[id]).unwrap_or(0));

        let mut bytes = vec![0u8; BLOCK_SIZE];
        bytes.extend_from_slice(&self.data);
        bytes.extend_from_slice(&meta);
        sb.blocks = U32::new((bytes.len() / BLOCK_SIZE) as u32);
        bytes[EROFS_SUPER_OFFSET..slot_start].copy_from_slice(sb.as_bytes());
        let mut devices = vec![];
        for (i, (blocks, mapped_blkaddr)) in self.devices.iter().enumerate() {
            let mut slot = DeviceSlot::new_zeroed();
            slot.blocks = U32::new(*blocks);
            slot.mapped_blkaddr = U32::new(*mapped_blkaddr);
            let at = slot_start + i * size_of::<DeviceSlot>();
            bytes[at..at + size_of::<DeviceSlot>()].copy_from_slice(slot.as_bytes());
            devices.push(vec![0u8; *blocks as usize * BLOCK_SIZE]);
        }
        for (device, blkaddr, data) in &self.device_data {
            let at = *blkaddr as usize * BLOCK_SIZE;
            devices[*device as usize - 1][at..at + data.len()].copy_from_slice(data);
        }
        let crc = compute_checksum(&bytes).unwrap();
        let at = EROFS_SUPER_OFFSET + SUPERBLOCK_CHECKSUM_OFFSET;
        bytes[at..at + 4].copy_from_slice(&crc.to_le_bytes());

        let data_at = self
            .blkaddr
            .iter()
            .map(|b| b.map(|b| b as usize * BLOCK_SIZE))
            .collect();
        Image {
            bytes,
            nids,
            devices,
            meta_base,
            data_at,
        }
    }
}

/// Rewrite the superblock checksum after a test pokes at the first block.
pub fn fix_checksum(bytes: &mut [u8]) {
    let crc = compute_checksum(bytes).unwrap();
    let at = EROFS_SUPER_OFFSET + SUPERBLOCK_CHECKSUM_OFFSET;
    bytes[at..at + 4].copy_from_slice(&crc.to_le_bytes());
}
