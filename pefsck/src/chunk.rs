use std::cmp::min;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::mem::size_of;

use log::{debug, error};
use sha2::{Digest, Sha256};
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::IntoBytes;

use crate::disk::{
    round_up, ChunkIndex, CHUNK_FORMAT_BLKBITS_MASK, CHUNK_FORMAT_INDEXES, EROFS_NULL_ADDR,
};
use crate::Error;

pub type ChunkDigest = [u8; 32];

/// A deduplicated piece of file content and where it was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub digest: ChunkDigest,
    pub device_id: u16,
    pub blkaddr: u32,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkRef {
    Hole,
    // in the primary image, relative to the remapped base
    Local(Chunk),
    // on the extra blob device
    Remote(Chunk),
}

impl ChunkRef {
    fn contiguous_with(&self, next: &ChunkRef, blkszbits: u8) -> bool {
        match (self, next) {
            (ChunkRef::Hole, ChunkRef::Hole) => true,
            (ChunkRef::Local(a), ChunkRef::Local(b)) | (ChunkRef::Remote(a), ChunkRef::Remote(b)) => {
                a.device_id == b.device_id
                    && (u64::from(a.blkaddr) << blkszbits) + a.size
                        == u64::from(b.blkaddr) << blkszbits
            }
            _ => false,
        }
    }
}

/// The chunk list of one file, index by index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedFile {
    pub size: u64,
    pub chunkbits: u8,
    pub format: u16,
    pub chunks: Vec<ChunkRef>,
}

impl ChunkedFile {
    fn full_indexes(&self) -> bool {
        self.format & CHUNK_FORMAT_INDEXES != 0
    }
}

/// A run of blocks that a file's data occupies on one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockExtent {
    pub device_id: u16,
    pub blkaddr: u32,
    pub blocks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkIndexes {
    // on disk index table, 4 or 8 bytes per chunk
    pub table: Vec<u8>,
    pub extents: Vec<BlockExtent>,
}

fn lowbit(x: u64) -> u64 {
    x & x.wrapping_neg()
}

/// Content addressed chunk writer. Chunks are appended to `blob` block aligned and zero padded;
/// a chunk whose digest was seen before is not written again. Callers serialize access.
pub struct ChunkStore<W: Write> {
    blob: W,
    blkszbits: u8,
    multi_device: bool,
    chunks: HashMap<ChunkDigest, Chunk>,
    cursor: u64,
    remapped_base: u32,
}

impl<W: Write> ChunkStore<W> {
    /// With `multi_device` the blob is an extra device (device 1) and files get full indexes.
    pub fn new(blob: W, blkszbits: u8, multi_device: bool) -> ChunkStore<W> {
        ChunkStore {
            blob,
            blkszbits,
            multi_device,
            chunks: HashMap::new(),
            cursor: 0,
            remapped_base: 0,
        }
    }

    fn block_size(&self) -> u64 {
        1 << self.blkszbits
    }

    /// Bytes written to the blob so far, padding included.
    pub fn blob_size(&self) -> u64 {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// First block of the blob within the primary image; local chunk addresses are relative
    /// to it until the index table is written.
    pub fn set_remapped_base(&mut self, blkaddr: u32) {
        self.remapped_base = blkaddr;
    }

    pub fn get_ref(&self) -> &W {
        &self.blob
    }

    pub fn into_inner(self) -> W {
        self.blob
    }

    pub fn get_or_insert(&mut self, bytes: &[u8]) -> Result<Chunk, Error> {
        let digest: ChunkDigest = Sha256::digest(bytes).into();
        if let Some(chunk) = self.chunks.get(&digest) {
            if chunk.size != bytes.len() as u64 {
                error!(
                    "chunk digest collision: {} bytes vs {} bytes",
                    chunk.size,
                    bytes.len()
                );
                return Err(Error::StructuralCorruption("chunk size differs for one digest"));
            }
            debug!("found duplicated chunk at {}", chunk.blkaddr);
            return Ok(*chunk);
        }

        let blkaddr = u32::try_from(self.cursor >> self.blkszbits)
            .ok()
            .filter(|x| *x != EROFS_NULL_ADDR)
            .ok_or(Error::ResourceExhaustion)?;
        let chunk = Chunk {
            digest,
            device_id: u16::from(self.multi_device),
            blkaddr,
            size: bytes.len() as u64,
        };
        debug!("writing chunk ({} bytes) to {}", bytes.len(), blkaddr);
        self.blob.write_all(bytes)?;
        let padded = round_up(chunk.size, self.block_size());
        let padding = (padded - chunk.size) as usize;
        if padding > 0 {
            self.blob.write_all(&vec![0u8; padding])?;
        }
        self.cursor += padded;
        self.chunks.insert(digest, chunk);
        Ok(chunk)
    }

    fn chunk_ref(&self, chunk: Chunk) -> ChunkRef {
        if chunk.device_id == 0 {
            ChunkRef::Local(chunk)
        } else {
            ChunkRef::Remote(chunk)
        }
    }

    /// Cut `size` bytes from `reader` into chunks of `1 << chunkbits`, store them, and pick the
    /// coarsest chunk size that every physical discontinuity still lines up with.
    pub fn write_chunked_file<R: Read>(
        &mut self,
        mut reader: R,
        size: u64,
        chunkbits: u8,
    ) -> Result<ChunkedFile, Error> {
        let bits = self.blkszbits;
        let chunkbits = chunkbits.clamp(bits, bits + CHUNK_FORMAT_BLKBITS_MASK as u8);
        let chunksize = 1u64 << chunkbits;
        let format = if self.multi_device {
            CHUNK_FORMAT_INDEXES
        } else {
            0
        };

        let count = size.div_ceil(chunksize);
        let mut chunks = Vec::new();
        chunks.try_reserve(usize::try_from(count).map_err(|_| Error::ResourceExhaustion)?)?;
        let mut buf = Vec::new();
        buf.try_reserve(min(chunksize, size) as usize)?;

        let mut minextblks = size.div_ceil(self.block_size());
        let mut last: Option<ChunkRef> = None;
        let mut pos = 0;
        while pos < size {
            let len = min(size - pos, chunksize) as usize;
            buf.resize(len, 0);
            reader.read_exact(&mut buf)?;
            let cur = if buf.iter().all(|x| *x == 0) {
                ChunkRef::Hole
            } else {
                let chunk = self.get_or_insert(&buf)?;
                self.chunk_ref(chunk)
            };
            if let Some(last) = last {
                if !last.contiguous_with(&cur, bits) {
                    let lb = lowbit(pos >> bits);
                    if lb != 0 && lb < minextblks {
                        minextblks = lb;
                    }
                }
            }
            chunks.push(cur);
            last = Some(cur);
            pos += len as u64;
        }

        let mut file = ChunkedFile {
            size,
            chunkbits,
            format: format | u16::from(chunkbits - bits),
            chunks,
        };
        if minextblks > 0 {
            self.merge_chunks(&mut file, minextblks.ilog2() as u8 + bits);
        }
        Ok(file)
    }

    /// Resample the chunk list at `new_chunkbits`. Only valid when every group of chunks being
    /// folded into one is physically contiguous.
    pub fn merge_chunks(&self, file: &mut ChunkedFile, new_chunkbits: u8) {
        let bits = self.blkszbits;
        let new_chunkbits = min(new_chunkbits, bits + CHUNK_FORMAT_BLKBITS_MASK as u8);
        if file.chunkbits < new_chunkbits {
            let stride = 1usize << (new_chunkbits - file.chunkbits);
            let count = file.size.div_ceil(1 << new_chunkbits) as usize;
            file.chunks = file
                .chunks
                .iter()
                .step_by(stride)
                .take(count)
                .copied()
                .collect();
            debug!(
                "merged chunks from {} to {} bits, {} indexes",
                file.chunkbits,
                new_chunkbits,
                file.chunks.len()
            );
            file.chunkbits = new_chunkbits;
        }
        file.format = (file.format & !CHUNK_FORMAT_BLKBITS_MASK) | u16::from(file.chunkbits - bits);
    }

    /// Encode the index table of `file` and the block runs it covers. Local chunks are moved
    /// to the remapped base.
    pub fn write_chunk_indexes(&self, file: &ChunkedFile) -> Result<ChunkIndexes, Error> {
        let bits = self.blkszbits;
        let full = file.full_indexes();
        let unit = if full {
            size_of::<ChunkIndex>()
        } else {
            size_of::<u32>()
        };
        let mut table = Vec::new();
        table.try_reserve(file.chunks.len() * unit)?;
        let mut extents: Vec<BlockExtent> = vec![];
        let mut run: Option<BlockExtent> = None;

        for (i, cref) in file.chunks.iter().enumerate() {
            let la = (i as u64) << file.chunkbits;
            let len = min(1u64 << file.chunkbits, file.size.saturating_sub(la));
            let blocks = len.div_ceil(1 << bits) as u32;
            let (device_id, blkaddr) = match cref {
                ChunkRef::Hole => (0, EROFS_NULL_ADDR),
                ChunkRef::Local(c) => (
                    0,
                    self.remapped_base
                        .checked_add(c.blkaddr)
                        .ok_or(Error::ResourceExhaustion)?,
                ),
                ChunkRef::Remote(c) => {
                    if !full {
                        return Err(Error::InvalidInput(
                            "remote chunks need full chunk indexes",
                        ));
                    }
                    (c.device_id, c.blkaddr)
                }
            };

            if blkaddr == EROFS_NULL_ADDR {
                extents.extend(run.take());
            } else {
                match &mut run {
                    Some(r)
                        if r.device_id == device_id
                            && r.blkaddr.checked_add(r.blocks) == Some(blkaddr)
                            && r.blocks.checked_add(blocks).is_some() =>
                    {
                        r.blocks += blocks;
                    }
                    _ => {
                        extents.extend(run.take());
                        run = Some(BlockExtent {
                            device_id,
                            blkaddr,
                            blocks,
                        });
                    }
                }
            }

            if full {
                let idx = ChunkIndex {
                    advise: U16::new(0),
                    device_id: U16::new(device_id),
                    blkaddr: U32::new(blkaddr),
                };
                table.extend_from_slice(idx.as_bytes());
            } else {
                table.extend_from_slice(&blkaddr.to_le_bytes());
            }
        }
        extents.extend(run.take());
        Ok(ChunkIndexes { table, extents })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use rand::{Rng, SeedableRng};

    use crate::fsck::{Fsck, FsckConfig};
    use crate::testutil::{ImageBuilder, Node, BLKSZBITS};

    fn random(n: usize, seed: u64) -> Vec<u8> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        (0..n).map(|_| rng.random()).collect()
    }

    fn read_all(fs: &crate::erofs::Erofs, nid: u64) -> Vec<u8> {
        let inode = fs.read_inode(nid).unwrap();
        let mut buf = vec![0u8; inode.size as usize];
        fs.read_data(&inode, 0, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_get_or_insert() {
        let mut store = ChunkStore::new(vec![], BLKSZBITS, false);
        let a = store.get_or_insert(b"hello").unwrap();
        let b = store.get_or_insert(b"world").unwrap();
        let c = store.get_or_insert(b"hello").unwrap();
        assert_eq!(a, c);
        assert_ne!(a.digest, b.digest);
        assert_eq!(0, a.blkaddr);
        assert_eq!(1, b.blkaddr);
        assert_eq!(2, store.len());
        let blob = store.into_inner();
        assert_eq!(2 * 4096, blob.len());
        assert_eq!(b"hello", &blob[..5]);
        assert!(blob[5..4096].iter().all(|x| *x == 0));
    }

    #[test]
    fn test_merge_contiguous() {
        let data = random(4 * 4096, 1);
        let mut store = ChunkStore::new(vec![], BLKSZBITS, false);
        let file = store
            .write_chunked_file(&data[..], data.len() as u64, BLKSZBITS)
            .unwrap();
        // four fresh chunks back to back fold into one
        assert_eq!(BLKSZBITS + 2, file.chunkbits);
        assert_eq!(2, file.format);
        assert_eq!(1, file.chunks.len());
        let idx = store.write_chunk_indexes(&file).unwrap();
        assert_eq!(0u32.to_le_bytes().to_vec(), idx.table);
        assert_eq!(
            vec![BlockExtent {
                device_id: 0,
                blkaddr: 0,
                blocks: 4
            }],
            idx.extents
        );
    }

    #[test]
    fn test_discontinuity_limits_merge() {
        // blocks: A B A C; the repeated A breaks contiguity at block 2
        let a = random(4096, 1);
        let mut data = a.clone();
        data.extend(random(4096, 2));
        data.extend(&a);
        data.extend(random(4096, 3));
        let mut store = ChunkStore::new(vec![], BLKSZBITS, false);
        store.set_remapped_base(10);
        let file = store
            .write_chunked_file(&data[..], data.len() as u64, BLKSZBITS)
            .unwrap();
        assert_eq!(BLKSZBITS, file.chunkbits);
        assert_eq!(4, file.chunks.len());
        let idx = store.write_chunk_indexes(&file).unwrap();
        let addrs: Vec<u32> = idx
            .table
            .chunks(4)
            .map(|x| u32::from_le_bytes(x.try_into().unwrap()))
            .collect();
        assert_eq!(vec![10, 11, 10, 12], addrs);
        assert_eq!(3, idx.extents.len());
        assert_eq!(
            BlockExtent {
                device_id: 0,
                blkaddr: 10,
                blocks: 2
            },
            idx.extents[0]
        );
    }

    #[test]
    fn test_holes() {
        let mut data = vec![0u8; 4096 * 2];
        data.extend(random(4096 * 2, 4));
        data.extend(vec![0u8; 100]);
        let mut store = ChunkStore::new(vec![], BLKSZBITS, false);
        let file = store
            .write_chunked_file(&data[..], data.len() as u64, BLKSZBITS)
            .unwrap();
        // the hole boundary at block 2 allows two block chunks
        assert_eq!(BLKSZBITS + 1, file.chunkbits);
        assert_eq!(
            vec![ChunkRef::Hole, file.chunks[1], ChunkRef::Hole],
            file.chunks
        );
        let idx = store.write_chunk_indexes(&file).unwrap();
        assert_eq!(EROFS_NULL_ADDR.to_le_bytes(), idx.table[..4]);
        assert_eq!(1, idx.extents.len());
        assert_eq!(2, idx.extents[0].blocks);

        // nothing but zeros
        let file = store
            .write_chunked_file(&[0u8; 3 * 4096][..], 3 * 4096, BLKSZBITS)
            .unwrap();
        assert!(file.chunks.iter().all(|x| *x == ChunkRef::Hole));
        assert!(store.write_chunk_indexes(&file).unwrap().extents.is_empty());
    }

    #[test]
    fn test_merge_cap() {
        let store = ChunkStore::new(vec![], BLKSZBITS, false);
        let mut file = ChunkedFile {
            size: 1 << 50,
            chunkbits: BLKSZBITS,
            format: 0,
            chunks: vec![ChunkRef::Hole; 8],
        };
        store.merge_chunks(&mut file, 60);
        assert_eq!(BLKSZBITS + 31, file.chunkbits);
        assert_eq!(31, file.format);

        // never shrinks
        store.merge_chunks(&mut file, BLKSZBITS);
        assert_eq!(BLKSZBITS + 31, file.chunkbits);
    }

    #[test]
    fn test_run_ending_past_u32_max() {
        let store = ChunkStore::new(vec![], BLKSZBITS, true);
        let remote = |blkaddr| {
            ChunkRef::Remote(Chunk {
                digest: [0; 32],
                device_id: 1,
                blkaddr,
                size: 1 << 43,
            })
        };
        let file = ChunkedFile {
            size: 1 << 44,
            chunkbits: BLKSZBITS + 31,
            format: CHUNK_FORMAT_INDEXES | 31,
            chunks: vec![remote((1 << 31) + 5), remote(5)],
        };
        // 2^31 + 5 plus 2^31 blocks wraps to 5 in u32; that is not the next chunk
        let idx = store.write_chunk_indexes(&file).unwrap();
        assert_eq!(2, idx.extents.len());
        assert_eq!(1 << 31, idx.extents[0].blocks);
        assert_eq!(5, idx.extents[1].blkaddr);
    }

    #[test]
    fn test_identical_files_share_blocks() {
        let payload = random(64 << 10, 7);
        let mut store = ChunkStore::new(vec![], BLKSZBITS, false);
        let f1 = store
            .write_chunked_file(&payload[..], payload.len() as u64, BLKSZBITS)
            .unwrap();
        let f2 = store
            .write_chunked_file(&payload[..], payload.len() as u64, BLKSZBITS)
            .unwrap();
        assert_eq!(16, store.len());
        assert_eq!(64 << 10, store.blob_size());

        let mut b = ImageBuilder::new();
        store.set_remapped_base(b.add_data(store.get_ref()));
        let i1 = store.write_chunk_indexes(&f1).unwrap();
        let i2 = store.write_chunk_indexes(&f2).unwrap();
        assert_eq!(i1, i2);

        let n1 = b.add(Node::chunked_raw(payload.len() as u64, f1.format, i1.table));
        let n2 = b.add(Node::chunked_raw(payload.len() as u64, f2.format, i2.table));
        b.root(vec![("a", n1), ("b", n2)]);
        let image = b.build();
        let fs = image.erofs();
        assert_eq!(payload, read_all(&fs, image.nids[n1]));
        assert_eq!(payload, read_all(&fs, image.nids[n2]));

        let cfg = FsckConfig {
            check_decomp: true,
            ..Default::default()
        };
        assert!(Fsck::new(Arc::new(fs), cfg).run().is_clean());
    }

    #[test]
    fn test_remote_chunks() {
        let payload = random(3 * 4096 + 10, 8);
        let mut store = ChunkStore::new(vec![], BLKSZBITS, true);
        let file = store
            .write_chunked_file(&payload[..], payload.len() as u64, BLKSZBITS)
            .unwrap();
        assert!(matches!(file.chunks[0], ChunkRef::Remote(_)));
        assert_ne!(0, file.format & CHUNK_FORMAT_INDEXES);
        let idx = store.write_chunk_indexes(&file).unwrap();
        assert_eq!(
            vec![BlockExtent {
                device_id: 1,
                blkaddr: 0,
                blocks: 4
            }],
            idx.extents
        );

        let blob = store.into_inner();
        let mut b = ImageBuilder::new().extra_device((blob.len() / 4096) as u32, 0);
        b.device_data(1, 0, &blob);
        let f = b.add(Node::chunked_raw(payload.len() as u64, file.format, idx.table));
        b.root(vec![("f", f)]);
        let image = b.build();
        assert_eq!(payload, read_all(&image.erofs(), image.nids[f]));
    }
}
