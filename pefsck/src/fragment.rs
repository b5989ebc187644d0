use std::cmp::min;
use std::collections::HashMap;
use std::io::Write;

use log::debug;

use crate::disk::crc32c;
use crate::Error;

/// Trailing bytes that have to match exactly before a suffix is compared at all.
pub const TASTE_LEN: usize = 16;
/// Only this much of a file's tail is considered for deduplication.
pub const MAX_DEDUPE_WINDOW: usize = 4000 * 1024;
const BUCKET_MASK: u32 = 0xffff;

#[derive(Debug)]
struct Fragment {
    data: Vec<u8>,
    pos: u64,
    // longest suffix any later tail was found to share with this one
    nr_dup: usize,
}

/// Where a tail can be found in the packed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentMatch {
    pub offset: u64,
    pub length: u64,
}

/// Bucket of the last `TASTE_LEN` bytes of `tail`; tails that short are never deduplicated.
pub fn taste_hash(tail: &[u8]) -> Option<u16> {
    if tail.len() <= TASTE_LEN {
        return None;
    }
    Some((crc32c(u32::MAX, &tail[tail.len() - TASTE_LEN..]) & BUCKET_MASK) as u16)
}

/// Fragment offsets past 4GiB do not fit the compact index layout.
pub fn requires_full_indexes(offset: u64) -> bool {
    offset >> 32 != 0
}

/// The packed fragment stream plus an index of what went into it, for finding a new tail as a
/// suffix of an existing fragment.
pub struct FragmentStore<W: Write> {
    packed: W,
    offset: u64,
    buckets: HashMap<u16, Vec<Fragment>>,
}

impl<W: Write> FragmentStore<W> {
    pub fn new(packed: W) -> FragmentStore<W> {
        FragmentStore {
            packed,
            offset: 0,
            buckets: HashMap::new(),
        }
    }

    /// Bytes packed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn into_inner(self) -> W {
        self.packed
    }

    /// Longest suffix of `tail` that is also a suffix of some stored fragment, if it is longer
    /// than the taste. Ties go to the fragment stored first.
    pub fn dedupe(&mut self, tail: &[u8]) -> Option<FragmentMatch> {
        let data = &tail[tail.len().saturating_sub(MAX_DEDUPE_WINDOW)..];
        let hash = taste_hash(data)?;
        let bucket = self.buckets.get_mut(&hash)?;
        let e2 = data.len() - TASTE_LEN;

        let mut best: Option<(usize, usize)> = None;
        for (idx, cur) in bucket.iter_mut().enumerate() {
            let e1 = cur.data.len() - TASTE_LEN;
            if cur.data[e1..] != data[e2..] {
                continue;
            }
            let mn = min(e1, e2);
            let i = cur.data[..e1]
                .iter()
                .rev()
                .zip(data[..e2].iter().rev())
                .take_while(|(a, b)| a == b)
                .count();
            if i == 0 {
                continue;
            }
            let better = match best {
                Some((_, dup)) => i + TASTE_LEN > dup,
                None => true,
            };
            if better {
                cur.nr_dup = i + TASTE_LEN;
                best = Some((idx, cur.nr_dup));
                if i == mn {
                    break;
                }
            }
        }

        let (idx, dup) = best?;
        let cand = &bucket[idx];
        let m = FragmentMatch {
            offset: cand.pos + cand.data.len() as u64 - dup as u64,
            length: dup as u64,
        };
        debug!("dedupe {} tail bytes at {}", m.length, m.offset);
        Some(m)
    }

    /// Remember `bytes`, stored at `offset` of the packed stream, as a dedupe candidate.
    pub fn insert(&mut self, bytes: &[u8], offset: u64) {
        let Some(hash) = taste_hash(bytes) else {
            return;
        };
        self.buckets.entry(hash).or_default().push(Fragment {
            data: bytes.to_vec(),
            pos: offset,
            nr_dup: 0,
        });
    }

    /// Append `bytes` to the packed stream and return where they landed.
    pub fn pack(&mut self, bytes: &[u8]) -> Result<u64, Error> {
        let offset = self.offset;
        self.packed.write_all(bytes)?;
        self.offset += bytes.len() as u64;
        debug!("recording {} fragment bytes at {}", bytes.len(), offset);
        self.insert(bytes, offset);
        Ok(offset)
    }
}
