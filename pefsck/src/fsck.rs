use std::ffi::OsStr;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, warn};
use rustix::fs::FileType;

use crate::data::{decoded_bytes, raw_slices};
use crate::dir::DirentItem;
use crate::disk::{DirentFileType, FEATURE_INCOMPAT_FRAGMENTS};
use crate::erofs::Erofs;
use crate::extract::{self, Attributes, ExtractOptions};
use crate::inode::Inode;
use crate::map::{ExtentMapper, MapBlocks};
use crate::pipeline::{Decode, DecodePipeline, Sink, WorkPool};
use crate::workqueue::{Job, WorkQueue};
use crate::Error;

/// Deepest directory nesting walked before the image is assumed to loop.
pub const MAX_DEPTH: usize = 1024;
const MAX_SYMLINK_LEN: usize = 4096;

/// What to do with an image. Fixed for the whole walk.
#[derive(Debug, Clone, Default)]
pub struct FsckConfig {
    pub extract_path: Option<PathBuf>,
    pub check_decomp: bool,
    pub print_comp_ratio: bool,
    pub force: bool,
    // any --[no-]preserve* flag was given
    pub explicit_preserve: bool,
    pub extract: ExtractOptions,
    pub strict_checksum: bool,
    pub workers: usize,
}

impl FsckConfig {
    pub fn validate(&self) -> Result<(), Error> {
        match &self.extract_path {
            Some(path) => {
                if path.as_os_str().is_empty() {
                    return Err(Error::InvalidInput("empty value given for --extract=X"));
                }
                if path == Path::new("/") && !self.force {
                    return Err(Error::InvalidInput(
                        "--extract=/ must be used together with --force",
                    ));
                }
            }
            None => {
                if self.force {
                    return Err(Error::InvalidInput(
                        "--force must be used together with --extract=X",
                    ));
                }
                if self.extract.overwrite {
                    return Err(Error::InvalidInput(
                        "--overwrite must be used together with --extract=X",
                    ));
                }
                if self.explicit_preserve {
                    return Err(Error::InvalidInput(
                        "--[no-]preserve[-owner/-perms] must be used together with --extract=X",
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Report {
    pub corrupted: bool,
    pub io_error: bool,
    // physical blocks per 100 logical blocks, when asked for
    pub compression_ratio: Option<f64>,
}

impl Report {
    pub fn is_clean(&self) -> bool {
        !self.corrupted && !self.io_error
    }
}

// Directory attributes wait until everything below the directory has been written, including
// subtrees running on other workers. Whoever drops the last reference applies them, unless
// something below failed, in which case the failure moves up instead.
struct DirAttrs {
    path: PathBuf,
    attrs: Attributes,
    opts: ExtractOptions,
    ok: AtomicBool,
    parent: Option<Arc<DirAttrs>>,
}

impl DirAttrs {
    fn fail(&self) {
        self.ok.store(false, Ordering::Relaxed);
    }
}

impl Drop for DirAttrs {
    fn drop(&mut self) {
        if self.ok.load(Ordering::Relaxed) {
            extract::set_attributes(&self.path, &self.attrs, &self.opts);
        } else if let Some(parent) = &self.parent {
            parent.fail();
        }
    }
}

struct InodeDecoder {
    fs: Arc<Erofs>,
    inode: Inode,
}

impl Decode for InodeDecoder {
    fn decode(&self, map: &MapBlocks, raw: &mut Vec<u8>, out: &mut Vec<u8>) -> Result<(), Error> {
        self.fs.decode_extent(&self.inode, map, raw, out)
    }
}

/// One check (and optionally extraction) of an image. The flags and counters are written by
/// every thread taking part in the walk.
pub struct Fsck {
    fs: Arc<Erofs>,
    cfg: FsckConfig,
    queue: Option<WorkQueue>,
    pool: Arc<WorkPool>,
    corrupted: AtomicBool,
    io_error: AtomicBool,
    logical_blocks: AtomicU64,
    physical_blocks: AtomicU64,
}

impl Fsck {
    pub fn new(fs: Arc<Erofs>, cfg: FsckConfig) -> Arc<Fsck> {
        let queue = if cfg.workers > 0 {
            match WorkQueue::new(cfg.workers, cfg.workers * 4) {
                Ok(q) => Some(q),
                Err(e) => {
                    warn!("failed to start workers, continuing single threaded: {}", e);
                    None
                }
            }
        } else {
            None
        };
        Arc::new(Fsck {
            fs,
            cfg,
            queue,
            pool: Arc::new(WorkPool::new()),
            corrupted: AtomicBool::new(false),
            io_error: AtomicBool::new(false),
            logical_blocks: AtomicU64::new(0),
            physical_blocks: AtomicU64::new(0),
        })
    }

    /// Check the superblock, the packed inode and then the whole tree from the root.
    pub fn run(self: &Arc<Self>) -> Report {
        if let Err(e) = self.fs.verify_checksum() {
            error!("failed to verify superblock checksum: {}", e);
            self.corrupted.store(true, Ordering::Relaxed);
            if self.cfg.strict_checksum {
                return self.report();
            }
        }

        let sb = &self.fs.sb;
        if sb.has_incompat(FEATURE_INCOMPAT_FRAGMENTS) {
            if let Err(e) = self.check_inode(sb.packed_nid, sb.packed_nid) {
                error!("failed to verify packed file: {}", e);
                return self.report();
            }
        }
        let _ = self.check_inode(sb.root_nid, sb.root_nid);
        if let Some(queue) = &self.queue {
            queue.wait_idle();
        }
        self.report()
    }

    fn report(&self) -> Report {
        let compression_ratio = self.cfg.print_comp_ratio.then(|| {
            let logical = self.logical_blocks.load(Ordering::Relaxed);
            let physical = self.physical_blocks.load(Ordering::Relaxed);
            if logical == 0 {
                0.0
            } else {
                physical as f64 * 100.0 / logical as f64
            }
        });
        Report {
            corrupted: self.corrupted.load(Ordering::Relaxed),
            io_error: self.io_error.load(Ordering::Relaxed),
            compression_ratio,
        }
    }

    fn is_packed(&self, inode: &Inode) -> bool {
        self.fs.sb.has_incompat(FEATURE_INCOMPAT_FRAGMENTS) && inode.nid == self.fs.sb.packed_nid
    }

    /// Check `nid`, found in directory `pnid`, and everything below it. Extraction starts at the
    /// configured path. Failures are recorded in the report and returned; subtrees handed to
    /// workers only show up in the report.
    pub fn check_inode(self: &Arc<Self>, pnid: u64, nid: u64) -> Result<(), Error> {
        let mut path = self.cfg.extract_path.clone().unwrap_or_default();
        self.check(pnid, nid, &mut path, 0, None)
    }

    fn check(
        self: &Arc<Self>,
        pnid: u64,
        nid: u64,
        path: &mut PathBuf,
        depth: usize,
        parent: Option<&Arc<DirAttrs>>,
    ) -> Result<(), Error> {
        debug!("check inode: nid {}", nid);
        let res = self.check_entry(pnid, nid, path, depth, parent);
        match &res {
            Ok(()) => {}
            Err(Error::Skipped(_)) => return Ok(()),
            Err(e) => {
                if e.is_io() {
                    error!("I/O error occurred when checking nid {}: {}", nid, e);
                    self.io_error.store(true, Ordering::Relaxed);
                } else {
                    error!("nid {} is corrupted: {}", nid, e);
                    self.corrupted.store(true, Ordering::Relaxed);
                }
                if let Some(parent) = parent {
                    parent.fail();
                }
            }
        }
        res
    }

    fn check_entry(
        self: &Arc<Self>,
        pnid: u64,
        nid: u64,
        path: &mut PathBuf,
        depth: usize,
        parent: Option<&Arc<DirAttrs>>,
    ) -> Result<(), Error> {
        if depth > MAX_DEPTH {
            return Err(Error::StructuralCorruption("directory tree too deep"));
        }
        let inode = self.fs.read_inode(nid)?;
        self.fs.verify_xattr(&inode)?;

        let extracting = self.cfg.extract_path.is_some() && !self.is_packed(&inode);
        if extracting {
            self.extract(&inode, path)?;
        } else {
            self.verify_data(&inode, None)?;
        }

        if !inode.is_dir() {
            if extracting {
                extract::set_attributes(path, &Attributes::from(&inode), &self.cfg.extract);
            }
            return Ok(());
        }

        let guard = extracting.then(|| {
            Arc::new(DirAttrs {
                path: path.clone(),
                attrs: Attributes::from(&inode),
                opts: self.cfg.extract.clone(),
                ok: AtomicBool::new(true),
                parent: parent.cloned(),
            })
        });
        let res = self.fs.iterate_dir(&inode, pnid, |item| {
            self.visit(&inode, item, path, depth, guard.as_ref());
            Ok(())
        });
        if let (Err(_), Some(guard)) = (&res, &guard) {
            guard.fail();
        }
        res
    }

    // children never fail the listing itself; they record their own outcome
    fn visit(
        self: &Arc<Self>,
        dir: &Inode,
        item: DirentItem<'_>,
        path: &mut PathBuf,
        depth: usize,
        guard: Option<&Arc<DirAttrs>>,
    ) {
        let extracting = self.cfg.extract_path.is_some();
        if extracting {
            path.push(OsStr::from_bytes(item.name));
        }
        match &self.queue {
            Some(queue) if extracting && item.file_type == DirentFileType::Directory => {
                let me = self.clone();
                let mut path = path.clone();
                let guard = guard.cloned();
                let (pnid, nid) = (dir.nid, item.nid);
                let job: Job = Box::new(move || {
                    let _ = me.check(pnid, nid, &mut path, depth + 1, guard.as_ref());
                });
                if let Err(job) = queue.add(job) {
                    job();
                }
            }
            _ => {
                let _ = self.check(dir.nid, item.nid, path, depth + 1, guard);
            }
        }
        if extracting {
            path.pop();
        }
    }

    fn extract(&self, inode: &Inode, path: &Path) -> Result<(), Error> {
        let opts = &self.cfg.extract;
        match inode.file_type() {
            FileType::Directory => {
                self.verify_data(inode, None)?;
                extract::extract_dir(path)
            }
            FileType::RegularFile => {
                let mut file = extract::create_file(path, opts)?;
                self.verify_data(inode, Some(&mut file))?;
                // holes were only seeked over
                file.set_len(inode.size).inspect_err(|e| {
                    error!("failed to size {}: {}", path.display(), e);
                })?;
                Ok(())
            }
            FileType::Symlink => {
                self.verify_data(inode, None)?;
                let target = self.read_symlink(inode)?;
                extract::extract_symlink(&target, path, opts)
            }
            FileType::CharacterDevice
            | FileType::BlockDevice
            | FileType::Fifo
            | FileType::Socket => {
                self.verify_data(inode, None)?;
                extract::extract_special(path, inode.mode, inode.rdev(), opts)
            }
            _ => self.verify_data(inode, None),
        }
    }

    fn read_symlink(&self, inode: &Inode) -> Result<Vec<u8>, Error> {
        let Some(len) = usize::try_from(inode.size)
            .ok()
            .filter(|x| (1..=MAX_SYMLINK_LEN).contains(x))
        else {
            error!("bad symlink size {} @ nid {}", inode.size, inode.nid);
            return Err(Error::StructuralCorruption("bad symlink size"));
        };
        let mut target = vec![0u8; len];
        self.fs.read_data(inode, 0, &mut target)?;
        Ok(target)
    }

    /// Walk every extent of `inode`, decoding when asked to and writing the content to `sink`
    /// in file order.
    fn verify_data(
        &self,
        inode: &Inode,
        mut sink: Option<&mut (dyn Sink + '_)>,
    ) -> Result<(), Error> {
        let mapper = ExtentMapper::new(&self.fs, inode)?;
        let decode = self.cfg.check_decomp || sink.is_some();
        let mut pipeline = match &self.queue {
            Some(queue) if decode => {
                let decoder = Arc::new(InodeDecoder {
                    fs: self.fs.clone(),
                    inode: inode.clone(),
                });
                Some(DecodePipeline::new(&self.pool, queue, decoder))
            }
            _ => None,
        };
        let mut raw = vec![];
        let mut out = vec![];
        let mut pchunk_len = 0u64;
        let mut pos = 0;

        while pos < inode.size {
            let map = mapper.map_range(pos)?;
            if map.end() <= pos {
                error!("extent @ nid {} la {} makes no progress", inode.nid, pos);
                return Err(Error::StructuralCorruption("extent map makes no progress"));
            }
            debug!(
                "nid {} la {} llen {} plen {} {:?}",
                inode.nid, map.la, map.llen, map.plen, map.physical
            );
            pchunk_len += map.plen;
            pos = map.end();
            if !decode {
                continue;
            }
            if !map.is_mapped() {
                // holes read as zeros, there is nothing to decode
                if let Some(sink) = sink.as_deref_mut() {
                    match pipeline.as_mut() {
                        Some(p) => p.skip(map.la, map.llen, Some(sink)),
                        None => sink.skip(map.llen).inspect_err(|e| {
                            error!("failed to write out nid {}: {}", inode.nid, e);
                        })?,
                    }
                }
                continue;
            }
            for slice in raw_slices(&map) {
                match pipeline.as_mut() {
                    Some(p) if p.failed() => break,
                    Some(p) => p.submit(slice, sink.as_deref_mut()),
                    None => {
                        self.fs.decode_extent(inode, &slice, &mut raw, &mut out)?;
                        if let Some(sink) = sink.as_deref_mut() {
                            sink.write_all(decoded_bytes(&slice, &raw, &out))
                                .inspect_err(|e| {
                                    error!("failed to write out nid {}: {}", inode.nid, e);
                                })?;
                        }
                    }
                }
            }
            if pipeline.as_ref().is_some_and(|p| p.failed()) {
                break;
            }
        }
        if let Some(p) = pipeline {
            p.finish(sink)?;
        }

        if self.cfg.print_comp_ratio {
            if !self.is_packed(inode) {
                self.logical_blocks
                    .fetch_add(self.fs.blk_round_up(inode.size), Ordering::Relaxed);
            }
            self.physical_blocks
                .fetch_add(self.fs.blk_round_up(pchunk_len), Ordering::Relaxed);
        }
        Ok(())
    }
}
