use std::ffi::OsStr;
use std::fs::{self, DirBuilder, File, OpenOptions, Permissions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;

use log::{error, warn};
use rustix::fs::{AtFlags, FileType, Mode, OFlags, Timespec, Timestamps, CWD};
use rustix::io::Errno;

use crate::inode::Inode;
use crate::Error;

const PRIVATE_MODE: u32 = 0o700;

/// Policy for writing entries out. Read only for the whole walk.
#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    pub overwrite: bool,
    pub preserve_owner: bool,
    pub preserve_perms: bool,
    pub umask: u32,
    pub superuser: bool,
}

/// What gets applied to an extracted entry once its content is in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attributes {
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u64,
    pub mtime_nsec: u32,
}

impl From<&Inode> for Attributes {
    fn from(inode: &Inode) -> Attributes {
        Attributes {
            mode: inode.mode,
            uid: inode.uid,
            gid: inode.gid,
            mtime: inode.mtime,
            mtime_nsec: inode.mtime_nsec,
        }
    }
}

fn errno(e: &io::Error) -> Option<Errno> {
    Errno::from_io_error(e)
}

fn conflict(path: &Path, what: &str, e: io::Error) -> Error {
    error!("failed to {} {}: {}", what, path.display(), e);
    Error::FilesystemConflict(path.to_path_buf())
}

/// Create `path` as a private directory so its children can be written. An existing directory
/// is reused; anything else in the way is a conflict.
pub fn extract_dir(path: &Path) -> Result<(), Error> {
    let e = match DirBuilder::new().mode(PRIVATE_MODE).create(path) {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    if errno(&e) != Some(Errno::EXIST) {
        return Err(conflict(path, "create directory", e));
    }
    let meta = fs::symlink_metadata(path).map_err(|e| conflict(path, "stat", e))?;
    if !meta.is_dir() {
        error!("{} exists and is not a directory", path.display());
        return Err(Error::FilesystemConflict(path.to_path_buf()));
    }
    fs::set_permissions(path, Permissions::from_mode(PRIVATE_MODE))
        .map_err(|e| conflict(path, "chmod", e))
}

fn open_file(path: &Path, overwrite: bool) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.write(true)
        .mode(PRIVATE_MODE)
        .custom_flags(OFlags::NOFOLLOW.bits() as _);
    if overwrite {
        opts.create(true).truncate(true);
    } else {
        opts.create_new(true);
    }
    opts.open(path)
}

/// Create the regular file `path` for writing. With `overwrite`, an empty directory in the way
/// is removed and an unwritable file is made writable, once.
pub fn create_file(path: &Path, opts: &ExtractOptions) -> Result<File, Error> {
    let e = match open_file(path, opts.overwrite) {
        Ok(f) => return Ok(f),
        Err(e) => e,
    };
    if !opts.overwrite {
        return Err(conflict(path, "create", e));
    }
    match errno(&e) {
        Some(Errno::ISDIR) => {
            fs::remove_dir(path).map_err(|e| conflict(path, "remove directory", e))?;
        }
        Some(Errno::ACCESS) => {
            fs::set_permissions(path, Permissions::from_mode(PRIVATE_MODE))
                .map_err(|e| conflict(path, "chmod", e))?;
        }
        _ => return Err(conflict(path, "create", e)),
    }
    open_file(path, true).map_err(|e| conflict(path, "create", e))
}

pub fn extract_symlink(target: &[u8], path: &Path, opts: &ExtractOptions) -> Result<(), Error> {
    let target = OsStr::from_bytes(target);
    let e = match std::os::unix::fs::symlink(target, path) {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    if !opts.overwrite || errno(&e) != Some(Errno::EXIST) {
        return Err(conflict(path, "create symlink", e));
    }
    fs::remove_file(path).map_err(|e| conflict(path, "unlink", e))?;
    std::os::unix::fs::symlink(target, path).map_err(|e| conflict(path, "create symlink", e))
}

fn mknod(path: &Path, mode: u16, rdev: u64) -> rustix::io::Result<()> {
    let mode = u32::from(mode);
    rustix::fs::mknodat(
        CWD,
        path,
        FileType::from_raw_mode(mode),
        Mode::from_raw_mode(mode & 0o7777),
        rdev,
    )
}

/// Create a device, fifo or socket node. An unprivileged user that cannot create one gets
/// `Skipped`, which is not an image problem.
pub fn extract_special(
    path: &Path,
    mode: u16,
    rdev: u64,
    opts: &ExtractOptions,
) -> Result<(), Error> {
    let mut res = mknod(path, mode, rdev);
    if res == Err(Errno::EXIST) && opts.overwrite {
        fs::remove_file(path).map_err(|e| conflict(path, "unlink", e))?;
        res = mknod(path, mode, rdev);
    }
    match res {
        Ok(()) => Ok(()),
        Err(e) if e == Errno::EXIST || opts.superuser => {
            Err(conflict(path, "create special file", e.into()))
        }
        Err(e) => {
            warn!(
                "could not create special file {}: {}, skipped",
                path.display(),
                e
            );
            Err(Error::Skipped(path.to_path_buf()))
        }
    }
}

/// Apply timestamps, permissions and ownership. None of it is fatal.
pub fn set_attributes(path: &Path, attrs: &Attributes, opts: &ExtractOptions) {
    let ts = Timespec {
        tv_sec: attrs.mtime as i64,
        tv_nsec: attrs.mtime_nsec.into(),
    };
    let times = Timestamps {
        last_access: ts,
        last_modification: ts,
    };
    if let Err(e) = rustix::fs::utimensat(CWD, path, &times, AtFlags::SYMLINK_NOFOLLOW) {
        warn!("failed to set times of {}: {}", path.display(), e);
    }

    let mode = u32::from(attrs.mode);
    if FileType::from_raw_mode(mode) != FileType::Symlink {
        let perms = if opts.preserve_perms {
            mode & 0o7777
        } else {
            mode & 0o7777 & !opts.umask
        };
        if let Err(e) = fs::set_permissions(path, Permissions::from_mode(perms)) {
            warn!("failed to set permissions of {}: {}", path.display(), e);
        }
    }

    if opts.preserve_owner {
        if let Err(e) = std::os::unix::fs::lchown(path, Some(attrs.uid), Some(attrs.gid)) {
            warn!("failed to change ownership of {}: {}", path.display(), e);
        }
    }
}
