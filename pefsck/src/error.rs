use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    // an on-disk invariant does not hold
    StructuralCorruption(&'static str),
    // recognised but not something we can decode (yet)
    UnsupportedLayout(&'static str),
    Io(#[from] std::io::Error),
    ResourceExhaustion,
    // extraction target exists or has the wrong type
    FilesystemConflict(PathBuf),
    // benign, policy driven; never marks the image corrupted
    Skipped(PathBuf),
    InvalidInput(&'static str),
    ChecksumMismatch { stored: u32, computed: u32 },
}

// how wrong is this?
impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Error {
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_))
    }

    /// Whether the walker should treat this failure as evidence of a damaged image. I/O errors
    /// may be transient and skips are policy, so neither counts.
    pub fn marks_corrupted(&self) -> bool {
        !matches!(self, Error::Io(_) | Error::Skipped(_))
    }
}

impl From<rustix::io::Errno> for Error {
    fn from(e: rustix::io::Errno) -> Self {
        Error::Io(e.into())
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Error::ResourceExhaustion
    }
}
