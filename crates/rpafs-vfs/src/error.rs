//! Error types for the virtual filesystem.

use std::path::PathBuf;

use thiserror::Error;

use crate::node::Ino;
use crate::session::MountState;

/// Errors that can occur when serving or mounting archives.
#[derive(Debug, Error)]
pub enum Error {
    /// Archive decoding or member read error.
    #[error(transparent)]
    Archive(#[from] rpafs_archive::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Inode does not exist.
    #[error("no such inode: {0}")]
    NoSuchNode(Ino),

    /// Directory has no child with this name.
    #[error("no entry {name:?} in directory {parent}")]
    NotFound { parent: Ino, name: String },

    /// Directory operation on a file.
    #[error("inode {0} is not a directory")]
    NotADirectory(Ino),

    /// File operation on a directory.
    #[error("inode {0} is a directory")]
    IsADirectory(Ino),

    /// Archive discovery failed.
    #[error("archive discovery failed: {0}")]
    Discovery(String),

    /// Two archives could not be given distinct root names.
    #[error("cannot assign a unique mount name to {0}")]
    NameCollisionUnresolvable(PathBuf),

    /// The bridge could not be set up.
    #[error("failed to mount at {path}: {source}")]
    MountFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Operation not valid in the session's current state.
    #[error("mount session is {0}")]
    InvalidState(MountState),
}

impl Error {
    /// POSIX errno reported to the kernel for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Self::NoSuchNode(_)
            | Self::NotFound { .. }
            | Self::Archive(rpafs_archive::Error::NotFound(_)) => libc::ENOENT,
            Self::NotADirectory(_) => libc::ENOTDIR,
            Self::IsADirectory(_) => libc::EISDIR,
            _ => libc::EIO,
        }
    }
}

/// Result type for virtual filesystem operations.
pub type Result<T> = std::result::Result<T, Error>;
