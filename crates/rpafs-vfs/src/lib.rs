//! Read-only virtual filesystem over Ren'Py RPA archives.
//!
//! Archive members are flat, slash-separated keys. This crate turns them
//! into a directory tree and serves it through the [`ReadOnlyFs`] trait:
//!
//! - [`ArchiveFs`] - one archive, with lazy or eager member loading
//! - [`DirectoryFs`] - every `*.rpa` in a directory, each under its own
//!   root entry, opened on first traversal
//! - [`MountSession`] - mount lifecycle over a [`Bridge`]; with the `fuse`
//!   feature, [`FuseBridge`] mounts through the kernel FUSE driver
//!
//! # Example
//!
//! ```no_run
//! use rpafs_vfs::{ArchiveFs, MountOptions, ReadOnlyFs};
//!
//! let fs = ArchiveFs::open("scripts.rpa", &MountOptions::default())?;
//! let data = fs.read_path("game/script.rpy")?;
//! println!("{} bytes", data.len());
//! # Ok::<(), rpafs_vfs::Error>(())
//! ```

mod archive_fs;
mod directory_fs;
mod error;
mod filesystem;
#[cfg(feature = "fuse")]
mod fuse;
mod node;
mod options;
mod session;

pub use archive_fs::ArchiveFs;
pub use directory_fs::{assign_names, discover_archives, DirectoryFs, ARCHIVE_EXTENSION};
pub use error::{Error, Result};
pub use filesystem::ReadOnlyFs;
#[cfg(feature = "fuse")]
pub use fuse::{FuseBridge, FuseFs};
pub use node::{clamp_range, DirEntry, Ino, NodeAttr, NodeKind, ROOT_INO};
pub use options::{Materialization, MountOptions, PrefixPolicy};
pub use session::{Bridge, BridgeHandle, MountSession, MountSource, MountState};
