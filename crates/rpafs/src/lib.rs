//! Rpafs - Ren'Py RPA archive reading and mounting.
//!
//! This crate re-exports the rpafs library crates under one name.
//!
//! # Crates
//!
//! - [`rpafs_archive`] - RPA header parsing, index decoding, member reads
//! - [`rpafs_vfs`] - directory tree, single and multi-archive filesystems,
//!   mount lifecycle and (with `fuse`) the FUSE bridge
//!
//! # Example
//!
//! ```no_run
//! use rpafs::prelude::*;
//!
//! let archive = Archive::open("images.rpa")?;
//! println!("{} ({} members)", archive.version()?, archive.len());
//!
//! let fs = DirectoryFs::from_dir("game", &MountOptions::default())?;
//! for name in fs.names() {
//!     println!("{name}");
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub use rpafs_archive as archive;
pub use rpafs_vfs as vfs;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use rpafs_archive::{Archive, IndexEntry, RpaVersion};
    #[cfg(feature = "fuse")]
    pub use rpafs_vfs::FuseBridge;
    pub use rpafs_vfs::{
        ArchiveFs, DirectoryFs, Materialization, MountOptions, MountSession, MountSource,
        PrefixPolicy, ReadOnlyFs,
    };
}

/// Version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
