//! Reader for Ren'Py RPA archives.
//!
//! RPA is the container format Ren'Py games use to bundle their assets. An
//! archive starts with a single text header line, followed by the member
//! payloads, followed by a zlib-compressed pickled index at the offset named
//! in the header. Three header versions are understood:
//!
//! - `RPA-2.0` - plain index, no obfuscation
//! - `RPA-3.0` - index offsets and lengths XOR-ed with a key built from the
//!   header's subkey fields
//! - `RPA-3.2` - as 3.0, with one reserved header field before the subkeys
//!
//! # Example
//!
//! ```no_run
//! use rpafs_archive::Archive;
//!
//! let archive = Archive::open("archive.rpa")?;
//!
//! for (name, entry) in archive.entries()? {
//!     println!("{}: {} bytes at {:#x}", name, entry.length(), entry.offset());
//! }
//!
//! let script = archive.read("script.rpy")?;
//! # Ok::<(), rpafs_archive::Error>(())
//! ```

mod archive;
mod decompress;
mod error;
mod header;
mod index;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use archive::Archive;
pub use error::{Error, Result};
pub use header::{Header, RpaVersion, MAX_HEADER_LEN};
pub use index::{deobfuscate, IndexEntry, IndexTable};
