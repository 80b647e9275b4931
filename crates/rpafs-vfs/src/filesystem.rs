//! The read-only filesystem interface served to the mount bridge.

use crate::node::{DirEntry, Ino, NodeAttr, ROOT_INO};
use crate::Result;

/// Inode-addressed read-only filesystem.
///
/// Implementations are shared between bridge worker threads and must be
/// safe to call concurrently.
pub trait ReadOnlyFs: Send + Sync {
    /// Attributes of an inode.
    fn getattr(&self, ino: Ino) -> Result<NodeAttr>;

    /// Find `name` in the directory `parent`.
    fn lookup(&self, parent: Ino, name: &str) -> Result<NodeAttr>;

    /// Immediate children of a directory, sorted by name.
    fn readdir(&self, ino: Ino) -> Result<Vec<DirEntry>>;

    /// Read up to `size` bytes at `offset`.
    ///
    /// Requests past the end of the file return fewer bytes, or none.
    fn read(&self, ino: Ino, offset: u64, size: u32) -> Result<Vec<u8>>;

    /// Resolve a `/`-separated path from the root.
    fn resolve(&self, path: &str) -> Result<NodeAttr> {
        let mut attr = self.getattr(ROOT_INO)?;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            attr = self.lookup(attr.ino, component)?;
        }
        Ok(attr)
    }

    /// Read a whole file by path.
    ///
    /// Issues as many [`read`](Self::read) calls as the file size needs,
    /// stopping early if the file comes up short.
    fn read_path(&self, path: &str) -> Result<Vec<u8>> {
        let attr = self.resolve(path)?;
        let mut data = Vec::new();
        loop {
            let remaining = attr.size.saturating_sub(data.len() as u64);
            let size = u32::try_from(remaining).unwrap_or(u32::MAX);
            let chunk = self.read(attr.ino, data.len() as u64, size)?;
            let done = chunk.is_empty() || chunk.len() as u64 >= remaining;
            data.extend_from_slice(&chunk);
            if done {
                return Ok(data);
            }
        }
    }
}
