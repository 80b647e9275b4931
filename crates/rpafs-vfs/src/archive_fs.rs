//! Filesystem view of a single archive.

use std::path::Path;
use std::sync::OnceLock;

use rpafs_archive::{Archive, IndexEntry};
use tracing::{debug, trace, warn};

use crate::filesystem::ReadOnlyFs;
use crate::node::{clamp_range, DirEntry, Ino, Node, NodeAttr, Tree};
use crate::options::{Materialization, MountOptions, PrefixPolicy};
use crate::{Error, Result};

/// Serves one decoded archive as a directory tree.
///
/// The tree is built on first access. File contents are cached per node
/// once read (or up front in eager mode) and never invalidated.
pub struct ArchiveFs {
    archive: Archive,
    materialization: Materialization,
    prefix: PrefixPolicy,
    tree: OnceLock<Tree>,
}

impl ArchiveFs {
    pub fn new(archive: Archive, options: &MountOptions) -> Self {
        Self {
            archive,
            materialization: options.materialization,
            prefix: options.prefix,
            tree: OnceLock::new(),
        }
    }

    /// Open and decode an archive.
    pub fn open(path: impl AsRef<Path>, options: &MountOptions) -> Result<Self> {
        let archive = Archive::open(path)?;
        Ok(Self::new(archive, options))
    }

    #[inline]
    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    /// Whether the directory tree has been built.
    #[inline]
    pub fn is_built(&self) -> bool {
        self.tree.get().is_some()
    }

    fn tree(&self) -> &Tree {
        self.tree.get_or_init(|| self.build_tree())
    }

    fn build_tree(&self) -> Tree {
        let members: Vec<(String, u64)> = match self.archive.entries() {
            Ok(entries) => entries
                .map(|(name, entry)| (name.to_owned(), self.member_size(entry)))
                .collect(),
            Err(e) => {
                warn!(archive = self.archive.name(), error = %e, "archive has no index");
                Vec::new()
            }
        };

        let tree = Tree::build(members);

        if self.materialization == Materialization::Eager {
            for (member, content) in tree.files() {
                match self.fetch(member) {
                    Ok(data) => {
                        content.set(data);
                    }
                    // Left empty; the first read retries.
                    Err(e) => warn!(member, error = %e, "eager read failed"),
                }
            }
        }

        debug!(
            archive = self.archive.name(),
            directories = tree.directory_count(),
            files = tree.file_count(),
            mode = ?self.materialization,
            "built archive tree"
        );

        tree
    }

    fn member_size(&self, entry: &IndexEntry) -> u64 {
        match self.prefix {
            PrefixPolicy::Include => entry.length(),
            PrefixPolicy::Strip => entry.stored_length(),
        }
    }

    fn fetch(&self, member: &str) -> Result<Vec<u8>> {
        let data = match self.prefix {
            PrefixPolicy::Include => self.archive.read(member)?,
            PrefixPolicy::Strip => self.archive.read_stored(member)?,
        };
        Ok(data)
    }
}

impl ReadOnlyFs for ArchiveFs {
    fn getattr(&self, ino: Ino) -> Result<NodeAttr> {
        self.tree().attr(ino)
    }

    fn lookup(&self, parent: Ino, name: &str) -> Result<NodeAttr> {
        let tree = self.tree();
        let ino = tree.lookup(parent, name)?;
        trace!(parent, name, ino, "lookup");
        tree.attr(ino)
    }

    fn readdir(&self, ino: Ino) -> Result<Vec<DirEntry>> {
        self.tree().readdir(ino)
    }

    fn read(&self, ino: Ino, offset: u64, size: u32) -> Result<Vec<u8>> {
        match self.tree().get(ino)? {
            Node::Directory { .. } => Err(Error::IsADirectory(ino)),
            Node::File {
                member, content, ..
            } => {
                let data = content.get_or_try_fill(|| self.fetch(member))?;
                let range = clamp_range(data.len(), offset, size);
                trace!(member = %member, offset, size, returned = range.len(), "read");
                Ok(data[range].to_vec())
            }
        }
    }
}

impl std::fmt::Debug for ArchiveFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveFs")
            .field("archive", &self.archive)
            .field("materialization", &self.materialization)
            .field("prefix", &self.prefix)
            .field("tree", &self.tree.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rpafs_archive::testing::ArchiveBuilder;
    use rpafs_archive::RpaVersion;
    use tempfile::TempDir;

    use super::*;
    use crate::node::{NodeKind, ROOT_INO};

    fn fixture(dir: &TempDir, builder: ArchiveBuilder) -> std::path::PathBuf {
        let path = dir.path().join("game.rpa");
        builder.write_to(&path).unwrap();
        path
    }

    fn sample() -> ArchiveBuilder {
        ArchiveBuilder::new(RpaVersion::V3)
            .key(0x42)
            .file("a/b.txt", b"bee")
            .file("a/c.txt", b"sea")
            .file("d.txt", b"0123456789")
    }

    #[test]
    fn test_tree_shape() {
        let dir = TempDir::new().unwrap();
        let fs = ArchiveFs::open(fixture(&dir, sample()), &MountOptions::default()).unwrap();
        assert!(!fs.is_built());

        let root: Vec<_> = fs
            .readdir(ROOT_INO)
            .unwrap()
            .into_iter()
            .map(|e| (e.name, e.kind))
            .collect();
        assert_eq!(
            root,
            [
                ("a".to_string(), NodeKind::Directory),
                ("d.txt".to_string(), NodeKind::File)
            ]
        );
        assert!(fs.is_built());

        let a = fs.lookup(ROOT_INO, "a").unwrap();
        let names: Vec<_> = fs.readdir(a.ino).unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, ["b.txt", "c.txt"]);

        let d = fs.resolve("d.txt").unwrap();
        assert_eq!(d.kind, NodeKind::File);
        assert_eq!(d.size, 10);
        assert_eq!(d.perm, 0o444);
    }

    #[test]
    fn test_read_clamps_range() {
        let dir = TempDir::new().unwrap();
        let fs = ArchiveFs::open(fixture(&dir, sample()), &MountOptions::default()).unwrap();
        let d = fs.resolve("d.txt").unwrap().ino;

        assert_eq!(fs.read(d, 0, 4).unwrap(), b"0123");
        assert_eq!(fs.read(d, 8, 100).unwrap(), b"89");
        assert!(fs.read(d, 10, 4).unwrap().is_empty());
        assert!(fs.read(d, 1 << 40, 4).unwrap().is_empty());
        assert_eq!(fs.read(d, 0, 0).unwrap(), b"");
    }

    #[test]
    fn test_lazy_reads_are_repeatable() {
        let dir = TempDir::new().unwrap();
        let fs = ArchiveFs::open(fixture(&dir, sample()), &MountOptions::default()).unwrap();

        let first = fs.read_path("a/b.txt").unwrap();
        let second = fs.read_path("a/b.txt").unwrap();
        assert_eq!(first, b"bee");
        assert_eq!(first, second);

        let listing = fs.readdir(ROOT_INO).unwrap();
        assert_eq!(listing, fs.readdir(ROOT_INO).unwrap());
    }

    #[test]
    fn test_eager_mode_caches_everything() {
        let dir = TempDir::new().unwrap();
        let path = fixture(&dir, sample());
        let options = MountOptions::default().materialization(Materialization::Eager);
        let fs = ArchiveFs::open(&path, &options).unwrap();
        fs.readdir(ROOT_INO).unwrap();

        // Contents survive the backing file going away.
        std::fs::write(&path, b"").unwrap();
        assert_eq!(fs.read_path("a/c.txt").unwrap(), b"sea");
        assert_eq!(fs.read_path("d.txt").unwrap(), b"0123456789");
    }

    #[test]
    fn test_prefix_policy() {
        let dir = TempDir::new().unwrap();
        let builder = ArchiveBuilder::new(RpaVersion::V2)
            .file_with_prefix("clip.ogg", b"data", b"Og")
            .file("after.txt", b"tail");

        let fs = ArchiveFs::open(fixture(&dir, builder.clone()), &MountOptions::default()).unwrap();
        assert_eq!(fs.resolve("clip.ogg").unwrap().size, 6);
        assert_eq!(fs.read_path("clip.ogg").unwrap(), b"Ogdata");
        assert_eq!(fs.read(fs.resolve("clip.ogg").unwrap().ino, 2, 100).unwrap(), b"data");

        let options = MountOptions::default().prefix(PrefixPolicy::Strip);
        let fs = ArchiveFs::open(fixture(&dir, builder), &options).unwrap();
        assert_eq!(fs.resolve("clip.ogg").unwrap().size, 4);
        assert_eq!(fs.read_path("clip.ogg").unwrap(), b"data");
        assert_eq!(fs.read_path("after.txt").unwrap(), b"tail");
    }

    #[test]
    fn test_operation_errors() {
        let dir = TempDir::new().unwrap();
        let fs = ArchiveFs::open(fixture(&dir, sample()), &MountOptions::default()).unwrap();
        let d = fs.resolve("d.txt").unwrap().ino;

        assert!(matches!(fs.read(ROOT_INO, 0, 1), Err(Error::IsADirectory(1))));
        assert!(matches!(fs.readdir(d), Err(Error::NotADirectory(_))));
        assert!(matches!(fs.resolve("a/missing"), Err(Error::NotFound { .. })));
        assert!(matches!(fs.getattr(1000), Err(Error::NoSuchNode(1000))));
    }

    #[test]
    fn test_concurrent_first_access() {
        let dir = TempDir::new().unwrap();
        let mut builder = ArchiveBuilder::new(RpaVersion::V3).key(9);
        for i in 0..32 {
            builder = builder.file(&format!("dir{}/file{i}.bin", i % 4), &[i as u8; 777]);
        }
        let fs = Arc::new(ArchiveFs::open(fixture(&dir, builder), &MountOptions::default()).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let fs = Arc::clone(&fs);
                std::thread::spawn(move || {
                    for i in 0..32 {
                        let i = (i + t * 3) % 32;
                        let data = fs.read_path(&format!("dir{}/file{i}.bin", i % 4)).unwrap();
                        assert_eq!(data, vec![i as u8; 777]);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(fs.readdir(ROOT_INO).unwrap().len(), 4);
    }
}
