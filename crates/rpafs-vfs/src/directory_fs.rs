//! Filesystem view of a directory of archives.
//!
//! The root lists one directory per archive. An archive is opened and
//! decoded the first time its subtree is traversed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::archive_fs::ArchiveFs;
use crate::filesystem::ReadOnlyFs;
use crate::node::{DirEntry, FillOnce, Ino, NodeAttr, NodeKind, ROOT_INO};
use crate::options::MountOptions;
use crate::{Error, Result};

/// File extension of discoverable archives.
pub const ARCHIVE_EXTENSION: &str = "rpa";

const LOCAL_BITS: u32 = 32;
const LOCAL_MASK: u64 = (1 << LOCAL_BITS) - 1;

/// Find the `*.rpa` files directly inside `dir`, sorted by path.
pub fn discover_archives(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(Error::Discovery(format!(
            "{} is not a directory",
            dir.display()
        )));
    }

    let dir_str = dir
        .to_str()
        .ok_or_else(|| Error::Discovery(format!("non-UTF-8 path: {}", dir.display())))?;
    let pattern = format!(
        "{}/*.{}",
        glob::Pattern::escape(dir_str.trim_end_matches('/')),
        ARCHIVE_EXTENSION
    );

    let mut paths = Vec::new();
    for entry in glob::glob(&pattern).map_err(|e| Error::Discovery(e.to_string()))? {
        let path = entry.map_err(|e| Error::Discovery(e.to_string()))?;
        if path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    debug!(dir = %dir.display(), count = paths.len(), "discovered archives");
    Ok(paths)
}

/// Give every archive a unique root entry name.
///
/// Archives are named after their file name. When a name is taken, the
/// parent directory names are prepended one at a time, joined with `_`,
/// until the name is free: `x/foo.rpa` and `y/foo.rpa` become `foo.rpa`
/// and `y_foo.rpa`.
pub fn assign_names(paths: &[PathBuf]) -> Result<BTreeMap<String, PathBuf>> {
    let mut names = BTreeMap::new();

    for path in paths {
        let mut name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::NameCollisionUnresolvable(path.clone()))?;
        let mut ancestors = path.parent().into_iter().flat_map(Path::ancestors);

        while names.contains_key(&name) {
            let dir_name = ancestors
                .next()
                .and_then(Path::file_name)
                .ok_or_else(|| Error::NameCollisionUnresolvable(path.clone()))?;
            name = format!("{}_{}", dir_name.to_string_lossy(), name);
        }

        names.insert(name, path.clone());
    }

    Ok(names)
}

struct Slot {
    name: String,
    path: PathBuf,
    fs: FillOnce<ArchiveFs>,
}

/// Serves several archives under one synthetic root.
///
/// Inodes are namespaced per archive: the root is inode 1 and an archive's
/// local inode `n` is exposed as `(slot + 1) << 32 | n`.
pub struct DirectoryFs {
    slots: Vec<Slot>,
    options: MountOptions,
}

impl DirectoryFs {
    /// Serve an explicit list of archives.
    pub fn new(paths: &[PathBuf], options: &MountOptions) -> Result<Self> {
        let slots = assign_names(paths)?
            .into_iter()
            .map(|(name, path)| Slot {
                name,
                path,
                fs: FillOnce::new(),
            })
            .collect::<Vec<_>>();

        info!(archives = slots.len(), "prepared archive directory");
        Ok(Self {
            slots,
            options: options.clone(),
        })
    }

    /// Serve every archive found directly inside `dir`.
    pub fn from_dir(dir: impl AsRef<Path>, options: &MountOptions) -> Result<Self> {
        let paths = discover_archives(dir)?;
        Self::new(&paths, options)
    }

    /// Root entry names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.slots.iter().map(|s| s.name.as_str())
    }

    /// Backing path of a root entry.
    pub fn path_of(&self, name: &str) -> Option<&Path> {
        self.slot_by_name(name).map(|(_, s)| s.path.as_path())
    }

    /// Whether the archive behind `name` has been opened.
    pub fn is_mounted(&self, name: &str) -> bool {
        self.slot_by_name(name)
            .is_some_and(|(_, s)| s.fs.get().is_some())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot_by_name(&self, name: &str) -> Option<(usize, &Slot)> {
        self.slots
            .binary_search_by(|s| s.name.as_str().cmp(name))
            .ok()
            .map(|i| (i, &self.slots[i]))
    }

    /// Open the archive behind a slot, at most once.
    ///
    /// A failed open is not cached; the next access tries again.
    fn mounted(&self, slot: usize) -> Result<&ArchiveFs> {
        let entry = &self.slots[slot];
        entry.fs.get_or_try_fill(|| {
            debug!(name = %entry.name, path = %entry.path.display(), "opening archive");
            ArchiveFs::open(&entry.path, &self.options).inspect_err(|e| {
                warn!(name = %entry.name, error = %e, "failed to open archive");
            })
        })
    }

    fn split(&self, ino: Ino) -> Result<(usize, Ino)> {
        let high = ino >> LOCAL_BITS;
        if high == 0 || high as usize > self.slots.len() {
            return Err(Error::NoSuchNode(ino));
        }
        Ok(((high - 1) as usize, ino & LOCAL_MASK))
    }

    /// Attributes of a slot root.
    ///
    /// Never opens the archive, and stays the same once it is open: the
    /// link count does not include the archive's top-level directories.
    fn slot_root_attr(&self, slot: usize) -> NodeAttr {
        NodeAttr::directory(global_ino(slot, ROOT_INO), 0)
    }
}

fn global_ino(slot: usize, local: Ino) -> Ino {
    ((slot as u64 + 1) << LOCAL_BITS) | (local & LOCAL_MASK)
}

fn global_attr(slot: usize, attr: NodeAttr) -> NodeAttr {
    NodeAttr {
        ino: global_ino(slot, attr.ino),
        ..attr
    }
}

impl ReadOnlyFs for DirectoryFs {
    fn getattr(&self, ino: Ino) -> Result<NodeAttr> {
        if ino == ROOT_INO {
            return Ok(NodeAttr::directory(ROOT_INO, self.slots.len()));
        }
        let (slot, local) = self.split(ino)?;
        if local == ROOT_INO {
            return Ok(self.slot_root_attr(slot));
        }
        let attr = self.mounted(slot)?.getattr(local)?;
        Ok(global_attr(slot, attr))
    }

    fn lookup(&self, parent: Ino, name: &str) -> Result<NodeAttr> {
        if parent == ROOT_INO {
            let (slot, _) = self.slot_by_name(name).ok_or_else(|| Error::NotFound {
                parent,
                name: name.to_owned(),
            })?;
            return Ok(self.slot_root_attr(slot));
        }
        let (slot, local) = self.split(parent)?;
        let attr = self.mounted(slot)?.lookup(local, name).map_err(|e| match e {
            Error::NotFound { name, .. } => Error::NotFound { parent, name },
            other => other,
        })?;
        Ok(global_attr(slot, attr))
    }

    fn readdir(&self, ino: Ino) -> Result<Vec<DirEntry>> {
        if ino == ROOT_INO {
            return Ok(self
                .slots
                .iter()
                .enumerate()
                .map(|(slot, s)| DirEntry {
                    ino: global_ino(slot, ROOT_INO),
                    name: s.name.clone(),
                    kind: NodeKind::Directory,
                })
                .collect());
        }
        let (slot, local) = self.split(ino)?;
        let entries = self.mounted(slot)?.readdir(local)?;
        Ok(entries
            .into_iter()
            .map(|entry| DirEntry {
                ino: global_ino(slot, entry.ino),
                ..entry
            })
            .collect())
    }

    fn read(&self, ino: Ino, offset: u64, size: u32) -> Result<Vec<u8>> {
        if ino == ROOT_INO {
            return Err(Error::IsADirectory(ino));
        }
        let (slot, local) = self.split(ino)?;
        self.mounted(slot)?
            .read(local, offset, size)
            .map_err(|e| match e {
                Error::IsADirectory(_) => Error::IsADirectory(ino),
                other => other,
            })
    }
}

impl std::fmt::Debug for DirectoryFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryFs")
            .field(
                "archives",
                &self.slots.iter().map(|s| (&s.name, &s.path)).collect::<Vec<_>>(),
            )
            .field("options", &self.options)
            .finish()
    }
}
