//! Virtual node tree built from an archive's flat key space.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::OnceLock;

use parking_lot::Mutex;
use tracing::warn;

use crate::{Error, Result};

/// Inode number.
pub type Ino = u64;

/// Inode of the tree root.
pub const ROOT_INO: Ino = 1;

const FILE_PERM: u16 = 0o444;
const DIR_PERM: u16 = 0o555;

/// Kind of a virtual node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Directory,
    File,
}

/// Attributes reported for a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAttr {
    pub ino: Ino,
    pub kind: NodeKind,
    /// Byte size for files, 0 for directories
    pub size: u64,
    pub perm: u16,
    pub nlink: u32,
}

impl NodeAttr {
    pub fn directory(ino: Ino, subdirs: usize) -> Self {
        Self {
            ino,
            kind: NodeKind::Directory,
            size: 0,
            perm: DIR_PERM,
            nlink: 2 + subdirs as u32,
        }
    }

    pub fn file(ino: Ino, size: u64) -> Self {
        Self {
            ino,
            kind: NodeKind::File,
            size,
            perm: FILE_PERM,
            nlink: 1,
        }
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: Ino,
    pub name: String,
    pub kind: NodeKind,
}

/// Clamp a read request to `[0, len)`.
///
/// Offsets at or past the end yield an empty range.
pub fn clamp_range(len: usize, offset: u64, size: u32) -> Range<usize> {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(len);
    let end = start.saturating_add(size as usize).min(len);
    start..end
}

/// A slot filled at most once, possibly by a fallible producer.
///
/// Empty until the first successful fill; the fill runs under a lock so
/// concurrent first callers wait for one producer instead of racing. A failed
/// fill leaves the slot empty for the next caller. Reads after the fill take
/// no lock.
pub(crate) struct FillOnce<T> {
    cell: OnceLock<T>,
    fill: Mutex<()>,
}

impl<T> FillOnce<T> {
    pub(crate) fn new() -> Self {
        Self {
            cell: OnceLock::new(),
            fill: Mutex::new(()),
        }
    }

    #[inline]
    pub(crate) fn get(&self) -> Option<&T> {
        self.cell.get()
    }

    /// Fill the slot if empty. Returns false if it was already filled.
    pub(crate) fn set(&self, value: T) -> bool {
        let _guard = self.fill.lock();
        self.cell.set(value).is_ok()
    }

    pub(crate) fn get_or_try_fill<E>(
        &self,
        produce: impl FnOnce() -> std::result::Result<T, E>,
    ) -> std::result::Result<&T, E> {
        if let Some(value) = self.cell.get() {
            return Ok(value);
        }

        let _guard = self.fill.lock();
        if let Some(value) = self.cell.get() {
            return Ok(value);
        }

        let value = produce()?;
        Ok(self.cell.get_or_init(|| value))
    }
}

impl<T> Default for FillOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) enum Node {
    Directory {
        children: BTreeMap<String, Ino>,
        subdirs: usize,
    },
    File {
        /// Archive key of the member
        member: String,
        size: u64,
        content: FillOnce<Vec<u8>>,
    },
}

impl Node {
    fn directory() -> Self {
        Self::Directory {
            children: BTreeMap::new(),
            subdirs: 0,
        }
    }

    fn kind(&self) -> NodeKind {
        match self {
            Self::Directory { .. } => NodeKind::Directory,
            Self::File { .. } => NodeKind::File,
        }
    }
}

/// Immutable inode arena; inode `n` lives at index `n - 1`.
pub(crate) struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    /// Build a tree from `(archive key, size)` pairs.
    ///
    /// Keys are split on `/`; empty components are skipped. When a key names
    /// both a file and a directory, the directory wins.
    pub(crate) fn build<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        let mut tree = Self {
            nodes: vec![Node::directory()],
        };

        for (member, size) in members {
            let member: String = member.into();
            let components: Vec<&str> = member.split('/').filter(|c| !c.is_empty()).collect();
            let Some((file_name, dirs)) = components.split_last() else {
                warn!(member = %member, "skipping member with an empty path");
                continue;
            };

            let mut parent = ROOT_INO;
            for dir in dirs {
                parent = tree.ensure_directory(parent, dir);
            }
            tree.insert_file(parent, file_name, member.clone(), size);
        }

        tree
    }

    fn push(&mut self, node: Node) -> Ino {
        self.nodes.push(node);
        self.nodes.len() as Ino
    }

    fn child(&self, parent: Ino, name: &str) -> Option<Ino> {
        match self.nodes.get((parent - 1) as usize)? {
            Node::Directory { children, .. } => children.get(name).copied(),
            Node::File { .. } => None,
        }
    }

    fn link(&mut self, parent: Ino, name: &str, ino: Ino, is_dir: bool) {
        if let Some(Node::Directory { children, subdirs }) = self.nodes.get_mut((parent - 1) as usize) {
            children.insert(name.to_owned(), ino);
            if is_dir {
                *subdirs += 1;
            }
        }
    }

    fn ensure_directory(&mut self, parent: Ino, name: &str) -> Ino {
        let Some(ino) = self.child(parent, name) else {
            let ino = self.push(Node::directory());
            self.link(parent, name, ino, true);
            return ino;
        };

        let index = (ino - 1) as usize;
        if let Node::File { member, .. } = &self.nodes[index] {
            warn!(member = %member, "member is shadowed by a directory of the same name");
            self.nodes[index] = Node::directory();
            if let Some(Node::Directory { subdirs, .. }) = self.nodes.get_mut((parent - 1) as usize) {
                *subdirs += 1;
            }
        }
        ino
    }

    fn insert_file(&mut self, parent: Ino, name: &str, member: String, size: u64) {
        if self.child(parent, name).is_some() {
            warn!(member = %member, "member collides with an existing node, skipping");
            return;
        }

        let ino = self.push(Node::File {
            member,
            size,
            content: FillOnce::new(),
        });
        self.link(parent, name, ino, false);
    }

    pub(crate) fn get(&self, ino: Ino) -> Result<&Node> {
        ino.checked_sub(1)
            .and_then(|i| self.nodes.get(i as usize))
            .ok_or(Error::NoSuchNode(ino))
    }

    pub(crate) fn attr(&self, ino: Ino) -> Result<NodeAttr> {
        Ok(match self.get(ino)? {
            Node::Directory { subdirs, .. } => NodeAttr::directory(ino, *subdirs),
            Node::File { size, .. } => NodeAttr::file(ino, *size),
        })
    }

    pub(crate) fn lookup(&self, parent: Ino, name: &str) -> Result<Ino> {
        match self.get(parent)? {
            Node::Directory { children, .. } => {
                children.get(name).copied().ok_or_else(|| Error::NotFound {
                    parent,
                    name: name.to_owned(),
                })
            }
            Node::File { .. } => Err(Error::NotADirectory(parent)),
        }
    }

    /// Children of a directory, sorted by name.
    pub(crate) fn readdir(&self, ino: Ino) -> Result<Vec<DirEntry>> {
        match self.get(ino)? {
            Node::Directory { children, .. } => Ok(children
                .iter()
                .map(|(name, &child)| DirEntry {
                    ino: child,
                    name: name.clone(),
                    kind: self.nodes[(child - 1) as usize].kind(),
                })
                .collect()),
            Node::File { .. } => Err(Error::NotADirectory(ino)),
        }
    }

    /// All file nodes with their member keys and content slots.
    pub(crate) fn files(&self) -> impl Iterator<Item = (&str, &FillOnce<Vec<u8>>)> + '_ {
        self.nodes.iter().filter_map(|node| match node {
            Node::File {
                member, content, ..
            } => Some((member.as_str(), content)),
            Node::Directory { .. } => None,
        })
    }

    pub(crate) fn directory_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.kind() == NodeKind::Directory)
            .count()
    }

    pub(crate) fn file_count(&self) -> usize {
        self.nodes.len() - self.directory_count()
    }
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("directories", &self.directory_count())
            .field("files", &self.file_count())
            .finish()
    }
}
