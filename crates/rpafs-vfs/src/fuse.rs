//! FUSE bridge.

use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEntry, ReplyOpen, Request, Session,
};
use tracing::{debug, trace, warn};

use crate::filesystem::ReadOnlyFs;
use crate::node::{Ino, NodeAttr, NodeKind, ROOT_INO};
use crate::options::MountOptions;
use crate::session::{Bridge, BridgeHandle};
use crate::Error;

const BLOCK_SIZE: u32 = 512;

/// Adapts a [`ReadOnlyFs`] to `fuser`.
pub struct FuseFs {
    fs: Arc<dyn ReadOnlyFs>,
    ttl: Duration,
    created: SystemTime,
    uid: u32,
    gid: u32,
}

impl FuseFs {
    pub fn new(fs: Arc<dyn ReadOnlyFs>, ttl: Duration) -> Self {
        // SAFETY: getuid/getgid cannot fail.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Self {
            fs,
            ttl,
            created: SystemTime::now(),
            uid,
            gid,
        }
    }

    fn file_attr(&self, attr: &NodeAttr) -> FileAttr {
        FileAttr {
            ino: attr.ino,
            size: attr.size,
            blocks: attr.size.div_ceil(BLOCK_SIZE as u64),
            atime: self.created,
            mtime: self.created,
            ctime: self.created,
            crtime: self.created,
            kind: file_type(attr.kind),
            perm: attr.perm,
            nlink: attr.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }
}

fn file_type(kind: NodeKind) -> FileType {
    match kind {
        NodeKind::Directory => FileType::Directory,
        NodeKind::File => FileType::RegularFile,
    }
}

fn report(op: &str, ino: Ino, err: &Error) -> i32 {
    let errno = err.errno();
    if errno == libc::ENOENT {
        trace!(op, ino, error = %err, "not found");
    } else {
        warn!(op, ino, error = %err, errno, "operation failed");
    }
    errno
}

impl Filesystem for FuseFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.lookup(parent, name) {
            Ok(attr) => reply.entry(&self.ttl, &self.file_attr(&attr), 0),
            Err(e) => reply.error(report("lookup", parent, &e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.fs.getattr(ino) {
            Ok(attr) => reply.attr(&self.ttl, &self.file_attr(&attr)),
            Err(e) => reply.error(report("getattr", ino, &e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            reply.error(libc::EROFS);
            return;
        }
        match self.fs.getattr(ino) {
            Ok(attr) if attr.kind == NodeKind::Directory => reply.error(libc::EISDIR),
            Ok(_) => reply.opened(0, fuser::consts::FOPEN_KEEP_CACHE),
            Err(e) => reply.error(report("open", ino, &e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.read(ino, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(report("read", ino, &e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.fs.readdir(ino) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(report("readdir", ino, &e));
                return;
            }
        };

        // The kernel resolves `..` itself; any inode will do.
        let dots = [(ino, FileType::Directory, "."), (ROOT_INO, FileType::Directory, "..")];
        let listing = dots.into_iter().chain(
            entries
                .iter()
                .map(|e| (e.ino, file_type(e.kind), e.name.as_str())),
        );

        for (i, (child, kind, name)) in listing.enumerate().skip(offset.max(0) as usize) {
            if reply.add(child, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }
}

/// Mounts through the kernel FUSE driver.
#[derive(Debug, Default, Clone, Copy)]
pub struct FuseBridge;

impl FuseBridge {
    fn mount_options(options: &MountOptions) -> Vec<MountOption> {
        let mut opts = vec![
            MountOption::RO,
            MountOption::FSName(options.fs_name.clone()),
            MountOption::Subtype(options.fs_name.clone()),
        ];
        if options.allow_other {
            opts.push(MountOption::AllowOther);
        }
        opts
    }
}

impl Bridge for FuseBridge {
    fn start(
        &self,
        fs: Arc<dyn ReadOnlyFs>,
        mountpoint: &Path,
        options: &MountOptions,
    ) -> io::Result<BridgeHandle> {
        let fuse_fs = FuseFs::new(fs, options.ttl);
        let mut session = Session::new(fuse_fs, mountpoint, &Self::mount_options(options))?;
        let mut unmounter = session.unmount_callable();

        let (terminated_tx, terminated_rx) = crossbeam_channel::bounded::<()>(0);
        let path = mountpoint.to_path_buf();
        std::thread::Builder::new()
            .name("rpafs-fuse".to_string())
            .spawn(move || {
                if let Err(e) = session.run() {
                    warn!(path = %path.display(), error = %e, "FUSE session ended with error");
                }
                debug!(path = %path.display(), "FUSE session finished");
                drop(session);
                drop(terminated_tx);
            })?;

        Ok(BridgeHandle::new(move || unmounter.unmount(), terminated_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_options() {
        let options = MountOptions::default();
        let opts = FuseBridge::mount_options(&options);
        assert!(opts.contains(&MountOption::RO));
        assert!(opts.contains(&MountOption::FSName("rptool".into())));
        assert!(!opts.contains(&MountOption::AllowOther));

        let opts = FuseBridge::mount_options(&options.allow_other(true));
        assert!(opts.contains(&MountOption::AllowOther));
    }

    #[test]
    fn test_file_type() {
        assert_eq!(file_type(NodeKind::Directory), FileType::Directory);
        assert_eq!(file_type(NodeKind::File), FileType::RegularFile);
    }
}
