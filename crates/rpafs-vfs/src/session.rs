//! Mount lifecycle.
//!
//! A [`MountSession`] goes `Unmounted -> Mounted -> Terminated` and never
//! back. Termination is either requested with [`MountSession::unmount`] or
//! reported by the bridge when the mount goes away on its own; both are
//! observed through [`MountSession::done`].

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::archive_fs::ArchiveFs;
use crate::directory_fs::DirectoryFs;
use crate::filesystem::ReadOnlyFs;
use crate::options::MountOptions;
use crate::{Error, Result};

/// Lifecycle state of a [`MountSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Unmounted,
    Mounted,
    Terminated,
}

impl fmt::Display for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unmounted => "unmounted",
            Self::Mounted => "mounted",
            Self::Terminated => "terminated",
        })
    }
}

/// What to mount: one archive, or every archive in a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    Archive(PathBuf),
    Directory(PathBuf),
}

impl MountSource {
    /// Classify `path` by what it points at.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = std::path::absolute(path.as_ref())?;
        let meta = std::fs::metadata(&path)?;
        Ok(if meta.is_dir() {
            Self::Directory(path)
        } else {
            Self::Archive(path)
        })
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Archive(path) | Self::Directory(path) => path,
        }
    }

    /// Where to mount when the user asked for `target`.
    ///
    /// `.` means `./<source file name>_mount`.
    pub fn mountpoint_for(&self, target: &Path) -> PathBuf {
        if target != Path::new(".") {
            return target.to_path_buf();
        }
        let name = self
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "rpa".to_string());
        target.join(format!("{name}_mount"))
    }

    /// Build the filesystem to serve.
    pub fn build(&self, options: &MountOptions) -> Result<Arc<dyn ReadOnlyFs>> {
        let fs: Arc<dyn ReadOnlyFs> = match self {
            Self::Archive(path) => Arc::new(ArchiveFs::open(path, options)?),
            Self::Directory(path) => Arc::new(DirectoryFs::from_dir(path, options)?),
        };
        Ok(fs)
    }
}

type Unmounter = Box<dyn FnMut() -> io::Result<()> + Send>;

/// A running bridge connection.
pub struct BridgeHandle {
    unmount: Unmounter,
    terminated: Receiver<()>,
}

impl BridgeHandle {
    /// `unmount` asks the bridge to tear down the mount. `terminated` must
    /// disconnect once the bridge has stopped serving, whatever the cause.
    pub fn new(
        unmount: impl FnMut() -> io::Result<()> + Send + 'static,
        terminated: Receiver<()>,
    ) -> Self {
        Self {
            unmount: Box::new(unmount),
            terminated,
        }
    }
}

impl fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeHandle").finish_non_exhaustive()
    }
}

/// Connects a filesystem to the host's mount mechanism.
pub trait Bridge {
    fn start(
        &self,
        fs: Arc<dyn ReadOnlyFs>,
        mountpoint: &Path,
        options: &MountOptions,
    ) -> io::Result<BridgeHandle>;
}

/// One mount of one filesystem.
pub struct MountSession<B: Bridge> {
    bridge: B,
    state: Arc<Mutex<MountState>>,
    mount_path: Option<PathBuf>,
    unmounter: Option<Unmounter>,
    done: Option<Receiver<()>>,
    watcher: Option<JoinHandle<()>>,
}

impl<B: Bridge> MountSession<B> {
    pub fn new(bridge: B) -> Self {
        Self {
            bridge,
            state: Arc::new(Mutex::new(MountState::Unmounted)),
            mount_path: None,
            unmounter: None,
            done: None,
            watcher: None,
        }
    }

    /// Mount `source` at `mountpoint`.
    pub fn mount(
        &mut self,
        mountpoint: &Path,
        source: &MountSource,
        options: &MountOptions,
    ) -> Result<()> {
        self.ensure_unmounted()?;
        let fs = source.build(options)?;
        self.mount_fs(mountpoint, fs, options)
    }

    /// Mount an already built filesystem at `mountpoint`.
    pub fn mount_fs(
        &mut self,
        mountpoint: &Path,
        fs: Arc<dyn ReadOnlyFs>,
        options: &MountOptions,
    ) -> Result<()> {
        self.ensure_unmounted()?;

        let path = std::path::absolute(mountpoint).map_err(|source| Error::MountFailure {
            path: mountpoint.to_path_buf(),
            source,
        })?;

        let handle = self
            .bridge
            .start(fs, &path, options)
            .map_err(|source| Error::MountFailure {
                path: path.clone(),
                source,
            })?;
        let BridgeHandle {
            mut unmount,
            terminated,
        } = handle;

        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
        *self.state.lock() = MountState::Mounted;

        let watcher = match spawn_watcher(Arc::clone(&self.state), terminated, done_tx, path.clone())
        {
            Ok(watcher) => watcher,
            Err(source) => {
                if let Err(e) = unmount() {
                    warn!(path = %path.display(), error = %e, "failed to roll back mount");
                }
                *self.state.lock() = MountState::Unmounted;
                return Err(Error::MountFailure { path, source });
            }
        };

        info!(path = %path.display(), "mounted");
        self.mount_path = Some(path);
        self.unmounter = Some(unmount);
        self.done = Some(done_rx);
        self.watcher = Some(watcher);
        Ok(())
    }

    /// Tear the mount down and wait for the bridge to confirm.
    ///
    /// Unmounting a terminated session succeeds without doing anything.
    pub fn unmount(&mut self) -> Result<()> {
        match self.state() {
            MountState::Unmounted => return Err(Error::InvalidState(MountState::Unmounted)),
            MountState::Terminated => {
                self.join_watcher();
                return Ok(());
            }
            MountState::Mounted => {}
        }

        if let Some(unmount) = self.unmounter.as_mut() {
            if let Err(e) = unmount() {
                // Lost a race with an external unmount.
                if self.state() != MountState::Terminated {
                    return Err(Error::Io(e));
                }
                debug!(error = %e, "bridge already gone");
            }
        }

        self.join_watcher();
        Ok(())
    }

    pub fn state(&self) -> MountState {
        *self.state.lock()
    }

    /// Absolute mount path, once mounted.
    pub fn mount_path(&self) -> Option<&Path> {
        self.mount_path.as_deref()
    }

    /// Completion signal.
    ///
    /// Never carries a message; it disconnects exactly once, after the bridge
    /// has stopped serving. `None` before the first mount.
    pub fn done(&self) -> Option<&Receiver<()>> {
        self.done.as_ref()
    }

    /// Block until the session terminates.
    pub fn wait(&mut self) -> Result<()> {
        if self.state() == MountState::Unmounted {
            return Err(Error::InvalidState(MountState::Unmounted));
        }
        self.join_watcher();
        Ok(())
    }

    fn ensure_unmounted(&self) -> Result<()> {
        match self.state() {
            MountState::Unmounted => Ok(()),
            other => Err(Error::InvalidState(other)),
        }
    }

    fn join_watcher(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            if watcher.join().is_err() {
                warn!("mount watcher panicked");
                *self.state.lock() = MountState::Terminated;
            }
        }
    }
}

fn spawn_watcher(
    state: Arc<Mutex<MountState>>,
    terminated: Receiver<()>,
    done: Sender<()>,
    path: PathBuf,
) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("rpafs-mount-watch".to_string())
        .spawn(move || {
            // Only disconnection ends the mount; stray messages are ignored.
            while terminated.recv().is_ok() {}
            *state.lock() = MountState::Terminated;
            info!(path = %path.display(), "unmounted");
            drop(done);
        })
}

impl<B: Bridge> Drop for MountSession<B> {
    fn drop(&mut self) {
        if self.state() == MountState::Mounted {
            if let Err(e) = self.unmount() {
                warn!(error = %e, "failed to unmount on drop");
            }
        }
    }
}

impl<B: Bridge> fmt::Debug for MountSession<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountSession")
            .field("state", &self.state())
            .field("mount_path", &self.mount_path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crossbeam_channel::{RecvTimeoutError, TryRecvError};
    use rpafs_archive::testing::ArchiveBuilder;
    use rpafs_archive::RpaVersion;
    use tempfile::TempDir;

    use super::*;

    /// In-process bridge. Keeps the served filesystem and lets tests end the
    /// mount from the outside.
    #[derive(Default, Clone)]
    struct FakeBridge {
        unmounts: Arc<AtomicUsize>,
        served: Arc<Mutex<Option<Arc<dyn ReadOnlyFs>>>>,
        external: Arc<Mutex<Option<Sender<()>>>>,
        fail: bool,
    }

    impl FakeBridge {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn unmount_calls(&self) -> usize {
            self.unmounts.load(Ordering::SeqCst)
        }

        /// Simulate `fusermount -u` from another process.
        fn vanish(&self) {
            self.external.lock().take();
        }
    }

    impl Bridge for FakeBridge {
        fn start(
            &self,
            fs: Arc<dyn ReadOnlyFs>,
            _mountpoint: &Path,
            _options: &MountOptions,
        ) -> io::Result<BridgeHandle> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "no fuse"));
            }
            *self.served.lock() = Some(fs);

            let (tx, rx) = crossbeam_channel::unbounded();
            *self.external.lock() = Some(tx);

            let unmounts = Arc::clone(&self.unmounts);
            let external = Arc::clone(&self.external);
            Ok(BridgeHandle::new(
                move || {
                    unmounts.fetch_add(1, Ordering::SeqCst);
                    external.lock().take();
                    Ok(())
                },
                rx,
            ))
        }
    }

    fn archive_source(dir: &TempDir) -> MountSource {
        let path = dir.path().join("data.rpa");
        ArchiveBuilder::new(RpaVersion::V3)
            .key(0x1234)
            .file("readme.txt", b"hello")
            .write_to(&path)
            .unwrap();
        MountSource::from_path(&path).unwrap()
    }

    #[test]
    fn test_unmount_completes_once() {
        let dir = TempDir::new().unwrap();
        let bridge = FakeBridge::default();
        let mut session = MountSession::new(bridge.clone());
        assert_eq!(session.state(), MountState::Unmounted);
        assert!(session.done().is_none());

        session
            .mount(&dir.path().join("mnt"), &archive_source(&dir), &MountOptions::default())
            .unwrap();
        assert_eq!(session.state(), MountState::Mounted);
        assert_eq!(session.mount_path(), Some(dir.path().join("mnt").as_path()));

        let served = bridge.served.lock().clone().unwrap();
        assert_eq!(served.read_path("readme.txt").unwrap(), b"hello");

        let done = session.done().unwrap().clone();
        assert_eq!(
            done.recv_timeout(Duration::from_millis(20)),
            Err(RecvTimeoutError::Timeout)
        );

        session.unmount().unwrap();
        assert_eq!(session.state(), MountState::Terminated);
        assert_eq!(done.try_recv(), Err(TryRecvError::Disconnected));
        assert_eq!(bridge.unmount_calls(), 1);

        session.unmount().unwrap();
        assert_eq!(bridge.unmount_calls(), 1);
        assert_eq!(session.state(), MountState::Terminated);
    }

    #[test]
    fn test_external_termination() {
        let dir = TempDir::new().unwrap();
        let bridge = FakeBridge::default();
        let mut session = MountSession::new(bridge.clone());
        session
            .mount(dir.path(), &archive_source(&dir), &MountOptions::default())
            .unwrap();

        bridge.vanish();
        let done = session.done().unwrap();
        assert_eq!(
            done.recv_timeout(Duration::from_secs(5)),
            Err(RecvTimeoutError::Disconnected)
        );
        session.wait().unwrap();
        assert_eq!(session.state(), MountState::Terminated);

        session.unmount().unwrap();
        assert_eq!(bridge.unmount_calls(), 0);
    }

    #[test]
    fn test_no_remount() {
        let dir = TempDir::new().unwrap();
        let source = archive_source(&dir);
        let mut session = MountSession::new(FakeBridge::default());

        assert!(matches!(
            session.unmount(),
            Err(Error::InvalidState(MountState::Unmounted))
        ));

        session.mount(dir.path(), &source, &MountOptions::default()).unwrap();
        assert!(matches!(
            session.mount(dir.path(), &source, &MountOptions::default()),
            Err(Error::InvalidState(MountState::Mounted))
        ));

        session.unmount().unwrap();
        assert!(matches!(
            session.mount(dir.path(), &source, &MountOptions::default()),
            Err(Error::InvalidState(MountState::Terminated))
        ));
    }

    #[test]
    fn test_bridge_failure() {
        let dir = TempDir::new().unwrap();
        let mut session = MountSession::new(FakeBridge::failing());
        let err = session
            .mount(dir.path(), &archive_source(&dir), &MountOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::MountFailure { .. }));
        assert_eq!(session.state(), MountState::Unmounted);
    }

    #[test]
    fn test_bad_source_does_not_mount() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.rpa");
        std::fs::write(&path, b"PK\x03\x04").unwrap();

        let bridge = FakeBridge::default();
        let mut session = MountSession::new(bridge.clone());
        let err = session
            .mount(dir.path(), &MountSource::Archive(path), &MountOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Archive(_)));
        assert!(bridge.served.lock().is_none());
        assert_eq!(session.state(), MountState::Unmounted);
    }

    #[test]
    fn test_drop_unmounts() {
        let dir = TempDir::new().unwrap();
        let bridge = FakeBridge::default();
        {
            let mut session = MountSession::new(bridge.clone());
            session
                .mount(dir.path(), &archive_source(&dir), &MountOptions::default())
                .unwrap();
        }
        assert_eq!(bridge.unmount_calls(), 1);
    }

    #[test]
    fn test_mount_source() {
        let dir = TempDir::new().unwrap();
        let source = archive_source(&dir);
        assert!(matches!(source, MountSource::Archive(_)));
        assert_eq!(
            source.mountpoint_for(Path::new(".")),
            Path::new("./data.rpa_mount")
        );
        assert_eq!(source.mountpoint_for(Path::new("/mnt/x")), Path::new("/mnt/x"));

        let source = MountSource::from_path(dir.path()).unwrap();
        assert!(matches!(source, MountSource::Directory(_)));
        let fs = source.build(&MountOptions::default()).unwrap();
        assert_eq!(fs.read_path("data.rpa/readme.txt").unwrap(), b"hello");

        assert!(MountSource::from_path(dir.path().join("missing")).is_err());
    }
}
