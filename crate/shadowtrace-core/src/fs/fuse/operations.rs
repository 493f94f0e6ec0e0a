//! Requests of the kernel, run against the engine.
//!
//! Engine calls block on the backing filesystem, so each of them runs
//! on a tokio blocking worker.

use super::handles::{HandleTable, OpenHandle};
use super::inodes::InodeTable;
use crate::fs::{
    Attr, BackingError, Dirent, Directory, Entry, File, FsContext, FsError, HandleId, Node,
    SetAttr,
};
use nix::errno::Errno;
use nix::libc;
use shadowtrace_types::ProcessInfo;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Filesystem statistics, as reported by statfs.
pub(crate) struct StatFs {
    pub(crate) blocks: u64,
    pub(crate) bfree: u64,
    pub(crate) bavail: u64,
    pub(crate) files: u64,
    pub(crate) ffree: u64,
    pub(crate) bsize: u32,
    pub(crate) namelen: u32,
    pub(crate) frsize: u32,
}

pub(crate) struct InnerShadowFs {
    ctx: Arc<FsContext>,
    inodes: Mutex<InodeTable>,
    handles: HandleTable,
}

impl InnerShadowFs {
    /// Prepare to serve the shadow root of `ctx`.
    ///
    /// Fails if the shadow root cannot be stat'ed.
    pub(crate) fn new(ctx: Arc<FsContext>) -> Result<Self, FsError> {
        let root = Node::root(Arc::clone(&ctx));
        let root_ino = root.attr()?.attr.ino;

        Ok(Self {
            inodes: Mutex::new(InodeTable::new(root.path(), root_ino)),
            handles: HandleTable::new(),
            ctx,
        })
    }

    async fn node(&self, ino: u64) -> Result<Node, FsError> {
        let (parent, name) = self.inodes.lock().await.get(ino)?;

        Ok(Node::new(parent, name, Arc::clone(&self.ctx)))
    }

    async fn dir(&self, ino: u64) -> Result<Directory, FsError> {
        Ok(Directory::new(self.node(ino).await?))
    }

    /// Register `node` with the inode table and report its id in
    /// `attr`.
    async fn remember(&self, node: &Node, mut attr: Attr) -> Attr {
        attr.attr.ino = self
            .inodes
            .lock()
            .await
            .remember(node.parent(), node.name(), attr.attr.ino);

        attr
    }

    /// Report node ids, not backing inode numbers.
    async fn translate(&self, mut attr: Attr) -> Attr {
        attr.attr.ino = self.inodes.lock().await.to_fuse(attr.attr.ino);

        attr
    }

    pub(crate) async fn lookup(
        &self,
        parent: u64,
        name: OsString,
        caller: ProcessInfo,
    ) -> Result<Attr, FsError> {
        let dir = self.dir(parent).await?;
        let entry = blocking(move || dir.lookup(&name, caller)).await?;

        Ok(self.remember(entry.node.node(), entry.attr).await)
    }

    pub(crate) async fn forget(&self, ino: u64, nlookup: u64) {
        self.inodes.lock().await.forget(ino, nlookup);
    }

    pub(crate) async fn getattr(&self, ino: u64, caller: ProcessInfo) -> Result<Attr, FsError> {
        let node = self.node(ino).await?;
        let attr = blocking(move || node.getattr(caller)).await?;

        Ok(self.translate(attr).await)
    }

    pub(crate) async fn setattr(
        &self,
        ino: u64,
        changes: SetAttr,
        caller: ProcessInfo,
    ) -> Result<Attr, FsError> {
        let node = self.node(ino).await?;
        let attr = blocking(move || node.setattr(&changes, caller)).await?;

        Ok(self.translate(attr).await)
    }

    pub(crate) async fn readlink(&self, ino: u64, caller: ProcessInfo) -> Result<PathBuf, FsError> {
        let node = self.node(ino).await?;

        blocking(move || node.readlink(caller)).await
    }

    pub(crate) async fn open(
        &self,
        ino: u64,
        flags: i32,
        caller: ProcessInfo,
    ) -> Result<HandleId, FsError> {
        let file = File::new(self.node(ino).await?);
        let file = blocking(move || file.open(flags, caller)).await?;
        let fh = file.handle().id().ok_or(FsError::NotSupported)?;
        self.handles.add(ino, fh, OpenHandle::File(file)).await;

        Ok(fh)
    }

    pub(crate) async fn opendir(
        &self,
        ino: u64,
        flags: i32,
        caller: ProcessInfo,
    ) -> Result<HandleId, FsError> {
        let dir = self.dir(ino).await?;
        let flags = flags | libc::O_DIRECTORY;
        let dir = blocking(move || dir.open(flags, 0, caller)).await?;
        let fh = dir.handle().id().ok_or(FsError::NotSupported)?;
        self.handles.add(ino, fh, OpenHandle::Dir(dir, None)).await;

        Ok(fh)
    }

    /// Close a file or directory handle.
    ///
    /// An unknown handle is reported as a success, as it can only have
    /// been released already.
    pub(crate) async fn release(
        &self,
        fh: HandleId,
        flags: i32,
        flush: bool,
    ) -> Result<(), FsError> {
        let Some(handle) = self.handles.remove(fh).await else {
            log::debug!("Release of unknown {fh}");
            return Ok(());
        };
        let mut handle = handle.lock_owned().await;

        blocking(move || match &mut *handle {
            OpenHandle::File(file) => file.release(flags, flush),
            OpenHandle::Dir(dir, _) => dir.release(flags, flush),
        })
        .await
    }

    pub(crate) async fn read(
        &self,
        fh: HandleId,
        ino: u64,
        offset: i64,
        size: u32,
    ) -> Result<Vec<u8>, FsError> {
        let offset = to_offset(offset)?;
        let handle = self.handles.get_or_err(fh, ino).await?.lock_owned().await;

        blocking(move || match &*handle {
            OpenHandle::File(file) => file.read(offset, size),
            OpenHandle::Dir(..) => Err(FsError::BadHandle),
        })
        .await
    }

    pub(crate) async fn write(
        &self,
        fh: HandleId,
        ino: u64,
        offset: i64,
        data: Vec<u8>,
    ) -> Result<u32, FsError> {
        let offset = to_offset(offset)?;
        let handle = self.handles.get_or_err(fh, ino).await?.lock_owned().await;

        blocking(move || match &*handle {
            OpenHandle::File(file) => file.write(offset, &data),
            OpenHandle::Dir(..) => Err(FsError::BadHandle),
        })
        .await
    }

    pub(crate) async fn flush(&self, fh: HandleId, ino: u64) -> Result<(), FsError> {
        let handle = self.handles.get_or_err(fh, ino).await?.lock_owned().await;

        blocking(move || match &*handle {
            OpenHandle::File(file) => file.flush(),
            OpenHandle::Dir(..) => Err(FsError::BadHandle),
        })
        .await
    }

    pub(crate) async fn fsync(&self, fh: HandleId, ino: u64, datasync: bool) -> Result<(), FsError> {
        let handle = self.handles.get_or_err(fh, ino).await?.lock_owned().await;

        blocking(move || match &*handle {
            OpenHandle::File(file) => file.fsync(datasync),
            OpenHandle::Dir(..) => Err(FsError::BadHandle),
        })
        .await
    }

    /// Directory entries starting at `offset`.
    ///
    /// The directory is enumerated again when reading from offset 0.
    /// Entry offsets are their index in the enumeration, plus one.
    pub(crate) async fn readdir(
        &self,
        fh: HandleId,
        ino: u64,
        offset: i64,
    ) -> Result<Vec<Dirent>, FsError> {
        let offset = to_offset(offset)? as usize;
        let mut handle = self.handles.get_or_err(fh, ino).await?.lock_owned().await;

        let mut entries: Vec<Dirent> = blocking(move || {
            match &mut *handle {
                OpenHandle::Dir(dir, cached) => {
                    if offset == 0 || cached.is_none() {
                        *cached = Some(dir.read_dir_all()?);
                    }
                    Ok(cached
                        .as_deref()
                        .map(|entries| entries.iter().skip(offset).cloned().collect())
                        .unwrap_or_default())
                }
                OpenHandle::File(_) => Err(FsError::BadHandle),
            }
        })
        .await?;

        let inodes = self.inodes.lock().await;
        for entry in &mut entries {
            // the directory itself when "." or ".." can't be stat'ed
            entry.ino = if entry.ino == 0 {
                ino
            } else {
                inodes.to_fuse(entry.ino)
            };
        }

        Ok(entries)
    }

    pub(crate) async fn mkdir(
        &self,
        parent: u64,
        name: OsString,
        mode: u32,
        caller: ProcessInfo,
    ) -> Result<Attr, FsError> {
        let dir = self.dir(parent).await?;
        let entry = blocking(move || dir.mkdir(&name, mode, caller)).await?;

        Ok(self.remember(entry.node.node(), entry.attr).await)
    }

    /// Remove a file or a directory. Serves both unlink and rmdir.
    pub(crate) async fn remove(
        &self,
        parent: u64,
        name: OsString,
        caller: ProcessInfo,
    ) -> Result<(), FsError> {
        let dir = self.dir(parent).await?;

        blocking(move || dir.remove(&name, caller)).await
    }

    pub(crate) async fn create(
        &self,
        parent: u64,
        name: OsString,
        mode: u32,
        flags: i32,
        caller: ProcessInfo,
    ) -> Result<(Attr, HandleId), FsError> {
        let dir = self.dir(parent).await?;
        let Entry { node: file, attr } =
            blocking(move || dir.create(&name, flags, mode, caller)).await?;
        let attr = self.remember(file.node(), attr).await;
        let fh = file.handle().id().ok_or(FsError::NotSupported)?;
        self.handles
            .add(attr.attr.ino, fh, OpenHandle::File(file))
            .await;

        Ok((attr, fh))
    }

    pub(crate) async fn symlink(
        &self,
        parent: u64,
        link_name: OsString,
        target: PathBuf,
        caller: ProcessInfo,
    ) -> Result<Attr, FsError> {
        let dir = self.dir(parent).await?;
        let entry = blocking(move || dir.symlink(&link_name, &target, caller)).await?;

        Ok(self.remember(entry.node.node(), entry.attr).await)
    }

    pub(crate) async fn rename(
        &self,
        parent: u64,
        name: OsString,
        newparent: u64,
        newname: OsString,
        caller: ProcessInfo,
    ) -> Result<(), FsError> {
        let dir = self.dir(parent).await?;
        let new_parent = self.inodes.lock().await.path(newparent)?;
        let from = dir.node().path().join(&name);
        let to = new_parent.join(&newname);

        blocking(move || dir.rename(&name, &new_parent, &newname, caller)).await?;
        self.inodes.lock().await.renamed(&from, &to);

        Ok(())
    }

    pub(crate) async fn statfs(&self) -> Result<StatFs, FsError> {
        let root = self.ctx.mount().shadow_root().to_path_buf();

        blocking(move || {
            let st = nix::sys::statvfs::statvfs(&root).map_err(BackingError::from)?;

            Ok(StatFs {
                blocks: st.blocks() as u64,
                bfree: st.blocks_free() as u64,
                bavail: st.blocks_available() as u64,
                files: st.files() as u64,
                ffree: st.files_free() as u64,
                bsize: st.block_size() as u32,
                namelen: st.name_max() as u32,
                frsize: st.fragment_size() as u32,
            })
        })
        .await
    }
}

/// Run a blocking engine call on a tokio blocking worker.
async fn blocking<T, F>(f: F) -> Result<T, FsError>
where
    F: FnOnce() -> Result<T, FsError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

// Offsets are unsigned in the kernel protocol.
fn to_offset(offset: i64) -> Result<u64, FsError> {
    u64::try_from(offset).map_err(|_| BackingError::from(Errno::EINVAL).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MountContext;
    use crate::fs::Validity;
    use crate::fs::filter::ShowAll;
    use crate::trace::TraceEmitter;
    use assert_fs::TempDir;
    use assert_fs::prelude::*;
    use shadowtrace_types::TraceRecord;
    use tokio::sync::mpsc;

    const ROOT: u64 = fuser::FUSE_ROOT_ID;

    struct Fixture {
        fs: InnerShadowFs,
        records: mpsc::Receiver<TraceRecord>,
        tempdir: TempDir,
    }

    impl Fixture {
        fn setup() -> anyhow::Result<Self> {
            let _ = env_logger::try_init();
            let tempdir = TempDir::new()?;
            let (tracer, records) = TraceEmitter::channel(1000);
            let ctx = FsContext::new(
                MountContext::new("/mnt/x", tempdir.path()),
                Arc::new(ShowAll),
                tracer,
                Validity::default(),
            );

            Ok(Self {
                fs: InnerShadowFs::new(ctx)?,
                records,
                tempdir,
            })
        }

        fn drain(&mut self) -> Vec<TraceRecord> {
            let mut records = vec![];
            while let Ok(record) = self.records.try_recv() {
                records.push(record);
            }

            records
        }
    }

    fn caller() -> ProcessInfo {
        ProcessInfo::new(1000, 1000, 99)
    }

    #[tokio::test]
    async fn root_attr_has_root_id() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;

        let attr = fixture.fs.getattr(ROOT, caller()).await?;
        assert_eq!(ROOT, attr.attr.ino);
        assert!(attr.is_dir());

        Ok(())
    }

    #[tokio::test]
    async fn lookup_then_getattr() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;
        fixture.tempdir.child("d/f").write_str("abc")?;

        let d = fixture.fs.lookup(ROOT, "d".into(), caller()).await?;
        let f = fixture.fs.lookup(d.attr.ino, "f".into(), caller()).await?;
        assert_eq!(3, f.attr.size);

        let again = fixture.fs.getattr(f.attr.ino, caller()).await?;
        assert_eq!(f.attr.ino, again.attr.ino);
        assert_eq!(3, again.attr.size);

        Ok(())
    }

    #[tokio::test]
    async fn unknown_node_id() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;

        let err = fixture.fs.getattr(999_999, caller()).await.unwrap_err();
        assert_eq!(libc::ENOENT, err.errno());

        Ok(())
    }

    #[tokio::test]
    async fn forgotten_node_is_unknown() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;
        fixture.tempdir.child("f").touch()?;

        let attr = fixture.fs.lookup(ROOT, "f".into(), caller()).await?;
        fixture.fs.forget(attr.attr.ino, 1).await;

        assert!(fixture.fs.getattr(attr.attr.ino, caller()).await.is_err());

        Ok(())
    }

    #[tokio::test]
    async fn create_write_read_release() -> anyhow::Result<()> {
        let mut fixture = Fixture::setup()?;

        let (attr, fh) = fixture
            .fs
            .create(ROOT, "new".into(), 0o644, libc::O_RDWR, caller())
            .await?;
        let ino = attr.attr.ino;
        assert_eq!(5, fixture.fs.write(fh, ino, 0, b"hello".to_vec()).await?);
        assert_eq!(b"ell".to_vec(), fixture.fs.read(fh, ino, 1, 3).await?);
        fixture.fs.flush(fh, ino).await?;
        fixture.fs.fsync(fh, ino, true).await?;
        fixture.fs.release(fh, 0, false).await?;

        // gone from the table, and released only once
        let err = fixture.fs.read(fh, ino, 0, 1).await.unwrap_err();
        assert_eq!(libc::EBADF, err.errno());
        fixture.fs.release(fh, 0, false).await?;

        fixture.tempdir.child("new").assert("hello");
        let ops = fixture
            .drain()
            .iter()
            .map(|r| r.op.name())
            .collect::<Vec<_>>();
        assert_eq!(
            vec!["create", "write", "read", "flush", "fsync", "release"],
            ops
        );

        Ok(())
    }

    #[tokio::test]
    async fn handle_bound_to_node() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;
        fixture.tempdir.child("a").write_str("a")?;
        fixture.tempdir.child("b").write_str("b")?;

        let a = fixture.fs.lookup(ROOT, "a".into(), caller()).await?;
        let b = fixture.fs.lookup(ROOT, "b".into(), caller()).await?;
        let fh = fixture.fs.open(a.attr.ino, libc::O_RDONLY, caller()).await?;

        let err = fixture.fs.read(fh, b.attr.ino, 0, 1).await.unwrap_err();
        assert_eq!(libc::EBADF, err.errno());

        Ok(())
    }

    #[tokio::test]
    async fn readdir_offsets() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;
        fixture.tempdir.child("a").touch()?;
        fixture.tempdir.child("b").create_dir_all()?;

        let fh = fixture.fs.opendir(ROOT, libc::O_RDONLY, caller()).await?;
        let all = fixture.fs.readdir(fh, ROOT, 0).await?;
        assert_eq!(4, all.len());
        assert_eq!(".", all[2].name);
        assert_eq!(ROOT, all[2].ino);
        assert_eq!("..", all[3].name);
        assert_eq!(ROOT, all[3].ino);

        let rest = fixture.fs.readdir(fh, ROOT, 2).await?;
        assert_eq!(all[2..].to_vec(), rest);
        assert!(fixture.fs.readdir(fh, ROOT, 4).await?.is_empty());

        fixture.fs.release(fh, 0, false).await?;

        Ok(())
    }

    #[tokio::test]
    async fn readdir_on_file_handle() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;
        fixture.tempdir.child("f").touch()?;

        let f = fixture.fs.lookup(ROOT, "f".into(), caller()).await?;
        let fh = fixture.fs.open(f.attr.ino, libc::O_RDONLY, caller()).await?;

        let err = fixture.fs.readdir(fh, f.attr.ino, 0).await.unwrap_err();
        assert_eq!(libc::EBADF, err.errno());

        Ok(())
    }

    #[tokio::test]
    async fn rename_keeps_node_reachable() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;
        fixture.tempdir.child("d/f").write_str("x")?;
        fixture.tempdir.child("e").create_dir_all()?;

        let d = fixture.fs.lookup(ROOT, "d".into(), caller()).await?;
        let f = fixture.fs.lookup(d.attr.ino, "f".into(), caller()).await?;
        let e = fixture.fs.lookup(ROOT, "e".into(), caller()).await?;

        fixture
            .fs
            .rename(ROOT, "d".into(), e.attr.ino, "d2".into(), caller())
            .await?;

        let attr = fixture.fs.getattr(f.attr.ino, caller()).await?;
        assert_eq!(1, attr.attr.size);
        fixture.tempdir.child("e/d2/f").assert("x");

        Ok(())
    }

    #[tokio::test]
    async fn mkdir_symlink_readlink_remove() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;

        let d = fixture.fs.mkdir(ROOT, "d".into(), 0o755, caller()).await?;
        assert!(d.is_dir());
        let link = fixture
            .fs
            .symlink(ROOT, "l".into(), PathBuf::from("/mnt/x/d"), caller())
            .await?;
        assert_eq!(fuser::FileType::Symlink, link.attr.kind);
        assert_eq!(
            fixture.tempdir.path().join("d"),
            fixture.fs.readlink(link.attr.ino, caller()).await?
        );

        fixture.fs.remove(ROOT, "l".into(), caller()).await?;
        fixture.fs.remove(ROOT, "d".into(), caller()).await?;
        fixture.tempdir.child("d").assert(predicates::path::missing());

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_calls_on_one_name() -> anyhow::Result<()> {
        let Fixture {
            fs,
            mut records,
            tempdir,
        } = Fixture::setup()?;
        let fs = Arc::new(fs);

        let mut tasks = vec![];
        for i in 0..8u8 {
            let fs = Arc::clone(&fs);
            tasks.push(tokio::spawn(async move {
                let mut calls = 0usize;
                for _ in 0..10 {
                    calls += 1;
                    if let Ok((attr, fh)) = fs
                        .create(ROOT, "shared".into(), 0o644, libc::O_RDWR, caller())
                        .await
                    {
                        let ino = attr.attr.ino;
                        calls += 1;
                        let _ = fs.write(fh, ino, 0, vec![i; 16]).await;
                        calls += 1;
                        let _ = fs.release(fh, 0, true).await;
                    }

                    calls += 1;
                    if let Ok(attr) = fs.lookup(ROOT, "shared".into(), caller()).await {
                        let ino = attr.attr.ino;
                        calls += 1;
                        if let Ok(fh) = fs.open(ino, libc::O_RDONLY, caller()).await {
                            calls += 1;
                            let _ = fs.read(fh, ino, 0, 16).await;
                            calls += 1;
                            let _ = fs.release(fh, 0, false).await;
                        }
                    }

                    calls += 1;
                    let _ = fs.remove(ROOT, "shared".into(), caller()).await;
                }

                calls
            }));
        }
        let mut calls = 0;
        for task in tasks {
            calls += task.await?;
        }

        assert_eq!(0, fs.handles.len().await);
        let mut count = 0;
        while records.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(calls, count);
        assert!(std::fs::read_dir(tempdir.path())?.next().is_none());

        Ok(())
    }

    #[tokio::test]
    async fn statfs_reports_backing() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;

        let st = fixture.fs.statfs().await?;
        assert!(st.bsize > 0);
        assert!(st.namelen > 0);

        Ok(())
    }
}
