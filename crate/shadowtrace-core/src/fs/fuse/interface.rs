//! FUSE interface layer: protocol handling and mount management.

use super::operations::InnerShadowFs;
use crate::config::MountConfig;
use crate::fs::{FsContext, HandleId, SetAttr};
use fuser::MountOption;
use nix::libc;
use shadowtrace_types::ProcessInfo;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::runtime::Handle;

/// Mount the shadowing filesystem of `ctx` at the given mountpoint.
///
/// Must be called from within a tokio runtime, which serves the
/// requests.
pub fn export(
    ctx: Arc<FsContext>,
    mountpoint: &Path,
    config: &MountConfig,
) -> anyhow::Result<FuseHandle> {
    let fs = ShadowFs {
        handle: Handle::current(),
        inner: Arc::new(InnerShadowFs::new(ctx)?),
    };
    let mut options = vec![
        MountOption::NoDev,
        MountOption::NoSuid,
        MountOption::FSName(config.fsname.clone()),
        MountOption::Subtype("shadowtrace".to_string()),
    ];
    if config.allow_other {
        options.push(MountOption::AllowOther);
        options.push(MountOption::AutoUnmount);
    }
    let bgsession = fuser::spawn_mount2(fs, mountpoint, &options)?;

    Ok(FuseHandle { inner: bgsession })
}

/// Handle that must be kept as long as the filesystem must
/// remain mounted.
///
/// To unmount the filesystem, call join() on the handle.
pub struct FuseHandle {
    inner: fuser::BackgroundSession,
}

impl FuseHandle {
    /// Unmount the filesystem and wait for the fuse run loop to stop.
    pub async fn join(self) -> Result<(), tokio::task::JoinError> {
        let Self { inner } = self;
        tokio::task::spawn_blocking(move || inner.join()).await
    }

    /// Unmount the filesystem and wait for the fuse run loop to stop.
    pub fn join_blocking(self) {
        self.inner.join();
    }
}

struct ShadowFs {
    /// Handle on the main tokio runtime (multithreaded)
    handle: Handle,

    inner: Arc<InnerShadowFs>,
}

fn caller(req: &fuser::Request<'_>) -> ProcessInfo {
    ProcessInfo::new(req.uid(), req.gid(), req.pid())
}

fn time_or_now(time: Option<fuser::TimeOrNow>) -> Option<SystemTime> {
    time.map(|t| match t {
        fuser::TimeOrNow::SpecificTime(time) => time,
        fuser::TimeOrNow::Now => SystemTime::now(),
    })
}

// Code in this impl runs on a thread started by fuser. Requests are
// moved to the tokio runtime with Handle::spawn, together with their
// reply.
impl fuser::Filesystem for ShadowFs {
    fn init(
        &mut self,
        _req: &fuser::Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> Result<(), libc::c_int> {
        Ok(())
    }

    fn destroy(&mut self) {}

    fn lookup(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let inner = Arc::clone(&self.inner);
        let name = name.to_owned();
        let caller = caller(req);

        self.handle.spawn(async move {
            match inner.lookup(parent, name, caller).await {
                Err(err) => reply.error(err.log_and_convert()),
                Ok(attr) => reply.entry(&attr.entry_valid, &attr.attr, 0),
            }
        });
    }

    fn forget(&mut self, _req: &fuser::Request<'_>, ino: u64, nlookup: u64) {
        let inner = Arc::clone(&self.inner);

        self.handle.spawn(async move {
            inner.forget(ino, nlookup).await;
        });
    }

    fn getattr(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        let inner = Arc::clone(&self.inner);
        let caller = caller(req);

        self.handle.spawn(async move {
            match inner.getattr(ino, caller).await {
                Err(err) => reply.error(err.log_and_convert()),
                Ok(attr) => reply.attr(&attr.attr_valid, &attr.attr),
            }
        });
    }

    fn setattr(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<fuser::TimeOrNow>,
        mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        // ctime, crtime, chgtime, bkuptime and flags are macOS-specific
        // and ignored
        let inner = Arc::clone(&self.inner);
        let caller = caller(req);
        let changes = SetAttr {
            size,
            mode,
            uid,
            gid,
            atime: time_or_now(atime),
            mtime: time_or_now(mtime),
        };

        self.handle.spawn(async move {
            match inner.setattr(ino, changes, caller).await {
                Err(err) => reply.error(err.log_and_convert()),
                Ok(attr) => reply.attr(&attr.attr_valid, &attr.attr),
            }
        });
    }

    fn readlink(&mut self, req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyData) {
        let inner = Arc::clone(&self.inner);
        let caller = caller(req);

        self.handle.spawn(async move {
            match inner.readlink(ino, caller).await {
                Err(err) => reply.error(err.log_and_convert()),
                Ok(target) => {
                    use std::os::unix::ffi::OsStrExt;

                    reply.data(target.as_os_str().as_bytes())
                }
            }
        });
    }

    fn mknod(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: fuser::ReplyEntry,
    ) {
        log::debug!("[Not Implemented] mknod(parent: {parent}, name: {name:?}, mode: {mode:o})");
        reply.error(libc::ENOSYS);
    }

    fn mkdir(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        // mode has already been masked by the kernel
        let inner = Arc::clone(&self.inner);
        let name = name.to_owned();
        let caller = caller(req);

        self.handle.spawn(async move {
            match inner.mkdir(parent, name, mode, caller).await {
                Err(err) => reply.error(err.log_and_convert()),
                Ok(attr) => reply.entry(&attr.entry_valid, &attr.attr, 0),
            }
        });
    }

    fn unlink(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        let inner = Arc::clone(&self.inner);
        let name = name.to_owned();
        let caller = caller(req);

        self.handle.spawn(async move {
            match inner.remove(parent, name, caller).await {
                Err(err) => reply.error(err.log_and_convert()),
                Ok(()) => reply.ok(),
            }
        });
    }

    fn rmdir(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        let inner = Arc::clone(&self.inner);
        let name = name.to_owned();
        let caller = caller(req);

        self.handle.spawn(async move {
            match inner.remove(parent, name, caller).await {
                Err(err) => reply.error(err.log_and_convert()),
                Ok(()) => reply.ok(),
            }
        });
    }

    fn symlink(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: fuser::ReplyEntry,
    ) {
        let inner = Arc::clone(&self.inner);
        let link_name = link_name.to_owned();
        let target = target.to_path_buf();
        let caller = caller(req);

        self.handle.spawn(async move {
            match inner.symlink(parent, link_name, target, caller).await {
                Err(err) => reply.error(err.log_and_convert()),
                Ok(attr) => reply.entry(&attr.entry_valid, &attr.attr, 0),
            }
        });
    }

    fn rename(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: fuser::ReplyEmpty,
    ) {
        if flags != 0 {
            // no RENAME_NOREPLACE or RENAME_EXCHANGE
            reply.error(libc::EINVAL);
            return;
        }
        let inner = Arc::clone(&self.inner);
        let name = name.to_owned();
        let newname = newname.to_owned();
        let caller = caller(req);

        self.handle.spawn(async move {
            match inner.rename(parent, name, newparent, newname, caller).await {
                Err(err) => reply.error(err.log_and_convert()),
                Ok(()) => reply.ok(),
            }
        });
    }

    fn link(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        log::debug!(
            "[Not Implemented] link(ino: {ino}, newparent: {newparent}, newname: {newname:?})"
        );
        reply.error(libc::ENOSYS);
    }

    fn open(&mut self, req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        let inner = Arc::clone(&self.inner);
        let caller = caller(req);

        self.handle.spawn(async move {
            match inner.open(ino, flags, caller).await {
                Err(err) => reply.error(err.log_and_convert()),
                Ok(fh) => reply.opened(fh.as_u64(), 0),
            }
        });
    }

    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        let inner = Arc::clone(&self.inner);

        self.handle.spawn(async move {
            match inner.read(HandleId::from(fh), ino, offset, size).await {
                Err(err) => reply.error(err.log_and_convert()),
                Ok(data) => reply.data(&data),
            }
        });
    }

    fn write(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        let inner = Arc::clone(&self.inner);
        let data = data.to_vec();

        self.handle.spawn(async move {
            match inner.write(HandleId::from(fh), ino, offset, data).await {
                Err(err) => reply.error(err.log_and_convert()),
                Ok(nbytes) => reply.written(nbytes),
            }
        });
    }

    fn flush(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: fuser::ReplyEmpty,
    ) {
        let inner = Arc::clone(&self.inner);

        self.handle.spawn(async move {
            match inner.flush(HandleId::from(fh), ino).await {
                Err(err) => reply.error(err.log_and_convert()),
                Ok(()) => reply.ok(),
            }
        });
    }

    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        flags: i32,
        _lock_owner: Option<u64>,
        flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        let inner = Arc::clone(&self.inner);

        self.handle.spawn(async move {
            match inner.release(HandleId::from(fh), flags, flush).await {
                Err(err) => reply.error(err.log_and_convert()),
                Ok(()) => reply.ok(),
            }
        });
    }

    fn fsync(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        datasync: bool,
        reply: fuser::ReplyEmpty,
    ) {
        let inner = Arc::clone(&self.inner);

        self.handle.spawn(async move {
            match inner.fsync(HandleId::from(fh), ino, datasync).await {
                Err(err) => reply.error(err.log_and_convert()),
                Ok(()) => reply.ok(),
            }
        });
    }

    fn opendir(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        flags: i32,
        reply: fuser::ReplyOpen,
    ) {
        let inner = Arc::clone(&self.inner);
        let caller = caller(req);

        self.handle.spawn(async move {
            match inner.opendir(ino, flags, caller).await {
                Err(err) => reply.error(err.log_and_convert()),
                Ok(fh) => reply.opened(fh.as_u64(), 0),
            }
        });
    }

    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        let inner = Arc::clone(&self.inner);

        self.handle.spawn(async move {
            match inner.readdir(HandleId::from(fh), ino, offset).await {
                Err(err) => reply.error(err.log_and_convert()),
                Ok(entries) => {
                    for (i, entry) in entries.iter().enumerate() {
                        let next = offset + i as i64 + 1;
                        if reply.add(entry.ino, next, entry.kind, &entry.name) {
                            // buffer full
                            break;
                        }
                    }
                    reply.ok();
                }
            }
        });
    }

    fn releasedir(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        flags: i32,
        reply: fuser::ReplyEmpty,
    ) {
        let inner = Arc::clone(&self.inner);

        self.handle.spawn(async move {
            match inner.release(HandleId::from(fh), flags, false).await {
                Err(err) => reply.error(err.log_and_convert()),
                Ok(()) => reply.ok(),
            }
        });
    }

    fn statfs(&mut self, _req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        let inner = Arc::clone(&self.inner);

        self.handle.spawn(async move {
            match inner.statfs().await {
                Err(err) => reply.error(err.log_and_convert()),
                Ok(st) => reply.statfs(
                    st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen,
                    st.frsize,
                ),
            }
        });
    }

    fn create(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        let inner = Arc::clone(&self.inner);
        let name = name.to_owned();
        let caller = caller(req);

        self.handle.spawn(async move {
            match inner.create(parent, name, mode, flags, caller).await {
                Err(err) => reply.error(err.log_and_convert()),
                Ok((attr, fh)) => reply.created(&attr.entry_valid, &attr.attr, 0, fh.as_u64(), 0),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{MountContext, Validity};
    use crate::fs::filter::ShowAll;
    use crate::trace::TraceEmitter;
    use shadowtrace_types::{Operation, TraceRecord};
    use std::os::unix::fs::MetadataExt;
    use std::path::PathBuf;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;
    use tokio::fs;
    use tokio::sync::mpsc;

    /// A shadow directory mounted on a temporary mountpoint.
    ///
    /// Use tokio I/O exclusively on the mountpoint: blocking calls
    /// would starve the runtime that serves the requests.
    struct FuseFixture {
        shadow: TempDir,
        mountpoint: TempDir,
        records: mpsc::Receiver<TraceRecord>,
        fuse_handle: Option<FuseHandle>,
    }

    impl FuseFixture {
        /// Mount a fresh shadow directory, or return None if FUSE is not
        /// available on this host.
        async fn setup() -> anyhow::Result<Option<Self>> {
            let _ = env_logger::try_init();
            if !Path::new("/dev/fuse").exists() {
                log::warn!("/dev/fuse not available, skipping");
                return Ok(None);
            }
            let shadow = TempDir::new()?;
            let mountpoint = TempDir::new()?;
            let (tracer, records) = TraceEmitter::channel(1000);
            let ctx = FsContext::new(
                MountContext::new(mountpoint.path(), shadow.path()),
                Arc::new(ShowAll),
                tracer,
                Validity::default(),
            );

            let original_dev = fs::metadata(mountpoint.path()).await?.dev();
            let handle = match export(ctx, mountpoint.path(), &MountConfig::default()) {
                Ok(handle) => handle,
                Err(err) => {
                    log::warn!("cannot mount, skipping: {err}");
                    return Ok(None);
                }
            };
            let limit = Instant::now() + Duration::from_secs(3);
            while fs::metadata(mountpoint.path()).await?.dev() == original_dev
                && Instant::now() < limit
            {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            assert_ne!(fs::metadata(mountpoint.path()).await?.dev(), original_dev);

            Ok(Some(Self {
                shadow,
                mountpoint,
                records,
                fuse_handle: Some(handle),
            }))
        }

        fn mount_path(&self) -> PathBuf {
            self.mountpoint.path().to_path_buf()
        }

        async fn unmount(&mut self) -> anyhow::Result<()> {
            if let Some(handle) = self.fuse_handle.take() {
                tokio::time::timeout(Duration::from_secs(3), handle.join()).await??;
            }

            Ok(())
        }

        fn drain(&mut self) -> Vec<TraceRecord> {
            let mut records = vec![];
            while let Ok(record) = self.records.try_recv() {
                records.push(record);
            }

            records
        }
    }

    impl Drop for FuseFixture {
        fn drop(&mut self) {
            if let Some(handle) = self.fuse_handle.take() {
                handle.join_blocking();
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    #[cfg_attr(not(target_os = "linux"), ignore)]
    async fn mount_shadows_directory() -> anyhow::Result<()> {
        let Some(mut fixture) = FuseFixture::setup().await? else {
            return Ok(());
        };
        std::fs::write(fixture.shadow.path().join("existing"), "before")?;
        let mount = fixture.mount_path();

        assert_eq!("before", fs::read_to_string(mount.join("existing")).await?);

        fs::create_dir(mount.join("dir")).await?;
        fs::write(mount.join("dir/new"), "through the mount").await?;
        assert_eq!(
            "through the mount",
            std::fs::read_to_string(fixture.shadow.path().join("dir/new"))?
        );

        let mut names = vec![];
        let mut entries = fs::read_dir(&mount).await?;
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        assert_eq!(vec!["dir", "existing"], names);

        fs::rename(mount.join("dir/new"), mount.join("moved")).await?;
        fs::remove_dir(mount.join("dir")).await?;
        assert!(fixture.shadow.path().join("moved").exists());
        assert!(!fixture.shadow.path().join("dir").exists());

        fixture.unmount().await?;

        let records = fixture.drain();
        assert!(records.iter().any(|r| matches!(r.op, Operation::Create { .. })));
        assert!(records.iter().any(|r| matches!(r.op, Operation::Rename { .. })));
        assert!(records.iter().all(|r| r.process.is_some()));

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    #[cfg_attr(not(target_os = "linux"), ignore)]
    async fn symlink_through_mount_points_to_shadow() -> anyhow::Result<()> {
        let Some(mut fixture) = FuseFixture::setup().await? else {
            return Ok(());
        };
        let mount = fixture.mount_path();
        fs::write(mount.join("target"), "x").await?;

        fs::symlink(mount.join("target"), mount.join("link")).await?;

        fixture.unmount().await?;
        assert_eq!(
            fixture.shadow.path().join("target"),
            std::fs::read_link(fixture.shadow.path().join("link"))?
        );
        assert_eq!("x", std::fs::read_to_string(fixture.shadow.path().join("link"))?);

        Ok(())
    }
}
