//! Calls into the backing filesystem.
//!
//! Each function performs one operation on a real path and reports
//! failures as a [BackingError].

use super::error::BackingError;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc;
use nix::sys::stat::{Mode, UtimensatFlags};
use nix::sys::time::TimeSpec;
use std::ffi::OsString;
use std::fs::{DirBuilder, Metadata};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub(crate) fn lstat(path: &Path) -> Result<Metadata, BackingError> {
    std::fs::symlink_metadata(path).map_err(|err| BackingError::path("lstat", path, err))
}

/// Open `path` with raw open(2) flags.
///
/// `mode` is only used when `flags` creates the file.
pub(crate) fn open(path: &Path, flags: i32, mode: u32) -> Result<std::fs::File, BackingError> {
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_CLOEXEC;
    let mode = Mode::from_bits_truncate(mode as libc::mode_t);
    let fd = nix::fcntl::open(path, flags, mode)
        .map_err(|errno| BackingError::path_errno("open", path, errno))?;

    Ok(std::fs::File::from(fd))
}

/// Close `file`, reporting errors that dropping it would hide.
pub(crate) fn close(path: &Path, file: std::fs::File) -> Result<(), BackingError> {
    nix::unistd::close(file).map_err(|errno| BackingError::path_errno("close", path, errno))
}

pub(crate) fn mkdir(path: &Path, mode: u32) -> Result<(), BackingError> {
    DirBuilder::new()
        .mode(mode)
        .create(path)
        .map_err(|err| BackingError::path("mkdir", path, err))
}

/// Remove a file, a symlink or an empty directory.
pub(crate) fn remove(path: &Path) -> Result<(), BackingError> {
    let unlink_err = match std::fs::remove_file(path) {
        Ok(()) => return Ok(()),
        Err(err) => err,
    };
    match std::fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(err) if err.raw_os_error() == Some(libc::ENOTDIR) => {
            Err(BackingError::path("unlink", path, unlink_err))
        }
        Err(err) => Err(BackingError::path("rmdir", path, err)),
    }
}

/// Create a symlink at `link` that points to `target`.
pub(crate) fn symlink(target: &Path, link: &Path) -> Result<(), BackingError> {
    std::os::unix::fs::symlink(target, link)
        .map_err(|err| BackingError::link("symlink", target, link, err))
}

pub(crate) fn read_link(path: &Path) -> Result<PathBuf, BackingError> {
    std::fs::read_link(path).map_err(|err| BackingError::path("readlink", path, err))
}

pub(crate) fn rename(from: &Path, to: &Path) -> Result<(), BackingError> {
    std::fs::rename(from, to).map_err(|err| BackingError::link("rename", from, to, err))
}

/// List the names in a directory, in the order the backing
/// filesystem returns them.
pub(crate) fn list_dir(path: &Path) -> Result<Vec<OsString>, BackingError> {
    let mut names = vec![];
    for entry in std::fs::read_dir(path).map_err(|err| BackingError::path("readdir", path, err))? {
        let entry = entry.map_err(|err| BackingError::path("readdir", path, err))?;
        names.push(entry.file_name());
    }

    Ok(names)
}

pub(crate) fn truncate(path: &Path, size: u64) -> Result<(), BackingError> {
    let size = libc::off_t::try_from(size)
        .map_err(|_| BackingError::path_errno("truncate", path, Errno::EFBIG))?;
    nix::unistd::truncate(path, size)
        .map_err(|errno| BackingError::path_errno("truncate", path, errno))
}

pub(crate) fn chmod(path: &Path, mode: u32) -> Result<(), BackingError> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))
        .map_err(|err| BackingError::path("chmod", path, err))
}

pub(crate) fn lchown(path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<(), BackingError> {
    std::os::unix::fs::lchown(path, uid, gid).map_err(|err| BackingError::path("chown", path, err))
}

/// Set access and modification times of `path` itself, not of what
/// it links to. None keeps the current value.
pub(crate) fn set_times(
    path: &Path,
    atime: Option<SystemTime>,
    mtime: Option<SystemTime>,
) -> Result<(), BackingError> {
    nix::sys::stat::utimensat(
        nix::fcntl::AT_FDCWD,
        path,
        &timespec(atime),
        &timespec(mtime),
        UtimensatFlags::NoFollowSymlink,
    )
    .map_err(|errno| BackingError::path_errno("utimensat", path, errno))
}

fn timespec(time: Option<SystemTime>) -> TimeSpec {
    match time {
        None => TimeSpec::UTIME_OMIT,
        Some(time) => TimeSpec::from(
            time.duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default(),
        ),
    }
}
