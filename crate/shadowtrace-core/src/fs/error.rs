//! Error types and their translation to errno.
//!
//! Every failure of the backing filesystem is reported as one of the
//! variants of [BackingError]. [FsError] adds the failures produced by
//! this layer itself. [FsError::errno] maps both to the error code
//! reported to the kernel.

use nix::errno::Errno;
use nix::libc::{self, c_int};
use std::path::{Path, PathBuf};

/// A failure of the backing filesystem.
#[derive(Debug, thiserror::Error)]
pub enum BackingError {
    /// An operation on a single path failed.
    #[error("{op} {}: {errno}", path.display())]
    Path {
        op: &'static str,
        path: PathBuf,
        errno: Errno,
    },

    /// An operation involving two paths failed.
    #[error("{op} {} {}: {errno}", from.display(), to.display())]
    Link {
        op: &'static str,
        from: PathBuf,
        to: PathBuf,
        errno: Errno,
    },

    /// A system call failed without path context.
    #[error("{0}")]
    Errno(Errno),

    /// A failure that carries no OS error code.
    #[error("I/O error: {0}")]
    Other(std::io::Error),
}

impl BackingError {
    pub(crate) fn path(op: &'static str, path: &Path, err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) => BackingError::Path {
                op,
                path: path.to_path_buf(),
                errno: Errno::from_raw(code),
            },
            None => BackingError::Other(err),
        }
    }

    pub(crate) fn path_errno(op: &'static str, path: &Path, errno: Errno) -> Self {
        BackingError::Path {
            op,
            path: path.to_path_buf(),
            errno,
        }
    }

    pub(crate) fn link(op: &'static str, from: &Path, to: &Path, err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) => BackingError::Link {
                op,
                from: from.to_path_buf(),
                to: to.to_path_buf(),
                errno: Errno::from_raw(code),
            },
            None => BackingError::Other(err),
        }
    }

    /// The system error code behind this failure.
    pub fn errno(&self) -> Errno {
        match self {
            BackingError::Path { errno, .. } => *errno,
            BackingError::Link { errno, .. } => *errno,
            BackingError::Errno(errno) => *errno,
            BackingError::Other(_) => Errno::EIO,
        }
    }
}

impl From<Errno> for BackingError {
    fn from(value: Errno) -> Self {
        BackingError::Errno(value)
    }
}

/// Error returned by filesystem operations.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    /// Lookup failed, for whatever reason.
    #[error("not found")]
    NotFound,

    /// The operation needs an open handle.
    #[error("handle is not open")]
    NotSupported,

    /// The kernel referenced a handle that doesn't exist.
    #[error("unknown handle")]
    BadHandle,

    #[error(transparent)]
    Backing(#[from] BackingError),

    #[error("tokio runtime error {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl FsError {
    /// Return a libc error code to represent this error, fuse-side.
    pub fn errno(&self) -> c_int {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::NotSupported => libc::ENOTSUP,
            FsError::BadHandle => libc::EBADF,
            FsError::Backing(err) => err.errno() as c_int,
            FsError::Join(_) => libc::EIO,
        }
    }

    /// Convert into a libc error code.
    pub(crate) fn log_and_convert(self) -> c_int {
        let errno = self.errno();

        log::debug!("FUSE operation error: {self} -> {errno}");

        errno
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn layer_errors() {
        assert_eq!(libc::ENOENT, FsError::NotFound.errno());
        assert_eq!(libc::ENOTSUP, FsError::NotSupported.errno());
        assert_eq!(libc::EBADF, FsError::BadHandle.errno());
    }

    #[test]
    fn path_error_keeps_errno() {
        let err = BackingError::path(
            "mkdir",
            Path::new("/data/x/a"),
            io::Error::from_raw_os_error(libc::EEXIST),
        );

        assert!(matches!(err, BackingError::Path { op: "mkdir", .. }));
        assert_eq!(libc::EEXIST, FsError::from(err).errno());
    }

    #[test]
    fn link_error_keeps_errno() {
        let err = BackingError::link(
            "symlink",
            Path::new("/data/x/target"),
            Path::new("/data/x/link"),
            io::Error::from_raw_os_error(libc::EACCES),
        );

        assert!(matches!(err, BackingError::Link { .. }));
        assert_eq!(libc::EACCES, FsError::from(err).errno());
    }

    #[test]
    fn bare_errno() {
        assert_eq!(
            libc::ENOSPC,
            FsError::from(BackingError::from(Errno::ENOSPC)).errno()
        );
    }

    #[test]
    fn unrecognized_is_eio() {
        let err = BackingError::path(
            "read",
            Path::new("/data/x/f"),
            io::Error::new(io::ErrorKind::Other, "no code"),
        );

        assert!(matches!(err, BackingError::Other(_)));
        assert_eq!(libc::EIO, FsError::from(err).errno());
    }

    #[test]
    fn display_includes_path() {
        let err = BackingError::path_errno("rmdir", Path::new("/data/x/d"), Errno::ENOTEMPTY);

        assert!(err.to_string().starts_with("rmdir /data/x/d: ENOTEMPTY"));
    }
}
