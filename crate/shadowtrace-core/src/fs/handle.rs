use super::error::{BackingError, FsError};
use super::passthrough;
use std::fmt;
use std::path::Path;

/// Identifier of an open handle, as handed out to the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub(crate) u64);

impl HandleId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for HandleId {
    fn from(value: u64) -> Self {
        HandleId(value)
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FH#{}", self.0)
    }
}

/// An open descriptor on the backing filesystem, or nothing.
///
/// A handle starts closed, is opened once and closed once. Closing
/// a closed handle does nothing.
#[derive(Default)]
pub struct Handle {
    file: Option<std::fs::File>,
    flags: i32,
    id: Option<HandleId>,
}

impl Handle {
    pub fn closed() -> Self {
        Self::default()
    }

    pub(crate) fn open(path: &Path, flags: i32, mode: u32, id: HandleId) -> Result<Self, BackingError> {
        let file = passthrough::open(path, flags, mode)?;

        Ok(Self::adopt(file, flags, id))
    }

    /// Wrap a descriptor that is already open.
    pub(crate) fn adopt(file: std::fs::File, flags: i32, id: HandleId) -> Self {
        Self {
            file: Some(file),
            flags,
            id: Some(id),
        }
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Identifier assigned when the handle was opened.
    pub fn id(&self) -> Option<HandleId> {
        self.id
    }

    /// Flags the handle was opened with.
    pub fn flags(&self) -> i32 {
        self.flags
    }

    /// The open descriptor; fails if the handle is closed.
    pub(crate) fn file(&self) -> Result<&std::fs::File, FsError> {
        self.file.as_ref().ok_or(FsError::NotSupported)
    }

    /// Flush data and metadata to the backing storage.
    pub(crate) fn sync(&self, path: &Path) -> Result<(), FsError> {
        self.file()?
            .sync_all()
            .map_err(|err| BackingError::path("fsync", path, err))?;

        Ok(())
    }

    /// Close the descriptor, if it is open.
    pub(crate) fn close(&mut self, path: &Path) -> Result<(), BackingError> {
        match self.file.take() {
            Some(file) => passthrough::close(path, file),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.id, self.is_open()) {
            (Some(id), true) => write!(f, "{id} open flags={:#x}", self.flags),
            (Some(id), false) => write!(f, "{id} closed"),
            (None, _) => write!(f, "closed"),
        }
    }
}
