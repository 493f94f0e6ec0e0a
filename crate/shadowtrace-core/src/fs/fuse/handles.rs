//! Open handles, by the id handed out to the kernel.

use crate::fs::{Dirent, Directory, File, FsError, HandleId};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub(crate) enum OpenHandle {
    /// An open directory, with the entries of the last enumeration.
    ///
    /// Entries are loaded when the kernel reads from offset 0 and
    /// served from memory for the following offsets.
    Dir(Directory, Option<Vec<Dirent>>),

    File(File),
}

/// Keeps track of open handles.
pub(crate) struct HandleTable {
    by_fh: Mutex<BTreeMap<HandleId, (u64, Arc<Mutex<OpenHandle>>)>>,
}

impl HandleTable {
    pub(crate) fn new() -> Self {
        Self {
            by_fh: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register the handle opened on node `ino` under `id`.
    pub(crate) async fn add(&self, ino: u64, id: HandleId, handle: OpenHandle) {
        self.by_fh
            .lock()
            .await
            .insert(id, (ino, Arc::new(Mutex::new(handle))));
    }

    /// Get the handle `fh`, which must have been opened on `ino`.
    pub(crate) async fn get_or_err(
        &self,
        fh: HandleId,
        expected_inode: u64,
    ) -> Result<Arc<Mutex<OpenHandle>>, FsError> {
        let by_fh = self.by_fh.lock().await;
        let (ino, handle) = by_fh.get(&fh).ok_or(FsError::BadHandle)?;
        if *ino != expected_inode {
            log::debug!("{fh} belongs to node {ino}, not {expected_inode}");
            return Err(FsError::BadHandle);
        }

        Ok(Arc::clone(handle))
    }

    /// Remove a handle from the table, returning it.
    pub(crate) async fn remove(&self, fh: HandleId) -> Option<Arc<Mutex<OpenHandle>>> {
        self.by_fh
            .lock()
            .await
            .remove(&fh)
            .map(|(_, handle)| handle)
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.by_fh.lock().await.len()
    }
}
