//! Node ids handed out to the kernel.
//!
//! A node id is the inode number of the backing entry, except that the
//! shadow root is always [fuser::FUSE_ROOT_ID]; whatever backing entry
//! has inode 1 takes the root's number instead. The table only
//! remembers where the ids the kernel currently holds live; it never
//! caches attributes or nodes.

use crate::fs::FsError;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

const ROOT: u64 = fuser::FUSE_ROOT_ID;

struct InodeEntry {
    parent: PathBuf,
    name: OsString,

    /// Number of lookups the kernel hasn't forgotten yet.
    lookups: u64,
}

impl InodeEntry {
    fn path(&self) -> PathBuf {
        self.parent.join(&self.name)
    }
}

pub(crate) struct InodeTable {
    shadow_root: PathBuf,
    root_ino: u64,
    entries: HashMap<u64, InodeEntry>,
}

impl InodeTable {
    /// Create a table for a shadow root whose backing inode is
    /// `root_ino`.
    pub(crate) fn new(shadow_root: impl Into<PathBuf>, root_ino: u64) -> Self {
        Self {
            shadow_root: shadow_root.into(),
            root_ino,
            entries: HashMap::new(),
        }
    }

    /// Convert a backing inode number to the id reported to the kernel.
    ///
    /// The conversion is its own inverse.
    pub(crate) fn to_fuse(&self, backing_ino: u64) -> u64 {
        if backing_ino == self.root_ino {
            ROOT
        } else if backing_ino == ROOT {
            self.root_ino
        } else {
            backing_ino
        }
    }

    /// Parent path and name of the node with the given id.
    ///
    /// The root has an empty parent path.
    pub(crate) fn get(&self, ino: u64) -> Result<(PathBuf, OsString), FsError> {
        if ino == ROOT {
            return Ok((PathBuf::new(), self.shadow_root.clone().into_os_string()));
        }
        match self.entries.get(&ino) {
            Some(entry) => Ok((entry.parent.clone(), entry.name.clone())),
            None => {
                log::debug!("Unknown node id {ino}");

                Err(FsError::NotFound)
            }
        }
    }

    /// Path of the node with the given id.
    pub(crate) fn path(&self, ino: u64) -> Result<PathBuf, FsError> {
        let (parent, name) = self.get(ino)?;

        Ok(parent.join(name))
    }

    /// Record that the kernel looked up `name` in `parent`, returning
    /// the id to report.
    pub(crate) fn remember(&mut self, parent: &Path, name: &OsStr, backing_ino: u64) -> u64 {
        let ino = self.to_fuse(backing_ino);
        if ino == ROOT {
            return ino;
        }
        let entry = self.entries.entry(ino).or_insert_with(|| InodeEntry {
            parent: PathBuf::new(),
            name: OsString::new(),
            lookups: 0,
        });
        entry.parent = parent.to_path_buf();
        entry.name = name.to_os_string();
        entry.lookups += 1;

        ino
    }

    /// Drop `nlookup` lookups of `ino`, forgetting it once none are
    /// left.
    pub(crate) fn forget(&mut self, ino: u64, nlookup: u64) {
        if let Some(entry) = self.entries.get_mut(&ino) {
            entry.lookups = entry.lookups.saturating_sub(nlookup);
            if entry.lookups == 0 {
                self.entries.remove(&ino);
            }
        }
    }

    /// Update the location of the entry at `from` and of everything
    /// below it after a rename.
    pub(crate) fn renamed(&mut self, from: &Path, to: &Path) {
        for entry in self.entries.values_mut() {
            let path = entry.path();
            if path == from {
                if let (Some(parent), Some(name)) = (to.parent(), to.file_name()) {
                    entry.parent = parent.to_path_buf();
                    entry.name = name.to_os_string();
                }
            } else if let Ok(rest) = entry.parent.strip_prefix(from) {
                entry.parent = to.join(rest);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}
