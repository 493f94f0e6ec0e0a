use super::attr::{Dirent, Entry};
use super::context::{self, FsContext};
use super::error::FsError;
use super::file::File;
use super::handle::Handle;
use super::node::Node;
use super::passthrough;
use nix::libc;
use shadowtrace_types::{Operation, ProcessInfo};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A node returned by lookup or symlink, typed after what it points to.
#[derive(Debug)]
pub enum Child {
    Dir(Directory),
    File(File),
}

impl Child {
    pub fn node(&self) -> &Node {
        match self {
            Child::Dir(dir) => dir.node(),
            Child::File(file) => file.node(),
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Child::Dir(_))
    }
}

/// A directory of the backing tree.
///
/// Operations that need an open directory, [Directory::read_dir_all]
/// and [Directory::release], are called on the instance returned by
/// [Directory::open].
pub struct Directory {
    node: Node,
    handle: Handle,
    process: Option<ProcessInfo>,
}

impl Directory {
    pub fn new(node: Node) -> Self {
        Self {
            node,
            handle: Handle::closed(),
            process: None,
        }
    }

    pub fn root(ctx: Arc<FsContext>) -> Self {
        Directory::new(Node::root(ctx))
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// The process that opened this directory.
    pub fn process(&self) -> Option<ProcessInfo> {
        self.process
    }

    fn ctx(&self) -> &Arc<FsContext> {
        self.node.context()
    }

    fn child_path(&self, name: &OsStr) -> PathBuf {
        self.node.path().join(name)
    }

    /// Open the directory, returning a new open instance.
    pub fn open(&self, flags: i32, mode: u32, caller: ProcessInfo) -> Result<Directory, FsError> {
        let trace = self.ctx().tracer().begin(
            Operation::Open {
                flags,
                mode,
                is_dir: true,
            },
            self.node.path(),
            Some(caller),
        );

        trace.finish(self.do_open(flags, mode, caller))
    }

    fn do_open(&self, flags: i32, mode: u32, caller: ProcessInfo) -> Result<Directory, FsError> {
        let id = self.ctx().next_handle_id();
        let handle = Handle::open(self.node.path(), flags, mode, id)?;
        log::debug!("Opened directory {:?} as {id}", self.node.path());

        Ok(Directory {
            node: self.node.clone(),
            handle,
            process: Some(caller),
        })
    }

    /// Close the directory.
    ///
    /// Does nothing if the directory is not open. If `flush` is set,
    /// the directory is synced before it is closed.
    pub fn release(&mut self, flags: i32, flush: bool) -> Result<(), FsError> {
        let trace = self.ctx().tracer().begin(
            Operation::Release { flags, flush },
            self.node.path(),
            self.process,
        );

        let res = self.do_release(flush);
        trace.finish(res)
    }

    fn do_release(&mut self, flush: bool) -> Result<(), FsError> {
        if !self.handle.is_open() {
            return Ok(());
        }
        if flush {
            if let Err(err) = self.handle.sync(self.node.path()) {
                log::debug!("Sync before release of {:?} failed: {err}", self.node.path());
            }
        }
        self.handle.close(self.node.path())?;

        Ok(())
    }

    /// Resolve `name` in this directory.
    ///
    /// Hidden names and names that cannot be stat'ed, for any reason,
    /// are reported as [FsError::NotFound].
    pub fn lookup(&self, name: &OsStr, caller: ProcessInfo) -> Result<Entry<Child>, FsError> {
        let mut trace = self.ctx().tracer().begin(
            Operation::Lookup { is_dir: false },
            self.child_path(name),
            Some(caller),
        );

        let res = self.do_lookup(name);
        if let Ok(entry) = &res {
            trace.set_op(Operation::Lookup {
                is_dir: entry.node.is_dir(),
            });
        }

        trace.finish(res)
    }

    fn do_lookup(&self, name: &OsStr) -> Result<Entry<Child>, FsError> {
        if self.ctx().filter().is_hidden(name) {
            return Err(FsError::NotFound);
        }
        let node = self.node.child(name);
        let attr = node.attr().map_err(|err| {
            log::debug!("Lookup {:?}: {err}", node.path());

            FsError::NotFound
        })?;

        Ok(Entry {
            node: if attr.is_dir() {
                Child::Dir(Directory::new(node))
            } else {
                Child::File(File::new(node))
            },
            attr,
        })
    }

    /// List the directory content, followed by `.` and `..`.
    ///
    /// The directory must be open. Entries are returned in the order
    /// of the backing filesystem, minus hidden names and entries that
    /// disappeared while listing.
    pub fn read_dir_all(&self) -> Result<Vec<Dirent>, FsError> {
        let trace = self
            .ctx()
            .tracer()
            .begin(Operation::ReadDir, self.node.path(), self.process);

        trace.finish(self.do_read_dir_all())
    }

    fn do_read_dir_all(&self) -> Result<Vec<Dirent>, FsError> {
        if !self.handle.is_open() {
            return Err(FsError::NotSupported);
        }
        let names = passthrough::list_dir(self.node.path())?;
        let mut entries = Vec::with_capacity(names.len() + 2);
        for name in names {
            if self.ctx().filter().is_hidden(&name) {
                continue;
            }
            let path = self.child_path(&name);
            match passthrough::lstat(&path) {
                Ok(m) => entries.push(Dirent::from_metadata(&m, name, path)),
                Err(err) => log::debug!("Skipping entry {path:?}: {err}"),
            }
        }

        let dot = dot_entry(self.node.path(), ".");
        let dotdot = if self.node.is_root() {
            Dirent {
                name: OsString::from(".."),
                ..dot.clone()
            }
        } else {
            dot_entry(self.node.parent(), "..")
        };
        entries.push(dot);
        entries.push(dotdot);

        Ok(entries)
    }

    /// Create a subdirectory.
    pub fn mkdir(
        &self,
        name: &OsStr,
        mode: u32,
        caller: ProcessInfo,
    ) -> Result<Entry<Directory>, FsError> {
        let path = self.child_path(name);
        let trace = self
            .ctx()
            .tracer()
            .begin(Operation::Mkdir { mode }, &path, Some(caller));

        trace.finish(self.do_mkdir(name, &path, mode))
    }

    fn do_mkdir(&self, name: &OsStr, path: &Path, mode: u32) -> Result<Entry<Directory>, FsError> {
        passthrough::mkdir(path, mode)?;
        let node = self.node.child(name);
        let attr = node.attr()?;

        Ok(Entry {
            node: Directory::new(node),
            attr,
        })
    }

    /// Remove an entry, be it a file, a symlink or an empty directory.
    pub fn remove(&self, name: &OsStr, caller: ProcessInfo) -> Result<(), FsError> {
        let path = self.child_path(name);
        let trace = self
            .ctx()
            .tracer()
            .begin(Operation::Remove, &path, Some(caller));

        trace.finish(passthrough::remove(&path).map_err(FsError::from))
    }

    /// Create a file and open it.
    ///
    /// The returned file is already open, with the given flags.
    pub fn create(
        &self,
        name: &OsStr,
        flags: i32,
        mode: u32,
        caller: ProcessInfo,
    ) -> Result<Entry<File>, FsError> {
        let path = self.child_path(name);
        let trace = self
            .ctx()
            .tracer()
            .begin(Operation::Create { flags, mode }, &path, Some(caller));

        trace.finish(self.do_create(name, flags, mode, caller))
    }

    fn do_create(
        &self,
        name: &OsStr,
        flags: i32,
        mode: u32,
        caller: ProcessInfo,
    ) -> Result<Entry<File>, FsError> {
        let node = self.node.child(name);
        let id = self.ctx().next_handle_id();
        let handle = Handle::open(node.path(), flags | libc::O_CREAT, mode, id)?;
        let attr = node.attr()?;
        log::debug!("Created and opened {:?} as {id}", node.path());

        Ok(Entry {
            node: File::opened(node, handle, caller),
            attr,
        })
    }

    /// Create a symlink called `name` pointing to `target`.
    ///
    /// A target that falls inside the mount root is rewritten to point
    /// to the same place under the shadow root, so the link stays
    /// valid once the filesystem is unmounted. Other targets are
    /// stored as given.
    ///
    /// The returned node is a directory if the target was an existing
    /// directory at creation time.
    pub fn symlink(
        &self,
        name: &OsStr,
        target: &Path,
        caller: ProcessInfo,
    ) -> Result<Entry<Child>, FsError> {
        let mount = self.ctx().mount();
        let abs_target = context::join_clean(self.node.path(), target);
        let (link_target, abs_target) = match mount.to_shadow(&abs_target) {
            Some(rewritten) => (rewritten.clone(), rewritten),
            None => (target.to_path_buf(), abs_target),
        };
        let target_is_dir = passthrough::lstat(&abs_target)
            .map(|m| m.is_dir())
            .unwrap_or(false);

        let path = self.child_path(name);
        let trace = self.ctx().tracer().begin(
            Operation::Symlink {
                target: target.to_path_buf(),
                link_target: link_target.clone(),
                target_is_dir,
            },
            &path,
            Some(caller),
        );

        trace.finish(self.do_symlink(name, &path, &link_target, target_is_dir))
    }

    fn do_symlink(
        &self,
        name: &OsStr,
        path: &Path,
        link_target: &Path,
        target_is_dir: bool,
    ) -> Result<Entry<Child>, FsError> {
        passthrough::symlink(link_target, path)?;
        let node = self.node.child(name);
        let attr = node.attr()?;

        Ok(Entry {
            node: if target_is_dir {
                Child::Dir(Directory::new(node))
            } else {
                Child::File(File::new(node))
            },
            attr,
        })
    }

    /// Move the entry `name` to `new_name` in the directory at
    /// `new_parent`.
    pub fn rename(
        &self,
        name: &OsStr,
        new_parent: &Path,
        new_name: &OsStr,
        caller: ProcessInfo,
    ) -> Result<(), FsError> {
        let from = self.child_path(name);
        let to = new_parent.join(new_name);
        let trace = self
            .ctx()
            .tracer()
            .begin(Operation::Rename { to: to.clone() }, &from, Some(caller));

        trace.finish(passthrough::rename(&from, &to).map_err(FsError::from))
    }
}

/// Entry for `.` or `..`.
///
/// These are always listed, even if the directory cannot be stat'ed.
fn dot_entry(path: &Path, name: &str) -> Dirent {
    match passthrough::lstat(path) {
        Ok(m) => Dirent::from_metadata(&m, OsString::from(name), path.to_path_buf()),
        Err(err) => {
            log::debug!("Cannot stat {path:?} for {name}: {err}");

            Dirent {
                ino: 0,
                name: OsString::from(name),
                kind: fuser::FileType::Directory,
                path: path.to_path_buf(),
            }
        }
    }
}

impl fmt::Debug for Directory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?} {:?}", self.node, self.handle)?;
        if let Some(process) = &self.process {
            write!(f, " {process}")?;
        }
        write!(f, "]")
    }
}
