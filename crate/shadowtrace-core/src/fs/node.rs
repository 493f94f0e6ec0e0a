use super::attr::Attr;
use super::context::FsContext;
use super::error::FsError;
use super::passthrough;
use shadowtrace_types::{Operation, ProcessInfo};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

/// One named entry of the backing tree.
///
/// The path of a node is always its parent path joined with its name.
/// The root node has an empty parent path and the shadow root as name.
#[derive(Clone)]
pub struct Node {
    parent: PathBuf,
    name: OsString,
    path: PathBuf,
    ctx: Arc<FsContext>,
}

/// Attribute changes requested by setattr. None leaves a value alone.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetAttr {
    pub size: Option<u64>,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

impl Node {
    pub fn new(parent: impl Into<PathBuf>, name: impl Into<OsString>, ctx: Arc<FsContext>) -> Self {
        let parent = parent.into();
        let name = name.into();
        let path = parent.join(&name);

        Self {
            parent,
            name,
            path,
            ctx,
        }
    }

    /// The node of the shadow root.
    pub fn root(ctx: Arc<FsContext>) -> Self {
        let root = ctx.mount().shadow_root().to_path_buf();

        Node::new(PathBuf::new(), root, ctx)
    }

    /// A child of this node.
    pub fn child(&self, name: &OsStr) -> Node {
        Node::new(self.path.clone(), name, Arc::clone(&self.ctx))
    }

    /// Path of this node in the backing filesystem.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the parent node; empty for the root.
    pub fn parent(&self) -> &Path {
        &self.parent
    }

    pub fn name(&self) -> &OsStr {
        &self.name
    }

    pub fn is_root(&self) -> bool {
        self.parent.as_os_str().is_empty()
    }

    pub fn context(&self) -> &Arc<FsContext> {
        &self.ctx
    }

    /// Current attributes of the node, without tracing.
    pub(crate) fn attr(&self) -> Result<Attr, FsError> {
        let m = passthrough::lstat(&self.path)?;

        Ok(Attr::from_metadata(&m, self.ctx.validity()))
    }

    pub fn getattr(&self, caller: ProcessInfo) -> Result<Attr, FsError> {
        let trace = self
            .ctx
            .tracer()
            .begin(Operation::Getattr, &self.path, Some(caller));

        trace.finish(self.attr())
    }

    /// Apply attribute changes, then return the new attributes.
    ///
    /// Changes are applied one after the other, size first. A failure
    /// leaves the changes already applied in place.
    pub fn setattr(&self, changes: &SetAttr, caller: ProcessInfo) -> Result<Attr, FsError> {
        let trace = self.ctx.tracer().begin(
            Operation::Setattr {
                size: changes.size,
                mode: changes.mode,
                uid: changes.uid,
                gid: changes.gid,
                times: changes.atime.is_some() || changes.mtime.is_some(),
            },
            &self.path,
            Some(caller),
        );

        trace.finish(self.apply(changes))
    }

    fn apply(&self, changes: &SetAttr) -> Result<Attr, FsError> {
        if let Some(size) = changes.size {
            passthrough::truncate(&self.path, size)?;
        }
        if let Some(mode) = changes.mode {
            passthrough::chmod(&self.path, mode)?;
        }
        if changes.uid.is_some() || changes.gid.is_some() {
            passthrough::lchown(&self.path, changes.uid, changes.gid)?;
        }
        if changes.atime.is_some() || changes.mtime.is_some() {
            passthrough::set_times(&self.path, changes.atime, changes.mtime)?;
        }

        self.attr()
    }

    /// Target of a symlink, as stored.
    pub fn readlink(&self, caller: ProcessInfo) -> Result<PathBuf, FsError> {
        let trace = self
            .ctx
            .tracer()
            .begin(Operation::Readlink, &self.path, Some(caller));

        trace.finish(passthrough::read_link(&self.path).map_err(FsError::from))
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("parent", &self.parent)
            .field("name", &self.name)
            .finish()
    }
}
