use super::attr::Validity;
use super::filter::NameFilter;
use super::handle::HandleId;
use crate::trace::TraceEmitter;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Where the filesystem is mounted and which directory it shadows.
///
/// Both paths are expected to be absolute and canonical.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountContext {
    mount_root: PathBuf,
    shadow_root: PathBuf,
}

impl MountContext {
    pub fn new(mount_root: impl Into<PathBuf>, shadow_root: impl Into<PathBuf>) -> Self {
        Self {
            mount_root: mount_root.into(),
            shadow_root: shadow_root.into(),
        }
    }

    /// Directory applications access the filesystem through.
    pub fn mount_root(&self) -> &Path {
        &self.mount_root
    }

    /// Real directory whose content is exposed.
    pub fn shadow_root(&self) -> &Path {
        &self.shadow_root
    }

    /// Map a path under the mount root to the same path under the
    /// shadow root.
    ///
    /// Return None if `path` is not the mount root or inside it.
    /// Matching is done component by component, so `/mnt/x2` is not
    /// inside `/mnt/x`.
    pub fn to_shadow(&self, path: &Path) -> Option<PathBuf> {
        let rest = path.strip_prefix(&self.mount_root).ok()?;
        if rest.as_os_str().is_empty() {
            return Some(self.shadow_root.clone());
        }

        Some(self.shadow_root.join(rest))
    }
}

/// State shared by every node of a mounted filesystem.
pub struct FsContext {
    mount: MountContext,
    filter: Arc<dyn NameFilter>,
    tracer: TraceEmitter,
    validity: Validity,
    next_handle: AtomicU64,
}

impl FsContext {
    pub fn new(
        mount: MountContext,
        filter: Arc<dyn NameFilter>,
        tracer: TraceEmitter,
        validity: Validity,
    ) -> Arc<Self> {
        Arc::new(Self {
            mount,
            filter,
            tracer,
            validity,
            next_handle: AtomicU64::new(1),
        })
    }

    pub fn mount(&self) -> &MountContext {
        &self.mount
    }

    pub fn filter(&self) -> &dyn NameFilter {
        self.filter.as_ref()
    }

    pub fn tracer(&self) -> &TraceEmitter {
        &self.tracer
    }

    pub fn validity(&self) -> Validity {
        self.validity
    }

    /// Allocate a handle id that was never returned before.
    pub(crate) fn next_handle_id(&self) -> HandleId {
        HandleId(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }
}

/// Join `path` to `base` and normalize the result lexically.
///
/// `.` components are dropped and `..` removes the previous component,
/// without looking at the filesystem. An absolute `path` replaces
/// `base`.
pub(crate) fn join_clean(base: &Path, path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in base.join(path).components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() && !out.has_root() {
                    out.push("..");
                }
            }
            Component::Normal(name) => out.push(name),
        }
    }

    out
}
