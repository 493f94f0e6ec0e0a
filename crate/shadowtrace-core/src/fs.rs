//! Shadowing filesystem engine.
//!
//! Nodes are disposable values naming one entry of the backing tree.
//! They are created per request and dropped with the response; the
//! only long-lived state is the open [Handle] of a [Directory] or
//! [File] between open and release.

mod attr;
mod context;
mod dir;
mod error;
mod file;
pub mod filter;
pub mod fuse;
mod handle;
mod node;
mod passthrough;

pub use attr::{Attr, Dirent, Entry, Validity};
pub use context::{FsContext, MountContext};
pub use dir::{Child, Directory};
pub use error::{BackingError, FsError};
pub use file::File;
pub use filter::NameFilter;
pub use handle::{Handle, HandleId};
pub use node::{Node, SetAttr};
