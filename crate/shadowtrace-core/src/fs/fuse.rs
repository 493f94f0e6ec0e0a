//! FUSE adapter.
//!
//! The kernel addresses nodes by id and open resources by handle id;
//! the engine addresses them by path. `inodes` and `handles` keep the
//! mapping for the ids the kernel holds, `operations` runs each request
//! against the engine and `interface` talks to fuser.

mod handles;
mod inodes;
mod interface;
mod operations;

pub use interface::{FuseHandle, export};
