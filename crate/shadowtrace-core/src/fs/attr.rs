use fuser::{FileAttr, FileType};
use nix::libc;
use std::ffi::OsString;
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

/// How long the kernel may reuse a reply before asking again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Validity {
    /// Validity of returned attributes.
    pub attr: Duration,

    /// Validity of a name to node resolution.
    pub entry: Duration,
}

impl Default for Validity {
    fn default() -> Self {
        Self {
            attr: Duration::from_secs(1),
            entry: Duration::from_millis(500),
        }
    }
}

/// Attributes of a node, as reported to the kernel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Attr {
    pub attr: FileAttr,
    pub attr_valid: Duration,
    pub entry_valid: Duration,
}

impl Attr {
    pub(crate) fn from_metadata(m: &Metadata, validity: Validity) -> Self {
        Self {
            attr: metadata_to_attr(m),
            attr_valid: validity.attr,
            entry_valid: validity.entry,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.attr.kind == FileType::Directory
    }
}

/// A node returned together with its attributes.
#[derive(Debug)]
pub struct Entry<N> {
    pub node: N,
    pub attr: Attr,
}

/// One directory entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dirent {
    pub ino: u64,
    pub name: OsString,
    pub kind: FileType,

    /// Backing path the entry describes.
    pub path: PathBuf,
}

impl Dirent {
    pub(crate) fn from_metadata(m: &Metadata, name: OsString, path: PathBuf) -> Self {
        Self {
            ino: m.ino(),
            name,
            kind: file_type(m.mode()),
            path,
        }
    }
}

pub(crate) fn file_type(mode: u32) -> FileType {
    match (mode as libc::mode_t) & libc::S_IFMT {
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

// Build a FileAttr from the metadata of a backing file.
fn metadata_to_attr(m: &Metadata) -> FileAttr {
    FileAttr {
        ino: m.ino(),
        size: m.size(),
        blocks: m.blocks(),
        atime: unix_time(m.atime(), m.atime_nsec()),
        mtime: unix_time(m.mtime(), m.mtime_nsec()),
        ctime: unix_time(m.ctime(), m.ctime_nsec()),
        crtime: m.created().unwrap_or(SystemTime::UNIX_EPOCH),
        kind: file_type(m.mode()),
        perm: (m.mode() & 0o7777) as u16,
        nlink: m.nlink() as u32,
        uid: m.uid(),
        gid: m.gid(),
        rdev: m.rdev() as u32,
        blksize: m.blksize() as u32,
        flags: 0, // macOS only
    }
}

fn unix_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs < 0 {
        return SystemTime::UNIX_EPOCH;
    }

    SystemTime::UNIX_EPOCH + Duration::new(secs as u64, nsecs.clamp(0, 999_999_999) as u32)
}
