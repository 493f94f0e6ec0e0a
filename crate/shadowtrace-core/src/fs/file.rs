use super::context::FsContext;
use super::error::{BackingError, FsError};
use super::handle::Handle;
use super::node::Node;
use shadowtrace_types::{Operation, ProcessInfo};
use std::fmt;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

/// A non-directory node of the backing tree: a file or a symlink.
///
/// Data operations require an instance returned by [File::open] or
/// [super::Directory::create].
pub struct File {
    node: Node,
    handle: Handle,
    process: Option<ProcessInfo>,
}

impl File {
    pub fn new(node: Node) -> Self {
        Self {
            node,
            handle: Handle::closed(),
            process: None,
        }
    }

    /// A file that has just been opened by `caller`.
    pub(crate) fn opened(node: Node, handle: Handle, caller: ProcessInfo) -> Self {
        Self {
            node,
            handle,
            process: Some(caller),
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn process(&self) -> Option<ProcessInfo> {
        self.process
    }

    fn ctx(&self) -> &Arc<FsContext> {
        self.node.context()
    }

    pub fn open(&self, flags: i32, caller: ProcessInfo) -> Result<File, FsError> {
        let trace = self.ctx().tracer().begin(
            Operation::Open {
                flags,
                mode: 0,
                is_dir: false,
            },
            self.node.path(),
            Some(caller),
        );

        trace.finish(self.do_open(flags, caller))
    }

    fn do_open(&self, flags: i32, caller: ProcessInfo) -> Result<File, FsError> {
        let id = self.ctx().next_handle_id();
        let handle = Handle::open(self.node.path(), flags, 0, id)?;
        log::debug!("Opened {:?} as {id}", self.node.path());

        Ok(File::opened(self.node.clone(), handle, caller))
    }

    /// Close the file. Does nothing if it is not open.
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
        // the descriptor is closed even if the sync fails
        let synced = if flush {
            self.handle.sync(self.node.path())
        } else {
            Ok(())
        };
        self.handle.close(self.node.path())?;

        synced
    }

    /// Read up to `size` bytes at `offset`.
    ///
    /// Returns fewer bytes only at the end of the file.
    pub fn read(&self, offset: u64, size: u32) -> Result<Vec<u8>, FsError> {
        let trace = self.ctx().tracer().begin(
            Operation::Read { offset, size },
            self.node.path(),
            self.process,
        );

        trace.finish(self.do_read(offset, size))
    }

    fn do_read(&self, offset: u64, size: u32) -> Result<Vec<u8>, FsError> {
        let file = self.handle.file()?;
        let mut buf = vec![0; size as usize];
        let mut filled = 0;
        while filled < buf.len() {
            match file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => return Err(BackingError::path("read", self.node.path(), err).into()),
            }
        }
        buf.truncate(filled);

        Ok(buf)
    }

    /// Write all of `data` at `offset`, returning the number of bytes
    /// written.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<u32, FsError> {
        let trace = self.ctx().tracer().begin(
            Operation::Write {
                offset,
                size: data.len(),
            },
            self.node.path(),
            self.process,
        );

        trace.finish(self.do_write(offset, data))
    }

    fn do_write(&self, offset: u64, data: &[u8]) -> Result<u32, FsError> {
        let written = u32::try_from(data.len())
            .map_err(|_| BackingError::path_errno("write", self.node.path(), nix::errno::Errno::EFBIG))?;
        self.handle
            .file()?
            .write_all_at(data, offset)
            .map_err(|err| BackingError::path("write", self.node.path(), err))?;

        Ok(written)
    }

    /// Called on each close(2) of a descriptor. Data is written
    /// through, so there is nothing to flush beyond checking the
    /// handle.
    pub fn flush(&self) -> Result<(), FsError> {
        let trace = self
            .ctx()
            .tracer()
            .begin(Operation::Flush, self.node.path(), self.process);

        trace.finish(self.handle.file().map(|_| ()))
    }

    pub fn fsync(&self, datasync: bool) -> Result<(), FsError> {
        let trace = self.ctx().tracer().begin(
            Operation::Fsync { datasync },
            self.node.path(),
            self.process,
        );

        trace.finish(self.do_fsync(datasync))
    }

    fn do_fsync(&self, datasync: bool) -> Result<(), FsError> {
        if !datasync {
            return self.handle.sync(self.node.path());
        }
        self.handle
            .file()?
            .sync_data()
            .map_err(|err| BackingError::path("fdatasync", self.node.path(), err))?;

        Ok(())
    }
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?} {:?}", self.node, self.handle)?;
        if let Some(process) = &self.process {
            write!(f, " {process}")?;
        }
        write!(f, "]")
    }
}
