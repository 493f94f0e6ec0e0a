use crate::{ProcessInfo, UnixTime};
use std::fmt;
use std::path::PathBuf;

/// One audit record, describing a single filesystem operation.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TraceRecord {
    /// When the operation was received.
    pub time: UnixTime,

    /// Operation kind and its parameters.
    #[serde(flatten)]
    pub op: Operation,

    /// Backing path the operation applies to.
    pub path: PathBuf,

    /// Identity of the requesting process, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessInfo>,

    pub outcome: Outcome,
}

impl TraceRecord {
    pub fn new(op: Operation, path: impl Into<PathBuf>, process: Option<ProcessInfo>) -> Self {
        Self {
            time: UnixTime::now(),
            op,
            path: path.into(),
            process,
            outcome: Outcome::Aborted,
        }
    }
}

impl fmt::Display for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.time, self.op.name(), self.path.display())?;
        self.op.fmt_params(f)?;
        if let Some(process) = &self.process {
            write!(f, " {process}")?;
        }
        write!(f, " {}", self.outcome)
    }
}

/// Operation kinds, with the parameters recorded for each.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Lookup {
        is_dir: bool,
    },
    Getattr,
    Setattr {
        size: Option<u64>,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        times: bool,
    },
    Readlink,
    Open {
        flags: i32,
        mode: u32,
        is_dir: bool,
    },
    Release {
        flags: i32,
        flush: bool,
    },
    ReadDir,
    Read {
        offset: u64,
        size: u32,
    },
    Write {
        offset: u64,
        size: usize,
    },
    Flush,
    Fsync {
        datasync: bool,
    },
    Mkdir {
        mode: u32,
    },
    Remove,
    Create {
        flags: i32,
        mode: u32,
    },
    /// `target` is what the caller asked for, `link_target` what was
    /// actually written to the backing filesystem.
    Symlink {
        target: PathBuf,
        link_target: PathBuf,
        target_is_dir: bool,
    },
    Rename {
        to: PathBuf,
    },
}

impl Operation {
    /// Short lowercase name of the operation.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Lookup { .. } => "lookup",
            Operation::Getattr => "getattr",
            Operation::Setattr { .. } => "setattr",
            Operation::Readlink => "readlink",
            Operation::Open { .. } => "open",
            Operation::Release { .. } => "release",
            Operation::ReadDir => "read_dir",
            Operation::Read { .. } => "read",
            Operation::Write { .. } => "write",
            Operation::Flush => "flush",
            Operation::Fsync { .. } => "fsync",
            Operation::Mkdir { .. } => "mkdir",
            Operation::Remove => "remove",
            Operation::Create { .. } => "create",
            Operation::Symlink { .. } => "symlink",
            Operation::Rename { .. } => "rename",
        }
    }

    fn fmt_params(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Getattr
            | Operation::Readlink
            | Operation::ReadDir
            | Operation::Flush
            | Operation::Remove => Ok(()),
            Operation::Lookup { is_dir } => write!(f, " is_dir={is_dir}"),
            Operation::Setattr {
                size,
                mode,
                uid,
                gid,
                times,
            } => {
                if let Some(size) = size {
                    write!(f, " size={size}")?;
                }
                if let Some(mode) = mode {
                    write!(f, " mode={mode:#o}")?;
                }
                if let Some(uid) = uid {
                    write!(f, " owner={uid}")?;
                }
                if let Some(gid) = gid {
                    write!(f, " group={gid}")?;
                }
                if *times {
                    write!(f, " times")?;
                }
                Ok(())
            }
            Operation::Open {
                flags,
                mode,
                is_dir,
            } => write!(f, " flags={flags:#x} mode={mode:#o} is_dir={is_dir}"),
            Operation::Release { flags, flush } => write!(f, " flags={flags:#x} flush={flush}"),
            Operation::Read { offset, size } => write!(f, " offset={offset} size={size}"),
            Operation::Write { offset, size } => write!(f, " offset={offset} size={size}"),
            Operation::Fsync { datasync } => write!(f, " datasync={datasync}"),
            Operation::Mkdir { mode } => write!(f, " mode={mode:#o}"),
            Operation::Create { flags, mode } => write!(f, " flags={flags:#x} mode={mode:#o}"),
            Operation::Symlink {
                target,
                link_target,
                target_is_dir,
            } => write!(
                f,
                " target={} link_target={} target_is_dir={target_is_dir}",
                target.display(),
                link_target.display()
            ),
            Operation::Rename { to } => write!(f, " to={}", to.display()),
        }
    }
}

/// How an operation ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    Error { errno: i32 },

    /// The operation never reported completion, for example because
    /// it panicked.
    Aborted,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Ok => write!(f, "ok"),
            Outcome::Error { errno } => write!(f, "errno={errno}"),
            Outcome::Aborted => write!(f, "aborted"),
        }
    }
}
