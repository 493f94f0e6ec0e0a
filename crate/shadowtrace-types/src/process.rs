use std::fmt;

/// Identity of the process that issued a filesystem request.
///
/// Taken from the request header as-is. It is only ever used to
/// attribute trace records, never to make access decisions.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
pub struct ProcessInfo {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

impl ProcessInfo {
    pub fn new(uid: u32, gid: u32, pid: u32) -> Self {
        Self { uid, gid, pid }
    }
}

impl fmt::Display for ProcessInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uid={} gid={} pid={}", self.uid, self.gid, self.pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(
            "uid=1000 gid=100 pid=4242",
            ProcessInfo::new(1000, 100, 4242).to_string()
        );
    }
}
