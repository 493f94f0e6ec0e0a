mod process;
mod time;
mod trace;

pub use process::ProcessInfo;
pub use time::UnixTime;
pub use trace::{Operation, Outcome, TraceRecord};
