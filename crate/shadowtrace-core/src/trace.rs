//! Audit trace of filesystem operations.
//!
//! Operations open a [TraceScope] on entry; the scope emits exactly
//! one [TraceRecord] when it goes away, carrying the outcome reported
//! through [TraceScope::finish]. Records are queued without blocking:
//! when the queue is full they are counted and dropped, so a slow
//! consumer never slows down the filesystem.

pub mod writer;

use crate::fs::FsError;
use shadowtrace_types::{Operation, Outcome, ProcessInfo, TraceRecord};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};

pub use writer::TraceFormat;

/// Producer side of the trace queue.
#[derive(Clone)]
pub struct TraceEmitter {
    tx: Option<mpsc::Sender<TraceRecord>>,
    dropped: Arc<AtomicU64>,
}

impl TraceEmitter {
    /// Create an emitter and the receiver its records are sent to.
    ///
    /// At most `capacity` records are queued.
    pub fn channel(capacity: usize) -> (TraceEmitter, mpsc::Receiver<TraceRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));

        (
            TraceEmitter {
                tx: Some(tx),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// An emitter that discards everything.
    pub fn disabled() -> TraceEmitter {
        TraceEmitter {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start tracing an operation.
    pub fn begin(
        &self,
        op: Operation,
        path: impl Into<PathBuf>,
        process: Option<ProcessInfo>,
    ) -> TraceScope {
        TraceScope {
            emitter: self.clone(),
            record: Some(TraceRecord::new(op, path, process)),
        }
    }

    /// Queue a record, dropping it if the queue is full or closed.
    pub fn emit(&self, record: TraceRecord) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) | Err(TrySendError::Closed(record)) => {
                let count = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if count == 1 || count % 1000 == 0 {
                    log::warn!(
                        "Trace queue unavailable; dropped {} {} ({count} so far)",
                        record.op.name(),
                        record.path.display()
                    );
                }
            }
        }
    }

    /// Number of records dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// An operation in progress.
///
/// Emits its record when dropped.
pub struct TraceScope {
    emitter: TraceEmitter,
    record: Option<TraceRecord>,
}

impl TraceScope {
    /// Replace the operation, to record parameters that are only known
    /// once the operation has started.
    pub fn set_op(&mut self, op: Operation) {
        if let Some(record) = &mut self.record {
            record.op = op;
        }
    }

    /// Attach the outcome of `result` and emit the record.
    pub fn finish<T>(mut self, result: Result<T, FsError>) -> Result<T, FsError> {
        if let Some(record) = &mut self.record {
            record.outcome = match &result {
                Ok(_) => Outcome::Ok,
                Err(err) => Outcome::Error { errno: err.errno() },
            };
        }

        result
    }
}

impl Drop for TraceScope {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            self.emitter.emit(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_emits_once_with_outcome() {
        let (tracer, mut rx) = TraceEmitter::channel(10);

        let scope = tracer.begin(Operation::Remove, "/data/x/f", None);
        let _ = scope.finish::<()>(Err(FsError::NotFound));

        let record = rx.try_recv().unwrap();
        assert_eq!(Operation::Remove, record.op);
        assert_eq!(Outcome::Error { errno: 2 }, record.outcome);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unfinished_scope_is_aborted() {
        let (tracer, mut rx) = TraceEmitter::channel(10);

        drop(tracer.begin(Operation::Flush, "/data/x/f", None));

        assert_eq!(Outcome::Aborted, rx.try_recv().unwrap().outcome);
    }

    #[test]
    fn set_op_replaces_params() {
        let (tracer, mut rx) = TraceEmitter::channel(10);

        let mut scope = tracer.begin(Operation::Lookup { is_dir: false }, "/data/x/d", None);
        scope.set_op(Operation::Lookup { is_dir: true });
        let _ = scope.finish(Ok(()));

        let record = rx.try_recv().unwrap();
        assert_eq!(Operation::Lookup { is_dir: true }, record.op);
        assert_eq!(Outcome::Ok, record.outcome);
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let (tracer, mut rx) = TraceEmitter::channel(2);

        for _ in 0..5 {
            let _ = tracer
                .begin(Operation::Getattr, "/data/x", None)
                .finish(Ok(()));
        }

        assert_eq!(3, tracer.dropped());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_queue_drops() {
        let (tracer, rx) = TraceEmitter::channel(2);
        drop(rx);

        let _ = tracer.begin(Operation::Getattr, "/data/x", None).finish(Ok(()));

        assert_eq!(1, tracer.dropped());
    }

    #[test]
    fn disabled_discards() {
        let tracer = TraceEmitter::disabled();

        let _ = tracer.begin(Operation::Getattr, "/data/x", None).finish(Ok(()));

        assert_eq!(0, tracer.dropped());
    }
}
