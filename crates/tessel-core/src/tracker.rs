//! Deferred reference operations owned by the running task

use std::fmt;

type DeferredOp = Box<dyn FnOnce() + Send>;

/// A batch of reference operations applied when the tracker is dropped
///
/// Installed on a task frame for the length of a runtime call or task. It
/// must never sit in the frame slot across a blocking wait.
#[derive(Default)]
pub struct ReferenceTracker {
    deferred: Vec<DeferredOp>,
}

impl ReferenceTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an operation to run at flush
    pub fn defer<F>(&mut self, op: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.deferred.push(Box::new(op));
    }

    /// Number of queued operations
    pub fn len(&self) -> usize {
        self.deferred.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.deferred.is_empty()
    }

    /// Run every queued operation in submission order
    pub fn flush(&mut self) {
        let ops = std::mem::take(&mut self.deferred);
        if !ops.is_empty() {
            tracing::trace!(count = ops.len(), "flushing deferred references");
        }
        for op in ops {
            op();
        }
    }
}

impl Drop for ReferenceTracker {
    fn drop(&mut self) {
        self.flush();
    }
}

impl fmt::Debug for ReferenceTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceTracker")
            .field("deferred", &self.deferred.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_flush_runs_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut tracker = ReferenceTracker::new();
        for i in 0..3 {
            let log = log.clone();
            tracker.defer(move || log.lock().unwrap().push(i));
        }
        assert_eq!(tracker.len(), 3);
        tracker.flush();
        assert!(tracker.is_empty());
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_drop_flushes() {
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let mut tracker = ReferenceTracker::new();
            let hits = hits.clone();
            tracker.defer(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
