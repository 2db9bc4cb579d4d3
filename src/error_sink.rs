// Bounded, append-only log of link failures
//
// Every failed DriveLink call (commands and telemetry polls alike) ends up
// here. Subscribers are notified after the log lock is released, so a
// callback may read the log back without deadlocking.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::warn;

use crate::config::ERROR_LOG_CAPACITY;
use crate::error::ErrorRecord;

pub type ErrorCallback = Arc<dyn Fn(&ErrorRecord) + Send + Sync>;

struct ErrorLog {
    records: VecDeque<ErrorRecord>,
    capacity: usize,
    latest: Option<ErrorRecord>,
    dropped: u64,
}

/// Shared error log; clones append to the same log
#[derive(Clone)]
pub struct ErrorSink {
    log: Arc<Mutex<ErrorLog>>,
    subscribers: Arc<RwLock<Vec<ErrorCallback>>>,
}

impl Default for ErrorSink {
    fn default() -> Self {
        Self::new(ERROR_LOG_CAPACITY)
    }
}

impl ErrorSink {
    /// Log keeping at most `capacity` records (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            log: Arc::new(Mutex::new(ErrorLog {
                records: VecDeque::with_capacity(capacity.min(ERROR_LOG_CAPACITY)),
                capacity,
                latest: None,
                dropped: 0,
            })),
            subscribers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Append a record, evicting the oldest one when full
    pub fn push(&self, record: ErrorRecord) {
        warn!("Drive error 0x{:04X}: {}", record.code, record.message);
        {
            let mut log = self.log.lock();
            if log.records.len() == log.capacity {
                log.records.pop_front();
                log.dropped += 1;
            }
            log.records.push_back(record.clone());
            log.latest = Some(record.clone());
        }

        // Snapshot so a callback may subscribe without deadlocking
        let subscribers = self.subscribers.read().clone();
        for callback in subscribers {
            callback(&record);
        }
    }

    /// Most recent record, kept even after it was evicted from the log
    pub fn latest(&self) -> Option<ErrorRecord> {
        self.log.lock().latest.clone()
    }

    /// Records in arrival order
    pub fn records(&self) -> Vec<ErrorRecord> {
        self.log.lock().records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.log.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.lock().records.is_empty()
    }

    /// Number of records evicted because the log was full
    pub fn dropped(&self) -> u64 {
        self.log.lock().dropped
    }

    pub fn capacity(&self) -> usize {
        self.log.lock().capacity
    }

    /// Call `callback` for every record pushed from now on
    pub fn subscribe(&self, callback: impl Fn(&ErrorRecord) + Send + Sync + 'static) {
        self.subscribers.write().push(Arc::new(callback));
    }
}

impl std::fmt::Debug for ErrorSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let log = self.log.lock();
        f.debug_struct("ErrorSink")
            .field("len", &log.records.len())
            .field("capacity", &log.capacity)
            .field("dropped", &log.dropped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_push_keeps_order_and_latest() {
        let sink = ErrorSink::new(8);
        sink.push(ErrorRecord::new(0x11, "port busy"));
        sink.push(ErrorRecord::new(0x91, "timeout"));

        let codes: Vec<i32> = sink.records().iter().map(|r| r.code).collect();
        assert_eq!(codes, vec![0x11, 0x91]);
        assert_eq!(sink.latest().map(|r| r.message), Some("timeout".to_string()));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let sink = ErrorSink::new(2);
        for code in 1..=5 {
            sink.push(ErrorRecord::new(code, "x"));
        }
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.dropped(), 3);
        let codes: Vec<i32> = sink.records().iter().map(|r| r.code).collect();
        assert_eq!(codes, vec![4, 5]);
        assert_eq!(sink.latest().map(|r| r.code), Some(5));
    }

    #[test]
    fn test_zero_capacity_still_keeps_latest() {
        let sink = ErrorSink::new(0);
        sink.push(ErrorRecord::new(1, "a"));
        sink.push(ErrorRecord::new(2, "b"));
        assert_eq!(sink.capacity(), 1);
        assert_eq!(sink.records().len(), 1);
        assert_eq!(sink.latest().map(|r| r.code), Some(2));
    }

    #[test]
    fn test_subscribers_notified() {
        let sink = ErrorSink::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        sink.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sink.push(ErrorRecord::new(1, "a"));
        sink.push(ErrorRecord::new(2, "b"));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_callback_can_read_log() {
        let sink = ErrorSink::default();
        let reader = sink.clone();
        let lens = Arc::new(Mutex::new(Vec::new()));
        let out = lens.clone();
        sink.subscribe(move |_| out.lock().push(reader.len()));

        sink.push(ErrorRecord::new(1, "a"));
        assert_eq!(*lens.lock(), vec![1]);
    }
}
