//! Recent-message log replayed by `DUMP`
//!
//! Process-local ring buffer of the last N broadcasts. Nothing is persisted.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use crate::message::LoggedMessage;

#[derive(Debug)]
pub struct MessageLog {
    capacity: usize,
    entries: Mutex<VecDeque<LoggedMessage>>,
}

impl MessageLog {
    /// A capacity of 0 disables logging
    ///
    /// Storage grows with the log, up to `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Append, evicting the oldest entry when full
    pub fn record(&self, entry: LoggedMessage) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Oldest-first copy of the log
    pub fn recent(&self) -> Vec<LoggedMessage> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClientId;

    fn entry(n: u64) -> LoggedMessage {
        LoggedMessage {
            from_id: ClientId(n),
            from_name: format!("user{n}"),
            text: format!("message {n}"),
        }
    }

    #[test]
    fn test_keeps_last_entries() {
        let log = MessageLog::new(3);
        for n in 0..5 {
            log.record(entry(n));
        }
        let ids: Vec<_> = log.recent().iter().map(|e| e.from_id.0).collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[test]
    fn test_zero_capacity_disables() {
        let log = MessageLog::new(0);
        log.record(entry(1));
        assert!(log.recent().is_empty());
    }

    #[test]
    fn test_large_capacity_grows_lazily() {
        let log = MessageLog::new(usize::MAX);
        log.record(entry(7));
        assert_eq!(log.recent().len(), 1);
    }
}
