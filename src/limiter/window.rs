use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Sliding-window log of call timestamps (epoch milliseconds).
///
/// Appends are monotone under one clock, but loaded snapshots and manual
/// clocks may not be, so pruning filters the whole log and the oldest entry
/// is found with `min` rather than read off the front.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowLog {
    stamps: VecDeque<u64>,
}

impl WindowLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep only timestamps strictly newer than `cutoff_ms`.
    pub fn prune(&mut self, cutoff_ms: u64) {
        self.stamps.retain(|ts| *ts > cutoff_ms);
    }

    /// Record a call at `now_ms`.
    pub fn push(&mut self, now_ms: u64) {
        self.stamps.push_back(now_ms);
    }

    /// Number of retained timestamps, including any not yet pruned.
    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }

    /// Earliest retained timestamp.
    pub fn oldest(&self) -> Option<u64> {
        self.stamps.iter().copied().min()
    }

    /// Number of timestamps newer than `cutoff_ms`, without pruning.
    pub fn count_since(&self, cutoff_ms: u64) -> usize {
        self.stamps.iter().filter(|ts| **ts > cutoff_ms).count()
    }

    /// Earliest timestamp strictly after `cutoff_ms`.
    pub fn oldest_since(&self, cutoff_ms: u64) -> Option<u64> {
        self.stamps.iter().copied().filter(|ts| *ts > cutoff_ms).min()
    }

    pub fn iter(&self) -> impl Iterator<Item = &u64> {
        self.stamps.iter()
    }
}

impl FromIterator<u64> for WindowLog {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        Self { stamps: iter.into_iter().collect() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prune_keeps_strictly_newer() {
        let mut log: WindowLog = [10, 20, 30].into_iter().collect();
        log.prune(20);
        assert_eq!(log.iter().copied().collect::<Vec<_>>(), vec![30]);
    }

    #[test]
    fn oldest_tolerates_out_of_order_input() {
        let log: WindowLog = [50, 10, 30].into_iter().collect();
        assert_eq!(log.oldest(), Some(10));
        assert_eq!(log.oldest_since(10), Some(30));
        assert_eq!(log.count_since(10), 2);
    }

    #[test]
    fn serializes_as_plain_array() {
        let log: WindowLog = [1, 2].into_iter().collect();
        assert_eq!(serde_json::to_string(&log).unwrap(), "[1,2]");
        let back: WindowLog = serde_json::from_str("[3]").unwrap();
        assert_eq!(back.oldest(), Some(3));
    }
}
