//! Receive history
//!
//! Bounded, newest-first buffer of decoded frames used for display and
//! selection. Readers always get an independent copy, so they never observe
//! the history changing under them.

use crate::types::DecodedFrame;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Default number of frames kept
pub const DEFAULT_HISTORY_CAPACITY: usize = 2000;

/// Bounded most-recent-first frame history
pub struct RxHistory {
    entries: Mutex<VecDeque<DecodedFrame>>,
    capacity: usize,
}

impl RxHistory {
    /// Create a history holding at most `capacity` frames (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Insert at the front, evicting the oldest entry when full
    pub fn append(&self, frame: DecodedFrame) {
        let mut entries = self.entries.lock();
        entries.push_front(frame);
        if entries.len() > self.capacity {
            entries.pop_back();
        }
    }

    /// Independent copy of the current contents, newest first
    pub fn snapshot(&self) -> Vec<DecodedFrame> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Entry at `index` (0 = newest)
    pub fn get(&self, index: usize) -> Option<DecodedFrame> {
        self.entries.lock().get(index).cloned()
    }

    pub fn latest(&self) -> Option<DecodedFrame> {
        self.get(0)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for RxHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
