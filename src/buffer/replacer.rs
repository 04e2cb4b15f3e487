//! LRU-K replacement policy.
//!
//! Each frame carries a bounded history of its last K access
//! timestamps from a logical clock. The eviction victim is the
//! evictable frame with the largest backward-K distance: frames with
//! fewer than K recorded accesses rank first (infinite distance, ties
//! broken by earliest first access), followed by frames ordered by
//! their K-th most recent access, oldest first.

use std::collections::{HashMap, VecDeque};

use crate::types::FrameId;

struct FrameAccess {
    /// Up to the last K access timestamps, oldest first
    history: VecDeque<u64>,
    evictable: bool,
}

/// Picks eviction victims by backward-K distance
pub struct LruKReplacer {
    k: usize,
    clock: u64,
    frames: HashMap<FrameId, FrameAccess>,
}

impl LruKReplacer {
    /// Create a replacer for a pool of `num_frames` frames
    pub fn new(num_frames: usize, k: usize) -> Self {
        assert!(k >= 1, "replacer K must be at least 1");
        Self {
            k,
            clock: 0,
            frames: HashMap::with_capacity(num_frames),
        }
    }

    /// Record an access to a frame at the current logical time
    pub fn record_access(&mut self, frame_id: FrameId) {
        self.clock += 1;
        let entry = self.frames.entry(frame_id).or_insert_with(|| FrameAccess {
            history: VecDeque::with_capacity(self.k),
            evictable: false,
        });
        entry.history.push_back(self.clock);
        if entry.history.len() > self.k {
            entry.history.pop_front();
        }
    }

    /// Mark a frame evictable or pinned-equivalent
    pub fn set_evictable(&mut self, frame_id: FrameId, evictable: bool) {
        if let Some(entry) = self.frames.get_mut(&frame_id) {
            entry.evictable = evictable;
        }
    }

    /// Pick and remove the victim frame, if any frame is evictable
    pub fn evict(&mut self) -> Option<FrameId> {
        // With history capped at K entries, the front timestamp is the
        // first access for young frames and the K-th most recent access
        // otherwise, so one (class, front) key orders both classes.
        let victim = self
            .frames
            .iter()
            .filter(|(_, access)| access.evictable)
            .min_by_key(|(_, access)| {
                (access.history.len() >= self.k, *access.history.front().unwrap_or(&0))
            })
            .map(|(&frame_id, _)| frame_id)?;
        self.frames.remove(&victim);
        Some(victim)
    }

    /// Forget a frame entirely, evictable or not
    pub fn remove(&mut self, frame_id: FrameId) {
        self.frames.remove(&frame_id);
    }

    /// Number of evictable frames
    pub fn size(&self) -> usize {
        self.frames.values().filter(|a| a.evictable).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(k: usize) -> LruKReplacer {
        LruKReplacer::new(8, k)
    }

    #[test]
    fn test_young_frames_evict_before_mature_ones() {
        let mut replacer = make(2);

        // Frame 0 gets two accesses, frame 1 only one.
        replacer.record_access(0);
        replacer.record_access(0);
        replacer.record_access(1);
        replacer.set_evictable(0, true);
        replacer.set_evictable(1, true);

        // Frame 1 has infinite backward-K distance and goes first even
        // though frame 0 was touched earlier.
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(0));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_young_frames_order_by_first_access() {
        let mut replacer = make(3);
        replacer.record_access(5);
        replacer.record_access(6);
        replacer.record_access(5);
        replacer.set_evictable(5, true);
        replacer.set_evictable(6, true);

        // Both are below K accesses; 5 was seen first.
        assert_eq!(replacer.evict(), Some(5));
        assert_eq!(replacer.evict(), Some(6));
    }

    #[test]
    fn test_mature_frames_order_by_kth_recent_access() {
        let mut replacer = make(2);
        // Access pattern: 0, 1, 0, 1, 0 -> frame 0's 2nd-most-recent
        // access (t=3) is newer than frame 1's (t=2).
        replacer.record_access(0);
        replacer.record_access(1);
        replacer.record_access(0);
        replacer.record_access(1);
        replacer.record_access(0);
        replacer.set_evictable(0, true);
        replacer.set_evictable(1, true);

        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(0));
    }

    #[test]
    fn test_pinned_frames_are_skipped() {
        let mut replacer = make(2);
        replacer.record_access(0);
        replacer.record_access(1);
        replacer.set_evictable(0, false);
        replacer.set_evictable(1, true);

        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), None);

        replacer.set_evictable(0, true);
        assert_eq!(replacer.evict(), Some(0));
    }

    #[test]
    fn test_remove_discards_history() {
        let mut replacer = make(2);
        replacer.record_access(3);
        replacer.set_evictable(3, true);
        replacer.remove(3);

        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);

        // A later access starts a fresh history.
        replacer.record_access(3);
        replacer.set_evictable(3, true);
        assert_eq!(replacer.evict(), Some(3));
    }
}
