//! Server-side bound on in-flight movement commands

/// Counts commands accepted but not yet completed for one mobile
#[derive(Debug, Clone)]
pub struct QueueDepthTracker {
    depth: usize,
    limit: usize,
}

impl QueueDepthTracker {
    pub fn new(limit: usize) -> Self {
        Self { depth: 0, limit }
    }

    /// Take a slot if one is free
    pub fn try_reserve(&mut self) -> bool {
        if self.depth < self.limit {
            self.depth += 1;
            true
        } else {
            false
        }
    }

    /// Give back a slot, floored at zero
    pub fn release(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_up_to_limit() {
        let mut tracker = QueueDepthTracker::new(3);
        assert!(tracker.try_reserve());
        assert!(tracker.try_reserve());
        assert!(tracker.try_reserve());
        assert!(!tracker.try_reserve());
        assert_eq!(tracker.depth(), 3);
    }

    #[test]
    fn test_release_frees_a_slot() {
        let mut tracker = QueueDepthTracker::new(1);
        assert!(tracker.try_reserve());
        assert!(!tracker.try_reserve());
        tracker.release();
        assert_eq!(tracker.depth(), 0);
        assert!(tracker.try_reserve());
    }

    #[test]
    fn test_release_floors_at_zero() {
        let mut tracker = QueueDepthTracker::new(2);
        tracker.release();
        tracker.release();
        assert_eq!(tracker.depth(), 0);
    }
}
