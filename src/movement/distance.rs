//! Sliding window of executed displacement for one mobile

use std::collections::VecDeque;

/// Tolerance for float accumulation when comparing against the limit
const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone)]
pub struct DistanceWindow {
    /// `(executed_at, tiles)`, oldest first
    entries: VecDeque<(u64, f64)>,
    window_ms: u64,
    limit_tiles: f64,
}

impl DistanceWindow {
    pub fn new(window_ms: u64, limit_tiles: f64) -> Self {
        Self {
            entries: VecDeque::new(),
            window_ms,
            limit_tiles,
        }
    }

    /// Drop entries that no longer fall inside `(now - window, now]`
    fn expire(&mut self, now: u64) {
        while let Some(&(at, _)) = self.entries.front() {
            if at + self.window_ms <= now {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Displacement currently inside the window
    pub fn total(&mut self, now: u64) -> f64 {
        self.expire(now);
        self.entries.iter().map(|(_, tiles)| tiles).sum()
    }

    /// Whether `tiles` more on top of the window at `now` stays within the limit
    pub fn admits(&mut self, now: u64, tiles: f64) -> bool {
        self.total(now) + tiles <= self.limit_tiles + EPSILON
    }

    pub fn record(&mut self, now: u64, tiles: f64) {
        self.entries.push_back((now, tiles));
    }

    /// Forget all history, e.g. after a teleport
    pub fn reset(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_reached_within_window() {
        let mut window = DistanceWindow::new(1000, 3.0);
        for t in [0, 100, 200] {
            assert!(window.admits(t, 1.0));
            window.record(t, 1.0);
        }
        assert!(!window.admits(300, 1.0));
        assert!((window.total(300) - 3.0).abs() < EPSILON);
    }

    #[test]
    fn test_window_slides_past_oldest_entry() {
        let mut window = DistanceWindow::new(1000, 2.0);
        window.record(0, 1.0);
        window.record(500, 1.0);
        assert!(!window.admits(999, 1.0));
        assert!(window.admits(1000, 1.0));
    }

    #[test]
    fn test_reset_clears_history() {
        let mut window = DistanceWindow::new(1000, 1.0);
        window.record(0, 1.0);
        assert!(!window.admits(10, 1.0));
        window.reset();
        assert!(window.admits(10, 1.0));
    }
}
