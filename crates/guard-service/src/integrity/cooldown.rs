//! Per-path debounce gate.
//!
//! A single logical change (editor save, truncate + write, rename over) fires
//! several notifications. The first one for a path opens the gate and starts
//! the window; everything else for that path inside the window is dropped.
//! Modify and delete notifications share the same window.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct CooldownTracker {
    window: Duration,
    last_passed: Mutex<HashMap<PathBuf, Instant>>,
}

impl CooldownTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_passed: Mutex::new(HashMap::new()),
        }
    }

    /// `true` when the notification should be processed.
    pub fn gate_event(&self, path: &Path) -> bool {
        self.gate_event_at(path, Instant::now())
    }

    pub fn gate_event_at(&self, path: &Path, now: Instant) -> bool {
        let mut last_passed = self.last_passed.lock();
        if let Some(last) = last_passed.get(path) {
            if now.saturating_duration_since(*last) < self.window {
                return false;
            }
        }
        last_passed.insert(path.to_path_buf(), now);
        true
    }

    /// Drop the window for one path, e.g. once it is no longer protected.
    pub fn forget(&self, path: &Path) {
        self.last_passed.lock().remove(path);
    }

    /// Drop every entry whose window has already elapsed.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let mut last_passed = self.last_passed.lock();
        let before = last_passed.len();
        last_passed.retain(|_, last| now.saturating_duration_since(*last) < self.window);
        before - last_passed.len()
    }

    pub fn tracked(&self) -> usize {
        self.last_passed.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_passes_rest_suppressed_within_window() {
        let tracker = CooldownTracker::new(Duration::from_secs(5));
        let path = Path::new("/srv/a.txt");
        let t0 = Instant::now();

        assert!(tracker.gate_event_at(path, t0));
        assert!(!tracker.gate_event_at(path, t0 + Duration::from_millis(10)));
        assert!(!tracker.gate_event_at(path, t0 + Duration::from_millis(4_999)));
        assert!(tracker.gate_event_at(path, t0 + Duration::from_secs(5)));
    }

    #[test]
    fn suppressed_events_do_not_extend_window() {
        let tracker = CooldownTracker::new(Duration::from_secs(5));
        let path = Path::new("/srv/a.txt");
        let t0 = Instant::now();

        assert!(tracker.gate_event_at(path, t0));
        assert!(!tracker.gate_event_at(path, t0 + Duration::from_secs(4)));
        assert!(tracker.gate_event_at(path, t0 + Duration::from_secs(6)));
    }

    #[test]
    fn paths_are_independent() {
        let tracker = CooldownTracker::new(Duration::from_secs(5));
        let t0 = Instant::now();
        assert!(tracker.gate_event_at(Path::new("/a"), t0));
        assert!(tracker.gate_event_at(Path::new("/b"), t0));
        assert_eq!(tracker.tracked(), 2);

        tracker.forget(Path::new("/a"));
        assert!(tracker.gate_event_at(Path::new("/a"), t0));
    }

    #[test]
    fn prune_drops_elapsed_windows() {
        let tracker = CooldownTracker::new(Duration::from_millis(1));
        tracker.gate_event(Path::new("/a"));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(tracker.prune_expired(), 1);
        assert_eq!(tracker.tracked(), 0);
    }
}
