//! Stream Inactivity Watchdog
//!
//! Tracks when the active stream last delivered a frame. Once the silence
//! exceeds the configured timeout the connection is considered dead.

use std::time::{Duration, Instant};

/// Default silence allowed on a streaming link
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct StallMonitor {
    timeout: Duration,
    last_received: Option<Instant>,
}

impl StallMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_received: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Restart the silence window, on connect or on every received frame
    pub fn reset(&mut self, now: Instant) {
        self.last_received = Some(now);
    }

    pub fn disarm(&mut self) {
        self.last_received = None;
    }

    pub fn elapsed(&self, now: Instant) -> Option<Duration> {
        self.last_received
            .map(|last| now.saturating_duration_since(last))
    }

    /// True once the silence strictly exceeds the timeout
    pub fn is_stalled(&self, now: Instant) -> bool {
        self.elapsed(now).is_some_and(|elapsed| elapsed > self.timeout)
    }
}

impl Default for StallMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_INACTIVITY_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disarmed_never_stalls() {
        let monitor = StallMonitor::default();
        assert!(!monitor.is_stalled(Instant::now() + Duration::from_secs(3600)));
    }

    #[test]
    fn test_stall_after_timeout() {
        let start = Instant::now();
        let mut monitor = StallMonitor::new(Duration::from_secs(5));
        monitor.reset(start);

        assert!(!monitor.is_stalled(start + Duration::from_secs(5)));
        assert!(monitor.is_stalled(start + Duration::from_millis(5001)));
    }

    #[test]
    fn test_reset_extends_window() {
        let start = Instant::now();
        let mut monitor = StallMonitor::new(Duration::from_secs(5));
        monitor.reset(start);
        monitor.reset(start + Duration::from_secs(4));

        assert!(!monitor.is_stalled(start + Duration::from_secs(8)));
        assert_eq!(
            monitor.elapsed(start + Duration::from_secs(8)),
            Some(Duration::from_secs(4))
        );
    }
}
