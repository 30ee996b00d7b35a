//! Log throttling for per-frame protocol violations
//!
//! A client that keeps sending malformed frames on a data channel would
//! otherwise produce one error line per frame. The throttler lets the first
//! occurrence through, swallows repeats within the interval and reports how
//! many were swallowed the next time a line is allowed.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct Entry {
    last_logged: Instant,
    suppressed: u64,
}

/// Keyed, interval based log limiter
pub struct LogThrottler {
    entries: Mutex<HashMap<String, Entry>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Decide whether a message under `key` should be emitted now.
    ///
    /// Returns `Some(n)` when the caller should log, where `n` is the number
    /// of messages suppressed since the previous emitted one, and `None`
    /// when the message should be dropped.
    pub fn should_log(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last_logged) < self.interval => {
                entry.suppressed += 1;
                None
            }
            Some(entry) => {
                let suppressed = entry.suppressed;
                entry.last_logged = now;
                entry.suppressed = 0;
                Some(suppressed)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    /// Forget `key`, so the next message under it is logged immediately
    pub fn clear(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Log a warning through a [`LogThrottler`], appending the suppressed count
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.should_log($key) {
            if suppressed > 0 {
                tracing::warn!("{} ({} similar messages suppressed)", format_args!($($arg)*), suppressed);
            } else {
                tracing::warn!($($arg)*);
            }
        }
    };
}

/// Log an error through a [`LogThrottler`], appending the suppressed count
#[macro_export]
macro_rules! error_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.should_log($key) {
            if suppressed > 0 {
                tracing::error!("{} ({} similar messages suppressed)", format_args!($($arg)*), suppressed);
            } else {
                tracing::error!($($arg)*);
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_first_message_logged() {
        let throttler = LogThrottler::with_secs(1);
        assert_eq!(throttler.should_log("input-channel"), Some(0));
    }

    #[test]
    fn test_repeats_suppressed_and_counted() {
        let throttler = LogThrottler::new(Duration::from_millis(100));

        assert_eq!(throttler.should_log("input-channel"), Some(0));
        assert_eq!(throttler.should_log("input-channel"), None);
        assert_eq!(throttler.should_log("input-channel"), None);

        thread::sleep(Duration::from_millis(150));

        assert_eq!(throttler.should_log("input-channel"), Some(2));
        assert_eq!(throttler.should_log("input-channel"), None);
    }

    #[test]
    fn test_keys_are_independent() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("input-channel").is_some());
        assert!(throttler.should_log("device-control").is_some());
        assert!(throttler.should_log("input-channel").is_none());
        assert_eq!(throttler.len(), 2);
    }

    #[test]
    fn test_clear() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("camera-data-channel").is_some());
        assert!(throttler.should_log("camera-data-channel").is_none());

        throttler.clear("camera-data-channel");
        assert!(throttler.is_empty());
        assert_eq!(throttler.should_log("camera-data-channel"), Some(0));
    }
}
