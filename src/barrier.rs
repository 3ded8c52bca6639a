// Copyright (C) myl7
// SPDX-License-Identifier: Apache-2.0

//! Per-key sliding-window rate barrier protecting the public HTTP endpoints
//! (spec.md §4.6). Not a strict rate limiter: a full window crossing resets
//! the count rather than sliding continuously.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Window {
    first_request: Instant,
    requests: u64,
}

#[derive(Default)]
pub struct Barrier {
    windows: Mutex<HashMap<String, Window>>,
}

impl Barrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit or reject a request under `key`. The first call in a window
    /// records `requests = 1`; later calls within `window` increment it and
    /// are rejected once `requests > limit`. Once `now` has moved past
    /// `first_request + window`, the entry is dropped and the current call
    /// is admitted as if it were the first.
    pub fn admit(&self, key: &str, limit: u64, window: Duration) -> bool {
        let mut windows = self.windows.lock().unwrap();
        let now = Instant::now();
        match windows.get_mut(key) {
            Some(w) if now > w.first_request + window => {
                windows.insert(
                    key.to_owned(),
                    Window {
                        first_request: now,
                        requests: 1,
                    },
                );
                true
            }
            Some(w) => {
                w.requests += 1;
                w.requests <= limit
            }
            None => {
                windows.insert(
                    key.to_owned(),
                    Window {
                        first_request: now,
                        requests: 1,
                    },
                );
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admits_exactly_limit_then_rejects() {
        let b = Barrier::new();
        let window = Duration::from_secs(60);
        for _ in 0..5 {
            assert!(b.admit("info", 5, window));
        }
        assert!(!b.admit("info", 5, window));
    }

    #[test]
    fn test_resets_on_window_cross() {
        let b = Barrier::new();
        let window = Duration::from_millis(10);
        for _ in 0..2 {
            assert!(b.admit("msgs", 2, window));
        }
        assert!(!b.admit("msgs", 2, window));
        std::thread::sleep(Duration::from_millis(20));
        assert!(b.admit("msgs", 2, window));
    }

    #[test]
    fn test_independent_keys() {
        let b = Barrier::new();
        let window = Duration::from_secs(60);
        assert!(b.admit("info", 1, window));
        assert!(!b.admit("info", 1, window));
        assert!(b.admit("msgs", 1, window));
    }
}
