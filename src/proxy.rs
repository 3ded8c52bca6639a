// Copyright (C) myl7
// SPDX-License-Identifier: Apache-2.0

//! Thread-safe proxy rotator: a cursor over a proxy list with
//! threshold-based advancement and cooldown back to the main endpoint
//! (spec.md §4.4).

use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use reqwest::Url;

struct State {
    list: Vec<String>,
    current: usize,
    /// Index of the last non-direct (non-zero) cursor position, used to
    /// resume the same proxy after a cooldown round-trip.
    last: usize,
    requests: u64,
    last_cooldown: Instant,
}

pub struct ProxyRotator {
    enabled: bool,
    main_threshold: u64,
    proxy_threshold: u64,
    cooldown: Duration,
    state: Mutex<State>,
}

impl ProxyRotator {
    pub fn new(list: Vec<String>, main_threshold: u64, proxy_threshold: u64, cooldown: Duration) -> Self {
        let mut full = vec![String::new()];
        full.extend(list);
        Self {
            enabled: true,
            main_threshold,
            proxy_threshold,
            cooldown,
            state: Mutex::new(State {
                list: full,
                current: 0,
                last: 0,
                requests: 0,
                last_cooldown: Instant::now(),
            }),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            main_threshold: 0,
            proxy_threshold: 0,
            cooldown: Duration::ZERO,
            state: Mutex::new(State {
                list: vec![String::new()],
                current: 0,
                last: 0,
                requests: 0,
                last_cooldown: Instant::now(),
            }),
        }
    }

    fn threshold_for(&self, idx: usize) -> u64 {
        if idx == 0 {
            self.main_threshold
        } else {
            self.proxy_threshold
        }
    }

    /// Return the current entry, then advance by one modulo length and
    /// reset `requests` to 0.
    pub fn next(&self) -> String {
        if !self.enabled {
            return String::new();
        }
        let mut st = self.state.lock().unwrap();
        let ret = st.list[st.current].clone();
        let len = st.list.len();
        st.current = (st.current + 1) % len;
        st.requests = 0;
        ret
    }

    /// Increment `requests`; advance once it exceeds the threshold for the
    /// current index, resetting `requests` to 1; return the (possibly just
    /// advanced) current entry.
    pub fn round(&self) -> String {
        if !self.enabled {
            return String::new();
        }
        let mut st = self.state.lock().unwrap();
        st.requests += 1;
        if st.requests > self.threshold_for(st.current) {
            let len = st.list.len();
            st.current = (st.current + 1) % len;
            st.requests = 1;
        }
        st.list[st.current].clone()
    }

    /// Like [`Self::round`], except the advance off index 0 resumes `last`
    /// (the previously visited proxy) instead of always stepping to index
    /// 1. The advance is still gated on the request threshold; once it
    /// fires, a separate cooldown timer can additionally snap the cursor
    /// straight back to index 0 for that same advance, so the main endpoint
    /// keeps carrying the bulk of traffic while proxies absorb overflow
    /// bursts.
    pub fn cooldown(&self) -> String {
        if !self.enabled {
            return String::new();
        }
        let mut st = self.state.lock().unwrap();
        st.requests += 1;
        let len = st.list.len();

        if st.requests > self.threshold_for(st.current) {
            st.requests = 1;

            if st.last == 0 {
                st.current = (st.current + 1) % len;
                if st.current == 0 {
                    st.current = (st.current + 1) % len;
                }
            } else {
                st.current = st.last;
                st.last = 0;
            }

            if st.last_cooldown.elapsed() >= self.cooldown {
                st.last_cooldown = Instant::now();
                st.last = st.current;
                st.current = 0;
            }
        }

        st.list[st.current].clone()
    }

    /// Return the active entry without mutating any state.
    pub fn current(&self) -> String {
        if !self.enabled {
            return String::new();
        }
        let st = self.state.lock().unwrap();
        st.list[st.current].clone()
    }

    /// Reset the list to `[""]` (direct only).
    pub fn clear(&self) {
        let mut st = self.state.lock().unwrap();
        st.list = vec![String::new()];
        st.current = 0;
        st.last = 0;
        st.requests = 0;
    }

    /// Normalize raw proxy lines: trim whitespace, drop empties, prepend
    /// `http://` when schemeless, reject ill-formed URIs.
    pub fn prepare(lines: &[String]) -> Result<Vec<String>> {
        lines
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| {
                let with_scheme = if s.contains("://") {
                    s.to_owned()
                } else {
                    format!("http://{s}")
                };
                Url::parse(&with_scheme).map_err(|e| anyhow!("invalid proxy uri {s:?}: {e}"))?;
                Ok(with_scheme)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_rotates_and_resets() {
        let r = ProxyRotator::new(vec!["a".into(), "b".into()], 10, 3, Duration::from_secs(60));
        assert_eq!(r.next(), "");
        assert_eq!(r.next(), "a");
        assert_eq!(r.next(), "b");
        assert_eq!(r.next(), "");
    }

    #[test]
    fn test_round_thresholds_main_10_proxy_3() {
        let r = ProxyRotator::new(
            vec!["A".into(), "B".into(), "C".into()],
            10,
            3,
            Duration::from_secs(3600),
        );
        for _ in 0..10 {
            assert_eq!(r.round(), "");
        }
        for _ in 0..3 {
            assert_eq!(r.round(), "A");
        }
        for _ in 0..3 {
            assert_eq!(r.round(), "B");
        }
        for _ in 0..3 {
            assert_eq!(r.round(), "C");
        }
        assert_eq!(r.round(), "");
    }

    #[test]
    fn test_disabled_returns_empty() {
        let r = ProxyRotator::disabled();
        assert_eq!(r.next(), "");
        assert_eq!(r.round(), "");
        assert_eq!(r.cooldown(), "");
        assert_eq!(r.current(), "");
    }

    #[test]
    fn test_prepare_normalizes() {
        let out = ProxyRotator::prepare(&[
            "  proxy.example.com:8080  ".to_owned(),
            "".to_owned(),
            "https://p2.example.com".to_owned(),
        ])
        .unwrap();
        assert_eq!(out, vec!["http://proxy.example.com:8080", "https://p2.example.com"]);
    }

    #[test]
    fn test_prepare_rejects_ill_formed() {
        assert!(ProxyRotator::prepare(&["http://[::1".to_owned()]).is_err());
    }

    #[test]
    fn test_clear_resets_to_direct_only() {
        let r = ProxyRotator::new(vec!["a".into()], 1, 1, Duration::from_secs(1));
        r.clear();
        assert_eq!(r.current(), "");
        assert_eq!(r.next(), "");
        assert_eq!(r.next(), "");
    }

    #[test]
    fn test_cooldown_returns_to_main_after_elapsed() {
        let r = ProxyRotator::new(vec!["A".into()], 1, 1, Duration::from_millis(10));
        assert_eq!(r.cooldown(), "");
        assert_eq!(r.cooldown(), "A");
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(r.cooldown(), "");
    }

    #[test]
    fn test_cooldown_does_not_reset_before_threshold_exceeded() {
        let r = ProxyRotator::new(vec!["A".into(), "B".into()], 5, 5, Duration::from_millis(1));
        assert_eq!(r.cooldown(), "");
        std::thread::sleep(Duration::from_millis(5));
        // Cooldown duration has elapsed, but the main index hasn't yet used
        // up its request threshold, so the cursor must stay at index 0.
        for _ in 0..3 {
            assert_eq!(r.cooldown(), "");
        }
    }
}
