// Copyright (C) myl7
// SPDX-License-Identifier: Apache-2.0

//! Process-wide session options: transport selection, timeout, cache-bypass
//! flag (spec.md §4.10).

use std::sync::RwLock;
use std::time::Duration;

/// `curl` startup cost exceeds its per-request win once more than this many
/// requests are pending; above the threshold, `SetTransport` silently
/// downgrades `curl` requests to `http`.
pub const CURL_FASTER_THRESHOLD: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Http,
    Curl,
    File,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Http => "http",
            Transport::Curl => "curl",
            Transport::File => "file",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub transport: Transport,
    pub timeout: Duration,
    pub is_cache_disable: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            transport: Transport::Http,
            timeout: Duration::from_secs(10),
            is_cache_disable: false,
        }
    }
}

/// A read-mostly, process-wide holder, mirroring the teacher's preference
/// for explicit dependency passing over hidden statics: callers own an
/// instance (typically one per composition root) rather than reaching for a
/// global.
#[derive(Default)]
pub struct SessionState {
    inner: RwLock<SessionOptions>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> SessionOptions {
        self.inner.read().unwrap().clone()
    }

    /// Lowercase `name`; accept `curl` only when `request_count` is at or
    /// below [`CURL_FASTER_THRESHOLD`]; accept `file` unconditionally;
    /// anything else (including an over-threshold `curl`) defaults to
    /// `http`.
    pub fn set_transport(&self, name: &str, request_count: u64) {
        let name = name.to_lowercase();
        let transport = match name.as_str() {
            "curl" if request_count <= CURL_FASTER_THRESHOLD => Transport::Curl,
            "file" => Transport::File,
            _ => Transport::Http,
        };
        self.inner.write().unwrap().transport = transport;
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.write().unwrap().timeout = timeout;
    }

    pub fn set_cache_disable(&self, disable: bool) {
        self.inner.write().unwrap().is_cache_disable = disable;
    }

    /// The duration formatted as seconds with two decimals, `.` replaced by
    /// `,`, with a trailing `,00` dropped — the argument form the `curl`
    /// backend expects (`-m <secs>`).
    pub fn timeout_string(&self) -> String {
        let secs = self.inner.read().unwrap().timeout.as_secs_f64();
        let formatted = format!("{secs:.2}").replace('.', ",");
        formatted.strip_suffix(",00").map(str::to_owned).unwrap_or(formatted)
    }
}
