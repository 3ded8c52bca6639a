// Copyright (C) myl7
// SPDX-License-Identifier: Apache-2.0

//! The JSON response envelope (spec.md §4.9): `{ ok, code, status, data,
//! error?, errors?, time? }`. `error`/`errors`/`time` carry typed siblings
//! (`anyhow::Error`/`Duration`, which do not serialize directly) alongside
//! the string forms actually placed on the wire.

use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct Response<T: Serialize> {
    pub ok: bool,
    pub code: u16,
    pub status: String,
    pub data: Vec<T>,
    #[serde(rename = "error", skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    #[serde(rename = "errors", skip_serializing_if = "Vec::is_empty")]
    pub errors_msg: Vec<String>,
    #[serde(rename = "time", skip_serializing_if = "Option::is_none")]
    pub time_msg: Option<String>,
    #[serde(skip)]
    pub error: Option<anyhow::Error>,
    #[serde(skip)]
    pub errors: Vec<anyhow::Error>,
    #[serde(skip)]
    pub time: Option<Duration>,
}

fn reason_phrase(code: u16) -> &'static str {
    match code {
        200 => "OK",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

impl<T: Serialize> Response<T> {
    /// `ok = count>0`; `code` is 200 when at least one channel resolved,
    /// else 404; `status` is the standard reason phrase for that code.
    pub fn new(data: Vec<T>, count: usize, errs: Vec<anyhow::Error>, elapsed: Duration) -> Self {
        let code = if count > 0 { 200 } else { 404 };
        let mut resp = Self {
            ok: count > 0,
            code,
            status: reason_phrase(code).to_owned(),
            data,
            error_msg: None,
            errors_msg: Vec::new(),
            time_msg: None,
            error: None,
            errors: errs,
            time: Some(elapsed),
        };
        resp.to_strings();
        resp
    }

    /// Stringify `errors`/`time` (and `error`, if set) into their `...Msg`
    /// siblings, in preparation for JSON encoding.
    pub fn to_strings(&mut self) {
        self.error_msg = self.error.as_ref().map(|e| e.to_string());
        self.errors_msg = self.errors.iter().map(|e| e.to_string()).collect();
        self.time_msg = self.time.map(|d| format!("{:.3}s", d.as_secs_f64()));
    }

    /// Invert [`Self::to_strings`] after decoding a `Response` from JSON:
    /// reconstruct the typed `error`/`errors`/`time` fields from their
    /// string siblings.
    pub fn to_values(&mut self) {
        self.error = self.error_msg.as_deref().map(|s| anyhow::anyhow!(s.to_owned()));
        self.errors = self
            .errors_msg
            .iter()
            .map(|s| anyhow::anyhow!(s.to_owned()))
            .collect();
        self.time = self.time_msg.as_deref().and_then(|s| {
            s.strip_suffix('s')
                .and_then(|secs| secs.parse::<f64>().ok())
                .map(Duration::from_secs_f64)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_ok_when_data_present() {
        let resp = Response::new(vec!["a"], 1, vec![], Duration::from_millis(250));
        assert!(resp.ok);
        assert_eq!(resp.code, 200);
        assert_eq!(resp.status, "OK");
        assert_eq!(resp.time_msg.as_deref(), Some("0.250s"));
    }

    #[test]
    fn test_new_404_when_empty() {
        let resp: Response<&str> = Response::new(vec![], 0, vec![anyhow::anyhow!("boom")], Duration::ZERO);
        assert!(!resp.ok);
        assert_eq!(resp.code, 404);
        assert_eq!(resp.errors_msg, vec!["boom".to_owned()]);
    }

    #[test]
    fn test_to_values_roundtrips_time() {
        let mut resp = Response::new(vec!["a"], 1, vec![], Duration::from_secs(2));
        resp.to_values();
        assert_eq!(resp.time, Some(Duration::from_secs(2)));
    }
}
