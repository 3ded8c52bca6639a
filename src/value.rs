// Copyright (C) myl7
// SPDX-License-Identifier: Apache-2.0

//! A count that remembers whether it was exact or approximate ("1.2K"-style
//! Telegram counters), and preserves the human-readable short form.

use std::fmt;

use anyhow::{anyhow, Result};
use serde::Serialize;

/// Parse a number possibly containing whitespace separators, a decimal
/// point or comma, and a trailing `K`/`k` (x1000) or `M`/`m` (x1_000_000).
/// Non-digit/non-separator characters are skipped. Negative values clamp to
/// 0. Errors only when no digits are found.
pub fn positive_number(s: &str) -> Result<u64> {
    let n = number(s)?;
    Ok(n.max(0) as u64)
}

/// Same as [`positive_number`] but preserves the sign, for testing and for
/// callers that need to distinguish "no digits" from "negative".
pub fn number(s: &str) -> Result<i64> {
    let mut negative = false;
    let mut int_part = String::new();
    let mut frac_part = String::new();
    let mut in_frac = false;
    let mut saw_digit = false;
    let mut factor: i64 = 1;

    for c in s.chars() {
        match c {
            '-' if !saw_digit && int_part.is_empty() => negative = true,
            '0'..='9' => {
                saw_digit = true;
                if in_frac {
                    frac_part.push(c);
                } else {
                    int_part.push(c);
                }
            }
            '.' | ',' if saw_digit && !in_frac => in_frac = true,
            'k' | 'K' => factor = 1_000,
            'm' | 'M' => factor = 1_000_000,
            _ => (),
        }
    }

    if !saw_digit {
        return Err(anyhow!("no digits found in {s:?}"));
    }

    let int_val: i64 = int_part.parse().unwrap_or(0);
    let frac_val: f64 = if frac_part.is_empty() {
        0.0
    } else {
        format!("0.{frac_part}").parse().unwrap_or(0.0)
    };

    let magnitude = (int_val as f64 + frac_val) * factor as f64;
    let signed = if negative { -magnitude } else { magnitude };
    Ok(signed.round() as i64)
}

/// A count carrier: either exact or approximate, never both non-zero at
/// once in a meaningful way (an all-zero `Value` is the null value).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Value {
    pub exact: u64,
    pub approx: u64,
    pub short: String,
}

impl Value {
    /// Construct from a raw string. When `is_exact` is true, or when the
    /// trimmed input stringifies exactly to its integer value (no factor,
    /// no fractional noise), yields an exact value. Otherwise yields an
    /// approximate value carrying the original short form.
    pub fn new(s: &str, is_exact: bool) -> Result<Self> {
        let trimmed = s.trim();
        let n = positive_number(trimmed)?;
        if is_exact || trimmed == n.to_string() {
            Ok(Self {
                exact: n,
                approx: 0,
                short: String::new(),
            })
        } else {
            Ok(Self {
                exact: 0,
                approx: n,
                short: trimmed.to_owned(),
            })
        }
    }

    pub fn is_exact(&self) -> bool {
        self.exact != 0
    }

    /// The value itself: exact if non-zero, else approx.
    pub fn value(&self) -> u64 {
        if self.exact != 0 {
            self.exact
        } else {
            self.approx
        }
    }

    pub fn is_null(&self) -> bool {
        self.exact == 0 && self.approx == 0
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let n = self.value();
        if self.is_exact() || self.short.is_empty() || self.short == n.to_string() {
            write!(f, "{n}")
        } else {
            write!(f, "{n} ({})", self.short)
        }
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positive_number_negative_clamps() {
        assert_eq!(positive_number(" -1 000k ").unwrap(), 0);
    }

    #[test]
    fn test_number_negative_k() {
        assert_eq!(number(" -1 000k ").unwrap(), -1_000_000);
    }

    #[test]
    fn test_number_no_digits_errs() {
        assert!(number("abc").is_err());
    }

    #[test]
    fn test_value_new_approx_with_comma() {
        let v = Value::new("1,2K", false).unwrap();
        assert_eq!(v.approx, 1200);
        assert_eq!(v.short, "1,2K");
        assert_eq!(v.to_string(), "1200 (1,2K)");
    }

    #[test]
    fn test_value_new_exact_plain_int() {
        let v = Value::new("42", false).unwrap();
        assert!(v.is_exact());
        assert_eq!(v.to_string(), "42");
    }

    #[test]
    fn test_value_new_forced_exact() {
        let v = Value::new("1.2K", true).unwrap();
        assert!(v.is_exact());
        assert_eq!(v.exact, 1200);
    }

    #[test]
    fn test_value_null() {
        let v = Value::default();
        assert!(v.is_null());
    }
}
