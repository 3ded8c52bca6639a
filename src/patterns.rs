// Copyright (C) myl7
// SPDX-License-Identifier: Apache-2.0

//! Name-keyed compiled regex registry.
//!
//! Patterns are compiled once per name and reused. `get_or_compile` only
//! recompiles when the pattern text registered under a name actually changes,
//! which keeps hot extraction loops (the channel parse pipeline runs dozens
//! of regexes per message) from rebuilding automatons on every call.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use regex::Regex;

#[derive(Default)]
pub struct PatternStore {
    entries: RwLock<HashMap<String, (String, Regex)>>,
}

impl PatternStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the compiled regex cached under `name`, recompiling `pattern`
    /// only if it differs from what is currently stored (or nothing is
    /// stored yet).
    pub fn get_or_compile(&self, name: &str, pattern: &str) -> Result<Regex> {
        if let Some((stored_pattern, re)) = self.entries.read().unwrap().get(name) {
            if stored_pattern == pattern {
                return Ok(re.clone());
            }
        }
        let re = Regex::new(pattern).map_err(|e| anyhow!("invalid pattern {name}: {e}"))?;
        self.entries
            .write()
            .unwrap()
            .insert(name.to_owned(), (pattern.to_owned(), re.clone()));
        Ok(re)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuse_same_pattern() {
        let store = PatternStore::new();
        let a = store.get_or_compile("x", r"\d+").unwrap();
        let b = store.get_or_compile("x", r"\d+").unwrap();
        assert_eq!(a.as_str(), b.as_str());
    }

    #[test]
    fn test_recompile_on_change() {
        let store = PatternStore::new();
        let a = store.get_or_compile("x", r"\d+").unwrap();
        let b = store.get_or_compile("x", r"[a-z]+").unwrap();
        assert_ne!(a.as_str(), b.as_str());
    }
}
