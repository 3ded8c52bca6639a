// Copyright (C) myl7
// SPDX-License-Identifier: Apache-2.0

//! CLI definitions with its cleaning (spec.md §6), generalized from the
//! teacher's `Cli::clean` shape: `Option<T>` fields validated and defaulted
//! in one post-parse pass rather than scattered across `clap` attributes.

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Run mode: dump to console, serve the HTTP API, or run proxy-rotation
    /// diagnostics only.
    #[clap(long, value_enum)]
    pub mode: Option<Mode>,
    /// A single channel identifier.
    #[clap(long)]
    pub channel: Option<String>,
    /// Comma-separated channel identifiers.
    #[clap(long)]
    pub channels: Option<String>,
    #[clap(long, default_value_t = 0)]
    pub offset: u64,
    #[clap(long, default_value_t = 100)]
    pub limit: u64,
    #[clap(long, default_value_t = 20)]
    pub messages: u64,
    #[clap(long)]
    pub exact: bool,
    /// Use the deterministic `file` transport instead of live HTTP/curl.
    #[clap(long)]
    pub test: bool,
    /// Rotate through `data/proxies` instead of fetching direct.
    #[clap(long)]
    pub proxy: bool,
    #[clap(long, default_value = "127.0.0.1")]
    pub address: String,
    #[clap(long, default_value_t = 8080)]
    pub port: u16,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, ValueEnum)]
pub enum Mode {
    Console,
    Server,
    Proxy,
}

impl Cli {
    /// Normalize `channels` (comma-split, trimmed, empties dropped), default
    /// `mode` to `Server`, and validate that `address`/`port` are only
    /// meaningful in `Server` mode — mirroring the teacher's `clean()`
    /// validating `host`/`acct` only for its fetch-shaped input modes.
    pub fn clean(&mut self) -> Result<Vec<String>> {
        if self.mode.is_none() {
            self.mode = Some(Mode::Server);
        }

        let mut channels: Vec<String> = Vec::new();
        if let Some(c) = &self.channel {
            let t = c.trim();
            if !t.is_empty() {
                channels.push(t.to_owned());
            }
        }
        if let Some(list) = &self.channels {
            channels.extend(list.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_owned));
        }

        match self.mode {
            Some(Mode::Console) => {
                if channels.is_empty() {
                    return Err(anyhow!("channel or channels is required in console mode"));
                }
            }
            Some(Mode::Server) => {
                if self.port == 0 {
                    return Err(anyhow!("port must be non-zero in server mode"));
                }
            }
            _ => (),
        }

        Ok(channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(mode: Option<Mode>) -> Cli {
        Cli {
            mode,
            channel: None,
            channels: None,
            offset: 0,
            limit: 100,
            messages: 20,
            exact: false,
            test: false,
            proxy: false,
            address: "127.0.0.1".to_owned(),
            port: 8080,
        }
    }

    #[test]
    fn test_clean_defaults_to_server_mode() {
        let mut c = cli(None);
        c.clean().unwrap();
        assert_eq!(c.mode, Some(Mode::Server));
    }

    #[test]
    fn test_clean_merges_channel_and_channels() {
        let mut c = cli(Some(Mode::Console));
        c.channel = Some("@a".to_owned());
        c.channels = Some(" @b, @c ".to_owned());
        let out = c.clean().unwrap();
        assert_eq!(out, vec!["@a".to_owned(), "@b".to_owned(), "@c".to_owned()]);
    }

    #[test]
    fn test_clean_console_without_channel_errs() {
        let mut c = cli(Some(Mode::Console));
        assert!(c.clean().is_err());
    }

    #[test]
    fn test_clean_server_zero_port_errs() {
        let mut c = cli(Some(Mode::Server));
        c.port = 0;
        assert!(c.clean().is_err());
    }
}
