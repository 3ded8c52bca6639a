// Copyright (C) myl7
// SPDX-License-Identifier: Apache-2.0

//! Library surface for `telescrape`: the channel scraper/extractor core.
//! `src/main.rs` is a thin CLI/server entry point built on top of this
//! crate, consistent with the common bin+lib split used so integration
//! tests under `tests/` can exercise the core without going through the CLI.

pub mod barrier;
pub mod cache;
pub mod cli;
pub mod controller;
pub mod fetch;
pub mod ident;
pub mod model;
pub mod patterns;
pub mod pipeline;
pub mod proxy;
pub mod response;
pub mod server;
pub mod session;
pub mod value;
