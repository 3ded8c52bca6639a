// Copyright (C) myl7
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use telescrape::barrier::Barrier;
use telescrape::cache::Cache;
use telescrape::cli::{Cli, Mode};
use telescrape::controller::Controller;
use telescrape::fetch::Fetcher;
use telescrape::model::ChannelRecord;
use telescrape::patterns::PatternStore;
use telescrape::pipeline::PipelineConfig;
use telescrape::proxy::ProxyRotator;
use telescrape::response::Response as ScrapeResponse;
use telescrape::server::{self, AppState};
use telescrape::session::SessionState;

fn main() -> Result<()> {
    env_logger::init();

    let mut cli = Cli::parse();
    let mut channels = cli.clean()?;

    if channels.is_empty() && matches!(cli.mode, Some(Mode::Console)) {
        channels = read_lines_if_exists("data/channels")?;
    }

    run(cli, channels)
}

#[tokio::main]
async fn run(cli: Cli, channels: Vec<String>) -> Result<()> {
    let session = Arc::new(SessionState::new());
    if cli.test {
        session.set_transport("file", channels.len() as u64);
    } else if cli.proxy {
        session.set_transport("curl", channels.len() as u64);
    }

    let proxy = if cli.proxy {
        let lines = read_lines_if_exists("data/proxies")?;
        let prepared = ProxyRotator::prepare(&lines)?;
        Arc::new(ProxyRotator::new(prepared, 10, 3, Duration::from_secs(60)))
    } else {
        Arc::new(ProxyRotator::disabled())
    };

    let fetcher = Fetcher::new(Arc::clone(&session), Arc::clone(&proxy));
    let patterns = Arc::new(PatternStore::new());
    let cache = Arc::new(Cache::<ChannelRecord>::new());
    let _sweep = Cache::check_every(&cache, Duration::from_secs(60));
    let controller = Arc::new(Controller::new(fetcher, patterns, cache, PipelineConfig::default()));

    match cli.mode {
        Some(Mode::Console) => run_console(controller, channels, cli.exact, cli.messages).await,
        Some(Mode::Proxy) => run_proxy_diagnostics(&proxy),
        _ => run_server(controller, session, &cli.address, cli.port).await,
    }
}

async fn run_console(controller: Arc<Controller>, channels: Vec<String>, exact: bool, messages: u64) -> Result<()> {
    let started = Instant::now();
    let token = CancellationToken::new();
    let channel_count = channels.len();
    let (parsed, errors) = controller.parse(token, &channels, exact, messages).await;
    let count = parsed.len();
    let resp = ScrapeResponse::new(parsed, count, errors, started.elapsed());

    for channel in &resp.data {
        println!("{channel:#?}");
    }
    for err in &resp.errors {
        log::error!("{err}");
    }
    log::info!("parsed {} of {} channels in {:?}", resp.data.len(), channel_count, resp.time);
    Ok(())
}

async fn run_server(controller: Arc<Controller>, session: Arc<SessionState>, address: &str, port: u16) -> Result<()> {
    let state = AppState {
        controller,
        barrier: Arc::new(Barrier::new()),
        session,
    };
    let app = server::router(state);
    let addr: SocketAddr = format!("{address}:{port}").parse()?;
    log::info!("listening on {addr}");
    axum::Server::bind(&addr).serve(app.into_make_service()).await?;
    Ok(())
}

fn run_proxy_diagnostics(proxy: &ProxyRotator) -> Result<()> {
    for _ in 0..5 {
        println!("{:?}", proxy.round());
    }
    Ok(())
}

fn read_lines_if_exists(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = std::fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect())
}
