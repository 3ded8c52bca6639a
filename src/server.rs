// Copyright (C) myl7
// SPDX-License-Identifier: Apache-2.0

//! The HTTP server surface (spec.md §6, SPEC_FULL §4.13): `/`, `/info`,
//! `/messages`, `/styles.css`. Grounded on the `axum::Router`/handler/`State`
//! shape surveyed in `examples/other_examples/2a75b3a8_mmogr-gglib...` and on
//! the `thiserror` + `IntoResponse` error-mapping pattern in
//! `examples/other_examples/cd38e2ac_koumoe-cli-switch...`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{OriginalUri, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::barrier::Barrier;
use crate::controller::Controller;
use crate::response::Response as ScrapeResponse;
use crate::session::SessionState;

const MENU_HTML: &str = "<html><body><h1>telescrape</h1><ul><li><a href=\"/info\">/info</a></li><li><a href=\"/messages\">/messages</a></li></ul></body></html>";
const STYLES_CSS: &str = "body { font-family: sans-serif; }\n";
const INFO_FORM_HTML: &str = "<html><body><form action=\"/info\"><input name=\"channel\"><button>Go</button></form></body></html>";
const MESSAGES_FORM_HTML: &str =
    "<html><body><form action=\"/messages\"><input name=\"channel\"><input name=\"messages\" value=\"20\"><button>Go</button></form></body></html>";

#[derive(thiserror::Error, Debug)]
pub enum HttpError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("rate limited")]
    RateLimited,
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        match self {
            HttpError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            HttpError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "429 Too Many Requests").into_response(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<Controller>,
    pub barrier: Arc<Barrier>,
    pub session: Arc<SessionState>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ChannelQuery {
    pub channel: Option<String>,
    pub channels: Option<String>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub messages: Option<u64>,
    pub test: Option<bool>,
    pub exact: Option<bool>,
}

impl ChannelQuery {
    fn channel_list(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(c) = &self.channel {
            let t = c.trim();
            if !t.is_empty() {
                out.push(t.to_owned());
            }
        }
        if let Some(list) = &self.channels {
            out.extend(list.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_owned));
        }
        out
    }

    fn paginated(&self) -> Vec<String> {
        let all = self.channel_list();
        let offset = self.offset.unwrap_or(0) as usize;
        let limit = self.limit.unwrap_or(100) as usize;
        all.into_iter().skip(offset).take(limit).collect()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(menu))
        .route("/info", get(info))
        .route("/messages", get(messages))
        .route("/styles.css", get(styles))
        .with_state(state)
}

async fn menu() -> Html<&'static str> {
    Html(MENU_HTML)
}

async fn styles() -> impl IntoResponse {
    ([(axum::http::header::CONTENT_TYPE, "text/css")], STYLES_CSS)
}

async fn info(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Query(query): Query<ChannelQuery>,
) -> Result<Response, HttpError> {
    if uri.query().map(str::is_empty).unwrap_or(true) {
        return Ok(Html(INFO_FORM_HTML).into_response());
    }
    if !state.barrier.admit("info", 10, Duration::from_secs(1)) {
        return Err(HttpError::RateLimited);
    }
    run_parse(&state, &query, true, 0).await
}

async fn messages(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Query(query): Query<ChannelQuery>,
) -> Result<Response, HttpError> {
    if uri.query().map(str::is_empty).unwrap_or(true) {
        return Ok(Html(MESSAGES_FORM_HTML).into_response());
    }
    if !state.barrier.admit("msgs", 5, Duration::from_secs(1)) {
        return Err(HttpError::RateLimited);
    }
    let messages_count = query.messages.unwrap_or(20);
    run_parse(&state, &query, query.exact.unwrap_or(false), messages_count).await
}

async fn run_parse(
    state: &AppState,
    query: &ChannelQuery,
    is_exact: bool,
    messages_count: u64,
) -> Result<Response, HttpError> {
    let channels = query.paginated();
    if channels.is_empty() {
        return Err(HttpError::BadRequest("channel or channels is required".to_owned()));
    }

    let request_count = channels.len() as u64;
    if query.test.unwrap_or(false) {
        state.session.set_transport("file", request_count);
    }

    let started = Instant::now();
    let token = CancellationToken::new();
    let (parsed, errors) = state.controller.parse(token, &channels, is_exact, messages_count).await;
    let count = parsed.len();
    let resp = ScrapeResponse::new(parsed, count, errors, started.elapsed());
    Ok(Json(resp).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_query_merges_and_trims() {
        let q = ChannelQuery {
            channel: Some(" @a ".to_owned()),
            channels: Some("@b, @c".to_owned()),
            ..Default::default()
        };
        assert_eq!(q.channel_list(), vec!["@a".to_owned(), "@b".to_owned(), "@c".to_owned()]);
    }

    #[test]
    fn test_channel_query_paginated_respects_offset_and_limit() {
        let q = ChannelQuery {
            channels: Some("@a,@b,@c,@d".to_owned()),
            offset: Some(1),
            limit: Some(2),
            ..Default::default()
        };
        assert_eq!(q.paginated(), vec!["@b".to_owned(), "@c".to_owned()]);
    }
}
