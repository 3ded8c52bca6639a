// Copyright (C) myl7
// SPDX-License-Identifier: Apache-2.0

//! Aggregate controller (spec.md §4.8): fans a channel list out over one
//! `tokio::spawn` per channel, runs that channel's info/messages legs
//! concurrently, reconciles the two results, and accumulates errors and
//! parsed records under two distinct mutexes — kept distinct per the
//! design note in spec.md §9 flagging the original's shared-mutex ambiguity.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::cache::Cache;
use crate::fetch::Fetcher;
use crate::ident::{self, ParsedId};
use crate::model::ChannelRecord;
use crate::patterns::PatternStore;
use crate::pipeline::{self, LegOutcome, PipelineConfig};

/// Cache TTL for a reconciled channel record.
const RESULT_TTL: Duration = Duration::from_secs(300);

pub struct Controller {
    fetcher: Fetcher,
    patterns: Arc<PatternStore>,
    cache: Arc<Cache<ChannelRecord>>,
    cfg: PipelineConfig,
}

impl Controller {
    pub fn new(fetcher: Fetcher, patterns: Arc<PatternStore>, cache: Arc<Cache<ChannelRecord>>, cfg: PipelineConfig) -> Self {
        Self {
            fetcher,
            patterns,
            cache,
            cfg,
        }
    }

    /// Parse every channel in `raw_channels`, deduplicated, in parallel.
    /// Returns the successfully reconciled records (input order preserved)
    /// and every accumulated error.
    pub async fn parse(
        &self,
        token: CancellationToken,
        raw_channels: &[String],
        is_exact: bool,
        messages_count: u64,
    ) -> (Vec<ChannelRecord>, Vec<anyhow::Error>) {
        let channels = dedup_channels(raw_channels);
        let results: Arc<Mutex<Vec<Option<ChannelRecord>>>> = Arc::new(Mutex::new(vec![None; channels.len()]));
        let errors: Arc<Mutex<Vec<anyhow::Error>>> = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::with_capacity(channels.len());
        for (idx, raw) in channels.into_iter().enumerate() {
            let fetcher = self.fetcher.clone();
            let patterns = Arc::clone(&self.patterns);
            let cache = Arc::clone(&self.cache);
            let cfg = self.cfg.clone();
            let results = Arc::clone(&results);
            let errors = Arc::clone(&errors);
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                process_one(fetcher, patterns, cache, cfg, token, raw, is_exact, messages_count, idx, results, errors).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        let parsed: Vec<ChannelRecord> = Arc::try_unwrap(results)
            .map(|m| m.into_inner().unwrap())
            .unwrap_or_else(|arc| arc.lock().unwrap().clone())
            .into_iter()
            .flatten()
            .collect();
        let errs = Arc::try_unwrap(errors)
            .map(|m| m.into_inner().unwrap())
            .unwrap_or_else(|arc| std::mem::take(&mut arc.lock().unwrap()));
        (parsed, errs)
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_one(
    fetcher: Fetcher,
    patterns: Arc<PatternStore>,
    cache: Arc<Cache<ChannelRecord>>,
    cfg: PipelineConfig,
    token: CancellationToken,
    raw: String,
    is_exact: bool,
    messages_count: u64,
    idx: usize,
    results: Arc<Mutex<Vec<Option<ChannelRecord>>>>,
    errors: Arc<Mutex<Vec<anyhow::Error>>>,
) {
    let id = ident::username(&raw, false);
    let peer = id.peer();
    if id.is_empty() {
        errors.lock().unwrap().push(anyhow!("unparseable channel identifier {raw:?}"));
        return;
    }

    let cache_key = peer.clone();
    if let Some(cached) = cache.value(&cache_key).await {
        if cached.messages.len() as u64 == messages_count {
            results.lock().unwrap()[idx] = Some(cached);
            return;
        }
        cache.remove(&cache_key).await;
    }

    let run_info_leg = is_exact;
    let run_messages_leg = !id.username.is_empty() && (messages_count > 0 || !is_exact);

    if !run_info_leg && !run_messages_leg {
        errors.lock().unwrap().push(anyhow!("no leg applicable for {peer}"));
        return;
    }

    let (info_tx, info_rx) = oneshot::channel::<LegOutcome>();
    let (msgs_tx, msgs_rx) = oneshot::channel::<LegOutcome>();

    if run_info_leg {
        let fetcher = fetcher.clone();
        let patterns = Arc::clone(&patterns);
        let id = id.clone();
        tokio::spawn(async move {
            let outcome = pipeline::run_info(&fetcher, &patterns, id).await;
            let _ = info_tx.send(outcome);
        });
    } else {
        let _ = info_tx.send(LegOutcome::skipped());
    }

    if run_messages_leg {
        let fetcher = fetcher.clone();
        let patterns = Arc::clone(&patterns);
        let id = id.clone();
        let cfg = cfg.clone();
        tokio::spawn(async move {
            let outcome = pipeline::run_messages(&fetcher, &patterns, id, messages_count, &cfg).await;
            let _ = msgs_tx.send(outcome);
        });
    } else {
        let _ = msgs_tx.send(LegOutcome::skipped());
    }

    let wait = async {
        let info_outcome = info_rx.await.unwrap_or_else(|_| LegOutcome::err(anyhow!("info leg dropped for {peer}")));
        let msgs_outcome = msgs_rx.await.unwrap_or_else(|_| LegOutcome::err(anyhow!("messages leg dropped for {peer}")));
        (info_outcome, msgs_outcome)
    };

    let (info_outcome, msgs_outcome) = tokio::select! {
        _ = token.cancelled() => {
            errors.lock().unwrap().push(anyhow!("cancelled for {peer}"));
            return;
        }
        outcomes = wait => outcomes,
    };

    if let Some(e) = info_outcome.error {
        errors.lock().unwrap().push(anyhow!("info parse error: {e}"));
    }
    if let Some(e) = msgs_outcome.error {
        errors.lock().unwrap().push(anyhow!("messages parse error: {e}"));
    }

    let mut reconciled: Option<ChannelRecord> = info_outcome.channel;
    if let Some(msgs) = msgs_outcome.channel {
        match reconciled.as_mut() {
            None => reconciled = Some(msgs),
            Some(base) => {
                base.photos = msgs.photos;
                base.videos = msgs.videos;
                base.files = msgs.files;
                base.links = msgs.links;
                base.messages = msgs.messages;
            }
        }
    }

    if let Some(record) = reconciled {
        cache.set_value(&cache_key, record.clone(), RESULT_TTL).await;
        results.lock().unwrap()[idx] = Some(record);
    }
}

/// Two-pointer dedup: scan `raw` in order, keep the first occurrence of
/// each normalized identifier, drop the rest. Replaces the teacher-language
/// original's manual index-adjustment pass, which advanced `existed[link]`
/// on the element *after* the one it had just removed.
fn dedup_channels(raw: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(raw.len());
    for s in raw {
        let key = dedup_key(s);
        if seen.insert(key) {
            out.push(s.clone());
        }
    }
    out
}

fn dedup_key(raw: &str) -> String {
    let id: ParsedId = ident::username(raw, false);
    if !id.username.is_empty() {
        id.username.to_lowercase()
    } else if !id.invite.is_empty() {
        id.invite.clone()
    } else {
        raw.trim().to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyRotator;
    use crate::session::SessionState;
    use std::time::Duration as StdDuration;

    fn test_controller(base_dir: impl Into<std::path::PathBuf>) -> Controller {
        let session = Arc::new(SessionState::new());
        session.set_timeout(StdDuration::from_secs(5));
        session.set_transport("file", 1);
        let proxy = Arc::new(ProxyRotator::disabled());
        let fetcher = Fetcher::new(session, proxy).with_base_dir(base_dir);
        Controller::new(fetcher, Arc::new(PatternStore::new()), Arc::new(Cache::new()), PipelineConfig::default())
    }

    #[test]
    fn test_dedup_channels_keeps_first_occurrence() {
        let raw = vec!["@durov".to_owned(), "DUROV".to_owned(), "@other".to_owned()];
        let out = dedup_channels(&raw);
        assert_eq!(out, vec!["@durov".to_owned(), "@other".to_owned()]);
    }

    #[tokio::test]
    async fn test_parse_unknown_channel_reports_error_not_panic() {
        let dir = std::env::temp_dir().join(format!("telescrape-ctrl-test-{}", std::process::id()));
        let controller = test_controller(&dir);
        let token = CancellationToken::new();
        let (parsed, errors) = controller
            .parse(token, &["@definitely_missing_channel".to_owned()], false, 5)
            .await;
        assert!(parsed.is_empty());
        assert_eq!(errors.len(), 1);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_parse_cache_hit_skips_legs_on_second_call() {
        let dir = std::env::temp_dir().join(format!("telescrape-ctrl-cache-{}", std::process::id()));
        tokio::fs::create_dir_all(dir.join("info")).await.unwrap();
        tokio::fs::write(
            dir.join("info").join("testchan"),
            r#"<div class="tgme_page_title"><span>Test</span></div><div class="tgme_page_extra">10 subscribers</div>"#,
        )
        .await
        .unwrap();

        let controller = test_controller(&dir);
        let token = CancellationToken::new();
        let (first, first_errs) = controller.parse(token.clone(), &["@testchan".to_owned()], true, 0).await;
        assert_eq!(first.len(), 1);
        assert!(first_errs.is_empty());

        let (second, second_errs) = controller.parse(token, &["@testchan".to_owned()], true, 0).await;
        assert_eq!(second.len(), 1);
        assert!(second_errs.is_empty());
        assert_eq!(second[0].title, "Test");

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
