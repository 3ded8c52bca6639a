// Copyright (C) myl7
// SPDX-License-Identifier: Apache-2.0

//! The per-channel parse pipeline (spec.md §4.7): an info leg, a messages
//! leg, and the message-extraction algorithm they share. Each leg is a pure,
//! synchronous HTML-to-record transform wrapped in a panic boundary — the
//! Rust equivalent of the "panic-for-unrecoverable-parse inside legs,
//! error-return at boundaries" design note (spec.md §9): a missing title or
//! participant count is a structural failure too incomplete to emit, so the
//! parse body panics and [`catch_unwind`] converts it into a well-formed
//! error result at the leg boundary, the same shape as the teacher's
//! `spawn_blocking`-isolated synchronous sections in `db.rs`.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};

use crate::fetch::Fetcher;
use crate::ident::{self, ParsedId};
use crate::model::{Attachment, ChannelKind, ChannelRecord, Forwarded, LinkSet, MessageRecord};
use crate::patterns::PatternStore;
use crate::value::Value;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Typical number of messages `t.me/s/<handle>` renders per page;
    /// used only to bound the number of `?before=` page loads.
    pub messages_per_page_heuristic: u64,
    /// Extra page-load budget on top of the heuristic, absorbing pages that
    /// render fewer messages than usual (service messages, etc).
    pub spare_safety_pages: u64,
    /// Sibling learning only engages when the caller requested at least
    /// this many messages.
    pub siblings_min_messages: u64,
    /// Fraction of `messagesCount` an advertisement link must be seen in
    /// to be promoted to a sibling. `floor()` is the contract: below a
    /// messages count of 4, `floor(messagesCount * 0.3)` is 0 and, since a
    /// per-message counter never reads exactly 0, promotion never fires —
    /// no special-casing needed.
    pub siblings_threshold_ratio: f64,
    /// Skip a message whose extracted text is empty, has no media, and is
    /// not a poll.
    pub is_skip_empty: bool,
    pub local_tz: chrono_tz::Tz,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            messages_per_page_heuristic: 20,
            spare_safety_pages: 2,
            siblings_min_messages: 1,
            siblings_threshold_ratio: 0.3,
            is_skip_empty: true,
            local_tz: chrono_tz::UTC,
        }
    }
}

/// The outcome of one leg: a populated record on success, or an error.
/// Never both, never neither — this is the "sentinel zero-value" the
/// controller's `select!` always has something to match against.
pub struct LegOutcome {
    pub channel: Option<ChannelRecord>,
    pub error: Option<anyhow::Error>,
}

impl LegOutcome {
    fn ok(channel: ChannelRecord) -> Self {
        Self {
            channel: Some(channel),
            error: None,
        }
    }

    fn err(error: anyhow::Error) -> Self {
        Self {
            channel: None,
            error: Some(error),
        }
    }

    /// The zero-value a skipped leg sends so a `select!` over both legs
    /// always makes progress.
    pub fn skipped() -> Self {
        Self {
            channel: None,
            error: None,
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "parse leg panicked".to_owned()
    }
}

async fn run_blocking_parse<F>(f: F) -> Result<ChannelRecord>
where
    F: FnOnce() -> Result<ChannelRecord> + Send + 'static,
{
    match tokio::task::spawn_blocking(move || catch_unwind(AssertUnwindSafe(f))).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => Err(anyhow!(panic_message(panic))),
        Err(join_err) => Err(anyhow!("parse leg join error: {join_err}")),
    }
}

// ---------------------------------------------------------------------------
// Info leg
// ---------------------------------------------------------------------------

pub async fn run_info(fetcher: &Fetcher, patterns: &Arc<PatternStore>, id: ParsedId) -> LegOutcome {
    let link = id.link();
    let fetched = fetcher.page(&link).await;
    if let Some(err) = fetched.error {
        if fetched.status == 404 {
            return LegOutcome::err(anyhow!("no data for {}", id.peer()));
        }
        return LegOutcome::err(err);
    }

    let patterns = Arc::clone(patterns);
    let peer = id.peer();
    let body = fetched.body;
    let result = run_blocking_parse(move || parse_info_body(&patterns, &id, &body, &peer)).await;
    match result {
        Ok(channel) => LegOutcome::ok(channel),
        Err(e) => LegOutcome::err(e),
    }
}

fn parse_info_body(patterns: &PatternStore, id: &ParsedId, body: &str, peer: &str) -> Result<ChannelRecord> {
    reject_unless_valid_page(patterns, body, peer)?;
    let info = extract_info_fields(patterns, body, false, id)?;
    if info.title.is_empty() {
        bail!("empty title for {peer}");
    }
    if matches!(info.kind, ChannelKind::Channel | ChannelKind::Private) && info.participants.is_null() {
        bail!("empty participants for {peer}");
    }

    Ok(ChannelRecord {
        username: id.username.clone(),
        invite: id.invite.clone(),
        peer: id.peer(),
        link: id.link(),
        kind: info.kind,
        title: info.title,
        about: info.about,
        image: info.image,
        participants: info.participants,
        photos: info.photos,
        videos: info.videos,
        files: info.files,
        links: info.links,
        is_verified: info.is_verified,
        is_scam: info.is_scam,
        contacts: info.contacts,
        siblings: info.siblings,
        messages: Vec::new(),
    })
}

fn reject_unless_valid_page(patterns: &PatternStore, body: &str, peer: &str) -> Result<()> {
    let sentinel = patterns.get_or_compile("info_sentinel", r"tgme_page_title|tgme_page_extra")?;
    if !sentinel.is_match(body) {
        bail!("no data for {peer}");
    }
    let noindex = patterns.get_or_compile(
        "info_noindex",
        r#"(?is)<meta[^>]*name="robots"[^>]*content="[^"]*(noindex|nofollow)[^"]*"[^>]*>"#,
    )?;
    if noindex.is_match(body) {
        bail!("no data for {peer}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Shared info-field extraction (used by both the info leg and, with a
// richer candidate ordering, the messages leg)
// ---------------------------------------------------------------------------

struct InfoFields {
    title: String,
    about: String,
    image: String,
    participants: Value,
    photos: Value,
    videos: Value,
    files: Value,
    links: Value,
    kind: ChannelKind,
    is_verified: bool,
    is_scam: bool,
    contacts: LinkSet,
    siblings: LinkSet,
}

fn first_match<'a>(candidates: &[Option<&'a str>]) -> Option<&'a str> {
    candidates.iter().flatten().find(|s| !s.trim().is_empty()).copied()
}

fn extract_info_fields(patterns: &PatternStore, body: &str, is_messages_page: bool, channel: &ParsedId) -> Result<InfoFields> {
    let title = extract_title(patterns, body)?;
    let about = extract_about(patterns, body)?;
    let image = extract_image(patterns, body, is_messages_page)?;
    let participants = extract_participants(patterns, body, is_messages_page)?;
    let (photos, videos, files, links) = if is_messages_page {
        extract_counters_block(patterns, body)?
    } else {
        (Value::default(), Value::default(), Value::default(), Value::default())
    };
    let kind = classify_kind(patterns, body, &participants)?;
    let is_verified = patterns
        .get_or_compile("info_verified", r#"(?s)tgme_page_title.*?verified-icon"#)?
        .is_match(body);

    let mut about = about;
    let is_scam = {
        let scam_re = patterns.get_or_compile(
            "info_scam",
            r"(?i)\b(scam|fraud)\b|мошенни",
        )?;
        let hit = scam_re.is_match(&about);
        if hit {
            about.clear();
        }
        hit
    };

    let contacts = ident::extract_links(patterns, &about, false)?;
    let siblings = ident::advertisement_filter(&contacts, channel, &HashSet::new());

    Ok(InfoFields {
        title,
        about,
        image,
        participants,
        photos,
        videos,
        files,
        links,
        kind,
        is_verified,
        is_scam,
        contacts,
        siblings,
    })
}

fn extract_title(patterns: &PatternStore, body: &str) -> Result<String> {
    let og = patterns
        .get_or_compile("title_og", r#"(?is)<meta[^>]*property="og:title"[^>]*content="([^"]*)""#)?
        .captures(body)
        .map(|c| html_unescape(c.get(1).unwrap().as_str()));
    let twitter = patterns
        .get_or_compile("title_twitter", r#"(?is)<meta[^>]*name="twitter:title"[^>]*content="([^"]*)""#)?
        .captures(body)
        .map(|c| html_unescape(c.get(1).unwrap().as_str()));
    let page_title = patterns
        .get_or_compile(
            "title_page",
            r#"(?is)class="tgme_page_title"[^>]*>\s*(?:<span[^>]*>)?\s*([^<]+?)\s*(?:</span>)?\s*</"#,
        )?
        .captures(body)
        .map(|c| html_unescape(c.get(1).unwrap().as_str()));
    let header_title = patterns
        .get_or_compile(
            "title_header",
            r#"(?is)class="tgme_header_title"[^>]*>\s*([^<]+?)\s*</"#,
        )?
        .captures(body)
        .map(|c| html_unescape(c.get(1).unwrap().as_str()));

    Ok(first_match(&[
        og.as_deref(),
        twitter.as_deref(),
        page_title.as_deref(),
        header_title.as_deref(),
    ])
    .unwrap_or_default()
    .to_owned())
}

fn extract_about(patterns: &PatternStore, body: &str) -> Result<String> {
    let body_desc = patterns
        .get_or_compile("about_body", r#"(?is)class="tgme_page_description"[^>]*>(.*?)</div>"#)?
        .captures(body)
        .map(|c| html_unescape(strip_tags(c.get(1).unwrap().as_str()).trim()));
    let meta_desc = patterns
        .get_or_compile("about_meta", r#"(?is)<meta[^>]*(?:property|name)="(?:og:description|description)"[^>]*content="([^"]*)""#)?
        .captures(body)
        .map(|c| html_unescape(c.get(1).unwrap().as_str()));

    let mut about = first_match(&[body_desc.as_deref(), meta_desc.as_deref()])
        .unwrap_or_default()
        .to_owned();

    let canary = patterns.get_or_compile(
        "about_canary",
        r#"(?i)view,?\s*join|share.*contact|you can view and join"#,
    )?;
    if canary.is_match(&about) {
        about.clear();
    }
    Ok(about)
}

fn extract_image(patterns: &PatternStore, body: &str, is_messages_page: bool) -> Result<String> {
    let body_photo = patterns
        .get_or_compile("image_body", r#"(?is)class="tgme_page_photo_image"[^>]*>\s*<img[^>]*src="([^"]+)""#)?
        .captures(body)
        .map(|c| c.get(1).unwrap().as_str().to_owned());
    let meta_image = patterns
        .get_or_compile("image_meta", r#"(?is)<meta[^>]*property="og:image"[^>]*content="([^"]*)""#)?
        .captures(body)
        .map(|c| c.get(1).unwrap().as_str().to_owned());

    let order: [Option<&str>; 2] = if is_messages_page {
        [meta_image.as_deref(), body_photo.as_deref()]
    } else {
        [body_photo.as_deref(), meta_image.as_deref()]
    };
    Ok(first_match(&order).unwrap_or_default().to_owned())
}

fn extract_participants(patterns: &PatternStore, body: &str, is_messages_page: bool) -> Result<Value> {
    let page_extra = patterns
        .get_or_compile("participants_extra", r#"(?is)class="tgme_page_extra"[^>]*>([^<]*)</div>"#)?
        .captures(body)
        .map(|c| c.get(1).unwrap().as_str().trim().to_owned());
    let header_counter = patterns
        .get_or_compile("participants_header", r#"(?is)class="tgme_header_counter"[^>]*>([^<]*)</div>"#)?
        .captures(body)
        .map(|c| c.get(1).unwrap().as_str().trim().to_owned());

    let (text, is_exact) = if is_messages_page {
        match header_counter.as_deref().filter(|s| !s.is_empty()) {
            Some(s) => (Some(s.to_owned()), false),
            None => (page_extra, true),
        }
    } else {
        (page_extra, true)
    };

    match text {
        Some(t) if has_digit(&t) => {
            Value::new(&t, is_exact).map_err(|e| anyhow!("participants parse error: {e}"))
        }
        _ => Ok(Value::default()),
    }
}

fn extract_counters_block(patterns: &PatternStore, body: &str) -> Result<(Value, Value, Value, Value)> {
    let block_re = patterns.get_or_compile(
        "counters_block",
        r#"(?is)class="tgme_channel_info_counters"(.*?)</div>\s*</div>"#,
    )?;
    let Some(block) = block_re.captures(body).map(|c| c.get(1).unwrap().as_str().to_owned()) else {
        return Ok((Value::default(), Value::default(), Value::default(), Value::default()));
    };

    let counter_re = patterns.get_or_compile(
        "counters_each",
        r#"(?is)class="counter_value"[^>]*>([^<]*)</span>.*?class="counter_type"[^>]*>([^<]*)</span>"#,
    )?;

    let mut values: HashMap<String, Value> = HashMap::new();
    for caps in counter_re.captures_iter(&block) {
        let val_text = caps.get(1).unwrap().as_str().trim();
        let kind = caps.get(2).unwrap().as_str().trim().to_lowercase();
        if !has_digit(val_text) {
            continue;
        }
        if let Ok(v) = Value::new(val_text, false) {
            values.insert(kind, v);
        }
    }

    Ok((
        pick_contains(&values, "photo"),
        pick_contains(&values, "video"),
        pick_contains(&values, "file"),
        pick_contains(&values, "link"),
    ))
}

fn pick_contains(values: &HashMap<String, Value>, needle: &str) -> Value {
    values
        .iter()
        .find(|(k, _)| k.contains(needle))
        .map(|(_, v)| v.clone())
        .unwrap_or_default()
}

fn classify_kind(patterns: &PatternStore, body: &str, participants: &Value) -> Result<ChannelKind> {
    let context_link = patterns.get_or_compile(
        "kind_context_link",
        r#"(?is)tgme_page_context_link"[^>]*href="/s/"#,
    )?;
    if context_link.is_match(body) {
        return Ok(ChannelKind::Channel);
    }

    let join_button = patterns.get_or_compile(
        "kind_join_button",
        r#"(?is)tgme_(?:action_)?button[^>]*>\s*Join\s+(Channel|Group|Supergroup)"#,
    )?;
    if join_button.is_match(body) {
        return Ok(ChannelKind::Private);
    }

    let handle_re = patterns.get_or_compile(
        "kind_handle_for_class",
        r#"(?is)class="tgme_page_username"[^>]*>\s*@([A-Za-z0-9_]+)"#,
    )?;
    let looks_like_bot = handle_re
        .captures(body)
        .map(|c| {
            let h = c.get(1).unwrap().as_str().to_lowercase();
            h.ends_with("bot") || h.ends_with("botfather")
        })
        .unwrap_or(false);
    if looks_like_bot && participants.is_null() {
        return Ok(ChannelKind::Bot);
    }

    let send_message = patterns.get_or_compile(
        "kind_send_message",
        r#"(?is)tgme_(?:action_)?button[^>]*>\s*Send\s+Message"#,
    )?;
    if send_message.is_match(body) && participants.is_null() {
        return Ok(ChannelKind::User);
    }

    Ok(ChannelKind::Chat)
}

fn has_digit(s: &str) -> bool {
    s.chars().any(|c| c.is_ascii_digit())
}

fn strip_tags(s: &str) -> String {
    static_regex(r"<[^>]+>").replace_all(s, "").into_owned()
}

fn html_unescape(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .trim()
        .to_owned()
}

fn static_regex(pattern: &str) -> regex::Regex {
    regex::Regex::new(pattern).unwrap()
}

// ---------------------------------------------------------------------------
// Messages leg
// ---------------------------------------------------------------------------

pub async fn run_messages(
    fetcher: &Fetcher,
    patterns: &Arc<PatternStore>,
    id: ParsedId,
    messages_count: u64,
    cfg: &PipelineConfig,
) -> LegOutcome {
    if id.username.is_empty() {
        return LegOutcome::err(anyhow!("no data for {}", id.peer()));
    }
    let link = format!("https://t.me/s/{}", id.username);
    let peer = id.peer();

    let mut all_messages: Vec<MessageRecord> = Vec::new();
    let mut adv_counts: HashMap<String, u64> = HashMap::new();
    let mut promoted: HashSet<String> = HashSet::new();
    let mut siblings = LinkSet::new();
    let mut channel_info: Option<InfoFields> = None;
    let mut first_page_prefix: Option<String> = None;
    let mut before: Option<u64> = None;
    let mut last_id_seen = 0u64;
    // Grows as contacts-derived siblings (known once the first page's info
    // fields parse) and promoted advs (known as messages are processed) are
    // learned, so later pages' advertisement filtering excludes them too.
    let mut known_siblings: HashSet<String> = HashSet::new();

    let max_pages = ((messages_count as f64 / cfg.messages_per_page_heuristic.max(1) as f64).ceil() as u64)
        .max(1)
        + cfg.spare_safety_pages;

    for page_no in 0..max_pages {
        let url = match before {
            Some(b) => format!("{link}?before={b}"),
            None => link.clone(),
        };
        let fetched = fetcher.page(&url).await;
        if let Some(err) = fetched.error {
            if page_no == 0 {
                if fetched.status == 404 {
                    return LegOutcome::err(anyhow!("no data for {peer}"));
                }
                return LegOutcome::err(err);
            }
            break; // later-page transport failures: stop, keep what we have
        }

        let body = fetched.body;
        if page_no == 0 {
            first_page_prefix = Some(body.chars().take(20_000).collect());
        } else if let Some(prefix) = &first_page_prefix {
            let cur: String = body.chars().take(20_000).collect();
            if &cur == prefix {
                break; // identical to the first page: end of history
            }
        }

        let patterns_handle = Arc::clone(patterns);
        let is_first = page_no == 0;
        let local_tz = cfg.local_tz;
        let channel_handle = id.clone();
        let siblings_snapshot = known_siblings.clone();
        let parse_result =
            run_blocking_page_parse(patterns_handle, body, is_first, local_tz, channel_handle, siblings_snapshot).await;
        let page = match parse_result {
            Ok(page) => page,
            Err(e) => {
                if page_no == 0 && all_messages.is_empty() {
                    return LegOutcome::err(e);
                }
                break;
            }
        };

        if is_first {
            if let Some(info) = &page.info {
                known_siblings.extend(info.siblings.keys().cloned());
            }
            channel_info = page.info;
        }

        for mut msg in page.messages {
            if messages_count >= cfg.siblings_min_messages {
                let threshold = (messages_count as f64 * cfg.siblings_threshold_ratio).floor() as u64;
                let keys: Vec<String> = msg.advs.keys().cloned().collect();
                for key in keys {
                    let counter = adv_counts.entry(key.clone()).or_insert(0);
                    *counter += 1;
                    if *counter == threshold && threshold > 0 && !promoted.contains(&key) {
                        promoted.insert(key.clone());
                        known_siblings.insert(key.clone());
                        if let Some(link) = msg.advs.get_by_key(&key) {
                            siblings.insert_link(link.clone());
                        }
                        msg.advs.remove_by_key(&key);
                        for prev in all_messages.iter_mut() {
                            prev.advs.remove_by_key(&key);
                        }
                    }
                }
            }
            last_id_seen = msg.id;
            all_messages.push(msg);
        }

        if all_messages.len() as u64 >= messages_count {
            break;
        }
        if last_id_seen <= 1 {
            break;
        }
        before = Some(last_id_seen);
    }

    all_messages.truncate(messages_count as usize);

    let Some(info) = channel_info else {
        return LegOutcome::err(anyhow!("no data for {peer}"));
    };

    let mut merged_siblings = info.siblings;
    for link in siblings.values() {
        merged_siblings.insert_link(link.clone());
    }

    LegOutcome::ok(ChannelRecord {
        username: id.username.clone(),
        invite: id.invite.clone(),
        peer: id.peer(),
        link: id.link(),
        kind: info.kind,
        title: info.title,
        about: info.about,
        image: info.image,
        participants: info.participants,
        photos: info.photos,
        videos: info.videos,
        files: info.files,
        links: info.links,
        is_verified: info.is_verified,
        is_scam: info.is_scam,
        contacts: info.contacts,
        siblings: merged_siblings,
        messages: all_messages,
    })
}

struct MessagesPage {
    info: Option<InfoFields>,
    messages: Vec<MessageRecord>,
}

async fn run_blocking_page_parse(
    patterns: Arc<PatternStore>,
    body: String,
    is_first: bool,
    local_tz: chrono_tz::Tz,
    channel: ParsedId,
    known_siblings: HashSet<String>,
) -> Result<MessagesPage> {
    run_blocking_page(move || parse_messages_page(&patterns, &body, is_first, local_tz, &channel, &known_siblings)).await
}

async fn run_blocking_page<F>(f: F) -> Result<MessagesPage>
where
    F: FnOnce() -> Result<MessagesPage> + Send + 'static,
{
    match tokio::task::spawn_blocking(move || catch_unwind(AssertUnwindSafe(f))).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => Err(anyhow!(panic_message(panic))),
        Err(join_err) => Err(anyhow!("parse leg join error: {join_err}")),
    }
}

fn parse_messages_page(
    patterns: &PatternStore,
    body: &str,
    is_first: bool,
    local_tz: chrono_tz::Tz,
    channel: &ParsedId,
    known_siblings: &HashSet<String>,
) -> Result<MessagesPage> {
    let info = if is_first {
        Some(extract_info_fields(patterns, body, true, channel)?)
    } else {
        None
    };

    let mut siblings_for_segments = known_siblings.clone();
    if let Some(info) = &info {
        siblings_for_segments.extend(info.siblings.keys().cloned());
    }

    let stripped = strip_noise(patterns, body)?;

    let wrap_re = patterns.get_or_compile("msg_wrap_split", r"tgme_widget_message_wrap")?;
    let mut segments: Vec<&str> = wrap_re.split(&stripped).collect();
    if !segments.is_empty() {
        segments.remove(0); // pre-first-message preamble
    }

    let mut messages = Vec::with_capacity(segments.len());
    for segment in segments.into_iter().rev() {
        match parse_message_segment(patterns, segment, local_tz, &siblings_for_segments) {
            Ok(Some(msg)) => messages.push(msg),
            Ok(None) => (),
            Err(e) => return Err(e),
        }
    }

    Ok(MessagesPage { info, messages })
}

/// Remove `<head>…</header>`, every `<svg>…</svg>`, and every
/// `tgme_widget_message_user…</div>` block before per-message regex work —
/// shortens the string the way the teacher's `producer.rs::clean_body`
/// shortens RSS bodies before per-item processing, but via balanced-tag
/// scanning rather than a full XML reader since these fragments are not
/// guaranteed well-formed XML.
fn strip_noise(patterns: &PatternStore, body: &str) -> Result<String> {
    let head_re = patterns.get_or_compile("strip_head", r"(?is)<head>.*?</header>")?;
    let svg_re = patterns.get_or_compile("strip_svg", r"(?is)<svg.*?</svg>")?;
    let mut out = head_re.replace_all(body, "").into_owned();
    out = svg_re.replace_all(&out, "").into_owned();
    out = strip_balanced_div_blocks(&out, "tgme_widget_message_user");
    Ok(out)
}

/// Remove every `<div ... class="...NEEDLE..." ...> ... </div>` block,
/// tracking nested `<div>`/`</div>` depth so the removal does not stop at
/// the first nested closing tag.
fn strip_balanced_div_blocks(html: &str, needle: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;
    loop {
        let Some(start) = rest.find("<div") else {
            out.push_str(rest);
            break;
        };
        let Some(tag_end) = rest[start..].find('>') else {
            out.push_str(rest);
            break;
        };
        let tag_end = start + tag_end + 1;
        if !rest[start..tag_end].contains(needle) {
            out.push_str(&rest[..tag_end]);
            rest = &rest[tag_end..];
            continue;
        }

        // Walk forward counting div depth to find the matching close tag.
        let mut depth = 1usize;
        let mut cursor = tag_end;
        let mut block_end = rest.len();
        while cursor < rest.len() {
            let open = rest[cursor..].find("<div");
            let close = rest[cursor..].find("</div>");
            match (open, close) {
                (_, None) => {
                    block_end = rest.len();
                    break;
                }
                (Some(o), Some(c)) if o < c => {
                    depth += 1;
                    cursor += o + 4;
                }
                (_, Some(c)) => {
                    depth -= 1;
                    cursor += c + 6;
                    if depth == 0 {
                        block_end = cursor;
                        break;
                    }
                }
            }
        }
        out.push_str(&rest[..start]);
        rest = &rest[block_end..];
    }
    out
}

fn parse_message_segment(
    patterns: &PatternStore,
    segment: &str,
    local_tz: chrono_tz::Tz,
    known_siblings: &HashSet<String>,
) -> Result<Option<MessageRecord>> {
    let head = &segment[..segment.len().min(500)];
    if head.contains("service_message") {
        return Ok(None);
    }

    let post_re = patterns.get_or_compile("msg_data_post", r#"data-post="([A-Za-z0-9_]+)/(\d+)""#)?;
    let Some(caps) = post_re.captures(segment) else {
        bail!("message segment missing data-post id");
    };
    let peer = caps.get(1).unwrap().as_str().to_owned();
    let id: u64 = caps
        .get(2)
        .unwrap()
        .as_str()
        .parse()
        .map_err(|_| anyhow!("unparseable message id for {peer}"))?;

    let text_re = patterns.get_or_compile(
        "msg_text",
        r#"(?is)class="tgme_widget_message_text[^"]*"[^>]*>(.*?)</div>"#,
    )?;
    let html = text_re
        .captures(segment)
        .map(|c| c.get(1).unwrap().as_str().trim().to_owned())
        .unwrap_or_default();
    let text = if html.is_empty() {
        None
    } else {
        Some(html_unescape(&strip_tags(&html)))
    };

    let views_re = patterns.get_or_compile("msg_views", r#"(?is)class="tgme_widget_message_views"[^>]*>([^<]*)</span>"#)?;
    let views_text = views_re
        .captures(segment)
        .map(|c| c.get(1).unwrap().as_str().trim().to_owned())
        .ok_or_else(|| anyhow!("message {id} missing views"))?;
    let views = Value::new(&views_text, false).map_err(|e| anyhow!("message {id} views parse error: {e}"))?;

    let date_re = patterns.get_or_compile("msg_date", r#"(?is)<time[^>]*datetime="([^"]+)""#)?;
    let date_text = date_re
        .captures(segment)
        .map(|c| c.get(1).unwrap().as_str().to_owned())
        .ok_or_else(|| anyhow!("message {id} missing date"))?;
    let date: DateTime<Utc> = DateTime::parse_from_rfc3339(&date_text)
        .map_err(|e| anyhow!("message {id} unparseable date {date_text:?}: {e}"))?
        .with_timezone(&Utc);
    let date_local = date.with_timezone(&local_tz);

    let edited_re = patterns.get_or_compile(
        "msg_edited",
        r#"(?is)class="tgme_widget_message_meta"[^>]*>.*?\bedited\b"#,
    )?;
    let edited = edited_re.is_match(segment);

    let fwd = extract_forwarded(patterns, segment)?;

    let (mut has_image, mut has_video, has_document, mut attachments) = extract_media(patterns, segment)?;

    let hashtags = extract_hashtags(patterns, &html)?;

    let links = ident::extract_links(patterns, segment, true)?;

    let (buttons, links) = extract_buttons(patterns, segment, links)?;

    let self_id = ParsedId {
        username: peer.clone(),
        invite: String::new(),
        post: 0,
    };
    let advs = ident::advertisement_filter(&links, &self_id, known_siblings);

    promote_media_from_links(&links, &mut has_image, &mut has_video, &mut attachments);

    let is_poll = patterns
        .get_or_compile("msg_poll", r"tgme_widget_message_poll")?
        .is_match(segment);

    let (html_out, skip) = if text.is_none() && is_poll {
        (synthesize_poll_html(patterns, segment)?, false)
    } else if text.is_none() && !has_image && !has_video && !has_document && !is_poll {
        (String::new(), true)
    } else {
        (html.clone(), false)
    };

    if skip {
        return Ok(None);
    }

    Ok(Some(MessageRecord {
        id,
        html: html_out,
        text,
        fwd,
        edited,
        poll: is_poll,
        has_image,
        has_video,
        has_document,
        attachments,
        hashtags,
        links,
        advs,
        buttons,
        views,
        date,
        date_local,
    }))
}

fn extract_forwarded(patterns: &PatternStore, segment: &str) -> Result<Forwarded> {
    let re = patterns.get_or_compile(
        "msg_forwarded",
        r#"(?is)class="tgme_widget_message_forwarded_from_name"[^>]*href="([^"]*)"[^>]*>([^<]*)</a>"#,
    )?;
    let Some(caps) = re.captures(segment) else {
        return Ok(Forwarded::default());
    };
    let link = caps.get(1).unwrap().as_str().to_owned();
    let title = html_unescape(caps.get(2).unwrap().as_str());
    let id = ident::username(&link, false);
    Ok(Forwarded {
        forwarded: true,
        fwd_link: link,
        fwd_post: id.post,
        fwd_title: title,
        fwd_author: String::new(),
    })
}

fn extract_media(patterns: &PatternStore, segment: &str) -> Result<(bool, bool, bool, Vec<Attachment>)> {
    let mut attachments = Vec::new();
    let mut has_image = false;
    let mut has_video = false;
    let mut has_document = false;

    let photo_re = patterns.get_or_compile(
        "msg_media_photo",
        r#"(?is)tgme_widget_message_photo_wrap[^"]*"[^>]*style="[^"]*background-image:url\('([^']+)'\)"#,
    )?;
    for caps in photo_re.captures_iter(segment) {
        has_image = true;
        attachments.push(Attachment {
            kind: "image".to_owned(),
            url: caps.get(1).unwrap().as_str().to_owned(),
        });
    }

    let video_re = patterns.get_or_compile(
        "msg_media_video",
        r#"(?is)tgme_widget_message_video_player[^"]*"[\s\S]*?<video[^>]*src="([^"]+)""#,
    )?;
    for caps in video_re.captures_iter(segment) {
        has_video = true;
        attachments.push(Attachment {
            kind: "video".to_owned(),
            url: caps.get(1).unwrap().as_str().to_owned(),
        });
    }

    let document_re = patterns.get_or_compile(
        "msg_media_document",
        r#"(?is)tgme_widget_message_document[^"]*"[\s\S]*?href="([^"]+)""#,
    )?;
    for caps in document_re.captures_iter(segment) {
        let url = caps.get(1).unwrap().as_str().to_owned();
        let lower = url.to_lowercase();
        if has_extension(&lower, IMAGE_EXTS) {
            has_image = true;
            attachments.push(Attachment { kind: "image".to_owned(), url });
        } else if has_extension(&lower, VIDEO_EXTS) {
            has_video = true;
            attachments.push(Attachment { kind: "video".to_owned(), url });
        } else {
            has_document = true;
            attachments.push(Attachment { kind: "document".to_owned(), url });
        }
    }

    Ok((has_image, has_video, has_document, attachments))
}

const IMAGE_EXTS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".webp"];
const VIDEO_EXTS: &[&str] = &[".mp4", ".mov", ".webm", ".mkv"];

fn has_extension(url: &str, exts: &[&str]) -> bool {
    exts.iter().any(|e| url.ends_with(e))
}

fn promote_media_from_links(links: &LinkSet, has_image: &mut bool, has_video: &mut bool, attachments: &mut Vec<Attachment>) {
    if *has_image || *has_video {
        return;
    }
    for link in links.values() {
        let lower = link.url.to_lowercase();
        if has_extension(&lower, IMAGE_EXTS) {
            *has_image = true;
            attachments.push(Attachment {
                kind: "image".to_owned(),
                url: link.url.clone(),
            });
            return;
        }
        if has_extension(&lower, VIDEO_EXTS) {
            *has_video = true;
            attachments.push(Attachment {
                kind: "video".to_owned(),
                url: link.url.clone(),
            });
            return;
        }
    }
}

fn extract_hashtags(patterns: &PatternStore, html: &str) -> Result<Vec<String>> {
    let code_re = patterns.get_or_compile("hashtag_strip_code", r"(?is)<code[^>]*>.*?</code>")?;
    let text = code_re.replace_all(html, "");
    let plain = strip_tags(&text);
    let hashtag_re = patterns.get_or_compile(
        "hashtag",
        r"(^|[^\w#])#([A-Za-zА-Яа-яЁё0-9][A-Za-zА-Яа-яЁё0-9_]*)",
    )?;
    Ok(hashtag_re
        .captures_iter(&plain)
        .map(|c| c.get(2).unwrap().as_str().to_owned())
        .collect())
}

fn extract_buttons(patterns: &PatternStore, segment: &str, mut links: LinkSet) -> Result<(Option<LinkSet>, LinkSet)> {
    let button_re = patterns.get_or_compile(
        "msg_button",
        r#"(?is)class="[^"]*url_button[^"]*"[^>]*href="([^"]+)"[^>]*>([^<]*)</a>"#,
    )?;
    let mut buttons = LinkSet::new();
    for caps in button_re.captures_iter(segment) {
        let url = caps.get(1).unwrap().as_str();
        let caption = html_unescape(caps.get(2).unwrap().as_str());
        buttons.add(url, Some(&caption), None);
        links.add(url, Some(&caption), None);
    }
    if buttons.is_empty() {
        Ok((None, links))
    } else {
        Ok((Some(buttons), links))
    }
}

fn synthesize_poll_html(patterns: &PatternStore, segment: &str) -> Result<String> {
    let question_re = patterns.get_or_compile(
        "poll_question",
        r#"(?is)class="tgme_widget_message_poll_question"[^>]*>([^<]*)</"#,
    )?;
    let option_re = patterns.get_or_compile(
        "poll_option",
        r#"(?is)class="tgme_widget_message_poll_option_text"[^>]*>([^<]*)</"#,
    )?;
    let question = question_re
        .captures(segment)
        .map(|c| html_unescape(c.get(1).unwrap().as_str()))
        .unwrap_or_default();
    let options: Vec<String> = option_re
        .captures_iter(segment)
        .map(|c| html_unescape(c.get(1).unwrap().as_str()))
        .collect();
    let mut html = format!("<p>{question}</p>");
    for opt in options {
        html += &format!("<p>{opt}</p>");
    }
    Ok(html)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns() -> PatternStore {
        PatternStore::new()
    }

    #[test]
    fn test_reject_unless_valid_page_requires_sentinel() {
        let p = patterns();
        assert!(reject_unless_valid_page(&p, "<html>nothing here</html>", "@x").is_err());
    }

    #[test]
    fn test_reject_unless_valid_page_noindex() {
        let p = patterns();
        let body = r#"<meta name="robots" content="noindex,nofollow"><div class="tgme_page_title">x</div>"#;
        assert!(reject_unless_valid_page(&p, body, "@x").is_err());
    }

    #[test]
    fn test_extract_title_prefers_og() {
        let p = patterns();
        let body = r#"<meta property="og:title" content="My Channel"><div class="tgme_page_title"><span>Other</span></div>"#;
        assert_eq!(extract_title(&p, body).unwrap(), "My Channel");
    }

    #[test]
    fn test_extract_title_falls_back_to_body() {
        let p = patterns();
        let body = r#"<div class="tgme_page_title"><span dir="auto">Body Title</span></div>"#;
        assert_eq!(extract_title(&p, body).unwrap(), "Body Title");
    }

    #[test]
    fn test_about_scam_canary_clears_about() {
        let p = patterns();
        let body = r#"<div class="tgme_page_description">This is a known scam channel</div>"#;
        let channel = ParsedId {
            username: "testchan".to_owned(),
            invite: String::new(),
            post: 0,
        };
        let info = extract_info_fields(&p, body, false, &channel).unwrap();
        assert!(info.is_scam);
        assert!(info.about.is_empty());
    }

    #[test]
    fn test_participants_exact_from_page_extra() {
        let p = patterns();
        let body = r#"<div class="tgme_page_extra">1,234 subscribers</div>"#;
        let v = extract_participants(&p, body, false).unwrap();
        assert!(v.is_exact());
    }

    #[test]
    fn test_classify_kind_channel_from_context_link() {
        let p = patterns();
        let body = r#"<a class="tgme_page_context_link" href="/s/foo">Preview</a>"#;
        let kind = classify_kind(&p, body, &Value::default()).unwrap();
        assert_eq!(kind, ChannelKind::Channel);
    }

    #[test]
    fn test_parse_message_segment_basic() {
        let p = patterns();
        let segment = r#"
            data-post="durov/123"
            <div class="tgme_widget_message_text">Hello #world</div>
            <span class="tgme_widget_message_views">1.2K</span>
            <time datetime="2024-01-02T03:04:05+00:00"></time>
        "#;
        let msg = parse_message_segment(&p, segment, chrono_tz::UTC, &HashSet::new())
            .unwrap()
            .unwrap();
        assert_eq!(msg.id, 123);
        assert_eq!(msg.text.as_deref(), Some("Hello #world"));
        assert_eq!(msg.hashtags, vec!["world".to_owned()]);
        assert!(!msg.views.is_exact());
    }

    #[test]
    fn test_parse_message_segment_skips_service_message() {
        let p = patterns();
        let segment = "service_message data-post=\"x/1\"";
        assert!(parse_message_segment(&p, segment, chrono_tz::UTC, &HashSet::new())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_strip_balanced_div_blocks_handles_nesting() {
        let html = r#"<div class="tgme_widget_message_user"><div>inner</div>tail</div>KEEP"#;
        let out = strip_balanced_div_blocks(html, "tgme_widget_message_user");
        assert_eq!(out, "KEEP");
    }

    #[test]
    fn test_extract_hashtags_skips_code_blocks() {
        let p = patterns();
        let out = extract_hashtags(&p, "real #tag <code>#nottag</code>").unwrap();
        assert_eq!(out, vec!["tag".to_owned()]);
    }
}
