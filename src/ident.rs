// Copyright (C) myl7
// SPDX-License-Identifier: Apache-2.0

//! Identifier parsing (strict/lax) and link extraction (spec.md §4.1).

use std::collections::HashSet;

use regex::Regex;

use crate::model::LinkSet;
use crate::patterns::PatternStore;

pub const RESERVED_HANDLES: &[&str] = &["joinchat", "addstickers"];

const HANDLE_BODY: &str = r"[A-Za-z][A-Za-z0-9_]{4,31}";
const INVITE_BODY: &str = r"[A-Za-z0-9_-]{16,22}";

/// Result of parsing a free-form string into a channel identity. Exactly one
/// of `username`/`invite` is non-empty on success; `post` is 0 when absent.
/// Parsing never fails — absence is encoded as empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedId {
    pub username: String,
    pub invite: String,
    pub post: u64,
}

impl ParsedId {
    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.invite.is_empty()
    }

    /// `@handle` or `+invite`, with an optional `/post` suffix.
    pub fn peer(&self) -> String {
        let base = if !self.username.is_empty() {
            format!("@{}", self.username)
        } else if !self.invite.is_empty() {
            format!("+{}", self.invite)
        } else {
            return String::new();
        };
        if self.post != 0 {
            format!("{base}/{}", self.post)
        } else {
            base
        }
    }

    /// The canonical `https://t.me/...` link form.
    pub fn link(&self) -> String {
        if !self.username.is_empty() {
            let mut l = format!("https://t.me/{}", self.username);
            if self.post != 0 {
                l += &format!("/{}", self.post);
            }
            l
        } else if !self.invite.is_empty() {
            format!("https://t.me/+{}", self.invite)
        } else {
            String::new()
        }
    }
}

fn is_reserved(handle: &str) -> bool {
    RESERVED_HANDLES
        .iter()
        .any(|r| r.eq_ignore_ascii_case(handle))
}

/// Parse the `handle.t.me` host form.
fn parse_handle_dot_tme(s: &str) -> Option<ParsedId> {
    let re = Regex::new(&format!(
        r"(?i)^(?:https?://)?({handle})\.t\.me/?(?:(\d+))?$",
        handle = HANDLE_BODY
    ))
    .unwrap();
    let caps = re.captures(s)?;
    let handle = caps.get(1)?.as_str().to_owned();
    if is_reserved(&handle) {
        return None;
    }
    let post = caps
        .get(2)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);
    Some(ParsedId {
        username: handle,
        invite: String::new(),
        post,
    })
}

fn parse_tg_scheme(s: &str) -> Option<ParsedId> {
    let re_resolve = Regex::new(&format!(
        r"(?i)^tg://resolve\?domain=({handle})(?:&.*)?$",
        handle = HANDLE_BODY
    ))
    .unwrap();
    if let Some(caps) = re_resolve.captures(s) {
        let handle = caps.get(1)?.as_str().to_owned();
        if !is_reserved(&handle) {
            return Some(ParsedId {
                username: handle,
                invite: String::new(),
                post: 0,
            });
        }
    }
    let re_join = Regex::new(&format!(r"(?i)^tg://join\?invite=({invite})$", invite = INVITE_BODY)).unwrap();
    if let Some(caps) = re_join.captures(s) {
        return Some(ParsedId {
            username: String::new(),
            invite: caps.get(1)?.as_str().to_owned(),
            post: 0,
        });
    }
    None
}

/// `t.me/...` and `telegram.me/...` forms: `/s/handle(/post)?`,
/// `/+invite`, `/joinchat/invite`, or bare `/handle(/post)?`.
fn host_pattern() -> String {
    format!(
        r"(?i)^(?:https?://)?(?:www\.)?(?:t\.me|telegram\.me)/(?:s/(?P<s_handle>{handle})(?:/(?P<s_post>\d+))?|\+(?P<plus_invite>{invite})|joinchat/(?P<jc_invite>{invite})|(?P<handle>{handle})(?:/(?P<post>\d+))?)/?$",
        handle = HANDLE_BODY,
        invite = INVITE_BODY
    )
}

fn parse_host_prefixed(s: &str) -> Option<ParsedId> {
    let re = Regex::new(&host_pattern()).ok()?;
    let caps = re.captures(s)?;

    if let Some(m) = caps.name("s_handle") {
        let handle = m.as_str().to_owned();
        if is_reserved(&handle) {
            return None;
        }
        let post = caps
            .name("s_post")
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
        return Some(ParsedId {
            username: handle,
            invite: String::new(),
            post,
        });
    }
    if let Some(m) = caps.name("plus_invite") {
        return Some(ParsedId {
            username: String::new(),
            invite: m.as_str().to_owned(),
            post: 0,
        });
    }
    if let Some(m) = caps.name("jc_invite") {
        return Some(ParsedId {
            username: String::new(),
            invite: m.as_str().to_owned(),
            post: 0,
        });
    }
    if let Some(m) = caps.name("handle") {
        let handle = m.as_str().to_owned();
        if is_reserved(&handle) {
            return None;
        }
        let post = caps
            .name("post")
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
        return Some(ParsedId {
            username: handle,
            invite: String::new(),
            post,
        });
    }
    None
}

/// Whole-string forms that are accepted in both strict and lax mode because
/// they are unambiguous identifier tokens, not scan hits inside free text:
/// `@handle(/post)?`, or a host-prefixed/`tg://` form. A bare handle with no
/// `@` and no host prefix is lax-only (see `parse_lax_scan`): strict mode
/// requires the canonical host prefix ahead of a handle/invite.
fn parse_anchored(s: &str) -> Option<ParsedId> {
    if let Some(id) = parse_tg_scheme(s) {
        return Some(id);
    }
    if let Some(id) = parse_handle_dot_tme(s) {
        return Some(id);
    }
    if let Some(id) = parse_host_prefixed(s) {
        if !id.is_empty() {
            return Some(id);
        }
    }

    let re_at = Regex::new(&format!(
        r"(?i)^@({handle})(?:/(\d+))?$",
        handle = HANDLE_BODY
    ))
    .unwrap();
    if let Some(caps) = re_at.captures(s) {
        let handle = caps.get(1)?.as_str().to_owned();
        if !is_reserved(&handle) {
            let post = caps
                .get(2)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0);
            return Some(ParsedId {
                username: handle,
                invite: String::new(),
                post,
            });
        }
    }

    None
}

/// Lax-only forms: scanned anywhere in the input rather than anchored to
/// the whole string, plus a few extra loose shapes (`+HASH`, bare
/// `joinchat/HASH`, `handle@example.com`, and a bare handle with no prefix
/// at all).
fn parse_lax_scan(s: &str) -> Option<ParsedId> {
    // Left-boundary guard matches the original's `(^|[^A-Za-z0-9_.\-/])@...`:
    // without it, the local part of `handle@example.com` would be swallowed
    // by this scan before the email-local-part check below ever runs.
    let re_at = Regex::new(&format!(
        r"(?i)(?:^|[^A-Za-z0-9_./-])@({handle})(?:/(\d+))?",
        handle = HANDLE_BODY
    ))
    .unwrap();
    if let Some(caps) = re_at.captures(s) {
        let handle = caps.get(1).unwrap().as_str().to_owned();
        if !is_reserved(&handle) {
            let post = caps
                .get(2)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0);
            return Some(ParsedId {
                username: handle,
                invite: String::new(),
                post,
            });
        }
    }

    let re_plus = Regex::new(&format!(r"\+({invite})", invite = INVITE_BODY)).unwrap();
    if let Some(caps) = re_plus.captures(s) {
        return Some(ParsedId {
            username: String::new(),
            invite: caps.get(1).unwrap().as_str().to_owned(),
            post: 0,
        });
    }

    let re_jc = Regex::new(&format!(r"(?i)joinchat/({invite})", invite = INVITE_BODY)).unwrap();
    if let Some(caps) = re_jc.captures(s) {
        return Some(ParsedId {
            username: String::new(),
            invite: caps.get(1).unwrap().as_str().to_owned(),
            post: 0,
        });
    }

    let re_email_like = Regex::new(&format!(
        r"(?i)({handle})@[A-Za-z0-9.-]+\.[A-Za-z]{{2,}}",
        handle = HANDLE_BODY
    ))
    .unwrap();
    if let Some(caps) = re_email_like.captures(s) {
        let handle = caps.get(1).unwrap().as_str().to_owned();
        if !is_reserved(&handle) {
            return Some(ParsedId {
                username: handle,
                invite: String::new(),
                post: 0,
            });
        }
    }

    let re_bare = Regex::new(&format!(r"(?i)^{handle}$", handle = HANDLE_BODY)).unwrap();
    if re_bare.is_match(s) && !is_reserved(s) {
        return Some(ParsedId {
            username: s.to_owned(),
            invite: String::new(),
            post: 0,
        });
    }

    None
}

/// Canonicalize a free-form string into `(username, invite, post)`. Never
/// fails; absence is encoded as empty strings / zero post.
pub fn username(s: &str, strict: bool) -> ParsedId {
    let s = s.trim();
    if let Some(id) = parse_anchored(s) {
        return id;
    }
    if !strict {
        if let Some(id) = parse_lax_scan(s) {
            return id;
        }
    }
    ParsedId::default()
}

/// Scan HTML or plain text and return every recognized link: `<a>` tags,
/// bare absolute URLs, emails, `@handles`, and t.me URLs, each with its
/// optional caption and post id.
pub fn extract_links(store: &PatternStore, text: &str, strict: bool) -> anyhow::Result<LinkSet> {
    let mut set = LinkSet::new();

    let anchor_re = store.get_or_compile(
        "ident_anchor",
        r#"(?is)<a[^>]*href="([^"]+)"[^>]*>(.*?)</a>"#,
    )?;
    let mut consumed: Vec<(usize, usize)> = Vec::new();
    for caps in anchor_re.captures_iter(text) {
        let m = caps.get(0).unwrap();
        consumed.push((m.start(), m.end()));
        let href = caps.get(1).unwrap().as_str();
        let caption_html = caps.get(2).unwrap().as_str();
        let caption = strip_tags(caption_html);
        insert_resolved(&mut set, href, Some(&caption));
    }

    let url_pattern = if strict {
        r"https?://[^\s<>\x22']+"
    } else {
        r"(?:https?://)?(?:www\.)?[A-Za-z0-9.-]+\.[A-Za-z]{2,}(?:/[^\s<>\x22']*)?"
    };
    let url_re = store.get_or_compile("ident_bare_url", url_pattern)?;
    for m in url_re.find_iter(text) {
        if consumed.iter().any(|(s, e)| m.start() >= *s && m.end() <= *e) {
            continue;
        }
        insert_resolved(&mut set, m.as_str(), None);
    }

    let email_re =
        store.get_or_compile("ident_email", r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}")?;
    for m in email_re.find_iter(text) {
        set.add(m.as_str(), None, None);
    }

    let at_re = store.get_or_compile(
        "ident_at_handle",
        &format!(r"@({handle})(?:/(\d+))?", handle = HANDLE_BODY),
    )?;
    for caps in at_re.captures_iter(text) {
        let handle = caps.get(1).unwrap().as_str();
        if is_reserved(handle) {
            continue;
        }
        let post: u64 = caps
            .get(2)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
        let id = ParsedId {
            username: handle.to_owned(),
            invite: String::new(),
            post,
        };
        set.add(&id.link(), None, if post != 0 { Some(post) } else { None });
    }

    Ok(set)
}

fn insert_resolved(set: &mut LinkSet, href: &str, caption: Option<&str>) {
    let id = username(href, false);
    if !id.is_empty() {
        let post = if id.post != 0 { Some(id.post) } else { None };
        set.add(&id.link(), caption, post);
    } else {
        set.add(href, caption, None);
    }
}

fn strip_tags(s: &str) -> String {
    let re = Regex::new(r"<[^>]+>").unwrap();
    re.replace_all(s, "").trim().to_owned()
}

/// Derive the subset of `links` that are "advertising" links: handle/invite
/// links that are neither the channel itself nor a listed sibling.
pub fn advertisement_filter(
    links: &LinkSet,
    channel: &ParsedId,
    siblings: &HashSet<String>,
) -> LinkSet {
    let mut out = LinkSet::new();
    let self_key = canonical_handle_key(channel);

    for (key, link) in links.iter() {
        let url_id = username(&link.url, false);
        if url_id.is_empty() {
            continue;
        }
        let url_key = canonical_handle_key(&url_id);
        if Some(&url_key) == self_key.as_ref() || siblings.contains(&url_key) {
            continue;
        }

        let mut new_captions = link.captions.clone();
        let mut new_post_ids = link.post_ids.clone();
        for caption in &link.captions {
            let cap_id = username(caption, false);
            if !cap_id.is_empty() {
                let cap_key = canonical_handle_key(&cap_id);
                if cap_key == url_key {
                    new_captions.retain(|c| c != caption);
                }
                if cap_id.post != 0 && link.post_ids.is_empty() {
                    new_post_ids.push(cap_id.post);
                }
            }
        }

        out.add(&link.url, None, None);
        if let Some(entry) = out.get_mut(&link.url) {
            entry.captions = new_captions;
            entry.post_ids = new_post_ids;
            entry.pos = link.pos;
            entry.count = link.count;
        }
        let _ = key;
    }
    out
}

fn canonical_handle_key(id: &ParsedId) -> Option<String> {
    if !id.username.is_empty() {
        Some(id.username.to_lowercase())
    } else if !id.invite.is_empty() {
        Some(id.invite.clone())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_username_at_with_post_strict() {
        let id = username("@username/100", true);
        assert_eq!(id.username, "username");
        assert_eq!(id.invite, "");
        assert_eq!(id.post, 100);
    }

    #[test]
    fn test_username_tg_join_invite_lax() {
        let id = username("tg://join?invite=abc4_fGhI0-LmnOp", false);
        assert_eq!(id.username, "");
        assert_eq!(id.invite, "abc4_fGhI0-LmnOp");
        assert_eq!(id.post, 0);
    }

    #[test]
    fn test_username_host_prefixed() {
        let id = username("https://t.me/durov", true);
        assert_eq!(id.username, "durov");
    }

    #[test]
    fn test_username_reserved_handle_rejected() {
        let id = username("t.me/joinchat", true);
        assert!(id.is_empty());
    }

    #[test]
    fn test_username_lax_bare_plus_hash() {
        let id = username("join here: +abc4fGhI0LmnOpQrS12", false);
        assert_eq!(id.invite, "abc4fGhI0LmnOpQrS12");
    }

    #[test]
    fn test_username_strict_rejects_bare_invite_in_text() {
        let id = username("check +abc4fGhI0LmnOpQrS12 out", true);
        assert!(id.is_empty());
    }

    #[test]
    fn test_username_strict_rejects_bare_handle() {
        let id = username("durov", true);
        assert!(id.is_empty());
    }

    #[test]
    fn test_username_lax_accepts_bare_handle() {
        let id = username("durov", false);
        assert_eq!(id.username, "durov");
    }

    #[test]
    fn test_username_lax_email_local_part() {
        let id = username("handle@example.com", false);
        assert_eq!(id.username, "handle");
        assert_eq!(id.invite, "");
    }

    #[test]
    fn test_link_key_roundtrip_username() {
        let id = username("@foo", true);
        let peer = id.peer();
        let id2 = username(&peer, true);
        assert_eq!(id.username, id2.username);
        let link = id.link();
        let id3 = username(&link, true);
        assert_eq!(id.username, id3.username);
    }
}
