// Copyright (C) myl7
// SPDX-License-Identifier: Apache-2.0

//! The channel/message/link-set data model (spec.md §3).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::value::Value;

/// A normalized key for a [`Link`]: lowercased, query-stripped,
/// protocol-stripped, trailing-slash-stripped, truncated to 32 bytes.
///
/// Invariant: two URLs differing only in query, case, or protocol collapse
/// to the same key.
pub fn link_key(url: &str) -> String {
    let mut s = url.trim();
    for prefix in ["https://", "http://"] {
        if let Some(rest) = s.strip_prefix(prefix) {
            s = rest;
            break;
        }
    }
    let s = s.split(['?', '#']).next().unwrap_or("");
    let s = s.strip_suffix('/').unwrap_or(s);
    let s = s.to_lowercase();
    let bytes = s.as_bytes();
    let cut = bytes.len().min(32);
    // Truncate on a byte boundary without splitting a UTF-8 codepoint.
    let mut cut = cut;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s[..cut].to_owned()
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Link {
    pub url: String,
    /// Multiset of observed captions (captions shorter than 3 chars, or
    /// equal to the URL, are discarded at insertion time).
    pub captions: Vec<String>,
    /// Multiset of observed post ids.
    pub post_ids: Vec<u64>,
    /// 1-based insertion position.
    pub pos: usize,
    pub count: u64,
}

/// Mapping from a normalized key to a [`Link`] entry. Iteration order is
/// unspecified; insertion order is tracked via `pos` on each entry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkSet {
    entries: HashMap<String, Link>,
}

impl LinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, url: &str) -> Option<&Link> {
        self.entries.get(&link_key(url))
    }

    pub fn get_mut(&mut self, url: &str) -> Option<&mut Link> {
        self.entries.get_mut(&link_key(url))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Link)> {
        self.entries.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &Link> {
        self.entries.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn remove(&mut self, url: &str) -> Option<Link> {
        self.entries.remove(&link_key(url))
    }

    /// Look up by an already-normalized key (as yielded by [`Self::iter`]),
    /// skipping re-normalization.
    pub fn get_by_key(&self, key: &str) -> Option<&Link> {
        self.entries.get(key)
    }

    pub fn remove_by_key(&mut self, key: &str) -> Option<Link> {
        self.entries.remove(key)
    }

    /// Insert a fully-formed entry under its own normalized key, used when
    /// promoting a [`Link`] wholesale from one set into another.
    pub fn insert_link(&mut self, link: Link) {
        let key = link_key(&link.url);
        self.entries.insert(key, link);
    }

    /// Add an observed occurrence of `url`, with an optional caption and
    /// post id. Captions shorter than 3 characters, or equal to the URL,
    /// are discarded rather than recorded.
    pub fn add(&mut self, url: &str, caption: Option<&str>, post_id: Option<u64>) {
        let key = link_key(url);
        let next_pos = self.entries.len() + 1;
        let entry = self.entries.entry(key).or_insert_with(|| Link {
            url: url.to_owned(),
            captions: Vec::new(),
            post_ids: Vec::new(),
            pos: next_pos,
            count: 0,
        });
        entry.count += 1;
        if let Some(c) = caption {
            if c.len() >= 3 && c != url {
                entry.captions.push(c.to_owned());
            }
        }
        if let Some(id) = post_id {
            entry.post_ids.push(id);
        }
    }

    /// Empties the set in place. Unlike the teacher-language original (which
    /// replaced the backing map, stranding external holders of the old map
    /// on stale data), this truly empties so any outstanding reference sees
    /// the clear.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl FromIterator<(String, Link)> for LinkSet {
    fn from_iter<T: IntoIterator<Item = (String, Link)>>(iter: T) -> Self {
        Self {
            entries: HashMap::from_iter(iter),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Channel,
    Private,
    Bot,
    User,
    Chat,
}

impl Default for ChannelKind {
    fn default() -> Self {
        ChannelKind::Chat
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelRecord {
    /// Exactly one of `username`/`invite` is non-empty.
    pub username: String,
    pub invite: String,
    pub peer: String,
    pub link: String,
    pub kind: ChannelKind,
    pub title: String,
    pub about: String,
    pub image: String,
    pub participants: Value,
    pub photos: Value,
    pub videos: Value,
    pub files: Value,
    pub links: Value,
    pub is_verified: bool,
    pub is_scam: bool,
    pub contacts: LinkSet,
    pub siblings: LinkSet,
    pub messages: Vec<MessageRecord>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Forwarded {
    pub forwarded: bool,
    pub fwd_link: String,
    pub fwd_post: u64,
    pub fwd_title: String,
    pub fwd_author: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Attachment {
    pub kind: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    /// Unique within channel, positive.
    pub id: u64,
    pub html: String,
    pub text: Option<String>,
    pub fwd: Forwarded,
    pub edited: bool,
    pub poll: bool,
    pub has_image: bool,
    pub has_video: bool,
    pub has_document: bool,
    pub attachments: Vec<Attachment>,
    pub hashtags: Vec<String>,
    pub links: LinkSet,
    pub advs: LinkSet,
    pub buttons: Option<LinkSet>,
    pub views: Value,
    pub date: DateTime<Utc>,
    #[serde(serialize_with = "serialize_date_local")]
    pub date_local: DateTime<chrono_tz::Tz>,
}

/// `chrono`'s blanket `Serialize` impl for `DateTime<Tz>` is not guaranteed
/// to cover arbitrary `chrono_tz::Tz` offsets, so format explicitly instead
/// of leaning on `#[derive(Serialize)]` to find one.
fn serialize_date_local<S>(dt: &DateTime<chrono_tz::Tz>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&dt.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_key_collapses_case_protocol_slash_query() {
        let a = link_key("https://Example.com/Path/?q=1");
        let b = link_key("http://example.com/path?q=2");
        let c = link_key("example.com/path/");
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn test_link_key_truncates_to_32_bytes() {
        let long = "a".repeat(100);
        assert_eq!(link_key(&long).len(), 32);
    }

    #[test]
    fn test_link_set_add_discards_short_and_self_captions() {
        let mut set = LinkSet::new();
        set.add("https://t.me/foo", Some("ab"), None);
        set.add("https://t.me/foo", Some("https://t.me/foo"), None);
        set.add("https://t.me/foo", Some("Foo Channel"), None);
        let link = set.get("https://t.me/foo").unwrap();
        assert_eq!(link.captions, vec!["Foo Channel".to_owned()]);
        assert_eq!(link.count, 3);
    }

    #[test]
    fn test_link_set_clear_truly_empties() {
        let mut set = LinkSet::new();
        set.add("https://t.me/foo", None, None);
        set.clear();
        assert!(set.is_empty());
    }
}
