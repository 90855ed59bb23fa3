// src/record.rs
//! Wire-side record shapes as delivered by the subscription collaborator.
//!
//! Records are loosely typed: a kind number, the announcing key, a timestamp, an
//! ordered list of string tags and a free-text content blob. The parser turns them
//! into typed reports; nothing here interprets tag names.

use serde::{Deserialize, Serialize};

/// Relay discovery report published by a monitor about one relay.
pub const RELAY_DISCOVERY_KIND: u16 = 30166;
/// Monitor self-description.
pub const MONITOR_ANNOUNCEMENT_KIND: u16 = 10166;

/// One tag: `[name, value, extra...]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(pub Vec<String>);

impl Tag {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    pub fn name(&self) -> Option<&str> {
        self.get(0)
    }

    pub fn value(&self) -> Option<&str> {
        self.get(1)
    }

    /// Positional access; `None` past the end.
    pub fn get(&self, idx: usize) -> Option<&str> {
        self.0.get(idx).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub kind: u16,
    /// Identity of the announcing party (hex pubkey).
    pub pubkey: String,
    /// Unix seconds.
    pub created_at: u64,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub content: String,
}

impl RawRecord {
    /// First tag carrying `name`.
    pub fn first_tag(&self, name: &str) -> Option<&Tag> {
        self.tags.iter().find(|t| t.name() == Some(name))
    }

    pub fn tags_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Tag> + 'a {
        self.tags.iter().filter(move |t| t.name() == Some(name))
    }
}

/// Which records a subscription should deliver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFilter {
    pub kinds: Vec<u16>,
    /// Restrict to these announcing parties; empty = anyone.
    #[serde(default)]
    pub authors: Vec<String>,
}

impl RecordFilter {
    pub fn kinds(kinds: &[u16]) -> Self {
        Self {
            kinds: kinds.to_vec(),
            authors: Vec::new(),
        }
    }

    pub fn with_authors(mut self, authors: &[String]) -> Self {
        self.authors = authors.to_vec();
        self
    }

    pub fn matches(&self, rec: &RawRecord) -> bool {
        let kind_ok = self.kinds.is_empty() || self.kinds.contains(&rec.kind);
        let author_ok = self.authors.is_empty() || self.authors.iter().any(|a| a == &rec.pubkey);
        kind_ok && author_ok
    }
}
