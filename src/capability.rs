//! # Capabilities
//!
//! Relay classification (`T` tags on discovery reports) and the heuristic rules that
//! infer a classification from supported NIPs when no reporter supplied one.
//!
//! - Parsing is tolerant: `PublicOutbox`, `public_outbox`, `PUBLIC-OUTBOX` are the same.
//! - Inference rules are plain configuration data (TOML/JSON) with a built-in seed.
//! - Every rule that fires contributes; the fallback only applies when none fired.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::{fmt, fs, path::Path, str::FromStr};

/// Relay classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Capability {
    PublicOutbox,
    PublicInbox,
    PrivateInbox,
    PrivateStorage,
    Search,
    Directory,
    Community,
    Algo,
    Archival,
    LocalCache,
    Blob,
    Broadcast,
    Proxy,
    Trusted,
    PayToRelay,
}

impl Capability {
    pub const ALL: [Capability; 15] = [
        Capability::PublicOutbox,
        Capability::PublicInbox,
        Capability::PrivateInbox,
        Capability::PrivateStorage,
        Capability::Search,
        Capability::Directory,
        Capability::Community,
        Capability::Algo,
        Capability::Archival,
        Capability::LocalCache,
        Capability::Blob,
        Capability::Broadcast,
        Capability::Proxy,
        Capability::Trusted,
        Capability::PayToRelay,
    ];

    /// Canonical tag spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::PublicOutbox => "PublicOutbox",
            Capability::PublicInbox => "PublicInbox",
            Capability::PrivateInbox => "PrivateInbox",
            Capability::PrivateStorage => "PrivateStorage",
            Capability::Search => "Search",
            Capability::Directory => "Directory",
            Capability::Community => "Community",
            Capability::Algo => "Algo",
            Capability::Archival => "Archival",
            Capability::LocalCache => "LocalCache",
            Capability::Blob => "Blob",
            Capability::Broadcast => "Broadcast",
            Capability::Proxy => "Proxy",
            Capability::Trusted => "Trusted",
            Capability::PayToRelay => "PayToRelay",
        }
    }

    /// Lenient parse; `None` for unknown tags so callers can skip them.
    pub fn parse(raw: &str) -> Option<Self> {
        let folded: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        if folded.is_empty() {
            return None;
        }
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str().eq_ignore_ascii_case(&folded))
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| anyhow::anyhow!("unknown capability: {s}"))
    }
}

/// NIP numbers the built-in rules refer to.
pub mod nips {
    pub const BASIC_PROTOCOL: u32 = 1;
    pub const ENCRYPTED_DM: u32 = 4;
    pub const GIFT_WRAPPED_DM: u32 = 17;
    pub const SEARCH: u32 = 50;
    pub const RELAY_LIST: u32 = 65;
    pub const FILE_STORAGE: u32 = 96;
}

/// `implies` holds when every id in `requires_all` is present and, if `requires_any`
/// is non-empty, at least one of those is present too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceRule {
    #[serde(default)]
    pub requires_all: Vec<u32>,
    #[serde(default)]
    pub requires_any: Vec<u32>,
    pub implies: Capability,
}

impl InferenceRule {
    pub fn fires(&self, ids: &BTreeSet<u32>) -> bool {
        // A rule without conditions would classify everything.
        if self.requires_all.is_empty() && self.requires_any.is_empty() {
            return false;
        }
        let all_ok = self.requires_all.iter().all(|n| ids.contains(n));
        let any_ok = self.requires_any.is_empty() || self.requires_any.iter().any(|n| ids.contains(n));
        all_ok && any_ok
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceRules {
    #[serde(default)]
    pub rules: Vec<InferenceRule>,
    #[serde(default)]
    pub fallback: Option<InferenceRule>,
}

impl Default for InferenceRules {
    fn default() -> Self {
        Self::default_seed()
    }
}

impl InferenceRules {
    /// Load rules from a TOML or JSON file (by extension, JSON tried as a second chance).
    /// Falls back to `default_seed()` on any error.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match Self::try_load(path) {
            Ok(rules) => rules,
            Err(e) => {
                tracing::warn!(
                    target: "discovery",
                    error = %e,
                    path = %path.display(),
                    "inference rules unreadable, using built-in seed"
                );
                Self::default_seed()
            }
        }
    }

    fn try_load(path: &Path) -> anyhow::Result<Self> {
        let s = fs::read_to_string(path)?;
        let is_toml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("toml"));
        if is_toml {
            if let Ok(v) = toml::from_str(&s) {
                return Ok(v);
            }
        }
        Ok(serde_json::from_str(&s)?)
    }

    /// Built-in mapping from supported NIPs to capabilities.
    pub fn default_seed() -> Self {
        use nips::*;
        let rule = |all: &[u32], any: &[u32], implies| InferenceRule {
            requires_all: all.to_vec(),
            requires_any: any.to_vec(),
            implies,
        };
        Self {
            rules: vec![
                rule(&[SEARCH], &[], Capability::Search),
                rule(&[RELAY_LIST, BASIC_PROTOCOL], &[], Capability::PublicOutbox),
                rule(&[], &[ENCRYPTED_DM, GIFT_WRAPPED_DM], Capability::PublicInbox),
                rule(&[FILE_STORAGE], &[], Capability::Blob),
            ],
            fallback: Some(rule(&[BASIC_PROTOCOL], &[], Capability::PublicOutbox)),
        }
    }

    /// Capabilities implied by `ids`. Empty when nothing applies.
    pub fn infer(&self, ids: &BTreeSet<u32>) -> BTreeSet<Capability> {
        let mut out: BTreeSet<Capability> = self
            .rules
            .iter()
            .filter(|r| r.fires(ids))
            .map(|r| r.implies)
            .collect();
        if out.is_empty() {
            if let Some(fb) = self.fallback.as_ref().filter(|fb| fb.fires(ids)) {
                out.insert(fb.implies);
            }
        }
        out
    }
}
