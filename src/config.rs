// src/config.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheStore, FileStore};
use crate::capability::InferenceRules;
use crate::engine::EngineOptions;

pub const ENV_CONFIG_PATH: &str = "DISCOVERY_CONFIG_PATH";

fn default_discovery_window_secs() -> u64 {
    15
}
fn default_monitor_window_secs() -> u64 {
    8
}
fn default_cache_ttl_secs() -> u64 {
    6 * 3600
}
fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache/discovery")
}
fn default_listen_addr() -> String {
    "127.0.0.1:8000".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Relays asked for discovery and monitor records.
    #[serde(default)]
    pub bootstrap_relays: Vec<String>,
    /// Monitors whose reports are believed; empty = all.
    #[serde(default)]
    pub trusted_monitors: Vec<String>,
    #[serde(default = "default_discovery_window_secs")]
    pub discovery_window_secs: u64,
    #[serde(default = "default_monitor_window_secs")]
    pub monitor_window_secs: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Optional TOML/JSON file replacing the built-in capability inference rules.
    #[serde(default)]
    pub inference_rules_path: Option<PathBuf>,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// JSON array of raw records served by the binary's fixture transport.
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bootstrap_relays: Vec::new(),
            trusted_monitors: Vec::new(),
            discovery_window_secs: default_discovery_window_secs(),
            monitor_window_secs: default_monitor_window_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_dir: default_cache_dir(),
            inference_rules_path: None,
            listen_addr: default_listen_addr(),
            fixture_path: None,
        }
    }
}

impl EngineConfig {
    /// Load config from an explicit path. Supports TOML or JSON formats.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading discovery config from {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        parse_config(&content, ext.as_str()).map(EngineConfig::cleaned)
    }

    /// Load config using env var + fallbacks:
    /// 1) $DISCOVERY_CONFIG_PATH
    /// 2) config/discovery.toml
    /// 3) config/discovery.json
    /// 4) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            } else {
                return Err(anyhow!("DISCOVERY_CONFIG_PATH points to non-existent path"));
            }
        }
        let toml_p = PathBuf::from("config/discovery.toml");
        if toml_p.exists() {
            return Self::load_from(&toml_p);
        }
        let json_p = PathBuf::from("config/discovery.json");
        if json_p.exists() {
            return Self::load_from(&json_p);
        }
        Ok(Self::default())
    }

    pub fn engine_options(&self) -> EngineOptions {
        let rules = match &self.inference_rules_path {
            Some(p) => InferenceRules::load_from_file(p),
            None => InferenceRules::default_seed(),
        };
        EngineOptions {
            discovery_window: Duration::from_secs(self.discovery_window_secs),
            monitor_window: Duration::from_secs(self.monitor_window_secs),
            rules,
        }
    }

    pub fn cache_store(&self) -> CacheStore {
        CacheStore::new(
            Arc::new(FileStore::new(self.cache_dir.clone())),
            Duration::from_secs(self.cache_ttl_secs),
        )
    }

    /// Trim, drop blanks and duplicates, keep first-seen order.
    fn cleaned(mut self) -> Self {
        self.bootstrap_relays = clean_list(std::mem::take(&mut self.bootstrap_relays));
        self.trusted_monitors = clean_list(std::mem::take(&mut self.trusted_monitors));
        self
    }
}

fn parse_config(s: &str, hint_ext: &str) -> Result<EngineConfig> {
    if hint_ext == "toml" {
        if let Ok(v) = toml::from_str(s) {
            return Ok(v);
        }
    }
    if let Ok(v) = serde_json::from_str(s) {
        return Ok(v);
    }
    if hint_ext != "toml" {
        if let Ok(v) = toml::from_str(s) {
            return Ok(v);
        }
    }
    Err(anyhow!("unsupported discovery config format"))
}

fn clean_list(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for it in items {
        let t = it.trim();
        if !t.is_empty() && !out.iter().any(|o| o == t) {
            out.push(t.to_string());
        }
    }
    out
}
