// src/parser.rs
//! Record parser: raw tagged records → typed reports.
//!
//! Pure functions. Anything structurally incomplete yields `None`, unknown tags are
//! skipped, and numeric values that do not parse are dropped silently.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::capability::Capability;
use crate::record::{RawRecord, Tag, MONITOR_ANNOUNCEMENT_KIND, RELAY_DISCOVERY_KIND};

/// Default monitor publishing interval when no `frequency` tag is present.
pub const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 3600;

/// One monitor's claim about one relay at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryReport {
    /// Relay address as published (not yet normalized).
    pub resource_key: String,
    pub reporter_id: String,
    /// Unix seconds.
    pub observed_at: u64,
    pub capability_tags: BTreeSet<Capability>,
    pub supported_feature_ids: BTreeSet<u32>,
    pub requirements: BTreeSet<String>,
    pub network: Option<String>,
    pub rtt_open_ms: Option<u64>,
    pub rtt_read_ms: Option<u64>,
    pub rtt_write_ms: Option<u64>,
    pub topics: BTreeSet<String>,
    pub geohash: Option<String>,
    /// Relay information document carried in the record content.
    pub embedded_metadata_json: Option<String>,
    pub country_code: Option<String>,
    pub isp: Option<String>,
    pub as_number: Option<String>,
    pub as_name: Option<String>,
}

/// A monitor describing itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorAnnouncement {
    pub reporter_id: String,
    pub interval_seconds: u64,
    pub check_kinds: BTreeSet<String>,
    pub per_check_timeout_ms: BTreeMap<String, u64>,
    pub geohash: Option<String>,
    /// Unix seconds; used to keep the newest announcement per monitor.
    pub created_at: u64,
}

enum LabelSlot {
    CountryCode,
    Isp,
    AsNumber,
    AsName,
}

fn label_slot(namespace: &str) -> Option<LabelSlot> {
    match namespace.trim() {
        "countryCode" | "ISO-3166-1" | "country" => Some(LabelSlot::CountryCode),
        "isp" | "host.isp" => Some(LabelSlot::Isp),
        "asn" | "host.asn" => Some(LabelSlot::AsNumber),
        "asName" | "host.as" => Some(LabelSlot::AsName),
        _ => None,
    }
}

/// Trimmed, non-empty tag value.
fn non_blank(v: Option<&str>) -> Option<String> {
    v.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

fn parse_ms(tag: &Tag) -> Option<u64> {
    tag.value().and_then(|v| v.trim().parse::<u64>().ok())
}

/// Parse a relay discovery record. `None` when the kind is wrong or the `d` tag
/// (the relay address) is missing or blank.
pub fn parse_discovery_report(rec: &RawRecord) -> Option<DiscoveryReport> {
    if rec.kind != RELAY_DISCOVERY_KIND {
        return None;
    }
    let resource_key = non_blank(rec.first_tag("d").and_then(Tag::value))?;

    let mut rep = DiscoveryReport {
        resource_key,
        reporter_id: rec.pubkey.clone(),
        observed_at: rec.created_at,
        ..Default::default()
    };

    for tag in &rec.tags {
        let Some(name) = tag.name() else { continue };
        match name {
            "n" => {
                if rep.network.is_none() {
                    rep.network = non_blank(tag.value());
                }
            }
            "T" => {
                if let Some(cap) = tag.value().and_then(Capability::parse) {
                    rep.capability_tags.insert(cap);
                }
            }
            "N" => {
                if let Some(id) = tag.value().and_then(|v| v.trim().parse::<u32>().ok()) {
                    rep.supported_feature_ids.insert(id);
                }
            }
            "R" => {
                if let Some(r) = non_blank(tag.value()) {
                    rep.requirements.insert(r);
                }
            }
            "t" => {
                if let Some(t) = non_blank(tag.value()) {
                    rep.topics.insert(t);
                }
            }
            "g" => {
                if rep.geohash.is_none() {
                    rep.geohash = non_blank(tag.value());
                }
            }
            "rtt-open" => rep.rtt_open_ms = parse_ms(tag).or(rep.rtt_open_ms),
            "rtt-read" => rep.rtt_read_ms = parse_ms(tag).or(rep.rtt_read_ms),
            "rtt-write" => rep.rtt_write_ms = parse_ms(tag).or(rep.rtt_write_ms),
            "l" => {
                let (Some(value), Some(slot)) =
                    (non_blank(tag.value()), tag.get(2).and_then(label_slot))
                else {
                    continue;
                };
                match slot {
                    LabelSlot::CountryCode => rep.country_code = Some(value.to_ascii_uppercase()),
                    LabelSlot::Isp => rep.isp = Some(value),
                    LabelSlot::AsNumber => rep.as_number = Some(value),
                    LabelSlot::AsName => rep.as_name = Some(value),
                }
            }
            _ => {}
        }
    }

    if !rec.content.trim().is_empty() {
        rep.embedded_metadata_json = Some(rec.content.clone());
    }

    Some(rep)
}

/// Parse a monitor announcement. `None` when the kind is wrong or the reporter is blank.
pub fn parse_monitor_announcement(rec: &RawRecord) -> Option<MonitorAnnouncement> {
    if rec.kind != MONITOR_ANNOUNCEMENT_KIND {
        return None;
    }
    let reporter_id = non_blank(Some(rec.pubkey.as_str()))?;

    let mut ann = MonitorAnnouncement {
        reporter_id,
        interval_seconds: DEFAULT_MONITOR_INTERVAL_SECS,
        check_kinds: BTreeSet::new(),
        per_check_timeout_ms: BTreeMap::new(),
        geohash: None,
        created_at: rec.created_at,
    };

    for tag in &rec.tags {
        match tag.name() {
            Some("frequency") => {
                if let Some(secs) = tag.value().and_then(|v| v.trim().parse::<u64>().ok()) {
                    ann.interval_seconds = secs;
                }
            }
            Some("c") => {
                if let Some(c) = non_blank(tag.value()) {
                    ann.check_kinds.insert(c);
                }
            }
            Some("timeout") => {
                // ["timeout", check, ms] or ["timeout", ms]
                let (check, ms) = match tag.len() {
                    2 => ("default".to_string(), tag.get(1)),
                    _ => match non_blank(tag.get(1)) {
                        Some(check) => (check, tag.get(2)),
                        None => continue,
                    },
                };
                if let Some(ms) = ms.and_then(|v| v.trim().parse::<u64>().ok()) {
                    ann.per_check_timeout_ms.insert(check, ms);
                }
            }
            Some("g") => {
                if ann.geohash.is_none() {
                    ann.geohash = non_blank(tag.value());
                }
            }
            _ => {}
        }
    }

    Some(ann)
}

/// Keep the newest announcement per monitor, ordered by reporter id.
pub fn dedup_monitors(anns: Vec<MonitorAnnouncement>) -> Vec<MonitorAnnouncement> {
    let mut by_reporter: BTreeMap<String, MonitorAnnouncement> = BTreeMap::new();
    for ann in anns {
        match by_reporter.get(&ann.reporter_id) {
            Some(prev) if prev.created_at >= ann.created_at => {}
            _ => {
                by_reporter.insert(ann.reporter_id.clone(), ann);
            }
        }
    }
    by_reporter.into_values().collect()
}
