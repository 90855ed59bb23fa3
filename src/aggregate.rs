//! # Aggregator
//! Folds discovery reports into one canonical record per relay.
//! Pure and deterministic over its input list; no I/O.
//!
//! Policy: set-valued fields are exact unions, round-trip times are integer means over
//! the reports that supplied them, scalar fields take the first non-empty value in
//! input order, and the embedded relay document is read from the first report carrying
//! one. Capability tags are inferred from supported NIPs only when no report tagged any.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::capability::{Capability, InferenceRules};
use crate::parser::DiscoveryReport;

/// Merged view of one relay across all reporting monitors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayAggregate {
    /// Normalized relay address.
    pub key: String,
    pub capabilities: BTreeSet<Capability>,
    pub feature_ids: BTreeSet<u32>,
    pub requirements: BTreeSet<String>,
    pub network: Option<String>,
    pub avg_open_ms: Option<u64>,
    pub avg_read_ms: Option<u64>,
    pub avg_write_ms: Option<u64>,
    pub topics: BTreeSet<String>,
    pub reporter_count: usize,
    /// Unix seconds of the newest report.
    pub last_seen_at: u64,
    pub software: Option<String>,
    pub version: Option<String>,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub icon_url: Option<String>,
    pub banner_url: Option<String>,
    pub payment_required: bool,
    pub auth_required: bool,
    pub restricted_writes: bool,
    pub has_embedded_metadata: bool,
    pub operator_id: Option<String>,
    pub country_code: Option<String>,
    pub isp: Option<String>,
    pub geohash: Option<String>,
    pub as_number: Option<String>,
    pub as_name: Option<String>,
    pub reporter_ids: BTreeSet<String>,
}

impl RelayAggregate {
    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }
}

/// Canonical relay key: trimmed, one trailing `/` stripped, lowercased.
/// Empty when the input is blank.
pub fn normalize_key(raw: &str) -> String {
    let t = raw.trim();
    let t = t.strip_suffix('/').unwrap_or(t);
    t.to_lowercase()
}

/// Subset of the relay information document (NIP-11) the registry keeps.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RelayDocument {
    name: Option<String>,
    description: Option<String>,
    icon: Option<String>,
    banner: Option<String>,
    software: Option<String>,
    version: Option<String>,
    pubkey: Option<String>,
    supported_nips: Vec<serde_json::Value>,
    limitation: Option<Limitation>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Limitation {
    payment_required: Option<bool>,
    auth_required: Option<bool>,
    restricted_writes: Option<bool>,
}

/// Fields lifted out of an embedded relay document.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EmbeddedMetadata {
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub icon_url: Option<String>,
    pub banner_url: Option<String>,
    pub software: Option<String>,
    pub version: Option<String>,
    pub operator_id: Option<String>,
    pub payment_required: bool,
    pub auth_required: bool,
    pub restricted_writes: bool,
    pub feature_ids: BTreeSet<u32>,
}

fn clean(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Parse an embedded relay document. `None` if it is not a JSON object of the
/// expected shape. `supported_nips` accepts numbers and numeric strings.
pub fn parse_embedded_metadata(json: &str) -> Option<EmbeddedMetadata> {
    let doc: RelayDocument = serde_json::from_str(json).ok()?;
    let feature_ids = doc
        .supported_nips
        .iter()
        .filter_map(|v| match v {
            serde_json::Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            serde_json::Value::String(s) => s.trim().parse::<u32>().ok(),
            _ => None,
        })
        .collect();
    let lim = doc.limitation.unwrap_or_default();
    Some(EmbeddedMetadata {
        display_name: clean(doc.name),
        description: clean(doc.description),
        icon_url: clean(doc.icon),
        banner_url: clean(doc.banner),
        software: clean(doc.software),
        version: clean(doc.version),
        operator_id: clean(doc.pubkey),
        payment_required: lim.payment_required.unwrap_or(false),
        auth_required: lim.auth_required.unwrap_or(false),
        restricted_writes: lim.restricted_writes.unwrap_or(false),
        feature_ids,
    })
}

fn mean(values: impl Iterator<Item = u64>) -> Option<u64> {
    let (sum, n) = values.fold((0u128, 0u128), |(s, n), v| (s + v as u128, n + 1));
    if n == 0 {
        None
    } else {
        u64::try_from(sum / n).ok()
    }
}

fn first_some<'a, F>(group: &[&'a DiscoveryReport], pick: F) -> Option<String>
where
    F: Fn(&'a DiscoveryReport) -> Option<&'a String>,
{
    group.iter().find_map(|r| pick(*r)).cloned()
}

/// Fold one group (same normalized key, input order preserved).
fn fold_group(key: String, group: &[&DiscoveryReport], rules: &InferenceRules) -> RelayAggregate {
    let mut agg = RelayAggregate {
        key,
        ..Default::default()
    };

    for r in group {
        agg.capabilities.extend(r.capability_tags.iter().copied());
        agg.feature_ids.extend(r.supported_feature_ids.iter().copied());
        agg.requirements.extend(r.requirements.iter().cloned());
        agg.topics.extend(r.topics.iter().cloned());
        agg.reporter_ids.insert(r.reporter_id.clone());
        agg.last_seen_at = agg.last_seen_at.max(r.observed_at);
    }
    agg.reporter_count = agg.reporter_ids.len();

    agg.avg_open_ms = mean(group.iter().filter_map(|r| r.rtt_open_ms));
    agg.avg_read_ms = mean(group.iter().filter_map(|r| r.rtt_read_ms));
    agg.avg_write_ms = mean(group.iter().filter_map(|r| r.rtt_write_ms));

    agg.network = first_some(group, |r| r.network.as_ref());
    agg.country_code = first_some(group, |r| r.country_code.as_ref());
    agg.isp = first_some(group, |r| r.isp.as_ref());
    agg.geohash = first_some(group, |r| r.geohash.as_ref());
    agg.as_number = first_some(group, |r| r.as_number.as_ref());
    agg.as_name = first_some(group, |r| r.as_name.as_ref());

    let embedded = group
        .iter()
        .find_map(|r| r.embedded_metadata_json.as_deref())
        .and_then(|json| {
            let parsed = parse_embedded_metadata(json);
            if parsed.is_none() {
                tracing::debug!(target: "discovery", relay = %agg.key, "embedded relay document unparsable");
            }
            parsed
        });
    if let Some(meta) = embedded {
        agg.has_embedded_metadata = true;
        agg.feature_ids.extend(meta.feature_ids);
        agg.display_name = meta.display_name;
        agg.description = meta.description;
        agg.icon_url = meta.icon_url;
        agg.banner_url = meta.banner_url;
        agg.software = meta.software;
        agg.version = meta.version;
        agg.operator_id = meta.operator_id;
        agg.payment_required = meta.payment_required;
        agg.auth_required = meta.auth_required;
        agg.restricted_writes = meta.restricted_writes;
    }

    if agg.capabilities.is_empty() {
        agg.capabilities = rules.infer(&agg.feature_ids);
    }

    agg
}

/// Group reports by normalized key and fold each group. Reports with a blank key are
/// skipped. Never fails; worst case the map is empty.
pub fn aggregate(
    reports: &[DiscoveryReport],
    rules: &InferenceRules,
) -> HashMap<String, RelayAggregate> {
    // BTreeMap keeps group iteration stable; order within a group is input order.
    let mut groups: BTreeMap<String, Vec<&DiscoveryReport>> = BTreeMap::new();
    for r in reports {
        let key = normalize_key(&r.resource_key);
        if key.is_empty() {
            continue;
        }
        groups.entry(key).or_default().push(r);
    }

    groups
        .into_iter()
        .map(|(key, group)| {
            let agg = fold_group(key.clone(), &group, rules);
            (key, agg)
        })
        .collect()
}
