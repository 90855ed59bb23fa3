// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod aggregate;
pub mod api;
pub mod cache;
pub mod capability;
pub mod config;
pub mod engine;
pub mod metrics;
pub mod parser;
pub mod record;
pub mod registry;
pub mod transport;

// ---- Re-exports for stable public API ----
pub use crate::aggregate::{aggregate, normalize_key, RelayAggregate};
pub use crate::api::router;
pub use crate::cache::CacheStore;
pub use crate::capability::{Capability, InferenceRules};
pub use crate::config::EngineConfig;
pub use crate::engine::{CycleOutcome, DiscoveryEngine, EngineOptions, EngineStatus};
pub use crate::parser::{parse_discovery_report, parse_monitor_announcement};
pub use crate::record::{RawRecord, Tag};
pub use crate::registry::Registry;
pub use crate::transport::{FixtureTransport, Transport};
