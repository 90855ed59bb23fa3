// src/transport.rs
//! Subscription contract consumed from the relay transport, plus an in-memory
//! fixture transport used by the binary and the tests.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::record::{RawRecord, RecordFilter};

/// Callback invoked for every delivered record, from any task.
pub type RecordSink = Arc<dyn Fn(RawRecord) + Send + Sync>;

/// Live subscription. `cancel` must be idempotent.
pub trait SubscriptionHandle: Send + Sync {
    fn cancel(&self);
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Start delivering records matching `filter` from `sources` into `on_record`
    /// until the returned handle is cancelled.
    async fn open_subscription(
        &self,
        sources: &[String],
        filter: RecordFilter,
        on_record: RecordSink,
    ) -> Result<Box<dyn SubscriptionHandle>>;

    fn name(&self) -> &'static str;
}

/// Handle backed by a cancellation token shared with the delivery tasks.
pub struct TokenHandle {
    token: CancellationToken,
}

impl TokenHandle {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }
}

impl SubscriptionHandle for TokenHandle {
    fn cancel(&self) {
        self.token.cancel();
    }
}

/// Serves canned records. Each requested source gets its own delivery task, so a
/// record published to several sources arrives several times, in no fixed order.
#[derive(Default)]
pub struct FixtureTransport {
    every_source: Vec<RawRecord>,
    per_source: HashMap<String, Vec<RawRecord>>,
    delay: Duration,
    fail_open: Option<String>,
    opens: AtomicUsize,
}

impl FixtureTransport {
    /// Every source serves all of `records`.
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self {
            every_source: records,
            ..Default::default()
        }
    }

    /// Records served only by `source`.
    pub fn with_source(mut self, source: &str, records: Vec<RawRecord>) -> Self {
        self.per_source.insert(source.to_string(), records);
        self
    }

    /// Pause before each delivered record.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// A transport whose every open fails with `reason`.
    pub fn failing(reason: &str) -> Self {
        Self {
            fail_open: Some(reason.to_string()),
            ..Default::default()
        }
    }

    /// Load a JSON array of raw records.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("reading fixture records from {}", path.display()))?;
        let records: Vec<RawRecord> =
            serde_json::from_str(&s).context("parsing fixture records")?;
        Ok(Self::new(records))
    }

    /// How many subscriptions have been opened so far.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Transport for FixtureTransport {
    async fn open_subscription(
        &self,
        sources: &[String],
        filter: RecordFilter,
        on_record: RecordSink,
    ) -> Result<Box<dyn SubscriptionHandle>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.fail_open {
            return Err(anyhow!("subscription refused: {reason}"));
        }

        let token = CancellationToken::new();
        for source in sources {
            let mut batch: Vec<RawRecord> = self
                .every_source
                .iter()
                .chain(self.per_source.get(source).into_iter().flatten())
                .filter(|r| filter.matches(r))
                .cloned()
                .collect();
            if batch.is_empty() {
                continue;
            }
            let sink = on_record.clone();
            let token = token.child_token();
            let delay = self.delay;
            tokio::spawn(async move {
                for rec in batch.drain(..) {
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    if token.is_cancelled() {
                        return;
                    }
                    sink(rec);
                }
            });
        }

        Ok(Box::new(TokenHandle::new(token)))
    }

    fn name(&self) -> &'static str {
        "fixture"
    }
}
