//! Seam between the registry/signing layers and the relay pool.

use crate::error::Result;
use async_trait::async_trait;
use nostr::{Event, Filter};
use std::collections::BTreeMap;

/// Result of publishing to one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Accepted,
    Rejected(String),
    TimedOut,
}

/// Per-relay outcomes of one publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub event_id: String,
    pub outcomes: BTreeMap<String, PublishOutcome>,
}

impl PublishReport {
    pub fn new(event_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            outcomes: BTreeMap::new(),
        }
    }

    pub fn accepted_count(&self) -> usize {
        self.outcomes
            .values()
            .filter(|outcome| **outcome == PublishOutcome::Accepted)
            .count()
    }

    pub fn any_accepted(&self) -> bool {
        self.accepted_count() > 0
    }

    /// True when every targeted relay explicitly refused. Timeouts may still have landed.
    pub fn all_rejected(&self) -> bool {
        self.outcomes
            .values()
            .all(|outcome| matches!(outcome, PublishOutcome::Rejected(_)))
    }

    /// `(relay, reason)` for every rejection.
    pub fn rejections(&self) -> Vec<(&str, &str)> {
        self.outcomes
            .iter()
            .filter_map(|(relay, outcome)| match outcome {
                PublishOutcome::Rejected(reason) => Some((relay.as_str(), reason.as_str())),
                _ => None,
            })
            .collect()
    }

    /// Human-readable summary of everything that was not accepted.
    pub fn failure_summary(&self) -> String {
        self.outcomes
            .iter()
            .filter_map(|(relay, outcome)| match outcome {
                PublishOutcome::Accepted => None,
                PublishOutcome::Rejected(reason) => Some(format!("{}: {}", relay, reason)),
                PublishOutcome::TimedOut => Some(format!("{}: timed out", relay)),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Wire-level operations the registry and signers need from a relay pool.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// The currently configured relay set.
    async fn relay_urls(&self) -> Vec<String>;

    async fn subscribe(
        &self,
        relays: &[String],
        subscription_id: &str,
        filters: &[Filter],
    ) -> Result<()>;

    async fn unsubscribe(&self, subscription_id: &str) -> Result<()>;

    async fn publish(&self, relays: &[String], event: &Event) -> Result<PublishReport>;
}
