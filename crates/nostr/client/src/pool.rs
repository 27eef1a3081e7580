//! Relay pool for multi-relay fanout.

use crate::error::{ClientError, Result};
use crate::relay::{ConnectionState, InboundEvent, RelayConfig, RelayConnection};
use crate::relay_url::normalize_relay_url;
use crate::transport::{PublishOutcome, PublishReport, RelayTransport};
use async_trait::async_trait;
use futures_util::future::join_all;
use nostr::{Event, Filter};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Relay pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of relays in the pool.
    pub max_relays: usize,
    /// How long a publish waits for each relay's `OK`.
    pub publish_timeout: Duration,
    /// Relay configuration template.
    pub relay_config: RelayConfig,
    /// Accept `ws://` and unnormalized URLs. Only meant for local test relays.
    pub allow_insecure: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_relays: 16,
            publish_timeout: Duration::from_secs(10),
            relay_config: RelayConfig::default(),
            allow_insecure: false,
        }
    }
}

/// Owns every relay connection and fans publishes and subscriptions out to them.
///
/// Inbound events from all relays are merged, tagged with their source, and handed out
/// once through [`RelayPool::take_inbound`]. The pool never deduplicates or alters events.
pub struct RelayPool {
    relays: Arc<RwLock<HashMap<String, Arc<RelayConnection>>>>,
    /// Which relays each wire subscription was sent to.
    subscriptions: RwLock<HashMap<String, Vec<String>>>,
    inbound_tx: mpsc::UnboundedSender<InboundEvent>,
    inbound_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<InboundEvent>>>,
    config: PoolConfig,
}

impl RelayPool {
    /// Create new relay pool.
    pub fn new(config: PoolConfig) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            relays: Arc::new(RwLock::new(HashMap::new())),
            subscriptions: RwLock::new(HashMap::new()),
            inbound_tx,
            inbound_rx: std::sync::Mutex::new(Some(inbound_rx)),
            config,
        }
    }

    /// Add a relay and start connecting to it. Adding a known relay is a no-op.
    ///
    /// `url` must already be a normalized `wss://` URL (see [`normalize_relay_url`]).
    pub async fn add_relay(&self, url: &str) -> Result<Arc<RelayConnection>> {
        if !self.config.allow_insecure && normalize_relay_url(url).as_deref() != Some(url) {
            return Err(ClientError::InvalidUrl(format!(
                "relay URL must be a normalized wss:// URL, got: {}",
                url
            )));
        }
        let mut relays = self.relays.write().await;
        if let Some(existing) = relays.get(url) {
            return Ok(Arc::clone(existing));
        }
        if relays.len() >= self.config.max_relays {
            return Err(ClientError::Internal(format!(
                "maximum relay limit ({}) reached",
                self.config.max_relays
            )));
        }
        let relay = Arc::new(RelayConnection::open(
            url,
            self.config.relay_config.clone(),
            self.inbound_tx.clone(),
        )?);
        relays.insert(url.to_string(), Arc::clone(&relay));
        info!("added relay {}", url);
        Ok(relay)
    }

    /// Add several relays, logging the ones that cannot be added.
    pub async fn add_relays<I, S>(&self, urls: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut added = 0usize;
        for url in urls {
            match self.add_relay(url.as_ref()).await {
                Ok(_) => added += 1,
                Err(error) => warn!("skipping relay {}: {}", url.as_ref(), error),
            }
        }
        added
    }

    /// Close and forget a relay.
    pub async fn remove_relay(&self, url: &str) -> bool {
        let removed = self.relays.write().await.remove(url);
        match removed {
            Some(relay) => {
                relay.close().await;
                for relays in self.subscriptions.write().await.values_mut() {
                    relays.retain(|relay_url| relay_url != url);
                }
                true
            }
            None => false,
        }
    }

    /// Get relay by URL.
    pub async fn relay(&self, url: &str) -> Option<Arc<RelayConnection>> {
        self.relays.read().await.get(url).cloned()
    }

    /// Configured relay URLs, sorted.
    pub async fn relay_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.relays.read().await.keys().cloned().collect();
        urls.sort();
        urls
    }

    pub async fn relay_states(&self) -> BTreeMap<String, ConnectionState> {
        self.relays
            .read()
            .await
            .iter()
            .map(|(url, relay)| (url.clone(), relay.state()))
            .collect()
    }

    /// Take the merged inbound event stream. Only the first caller gets it.
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<InboundEvent>> {
        self.inbound_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    /// Publish to each named relay concurrently and collect every outcome.
    ///
    /// Each relay resolves independently: a slow relay times out on its own without
    /// holding up the others.
    pub async fn publish(&self, relays: &[String], event: &Event) -> Result<PublishReport> {
        if relays.is_empty() {
            return Err(ClientError::NoRelays);
        }

        let publish_timeout = self.config.publish_timeout;
        let mut attempts = Vec::with_capacity(relays.len());
        let mut report = PublishReport::new(event.id.clone());
        for url in relays {
            match self.add_relay(url).await {
                Ok(relay) => attempts.push(publish_to(relay, event.clone(), publish_timeout)),
                Err(error) => {
                    report
                        .outcomes
                        .insert(url.clone(), PublishOutcome::Rejected(error.to_string()));
                }
            }
        }

        for (url, outcome) in join_all(attempts).await {
            report.outcomes.insert(url, outcome);
        }
        debug!(
            "published {} to {} relays, {} accepted",
            event.id,
            report.outcomes.len(),
            report.accepted_count()
        );
        Ok(report)
    }

    /// Open a wire subscription on each named relay.
    ///
    /// Relays that are not open yet queue the request until they are.
    pub async fn subscribe(
        &self,
        relays: &[String],
        subscription_id: &str,
        filters: &[Filter],
    ) -> Result<()> {
        if relays.is_empty() {
            return Err(ClientError::NoRelays);
        }

        let mut subscribed = Vec::with_capacity(relays.len());
        for url in relays {
            let relay = match self.add_relay(url).await {
                Ok(relay) => relay,
                Err(error) => {
                    warn!("cannot subscribe {} on {}: {}", subscription_id, url, error);
                    continue;
                }
            };
            match relay.subscribe(subscription_id, filters.to_vec()) {
                Ok(()) => subscribed.push(url.clone()),
                Err(error) => warn!("cannot subscribe {} on {}: {}", subscription_id, url, error),
            }
        }

        if subscribed.is_empty() {
            return Err(ClientError::Subscription(format!(
                "no relay accepted subscription {}",
                subscription_id
            )));
        }
        self.subscriptions
            .write()
            .await
            .insert(subscription_id.to_string(), subscribed);
        Ok(())
    }

    /// Close a wire subscription on every relay it was sent to. Unknown ids are ignored.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        let Some(urls) = self.subscriptions.write().await.remove(subscription_id) else {
            return Ok(());
        };
        let relays = self.relays.read().await;
        for url in urls {
            if let Some(relay) = relays.get(&url)
                && let Err(error) = relay.unsubscribe(subscription_id)
            {
                debug!("unsubscribe {} on {}: {}", subscription_id, url, error);
            }
        }
        Ok(())
    }

    /// Wire subscriptions currently open through this pool.
    pub async fn subscription_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.subscriptions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close every relay.
    pub async fn shutdown(&self) {
        let relays: Vec<Arc<RelayConnection>> =
            self.relays.write().await.drain().map(|(_, relay)| relay).collect();
        for relay in relays {
            relay.close().await;
        }
        self.subscriptions.write().await.clear();
    }
}

async fn publish_to(
    relay: Arc<RelayConnection>,
    event: Event,
    publish_timeout: Duration,
) -> (String, PublishOutcome) {
    let url = relay.url().to_string();
    let ack = match relay.publish(event) {
        Ok(ack) => ack,
        Err(error) => return (url, PublishOutcome::Rejected(error.to_string())),
    };
    let outcome = match timeout(publish_timeout, ack).await {
        Ok(Ok(ack)) if ack.accepted => PublishOutcome::Accepted,
        Ok(Ok(ack)) => PublishOutcome::Rejected(ack.message),
        Ok(Err(_)) => PublishOutcome::Rejected("relay connection closed".to_string()),
        Err(_) => PublishOutcome::TimedOut,
    };
    (url, outcome)
}

#[async_trait]
impl RelayTransport for RelayPool {
    async fn relay_urls(&self) -> Vec<String> {
        RelayPool::relay_urls(self).await
    }

    async fn subscribe(
        &self,
        relays: &[String],
        subscription_id: &str,
        filters: &[Filter],
    ) -> Result<()> {
        RelayPool::subscribe(self, relays, subscription_id, filters).await
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        RelayPool::unsubscribe(self, subscription_id).await
    }

    async fn publish(&self, relays: &[String], event: &Event) -> Result<PublishReport> {
        RelayPool::publish(self, relays, event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_config(max_relays: usize) -> PoolConfig {
        PoolConfig {
            max_relays,
            publish_timeout: Duration::from_millis(200),
            relay_config: RelayConfig {
                connect_timeout: Duration::from_millis(200),
                reconnect_base_delay: Duration::from_millis(10),
                reconnect_max_delay: Duration::from_millis(20),
                max_reconnect_attempts: 1,
                ping_interval: None,
            },
            allow_insecure: true,
        }
    }

    #[tokio::test]
    async fn add_relay_is_idempotent_and_capped() -> Result<()> {
        let pool = RelayPool::new(quiet_config(1));
        pool.add_relay("ws://127.0.0.1:9").await?;
        pool.add_relay("ws://127.0.0.1:9").await?;
        assert_eq!(pool.relay_urls().await, vec!["ws://127.0.0.1:9"]);
        assert!(pool.add_relay("ws://127.0.0.1:10").await.is_err());
        assert!(pool.remove_relay("ws://127.0.0.1:9").await);
        assert!(!pool.remove_relay("ws://127.0.0.1:9").await);
        pool.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn publish_and_subscribe_need_relays() {
        let pool = RelayPool::new(quiet_config(4));
        let event = Event {
            id: "id".to_string(),
            pubkey: "pubkey".to_string(),
            created_at: 1,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: "sig".to_string(),
        };
        assert!(matches!(pool.publish(&[], &event).await, Err(ClientError::NoRelays)));
        assert!(matches!(
            pool.subscribe(&[], "sub", &[Filter::new()]).await,
            Err(ClientError::NoRelays)
        ));
        assert!(pool.unsubscribe("unknown").await.is_ok());
    }

    #[tokio::test]
    async fn insecure_relays_are_refused_by_default() -> Result<()> {
        let pool = RelayPool::new(PoolConfig::default());
        for url in ["ws://127.0.0.1:9", "relay.example.com", "wss://relay.example.com/"] {
            assert!(matches!(
                pool.add_relay(url).await,
                Err(ClientError::InvalidUrl(_))
            ));
        }

        let event = Event {
            id: "id".to_string(),
            pubkey: "pubkey".to_string(),
            created_at: 1,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: "sig".to_string(),
        };
        let report = pool.publish(&["ws://127.0.0.1:9".to_string()], &event).await?;
        assert!(matches!(
            report.outcomes.get("ws://127.0.0.1:9"),
            Some(PublishOutcome::Rejected(_))
        ));
        assert!(pool.relay_urls().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn inbound_stream_is_taken_once() {
        let pool = RelayPool::new(PoolConfig::default());
        assert!(pool.take_inbound().is_some());
        assert!(pool.take_inbound().is_none());
    }
}
