//! Subscription registry.
//!
//! Structurally identical filter sequences share one wire subscription. Each wire
//! subscription keeps its own bounded set of seen event ids, so every listener sees a
//! given event at most once, and only after its signature has been verified.
//!
//! Filters that overlap without being identical (a different `limit`, an extra author)
//! get separate wire subscriptions; no subsumption is attempted.

use crate::error::{ClientError, Result};
use crate::relay::InboundEvent;
use crate::transport::RelayTransport;
use lru::LruCache;
use nostr::{Event, Filter, FilterKey, is_valid_event, matches_any};
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Callback type for handling received events.
pub type EventCallback = Arc<dyn Fn(Event) -> Result<()> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Seen-id capacity per subscription. Must exceed the largest expected result set.
    pub seen_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            seen_capacity: 10_000,
        }
    }
}

/// What happened to one inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to this many listeners.
    Delivered(usize),
    Duplicate,
    InvalidSignature,
    /// Relay sent an event the subscription's filters do not match.
    Unmatched,
    UnknownSubscription,
}

enum Listener {
    Channel(mpsc::UnboundedSender<Event>),
    Callback(EventCallback),
}

/// Progress of the wire subscription a record stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
enum OpenState {
    Opening,
    Open,
    Failed(String),
}

struct LiveSubscription {
    key: FilterKey,
    filters: Vec<Filter>,
    relays: Vec<String>,
    seen: LruCache<String, ()>,
    /// Refcount is the number of listeners.
    listeners: BTreeMap<u64, Listener>,
    /// Set until the transport has accepted the subscription.
    opening: Option<watch::Receiver<OpenState>>,
}

#[derive(Default)]
struct RegistryState {
    by_key: HashMap<FilterKey, String>,
    subscriptions: HashMap<String, LiveSubscription>,
}

impl RegistryState {
    /// Forget a record, and its key unless the key already points at a newer record.
    fn remove(&mut self, subscription_id: &str) -> Option<LiveSubscription> {
        let record = self.subscriptions.remove(subscription_id)?;
        if self.by_key.get(&record.key).map(String::as_str) == Some(subscription_id) {
            self.by_key.remove(&record.key);
        }
        Some(record)
    }
}

/// Owns every live subscription and routes inbound events to their listeners.
pub struct SubscriptionRegistry {
    transport: Arc<dyn RelayTransport>,
    config: RegistryConfig,
    state: Mutex<RegistryState>,
    next_listener: AtomicU64,
    invalid_signatures: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new(transport: Arc<dyn RelayTransport>, config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            transport,
            config,
            state: Mutex::new(RegistryState::default()),
            next_listener: AtomicU64::new(1),
            invalid_signatures: AtomicU64::new(0),
        })
    }

    pub fn transport(&self) -> &Arc<dyn RelayTransport> {
        &self.transport
    }

    /// Register interest in `filters`; events arrive on the returned handle.
    pub async fn register(self: &Arc<Self>, filters: Vec<Filter>) -> Result<SubscriptionHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut handle = self.attach(filters, Listener::Channel(tx)).await?;
        handle.events = Some(rx);
        Ok(handle)
    }

    /// Register interest in `filters`, invoking `callback` for each new event.
    ///
    /// The callback runs on the task that drives [`SubscriptionRegistry::handle_inbound`]
    /// and must not block.
    pub async fn register_callback(
        self: &Arc<Self>,
        filters: Vec<Filter>,
        callback: EventCallback,
    ) -> Result<SubscriptionHandle> {
        self.attach(filters, Listener::Callback(callback)).await
    }

    /// Join or open the subscription for `filters`.
    ///
    /// The listener is in place before anything is awaited; the handle built around it
    /// releases it again if the caller gives up half way.
    async fn attach(
        self: &Arc<Self>,
        filters: Vec<Filter>,
        listener: Listener,
    ) -> Result<SubscriptionHandle> {
        if filters.is_empty() {
            return Err(ClientError::InvalidRequest(
                "subscription needs at least one filter".to_string(),
            ));
        }
        let key = FilterKey::new(&filters);
        let listener_id = self.next_listener.fetch_add(1, Ordering::Relaxed);

        let listener = match self.join_existing(&key, listener_id, listener) {
            Ok((subscription_id, opening)) => {
                return self.await_open(subscription_id, listener_id, opening).await;
            }
            Err(listener) => listener,
        };

        let relays = self.transport.relay_urls().await;
        if relays.is_empty() {
            return Err(ClientError::NoRelays);
        }

        // Another registration for the same key may have won the race while we awaited.
        let listener = match self.join_existing(&key, listener_id, listener) {
            Ok((subscription_id, opening)) => {
                return self.await_open(subscription_id, listener_id, opening).await;
            }
            Err(listener) => listener,
        };

        let subscription_id = generate_subscription_id();
        let (opened, opening) = watch::channel(OpenState::Opening);
        {
            let mut state = self.lock();
            state.by_key.insert(key.clone(), subscription_id.clone());
            state.subscriptions.insert(
                subscription_id.clone(),
                LiveSubscription {
                    key,
                    filters: filters.clone(),
                    relays: relays.clone(),
                    seen: LruCache::new(
                        NonZeroUsize::new(self.config.seen_capacity).unwrap_or(NonZeroUsize::MIN),
                    ),
                    listeners: BTreeMap::from([(listener_id, listener)]),
                    opening: Some(opening),
                },
            );
        }
        let mut handle = self.handle(subscription_id.clone(), listener_id);

        if let Err(error) = self
            .transport
            .subscribe(&relays, &subscription_id, &filters)
            .await
        {
            warn!("opening subscription {} failed: {}", subscription_id, error);
            // Everyone who joined in the meantime goes down with it.
            let discarded = self.lock().remove(&subscription_id);
            drop(discarded);
            opened.send_replace(OpenState::Failed(error.to_string()));
            handle.released = true;
            return Err(error);
        }

        if let Some(record) = self.lock().subscriptions.get_mut(&subscription_id) {
            record.opening = None;
        }
        opened.send_replace(OpenState::Open);
        debug!(
            "opened subscription {} on {} relays",
            subscription_id,
            relays.len()
        );
        Ok(handle)
    }

    fn join_existing(
        &self,
        key: &FilterKey,
        listener_id: u64,
        listener: Listener,
    ) -> std::result::Result<(String, Option<watch::Receiver<OpenState>>), Listener> {
        let mut state = self.lock();
        let Some(subscription_id) = state.by_key.get(key).cloned() else {
            return Err(listener);
        };
        let Some(record) = state.subscriptions.get_mut(&subscription_id) else {
            return Err(listener);
        };
        record.listeners.insert(listener_id, listener);
        debug!(
            "joined subscription {} (refcount {})",
            subscription_id,
            record.listeners.len()
        );
        Ok((subscription_id, record.opening.clone()))
    }

    /// Wait for a joined subscription that is still being opened by someone else.
    async fn await_open(
        self: &Arc<Self>,
        subscription_id: String,
        listener_id: u64,
        opening: Option<watch::Receiver<OpenState>>,
    ) -> Result<SubscriptionHandle> {
        let mut handle = self.handle(subscription_id, listener_id);
        let Some(mut opening) = opening else {
            return Ok(handle);
        };
        let outcome = opening
            .wait_for(|state| *state != OpenState::Opening)
            .await
            .map(|state| (*state).clone());
        match outcome {
            Ok(OpenState::Open) => Ok(handle),
            Ok(OpenState::Failed(reason)) => {
                handle.released = true;
                Err(ClientError::Subscription(reason))
            }
            // The opener was cancelled; dropping the handle releases our listener.
            Ok(OpenState::Opening) | Err(_) => Err(ClientError::Subscription(format!(
                "opening subscription {} was abandoned",
                handle.subscription_id
            ))),
        }
    }

    fn handle(self: &Arc<Self>, subscription_id: String, listener_id: u64) -> SubscriptionHandle {
        SubscriptionHandle {
            registry: Arc::clone(self),
            subscription_id,
            listener_id,
            events: None,
            released: false,
        }
    }

    /// Detach one listener. Returns true when it was the last one out and the wire
    /// subscription must be cancelled.
    fn detach(&self, subscription_id: &str, listener_id: u64) -> bool {
        let mut state = self.lock();
        let Some(record) = state.subscriptions.get_mut(subscription_id) else {
            return false;
        };
        let Some(_listener) = record.listeners.remove(&listener_id) else {
            return false;
        };
        let last = record.listeners.is_empty();
        let _record = if last {
            state.remove(subscription_id)
        } else {
            debug!(
                "released listener on {} (refcount {})",
                subscription_id,
                record.listeners.len()
            );
            None
        };
        // Callbacks may own handles; they are dropped after the lock.
        drop(state);
        last
    }

    /// Detach one listener. The last one out cancels the wire subscription.
    async fn release(&self, subscription_id: &str, listener_id: u64) -> Result<()> {
        if !self.detach(subscription_id, listener_id) {
            return Ok(());
        }
        debug!("closing subscription {}", subscription_id);
        self.transport.unsubscribe(subscription_id).await
    }

    fn is_listening(&self, subscription_id: &str, listener_id: u64) -> bool {
        self.lock()
            .subscriptions
            .get(subscription_id)
            .is_some_and(|record| record.listeners.contains_key(&listener_id))
    }

    /// Route one inbound event to the listeners of its subscription.
    pub fn handle_inbound(&self, inbound: &InboundEvent) -> Delivery {
        let event = &inbound.event;
        let mut callbacks = Vec::new();
        let delivered = {
            let mut state = self.lock();
            let Some(record) = state.subscriptions.get_mut(&inbound.subscription_id) else {
                return Delivery::UnknownSubscription;
            };
            if record.seen.contains(&event.id) {
                return Delivery::Duplicate;
            }
            if !is_valid_event(event) {
                self.invalid_signatures.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "dropping event {} with invalid signature from {}",
                    event.id, inbound.relay_url
                );
                return Delivery::InvalidSignature;
            }
            if !matches_any(&record.filters, event) {
                debug!(
                    "dropping event {} from {}: does not match subscription {}",
                    event.id, inbound.relay_url, inbound.subscription_id
                );
                return Delivery::Unmatched;
            }
            record.seen.put(event.id.clone(), ());

            let mut delivered = 0usize;
            for (id, listener) in &record.listeners {
                match listener {
                    Listener::Channel(tx) => {
                        if tx.send(event.clone()).is_ok() {
                            delivered += 1;
                        }
                    }
                    Listener::Callback(callback) => callbacks.push((*id, Arc::clone(callback))),
                }
            }
            delivered
        };

        // Callbacks run outside the lock so they may call back into the registry. A
        // listener released in the meantime is skipped.
        let mut invoked = 0usize;
        for (listener_id, callback) in callbacks {
            if !self.is_listening(&inbound.subscription_id, listener_id) {
                continue;
            }
            invoked += 1;
            if let Err(error) = callback(event.clone()) {
                warn!(
                    "subscription callback error on {}: {}",
                    inbound.subscription_id, error
                );
            }
        }
        Delivery::Delivered(delivered + invoked)
    }

    /// Drain `inbound` into the registry until the sender side is gone.
    pub fn spawn_pump(
        self: &Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<InboundEvent>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                registry.handle_inbound(&event);
            }
            debug!("inbound event stream ended");
        })
    }

    /// Events dropped so far because their signature did not verify.
    pub fn invalid_signature_count(&self) -> u64 {
        self.invalid_signatures.load(Ordering::Relaxed)
    }

    pub fn live_subscription_count(&self) -> usize {
        self.lock().subscriptions.len()
    }

    /// Listener count of a live subscription, 0 if it is not live.
    pub fn refcount(&self, subscription_id: &str) -> usize {
        self.lock()
            .subscriptions
            .get(subscription_id)
            .map_or(0, |record| record.listeners.len())
    }

    /// Relays a live subscription was opened on.
    pub fn relays_for(&self, subscription_id: &str) -> Vec<String> {
        self.lock()
            .subscriptions
            .get(subscription_id)
            .map(|record| record.relays.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn generate_subscription_id() -> String {
    format!("mux-{}", Uuid::new_v4().simple())
}

/// One caller's share of a live subscription.
///
/// Dropping the handle stops delivery at once and cancels the wire subscription in the
/// background; [`SubscriptionHandle::close`] waits for the cancellation.
pub struct SubscriptionHandle {
    registry: Arc<SubscriptionRegistry>,
    subscription_id: String,
    listener_id: u64,
    events: Option<mpsc::UnboundedReceiver<Event>>,
    released: bool,
}

impl SubscriptionHandle {
    /// Wire subscription id, shared with every caller of the same filters.
    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// Next event. `None` for callback handles or once the subscription is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        match self.events.as_mut() {
            Some(events) => events.recv().await,
            None => None,
        }
    }

    /// Next already-delivered event, without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.events.as_mut().and_then(|events| events.try_recv().ok())
    }

    /// Stop delivery to this handle; the last handle out cancels the wire subscription.
    pub async fn close(mut self) -> Result<()> {
        self.released = true;
        if let Some(events) = self.events.as_mut() {
            events.close();
        }
        self.registry
            .release(&self.subscription_id, self.listener_id)
            .await
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Delivery stops now; only the wire cancellation runs in the background.
        if !self.registry.detach(&self.subscription_id, self.listener_id) {
            return;
        }
        let transport = Arc::clone(self.registry.transport());
        let subscription_id = std::mem::take(&mut self.subscription_id);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(error) = transport.unsubscribe(&subscription_id).await {
                        warn!("closing subscription {} failed: {}", subscription_id, error);
                    }
                });
            }
            Err(_) => debug!(
                "no runtime to close subscription {}; it stays open on the relays",
                subscription_id
            ),
        }
    }
}
