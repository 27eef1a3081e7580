//! Remote signer client (NIP-46 style `sign_event` over kind 24133).
//!
//! Requests and responses travel as ordinary events, so correlation is explicit: every
//! request gets a random correlation id and a one-shot slot in `pending`. Responses are
//! routed to their slot by id, whichever request's subscription handle saw them first.
//! A slot is filled or dropped exactly once; late and duplicate responses find nothing
//! and are ignored.
//!
//! All requests to one signer use the same response filter (`since` is fixed when the
//! client is built), so concurrent requests share a single wire subscription through
//! the registry.

use crate::error::SignError;
use crate::registry::{SubscriptionHandle, SubscriptionRegistry};
use nostr::{
    Event, Filter, KIND_NOSTR_CONNECT, Keys, SignRequest, SignResponse, UnsignedEvent,
    is_valid_event, unix_now,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{Instant, sleep_until, timeout_at};
use tracing::{debug, warn};

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<SignResponse>>>>;

#[derive(Debug, Clone)]
pub struct RemoteSignerConfig {
    /// Deadline for one request, publish included.
    pub timeout: Duration,
    /// Value of the `client` tag on outgoing requests.
    pub client_name: String,
}

impl Default for RemoteSignerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            client_name: "nostr-mux".to_string(),
        }
    }
}

pub struct RemoteSignerClient {
    registry: Arc<SubscriptionRegistry>,
    /// Identity the requests are signed with and responses are addressed to.
    keys: Keys,
    config: RemoteSignerConfig,
    since: u64,
    pending: PendingMap,
}

impl RemoteSignerClient {
    pub fn new(registry: Arc<SubscriptionRegistry>, keys: Keys, config: RemoteSignerConfig) -> Self {
        Self {
            registry,
            keys,
            config,
            since: unix_now(),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Client with a throwaway identity.
    pub fn ephemeral(registry: Arc<SubscriptionRegistry>, config: RemoteSignerConfig) -> Self {
        Self::new(registry, Keys::generate(), config)
    }

    pub fn client_pubkey(&self) -> &str {
        self.keys.public_key_hex()
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Requests currently waiting for a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Filter for responses from `signer_pubkey` addressed to this client.
    pub fn response_filter(&self, signer_pubkey: &str) -> Filter {
        Filter::new()
            .kinds([KIND_NOSTR_CONNECT])
            .authors([signer_pubkey])
            .pubkey_refs([self.client_pubkey()])
            .since(self.since)
    }

    /// Ask `signer_pubkey` to sign `draft`.
    ///
    /// Dropping the returned future cancels the request and frees its correlation slot.
    pub async fn request_signature(
        &self,
        draft: &UnsignedEvent,
        signer_pubkey: &str,
    ) -> Result<Event, SignError> {
        let expected_id = draft.id()?;
        let deadline = Instant::now() + self.config.timeout;
        let correlation_id = new_correlation_id();
        let (slot, response_rx) = oneshot::channel();
        let _slot_guard = SlotGuard::insert(&self.pending, correlation_id.clone(), slot);

        let mut handle = self
            .registry
            .register(vec![self.response_filter(signer_pubkey)])
            .await
            .map_err(|error| {
                SignError::Unavailable(format!("cannot listen for signer responses: {}", error))
            })?;

        let outcome = self
            .exchange(
                &correlation_id,
                draft,
                signer_pubkey,
                deadline,
                &mut handle,
                response_rx,
            )
            .await;
        if let Err(error) = handle.close().await {
            debug!("closing signer subscription failed: {}", error);
        }
        check_response(outcome?, &expected_id)
    }

    async fn exchange(
        &self,
        correlation_id: &str,
        draft: &UnsignedEvent,
        signer_pubkey: &str,
        deadline: Instant,
        handle: &mut SubscriptionHandle,
        mut response_rx: oneshot::Receiver<SignResponse>,
    ) -> Result<SignResponse, SignError> {
        let request = SignRequest::new(correlation_id, draft.clone());
        let template = request
            .to_event_template(signer_pubkey, &self.config.client_name, unix_now())
            .map_err(|error| SignError::Unavailable(error.to_string()))?;
        let request_event = self
            .keys
            .sign_template(&template)
            .map_err(|error| SignError::Unavailable(error.to_string()))?;

        let transport = self.registry.transport();
        let relays = transport.relay_urls().await;
        let report = match timeout_at(deadline, transport.publish(&relays, &request_event)).await
        {
            Err(_) => return Err(SignError::Timeout(self.config.timeout)),
            Ok(Err(error)) => {
                return Err(SignError::Unavailable(format!(
                    "publishing sign request failed: {}",
                    error
                )));
            }
            Ok(Ok(report)) => report,
        };
        if report.all_rejected() {
            return Err(SignError::Unavailable(format!(
                "no relay took the sign request: {}",
                report.failure_summary()
            )));
        }
        debug!(
            "sent sign request {} to {} via {} relays",
            correlation_id,
            signer_pubkey,
            report.outcomes.len()
        );

        let expiry = sleep_until(deadline);
        tokio::pin!(expiry);
        let mut listening = true;
        loop {
            tokio::select! {
                response = &mut response_rx => {
                    return response.map_err(|_| {
                        SignError::Unavailable("sign request slot was dropped".to_string())
                    });
                }
                event = handle.recv(), if listening => match event {
                    Some(event) => self.route(&event, signer_pubkey),
                    None => listening = false,
                },
                () = &mut expiry => {
                    warn!(
                        "signer {} did not answer {} within {:?}",
                        signer_pubkey, correlation_id, self.config.timeout
                    );
                    return Err(SignError::Timeout(self.config.timeout));
                }
            }
        }
    }

    /// Hand a response to the request it belongs to, if that request is still waiting.
    fn route(&self, event: &Event, signer_pubkey: &str) {
        if event.pubkey != signer_pubkey {
            return;
        }
        let response = match SignResponse::from_event(event, self.client_pubkey()) {
            Ok(response) => response,
            Err(error) => {
                debug!("ignoring signer message {}: {}", event.id, error);
                return;
            }
        };
        let slot = lock(&self.pending).remove(&response.id);
        match slot {
            Some(slot) => {
                if slot.send(response).is_err() {
                    debug!("sign request went away before its response arrived");
                }
            }
            None => debug!("ignoring stale sign response {}", response.id),
        }
    }
}

/// Turn a signer response into a signed event for the draft whose id is `expected_id`.
pub fn check_response(response: SignResponse, expected_id: &str) -> Result<Event, SignError> {
    if let Some(reason) = response.error {
        return Err(SignError::Rejected(reason));
    }
    let Some(event) = response.result else {
        return Err(SignError::Rejected(
            "signer returned neither a result nor an error".to_string(),
        ));
    };
    if event.id != expected_id {
        return Err(SignError::Rejected(format!(
            "signer returned event {} for draft {}",
            event.id, expected_id
        )));
    }
    if !is_valid_event(&event) {
        return Err(SignError::Rejected(
            "signer returned an event with an invalid signature".to_string(),
        ));
    }
    Ok(event)
}

fn new_correlation_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<String, oneshot::Sender<SignResponse>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a correlation slot when its request finishes or is cancelled.
struct SlotGuard {
    pending: PendingMap,
    correlation_id: String,
}

impl SlotGuard {
    fn insert(
        pending: &PendingMap,
        correlation_id: String,
        slot: oneshot::Sender<SignResponse>,
    ) -> Self {
        lock(pending).insert(correlation_id.clone(), slot);
        Self {
            pending: Arc::clone(pending),
            correlation_id,
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.correlation_id);
    }
}
