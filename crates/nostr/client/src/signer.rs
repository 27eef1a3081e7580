//! Signing pipeline: turn a draft into a signed event, locally or through a remote signer.

use crate::error::SignError;
use crate::remote_signer::RemoteSignerClient;
use nostr::{Event, EventTemplate, Keys, UnsignedEvent};
use std::fmt;
use std::sync::Arc;

/// How drafts get signed. Chosen explicitly by the caller; nothing picks one for you.
#[derive(Clone)]
pub enum SigningMethod {
    /// Sign in-process with a held secret key.
    Local(Keys),
    /// Delegate to a remote signer that holds the key for `signer_pubkey`.
    Remote {
        client: Arc<RemoteSignerClient>,
        signer_pubkey: String,
    },
}

impl SigningMethod {
    /// Pubkey that events signed by this method will carry.
    pub fn public_key(&self) -> &str {
        match self {
            Self::Local(keys) => keys.public_key_hex(),
            Self::Remote { signer_pubkey, .. } => signer_pubkey,
        }
    }
}

impl fmt::Debug for SigningMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(keys) => f.debug_tuple("Local").field(keys).finish(),
            Self::Remote { signer_pubkey, .. } => f
                .debug_struct("Remote")
                .field("signer_pubkey", signer_pubkey)
                .finish_non_exhaustive(),
        }
    }
}

/// Sign `draft` with `method`.
pub async fn sign(draft: &UnsignedEvent, method: Option<&SigningMethod>) -> Result<Event, SignError> {
    match method {
        None => Err(SignError::Unavailable(
            "no signing method configured".to_string(),
        )),
        Some(SigningMethod::Local(keys)) => Ok(keys.sign(draft)?),
        Some(SigningMethod::Remote {
            client,
            signer_pubkey,
        }) => client.request_signature(draft, signer_pubkey).await,
    }
}

/// Holds the configured signing method, if any.
#[derive(Clone, Debug, Default)]
pub struct SigningPipeline {
    method: Option<SigningMethod>,
}

impl SigningPipeline {
    pub fn new(method: Option<SigningMethod>) -> Self {
        Self { method }
    }

    pub fn local(keys: Keys) -> Self {
        Self::new(Some(SigningMethod::Local(keys)))
    }

    pub fn remote(client: Arc<RemoteSignerClient>, signer_pubkey: impl Into<String>) -> Self {
        Self::new(Some(SigningMethod::Remote {
            client,
            signer_pubkey: signer_pubkey.into(),
        }))
    }

    pub fn method(&self) -> Option<&SigningMethod> {
        self.method.as_ref()
    }

    pub fn set_method(&mut self, method: Option<SigningMethod>) {
        self.method = method;
    }

    /// Pubkey of the configured signer.
    pub fn public_key(&self) -> Option<&str> {
        self.method.as_ref().map(SigningMethod::public_key)
    }

    pub async fn sign(&self, draft: &UnsignedEvent) -> Result<Event, SignError> {
        sign(draft, self.method.as_ref()).await
    }

    /// Stamp the signer's pubkey on `template` and sign it.
    pub async fn sign_template(&self, template: &EventTemplate) -> Result<Event, SignError> {
        let pubkey = self.public_key().ok_or_else(|| {
            SignError::Unavailable("no signing method configured".to_string())
        })?;
        let draft = template.clone().into_unsigned(pubkey);
        self.sign(&draft).await
    }
}
