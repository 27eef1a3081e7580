//! Remote signing request/response payloads.
//!
//! Requests and responses travel as kind 24133 events. The transport has no notion of
//! a request, so every payload carries a correlation `id` chosen by the requester; the
//! signer echoes it back in its response.
//!
//! ```text
//! client                                   signer
//!   │── 24133 {id, method, draft} ──────────>│   tags: ["p", signer], ["client", name]
//!   │<── 24133 {id, result | error} ─────────│   tags: ["p", client]
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::nip01::{Event, EventTemplate, UnsignedEvent};
use crate::tag_parsing::{collect_tag_values, find_tag_value};

/// Kind used for both directions of the remote signing exchange.
pub const KIND_NOSTR_CONNECT: u16 = 24133;

/// Tag naming the requesting application.
pub const CLIENT_TAG: &str = "client";

pub const METHOD_SIGN_EVENT: &str = "sign_event";

#[derive(Debug, Error)]
pub enum Nip46Error {
    #[error("expected kind 24133, got {0}")]
    UnexpectedKind(u16),

    #[error("event is not addressed to {0}")]
    NotAddressed(String),

    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Request payload: sign `draft` and answer with correlation id `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignRequest {
    pub id: String,
    pub method: String,
    pub draft: UnsignedEvent,
}

impl SignRequest {
    pub fn new(id: impl Into<String>, draft: UnsignedEvent) -> Self {
        Self {
            id: id.into(),
            method: METHOD_SIGN_EVENT.to_string(),
            draft,
        }
    }

    /// Event template addressed to `signer_pubkey`, tagged with `client_name`.
    pub fn to_event_template(
        &self,
        signer_pubkey: &str,
        client_name: &str,
        created_at: u64,
    ) -> Result<EventTemplate, Nip46Error> {
        Ok(EventTemplate {
            created_at,
            kind: KIND_NOSTR_CONNECT,
            tags: vec![
                vec!["p".to_string(), signer_pubkey.to_string()],
                vec![CLIENT_TAG.to_string(), client_name.to_string()],
            ],
            content: serde_json::to_string(self)?,
        })
    }

    /// Decode a request addressed to `signer_pubkey`.
    pub fn from_event(event: &Event, signer_pubkey: &str) -> Result<Self, Nip46Error> {
        check_envelope(event, signer_pubkey)?;
        Ok(serde_json::from_str(&event.content)?)
    }
}

/// Response payload: exactly one of `result` or `error` is expected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Event>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SignResponse {
    pub fn signed(id: impl Into<String>, event: Event) -> Self {
        Self {
            id: id.into(),
            result: Some(event),
            error: None,
        }
    }

    pub fn rejected(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(reason.into()),
        }
    }

    /// Event template answering `client_pubkey`.
    pub fn to_event_template(
        &self,
        client_pubkey: &str,
        created_at: u64,
    ) -> Result<EventTemplate, Nip46Error> {
        Ok(EventTemplate {
            created_at,
            kind: KIND_NOSTR_CONNECT,
            tags: vec![vec!["p".to_string(), client_pubkey.to_string()]],
            content: serde_json::to_string(self)?,
        })
    }

    /// Decode a response addressed to `client_pubkey`.
    pub fn from_event(event: &Event, client_pubkey: &str) -> Result<Self, Nip46Error> {
        check_envelope(event, client_pubkey)?;
        Ok(serde_json::from_str(&event.content)?)
    }
}

fn check_envelope(event: &Event, recipient: &str) -> Result<(), Nip46Error> {
    if event.kind != KIND_NOSTR_CONNECT {
        return Err(Nip46Error::UnexpectedKind(event.kind));
    }
    if !collect_tag_values(&event.tags, "p")
        .iter()
        .any(|value| value == recipient)
    {
        return Err(Nip46Error::NotAddressed(recipient.to_string()));
    }
    Ok(())
}

/// Client application name carried by a request, if any.
pub fn client_name(event: &Event) -> Option<&str> {
    find_tag_value(&event.tags, CLIENT_TAG)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Keys;

    fn draft(pubkey: &str) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: pubkey.to_string(),
            created_at: 1_700_000_000,
            kind: 1,
            tags: vec![],
            content: "sign me".to_string(),
        }
    }

    #[test]
    fn request_envelope_is_addressed_and_tagged() {
        let client = Keys::generate();
        let signer = Keys::generate();
        let request = SignRequest::new("corr-1", draft(signer.public_key_hex()));

        let template = request
            .to_event_template(signer.public_key_hex(), "mux-test", 1_700_000_001)
            .unwrap();
        let event = client.sign_template(&template).unwrap();

        assert_eq!(client_name(&event), Some("mux-test"));
        assert_eq!(
            SignRequest::from_event(&event, signer.public_key_hex()).unwrap(),
            request
        );
        assert!(matches!(
            SignRequest::from_event(&event, client.public_key_hex()),
            Err(Nip46Error::NotAddressed(_))
        ));
    }

    #[test]
    fn response_carries_signed_event_or_error() {
        let client = Keys::generate();
        let signer = Keys::generate();
        let signed = signer.sign(&draft(signer.public_key_hex())).unwrap();

        let ok = SignResponse::signed("corr-1", signed.clone());
        let event = signer
            .sign_template(&ok.to_event_template(client.public_key_hex(), 1).unwrap())
            .unwrap();
        let decoded = SignResponse::from_event(&event, client.public_key_hex()).unwrap();
        assert_eq!(decoded.result, Some(signed));
        assert_eq!(decoded.error, None);

        let no = SignResponse::rejected("corr-2", "user declined");
        let json = serde_json::to_value(&no).unwrap();
        assert_eq!(json, serde_json::json!({"id": "corr-2", "error": "user declined"}));
    }

    #[test]
    fn wrong_kind_is_rejected() {
        let keys = Keys::generate();
        let event = keys
            .sign_template(&EventTemplate {
                created_at: 1,
                kind: 1,
                tags: vec![vec!["p".to_string(), keys.public_key_hex().to_string()]],
                content: "{}".to_string(),
            })
            .unwrap();
        assert!(matches!(
            SignResponse::from_event(&event, keys.public_key_hex()),
            Err(Nip46Error::UnexpectedKind(1))
        ));
    }
}
