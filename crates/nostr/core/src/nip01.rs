//! NIP-01: event structure, canonical serialization, signing and verification.
//!
//! An event exists in one of two shapes:
//! - [`UnsignedEvent`]: a draft. It carries the author `pubkey` but no `id` or `sig`.
//! - [`Event`]: a signed record whose `id` is the SHA-256 of the canonical serialization
//!   and whose `sig` is a BIP-340 Schnorr signature of that id by `pubkey`.
//!
//! There is no partially filled state: the only way from a draft to an [`Event`] is
//! [`sign_event`] (or [`finalize_event`] for templates without a pubkey), which computes
//! both fields together.

use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::{Keypair, Message, SecretKey, XOnlyPublicKey, schnorr};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors that can occur during NIP-01 operations.
#[derive(Debug, Error)]
pub enum Nip01Error {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("verification error: {0}")]
    Verification(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
}

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Event {
    /// 32-bytes lowercase hex-encoded sha256 of the serialized event data
    pub id: String,
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind (integer between 0 and 65535)
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// 64-bytes lowercase hex signature
    pub sig: String,
}

impl Event {
    /// Strip `id` and `sig`, returning the draft this event was signed from.
    pub fn to_unsigned(&self) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }

    /// First value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        crate::tag_parsing::find_tag_value(&self.tags, name)
    }
}

/// A draft event: everything but `id` and `sig`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
}

impl UnsignedEvent {
    /// Compute the content-addressed id this draft will have once signed.
    pub fn id(&self) -> Result<String, Nip01Error> {
        get_event_hash(self)
    }
}

/// A template for creating events (without pubkey, which comes from the signing key).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
}

impl EventTemplate {
    /// Attach an author, turning the template into a draft.
    pub fn into_unsigned(self, pubkey: impl Into<String>) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: pubkey.into(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
        }
    }
}

pub const KIND_METADATA: u16 = 0;
pub const KIND_SHORT_TEXT_NOTE: u16 = 1;
pub const KIND_CONTACTS: u16 = 3;

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

/// Generate a random 32-byte secret key.
pub fn generate_secret_key() -> [u8; 32] {
    loop {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        // Zero or >= curve order; retry.
        if SecretKey::from_slice(&key).is_ok() {
            return key;
        }
    }
}

/// Get the public key (x-only, 32 bytes) from a secret key.
pub fn get_public_key(secret_key: &[u8; 32]) -> Result<[u8; 32], Nip01Error> {
    let secp = Secp256k1::signing_only();
    let sk = SecretKey::from_slice(secret_key)
        .map_err(|e| Nip01Error::InvalidPublicKey(e.to_string()))?;
    let (xonly, _parity) = sk.x_only_public_key(&secp);
    Ok(xonly.serialize())
}

/// Get the public key as a hex string from a secret key.
pub fn get_public_key_hex(secret_key: &[u8; 32]) -> Result<String, Nip01Error> {
    Ok(hex::encode(get_public_key(secret_key)?))
}

/// Serialize an unsigned event for hashing.
///
/// Format: `[0, pubkey, created_at, kind, tags, content]`
pub fn serialize_event(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    if !validate_unsigned_event(event) {
        return Err(Nip01Error::InvalidEvent(
            "can't serialize event with wrong or missing properties".to_string(),
        ));
    }

    serde_json::to_string(&(
        0,
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    ))
    .map_err(|e| Nip01Error::Serialization(e.to_string()))
}

/// Get the event hash (id) from an unsigned event.
pub fn get_event_hash(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    let serialized = serialize_event(event)?;
    Ok(hex::encode(Sha256::digest(serialized.as_bytes())))
}

fn is_lower_hex(value: &str, len: usize) -> bool {
    value.len() == len
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Validate an unsigned event structure.
pub fn validate_unsigned_event(event: &UnsignedEvent) -> bool {
    is_lower_hex(&event.pubkey, 64)
}

/// Validate a signed event structure (not including signature verification).
pub fn validate_event(event: &Event) -> bool {
    is_lower_hex(&event.id, 64) && is_lower_hex(&event.pubkey, 64) && is_lower_hex(&event.sig, 128)
}

/// Sign a draft with the secret key matching its `pubkey`.
pub fn sign_event(draft: &UnsignedEvent, secret_key: &[u8; 32]) -> Result<Event, Nip01Error> {
    let secp = Secp256k1::signing_only();
    let sk = SecretKey::from_slice(secret_key).map_err(|e| Nip01Error::Signing(e.to_string()))?;
    let keypair = Keypair::from_secret_key(&secp, &sk);
    let (xonly, _parity) = keypair.x_only_public_key();
    if hex::encode(xonly.serialize()) != draft.pubkey {
        return Err(Nip01Error::Signing(
            "draft pubkey does not match the signing key".to_string(),
        ));
    }

    let id = get_event_hash(draft)?;
    let digest = decode_32(&id).map_err(Nip01Error::Signing)?;
    let sig = secp.sign_schnorr_no_aux_rand(&Message::from_digest(digest), &keypair);

    Ok(Event {
        id,
        pubkey: draft.pubkey.clone(),
        created_at: draft.created_at,
        kind: draft.kind,
        tags: draft.tags.clone(),
        content: draft.content.clone(),
        sig: hex::encode(sig.serialize()),
    })
}

/// Sign an event template with a secret key, producing a complete signed event.
pub fn finalize_event(
    template: &EventTemplate,
    secret_key: &[u8; 32],
) -> Result<Event, Nip01Error> {
    let pubkey = get_public_key_hex(secret_key).map_err(|e| Nip01Error::Signing(e.to_string()))?;
    sign_event(&template.clone().into_unsigned(pubkey), secret_key)
}

/// Verify an event's id and signature.
///
/// `Ok(false)` means the event is well-formed hex but the id or signature does not
/// check out; `Err` means a field could not be decoded at all. Callers treat both as
/// a rejection.
pub fn verify_event(event: &Event) -> Result<bool, Nip01Error> {
    if !validate_event(event) {
        return Ok(false);
    }

    let computed_id = get_event_hash(&event.to_unsigned())?;
    if computed_id != event.id {
        return Ok(false);
    }

    let digest = decode_32(&event.id).map_err(Nip01Error::Verification)?;
    let sig_bytes = hex::decode(&event.sig)
        .map_err(|e| Nip01Error::Verification(format!("invalid sig hex: {}", e)))?;
    let sig = schnorr::Signature::from_slice(&sig_bytes)
        .map_err(|e| Nip01Error::Verification(format!("invalid signature: {}", e)))?;
    let pubkey_bytes = hex::decode(&event.pubkey)
        .map_err(|e| Nip01Error::Verification(format!("invalid pubkey hex: {}", e)))?;
    let pubkey = XOnlyPublicKey::from_slice(&pubkey_bytes)
        .map_err(|e| Nip01Error::Verification(format!("invalid pubkey: {}", e)))?;

    let secp = Secp256k1::verification_only();
    Ok(secp
        .verify_schnorr(&sig, &Message::from_digest(digest), &pubkey)
        .is_ok())
}

/// `verify_event` collapsed to a verdict: anything but a clean pass is a rejection.
pub fn is_valid_event(event: &Event) -> bool {
    matches!(verify_event(event), Ok(true))
}

fn decode_32(value: &str) -> Result<[u8; 32], String> {
    let bytes = hex::decode(value).map_err(|e| format!("invalid hex: {}", e))?;
    bytes
        .try_into()
        .map_err(|_| "expected 32 bytes".to_string())
}

/// Sort events in reverse-chronological order by created_at,
/// then by id (lexicographically) in case of ties.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_PRIVATE_KEY: &str =
        "d217c1ff2f8a65c3e3a1740db3b9f58b8c848bb45e26d00ed4714e4a0f4ceecf";

    fn test_private_key() -> [u8; 32] {
        decode_32(TEST_PRIVATE_KEY).unwrap()
    }

    fn note(content: &str) -> EventTemplate {
        EventTemplate {
            kind: KIND_SHORT_TEXT_NOTE,
            tags: vec![],
            content: content.to_string(),
            created_at: 1617932115,
        }
    }

    #[test]
    fn test_public_key_from_private_key_deterministic() {
        let sk = generate_secret_key();
        let pk = get_public_key_hex(&sk).unwrap();
        assert_eq!(pk.len(), 64);
        for _ in 0..5 {
            assert_eq!(get_public_key_hex(&sk).unwrap(), pk);
        }
    }

    #[test]
    fn test_serialize_event_matches_canonical_layout() {
        let public_key = get_public_key_hex(&test_private_key()).unwrap();
        let unsigned = note("Hello, world!").into_unsigned(public_key.clone());

        let serialized = serialize_event(&unsigned).unwrap();
        let expected = format!("[0,\"{}\",1617932115,1,[],\"Hello, world!\"]", public_key);
        assert_eq!(serialized, expected);
    }

    #[test]
    fn test_serialize_event_rejects_bad_pubkey() {
        let unsigned = note("x").into_unsigned("invalid");
        assert!(serialize_event(&unsigned).is_err());

        let upper = get_public_key_hex(&test_private_key())
            .unwrap()
            .to_uppercase();
        assert!(!validate_unsigned_event(&note("x").into_unsigned(upper)));
    }

    #[test]
    fn test_sign_event_id_matches_draft_id() {
        let sk = test_private_key();
        let draft = note("Hello, world!").into_unsigned(get_public_key_hex(&sk).unwrap());

        let event = sign_event(&draft, &sk).unwrap();
        assert_eq!(event.id, draft.id().unwrap());
        assert_eq!(event.sig.len(), 128);
        assert_eq!(event.to_unsigned(), draft);
        assert!(verify_event(&event).unwrap());
    }

    #[test]
    fn test_sign_event_rejects_foreign_draft() {
        let other = generate_secret_key();
        let draft = note("x").into_unsigned(get_public_key_hex(&other).unwrap());
        let result = sign_event(&draft, &test_private_key());
        assert!(matches!(result, Err(Nip01Error::Signing(_))));
    }

    #[test]
    fn test_verify_event_is_deterministic() {
        let event = finalize_event(&note("twice"), &test_private_key()).unwrap();
        let first = verify_event(&event).unwrap();
        let second = verify_event(&event).unwrap();
        assert!(first);
        assert_eq!(first, second);

        let mut tampered = event.clone();
        tampered.content = "changed".to_string();
        assert!(!verify_event(&tampered).unwrap());
        assert!(!verify_event(&tampered).unwrap());
    }

    #[test]
    fn test_verify_event_invalid_signature() {
        let mut event = finalize_event(&note("Hello"), &test_private_key()).unwrap();
        event.sig.replace_range(0..3, "666");
        assert!(!is_valid_event(&event));
    }

    #[test]
    fn test_verify_event_wrong_pubkey() {
        let mut event = finalize_event(&note("Hello"), &test_private_key()).unwrap();
        event.pubkey = get_public_key_hex(&generate_secret_key()).unwrap();
        assert!(!is_valid_event(&event));
    }

    #[test]
    fn test_verify_event_invalid_id() {
        let mut event = finalize_event(&note("Hello"), &test_private_key()).unwrap();
        event.id.replace_range(0..3, "666");
        assert!(!is_valid_event(&event));
    }

    #[test]
    fn test_event_with_tags_and_escapes() {
        let template = EventTemplate {
            kind: KIND_SHORT_TEXT_NOTE,
            tags: vec![
                vec!["e".to_string(), "abc123".to_string()],
                vec!["p".to_string(), "def456".to_string()],
            ],
            content: "Hello\nWorld\t\"quotes\" and \\backslash 世界 🌍".to_string(),
            created_at: 1617932115,
        };

        let event = finalize_event(&template, &test_private_key()).unwrap();
        assert!(is_valid_event(&event));
        assert_eq!(event.tag_value("p"), Some("def456"));
    }

    #[test]
    fn test_event_roundtrip_json_still_verifies() {
        let event = finalize_event(&note("json"), &test_private_key()).unwrap();
        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);
        assert!(is_valid_event(&parsed));
    }

    #[test]
    fn test_sort_events() {
        let make = |id: &str, created_at: u64| Event {
            id: id.to_string(),
            pubkey: "a".repeat(64),
            created_at,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: "a".repeat(128),
        };
        let mut events = vec![
            make("abc123", 1610000000),
            make("abc124", 1620000000),
            make("abc125", 1620000000),
        ];

        sort_events(&mut events);

        assert_eq!(events[0].id, "abc124");
        assert_eq!(events[1].id, "abc125");
        assert_eq!(events[2].id, "abc123");
    }
}
