//! Signing identities.
//!
//! A [`Keys`] value holds a secp256k1 secret key and its x-only public key. Keys can
//! be generated, imported from hex, `nsec` or a NIP-06 mnemonic, and loaded from an
//! identity file holding any of those encodings.

use std::fmt;
use std::path::Path;

use anyhow::Context;
use bech32::{Bech32, Hrp};
use bip39::Mnemonic;
use bitcoin::Network;
use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv};
use bitcoin::key::Secp256k1;
use thiserror::Error;

use crate::nip01::{self, Event, EventTemplate, Nip01Error, UnsignedEvent};

const NOSTR_COIN_TYPE: u32 = 1237;
const NSEC_HRP: &str = "nsec";
const NPUB_HRP: &str = "npub";

/// Errors produced while importing or encoding keys.
#[derive(Debug, Error)]
pub enum KeysError {
    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),

    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    #[error("bech32 error: {0}")]
    Bech32(String),

    #[error("key derivation failed: {0}")]
    Derivation(String),
}

/// A secret key together with its hex public key.
#[derive(Clone)]
pub struct Keys {
    secret_key: [u8; 32],
    public_key: String,
}

impl Keys {
    /// Import a raw 32-byte secret key.
    pub fn new(secret_key: [u8; 32]) -> Result<Self, KeysError> {
        let public_key = nip01::get_public_key_hex(&secret_key)
            .map_err(|error| KeysError::InvalidSecretKey(error.to_string()))?;
        Ok(Self {
            secret_key,
            public_key,
        })
    }

    /// Fresh random identity, used for ephemeral remote-signer sessions.
    pub fn generate() -> Self {
        let secret_key = nip01::generate_secret_key();
        // generate_secret_key only returns in-range scalars.
        let public_key = nip01::get_public_key_hex(&secret_key).unwrap_or_default();
        Self {
            secret_key,
            public_key,
        }
    }

    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, KeysError> {
        let bytes = hex::decode(secret_hex.trim())
            .map_err(|error| KeysError::InvalidSecretKey(error.to_string()))?;
        let secret_key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| KeysError::InvalidSecretKey("expected 32 bytes".to_string()))?;
        Self::new(secret_key)
    }

    pub fn from_nsec(nsec: &str) -> Result<Self, KeysError> {
        let (hrp, data) =
            bech32::decode(nsec.trim()).map_err(|error| KeysError::Bech32(error.to_string()))?;
        if hrp.as_str() != NSEC_HRP {
            return Err(KeysError::Bech32(format!(
                "expected {} prefix, got {}",
                NSEC_HRP, hrp
            )));
        }
        let secret_key: [u8; 32] = data
            .try_into()
            .map_err(|_| KeysError::InvalidSecretKey("expected 32 bytes".to_string()))?;
        Self::new(secret_key)
    }

    /// NIP-06 derivation (`m/44'/1237'/<account>'/0/0`).
    pub fn from_mnemonic(mnemonic: &str, account: u32) -> Result<Self, KeysError> {
        let parsed = Mnemonic::parse(mnemonic.trim())
            .map_err(|error| KeysError::InvalidMnemonic(error.to_string()))?;
        let seed = parsed.to_seed("");

        let secp = Secp256k1::new();
        let master = Xpriv::new_master(Network::Bitcoin, &seed)
            .map_err(|error| KeysError::Derivation(error.to_string()))?;
        let hardened = |index: u32| {
            ChildNumber::from_hardened_idx(index)
                .map_err(|error| KeysError::Derivation(error.to_string()))
        };
        let normal = |index: u32| {
            ChildNumber::from_normal_idx(index)
                .map_err(|error| KeysError::Derivation(error.to_string()))
        };
        let path = DerivationPath::from(vec![
            hardened(44)?,
            hardened(NOSTR_COIN_TYPE)?,
            hardened(account)?,
            normal(0)?,
            normal(0)?,
        ]);

        let derived = master
            .derive_priv(&secp, &path)
            .map_err(|error| KeysError::Derivation(error.to_string()))?;
        Self::new(derived.private_key.secret_bytes())
    }

    /// Parse any supported encoding: 64-char hex, `nsec1...`, or a mnemonic phrase.
    pub fn parse(input: &str) -> Result<Self, KeysError> {
        let input = input.trim();
        if input.starts_with("nsec1") {
            Self::from_nsec(input)
        } else if input.len() == 64 && input.chars().all(|c| c.is_ascii_hexdigit()) {
            Self::from_secret_hex(input)
        } else {
            Self::from_mnemonic(input, 0)
        }
    }

    pub fn public_key_hex(&self) -> &str {
        &self.public_key
    }

    pub fn secret_key(&self) -> &[u8; 32] {
        &self.secret_key
    }

    pub fn npub(&self) -> Result<String, KeysError> {
        let bytes = hex::decode(&self.public_key)
            .map_err(|error| KeysError::Bech32(error.to_string()))?;
        encode_bech32(NPUB_HRP, &bytes)
    }

    pub fn nsec(&self) -> Result<String, KeysError> {
        encode_bech32(NSEC_HRP, &self.secret_key)
    }

    /// Sign a draft authored by this identity.
    pub fn sign(&self, draft: &UnsignedEvent) -> Result<Event, Nip01Error> {
        nip01::sign_event(draft, &self.secret_key)
    }

    /// Sign a template, stamping this identity's pubkey.
    pub fn sign_template(&self, template: &EventTemplate) -> Result<Event, Nip01Error> {
        nip01::finalize_event(template, &self.secret_key)
    }
}

impl fmt::Debug for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

fn encode_bech32(hrp: &str, data: &[u8]) -> Result<String, KeysError> {
    let parsed_hrp = Hrp::parse(hrp).map_err(|error| KeysError::Bech32(error.to_string()))?;
    bech32::encode::<Bech32>(parsed_hrp, data).map_err(|error| KeysError::Bech32(error.to_string()))
}

/// Load an identity file containing a hex key, an `nsec`, or a mnemonic.
pub fn load_keys_from_path(path: impl AsRef<Path>) -> anyhow::Result<Keys> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read identity file {}", path.display()))?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        return Err(anyhow::anyhow!("identity file is empty: {}", path.display()));
    }
    Keys::parse(trimmed).with_context(|| format!("invalid identity in {}", path.display()))
}
