//! NIP-56: moderation reports (kind 1984).
//!
//! The report fields are serialized into the event `content` as JSON, and the target is
//! mirrored into an `e` or `p` tag carrying the reason so relays can index it.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::nip01::{Event, UnsignedEvent};

pub const KIND_REPORT: u16 = 1984;

#[derive(Debug, Error)]
pub enum Nip56Error {
    #[error("invalid report: {0}")]
    Invalid(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// What is being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportTargetKind {
    /// A single event; `target_id` is an event id.
    Event,
    /// An account; `target_id` is a pubkey.
    Profile,
}

impl ReportTargetKind {
    fn tag_name(self) -> &'static str {
        match self {
            Self::Event => "e",
            Self::Profile => "p",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportReason {
    Nudity,
    Malware,
    Profanity,
    Illegal,
    Spam,
    Impersonation,
    Other,
}

impl ReportReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nudity => "nudity",
            Self::Malware => "malware",
            Self::Profanity => "profanity",
            Self::Illegal => "illegal",
            Self::Spam => "spam",
            Self::Impersonation => "impersonation",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ReportReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plain report fields. Also the payload handed to the operator mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub target_id: String,
    pub target_kind: ReportTargetKind,
    pub reason: ReportReason,
    pub reporter_pubkey: String,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl Report {
    pub fn new(
        target_id: impl Into<String>,
        target_kind: ReportTargetKind,
        reason: ReportReason,
        reporter_pubkey: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            target_id: target_id.into(),
            target_kind,
            reason,
            reporter_pubkey: reporter_pubkey.into(),
            timestamp,
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn validate(&self) -> Result<(), Nip56Error> {
        if self.target_id.trim().is_empty() {
            return Err(Nip56Error::Invalid("target_id is empty".to_string()));
        }
        if self.reporter_pubkey.len() != 64 {
            return Err(Nip56Error::Invalid(
                "reporter_pubkey must be 64 hex characters".to_string(),
            ));
        }
        Ok(())
    }

    /// Draft event authored by `reporter_pubkey`.
    pub fn to_unsigned_event(&self) -> Result<UnsignedEvent, Nip56Error> {
        self.validate()?;
        Ok(UnsignedEvent {
            pubkey: self.reporter_pubkey.clone(),
            created_at: self.timestamp,
            kind: KIND_REPORT,
            tags: vec![vec![
                self.target_kind.tag_name().to_string(),
                self.target_id.clone(),
                self.reason.as_str().to_string(),
            ]],
            content: serde_json::to_string(self)?,
        })
    }

    pub fn from_event(event: &Event) -> Result<Self, Nip56Error> {
        if event.kind != KIND_REPORT {
            return Err(Nip56Error::Invalid(format!(
                "expected kind {}, got {}",
                KIND_REPORT, event.kind
            )));
        }
        let report: Self = serde_json::from_str(&event.content)?;
        if report.reporter_pubkey != event.pubkey {
            return Err(Nip56Error::Invalid(
                "reporter does not match event author".to_string(),
            ));
        }
        Ok(report)
    }
}
