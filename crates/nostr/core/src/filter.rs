//! NIP-01 subscription filters.
//!
//! A [`Filter`] is a conjunction: an event matches when every populated field is
//! satisfied. A subscription carries a sequence of filters, which is a disjunction:
//! see [`matches_any`]. Empty and absent fields are equivalent and impose no constraint.

use crate::nip01::Event;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Errors produced while building filters.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("tag filter name must be a single ASCII letter, got {0:?}")]
    InvalidTagName(String),
}

/// NIP-01 filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    /// Inclusive lower bound on `created_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// Inclusive upper bound on `created_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Tag queries keyed as on the wire (`"#e"`, `"#p"`, ...).
    #[serde(flatten)]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Add a tag query for a single-letter tag name.
    pub fn tag(
        mut self,
        name: char,
        values: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self, FilterError> {
        if !name.is_ascii_alphabetic() {
            return Err(FilterError::InvalidTagName(name.to_string()));
        }
        self.tags.insert(
            format!("#{}", name),
            values.into_iter().map(Into::into).collect(),
        );
        Ok(self)
    }

    /// Events referencing any of `pubkeys` in a `p` tag.
    pub fn pubkey_refs(mut self, pubkeys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags
            .insert("#p".to_string(), pubkeys.into_iter().map(Into::into).collect());
        self
    }

    /// Events referencing any of `event_ids` in an `e` tag.
    pub fn event_refs(mut self, event_ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags
            .insert("#e".to_string(), event_ids.into_iter().map(Into::into).collect());
        self
    }

    /// Check if an event matches this filter.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = populated(&self.ids)
            && !ids.contains(&event.id)
        {
            return false;
        }

        if let Some(authors) = populated(&self.authors)
            && !authors.contains(&event.pubkey)
        {
            return false;
        }

        if let Some(kinds) = populated(&self.kinds)
            && !kinds.contains(&event.kind)
        {
            return false;
        }

        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }

        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }

        self.tags.iter().all(|(key, values)| {
            let Some(name) = tag_letter(key) else {
                // Not a tag query; relays ignore unknown keys and so do we.
                return true;
            };
            if values.is_empty() {
                return true;
            }
            event.tags.iter().any(|tag| {
                tag.first().is_some_and(|tag_name| tag_name == name)
                    && tag.get(1).is_some_and(|value| values.contains(value))
            })
        })
    }

    /// Canonical form: set-like fields sorted and deduplicated, empty fields dropped.
    ///
    /// Two filters with the same normalized form match exactly the same events and
    /// carry the same `limit`.
    pub fn normalized(&self) -> Self {
        fn set<T: Ord + Clone>(values: &Option<Vec<T>>) -> Option<Vec<T>> {
            populated(values).map(|values| {
                values
                    .iter()
                    .cloned()
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect()
            })
        }

        Self {
            ids: set(&self.ids),
            authors: set(&self.authors),
            kinds: set(&self.kinds),
            since: self.since,
            until: self.until,
            limit: self.limit,
            tags: self
                .tags
                .iter()
                .filter(|(_, values)| !values.is_empty())
                .map(|(key, values)| {
                    let values: BTreeSet<String> = values.iter().cloned().collect();
                    (key.clone(), values.into_iter().collect())
                })
                .collect(),
        }
    }
}

fn populated<T>(values: &Option<Vec<T>>) -> Option<&Vec<T>> {
    values.as_ref().filter(|values| !values.is_empty())
}

fn tag_letter(key: &str) -> Option<&str> {
    let name = key.strip_prefix('#')?;
    let mut chars = name.chars();
    match (chars.next(), chars.next()) {
        (Some(letter), None) if letter.is_ascii_alphabetic() => Some(name),
        _ => None,
    }
}

/// True when `event` matches at least one filter. An empty sequence matches nothing.
pub fn matches_any(filters: &[Filter], event: &Event) -> bool {
    filters.iter().any(|filter| filter.matches(event))
}

/// Order-insensitive identity of a filter sequence.
///
/// Built from the normalized filters, so field order, value order, duplicate values
/// and filter order do not change the key. Filters that differ in any constraint
/// (including `limit`) produce different keys; no subsumption is attempted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterKey(String);

impl FilterKey {
    pub fn new(filters: &[Filter]) -> Self {
        let parts: BTreeSet<String> = filters
            .iter()
            .map(|filter| serde_json::to_string(&filter.normalized()).unwrap_or_default())
            .collect();
        Self(parts.into_iter().collect::<Vec<_>>().join("|"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FilterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
