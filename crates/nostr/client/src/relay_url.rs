//! Relay URL normalization.
//!
//! Configured relays must be secure WebSocket endpoints. Bare hosts get `wss://`
//! prepended; anything with another scheme, or a malformed scheme separator, is dropped.

use std::collections::BTreeSet;

use url::Url;

const SECURE_SCHEME: &str = "wss";

/// Normalize one relay entry, returning `None` when it must be dropped.
pub fn normalize_relay_url(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let candidate = match trimmed.split_once("://") {
        Some((scheme, _)) if scheme.eq_ignore_ascii_case(SECURE_SCHEME) => trimmed.to_string(),
        Some(_) => return None,
        None if has_scheme_prefix(trimmed) => return None,
        None => format!("{}://{}", SECURE_SCHEME, trimmed),
    };

    let url = Url::parse(&candidate).ok()?;
    if url.scheme() != SECURE_SCHEME || url.host_str().is_none_or(str::is_empty) {
        return None;
    }
    if !url.username().is_empty() || url.password().is_some() {
        return None;
    }

    let (_, rest) = candidate.split_once("://")?;
    Some(format!("{}://{}", SECURE_SCHEME, rest.trim_end_matches('/')))
}

/// `scheme:rest` without `//`, e.g. `wss:relay.example.com` or `mailto:x`.
///
/// `host:port` is not a scheme: the part after the colon starts with a digit and the
/// part before it may contain dots.
fn has_scheme_prefix(input: &str) -> bool {
    let Some((head, tail)) = input.split_once(':') else {
        return false;
    };
    let looks_like_scheme = head
        .chars()
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic())
        && head
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-'));
    let looks_like_port = tail.chars().next().is_some_and(|c| c.is_ascii_digit());
    looks_like_scheme && !looks_like_port
}

/// Normalize a list of relay entries. Each entry may itself be comma separated.
///
/// Invalid entries are dropped; duplicates keep their first position.
pub fn parse_relays<I, S>(entries: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for entry in entries {
        for part in entry.as_ref().split(',') {
            if let Some(normalized) = normalize_relay_url(part)
                && seen.insert(normalized.clone())
            {
                out.push(normalized);
            }
        }
    }
    out
}

/// Normalize a single comma- or whitespace-separated string of relays.
pub fn parse_relay_list(raw: &str) -> Vec<String> {
    parse_relays(raw.split(|c: char| c == ',' || c.is_whitespace()))
}
