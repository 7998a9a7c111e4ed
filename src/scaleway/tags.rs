//! Scaleway stores tags as a flat list of strings. Key/value tags are encoded
//! as `key=value`; entries without `=` decode to a key with an empty value.

use crate::provider::Tags;

/// Marker tag added to every instance created by stratus.
pub(crate) const MANAGED_TAG: &str = "stratus";

pub(crate) fn encode(tags: &Tags) -> Vec<String> {
    tags.iter()
        .map(|(key, value)| {
            if value.is_empty() {
                key.to_owned()
            } else {
                format!("{key}={value}")
            }
        })
        .collect()
}

pub(crate) fn decode(raw: &[String]) -> Tags {
    raw.iter()
        .map(|entry| entry.split_once('=').unwrap_or((entry.as_str(), "")))
        .collect()
}

/// Merges `update` into the instance's current raw tags.
pub(crate) fn merged(current: &[String], update: &Tags) -> Vec<String> {
    let mut tags = decode(current);
    tags.merge(update);
    encode(&tags)
}

/// Query value used to filter servers by `key=value`.
pub(crate) fn query(key: &str, value: &str) -> String {
    format!("{key}={value}")
}
