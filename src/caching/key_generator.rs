//! # Cache Key Generator
//!
//! Deterministic cache key construction.
//!
//! [`generate_key`] builds `prefix:name:value|name:value` from an unordered
//! parameter set; equal parameter sets always produce the same key regardless
//! of iteration order. [`FilterKeyBuilder`] is used by the domain services to
//! build keys from filter objects, appending only the fields that are present
//! in a fixed order.

use std::fmt::Display;

/// Build a cache key from a prefix and a parameter map
///
/// Parameters are sorted by name and joined as `name:value` pairs separated
/// by `|`. With no parameters the bare prefix is returned.
pub fn generate_key<I, K, V>(prefix: &str, params: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Display,
{
    let mut pairs: Vec<(String, String)> = params
        .into_iter()
        .map(|(name, value)| (name.as_ref().to_string(), value.to_string()))
        .collect();

    if pairs.is_empty() {
        return prefix.to_string();
    }

    pairs.sort();

    let joined = pairs
        .iter()
        .map(|(name, value)| format!("{}:{}", name, value))
        .collect::<Vec<_>>()
        .join("|");

    format!("{}:{}", prefix, joined)
}

/// Ordered key builder for filter objects
///
/// Produces `prefix:scope|field:value|field:value|`. Every field is
/// terminated by `|` so glob patterns such as `*|category:3|*` cannot match
/// `category:33`.
#[derive(Debug, Clone)]
pub struct FilterKeyBuilder {
    key: String,
}

impl FilterKeyBuilder {
    pub fn new(prefix: &str, scope: &str) -> Self {
        Self {
            key: format!("{}:{}|", prefix, scope),
        }
    }

    /// Append a field when it is present
    pub fn field<V: Display>(mut self, name: &str, value: Option<V>) -> Self {
        if let Some(value) = value {
            self.key.push_str(&format!("{}:{}|", name, value));
        }
        self
    }

    /// Append a string field when it is present and not blank
    pub fn text(self, name: &str, value: Option<&str>) -> Self {
        let value = value.map(str::trim).filter(|v| !v.is_empty());
        self.field(name, value)
    }

    pub fn build(self) -> String {
        self.key
    }
}

/// Metric label for a key: the text before the first `:`
pub fn key_segment(key: &str) -> &str {
    key.split(':').next().unwrap_or(key)
}
