//! Carrier access for wire keys.
//!
//! A carrier is the transport a trace travels on: an HTTP header map,
//! messaging attributes, a JSON envelope. The propagation layer always asks
//! for keys in their canonical lowercase form (the [`KeyPlan`] stores them
//! that way), so implementations are not in the normalization business:
//! reads try the canonical key and fall back to a case-insensitive scan for
//! entries some other party wrote with different casing, and writes replace
//! any cased variant so a carrier never holds two spellings of one wire key.
//!
//! [`KeyPlan`]: crate::plan::KeyPlan

use std::collections::HashMap;

use serde_json::Value;

/// Writes one wire key into a carrier on injection.
pub trait Injector {
    /// Sets `key` (canonical lowercase) to `value`, replacing any entry for
    /// the same key under a different casing.
    fn set(&mut self, key: &str, value: String);
}

/// Reads one wire key out of a carrier on extraction.
pub trait Extractor {
    /// Gets the value for `key` (canonical lowercase). Entries stored under
    /// a different casing still match.
    fn get(&self, key: &str) -> Option<&str>;
}

impl<S: std::hash::BuildHasher> Injector for HashMap<String, String, S> {
    fn set(&mut self, key: &str, value: String) {
        if let Some(existing) = self.get_mut(key) {
            *existing = value;
            return;
        }
        self.retain(|k, _| !k.eq_ignore_ascii_case(key));
        self.insert(key.to_string(), value);
    }
}

impl<S: std::hash::BuildHasher> Extractor for HashMap<String, String, S> {
    fn get(&self, key: &str) -> Option<&str> {
        if let Some(value) = self.get(key) {
            return Some(value.as_str());
        }
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// JSON-envelope carrier. Only `Value::Object` participates; other variants
/// read as empty and ignore writes.
impl Injector for Value {
    fn set(&mut self, key: &str, value: String) {
        let Value::Object(map) = self else { return };
        map.retain(|k, _| !k.eq_ignore_ascii_case(key));
        map.insert(key.to_string(), Value::String(value));
    }
}

impl Extractor for Value {
    fn get(&self, key: &str) -> Option<&str> {
        let Value::Object(map) = self else { return None };
        map.get(key)
            .or_else(|| {
                map.iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(key))
                    .map(|(_, v)| v)
            })
            .and_then(Value::as_str)
    }
}
