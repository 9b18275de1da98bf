//! Immutable description of logical fields and their wire keys.

use std::collections::{HashMap, HashSet};

use crate::error::ConfigError;

/// The frozen field/key layout shared by every context a factory creates.
///
/// A plan maps each *wire key* (the name a value travels under on a carrier)
/// onto a *logical field* (the lowercase name in-process code and plugins
/// see). Several wire keys may alias the same field; every field is reachable
/// through at least one wire key. Wire keys are stored in canonical
/// lowercase, which is what carriers are handed on every read and write.
#[derive(Debug)]
pub struct KeyPlan {
    field_names: Vec<String>,
    wire_keys: Vec<String>,
    wire_to_field: Vec<usize>,
    index_by_name: HashMap<String, usize>,
}

impl KeyPlan {
    /// Freezes a plan, verifying its invariants.
    ///
    /// Field names and wire keys must be unique, every `wire_to_field` entry
    /// must be in range, and every field must be referenced by at least one
    /// wire key.
    pub(crate) fn new(
        field_names: Vec<String>,
        wire_keys: Vec<String>,
        wire_to_field: Vec<usize>,
    ) -> Result<Self, ConfigError> {
        debug_assert_eq!(wire_keys.len(), wire_to_field.len());

        let mut index_by_name = HashMap::with_capacity(field_names.len());
        for (index, name) in field_names.iter().enumerate() {
            let previous = index_by_name.insert(name.clone(), index);
            debug_assert!(previous.is_none(), "builder deduplicates field names");
        }

        let mut seen_keys = HashSet::with_capacity(wire_keys.len());
        for key in &wire_keys {
            if !seen_keys.insert(key.as_str()) {
                return Err(ConfigError::DuplicateWireKey(key.clone()));
            }
        }

        debug_assert!(wire_to_field.iter().all(|&f| f < field_names.len()));
        debug_assert!((0..field_names.len())
            .all(|f| wire_to_field.contains(&f)));

        Ok(Self {
            field_names,
            wire_keys,
            wire_to_field,
            index_by_name,
        })
    }

    /// Number of logical fields.
    #[must_use]
    pub fn field_count(&self) -> usize {
        self.field_names.len()
    }

    /// Logical field names, in declaration order.
    #[must_use]
    pub fn field_names(&self) -> &[String] {
        &self.field_names
    }

    /// Wire keys, in declaration order.
    #[must_use]
    pub fn wire_keys(&self) -> &[String] {
        &self.wire_keys
    }

    /// The logical field a wire key (by position) maps onto.
    #[must_use]
    pub fn field_for_wire(&self, wire_index: usize) -> usize {
        self.wire_to_field[wire_index]
    }

    /// Name of a logical field by index.
    #[must_use]
    pub fn field_name(&self, field_index: usize) -> &str {
        &self.field_names[field_index]
    }

    /// Resolves a logical field by name, case-folding the query.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        if let Some(&index) = self.index_by_name.get(name) {
            return Some(index);
        }
        self.index_by_name.get(&name.to_lowercase()).copied()
    }
}
