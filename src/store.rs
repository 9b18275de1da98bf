//! Per-context storage for extra-field values.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::plan::KeyPlan;

/// One field cell. `Inherit` falls through to the parent store; `Cleared` is
/// an owned deletion that shadows the parent.
#[derive(Debug, Clone, Default)]
enum Slot {
    #[default]
    Inherit,
    Cleared,
    Value(String),
}

/// Fixed-length value holder for the logical fields of one trace context.
///
/// A store is created during extraction (always, so that fields set later in
/// the trace have somewhere to live) or by
/// [`PropagationFactory::decorate`](crate::propagation::PropagationFactory::decorate)
/// when a child context is cut from a parent. A child inherits the parent's
/// values lazily and materializes an owned slot on first write, so a span in a
/// child scope can shadow a field without corrupting the parent.
///
/// Slot updates are individually atomic; concurrent readers never observe a
/// partial write, and the later of two racing writes wins. No multi-slot
/// atomicity is provided.
#[derive(Debug)]
pub struct FieldStore {
    plan: Arc<KeyPlan>,
    parent: Option<Arc<FieldStore>>,
    slots: Box<[RwLock<Slot>]>,
}

impl FieldStore {
    /// Creates an empty store for the given plan.
    #[must_use]
    pub fn new(plan: Arc<KeyPlan>) -> Self {
        let slots = (0..plan.field_count())
            .map(|_| RwLock::new(Slot::Inherit))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            plan,
            parent: None,
            slots,
        }
    }

    /// Creates a copy-on-write child of `parent`.
    #[must_use]
    pub fn child(parent: &Arc<FieldStore>) -> Self {
        let mut store = Self::new(Arc::clone(&parent.plan));
        store.parent = Some(Arc::clone(parent));
        store
    }

    /// The plan this store was created from.
    #[must_use]
    pub fn plan(&self) -> &Arc<KeyPlan> {
        &self.plan
    }

    /// Reads a field by index, traversing the parent chain for slots this
    /// store has not yet written.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<String> {
        let mut store = self;
        loop {
            let slot = store.slots[index]
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            match &*slot {
                Slot::Value(value) => return Some(value.clone()),
                Slot::Cleared => return None,
                Slot::Inherit => {}
            }
            drop(slot);
            match &store.parent {
                Some(parent) => store = parent.as_ref(),
                None => return None,
            }
        }
    }

    /// Writes a field by index. `None` deletes, shadowing any parent value.
    pub fn put(&self, index: usize, value: Option<String>) {
        let mut slot = self.slots[index]
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = match value {
            Some(value) => Slot::Value(value),
            None => Slot::Cleared,
        };
    }

    /// Reads a field by name, case-folding the lookup.
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<String> {
        self.plan.index_of(name).and_then(|index| self.get(index))
    }

    /// Writes a field by name. Unknown names are dropped, matching the
    /// configured-fields-only contract.
    pub fn put_by_name(&self, name: &str, value: Option<String>) -> bool {
        match self.plan.index_of(name) {
            Some(index) => {
                self.put(index, value);
                true
            }
            None => false,
        }
    }

    /// Snapshot of all present fields, assembled in field-declaration order.
    #[must_use]
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for (index, name) in self.plan.field_names().iter().enumerate() {
            if let Some(value) = self.get(index) {
                map.insert(name.clone(), value);
            }
        }
        map
    }
}
