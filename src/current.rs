//! Process-wide current-context publication.
//!
//! Hosts that want the name-only accessors (`get("user-id")` with no explicit
//! context) publish the active context here at scope entry and restore the
//! previous one at scope exit. The slot is read-mostly: lookups load an atomic
//! snapshot, and replacement happens only when the tracer switches scopes.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use lazy_static::lazy_static;

use crate::context::TraceContext;
use crate::fields;

lazy_static! {
    static ref CURRENT_CONTEXT: ArcSwapOption<TraceContext> = ArcSwapOption::empty();
}

/// The context currently published for this process, if any.
#[must_use]
pub fn current() -> Option<Arc<TraceContext>> {
    CURRENT_CONTEXT.load_full()
}

/// Publishes `context` and returns a guard that restores the previous
/// publication when dropped.
#[must_use]
pub fn attach(context: TraceContext) -> Scope {
    let previous = CURRENT_CONTEXT.swap(Some(Arc::new(context)));
    Scope { previous }
}

/// Restores the previously published context on drop.
#[derive(Debug)]
pub struct Scope {
    previous: Option<Arc<TraceContext>>,
}

impl Drop for Scope {
    fn drop(&mut self) {
        CURRENT_CONTEXT.store(self.previous.take());
    }
}

/// Reads a field from the current context, or `None` when no context is
/// published. The lookup is case-folded.
#[must_use]
pub fn get(name: &str) -> Option<String> {
    current().and_then(|context| fields::get(&context, name))
}

/// Writes a field on the current context; dropped when no context is
/// published or the name is not configured.
pub fn set(name: &str, value: &str) {
    if let Some(context) = current() {
        fields::set(&context, name, value);
    }
}

/// All fields of the current context, or empty when none is published.
#[must_use]
pub fn get_all() -> HashMap<String, String> {
    current()
        .map(|context| fields::get_all(&context))
        .unwrap_or_default()
}
