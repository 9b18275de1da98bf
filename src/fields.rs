//! Name-based field accessors for explicit contexts.
//!
//! All lookups are case-folded: `get(ctx, "X-User-Id")` and
//! `get(ctx, "x-user-id")` read the same cell. Writes to names that were not
//! configured on the factory are dropped.

use std::collections::HashMap;

use crate::context::{ExtractionResult, TraceContext};

/// Reads a field from a context, or `None` when the field is unset or the
/// context carries no field store.
#[must_use]
pub fn get(context: &TraceContext, name: &str) -> Option<String> {
    context.extra.as_ref()?.get_by_name(name)
}

/// Writes a field on a context. A context without a field store, or a name
/// outside the configured plan, drops the write.
pub fn set(context: &TraceContext, name: &str, value: &str) {
    if let Some(extra) = &context.extra {
        extra.put_by_name(name, Some(value.to_string()));
    }
}

/// All fields present on a context, or empty when it carries no store.
#[must_use]
pub fn get_all(context: &TraceContext) -> HashMap<String, String> {
    context
        .extra
        .as_ref()
        .map(|extra| extra.to_map())
        .unwrap_or_default()
}

/// All fields captured by an extraction, before a context exists.
#[must_use]
pub fn get_all_extracted(result: &ExtractionResult) -> HashMap<String, String> {
    result.extra.to_map()
}
