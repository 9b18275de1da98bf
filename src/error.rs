//! Build-time configuration errors.
//!
//! All hot-path failures (malformed headers, panicking plugins) degrade in
//! place and are logged; the only errors surfaced to callers are the ones
//! raised while building a propagation factory.

use thiserror::Error;

/// Rejected factory configuration.
///
/// Raised by [`PropagationFactoryBuilder::build`](crate::propagation::PropagationFactoryBuilder::build)
/// and never from extraction or injection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A field name was empty (or whitespace-only) after trimming.
    #[error("field name is empty")]
    EmptyFieldName,

    /// A prefix group was declared with an empty prefix.
    #[error("prefix is empty")]
    EmptyPrefix,

    /// A prefix group was declared with no field names.
    #[error("prefixed field group `{0}` has no field names")]
    EmptyPrefixGroup(String),

    /// A plugin declared no field names.
    #[error("plugin declares no field names")]
    EmptyPlugin,

    /// The same field was declared redacted more than once.
    #[error("field `{0}` is already declared redacted")]
    DuplicateRedactedField(String),

    /// Two declarations produced the same wire key.
    #[error("wire key `{0}` is declared twice")]
    DuplicateWireKey(String),
}
