//! Propagation plugins and their per-call field updaters.
//!
//! A plugin declares the logical fields it cares about and hands out one
//! updater per extract or inject call. Updaters see every configured field
//! name, in configured order, whether or not a value is present, and may
//! rewrite or delete values. Panics inside an updater are contained: the
//! field keeps the value it had, and the fault is logged.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

use crate::context::{ExtractionBuilder, TraceContext};
use crate::handler::{self, FinishedSpanHandler};

/// Per-extraction field updater. Returning `None` deletes the field.
///
/// The builder argument allows overlays to flag
/// [`sampled_local`](ExtractionBuilder::sampled_local) or override the
/// primary decision while values stream past.
pub trait ExtractUpdater {
    /// Maps a field value, observing or mutating the extraction in flight.
    fn update(
        &mut self,
        builder: &mut ExtractionBuilder,
        name: &str,
        value: Option<String>,
    ) -> Option<String>;
}

/// Per-injection field updater. Returning `None` keeps the field off the
/// carrier.
pub trait InjectUpdater {
    /// Maps a field value on its way to the carrier.
    fn update(
        &mut self,
        context: &TraceContext,
        name: &str,
        value: Option<String>,
    ) -> Option<String>;
}

/// Updater that passes every value through unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopUpdater;

impl ExtractUpdater for NoopUpdater {
    fn update(
        &mut self,
        _builder: &mut ExtractionBuilder,
        _name: &str,
        value: Option<String>,
    ) -> Option<String> {
        value
    }
}

impl InjectUpdater for NoopUpdater {
    fn update(
        &mut self,
        _context: &TraceContext,
        _name: &str,
        value: Option<String>,
    ) -> Option<String> {
        value
    }
}

/// A self-contained propagation extension.
///
/// Plugins contribute their field names to the factory's plan at build time
/// and are consulted once per extract and inject call for a fresh updater.
/// A plugin may also contribute a finished-span handler, most commonly to
/// coordinate out-of-band data with its in-band fields.
pub trait Plugin: Send + Sync {
    /// Unique lowercase field names this plugin observes.
    fn field_names(&self) -> &[String];

    /// A fresh updater for one extraction.
    fn extract_updater(&self) -> Box<dyn ExtractUpdater + '_> {
        Box::new(NoopUpdater)
    }

    /// A fresh updater for one injection.
    fn inject_updater(&self) -> Box<dyn InjectUpdater + '_> {
        Box::new(NoopUpdater)
    }

    /// Handler to run when spans finish, if this plugin needs one.
    fn finished_span_handler(&self) -> Option<Arc<dyn FinishedSpanHandler>> {
        None
    }

    /// Members of a composite plugin, used to flatten nested chains.
    #[doc(hidden)]
    fn chain_members(&self) -> Option<&[Arc<dyn Plugin>]> {
        None
    }
}

/// Deletes the configured fields on injection, unconditionally.
///
/// Appended last to the chain so that no later updater can resurrect a
/// redacted value.
pub(crate) struct RedactOnInject {
    field_names: Vec<String>,
}

impl RedactOnInject {
    pub(crate) fn new(field_names: Vec<String>) -> Self {
        Self { field_names }
    }
}

impl Plugin for RedactOnInject {
    fn field_names(&self) -> &[String] {
        &self.field_names
    }

    fn inject_updater(&self) -> Box<dyn InjectUpdater + '_> {
        Box::new(RedactUpdater {
            names: &self.field_names,
        })
    }
}

struct RedactUpdater<'a> {
    names: &'a [String],
}

impl InjectUpdater for RedactUpdater<'_> {
    fn update(
        &mut self,
        _context: &TraceContext,
        name: &str,
        value: Option<String>,
    ) -> Option<String> {
        if self.names.iter().any(|n| n == name) {
            None
        } else {
            value
        }
    }
}

/// Ordered list of plugins, itself usable as a plugin.
///
/// Composition is associative: nested chains flatten on construction, so the
/// hot-path updater arrays stay as short as the real plugin count. The
/// chain's field-name set is the insertion-ordered union of its members'.
pub struct PluginChain {
    plugins: Vec<Arc<dyn Plugin>>,
    field_names: Vec<String>,
}

impl PluginChain {
    /// Builds a chain, flattening any composite members.
    #[must_use]
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        let mut flat: Vec<Arc<dyn Plugin>> = Vec::with_capacity(plugins.len());
        for plugin in plugins {
            match plugin.chain_members() {
                Some(members) => flat.extend(members.iter().map(Arc::clone)),
                None => flat.push(plugin),
            }
        }

        let mut field_names: Vec<String> = Vec::new();
        for plugin in &flat {
            for name in plugin.field_names() {
                if !field_names.iter().any(|n| n == name) {
                    field_names.push(name.clone());
                }
            }
        }

        Self {
            plugins: flat,
            field_names,
        }
    }

    /// The flattened members, in configured order.
    #[must_use]
    pub fn members(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    /// Whether the chain has no members at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Composition of the members' finished-span handlers, in configured
    /// order, or `None` when no member contributes one.
    #[must_use]
    pub fn composed_finished_span_handler(&self) -> Option<Arc<dyn FinishedSpanHandler>> {
        let handlers: Vec<_> = self
            .plugins
            .iter()
            .filter_map(|plugin| plugin.finished_span_handler())
            .collect();
        if handlers.is_empty() {
            None
        } else {
            Some(handler::compose(handlers))
        }
    }
}

impl Plugin for PluginChain {
    fn field_names(&self) -> &[String] {
        &self.field_names
    }

    fn extract_updater(&self) -> Box<dyn ExtractUpdater + '_> {
        Box::new(CompositeExtractUpdater {
            updaters: self
                .plugins
                .iter()
                .map(|plugin| plugin.extract_updater())
                .collect(),
        })
    }

    fn inject_updater(&self) -> Box<dyn InjectUpdater + '_> {
        Box::new(CompositeInjectUpdater {
            updaters: self
                .plugins
                .iter()
                .map(|plugin| plugin.inject_updater())
                .collect(),
        })
    }

    fn finished_span_handler(&self) -> Option<Arc<dyn FinishedSpanHandler>> {
        self.composed_finished_span_handler()
    }

    fn chain_members(&self) -> Option<&[Arc<dyn Plugin>]> {
        Some(&self.plugins)
    }
}

struct CompositeExtractUpdater<'a> {
    updaters: Vec<Box<dyn ExtractUpdater + 'a>>,
}

impl ExtractUpdater for CompositeExtractUpdater<'_> {
    fn update(
        &mut self,
        builder: &mut ExtractionBuilder,
        name: &str,
        value: Option<String>,
    ) -> Option<String> {
        let mut value = value;
        for updater in &mut self.updaters {
            value = run_extract_updater(updater.as_mut(), builder, name, value);
        }
        value
    }
}

struct CompositeInjectUpdater<'a> {
    updaters: Vec<Box<dyn InjectUpdater + 'a>>,
}

impl InjectUpdater for CompositeInjectUpdater<'_> {
    fn update(
        &mut self,
        context: &TraceContext,
        name: &str,
        value: Option<String>,
    ) -> Option<String> {
        let mut value = value;
        for updater in &mut self.updaters {
            value = run_inject_updater(updater.as_mut(), context, name, value);
        }
        value
    }
}

/// Runs one extract updater, containing panics: the field keeps its previous
/// value and the remaining updaters still run.
pub(crate) fn run_extract_updater(
    updater: &mut dyn ExtractUpdater,
    builder: &mut ExtractionBuilder,
    name: &str,
    value: Option<String>,
) -> Option<String> {
    let fallback = value.clone();
    match catch_unwind(AssertUnwindSafe(|| updater.update(builder, name, value))) {
        Ok(updated) => updated,
        Err(_) => {
            error!(field = name, "extract updater panicked; value passed through unchanged");
            fallback
        }
    }
}

/// Runs one inject updater with the same containment as
/// [`run_extract_updater`].
pub(crate) fn run_inject_updater(
    updater: &mut dyn InjectUpdater,
    context: &TraceContext,
    name: &str,
    value: Option<String>,
) -> Option<String> {
    let fallback = value.clone();
    match catch_unwind(AssertUnwindSafe(|| updater.update(context, name, value))) {
        Ok(updated) => updated,
        Err(_) => {
            error!(field = name, "inject updater panicked; value passed through unchanged");
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Appender {
        fields: Vec<String>,
        suffix: &'static str,
    }

    impl Appender {
        fn new(suffix: &'static str) -> Self {
            Self {
                fields: vec!["field".to_string()],
                suffix,
            }
        }
    }

    impl Plugin for Appender {
        fn field_names(&self) -> &[String] {
            &self.fields
        }

        fn extract_updater(&self) -> Box<dyn ExtractUpdater + '_> {
            let suffix = self.suffix;
            struct Updater(&'static str);
            impl ExtractUpdater for Updater {
                fn update(
                    &mut self,
                    _builder: &mut ExtractionBuilder,
                    _name: &str,
                    value: Option<String>,
                ) -> Option<String> {
                    Some(format!("{}{}", value.unwrap_or_default(), self.0))
                }
            }
            Box::new(Updater(suffix))
        }
    }

    #[test]
    fn updaters_run_in_configured_order() {
        let chain = PluginChain::new(vec![
            Arc::new(Appender::new("a")),
            Arc::new(Appender::new("b")),
        ]);
        let mut builder = ExtractionBuilder::new();
        let mut updater = chain.extract_updater();
        let out = updater.update(&mut builder, "field", Some("x".into()));
        assert_eq!(out, Some("xab".into()));
    }

    #[test]
    fn nested_chains_flatten() {
        let inner = PluginChain::new(vec![
            Arc::new(Appender::new("a")),
            Arc::new(Appender::new("b")),
        ]);
        let outer = PluginChain::new(vec![
            Arc::new(inner) as Arc<dyn Plugin>,
            Arc::new(Appender::new("c")),
        ]);
        assert_eq!(outer.members().len(), 3);
        assert_eq!(outer.field_names(), ["field".to_string()]);
    }

    #[test]
    fn redaction_deletes_on_inject_only() {
        let redactor = RedactOnInject::new(vec!["secret".into()]);
        let context = TraceContext::default();

        let mut inject = redactor.inject_updater();
        assert_eq!(inject.update(&context, "secret", Some("x".into())), None);
        assert_eq!(
            inject.update(&context, "public", Some("x".into())),
            Some("x".into())
        );

        let mut builder = ExtractionBuilder::new();
        let mut extract = redactor.extract_updater();
        assert_eq!(
            extract.update(&mut builder, "secret", Some("x".into())),
            Some("x".into())
        );
    }

    struct PanickyUpdater;
    impl ExtractUpdater for PanickyUpdater {
        fn update(
            &mut self,
            _builder: &mut ExtractionBuilder,
            _name: &str,
            _value: Option<String>,
        ) -> Option<String> {
            panic!("boom");
        }
    }

    #[test]
    fn panicking_updater_passes_value_through() {
        let mut builder = ExtractionBuilder::new();
        let mut updater = PanickyUpdater;
        let out = run_extract_updater(&mut updater, &mut builder, "field", Some("kept".into()));
        assert_eq!(out, Some("kept".into()));
    }
}
