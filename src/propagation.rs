//! The propagation factory: plan construction and the extract/inject
//! pipelines.
//!
//! A factory wraps a primary propagator and a frozen [`KeyPlan`], and runs
//! the plugin updater chain over every wire key on both directions. Factories
//! are immutable after [`build`](PropagationFactoryBuilder::build) and are
//! shared by every tracer in the process.

use std::sync::Arc;

use crate::carrier::{Extractor, Injector};
use crate::context::{ExtractionBuilder, ExtractionResult, TraceContext};
use crate::error::ConfigError;
use crate::handler::FinishedSpanHandler;
use crate::plan::KeyPlan;
use crate::plugin::{
    run_extract_updater, run_inject_updater, Plugin, PluginChain, RedactOnInject,
};
use crate::store::FieldStore;

/// Extracts and injects the primary trace state (identifiers plus the
/// end-to-end sampling decision).
///
/// The extra-field machinery composes on top of whatever primary format the
/// host uses; [`B3SinglePropagator`](crate::b3::B3SinglePropagator) is the
/// bundled implementation.
pub trait Propagator: Send + Sync {
    /// Reads primary trace state from a carrier. Malformed or missing data
    /// yields an empty, undecided builder; extraction never fails.
    fn extract(&self, carrier: &dyn Extractor) -> ExtractionBuilder;

    /// Writes primary trace state to a carrier.
    fn inject(&self, context: &TraceContext, carrier: &mut dyn Injector);
}

/// Assembles a [`PropagationFactory`].
///
/// ```
/// use std::sync::Arc;
/// use extra_field_propagation::{B3SinglePropagator, PropagationFactory};
///
/// let factory = PropagationFactory::builder(Arc::new(B3SinglePropagator))
///     .add_field("x-vcap-request-id")
///     .add_prefixed_fields("baggage-", &["country-code", "user-id"])
///     .add_redacted_field("internal-token")
///     .build()
///     .expect("valid configuration");
/// ```
pub struct PropagationFactoryBuilder {
    primary: Arc<dyn Propagator>,
    field_names: Vec<String>,
    prefixed: Vec<(String, Vec<String>)>,
    redacted: Vec<String>,
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PropagationFactoryBuilder {
    fn new(primary: Arc<dyn Propagator>) -> Self {
        Self {
            primary,
            field_names: Vec::new(),
            prefixed: Vec::new(),
            redacted: Vec::new(),
            plugins: Vec::new(),
        }
    }

    /// Adds a field referenced the same in-process as on the wire.
    #[must_use]
    pub fn add_field(mut self, name: impl Into<String>) -> Self {
        self.field_names.push(name.into());
        self
    }

    /// Adds fields that travel under `prefix` on the wire. The field
    /// "country-code" under prefix "baggage-" egresses as
    /// "baggage-country-code" while in-process code keeps using the bare
    /// name.
    #[must_use]
    pub fn add_prefixed_fields(mut self, prefix: impl Into<String>, names: &[&str]) -> Self {
        self.prefixed.push((
            prefix.into(),
            names.iter().map(|n| (*n).to_string()).collect(),
        ));
        self
    }

    /// Adds a field kept in-process but never written to a carrier.
    #[must_use]
    pub fn add_redacted_field(mut self, name: impl Into<String>) -> Self {
        self.redacted.push(name.into());
        self
    }

    /// Adds a plugin. Its field names join the plan; its updaters run in
    /// registration order on every extract and inject call.
    #[must_use]
    pub fn add_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Validates the configuration and freezes the plan.
    pub fn build(self) -> Result<PropagationFactory, ConfigError> {
        let mut fields: Vec<String> = Vec::new();
        for name in &self.field_names {
            let name = validate_field_name(name)?;
            if !fields.contains(&name) {
                fields.push(name);
            }
        }

        let mut plugins = self.plugins;
        for plugin in &plugins {
            if plugin.field_names().is_empty() {
                return Err(ConfigError::EmptyPlugin);
            }
            for name in plugin.field_names() {
                validate_field_name(name)?;
            }
        }

        let mut redacted: Vec<String> = Vec::new();
        for name in &self.redacted {
            let name = validate_field_name(name)?;
            if redacted.contains(&name) {
                return Err(ConfigError::DuplicateRedactedField(name));
            }
            redacted.push(name);
        }
        if !redacted.is_empty() {
            // Redaction can only be guaranteed when last.
            plugins.push(Arc::new(RedactOnInject::new(redacted)));
        }
        let chain = PluginChain::new(plugins);

        for name in chain.field_names() {
            let name = validate_field_name(name)?;
            if !fields.contains(&name) {
                fields.push(name);
            }
        }

        // First pass: every field is reachable under its own name.
        let mut wire_keys = fields.clone();
        let mut wire_to_field: Vec<usize> = (0..fields.len()).collect();

        // Second pass: prefixed keys, aliasing onto existing fields where the
        // bare name is already configured.
        for (prefix, names) in &self.prefixed {
            if prefix.is_empty() {
                return Err(ConfigError::EmptyPrefix);
            }
            if names.is_empty() {
                return Err(ConfigError::EmptyPrefixGroup(prefix.clone()));
            }
            let prefix = prefix.to_lowercase();
            let mut group: Vec<String> = Vec::new();
            for name in names {
                let name = validate_field_name(name)?;
                if !group.contains(&name) {
                    group.push(name);
                }
            }
            for name in group {
                let field_index = match fields.iter().position(|f| *f == name) {
                    Some(index) => index,
                    None => {
                        fields.push(name.clone());
                        fields.len() - 1
                    }
                };
                let wire_key = format!("{prefix}{name}");
                if wire_keys.contains(&wire_key) {
                    return Err(ConfigError::DuplicateWireKey(wire_key));
                }
                wire_keys.push(wire_key);
                wire_to_field.push(field_index);
            }
        }

        let plan = Arc::new(KeyPlan::new(fields, wire_keys, wire_to_field)?);
        Ok(PropagationFactory {
            primary: self.primary,
            plan,
            chain,
        })
    }
}

/// Composes a primary propagator with extra-field propagation.
///
/// Process-lifetime; one factory serves every tracer built atop it. All
/// contexts it creates share one [`KeyPlan`].
pub struct PropagationFactory {
    primary: Arc<dyn Propagator>,
    plan: Arc<KeyPlan>,
    chain: PluginChain,
}

impl PropagationFactory {
    /// Wraps a primary propagator, pushing one or more plainly named fields.
    pub fn new(primary: Arc<dyn Propagator>, field_names: &[&str]) -> Result<Self, ConfigError> {
        let mut builder = Self::builder(primary);
        for name in field_names {
            builder = builder.add_field(*name);
        }
        builder.build()
    }

    /// Starts a builder for configurations with prefixes, redaction, or
    /// plugins.
    #[must_use]
    pub fn builder(primary: Arc<dyn Propagator>) -> PropagationFactoryBuilder {
        PropagationFactoryBuilder::new(primary)
    }

    /// The frozen field/key layout.
    #[must_use]
    pub fn plan(&self) -> &Arc<KeyPlan> {
        &self.plan
    }

    /// Composition of the plugins' finished-span handlers, for registration
    /// with the host's [`FinishedSpanPipeline`](crate::handler::FinishedSpanPipeline).
    #[must_use]
    pub fn finished_span_handler(&self) -> Option<Arc<dyn FinishedSpanHandler>> {
        self.chain.composed_finished_span_handler()
    }

    /// Extracts primary state and every configured wire key from a carrier.
    ///
    /// A field store is always attached, even when the carrier is empty, so
    /// that fields set later in the trace have somewhere to live.
    pub fn extract(&self, carrier: &dyn Extractor) -> ExtractionResult {
        let mut builder = self.primary.extract(carrier);

        let members = self.chain.members();
        let mut updaters: Vec<_> = members
            .iter()
            .map(|plugin| plugin.extract_updater())
            .collect();

        let store = FieldStore::new(Arc::clone(&self.plan));
        for (wire_index, wire_key) in self.plan.wire_keys().iter().enumerate() {
            let field_index = self.plan.field_for_wire(wire_index);
            let name = self.plan.field_name(field_index);
            let mut value = carrier.get(wire_key).map(str::to_string);
            for updater in &mut updaters {
                value = run_extract_updater(updater.as_mut(), &mut builder, name, value);
            }
            if value.is_some() {
                store.put(field_index, value);
            }
        }

        builder.build(Arc::new(store))
    }

    /// Injects primary state and every surviving field value into a carrier.
    ///
    /// Each wire key is written at most once; a field whose final value is
    /// absent leaves its wire keys unwritten. Aliased wire keys read the same
    /// cell but each gets its own egress decision.
    pub fn inject(&self, context: &TraceContext, carrier: &mut dyn Injector) {
        self.primary.inject(context, carrier);

        let Some(store) = &context.extra else {
            return;
        };

        let members = self.chain.members();
        let mut updaters: Vec<_> = members
            .iter()
            .map(|plugin| plugin.inject_updater())
            .collect();

        for (wire_index, wire_key) in self.plan.wire_keys().iter().enumerate() {
            let field_index = self.plan.field_for_wire(wire_index);
            let name = self.plan.field_name(field_index);
            let mut value = store.get(field_index);
            for updater in &mut updaters {
                value = run_inject_updater(updater.as_mut(), context, name, value);
            }
            if let Some(value) = value {
                carrier.set(wire_key, value);
            }
        }
    }

    /// Returns a copy of `context` whose field store is a copy-on-write child
    /// of the original's (or a fresh store when the context had none). Spans
    /// created in the child scope see the parent's fields but may shadow them
    /// without corrupting the parent.
    #[must_use]
    pub fn decorate(&self, context: &TraceContext) -> TraceContext {
        let mut child = context.clone();
        child.extra = Some(Arc::new(match &context.extra {
            Some(parent) => FieldStore::child(parent),
            None => FieldStore::new(Arc::clone(&self.plan)),
        }));
        child
    }
}

fn validate_field_name(name: &str) -> Result<String, ConfigError> {
    let name = name.trim().to_lowercase();
    if name.is_empty() {
        return Err(ConfigError::EmptyFieldName);
    }
    Ok(name)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::b3::B3SinglePropagator;
    use crate::fields;

    fn factory() -> PropagationFactory {
        PropagationFactory::builder(Arc::new(B3SinglePropagator))
            .add_field("x-vcap-request-id")
            .add_prefixed_fields("baggage-", &["country-code", "user-id"])
            .build()
            .unwrap()
    }

    #[test]
    fn plan_layout_matches_declarations() {
        let factory = factory();
        let plan = factory.plan();
        assert_eq!(
            plan.field_names(),
            [
                "x-vcap-request-id".to_string(),
                "country-code".to_string(),
                "user-id".to_string(),
            ]
        );
        assert_eq!(
            plan.wire_keys(),
            [
                "x-vcap-request-id".to_string(),
                "baggage-country-code".to_string(),
                "baggage-user-id".to_string(),
            ]
        );
    }

    #[test]
    fn prefixed_name_aliases_existing_field() {
        let factory = PropagationFactory::builder(Arc::new(B3SinglePropagator))
            .add_field("user-id")
            .add_prefixed_fields("baggage-", &["user-id"])
            .build()
            .unwrap();
        let plan = factory.plan();
        assert_eq!(plan.field_names(), ["user-id".to_string()]);
        assert_eq!(plan.field_for_wire(0), plan.field_for_wire(1));
    }

    #[test]
    fn names_are_lowercased_and_deduped() {
        let factory = PropagationFactory::new(
            Arc::new(B3SinglePropagator),
            &["X-Vcap-Request-Id", "x-vcap-request-id"],
        )
        .unwrap();
        assert_eq!(
            factory.plan().field_names(),
            ["x-vcap-request-id".to_string()]
        );
    }

    #[test]
    fn empty_field_name_is_rejected() {
        let result = PropagationFactory::new(Arc::new(B3SinglePropagator), &["  "]);
        assert!(matches!(result, Err(ConfigError::EmptyFieldName)));
    }

    #[test]
    fn empty_prefix_is_rejected() {
        let result = PropagationFactory::builder(Arc::new(B3SinglePropagator))
            .add_prefixed_fields("", &["user-id"])
            .build();
        assert!(matches!(result, Err(ConfigError::EmptyPrefix)));
    }

    #[test]
    fn duplicate_redacted_field_is_rejected() {
        let result = PropagationFactory::builder(Arc::new(B3SinglePropagator))
            .add_redacted_field("token")
            .add_redacted_field("token")
            .build();
        assert!(matches!(
            result,
            Err(ConfigError::DuplicateRedactedField(name)) if name == "token"
        ));
    }

    #[test]
    fn colliding_prefixed_key_is_rejected() {
        let result = PropagationFactory::builder(Arc::new(B3SinglePropagator))
            .add_field("baggage-user-id")
            .add_prefixed_fields("baggage-", &["user-id"])
            .build();
        assert!(matches!(
            result,
            Err(ConfigError::DuplicateWireKey(key)) if key == "baggage-user-id"
        ));
    }

    #[test]
    fn extract_reads_prefixed_keys_into_bare_fields() {
        let factory = factory();
        let carrier = HashMap::from([
            ("baggage-country-code".to_string(), "FO".to_string()),
            ("x-vcap-request-id".to_string(), "abcd".to_string()),
        ]);

        let context = factory.extract(&carrier).into_context();
        assert_eq!(fields::get(&context, "country-code"), Some("FO".into()));
        assert_eq!(fields::get(&context, "x-vcap-request-id"), Some("abcd".into()));
    }

    #[test]
    fn inject_writes_all_aliases_of_a_cell() {
        let factory = PropagationFactory::builder(Arc::new(B3SinglePropagator))
            .add_field("user-id")
            .add_prefixed_fields("baggage-", &["user-id"])
            .build()
            .unwrap();

        let context = factory.decorate(&TraceContext::default());
        fields::set(&context, "user-id", "19");

        let mut carrier: HashMap<String, String> = HashMap::new();
        factory.inject(&context, &mut carrier);
        assert_eq!(Extractor::get(&carrier, "user-id"), Some("19"));
        assert_eq!(Extractor::get(&carrier, "baggage-user-id"), Some("19"));
    }

    #[test]
    fn later_alias_wins_the_shared_cell_on_extract() {
        let factory = PropagationFactory::builder(Arc::new(B3SinglePropagator))
            .add_field("user-id")
            .add_prefixed_fields("baggage-", &["user-id"])
            .build()
            .unwrap();

        let carrier = HashMap::from([
            ("user-id".to_string(), "first".to_string()),
            ("baggage-user-id".to_string(), "second".to_string()),
        ]);
        let result = factory.extract(&carrier);
        assert_eq!(
            fields::get_all_extracted(&result).get("user-id"),
            Some(&"second".to_string())
        );
    }

    #[test]
    fn absent_fields_are_not_written_as_empty() {
        let factory = factory();
        let context = factory.decorate(&TraceContext::default());

        let mut carrier: HashMap<String, String> = HashMap::new();
        factory.inject(&context, &mut carrier);
        assert!(carrier.is_empty());
    }

    #[test]
    fn decorate_layers_a_copy_on_write_store() {
        let factory = factory();
        let parent = factory.decorate(&TraceContext::default());
        fields::set(&parent, "country-code", "FO");

        let child = factory.decorate(&parent);
        assert_eq!(fields::get(&child, "country-code"), Some("FO".into()));

        fields::set(&child, "country-code", "IS");
        assert_eq!(fields::get(&child, "country-code"), Some("IS".into()));
        assert_eq!(fields::get(&parent, "country-code"), Some("FO".into()));
    }
}
