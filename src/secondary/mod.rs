//! Secondary-sampling overlay.
//!
//! Several tracing systems can share one transport and one instrumentation
//! while deciding independently what to record. The primary (B3-equivalent)
//! decision stays end-to-end; each overlay *system* rides in a single
//! `sampling` header and may force local recording via
//! [`sampled_local`](crate::context::ExtractionBuilder::sampled_local)
//! without disturbing the upstream decision.
//!
//! ```text
//! sampling: edge:ttl=3;links:sampled=1;triage:tps=5
//! ```
//!
//! On extraction, each system configured locally runs a small state machine:
//! explicit `sampled=0` passes through untouched, a sampled system with a
//! TTL decrements it (expiring at 1), and a `tps` target is converted to a
//! decision through a per-system rate limiter. Systems this process is not
//! configured for pass through byte-identically so the next hop can decide.
//!
//! The names of the systems that recorded on this hop accumulate in an
//! in-process `sampled` field. That field is redacted on injection and read
//! back when spans finish, both to tag the span for downstream routers and
//! to dispatch the span to each system's registered handler.

mod rate;
mod state;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use tracing::{error, warn};

use crate::context::{ExtractionBuilder, TraceContext};
use crate::fields;
use crate::handler::FinishedSpanHandler;
use crate::plugin::{ExtractUpdater, InjectUpdater, Plugin};
use crate::span::MutableSpan;

use rate::RateLimiter;
use state::{System, SAMPLED_PARAM, TPS_PARAM, TTL_PARAM};

/// Wire-facing logical field carrying the per-system sampling state.
pub const SAMPLING_FIELD: &str = "sampling";

/// In-process logical field accumulating the systems that recorded on this
/// hop. Redacted on injection; consulted at span finish for routing.
pub const RECORDED_FIELD: &str = "sampled";

type Registry = HashMap<String, Arc<dyn FinishedSpanHandler>>;

struct Inner {
    registry: ArcSwap<Registry>,
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
}

impl Inner {
    fn limiter(&self, name: &str, per_second: u64) -> Arc<RateLimiter> {
        let mut limiters = self
            .limiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            limiters
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(RateLimiter::new(per_second))),
        )
    }
}

/// The overlay plugin. Add it to the factory and keep a handle for runtime
/// registry changes:
///
/// ```
/// use std::sync::Arc;
/// use extra_field_propagation::{B3SinglePropagator, PropagationFactory};
/// use extra_field_propagation::handler::NoopFinishedSpanHandler;
/// use extra_field_propagation::secondary::SecondarySampling;
///
/// let sampling = Arc::new(SecondarySampling::new());
/// sampling.set_system("edge", Arc::new(NoopFinishedSpanHandler));
///
/// let factory = PropagationFactory::builder(Arc::new(B3SinglePropagator))
///     .add_plugin(Arc::clone(&sampling) as _)
///     .build()
///     .expect("valid configuration");
/// ```
///
/// Registry mutations publish an atomic snapshot and take effect on
/// subsequent extractions; nothing on the hot path takes a lock.
pub struct SecondarySampling {
    field_names: Vec<String>,
    inner: Arc<Inner>,
    routing: Arc<SystemRoutingHandler>,
}

impl SecondarySampling {
    /// Creates an overlay with no systems configured.
    #[must_use]
    pub fn new() -> Self {
        let inner = Arc::new(Inner {
            registry: ArcSwap::from_pointee(Registry::new()),
            limiters: Mutex::new(HashMap::new()),
        });
        Self {
            field_names: vec![SAMPLING_FIELD.to_string(), RECORDED_FIELD.to_string()],
            routing: Arc::new(SystemRoutingHandler {
                inner: Arc::clone(&inner),
            }),
            inner,
        }
    }

    /// Configures a system locally, routing its recorded spans to `handler`.
    /// Takes effect for subsequent extractions.
    pub fn set_system(&self, name: impl Into<String>, handler: Arc<dyn FinishedSpanHandler>) {
        let name = name.into();
        self.inner.registry.rcu(|registry| {
            let mut next = Registry::clone(registry);
            next.insert(name.clone(), Arc::clone(&handler));
            next
        });
    }

    /// Removes a system. Its header state passes through untouched from the
    /// next extraction on.
    pub fn remove_system(&self, name: &str) {
        self.inner.registry.rcu(|registry| {
            let mut next = Registry::clone(registry);
            next.remove(name);
            next
        });
    }
}

impl Default for SecondarySampling {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for SecondarySampling {
    fn field_names(&self) -> &[String] {
        &self.field_names
    }

    fn extract_updater(&self) -> Box<dyn ExtractUpdater + '_> {
        Box::new(SecondaryExtractUpdater {
            inner: Arc::clone(&self.inner),
            registry: self.inner.registry.load_full(),
            recorded: Vec::new(),
        })
    }

    fn inject_updater(&self) -> Box<dyn InjectUpdater + '_> {
        Box::new(RecordedFieldRedactor)
    }

    fn finished_span_handler(&self) -> Option<Arc<dyn FinishedSpanHandler>> {
        Some(Arc::clone(&self.routing) as Arc<dyn FinishedSpanHandler>)
    }
}

/// What became of one system after the extraction state machine.
enum Disposition {
    /// Keep on the wire, nothing recorded.
    Keep(System),
    /// Keep on the wire and record this hop.
    Record(System),
    /// Remove from the wire (expired or unreadable).
    Discard,
}

struct SecondaryExtractUpdater {
    inner: Arc<Inner>,
    /// Registry snapshot taken once per extraction.
    registry: Arc<Registry>,
    recorded: Vec<String>,
}

impl ExtractUpdater for SecondaryExtractUpdater {
    fn update(
        &mut self,
        builder: &mut ExtractionBuilder,
        name: &str,
        value: Option<String>,
    ) -> Option<String> {
        if name == SAMPLING_FIELD {
            let raw = value?;
            let mut kept: Vec<System> = Vec::new();
            for system in state::parse(&raw) {
                match self.process(system) {
                    Disposition::Keep(system) => kept.push(system),
                    Disposition::Record(system) => {
                        builder.sampled_local();
                        self.recorded.push(system.name.clone());
                        kept.push(system);
                    }
                    Disposition::Discard => {}
                }
            }
            if kept.is_empty() {
                None
            } else {
                Some(state::serialize(&kept))
            }
        } else if name == RECORDED_FIELD {
            if self.recorded.is_empty() {
                value
            } else {
                let joined = self.recorded.join(",");
                Some(match value {
                    Some(existing) => format!("{joined},{existing}"),
                    None => joined,
                })
            }
        } else {
            value
        }
    }
}

impl SecondaryExtractUpdater {
    fn process(&self, mut system: System) -> Disposition {
        if !self.registry.contains_key(&system.name) {
            // Not ours to decide; the next hop may be configured for it.
            return Disposition::Keep(system);
        }

        match system.param(SAMPLED_PARAM) {
            Some("0") => Disposition::Keep(system),
            Some("1") => Self::apply_ttl(system),
            Some(other) => {
                warn!(
                    system = %system.name,
                    sampled = other,
                    "dropping sampling system with unreadable sampled value"
                );
                Disposition::Discard
            }
            None => match system.param(TPS_PARAM) {
                Some(tps_raw) => match tps_raw.parse::<u64>() {
                    Ok(tps) if tps > 0 => {
                        if self.inner.limiter(&system.name, tps).try_acquire() {
                            // The decision starts on this hop: an accompanying
                            // ttl governs downstream hops un-decremented and
                            // replaces the tps; without one the tps rides on.
                            let keep_tps = system.param(TTL_PARAM).is_none();
                            state::canonicalize(&mut system, None, keep_tps);
                            Disposition::Record(system)
                        } else {
                            Disposition::Keep(system)
                        }
                    }
                    _ => {
                        warn!(
                            system = %system.name,
                            tps = tps_raw,
                            "dropping sampling system with unreadable tps value"
                        );
                        Disposition::Discard
                    }
                },
                // No sampled, no tps: presence of a configured system is an
                // affirmative decision.
                None => Self::apply_ttl(system),
            },
        }
    }

    fn apply_ttl(mut system: System) -> Disposition {
        match system.param(TTL_PARAM) {
            None => Disposition::Record(system),
            Some(ttl_raw) => match ttl_raw.parse::<u64>() {
                Ok(1) => Disposition::Discard, // ttl expired with the previous hop
                Ok(ttl) if ttl > 1 => {
                    state::canonicalize(&mut system, Some(ttl - 1), true);
                    Disposition::Record(system)
                }
                _ => {
                    warn!(
                        system = %system.name,
                        ttl = ttl_raw,
                        "dropping sampling system with unreadable ttl value"
                    );
                    Disposition::Discard
                }
            },
        }
    }
}

/// Keeps the in-process recorded-systems field off the wire.
struct RecordedFieldRedactor;

impl InjectUpdater for RecordedFieldRedactor {
    fn update(
        &mut self,
        _context: &TraceContext,
        name: &str,
        value: Option<String>,
    ) -> Option<String> {
        if name == RECORDED_FIELD {
            None
        } else {
            value
        }
    }
}

/// Tags finished spans for downstream routing and dispatches them to the
/// handlers of the systems that recorded on this hop.
struct SystemRoutingHandler {
    inner: Arc<Inner>,
}

impl FinishedSpanHandler for SystemRoutingHandler {
    fn handle(&self, context: &TraceContext, span: &mut MutableSpan) -> bool {
        let recorded = fields::get(context, RECORDED_FIELD);

        // When the primary decision kept the trace, tag it too so a trace
        // forwarder can route without rerunning any decision.
        let tag = if context.is_sampled() {
            Some(match &recorded {
                Some(systems) => format!("zipkin,{systems}"),
                None => "zipkin".to_string(),
            })
        } else {
            recorded.clone()
        };
        if let Some(tag) = tag {
            span.tag("sampled", tag);
        }

        if let Some(recorded) = recorded {
            let registry = self.inner.registry.load();
            for name in recorded.split(',').map(str::trim) {
                if let Some(handler) = registry.get(name) {
                    let outcome =
                        catch_unwind(AssertUnwindSafe(|| handler.handle(context, &mut *span)));
                    if outcome.is_err() {
                        error!(system = name, "per-system finished span handler panicked");
                    }
                }
            }
        }
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingHandler(AtomicUsize);

    impl CountingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self(AtomicUsize::new(0)))
        }
    }

    impl FinishedSpanHandler for CountingHandler {
        fn handle(&self, _context: &TraceContext, _span: &mut MutableSpan) -> bool {
            self.0.fetch_add(1, Ordering::Relaxed);
            true
        }
    }

    fn run_sampling(overlay: &SecondarySampling, header: &str) -> (Option<String>, bool, Vec<String>) {
        let mut builder = ExtractionBuilder::new();
        let mut updater = SecondaryExtractUpdater {
            inner: Arc::clone(&overlay.inner),
            registry: overlay.inner.registry.load_full(),
            recorded: Vec::new(),
        };
        let out = updater.update(&mut builder, SAMPLING_FIELD, Some(header.to_string()));
        let recorded = updater.recorded.clone();
        let sampled_local = builder
            .build(Arc::new(crate::store::FieldStore::new(Arc::new(
                crate::plan::KeyPlan::new(vec!["f".into()], vec!["f".into()], vec![0]).unwrap(),
            ))))
            .sampled_local;
        (out, sampled_local, recorded)
    }

    fn overlay_with(names: &[&str]) -> SecondarySampling {
        let overlay = SecondarySampling::new();
        for name in names {
            overlay.set_system(*name, CountingHandler::new());
        }
        overlay
    }

    #[test]
    fn unconfigured_systems_pass_through_byte_identically() {
        let overlay = overlay_with(&[]);
        let (out, sampled_local, _) =
            run_sampling(&overlay, "edge:ttl=3;links:sampled=1;triage:tps=5");
        assert_eq!(out.as_deref(), Some("edge:ttl=3;links:sampled=1;triage:tps=5"));
        assert!(!sampled_local);
    }

    #[test]
    fn bare_configured_system_records_and_stays_bare() {
        let overlay = overlay_with(&["links"]);
        let (out, sampled_local, recorded) = run_sampling(&overlay, "links;triage");
        assert_eq!(out.as_deref(), Some("links;triage"));
        assert!(sampled_local);
        assert_eq!(recorded, ["links".to_string()]);
    }

    #[test]
    fn sampled_zero_never_records() {
        let overlay = overlay_with(&["links", "triage"]);
        let (out, sampled_local, _) = run_sampling(&overlay, "links:sampled=0;triage:sampled=0");
        assert_eq!(out.as_deref(), Some("links:sampled=0;triage:sampled=0"));
        assert!(!sampled_local);
    }

    #[test]
    fn ttl_decrements_and_materializes_sampled() {
        let overlay = overlay_with(&["edge"]);
        let (out, sampled_local, recorded) = run_sampling(&overlay, "edge:ttl=3");
        assert_eq!(out.as_deref(), Some("edge:sampled=1,ttl=2"));
        assert!(sampled_local);
        assert_eq!(recorded, ["edge".to_string()]);
    }

    #[test]
    fn ttl_expires_without_recording() {
        let overlay = overlay_with(&["edge"]);
        let (out, sampled_local, recorded) = run_sampling(&overlay, "edge:sampled=1,ttl=1;links");
        assert_eq!(out.as_deref(), Some("links"));
        assert!(!sampled_local);
        assert!(recorded.is_empty());
    }

    #[test]
    fn tps_converts_to_decision_keeping_ttl_undecremented() {
        let overlay = overlay_with(&["edge"]);
        let (out, sampled_local, _) = run_sampling(&overlay, "edge:tps=1,ttl=3");
        assert_eq!(out.as_deref(), Some("edge:sampled=1,ttl=3"));
        assert!(sampled_local);
    }

    #[test]
    fn tps_without_ttl_is_kept_on_admit() {
        let overlay = overlay_with(&["triage"]);
        let (out, sampled_local, _) = run_sampling(&overlay, "triage:tps=5");
        assert_eq!(out.as_deref(), Some("triage:sampled=1,tps=5"));
        assert!(sampled_local);
    }

    #[test]
    fn drained_tps_budget_passes_system_through() {
        let overlay = overlay_with(&["edge"]);
        let (_, first, _) = run_sampling(&overlay, "edge:tps=1");
        assert!(first);

        let (out, second, _) = run_sampling(&overlay, "edge:tps=1");
        assert!(!second, "budget of one per second is spent");
        assert_eq!(out.as_deref(), Some("edge:tps=1"));
    }

    #[test]
    fn explicit_sampled_wins_over_tps() {
        let overlay = overlay_with(&["links"]);
        let (out, sampled_local, _) = run_sampling(&overlay, "links:sampled=0,tps=5");
        assert_eq!(out.as_deref(), Some("links:sampled=0,tps=5"));
        assert!(!sampled_local);
    }

    #[test]
    fn malformed_segment_is_dropped_others_survive() {
        let overlay = overlay_with(&["edge", "links"]);
        let (out, sampled_local, _) = run_sampling(&overlay, "edge:ttl=zero;links:sampled=1");
        assert_eq!(out.as_deref(), Some("links:sampled=1"));
        assert!(sampled_local);
    }

    #[test]
    fn whole_header_consumed_when_everything_expires() {
        let overlay = overlay_with(&["edge"]);
        let (out, _, _) = run_sampling(&overlay, "edge:sampled=1,ttl=1");
        assert_eq!(out, None, "no surviving systems: header omitted");
    }

    #[test]
    fn recorded_field_accumulates_hop_state() {
        let overlay = overlay_with(&["edge", "links"]);
        let mut builder = ExtractionBuilder::new();
        let mut updater = overlay.extract_updater();
        updater.update(&mut builder, SAMPLING_FIELD, Some("edge;links;triage".into()));
        let recorded = updater.update(&mut builder, RECORDED_FIELD, None);
        assert_eq!(recorded.as_deref(), Some("edge,links"));
    }

    #[test]
    fn recorded_field_is_redacted_on_inject() {
        let overlay = overlay_with(&[]);
        let context = TraceContext::default();
        let mut updater = overlay.inject_updater();
        assert_eq!(updater.update(&context, RECORDED_FIELD, Some("edge".into())), None);
        assert_eq!(
            updater.update(&context, SAMPLING_FIELD, Some("edge".into())),
            Some("edge".into())
        );
    }

    #[test]
    fn registry_changes_take_effect_on_subsequent_extractions() {
        let overlay = overlay_with(&["links"]);
        let (_, before, _) = run_sampling(&overlay, "links;triage");
        assert!(before);

        overlay.remove_system("links");
        let (_, after_remove, _) = run_sampling(&overlay, "links;triage");
        assert!(!after_remove);

        overlay.set_system("triage", CountingHandler::new());
        let (_, after_add, _) = run_sampling(&overlay, "links;triage");
        assert!(after_add);
    }
}
