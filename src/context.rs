//! In-process trace context and the extraction result it is cut from.

use std::sync::Arc;

use crate::store::FieldStore;

/// In-process handle carrying the primary trace identifiers, the primary
/// sampling decision, and the extra-field store.
///
/// The primary `sampled` decision is trace-scoped and propagated end-to-end;
/// it never flips once set. `sampled_local` is a per-process overlay flag that
/// forces recording for the current process regardless of the primary
/// decision.
#[derive(Clone, Debug, Default)]
pub struct TraceContext {
    /// Trace identifier shared by every span in the trace. 64-bit ids occupy
    /// the low bits.
    pub trace_id: u128,
    /// Identifier of the current span.
    pub span_id: u64,
    /// Primary sampling decision, `None` when upstream deferred it.
    pub sampled: Option<bool>,
    /// Overlay decision for this process only; never propagated as-is.
    pub sampled_local: bool,
    /// Extra-field storage. Present on every context produced by extraction
    /// or decoration; absent on bare hand-built contexts.
    pub extra: Option<Arc<FieldStore>>,
}

impl TraceContext {
    /// Whether the primary decision is an affirmative keep.
    #[must_use]
    pub fn is_sampled(&self) -> bool {
        self.sampled == Some(true)
    }
}

/// Everything one extraction produced: the primary identifiers and decision,
/// the overlay flag, and the populated [`FieldStore`].
#[derive(Clone, Debug)]
pub struct ExtractionResult {
    /// Extracted trace identifier, if the carrier had one.
    pub trace_id: Option<u128>,
    /// Extracted span identifier, if the carrier had one.
    pub span_id: Option<u64>,
    /// Primary sampling decision.
    pub sampled: Option<bool>,
    /// Set when at least one plugin asked for local recording.
    pub sampled_local: bool,
    /// Extra-field storage, always present so fields added later in the trace
    /// have somewhere to live.
    pub extra: Arc<FieldStore>,
}

impl ExtractionResult {
    /// Builds the context a tracer would hand to the first local span.
    /// Missing identifiers default to zero; the host is expected to mint
    /// fresh ones in that case.
    #[must_use]
    pub fn into_context(self) -> TraceContext {
        TraceContext {
            trace_id: self.trace_id.unwrap_or_default(),
            span_id: self.span_id.unwrap_or_default(),
            sampled: self.sampled,
            sampled_local: self.sampled_local,
            extra: Some(self.extra),
        }
    }
}

/// Accumulates primary and overlay state while an extraction runs.
///
/// The primary propagator fills the identifiers and initial decision; plugin
/// updaters may then flag [`sampled_local`](Self::sampled_local) or, for
/// overlays that intend to subsume the primary, override the decision with
/// [`sampled`](Self::sampled).
#[derive(Debug, Default)]
pub struct ExtractionBuilder {
    trace_id: Option<u128>,
    span_id: Option<u64>,
    sampled: Option<bool>,
    sampled_local: bool,
}

impl ExtractionBuilder {
    /// A builder with nothing extracted yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the extracted trace identifier.
    pub fn trace_id(&mut self, trace_id: u128) -> &mut Self {
        self.trace_id = Some(trace_id);
        self
    }

    /// Records the extracted span identifier.
    pub fn span_id(&mut self, span_id: u64) -> &mut Self {
        self.span_id = Some(span_id);
        self
    }

    /// Sets the primary sampling decision. When called from a plugin this
    /// overrides the upstream decision permanently for the rest of the trace;
    /// overlays that only want local recording use
    /// [`sampled_local`](Self::sampled_local) instead.
    pub fn sampled(&mut self, sampled: bool) -> &mut Self {
        self.sampled = Some(sampled);
        self
    }

    /// Forces recording in this process without disturbing the primary
    /// decision.
    pub fn sampled_local(&mut self) -> &mut Self {
        self.sampled_local = true;
        self
    }

    /// The decision as currently known, readable by later updaters.
    #[must_use]
    pub fn is_sampled(&self) -> Option<bool> {
        self.sampled
    }

    /// Finalizes the extraction with its field store attached.
    #[must_use]
    pub fn build(self, extra: Arc<FieldStore>) -> ExtractionResult {
        ExtractionResult {
            trace_id: self.trace_id,
            span_id: self.span_id,
            sampled: self.sampled,
            sampled_local: self.sampled_local,
            extra,
        }
    }
}
