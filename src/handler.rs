//! Finished-span handlers and their composition.
//!
//! Handlers run synchronously when the tracer finalizes a span. They compose
//! into a single in-order pipeline that short-circuits on the first `false`,
//! and every member is wrapped so that a shutdown flag or a panicking handler
//! drops the span from that member instead of crashing the tracing path.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::error;

use crate::context::TraceContext;
use crate::span::MutableSpan;

/// Observes and mutates finished spans.
pub trait FinishedSpanHandler: Send + Sync {
    /// Processes a finished span. Returning `false` drops the span from any
    /// later handler in the pipeline.
    fn handle(&self, context: &TraceContext, span: &mut MutableSpan) -> bool;

    /// When `true`, the tracer records spans for this handler even when the
    /// primary decision said no.
    fn always_sample_local(&self) -> bool {
        false
    }

    /// Members of a composite handler, used to flatten nested compositions.
    #[doc(hidden)]
    fn composite_members(&self) -> Option<&[Arc<dyn FinishedSpanHandler>]> {
        None
    }
}

/// Handler that accepts every span and does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopFinishedSpanHandler;

impl FinishedSpanHandler for NoopFinishedSpanHandler {
    fn handle(&self, _context: &TraceContext, _span: &mut MutableSpan) -> bool {
        true
    }
}

/// Composes handlers in order. An empty set becomes a noop, a singleton is
/// returned as-is, and nested composites flatten so the hot path iterates a
/// single flat array.
#[must_use]
pub fn compose(handlers: Vec<Arc<dyn FinishedSpanHandler>>) -> Arc<dyn FinishedSpanHandler> {
    let mut flat: Vec<Arc<dyn FinishedSpanHandler>> = Vec::with_capacity(handlers.len());
    let mut always_sample_local = false;
    for handler in handlers {
        if handler.always_sample_local() {
            always_sample_local = true;
        }
        match handler.composite_members() {
            Some(members) => flat.extend(members.iter().map(Arc::clone)),
            None => flat.push(handler),
        }
    }

    if flat.is_empty() {
        return Arc::new(NoopFinishedSpanHandler);
    }
    if flat.len() == 1 {
        if let Some(only) = flat.pop() {
            return only;
        }
    }
    Arc::new(CompositeFinishedSpanHandler {
        handlers: flat,
        always_sample_local,
    })
}

struct CompositeFinishedSpanHandler {
    handlers: Vec<Arc<dyn FinishedSpanHandler>>,
    always_sample_local: bool,
}

impl FinishedSpanHandler for CompositeFinishedSpanHandler {
    fn handle(&self, context: &TraceContext, span: &mut MutableSpan) -> bool {
        for handler in &self.handlers {
            if !handler.handle(context, span) {
                return false;
            }
        }
        true
    }

    fn always_sample_local(&self) -> bool {
        self.always_sample_local
    }

    fn composite_members(&self) -> Option<&[Arc<dyn FinishedSpanHandler>]> {
        Some(&self.handlers)
    }
}

/// Wraps a handler so that a raised shutdown flag short-circuits to `false`
/// without delegating, and a panicking delegate is logged and treated as
/// `false`.
#[must_use]
pub fn noop_aware(
    handler: Arc<dyn FinishedSpanHandler>,
    noop: Arc<AtomicBool>,
) -> Arc<dyn FinishedSpanHandler> {
    Arc::new(NoopAwareFinishedSpanHandler {
        delegate: handler,
        noop,
    })
}

struct NoopAwareFinishedSpanHandler {
    delegate: Arc<dyn FinishedSpanHandler>,
    noop: Arc<AtomicBool>,
}

impl FinishedSpanHandler for NoopAwareFinishedSpanHandler {
    fn handle(&self, context: &TraceContext, span: &mut MutableSpan) -> bool {
        if self.noop.load(Ordering::Relaxed) {
            return false;
        }
        match catch_unwind(AssertUnwindSafe(|| self.delegate.handle(context, span))) {
            Ok(accepted) => accepted,
            Err(_) => {
                error!(
                    trace_id = context.trace_id,
                    "finished span handler panicked; span dropped from this handler"
                );
                false
            }
        }
    }

    fn always_sample_local(&self) -> bool {
        self.delegate.always_sample_local()
    }
}

/// The composed set of finished-span handlers a tracer drives.
///
/// Holds the plugin-contributed handlers and any user-registered ones, each
/// wrapped for shutdown awareness and panic containment.
pub struct FinishedSpanPipeline {
    handlers: Vec<Arc<dyn FinishedSpanHandler>>,
    always_sample_local: bool,
    noop: Arc<AtomicBool>,
}

impl FinishedSpanPipeline {
    /// Builds a pipeline over the given handlers, in order.
    #[must_use]
    pub fn new(handlers: Vec<Arc<dyn FinishedSpanHandler>>) -> Self {
        let noop = Arc::new(AtomicBool::new(false));
        let always_sample_local = handlers.iter().any(|h| h.always_sample_local());
        let handlers = handlers
            .into_iter()
            .map(|handler| noop_aware(handler, Arc::clone(&noop)))
            .collect();
        Self {
            handlers,
            always_sample_local,
            noop,
        }
    }

    /// Runs every handler in order, short-circuiting on the first `false`.
    /// After [`shutdown`](Self::shutdown) this returns `false` without
    /// invoking any delegate.
    pub fn handle(&self, context: &TraceContext, span: &mut MutableSpan) -> bool {
        if self.noop.load(Ordering::Relaxed) {
            return false;
        }
        for handler in &self.handlers {
            if !handler.handle(context, span) {
                return false;
            }
        }
        true
    }

    /// Whether any member wants spans recorded regardless of the primary
    /// decision. Consulted by the tracer at span creation.
    #[must_use]
    pub fn always_sample_local(&self) -> bool {
        self.always_sample_local
    }

    /// Marks the tracing subsystem as shut down; every subsequent span is
    /// dropped without reaching a delegate.
    pub fn shutdown(&self) {
        self.noop.store(true, Ordering::Relaxed);
    }
}
