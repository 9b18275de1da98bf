//! # Extra-field propagation
//!
//! This crate carries named, request-scoped string fields alongside a primary
//! trace identifier across process boundaries, and lets pluggable
//! sampling-overlay policies observe and mutate those fields on extraction and
//! injection.
//!
//! ## Overview
//!
//! A [`PropagationFactory`](propagation::PropagationFactory) wraps a primary
//! propagator (B3 by default) and a fixed plan of logical fields. On the wire,
//! each field travels under one or more *wire keys*; in-process, code reads and
//! writes fields by their lowercase logical names. Plugins see every configured
//! field on each extract and inject call and may rewrite or drop values; a
//! redaction plugin, when configured, always runs last on egress.
//!
//! ```text
//! Incoming carrier
//!   ↓
//! primary extract (b3)
//!   ↓
//! plugin updater chain, per wire key  →  FieldStore
//!   ↓
//! ExtractionResult { trace ids, sampled, sampled_local, extra }
//!   ...
//! TraceContext
//!   ↓
//! primary inject (b3)
//!   ↓
//! plugin updater chain (redaction last), per wire key
//!   ↓
//! Outgoing carrier
//! ```
//!
//! ## Sampling overlays
//!
//! [`secondary::SecondarySampling`] is a concrete plugin family that parses a
//! multi-system `sampling` header, applies TTL and rate-based decisions for
//! locally configured systems, and routes finished spans to per-system
//! handlers. Systems that are not configured locally pass through unchanged so
//! that unrelated tracing systems can share one transport.
//!
//! ## Appropriate usage
//!
//! Fields are visible to any code in the same process; this is not a secure
//! credential channel. Prefer wrapping the accessors in your own types rather
//! than exposing this crate's API to business code.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod b3;
pub mod carrier;
pub mod context;
pub mod current;
pub mod error;
pub mod fields;
pub mod handler;
pub mod plan;
pub mod plugin;
pub mod propagation;
pub mod secondary;
pub mod span;
pub mod store;

pub use b3::B3SinglePropagator;
pub use carrier::{Extractor, Injector};
pub use context::{ExtractionBuilder, ExtractionResult, TraceContext};
pub use error::ConfigError;
pub use handler::{FinishedSpanHandler, FinishedSpanPipeline};
pub use plan::KeyPlan;
pub use plugin::{ExtractUpdater, InjectUpdater, Plugin, PluginChain};
pub use propagation::{Propagator, PropagationFactory, PropagationFactoryBuilder};
pub use secondary::SecondarySampling;
pub use span::{MutableSpan, SpanKind};
pub use store::FieldStore;
