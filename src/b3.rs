//! B3 single-header primary propagator.
//!
//! Carries the primary trace identifiers and sampling decision under one
//! `b3` key:
//!
//! ```text
//! b3: {trace_id}-{span_id}[-{sampling_state}[-{parent_span_id}]]
//! b3: {sampling_state}
//! ```
//!
//! - `trace_id` is 16 or 32 lowercase hex characters (64- or 128-bit).
//! - `span_id` is 16 hex characters.
//! - `sampling_state` is `0` (deny), `1` (accept), or `d` (debug, treated as
//!   accept).
//!
//! The bare sampling-only form lets an upstream express "do not sample"
//! without minting identifiers. Malformed values degrade to an empty,
//! undecided extraction; the host request never fails because of a bad
//! header.

use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

use crate::carrier::{Extractor, Injector};
use crate::context::{ExtractionBuilder, TraceContext};
use crate::propagation::Propagator;

/// Wire key used by the single-header B3 format.
pub const B3_SINGLE_KEY: &str = "b3";

lazy_static! {
    /// `trace_id-span_id[-flag[-parent_span_id]]`, case-insensitive.
    static ref B3_SINGLE_REGEX: Regex = Regex::new(
        r"(?i)^([0-9a-f]{16}|[0-9a-f]{32})-([0-9a-f]{16})(?:-([01d]))?(?:-([0-9a-f]{16}))?$"
    )
    .expect("failed creating regex");

    /// All-zero identifiers are invalid in B3.
    static ref INVALID_SEGMENT_REGEX: Regex = Regex::new(r"^0+$").expect("failed creating regex");
}

/// Propagator for the single-header B3 format.
#[derive(Clone, Copy, Debug, Default)]
pub struct B3SinglePropagator;

impl Propagator for B3SinglePropagator {
    fn extract(&self, carrier: &dyn Extractor) -> ExtractionBuilder {
        let mut builder = ExtractionBuilder::new();
        let Some(value) = carrier.get(B3_SINGLE_KEY) else {
            return builder;
        };

        match value.trim() {
            "0" => {
                builder.sampled(false);
            }
            "1" => {
                builder.sampled(true);
            }
            "d" => {
                // Debug implies an affirmative decision.
                builder.sampled(true);
            }
            trimmed => {
                if let Err(reason) = Self::extract_identifiers(trimmed, &mut builder) {
                    debug!(value = trimmed, reason, "discarding unreadable b3 value");
                    builder = ExtractionBuilder::new();
                }
            }
        }
        builder
    }

    fn inject(&self, context: &TraceContext, carrier: &mut dyn Injector) {
        if context.trace_id != 0 && context.span_id != 0 {
            let trace_id = Self::format_trace_id(context.trace_id);
            let value = match context.sampled {
                Some(sampled) => {
                    format!("{trace_id}-{:016x}-{}", context.span_id, u8::from(sampled))
                }
                None => format!("{trace_id}-{:016x}", context.span_id),
            };
            carrier.set(B3_SINGLE_KEY, value);
        } else if let Some(sampled) = context.sampled {
            carrier.set(B3_SINGLE_KEY, u8::from(sampled).to_string());
        }
    }
}

impl B3SinglePropagator {
    fn extract_identifiers(
        value: &str,
        builder: &mut ExtractionBuilder,
    ) -> Result<(), &'static str> {
        let captures = B3_SINGLE_REGEX
            .captures(value)
            .ok_or("not a b3 single value")?;

        let trace_id = &captures[1];
        let span_id = &captures[2];
        if INVALID_SEGMENT_REGEX.is_match(trace_id) {
            return Err("all-zero trace_id");
        }
        if INVALID_SEGMENT_REGEX.is_match(span_id) {
            return Err("all-zero span_id");
        }

        let trace_id =
            u128::from_str_radix(trace_id, 16).map_err(|_| "failed to decode trace_id")?;
        let span_id = u64::from_str_radix(span_id, 16).map_err(|_| "failed to decode span_id")?;

        builder.trace_id(trace_id).span_id(span_id);
        match captures.get(3).map(|m| m.as_str()) {
            Some("1" | "d") => {
                builder.sampled(true);
            }
            Some("0") => {
                builder.sampled(false);
            }
            _ => {}
        }
        Ok(())
    }

    /// 64-bit trace ids render as 16 hex characters, 128-bit ones as 32.
    fn format_trace_id(trace_id: u128) -> String {
        if trace_id > u128::from(u64::MAX) {
            format!("{trace_id:032x}")
        } else {
            format!("{trace_id:016x}")
        }
    }
}
