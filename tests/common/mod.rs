//! Shared helpers for integration tests.
#![allow(dead_code)] // each test binary uses its own subset

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;

use extra_field_propagation::{FinishedSpanHandler, MutableSpan, SpanKind, TraceContext};

/// Installs a test-writer subscriber so contained faults are visible when a
/// test fails. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Builds a carrier from literal pairs.
pub fn carrier(entries: &[(&str, &str)]) -> HashMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

/// Captures formatted log output so tests can assert on the diagnostic
/// sink. Install with `tracing_subscriber::fmt().with_writer(capture.clone())`
/// under `tracing::subscriber::with_default`.
#[derive(Clone, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().expect("capture lock")).into_owned()
    }

    pub fn occurrences(&self, needle: &str) -> usize {
        self.contents().matches(needle).count()
    }
}

impl Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer
            .lock()
            .expect("capture lock")
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Finished-span handler that keeps every span it sees.
#[derive(Default)]
pub struct CollectingHandler {
    spans: Mutex<Vec<MutableSpan>>,
}

impl CollectingHandler {
    pub fn server_span_count(&self) -> usize {
        self.spans
            .lock()
            .expect("collector lock")
            .iter()
            .filter(|span| span.kind == Some(SpanKind::Server))
            .count()
    }

    pub fn span_count(&self) -> usize {
        self.spans.lock().expect("collector lock").len()
    }
}

impl FinishedSpanHandler for CollectingHandler {
    fn handle(&self, _context: &TraceContext, span: &mut MutableSpan) -> bool {
        self.spans.lock().expect("collector lock").push(span.clone());
        true
    }
}
