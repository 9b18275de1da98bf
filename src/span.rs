//! Finished-span payload handed to span handlers.

/// The role a span played in an exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpanKind {
    /// Handled an incoming request.
    Server,
    /// Issued an outgoing request.
    Client,
    /// Published a message.
    Producer,
    /// Consumed a message.
    Consumer,
}

/// Mutable view of a finished span, as seen by
/// [`FinishedSpanHandler`](crate::handler::FinishedSpanHandler)s.
///
/// Handlers typically add routing tags here; the host reporter serializes the
/// result after the pipeline runs.
#[derive(Clone, Debug, Default)]
pub struct MutableSpan {
    /// Operation name, if the instrumentation set one.
    pub name: Option<String>,
    /// Role of this span in the exchange.
    pub kind: Option<SpanKind>,
    tags: Vec<(String, String)>,
}

impl MutableSpan {
    /// Creates an empty span.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a span with the given kind, the common case in server
    /// instrumentation.
    #[must_use]
    pub fn with_kind(kind: SpanKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    /// Sets a tag, replacing any previous value under the same key.
    pub fn tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(entry) = self.tags.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.tags.push((key, value));
        }
    }

    /// Looks up a tag by key.
    #[must_use]
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All tags, in insertion order.
    pub fn tags(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tags.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
