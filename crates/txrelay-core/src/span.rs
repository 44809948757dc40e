//! Relay spans and their export.
//!
//! Spans are recorded per batch and only handed to an exporter once the
//! batch's transaction has committed. An aborted batch discards its spans, so
//! a retried batch never emits duplicates.

use crate::propagation::{self, CausalityToken};
use chrono::{DateTime, Utc};
use opentelemetry::trace::{Link, SpanId, SpanKind};
use opentelemetry::{Key, KeyValue, Value};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

/// Lowercase label for a span kind.
pub fn kind_label(kind: &SpanKind) -> &'static str {
    match kind {
        SpanKind::Client => "client",
        SpanKind::Server => "server",
        SpanKind::Producer => "producer",
        SpanKind::Consumer => "consumer",
        SpanKind::Internal => "internal",
    }
}

/// A timed unit of work.
#[derive(Debug, Clone)]
pub struct Span {
    /// Operation name
    pub name: String,
    /// Span kind
    pub kind: SpanKind,
    /// Identity of this span
    pub context: CausalityToken,
    /// Parent span within the same trace
    pub parent_span_id: Option<SpanId>,
    /// Key-value attributes in insertion order
    pub attributes: Vec<KeyValue>,
    /// Links to causing spans in other traces
    pub links: Vec<Link>,
    /// Start instant
    pub start: DateTime<Utc>,
    /// End instant, set once the span is finished
    pub end: Option<DateTime<Utc>>,
}

impl Span {
    /// Start a span at the root of a new trace.
    pub fn root(name: impl Into<String>, kind: SpanKind) -> Self {
        Self::with_context(name, kind, propagation::root_context(), None)
    }

    /// Start a child span in the parent's trace.
    pub fn child_of(parent: &Span, name: impl Into<String>, kind: SpanKind) -> Self {
        Self::with_context(
            name,
            kind,
            propagation::child_context(&parent.context),
            Some(parent.context.span_id()),
        )
    }

    fn with_context(
        name: impl Into<String>,
        kind: SpanKind,
        context: CausalityToken,
        parent_span_id: Option<SpanId>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            context,
            parent_span_id,
            attributes: Vec::new(),
            links: Vec::new(),
            start: Utc::now(),
            end: None,
        }
    }

    /// Set an attribute, replacing an earlier value under the same key.
    pub fn set_attribute(&mut self, key: impl Into<Key>, value: impl Into<Value>) {
        let attribute = KeyValue::new(key, value);
        match self.attributes.iter_mut().find(|kv| kv.key == attribute.key) {
            Some(existing) => *existing = attribute,
            None => self.attributes.push(attribute),
        }
    }

    /// Value of an attribute.
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| &kv.value)
    }

    /// Add a link if one is given.
    pub fn add_link(&mut self, link: Option<Link>) {
        self.links.extend(link);
    }

    /// Finish the span, keeping the first end instant.
    pub fn end(&mut self, at: DateTime<Utc>) {
        self.end.get_or_insert(at);
    }

    /// Whether the span has been finished.
    pub fn is_ended(&self) -> bool {
        self.end.is_some()
    }

    /// Duration in microseconds once ended.
    pub fn duration_us(&self) -> Option<i64> {
        self.end
            .map(|end| (end - self.start).num_microseconds().unwrap_or(i64::MAX))
    }
}

/// Spans recorded for one batch, held back until the batch resolves.
#[derive(Debug, Default)]
pub struct BatchSpans {
    spans: Vec<Span>,
}

impl BatchSpans {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a span.
    pub fn push(&mut self, span: Span) {
        self.spans.push(span);
    }

    /// Number of recorded spans.
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// End every open span and hand the set to the exporter.
    pub fn export(self, exporter: &dyn SpanExporter) -> usize {
        let now = Utc::now();
        let mut spans = self.spans;
        for span in &mut spans {
            span.end(now);
        }
        let count = spans.len();
        if count > 0 {
            exporter.export(spans);
        }
        count
    }

    /// Drop the set without exporting; returns how many spans were dropped.
    pub fn discard(self) -> usize {
        self.spans.len()
    }
}

/// Destination for finished spans.
pub trait SpanExporter: Send + Sync {
    /// Export a group of finished spans.
    fn export(&self, spans: Vec<Span>);
}

/// Exports spans as `tracing` events on the `txrelay::spans` target.
#[derive(Debug, Clone)]
pub struct LogSpanExporter {
    service_name: String,
}

impl LogSpanExporter {
    /// Create an exporter tagging spans with a service name.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }
}

impl SpanExporter for LogSpanExporter {
    fn export(&self, spans: Vec<Span>) {
        for span in spans {
            let links: Vec<String> = span
                .links
                .iter()
                .map(|l| {
                    format!(
                        "{}:{}",
                        l.span_context.trace_id(),
                        l.span_context.span_id()
                    )
                })
                .collect();
            let attributes: Vec<String> = span
                .attributes
                .iter()
                .map(|kv| format!("{}={}", kv.key.as_str(), kv.value.as_str()))
                .collect();

            info!(
                target: "txrelay::spans",
                service = %self.service_name,
                name = %span.name,
                kind = kind_label(&span.kind),
                trace_id = %span.context.trace_id(),
                span_id = %span.context.span_id(),
                parent_span_id = %span.parent_span_id.map(|id| id.to_string()).unwrap_or_default(),
                links = ?links,
                attributes = %attributes.join(","),
                duration_us = span.duration_us(),
                "span"
            );
        }
    }
}

/// Collects exported spans in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemorySpanExporter {
    spans: Arc<Mutex<Vec<Span>>>,
}

impl InMemorySpanExporter {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all exported spans.
    pub fn spans(&self) -> Vec<Span> {
        self.spans.lock().clone()
    }

    /// Exported spans with a given kind.
    pub fn spans_of_kind(&self, kind: SpanKind) -> Vec<Span> {
        self.spans
            .lock()
            .iter()
            .filter(|s| s.kind == kind)
            .cloned()
            .collect()
    }
}

impl SpanExporter for InMemorySpanExporter {
    fn export(&self, spans: Vec<Span>) {
        self.spans.lock().extend(spans);
    }
}
