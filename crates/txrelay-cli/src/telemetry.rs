//! Trace context setup shared by the relay and the test-traffic tools.

use opentelemetry::global;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::sync::Arc;
use txrelay_core::span::LogSpanExporter;

/// Install the W3C trace context propagator and build the span exporter.
///
/// Spans are emitted as structured log events, so the logging subscriber
/// must be installed first.
pub fn setup_telemetry(service_name: &str) -> Arc<LogSpanExporter> {
    global::set_text_map_propagator(TraceContextPropagator::new());
    Arc::new(LogSpanExporter::new(service_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::TraceContextExt;
    use opentelemetry::Context;
    use txrelay_core::propagation::{self, HeaderExtractor, HeaderInjector};

    #[test]
    fn test_setup_installs_trace_context_propagator() {
        let _exporter = setup_telemetry("txrelay-test");

        let token = propagation::root_context();
        let cx = Context::new().with_remote_span_context(token.clone());
        let mut headers = Vec::new();
        global::get_text_map_propagator(|p| {
            p.inject_context(&cx, &mut HeaderInjector(&mut headers))
        });

        let keys: Vec<&str> = headers.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec![propagation::TRACEPARENT]);

        let extracted =
            global::get_text_map_propagator(|p| p.extract(&HeaderExtractor(&headers)));
        assert_eq!(extracted.span().span_context().span_id(), token.span_id());
    }
}
