//! Causal context propagation through record headers.
//!
//! The causality token is an OpenTelemetry `SpanContext` carried as a W3C
//! Trace Context under the reserved header keys `traceparent` and
//! `tracestate`, one key per field, as ASCII text. Encoding and decoding go
//! through the SDK's `TraceContextPropagator`; the functions here adapt it to
//! ordered header lists. They never mutate their input and return fresh
//! header lists.

use crate::kafka::Headers;
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::{Link, SpanContext, TraceContextExt, TraceFlags, TraceState};
use opentelemetry::Context;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{IdGenerator, RandomIdGenerator};

/// Reserved header key carrying version, trace id, span id and flags.
pub const TRACEPARENT: &str = "traceparent";

/// Reserved header key carrying vendor-specific trace state.
pub const TRACESTATE: &str = "tracestate";

/// "This record's production was caused by span S."
pub type CausalityToken = SpanContext;

/// Read access to an ordered header list.
///
/// The first entry under a key wins; keys compare ASCII case-insensitively
/// and values that are not UTF-8 read as absent.
pub struct HeaderExtractor<'a>(pub &'a [(String, Vec<u8>)]);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .and_then(|(_, value)| std::str::from_utf8(value).ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.iter().map(|(k, _)| k.as_str()).collect()
    }
}

/// Write access to an ordered header list.
///
/// Setting a key drops earlier entries under it and appends the new value;
/// empty values are not written.
pub struct HeaderInjector<'a>(pub &'a mut Headers);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
        if !value.is_empty() {
            self.0.push((key.to_string(), value.into_bytes()));
        }
    }
}

/// A sampled context for a span in a new trace.
pub fn root_context() -> CausalityToken {
    let ids = RandomIdGenerator::default();
    SpanContext::new(
        ids.new_trace_id(),
        ids.new_span_id(),
        TraceFlags::SAMPLED,
        false,
        TraceState::default(),
    )
}

/// A context for a new span in the parent's trace.
pub fn child_context(parent: &CausalityToken) -> CausalityToken {
    SpanContext::new(
        parent.trace_id(),
        RandomIdGenerator::default().new_span_id(),
        parent.trace_flags(),
        false,
        parent.trace_state().clone(),
    )
}

/// Extract the causality token from a header list.
///
/// Returns `None` when `traceparent` is absent, not UTF-8, or malformed.
/// `tracestate` is only read alongside a valid `traceparent`.
pub fn extract(headers: &[(String, Vec<u8>)]) -> Option<CausalityToken> {
    let cx = TraceContextPropagator::new()
        .extract_with_context(&Context::new(), &HeaderExtractor(headers));
    let span = cx.span();
    let context = span.span_context();
    context.is_valid().then(|| context.clone())
}

/// Return `headers` with the reserved keys replaced by `token`.
///
/// Non-reserved headers pass through unchanged and in order; reserved
/// entries are dropped and fresh ones appended, so injecting the same token
/// twice yields the same list as injecting it once.
pub fn inject(headers: &[(String, Vec<u8>)], token: &CausalityToken) -> Headers {
    let mut out: Headers = headers
        .iter()
        .filter(|(key, _)| !is_reserved(key))
        .cloned()
        .collect();

    let cx = Context::new().with_remote_span_context(token.clone());
    TraceContextPropagator::new().inject_context(&cx, &mut HeaderInjector(&mut out));
    out
}

/// One span link for a present token, none for an absent one.
pub fn link(parent: Option<&CausalityToken>) -> Option<Link> {
    parent.map(|context| Link::new(context.clone(), Vec::new()))
}

/// Whether a header key is reserved for the causality token.
pub fn is_reserved(key: &str) -> bool {
    key.eq_ignore_ascii_case(TRACEPARENT) || key.eq_ignore_ascii_case(TRACESTATE)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect()
    }

    fn ids(context: &CausalityToken) -> (String, String) {
        (
            context.trace_id().to_string(),
            context.span_id().to_string(),
        )
    }

    #[test]
    fn test_extract_traceparent() {
        let token = extract(&headers(&[(TRACEPARENT, SAMPLE)])).unwrap();
        assert_eq!(
            ids(&token),
            (
                "4bf92f3577b34da6a3ce929d0e0e4736".to_string(),
                "00f067aa0ba902b7".to_string()
            )
        );
        assert!(token.is_sampled());
        assert!(token.is_remote());

        let out = inject(&[], &token);
        assert_eq!(out, headers(&[(TRACEPARENT, SAMPLE)]));
    }

    #[test]
    fn test_extract_rejects_malformed() {
        let cases = [
            "",
            "garbage",
            "00-00000000000000000000000000000000-00f067aa0ba902b7-01",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-0000000000000000-01",
            "ff-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            "00-4BF92F3577B34DA6A3CE929D0E0E4736-00f067aa0ba902b7-01",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01-extra",
        ];
        for case in cases {
            assert!(
                extract(&headers(&[(TRACEPARENT, case)])).is_none(),
                "accepted {:?}",
                case
            );
        }
    }

    #[test]
    fn test_extract_accepts_future_version_with_extra_fields() {
        let value = "01-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-00-future";
        let token = extract(&headers(&[(TRACEPARENT, value)])).unwrap();
        assert!(!token.is_sampled());
    }

    #[test]
    fn test_extract_absent_and_malformed() {
        assert!(extract(&[]).is_none());
        assert!(extract(&headers(&[("source", "web")])).is_none());
        assert!(extract(&headers(&[(TRACEPARENT, "not-a-token")])).is_none());

        let invalid_utf8 = vec![(TRACEPARENT.to_string(), vec![0xff, 0xfe])];
        assert!(extract(&invalid_utf8).is_none());
    }

    #[test]
    fn test_extract_with_trace_state() {
        let token = extract(&headers(&[
            ("source", "web"),
            ("TraceParent", SAMPLE),
            (TRACESTATE, "vendor=abc"),
        ]))
        .unwrap();
        assert_eq!(token.trace_state().header(), "vendor=abc");
    }

    #[test]
    fn test_inject_preserves_other_headers_in_order() {
        let input = headers(&[
            ("a", "1"),
            (TRACEPARENT, SAMPLE),
            ("b", "2"),
            (TRACESTATE, "old=1"),
            ("a", "3"),
        ]);
        let token = root_context();
        let out = inject(&input, &token);

        let keys: Vec<&str> = out.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "a", TRACEPARENT]);
        assert_eq!(out[2].1, b"3".to_vec());
        assert_eq!(extract(&out).map(|t| ids(&t)), Some(ids(&token)));
        // input untouched
        assert_eq!(input.len(), 5);
    }

    #[test]
    fn test_inject_is_idempotent() {
        let input = headers(&[("a", "1"), (TRACEPARENT, SAMPLE)]);
        let root = root_context();
        let token = SpanContext::new(
            root.trace_id(),
            root.span_id(),
            root.trace_flags(),
            false,
            TraceState::from_key_value([("vendor", "xyz")]).unwrap(),
        );

        let once = inject(&input, &token);
        let twice = inject(&once, &token);
        assert_eq!(once, twice);
        assert_eq!(
            extract(&once).unwrap().trace_state().header(),
            "vendor=xyz"
        );
    }

    #[test]
    fn test_inject_invalid_context_only_strips_reserved() {
        let input = headers(&[("a", "1"), (TRACEPARENT, SAMPLE)]);
        let out = inject(&input, &SpanContext::empty_context());
        assert_eq!(out, headers(&[("a", "1")]));
    }

    #[test]
    fn test_link_cardinality() {
        assert!(link(None).is_none());

        let token = extract(&headers(&[(TRACEPARENT, SAMPLE)])).unwrap();
        let link = link(Some(&token)).unwrap();
        assert_eq!(link.span_context, token);
        assert!(link.attributes.is_empty());
    }

    #[test]
    fn test_child_keeps_trace() {
        let root = root_context();
        let child = child_context(&root);
        assert_eq!(child.trace_id(), root.trace_id());
        assert_ne!(child.span_id(), root.span_id());
        assert!(child.is_sampled());
    }

    #[test]
    fn test_root_contexts_are_valid_and_distinct() {
        let a = root_context();
        let b = root_context();
        assert!(a.is_valid());
        assert_ne!(a.trace_id(), b.trace_id());
    }

    #[test]
    fn test_header_injector_replaces_key() {
        let mut out = headers(&[("k", "old"), ("x", "1")]);
        let mut injector = HeaderInjector(&mut out);
        injector.set("K", "new".to_string());
        injector.set("empty", String::new());
        assert_eq!(out, headers(&[("x", "1"), ("K", "new")]));

        let extractor = HeaderExtractor(&out);
        assert_eq!(extractor.get("k"), Some("new"));
        assert_eq!(extractor.keys(), vec!["x", "K"]);
    }
}
