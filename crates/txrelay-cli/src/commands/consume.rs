//! Consume command: print records with their headers and record a consumer
//! span linked to whatever produced each one.

use super::produce::{DEFAULT_BROKERS, DEFAULT_TOPIC};
use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use opentelemetry::global;
use opentelemetry::trace::{SpanKind, TraceContextExt};
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{ClientConfig, Message};
use tracing::{info, warn};
use txrelay_core::kafka::Record;
use txrelay_core::propagation::{self, HeaderExtractor};
use txrelay_core::span::{BatchSpans, Span, SpanExporter};
use uuid::Uuid;

/// Where a group without committed offsets starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OffsetReset {
    Latest,
    Earliest,
}

impl OffsetReset {
    /// Value of `auto.offset.reset`.
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Latest => "latest",
            OffsetReset::Earliest => "earliest",
        }
    }
}

/// Arguments of the consume command.
#[derive(Debug, Args)]
pub struct ConsumeArgs {
    /// Kafka bootstrap servers (comma separated)
    #[arg(short, long, default_value = DEFAULT_BROKERS)]
    pub brokers: String,

    /// Topics to subscribe to
    #[arg(short, long = "topic", default_value = DEFAULT_TOPIC)]
    pub topics: Vec<String>,

    /// Consumer group (a fresh random group when omitted)
    #[arg(short, long)]
    pub group_id: Option<String>,

    /// Start position for a group without committed offsets
    #[arg(short, long, value_enum, default_value_t = OffsetReset::Latest)]
    pub offset_reset: OffsetReset,

    /// Stop after this many records
    #[arg(long)]
    pub max_messages: Option<usize>,
}

/// Consume and print until interrupted or `max_messages` is reached.
pub async fn run(args: ConsumeArgs, verbose: bool, exporter: &dyn SpanExporter) -> Result<()> {
    let group_id = args
        .group_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    info!(
        brokers = %args.brokers,
        group_id = %group_id,
        topics = %args.topics.join(", "),
        offset_reset = args.offset_reset.as_str(),
        verbose,
        "Creating consumer"
    );

    let consumer: StreamConsumer = consumer_config(&args.brokers, &group_id, args.offset_reset)
        .create()
        .context("Consumer creation failed")?;

    let topics: Vec<&str> = args.topics.iter().map(String::as_str).collect();
    consumer
        .subscribe(&topics)
        .context("Can't subscribe to specified topics")?;

    info!("Start consuming");
    let mut seen = 0usize;
    while args.max_messages.map_or(true, |max| seen < max) {
        let message = tokio::select! {
            message = consumer.recv() => message,
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), stopping consumer");
                break;
            }
        };

        match message {
            Err(e) => warn!(error = %e, "Kafka error"),
            Ok(m) => {
                inspect(&Record::from_message(&m), verbose, exporter);
                if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
                    warn!(error = %e, offset = m.offset(), "Failed to commit offset");
                }
                seen += 1;
            }
        }
    }

    info!(records = seen, "Consumer stopped");
    Ok(())
}

fn consumer_config(brokers: &str, group_id: &str, offset_reset: OffsetReset) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("group.id", group_id)
        .set("bootstrap.servers", brokers)
        .set("session.timeout.ms", "6000")
        .set("enable.auto.commit", "true")
        .set("auto.offset.reset", offset_reset.as_str())
        .set_log_level(RDKafkaLogLevel::Debug);
    config
}

/// Print one record and export its consumer span.
fn inspect(record: &Record, verbose: bool, exporter: &dyn SpanExporter) {
    let mut spans = BatchSpans::new();
    spans.push(consumer_span(record));

    for line in header_lines(record) {
        println!("{}", line);
    }
    if !record.value.is_empty() && record.value_str().is_none() {
        warn!(offset = record.offset, "Payload is not valid UTF-8");
    }
    info!("{}", describe(record, verbose));

    spans.export(exporter);
}

/// Consumer span for a record, linked to the span that produced it.
fn consumer_span(record: &Record) -> Span {
    let cx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor(&record.headers))
    });
    let upstream = cx.span().span_context().clone();

    let mut span = Span::root("consume message", SpanKind::Consumer);
    span.add_link(propagation::link(
        Some(&upstream).filter(|context| context.is_valid()),
    ));
    span.set_attribute("payload", payload_text(record).to_string());
    span.set_attribute("messaging.source.name", record.topic.clone());
    span.set_attribute("messaging.kafka.partition", i64::from(record.partition));
    span.set_attribute("messaging.kafka.offset", record.offset);
    span
}

fn payload_text(record: &Record) -> &str {
    if record.value.is_empty() {
        "--"
    } else {
        record.value_str().unwrap_or("")
    }
}

fn header_lines(record: &Record) -> Vec<String> {
    record
        .headers
        .iter()
        .map(|(key, value)| format!("  Header {:?}: {:?}", key, String::from_utf8_lossy(value)))
        .collect()
}

fn describe(record: &Record, verbose: bool) -> String {
    let key = record.key_str().unwrap_or("no key");
    let payload = payload_text(record);
    if verbose {
        format!(
            "key: '{}', payload: '{}', topic: {}, partition: {}, offset: {}, timestamp: {}",
            key,
            payload,
            record.topic,
            record.partition,
            record.offset,
            record.timestamp.to_rfc3339()
        )
    } else {
        format!("key: '{}', payload: '{}'", key, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use txrelay_core::span::InMemorySpanExporter;

    fn record(headers: Vec<(String, Vec<u8>)>) -> Record {
        Record {
            topic: "topic-test".to_string(),
            partition: 0,
            offset: 7,
            key: Some(b"3".to_vec()),
            value: b"Message 3".to_vec(),
            headers,
            timestamp: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
        }
    }

    #[test]
    fn test_consumer_span_links_producer() {
        let _exporter = crate::telemetry::setup_telemetry("txrelay-test");
        let upstream = propagation::root_context();
        let headers = propagation::inject(&[("source".to_string(), b"web".to_vec())], &upstream);

        let span = consumer_span(&record(headers));
        assert_eq!(span.kind, SpanKind::Consumer);
        assert_eq!(span.links.len(), 1);
        assert_eq!(span.links[0].span_context.span_id(), upstream.span_id());
        assert_ne!(span.context.trace_id(), upstream.trace_id());
        assert_eq!(
            span.attribute("messaging.kafka.offset"),
            Some(&opentelemetry::Value::I64(7))
        );
    }

    #[test]
    fn test_consumer_span_without_context_has_no_link() {
        let _exporter = crate::telemetry::setup_telemetry("txrelay-test");
        let span = consumer_span(&record(vec![("source".to_string(), b"web".to_vec())]));
        assert!(span.links.is_empty());
    }

    #[test]
    fn test_inspect_exports_one_span() {
        let _ = crate::telemetry::setup_telemetry("txrelay-test");
        let exporter = InMemorySpanExporter::new();
        inspect(&record(vec![]), true, &exporter);

        let spans = exporter.spans();
        assert_eq!(spans.len(), 1);
        assert!(spans[0].is_ended());
    }

    #[test]
    fn test_header_lines() {
        let r = record(vec![
            ("source".to_string(), b"web".to_vec()),
            ("empty".to_string(), Vec::new()),
        ]);
        assert_eq!(
            header_lines(&r),
            vec![
                "  Header \"source\": \"web\"".to_string(),
                "  Header \"empty\": \"\"".to_string(),
            ]
        );
    }

    #[test]
    fn test_describe() {
        let r = record(vec![]);
        assert_eq!(describe(&r, false), "key: '3', payload: 'Message 3'");
        assert!(describe(&r, true).contains("topic: topic-test, partition: 0, offset: 7"));

        let tombstone = Record {
            key: None,
            value: Vec::new(),
            ..record(vec![])
        };
        assert_eq!(describe(&tombstone, false), "key: 'no key', payload: '--'");
    }

    #[test]
    fn test_consumer_config_offset_reset() {
        let config = consumer_config("kafka:9092", "inspect", OffsetReset::Earliest);
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(config.get("group.id"), Some("inspect"));
        assert_eq!(config.get("enable.auto.commit"), Some("true"));
        assert_eq!(OffsetReset::Latest.as_str(), "latest");
    }
}
