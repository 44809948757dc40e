//! Produce command: send test records that carry their producer span's
//! trace context.

use anyhow::{Context as _, Result};
use clap::Args;
use futures::future::try_join_all;
use opentelemetry::trace::{SpanKind, TraceContextExt};
use opentelemetry::{global, Context};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use std::io::Write;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tracing::{info, warn};
use txrelay_core::kafka::{owned_headers, Headers};
use txrelay_core::propagation::HeaderInjector;
use txrelay_core::span::{BatchSpans, Span, SpanExporter};

/// Brokers used when none are given.
pub const DEFAULT_BROKERS: &str = "localhost:9092";

/// Topic used when none is given.
pub const DEFAULT_TOPIC: &str = "topic-test";

/// Arguments of the produce command.
#[derive(Debug, Args)]
pub struct ProduceArgs {
    /// Kafka bootstrap servers (comma separated)
    #[arg(short, long, default_value = DEFAULT_BROKERS)]
    pub brokers: String,

    /// Topic to produce to
    #[arg(short, long, default_value = DEFAULT_TOPIC)]
    pub topic: String,

    /// Number of generated messages
    #[arg(short, long, default_value_t = 5)]
    pub number: usize,

    /// Read keys and payloads from stdin instead of generating them
    #[arg(short, long)]
    pub interactive: bool,

    /// Delivery timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    pub message_timeout_ms: u64,
}

/// Run the produce command.
pub async fn run(args: ProduceArgs, verbose: bool, exporter: &dyn SpanExporter) -> Result<()> {
    let producer: FutureProducer = producer_config(&args.brokers, args.message_timeout_ms)
        .create()
        .context("Producer creation error")?;

    let sent = if args.interactive {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        produce_interactive(&producer, &args.topic, stdin, exporter).await?
    } else {
        produce_number(&producer, &args.topic, args.number, verbose, exporter).await?
    };

    println!("Delivered {} message(s) to {}", sent, args.topic);
    Ok(())
}

fn producer_config(brokers: &str, message_timeout_ms: u64) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", brokers)
        .set("message.timeout.ms", message_timeout_ms.to_string());
    config
}

/// Deliver `number` generated messages concurrently.
pub async fn produce_number(
    producer: &FutureProducer,
    topic: &str,
    number: usize,
    verbose: bool,
    exporter: &dyn SpanExporter,
) -> Result<usize> {
    if verbose {
        info!(topic, number, "Creating producer");
    }

    let deliveries = (0..number).map(|i| async move {
        let payload = format!("Message {}", i);
        let (partition, offset) =
            deliver(producer, topic, &i.to_string(), payload.as_bytes(), exporter).await?;
        if verbose {
            info!(message = i, partition, offset, "Delivery status received");
        }
        Ok::<_, anyhow::Error>((partition, offset))
    });

    Ok(try_join_all(deliveries).await?.len())
}

/// Read key and content lines until end of input, delivering each pair.
///
/// A blank key takes the next generated key. Failed deliveries are logged
/// and do not stop the session.
pub async fn produce_interactive<R>(
    producer: &FutureProducer,
    topic: &str,
    input: R,
    exporter: &dyn SpanExporter,
) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    info!(topic, "Creating interactive producer");
    let mut lines = input.lines();
    let mut keys = KeySequence::default();
    let mut sent = 0;

    while let Some((key, content)) = read_entry(&mut lines, &mut keys, true).await? {
        match deliver(producer, topic, &key, content.as_bytes(), exporter).await {
            Ok((partition, offset)) => {
                info!(key = %key, partition, offset, "Message sent");
                sent += 1;
            }
            Err(e) => warn!(key = %key, error = %e, "Message delivery failed"),
        }
    }

    Ok(sent)
}

/// Next key and content pair, or `None` at end of input.
async fn read_entry<R>(
    lines: &mut Lines<R>,
    keys: &mut KeySequence,
    prompt: bool,
) -> Result<Option<(String, String)>>
where
    R: AsyncBufRead + Unpin,
{
    if prompt {
        show_prompt("Please enter the message key: ")?;
    }
    let Some(key) = lines.next_line().await.context("Failed to read key")? else {
        return Ok(None);
    };

    if prompt {
        show_prompt("Please enter the message content: ")?;
    }
    let Some(content) = lines.next_line().await.context("Failed to read content")? else {
        return Ok(None);
    };

    Ok(Some((keys.key_for(&key), content)))
}

fn show_prompt(text: &str) -> Result<()> {
    let mut stdout = std::io::stdout();
    write!(stdout, "{}", text)?;
    stdout.flush().context("Failed to write prompt")
}

/// Keys for interactive entries.
#[derive(Debug)]
struct KeySequence {
    next: usize,
}

impl Default for KeySequence {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl KeySequence {
    fn key_for(&mut self, input: &str) -> String {
        if !input.is_empty() {
            return input.to_string();
        }
        let key = format!("Generated Key {}", self.next);
        self.next += 1;
        key
    }
}

/// Deliver one record with the trace context of its producer span.
///
/// The span is exported once the delivery resolves, successful or not.
pub async fn deliver(
    producer: &FutureProducer,
    topic: &str,
    key: &str,
    payload: &[u8],
    exporter: &dyn SpanExporter,
) -> Result<(i32, i64)> {
    let (mut span, headers) = traced_headers(topic, payload);
    let record = FutureRecord::to(topic)
        .key(key)
        .payload(payload)
        .headers(owned_headers(&headers));

    let outcome = match producer.send(record, Duration::from_secs(0)).await {
        Ok((partition, offset)) => {
            span.set_attribute("messaging.kafka.partition", i64::from(partition));
            span.set_attribute("messaging.kafka.offset", offset);
            Ok((partition, offset))
        }
        Err((e, _)) => {
            span.set_attribute("error", e.to_string());
            Err(anyhow::Error::new(e).context(format!("Delivery to {} failed", topic)))
        }
    };

    let mut spans = BatchSpans::new();
    spans.push(span);
    spans.export(exporter);
    outcome
}

/// Start a producer span and return it with headers carrying its context.
fn traced_headers(topic: &str, payload: &[u8]) -> (Span, Headers) {
    let mut span = Span::root("message delivery to kafka", SpanKind::Producer);
    span.set_attribute("topic", topic.to_string());
    span.set_attribute("message", String::from_utf8_lossy(payload).into_owned());

    let cx = Context::new().with_remote_span_context(span.context.clone());
    let mut headers = Headers::new();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&cx, &mut HeaderInjector(&mut headers))
    });
    (span, headers)
}
