//! Status command implementation.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;

/// Health response from the server.
#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    #[serde(default)]
    relay_running: bool,
    #[serde(default)]
    uptime_seconds: u64,
    components: HashMap<String, ComponentStatus>,
}

/// Component status from the server.
#[derive(Debug, Deserialize)]
struct ComponentStatus {
    status: String,
    message: Option<String>,
}

/// Show status and health.
pub async fn run(url: &str, metrics_url: Option<&str>) -> Result<()> {
    println!("Checking health at {}...\n", url);

    let health_url = format!("{}/health", url.trim_end_matches('/'));
    let client = reqwest::Client::new();

    match client.get(&health_url).send().await {
        Ok(response) => {
            let status_code = response.status();
            match response.json::<HealthResponse>().await {
                Ok(health) => print_health_status(&health, status_code.as_u16()),
                Err(e) => {
                    println!("Failed to parse health response: {}", e);
                    println!("HTTP Status: {}", status_code);
                }
            }
        }
        Err(e) => {
            println!("Failed to connect to health endpoint: {}", e);
            println!("\nIs the relay running?");
            println!("Start it with: txrelay run --config <path-to-config>");
            return Ok(());
        }
    }

    let metrics_url = match metrics_url {
        Some(u) => format!("{}/metrics", u.trim_end_matches('/')),
        None => default_metrics_url(url),
    };

    println!("\n--- Metrics ---");
    println!("Fetching from {}...\n", metrics_url);

    match client.get(&metrics_url).send().await {
        Ok(response) => {
            let text = response.text().await.context("Failed to read metrics")?;
            print_metrics(&parse_metrics(&text));
        }
        Err(e) => {
            println!("Failed to fetch metrics: {}", e);
        }
    }

    Ok(())
}

/// The metrics endpoint on the default metrics port of the health host.
fn default_metrics_url(health_url: &str) -> String {
    health_url
        .replace(":8080", ":9090")
        .replace("/health", "")
        .trim_end_matches('/')
        .to_string()
        + "/metrics"
}

fn status_marker(status: &str) -> &'static str {
    match status {
        "healthy" => "[OK]",
        "degraded" => "[WARN]",
        "unhealthy" => "[FAIL]",
        _ => "[?]",
    }
}

fn print_health_status(health: &HealthResponse, status_code: u16) {
    println!(
        "{} Overall Status: {} (HTTP {})",
        status_marker(&health.status),
        health.status.to_uppercase(),
        status_code
    );
    println!(
        "Relay loop: {}, up {}s",
        if health.relay_running {
            "running"
        } else {
            "stopped"
        },
        health.uptime_seconds
    );
    println!();

    if !health.components.is_empty() {
        println!("Components:");
        let mut names: Vec<&String> = health.components.keys().collect();
        names.sort();
        for name in names {
            let status = &health.components[name];
            let marker = status_marker(&status.status);
            match &status.message {
                Some(msg) => println!("  {} {}: {} ({})", marker, name, status.status, msg),
                None => println!("  {} {}: {}", marker, name, status.status),
            }
        }
    }
}

/// Sum Prometheus sample values by metric name, ignoring labels.
fn parse_metrics(metrics_text: &str) -> HashMap<String, f64> {
    let mut values: HashMap<String, f64> = HashMap::new();

    for line in metrics_text.lines() {
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }

        let Some((series, value)) = line.rsplit_once(' ') else {
            continue;
        };
        let Ok(value) = value.parse::<f64>() else {
            continue;
        };
        let name = series.split('{').next().unwrap_or(series).trim();
        *values.entry(name.to_string()).or_default() += value;
    }

    values
}

fn print_metrics(values: &HashMap<String, f64>) {
    let rows = [
        ("txrelay_records_relayed_total", "Records Relayed:        "),
        ("txrelay_transactions_committed_total", "Transactions Committed: "),
        ("txrelay_transactions_aborted_total", "Transactions Aborted:   "),
        ("txrelay_retries_total", "Retries:                "),
        ("txrelay_fencing_events_total", "Fencing Events:         "),
        ("txrelay_errors_total", "Errors:                 "),
        ("txrelay_consumer_lag", "Consumer Lag:           "),
    ];

    let mut shown = false;
    for (metric, label) in rows {
        if let Some(v) = values.get(metric) {
            println!("{}{}", label, format_number(*v as u64));
            shown = true;
        }
    }

    if let (Some(sum), Some(count)) = (
        values.get("txrelay_commit_duration_seconds_sum"),
        values.get("txrelay_commit_duration_seconds_count"),
    ) {
        if *count > 0.0 {
            println!("Mean Commit Latency:    {:.1}ms", sum / count * 1000.0);
        }
    }

    if !shown {
        println!("No metrics available yet.");
    }
}

fn format_number(n: u64) -> String {
    if n >= 1_000_000_000 {
        format!("{:.2}B", n as f64 / 1_000_000_000.0)
    } else if n >= 1_000_000 {
        format!("{:.2}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.2}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}
