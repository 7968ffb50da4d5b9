use std::io::{self, BufRead};
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use spammer::config::PipelineConfig;
use spammer::pipeline::{CollectingSink, SpamPipeline};
use spammer::service::{SimulatedMailService, SimulationConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries only the report.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let config = PipelineConfig::from_env().context("invalid SPAMMER_* configuration")?;
    let json_output = std::env::var("SPAMMER_OUTPUT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let mut emails: Vec<String> = std::env::args().skip(1).collect();
    if emails.is_empty() {
        for line in io::stdin().lock().lines() {
            let line = line.context("failed to read addresses from stdin")?;
            let line = line.trim();
            if !line.is_empty() {
                emails.push(line.to_string());
            }
        }
    }

    eprintln!("📬 Spammer v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Addresses: {}", emails.len());
    eprintln!("   Batch size: {}", config.batch_size);
    eprintln!("   Spam check slots: {}\n", config.spam_max_concurrency);

    let service = Arc::new(
        SimulatedMailService::new(SimulationConfig::with_network_latency()).with_demo_aliases(),
    );
    let failures = CollectingSink::new();
    let pipeline = SpamPipeline::from_service(Arc::clone(&service), config)?
        .with_failure_sink(failures.clone());

    let report = pipeline.run(emails).await?;

    if json_output {
        let document = serde_json::json!({
            "report": report,
            "failures": failures.snapshot(),
        });
        println!("{}", serde_json::to_string_pretty(&document)?);
    } else {
        for line in &report.lines {
            println!("{line}");
        }
    }

    eprintln!(
        "\n   {} lines, {} dropped items ({} user / {} batch / {} spam calls)",
        report.lines.len(),
        failures.len(),
        service.user_calls(),
        service.batch_calls(),
        service.spam_calls(),
    );

    Ok(())
}
