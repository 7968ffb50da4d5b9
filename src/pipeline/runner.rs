//! Fixed composition: emails → users → messages → verdicts → report.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{Receiver, Sender};
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::{ConfigError, PipelineError};
use crate::pipeline::combine::CombineResults;
use crate::pipeline::engine::{Stage, run_pipeline, send_all, stage_fn};
use crate::pipeline::failures::{FailureSink, LogSink};
use crate::pipeline::limiter::{CapacityGate, ConcurrencyLimit};
use crate::pipeline::messages::SelectMessages;
use crate::pipeline::spam::CheckSpam;
use crate::pipeline::types::Payload;
use crate::pipeline::users::SelectUsers;
use crate::service::{Mailbox, SpamChecker, UserDirectory};

/// Output of one run.
#[derive(Debug, Clone, Serialize)]
pub struct SpamReport {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    /// Number of addresses fed in.
    pub inputs: usize,
    /// `"<spam-flag> <message-id>"`, spam first, then ascending id.
    pub lines: Vec<String>,
}

/// The four-stage spam report pipeline.
pub struct SpamPipeline {
    directory: Arc<dyn UserDirectory>,
    mailbox: Arc<dyn Mailbox>,
    checker: Arc<dyn SpamChecker>,
    config: PipelineConfig,
    gate: CapacityGate,
    failures: Arc<dyn FailureSink>,
}

impl SpamPipeline {
    /// Build a pipeline with its own capacity gate sized from `config`.
    pub fn new(
        directory: Arc<dyn UserDirectory>,
        mailbox: Arc<dyn Mailbox>,
        checker: Arc<dyn SpamChecker>,
        config: PipelineConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let gate = CapacityGate::new(config.spam_max_concurrency);
        Ok(Self {
            directory,
            mailbox,
            checker,
            config,
            gate,
            failures: Arc::new(LogSink),
        })
    }

    /// Build a pipeline where one backend serves all three collaborators.
    pub fn from_service<S>(service: Arc<S>, config: PipelineConfig) -> Result<Self, ConfigError>
    where
        S: UserDirectory + Mailbox + SpamChecker + 'static,
    {
        Self::new(service.clone(), service.clone(), service, config)
    }

    /// Report dropped items to `sink` instead of only logging them.
    pub fn with_failure_sink(mut self, sink: Arc<dyn FailureSink>) -> Self {
        self.failures = sink;
        self
    }

    /// Use an existing gate, e.g. one shared with other pipelines.
    pub fn with_gate(mut self, gate: CapacityGate) -> Self {
        self.gate = gate;
        self
    }

    /// The four processing stages, in order.
    pub fn stages(&self) -> Vec<Box<dyn Stage<Payload>>> {
        vec![
            Box::new(SelectUsers::new(
                Arc::clone(&self.directory),
                ConcurrencyLimit::from_option(self.config.resolve_concurrency),
                Arc::clone(&self.failures),
            )),
            Box::new(SelectMessages::new(
                Arc::clone(&self.mailbox),
                self.config.batch_size,
                ConcurrencyLimit::from_option(self.config.fetch_concurrency),
                Arc::clone(&self.failures),
            )),
            Box::new(CheckSpam::new(
                Arc::clone(&self.checker),
                self.gate.clone(),
                self.config.retry.clone(),
                Arc::clone(&self.failures),
            )),
            Box::new(CombineResults::new(Arc::clone(&self.failures))),
        ]
    }

    /// Run the pipeline over `emails` and collect the report.
    pub async fn run<I>(&self, emails: I) -> Result<SpamReport, PipelineError>
    where
        I: IntoIterator<Item = String>,
    {
        let emails: Vec<String> = emails.into_iter().collect();
        let inputs = emails.len();
        let run_id = Uuid::new_v4();
        let span = info_span!("spam_pipeline", run_id = %run_id);

        info!(
            parent: &span,
            inputs,
            batch_size = self.config.batch_size,
            check_slots = self.gate.capacity(),
            "Starting run"
        );

        let mut stages = Vec::with_capacity(5);
        stages.push(email_source(emails));
        stages.extend(self.stages());

        let drained = run_pipeline(stages, self.config.channel_capacity)
            .instrument(span.clone())
            .await?;

        let lines: Vec<String> = drained
            .into_iter()
            .filter_map(|item| match item {
                Payload::Line(line) => Some(line),
                other => {
                    warn!(parent: &span, kind = other.label(), "Ignoring non-report item at end of chain");
                    None
                }
            })
            .collect();

        info!(parent: &span, inputs, lines = lines.len(), "Report ready");
        Ok(SpamReport {
            run_id,
            generated_at: Utc::now(),
            inputs,
            lines,
        })
    }
}

/// Source stage feeding `emails` into the chain.
fn email_source(emails: Vec<String>) -> Box<dyn Stage<Payload>> {
    stage_fn(
        "emails",
        move |_input: Receiver<Payload>, output: Sender<Payload>| async move {
            send_all(&output, emails.into_iter().map(Payload::Email)).await;
        },
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::RetryConfig;
    use crate::pipeline::failures::CollectingSink;
    use crate::service::{SimulatedMailService, SimulationConfig};

    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    fn config() -> PipelineConfig {
        PipelineConfig {
            retry: RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
            },
            ..PipelineConfig::default()
        }
    }

    #[tokio::test]
    async fn empty_input_yields_empty_report() {
        let service = Arc::new(SimulatedMailService::new(SimulationConfig::default()));
        let pipeline = SpamPipeline::from_service(service, config()).unwrap();

        let report = tokio::time::timeout(TEST_TIMEOUT, pipeline.run(Vec::new()))
            .await
            .expect("pipeline hung")
            .unwrap();
        assert_eq!(report.inputs, 0);
        assert!(report.lines.is_empty());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let service = Arc::new(SimulatedMailService::new(SimulationConfig::default()));
        let bad = PipelineConfig {
            batch_size: 0,
            ..PipelineConfig::default()
        };
        assert!(SpamPipeline::from_service(service, bad).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn report_is_sorted_and_complete() {
        let service = Arc::new(SimulatedMailService::new(SimulationConfig::default()));
        let sink = CollectingSink::new();
        let pipeline = SpamPipeline::from_service(service.clone(), config())
            .unwrap()
            .with_failure_sink(sink.clone());

        let emails: Vec<String> = (0..6).map(|i| format!("user{i}@example.com")).collect();
        let report = tokio::time::timeout(TEST_TIMEOUT, pipeline.run(emails))
            .await
            .expect("pipeline hung")
            .unwrap();

        assert_eq!(report.inputs, 6);
        assert!(!report.lines.is_empty());
        assert!(sink.is_empty(), "unexpected failures: {:?}", sink.snapshot());

        let parsed: Vec<(bool, u64)> = report
            .lines
            .iter()
            .map(|l| {
                let (flag, id) = l.split_once(' ').unwrap();
                (flag.parse().unwrap(), id.parse().unwrap())
            })
            .collect();
        let mut expected = parsed.clone();
        expected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        assert_eq!(parsed, expected);
        assert_eq!(service.batch_calls(), 3);
    }
}
