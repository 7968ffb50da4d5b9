//! Stage 3: classify each message, under a shared capacity gate.
//!
//! Every message gets its own worker. A worker holds one gate slot for the
//! whole classification, retries included, and gives it back however the
//! call ends. Messages that cannot be classified are dropped.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info, warn};

use crate::config::RetryConfig;
use crate::pipeline::engine::{Stage, join_workers, send_all};
use crate::pipeline::failures::{FailureSink, StageFailure};
use crate::pipeline::limiter::CapacityGate;
use crate::pipeline::retry::with_retry;
use crate::pipeline::types::{MsgData, Payload};
use crate::service::SpamChecker;

const STAGE: &str = "check_spam";

/// Classifier stage. Consumes `Payload::Message`, emits `Payload::Verdict`.
pub struct CheckSpam {
    checker: Arc<dyn SpamChecker>,
    gate: CapacityGate,
    retry: RetryConfig,
    failures: Arc<dyn FailureSink>,
}

impl CheckSpam {
    /// `gate` may be shared with other stages or pipelines; all of them then
    /// draw from the same pool of slots.
    pub fn new(
        checker: Arc<dyn SpamChecker>,
        gate: CapacityGate,
        retry: RetryConfig,
        failures: Arc<dyn FailureSink>,
    ) -> Self {
        Self {
            checker,
            gate,
            retry,
            failures,
        }
    }
}

#[async_trait]
impl Stage<Payload> for CheckSpam {
    fn name(&self) -> &str {
        STAGE
    }

    async fn run(self: Box<Self>, mut input: Receiver<Payload>, output: Sender<Payload>) {
        let mut workers = JoinSet::new();
        let mut received = 0usize;

        while let Some(item) = input.recv().await {
            let id = match item {
                Payload::Message(id) => id,
                other => {
                    warn!(stage = STAGE, kind = other.label(), "Skipping item that is not a message");
                    self.failures
                        .report(StageFailure::new(STAGE, other.to_string(), "expected a message"));
                    continue;
                }
            };
            received += 1;

            let checker = Arc::clone(&self.checker);
            let failures = Arc::clone(&self.failures);
            let gate = self.gate.clone();
            let retry = self.retry.clone();
            let output = output.clone();

            workers.spawn(async move {
                let label = Payload::Message(id).to_string();

                let permit = gate.acquire().await;
                let result = with_retry(&retry, &label, || checker.has_spam(id)).await;
                drop(permit);

                match result {
                    Ok(has_spam) => {
                        debug!(stage = STAGE, id = %id, has_spam, "Message classified");
                        send_all(&output, [Payload::Verdict(MsgData { id, has_spam })]).await
                    }
                    Err(e) => {
                        failures.report(StageFailure::new(STAGE, label, e));
                        0
                    }
                }
            }
            .in_current_span());
        }

        let emitted = join_workers(STAGE, workers).await;
        info!(
            stage = STAGE,
            received,
            emitted,
            dropped = received.saturating_sub(emitted),
            "Messages classified"
        );
    }
}
