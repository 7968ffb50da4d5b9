//! Stage 4: collect every verdict, sort, and emit report lines.
//!
//! Nothing is emitted until the input closes, since the order depends on the
//! full result set. Unlike the earlier stages this one is strict: a payload
//! that is not a verdict stops the stage and nothing at all is emitted.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::{Receiver, Sender};
use tracing::{error, info};

use crate::pipeline::engine::{Stage, send_all};
use crate::pipeline::failures::{FailureSink, StageFailure};
use crate::pipeline::types::{MsgData, Payload};

const STAGE: &str = "combine_results";

/// Spam first, then ascending id.
pub fn report_order(a: &MsgData, b: &MsgData) -> Ordering {
    b.has_spam.cmp(&a.has_spam).then_with(|| a.id.cmp(&b.id))
}

/// Stable sort into report order.
pub fn sort_results(results: &mut [MsgData]) {
    results.sort_by(report_order);
}

/// Aggregator stage. Consumes `Payload::Verdict`, emits `Payload::Line`.
pub struct CombineResults {
    failures: Arc<dyn FailureSink>,
}

impl CombineResults {
    pub fn new(failures: Arc<dyn FailureSink>) -> Self {
        Self { failures }
    }
}

#[async_trait]
impl Stage<Payload> for CombineResults {
    fn name(&self) -> &str {
        STAGE
    }

    async fn run(self: Box<Self>, mut input: Receiver<Payload>, output: Sender<Payload>) {
        let mut results = Vec::new();

        while let Some(item) = input.recv().await {
            match item {
                Payload::Verdict(data) => results.push(data),
                other => {
                    error!(
                        stage = STAGE,
                        kind = other.label(),
                        collected = results.len(),
                        "Unexpected item, abandoning report"
                    );
                    self.failures.report(StageFailure::new(
                        STAGE,
                        other.to_string(),
                        "expected a verdict; report abandoned",
                    ));
                    return;
                }
            }
        }

        sort_results(&mut results);
        let spam = results.iter().filter(|d| d.has_spam).count();
        let lines: Vec<Payload> = results
            .iter()
            .map(|d| Payload::Line(d.report_line()))
            .collect();
        let emitted = send_all(&output, lines).await;

        info!(stage = STAGE, emitted, spam, "Report emitted");
    }
}
