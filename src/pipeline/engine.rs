//! Generic stage-chain driver.
//!
//! ```text
//!  (closed) ──▶ stage 0 ──▶ stage 1 ──▶ … ──▶ stage N-1 ──▶ drained by run_pipeline
//! ```
//!
//! Each stage runs on its own task, owns the sender of its output channel and
//! closes it by returning. A stage sees end-of-input once the stage before it
//! has returned. The driver drains the last channel while the stages run and
//! hands the drained items back to the caller.
//!
//! There is no per-stage isolation: a panicking stage closes its output (so
//! the chain still drains) and is reported as an error once everything has
//! stopped. A stage that never returns blocks the run forever.

use std::future::Future;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, warn};

use crate::error::PipelineError;
use crate::pipeline::types::Payload;

/// One link of the chain: consumes `input` until it closes and writes to `output`.
#[async_trait]
pub trait Stage<T: Send + 'static>: Send {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Run to completion. `output` is dropped, closing the channel, when this returns.
    async fn run(self: Box<Self>, input: Receiver<T>, output: Sender<T>);
}

/// A stage backed by a closure.
pub struct FnStage<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<T, F, Fut> Stage<T> for FnStage<F>
where
    T: Send + 'static,
    F: FnOnce(Receiver<T>, Sender<T>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(self: Box<Self>, input: Receiver<T>, output: Sender<T>) {
        let FnStage { f, .. } = *self;
        f(input, output).await
    }
}

/// Wrap a closure as a boxed stage.
pub fn stage_fn<T, F, Fut>(name: impl Into<String>, f: F) -> Box<dyn Stage<T>>
where
    T: Send + 'static,
    F: FnOnce(Receiver<T>, Sender<T>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Box::new(FnStage {
        name: name.into(),
        f,
    })
}

/// Wire `stages` into a chain and run it until every stage has returned.
///
/// Returns whatever the last stage emitted, in emission order.
pub async fn run_pipeline<T>(
    stages: Vec<Box<dyn Stage<T>>>,
    channel_capacity: usize,
) -> Result<Vec<T>, PipelineError>
where
    T: Send + 'static,
{
    if stages.is_empty() {
        return Ok(Vec::new());
    }

    let capacity = channel_capacity.max(1);
    let stage_count = stages.len();

    // Nothing feeds the first stage; it starts with a closed input.
    let (head_tx, mut tail) = mpsc::channel::<T>(capacity);
    drop(head_tx);

    let mut handles = Vec::with_capacity(stage_count);
    for (index, stage) in stages.into_iter().enumerate() {
        let (tx, rx) = mpsc::channel::<T>(capacity);
        let input = std::mem::replace(&mut tail, rx);
        let name = stage.name().to_string();

        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            debug!(stage = %task_name, index, "Stage started");
            stage.run(input, tx).await;
            debug!(stage = %task_name, index, "Stage finished");
        }
        .in_current_span());
        handles.push((name, handle));
    }

    let mut drained = Vec::new();
    while let Some(item) = tail.recv().await {
        drained.push(item);
    }

    let mut first_failure = None;
    for (name, handle) in handles {
        if let Err(e) = handle.await {
            error!(stage = %name, error = %e, "Stage terminated abnormally");
            if first_failure.is_none() {
                first_failure = Some(PipelineError::StagePanicked {
                    stage: name,
                    reason: e.to_string(),
                });
            }
        }
    }

    if let Some(err) = first_failure {
        return Err(err);
    }

    info!(stages = stage_count, drained = drained.len(), "Pipeline drained");
    Ok(drained)
}

/// Wait for every worker a stage spawned and sum what they emitted.
///
/// A worker panic is re-raised on the stage task so the engine sees it.
pub(crate) async fn join_workers(stage: &str, mut workers: JoinSet<usize>) -> usize {
    let mut emitted = 0;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(count) => emitted += count,
            Err(e) if e.is_panic() => {
                error!(stage, "Worker panicked");
                std::panic::resume_unwind(e.into_panic());
            }
            Err(e) => warn!(stage, error = %e, "Worker cancelled"),
        }
    }
    emitted
}

/// Send every item, stopping early if the downstream stage has gone away.
/// Returns how many were delivered.
pub(crate) async fn send_all<I>(output: &Sender<Payload>, items: I) -> usize
where
    I: IntoIterator<Item = Payload>,
{
    let mut sent = 0;
    for item in items {
        if output.send(item).await.is_err() {
            debug!("Downstream closed, dropping remaining items");
            break;
        }
        sent += 1;
    }
    sent
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    fn source(items: Vec<i32>) -> Box<dyn Stage<i32>> {
        stage_fn("source", move |_input, output: Sender<i32>| async move {
            for item in items {
                if output.send(item).await.is_err() {
                    return;
                }
            }
        })
    }

    fn double() -> Box<dyn Stage<i32>> {
        stage_fn("double", |mut input: Receiver<i32>, output: Sender<i32>| async move {
            while let Some(item) = input.recv().await {
                let _ = output.send(item * 2).await;
            }
        })
    }

    #[tokio::test]
    async fn chain_forwards_through_every_stage() {
        let stages = vec![source(vec![1, 2, 3]), double(), double()];
        let out = tokio::time::timeout(TEST_TIMEOUT, run_pipeline(stages, 1))
            .await
            .expect("pipeline hung")
            .unwrap();
        assert_eq!(out, vec![4, 8, 12]);
    }

    #[tokio::test]
    async fn empty_stage_list_returns_nothing() {
        let out = run_pipeline::<i32>(Vec::new(), 1).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn first_stage_sees_closed_input() {
        let stages = vec![stage_fn(
            "probe",
            |mut input: Receiver<i32>, output: Sender<i32>| async move {
                let closed = input.recv().await.is_none();
                let _ = output.send(if closed { 1 } else { 0 }).await;
            },
        )];
        let out = tokio::time::timeout(TEST_TIMEOUT, run_pipeline(stages, 1))
            .await
            .expect("pipeline hung")
            .unwrap();
        assert_eq!(out, vec![1]);
    }

    #[tokio::test]
    async fn unread_terminal_channel_does_not_deadlock() {
        // Far more items than the channel can buffer, and no explicit sink.
        let stages = vec![source((0..100).collect()), double()];
        let out = tokio::time::timeout(TEST_TIMEOUT, run_pipeline(stages, 1))
            .await
            .expect("pipeline hung")
            .unwrap();
        assert_eq!(out.len(), 100);
    }

    #[tokio::test]
    async fn panicking_stage_is_reported_after_drain() {
        let stages = vec![
            source(vec![1, 2]),
            stage_fn("boom", |_input: Receiver<i32>, _output: Sender<i32>| async move {
                panic!("stage exploded");
            }),
            double(),
        ];
        let result = tokio::time::timeout(TEST_TIMEOUT, run_pipeline(stages, 1))
            .await
            .expect("pipeline hung");
        match result {
            Err(PipelineError::StagePanicked { stage, .. }) => assert_eq!(stage, "boom"),
            other => panic!("Expected StagePanicked, got {:?}", other),
        }
    }
}
