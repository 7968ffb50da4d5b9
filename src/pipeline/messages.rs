//! Stage 2: fetch message ids for users, in batches.
//!
//! Users are grouped into batches of `batch_size`; each full batch (and the
//! trailing partial one) is fetched on its own worker. If a batch call fails
//! the worker falls back to one call per user, so a single bad mailbox only
//! loses that user's messages.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info, warn};

use crate::pipeline::engine::{Stage, join_workers, send_all};
use crate::pipeline::failures::{FailureSink, StageFailure};
use crate::pipeline::limiter::ConcurrencyLimit;
use crate::pipeline::types::{Payload, User};
use crate::service::Mailbox;

const STAGE: &str = "select_messages";

/// Batch fetcher stage. Consumes `Payload::User`, emits `Payload::Message`.
pub struct SelectMessages {
    mailbox: Arc<dyn Mailbox>,
    batch_size: usize,
    limit: ConcurrencyLimit,
    failures: Arc<dyn FailureSink>,
}

impl SelectMessages {
    pub fn new(
        mailbox: Arc<dyn Mailbox>,
        batch_size: usize,
        limit: ConcurrencyLimit,
        failures: Arc<dyn FailureSink>,
    ) -> Self {
        Self {
            mailbox,
            batch_size: batch_size.max(1),
            limit,
            failures,
        }
    }

    async fn dispatch(&self, workers: &mut JoinSet<usize>, batch: Vec<User>, output: &Sender<Payload>) {
        let permit = self.limit.acquire().await;
        let mailbox = Arc::clone(&self.mailbox);
        let failures = Arc::clone(&self.failures);
        let output = output.clone();

        workers.spawn(async move {
            let _permit = permit;
            fetch_batch(mailbox.as_ref(), failures.as_ref(), &batch, &output).await
        }
        .in_current_span());
    }
}

#[async_trait]
impl Stage<Payload> for SelectMessages {
    fn name(&self) -> &str {
        STAGE
    }

    async fn run(self: Box<Self>, mut input: Receiver<Payload>, output: Sender<Payload>) {
        let mut workers = JoinSet::new();
        let mut batch: Vec<User> = Vec::new();
        let mut batches = 0usize;

        while let Some(item) = input.recv().await {
            let user = match item {
                Payload::User(user) => user,
                other => {
                    warn!(stage = STAGE, kind = other.label(), "Skipping item that is not a user");
                    self.failures
                        .report(StageFailure::new(STAGE, other.to_string(), "expected a user"));
                    continue;
                }
            };

            batch.push(user);
            if batch.len() == self.batch_size {
                // The worker gets its own vector; accumulation restarts empty.
                let full = std::mem::take(&mut batch);
                self.dispatch(&mut workers, full, &output).await;
                batches += 1;
            }
        }

        if !batch.is_empty() {
            self.dispatch(&mut workers, batch, &output).await;
            batches += 1;
        }

        let emitted = join_workers(STAGE, workers).await;
        info!(stage = STAGE, batches, emitted, "Messages fetched");
    }
}

/// Fetch one batch, degrading to per-user calls if the batch call fails.
async fn fetch_batch(
    mailbox: &dyn Mailbox,
    failures: &dyn FailureSink,
    batch: &[User],
    output: &Sender<Payload>,
) -> usize {
    match mailbox.get_messages(batch).await {
        Ok(ids) => {
            debug!(stage = STAGE, users = batch.len(), messages = ids.len(), "Batch fetched");
            send_all(output, ids.into_iter().map(Payload::Message)).await
        }
        Err(err) => {
            warn!(
                stage = STAGE,
                users = batch.len(),
                error = %err,
                "Batch fetch failed, falling back to per-user lookups"
            );
            let mut sent = 0;
            for user in batch {
                match mailbox.get_messages(std::slice::from_ref(user)).await {
                    Ok(ids) => sent += send_all(output, ids.into_iter().map(Payload::Message)).await,
                    Err(e) => failures.report(StageFailure::new(
                        STAGE,
                        Payload::User(user.clone()).to_string(),
                        e,
                    )),
                }
            }
            sent
        }
    }
}
