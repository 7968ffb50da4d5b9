//! Stage 1: resolve addresses to users, one output per account.
//!
//! Every address gets its own resolution worker. Workers race to register the
//! resolved identity in a shared set; only the first to claim an identity
//! forwards the user, so aliases of one account collapse into one output.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info, warn};

use crate::pipeline::engine::{Stage, join_workers, send_all};
use crate::pipeline::failures::{FailureSink, StageFailure};
use crate::pipeline::limiter::ConcurrencyLimit;
use crate::pipeline::types::Payload;
use crate::service::UserDirectory;

const STAGE: &str = "select_users";

/// Resolver/deduplicator stage. Consumes `Payload::Email`, emits `Payload::User`.
pub struct SelectUsers {
    directory: Arc<dyn UserDirectory>,
    limit: ConcurrencyLimit,
    failures: Arc<dyn FailureSink>,
}

impl SelectUsers {
    pub fn new(
        directory: Arc<dyn UserDirectory>,
        limit: ConcurrencyLimit,
        failures: Arc<dyn FailureSink>,
    ) -> Self {
        Self {
            directory,
            limit,
            failures,
        }
    }
}

#[async_trait]
impl Stage<Payload> for SelectUsers {
    fn name(&self) -> &str {
        STAGE
    }

    async fn run(self: Box<Self>, mut input: Receiver<Payload>, output: Sender<Payload>) {
        let seen: Arc<RwLock<HashSet<String>>> = Arc::new(RwLock::new(HashSet::new()));
        let mut workers = JoinSet::new();
        let mut received = 0usize;

        while let Some(item) = input.recv().await {
            let email = match item {
                Payload::Email(email) => email,
                other => {
                    warn!(stage = STAGE, kind = other.label(), "Skipping item that is not an email");
                    self.failures
                        .report(StageFailure::new(STAGE, other.to_string(), "expected an email"));
                    continue;
                }
            };
            received += 1;

            let permit = self.limit.acquire().await;
            let directory = Arc::clone(&self.directory);
            let failures = Arc::clone(&self.failures);
            let seen = Arc::clone(&seen);
            let output = output.clone();

            workers.spawn(async move {
                let _permit = permit;

                let user = match directory.get_user(&email).await {
                    Ok(user) => user,
                    Err(e) => {
                        failures.report(StageFailure::new(STAGE, format!("email {email}"), e));
                        return 0;
                    }
                };

                // Check and claim in one critical section.
                if !seen.write().await.insert(user.email.clone()) {
                    debug!(email = %email, identity = %user.email, "Duplicate identity, not forwarding");
                    return 0;
                }

                send_all(&output, [Payload::User(user)]).await
            }
            .in_current_span());
        }

        let emitted = join_workers(STAGE, workers).await;
        info!(stage = STAGE, received, emitted, "Users resolved");
    }
}
