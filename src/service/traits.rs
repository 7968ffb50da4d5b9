//! Async interfaces for the external services the stages depend on.
//!
//! All three are opaque request/response calls: latency is unknown and any
//! call may fail. Stages hold them as `Arc<dyn …>` so one backend can serve
//! several stages.

use async_trait::async_trait;

use crate::error::CollaboratorError;
use crate::pipeline::types::{MsgId, User};

/// Resolves an address to the account that owns it.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Look up the user behind `email`. Aliases of one account resolve to the
    /// same `User`.
    async fn get_user(&self, email: &str) -> Result<User, CollaboratorError>;
}

/// Message lookup, batched.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Fetch message ids for every user in `users`. Fails as a whole.
    async fn get_messages(&self, users: &[User]) -> Result<Vec<MsgId>, CollaboratorError>;
}

/// Single-message spam classification.
#[async_trait]
pub trait SpamChecker: Send + Sync {
    /// Classify one message. May fail with `TooManyRequests` under load.
    async fn has_spam(&self, id: MsgId) -> Result<bool, CollaboratorError>;
}
