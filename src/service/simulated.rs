//! In-process stand-in for the user directory, mailbox and spam checker.
//!
//! Behaves like the real services where it matters to the pipeline:
//! - several addresses can alias one account
//! - batch lookups over `max_batch` users are rejected
//! - more than `max_concurrent_checks` simultaneous spam checks get
//!   `TooManyRequests`
//!
//! Message counts and verdicts come from a seeded RNG so runs are
//! reproducible. Message ids are allocated per user and never overlap.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::error::CollaboratorError;
use crate::pipeline::types::{MsgId, User};
use crate::service::traits::{Mailbox, SpamChecker, UserDirectory};

/// Tunables for [`SimulatedMailService`].
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Latency of every `get_user` call.
    pub user_latency: Duration,
    /// Latency of every `get_messages` call.
    pub messages_latency: Duration,
    /// Latency of every `has_spam` call.
    pub spam_latency: Duration,
    /// Largest batch `get_messages` accepts.
    pub max_batch: usize,
    /// Spam checks allowed in flight before `TooManyRequests`.
    pub max_concurrent_checks: usize,
    /// Upper bound on messages generated per user (at least one).
    pub max_messages_per_user: usize,
    /// Probability that a generated message is spam.
    pub spam_ratio: f64,
    /// RNG seed for ids and verdicts.
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            user_latency: Duration::ZERO,
            messages_latency: Duration::ZERO,
            spam_latency: Duration::ZERO,
            max_batch: 2,
            max_concurrent_checks: 5,
            max_messages_per_user: 3,
            spam_ratio: 0.5,
            seed: 0x5eed,
        }
    }
}

impl SimulationConfig {
    /// Latencies in the range of a remote service.
    pub fn with_network_latency() -> Self {
        Self {
            user_latency: Duration::from_millis(100),
            messages_latency: Duration::from_millis(100),
            spam_latency: Duration::from_millis(20),
            ..Self::default()
        }
    }
}

/// Decrements the in-flight counter when a spam check ends.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Simulated backend implementing all three collaborator traits.
#[derive(Debug)]
pub struct SimulatedMailService {
    config: SimulationConfig,
    /// Lowercased alias → canonical address.
    aliases: HashMap<String, String>,
    /// Canonical addresses whose mailbox lookups always fail.
    unavailable: HashSet<String>,
    checks_in_flight: AtomicUsize,
    user_calls: AtomicUsize,
    batch_calls: AtomicUsize,
    spam_calls: AtomicUsize,
}

impl SimulatedMailService {
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            aliases: HashMap::new(),
            unavailable: HashSet::new(),
            checks_in_flight: AtomicUsize::new(0),
            user_calls: AtomicUsize::new(0),
            batch_calls: AtomicUsize::new(0),
            spam_calls: AtomicUsize::new(0),
        }
    }

    /// Make `alias` resolve to the account of `canonical`.
    pub fn with_alias(mut self, alias: &str, canonical: &str) -> Self {
        self.aliases
            .insert(normalize(alias), normalize(canonical));
        self
    }

    /// Make every mailbox lookup involving `email`'s account fail.
    pub fn with_unavailable_mailbox(mut self, email: &str) -> Self {
        let canonical = self.canonical(email);
        self.unavailable.insert(canonical);
        self
    }

    /// A small directory where a few people own more than one address.
    pub fn with_demo_aliases(self) -> Self {
        self.with_alias("harry.dubois@yandex.ru", "harry.dubois@mail.ru")
            .with_alias("k.kitsuragi@mail.ru", "k.kitsuragi@yandex.ru")
            .with_alias("kim.kitsuragi@gmail.com", "k.kitsuragi@yandex.ru")
            .with_alias("j.kuno@ya.ru", "j.kuno@mail.ru")
    }

    pub fn user_calls(&self) -> usize {
        self.user_calls.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn spam_calls(&self) -> usize {
        self.spam_calls.load(Ordering::SeqCst)
    }

    fn canonical(&self, email: &str) -> String {
        let key = normalize(email);
        self.aliases.get(&key).cloned().unwrap_or(key)
    }

    fn messages_for(&self, user: &User) -> Vec<MsgId> {
        let mut rng = StdRng::seed_from_u64(self.config.seed ^ user.id);
        let count = rng.gen_range(1..=self.config.max_messages_per_user.clamp(1, 999));
        // Ids are namespaced by user so no two users share a message.
        let base = user.id.wrapping_mul(1000);
        (0..count as u64).map(|n| MsgId(base.wrapping_add(n + 1))).collect()
    }
}

#[async_trait]
impl UserDirectory for SimulatedMailService {
    async fn get_user(&self, email: &str) -> Result<User, CollaboratorError> {
        self.user_calls.fetch_add(1, Ordering::SeqCst);
        sleep(self.config.user_latency).await;

        let canonical = self.canonical(email);
        if canonical.is_empty() || !canonical.contains('@') {
            return Err(CollaboratorError::UnknownUser(email.to_string()));
        }

        let user = User {
            id: stable_id(&canonical),
            email: canonical,
        };
        debug!(email, user_id = user.id, "Resolved user");
        Ok(user)
    }
}

#[async_trait]
impl Mailbox for SimulatedMailService {
    async fn get_messages(&self, users: &[User]) -> Result<Vec<MsgId>, CollaboratorError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        sleep(self.config.messages_latency).await;

        if users.len() > self.config.max_batch {
            return Err(CollaboratorError::BatchTooLarge {
                size: users.len(),
                max: self.config.max_batch,
            });
        }
        if let Some(user) = users.iter().find(|u| self.unavailable.contains(&u.email)) {
            return Err(CollaboratorError::Unavailable(format!(
                "mailbox of {} is unreachable",
                user.email
            )));
        }

        Ok(users.iter().flat_map(|u| self.messages_for(u)).collect())
    }
}

#[async_trait]
impl SpamChecker for SimulatedMailService {
    async fn has_spam(&self, id: MsgId) -> Result<bool, CollaboratorError> {
        self.spam_calls.fetch_add(1, Ordering::SeqCst);
        let current = self.checks_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.checks_in_flight);

        if current > self.config.max_concurrent_checks {
            return Err(CollaboratorError::TooManyRequests);
        }

        sleep(self.config.spam_latency).await;
        let mut rng = StdRng::seed_from_u64(self.config.seed ^ id.0.rotate_left(17));
        Ok(rng.gen_bool(self.config.spam_ratio.clamp(0.0, 1.0)))
    }
}

fn normalize(email: &str) -> String {
    email.trim().to_lowercase()
}

fn stable_id(canonical: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    canonical.hash(&mut hasher);
    hasher.finish() % 1_000_000
}

async fn sleep(latency: Duration) {
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn aliases_resolve_to_one_user() {
        let service = SimulatedMailService::new(SimulationConfig::default()).with_demo_aliases();
        let a = service.get_user("harry.dubois@mail.ru").await.unwrap();
        let b = service.get_user("Harry.Dubois@Yandex.ru").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(service.user_calls(), 2);
    }

    #[tokio::test]
    async fn malformed_address_is_unknown() {
        let service = SimulatedMailService::new(SimulationConfig::default());
        let err = service.get_user("not-an-address").await.unwrap_err();
        assert!(matches!(err, CollaboratorError::UnknownUser(_)));
    }

    #[tokio::test]
    async fn oversized_batch_is_rejected() {
        let service = SimulatedMailService::new(SimulationConfig::default());
        let users: Vec<User> = (0..3)
            .map(|i| User { id: i, email: format!("u{i}@x.com") })
            .collect();
        let err = service.get_messages(&users).await.unwrap_err();
        assert_eq!(err, CollaboratorError::BatchTooLarge { size: 3, max: 2 });
    }

    #[tokio::test]
    async fn messages_are_deterministic() {
        let service = SimulatedMailService::new(SimulationConfig::default());
        let user = service.get_user("a@x.com").await.unwrap();
        let first = service.get_messages(std::slice::from_ref(&user)).await.unwrap();
        let second = service.get_messages(std::slice::from_ref(&user)).await.unwrap();
        assert!(!first.is_empty());
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn users_never_share_message_ids() {
        let service = SimulatedMailService::new(SimulationConfig {
            max_messages_per_user: 3,
            ..SimulationConfig::default()
        });
        let mut seen = HashSet::new();
        for i in 0..50 {
            let user = service.get_user(&format!("user{i}@x.com")).await.unwrap();
            for id in service.get_messages(std::slice::from_ref(&user)).await.unwrap() {
                assert!(seen.insert(id), "message {id} issued twice");
            }
        }
    }

    #[tokio::test]
    async fn unavailable_mailbox_fails_batch() {
        let service =
            SimulatedMailService::new(SimulationConfig::default()).with_unavailable_mailbox("b@x.com");
        let a = service.get_user("a@x.com").await.unwrap();
        let b = service.get_user("b@x.com").await.unwrap();

        assert!(service.get_messages(&[a.clone(), b]).await.is_err());
        assert!(service.get_messages(&[a]).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn overload_returns_too_many_requests() {
        let service = Arc::new(SimulatedMailService::new(SimulationConfig {
            spam_latency: Duration::from_millis(50),
            max_concurrent_checks: 2,
            ..SimulationConfig::default()
        }));

        let mut handles = Vec::new();
        for i in 0..6 {
            let service = Arc::clone(&service);
            handles.push(tokio::spawn(async move { service.has_spam(MsgId(i)).await }));
        }

        let mut throttled = 0;
        for handle in handles {
            if handle.await.unwrap() == Err(CollaboratorError::TooManyRequests) {
                throttled += 1;
            }
        }
        assert!(throttled >= 1, "expected at least one throttled check");
        assert_eq!(service.spam_calls(), 6);
    }
}
