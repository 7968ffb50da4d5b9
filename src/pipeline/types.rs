//! Shared types for the spam-report pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Domain records ──────────────────────────────────────────────────

/// A resolved account. Two addresses that resolve to the same `email`
/// are the same user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    /// Canonical address; the deduplication key.
    pub email: String,
}

/// Handle to one message in some user's mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MsgId(pub u64);

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a successful spam check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgData {
    pub id: MsgId,
    pub has_spam: bool,
}

impl MsgData {
    /// Report line: `"<spam-flag> <message-id>"`.
    pub fn report_line(&self) -> String {
        format!("{} {}", self.has_spam, self.id)
    }
}

// ── Channel payload ─────────────────────────────────────────────────

/// Value carried between stages.
///
/// Every stage accepts one variant and produces another; anything else
/// arriving on its input is a malformed item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Raw input address.
    Email(String),
    /// Resolved, deduplicated user.
    User(User),
    /// Message belonging to a user.
    Message(MsgId),
    /// Classified message.
    Verdict(MsgData),
    /// Final report line.
    Line(String),
}

impl Payload {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Email(_) => "email",
            Self::User(_) => "user",
            Self::Message(_) => "message",
            Self::Verdict(_) => "verdict",
            Self::Line(_) => "line",
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Email(email) => write!(f, "email {email}"),
            Self::User(user) => write!(f, "user {} <{}>", user.id, user.email),
            Self::Message(id) => write!(f, "message {id}"),
            Self::Verdict(data) => write!(f, "verdict {}", data.report_line()),
            Self::Line(line) => write!(f, "line {line:?}"),
        }
    }
}
