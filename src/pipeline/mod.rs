//! Spam report pipeline.
//!
//! Addresses flow through four concurrent stages:
//! 1. `SelectUsers` — resolve each address, forward each account once
//! 2. `SelectMessages` — fetch message ids in batches of two
//! 3. `CheckSpam` — classify each message behind a shared capacity gate
//! 4. `CombineResults` — sort everything and emit report lines
//!
//! `engine::run_pipeline` wires any list of stages into a channel chain;
//! `SpamPipeline` is the fixed composition of the four above.

pub mod combine;
pub mod engine;
pub mod failures;
pub mod limiter;
pub mod messages;
pub mod retry;
pub mod runner;
pub mod spam;
pub mod types;
pub mod users;

pub use combine::CombineResults;
pub use engine::{Stage, run_pipeline, stage_fn};
pub use failures::{CollectingSink, FailureSink, LogSink, StageFailure};
pub use limiter::{CapacityGate, ConcurrencyLimit};
pub use messages::SelectMessages;
pub use runner::{SpamPipeline, SpamReport};
pub use spam::CheckSpam;
pub use types::{MsgData, MsgId, Payload, User};
pub use users::SelectUsers;
