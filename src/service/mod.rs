//! Collaborators the pipeline calls out to: user directory, mailbox and
//! spam checker, plus an in-process simulation of all three.

pub mod simulated;
pub mod traits;

pub use simulated::{SimulatedMailService, SimulationConfig};
pub use traits::{Mailbox, SpamChecker, UserDirectory};
