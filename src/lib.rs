//! Spammer — concurrent spam report pipeline.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod service;
