//! mockprep-core: Timed attempts, submission delivery and test sessions.
//!
//! This crate defines the data model, collaborator traits, attempt state
//! machine, submission queue and session orchestrator that the rest of
//! mockprep builds on.

pub mod attempt;
pub mod clock;
pub mod error;
pub mod events;
pub mod memory;
pub mod model;
pub mod parser;
pub mod queue;
pub mod session;
pub mod traits;
