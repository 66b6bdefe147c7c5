//! # chant-core
//! Foundation types and traits for the Chant tiered deliberation engine.
//!
//! - [`types`]: deliberations, ideas, cells, votes and their status machines
//! - [`sizing`]: pure cell-size and idea-split planners
//! - [`tally`]: XP vote tallying and winner resolution
//! - [`store`]: persistence contract with conditional (compare-and-swap) commits
//! - [`traits`]: notifier and event-sink collaborators
//! - [`events`]: the engine's audit/event stream

pub mod constants;
pub mod error;
pub mod events;
pub mod sizing;
pub mod store;
pub mod tally;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod traits;
pub mod types;
