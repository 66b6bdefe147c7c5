//! # chant-engine
//! The tiered elimination engine.
//!
//! [`Engine`] is the facade every caller goes through. Its operations are
//! spread over modules by concern:
//!
//! - [`assignment`]: cell planning: batch seating, FCFS idea groups
//! - [`cell_result`]: exactly-once cell completion and batch tallies
//! - [`tier`]: synchronized tier completion, backfill, up-pollination
//! - [`continuous`]: incremental next-tier formation
//! - [`champion`]: champion declaration, accumulation and challenge rounds
//! - [`prediction`]: prediction resolution and user streaks
//! - [`follow_up`]: explicit queue of deferred formation/tier checks
//! - [`sweep`]: timeout sweep driven by a scheduler

pub mod assignment;
pub mod cell_result;
pub mod champion;
pub mod config;
pub mod continuous;
pub mod engine;
pub mod follow_up;
#[cfg(test)]
mod harness;
pub mod prediction;
pub mod sweep;
pub mod tier;

pub use cell_result::CellOutcome;
pub use champion::ChallengeOutcome;
pub use config::EngineConfig;
pub use continuous::FlowOutcome;
pub use engine::{Engine, Seat, StartOutcome, VoteOutcome};
pub use follow_up::FollowUp;
pub use sweep::SweepReport;
pub use tier::TierOutcome;
