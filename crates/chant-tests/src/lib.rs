//! Cross-crate test suite for Chant.
//!
//! Integration tests drive the engine end to end over the in-memory store:
//! the reference scenarios, racing completions, and randomized invariants.

pub mod helpers;
