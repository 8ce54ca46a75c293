//! ECMC Test Harness - End-to-end runs and benchmarks
//!
//! This crate provides:
//! - System builders: hard disks, inverse-power particles, dimers and
//!   cell-veto systems wired to complete tagger graphs
//! - Event traces of runs and checks on them
//! - End-to-end tests of determinism, monotonic time and the equivalence of
//!   the single- and multi-process mediators

pub mod systems;
pub mod trace;
pub mod integration;

pub use systems::*;
pub use trace::*;
pub use integration::{run_system, MAX_STEPS};
