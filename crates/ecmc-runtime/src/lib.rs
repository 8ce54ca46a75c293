//! ECMC Runtime - Scheduling and mediation of event handlers
//!
//! This crate drives the event loop of a run:
//! - [`Scheduler`]: candidate event times, earliest first
//! - [`TagActivator`] and the taggers: which handlers compute new events
//!   after a commit, with which in-states
//! - [`SingleActiveCellOccupancy`]: cell occupancy for cell-veto systems
//! - [`SingleProcessMediator`] and [`MultiProcessMediator`]: the event loop
//! - [`RunConfig`], output sinks and tracing setup

pub mod scheduler;
pub mod rng;
pub mod occupancy;
pub mod tagger;
pub mod activator;
pub mod output;
pub mod mediator;
pub mod multi_process;
pub mod config;
pub mod logging;

pub use scheduler::*;
pub use rng::HandlerRng;
pub use occupancy::SingleActiveCellOccupancy;
pub use tagger::{TaggerConfig, TaggerKind};
pub use activator::{HandlerToRun, TagActivator};
pub use output::*;
pub use mediator::{build_mediator, Mediator, RunOutcome, RunSummary, SingleProcessMediator, StepOutcome};
pub use multi_process::MultiProcessMediator;
pub use config::{MediatorKind, RunConfig};
pub use logging::{init_tracing, LoggingConfig};
