//! ECMC Events - Event handlers and the protocol the mediators drive
//!
//! An event handler proposes a candidate event time for the branches it was
//! given and, if its event is the earliest one, commits the event by
//! returning modified branches:
//! - [`EventHandler`]: the two-call protocol and its payloads
//! - [`capabilities`]: time slicing, leaf extraction and velocity exchange
//!   shared by the concrete handlers
//! - [`potential`] and [`estimator`]: the narrow physics interfaces
//! - [`BoundingViolationMonitor`]: bookkeeping of violated bounding potentials
//! - Concrete handlers for pair events, cell-veto and cell boundary events,
//!   sampling and the start and end of runs and chains

pub mod handler;
pub mod capabilities;
pub mod potential;
pub mod estimator;
pub mod bounding;

pub mod two_leaf;
pub mod two_leaf_bounding;
pub mod composite_summed;
pub mod cell_veto;
pub mod cell_boundary;
pub mod start_of_run;
pub mod end_of_run;
pub mod sampling;
pub mod end_of_chain;

pub use handler::*;
pub use capabilities::*;
pub use potential::*;
pub use estimator::*;
pub use bounding::*;

pub use two_leaf::TwoLeafUnitEventHandler;
pub use two_leaf_bounding::TwoLeafUnitBoundingPotentialEventHandler;
pub use composite_summed::TwoCompositeObjectSummedBoundingPotentialEventHandler;
pub use cell_veto::{CellVetoTables, LeafUnitCellVetoEventHandler};
pub use cell_boundary::CellBoundaryEventHandler;
pub use start_of_run::InitialChainStartOfRunEventHandler;
pub use end_of_run::FinalTimeEndOfRunEventHandler;
pub use sampling::FixedIntervalSamplingEventHandler;
pub use end_of_chain::SameActivePeriodicDirectionEndOfChainEventHandler;
