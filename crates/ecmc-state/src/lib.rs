//! ECMC State - Global state storage behind a narrow interface
//!
//! The kernel never inspects how the global state is stored. It extracts
//! branches, hands them to event handlers, and inserts the returned branches:
//! - [`StateHandler`]: the three extract/insert operations the kernel uses
//! - [`TreeStateHandler`]: in-memory forest of units plus the lifted velocities

pub mod handler;
pub mod tree;

pub use handler::*;
pub use tree::*;
