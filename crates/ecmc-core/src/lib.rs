//! ECMC Core - Fundamental types and primitives
//!
//! This crate defines the core types used throughout the ECMC kernel:
//! - Identifiers (StateId, HandlerId)
//! - Split-precision simulation time
//! - Units and the trees of the global state
//! - The immutable simulation context and periodic cell systems

pub mod id;
pub mod time;
pub mod node;
pub mod context;
pub mod cells;
pub mod error;

pub use id::*;
pub use time::*;
pub use node::*;
pub use context::*;
pub use cells::*;
pub use error::*;
