//! ECMC Sampling - Randomness consumed by event handlers
//!
//! - Uniform and exponential variates behind the [`UniformDraw`] seam
//! - The Walker alias sampler for O(1) weighted choices
//! - Lifting schemes that pick the next active unit after an event

pub mod random;
pub mod walker;
pub mod lifting;

pub use random::*;
pub use walker::*;
pub use lifting::*;
