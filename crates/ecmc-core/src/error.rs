//! Error types for the ECMC kernel

use thiserror::Error;

use crate::{HandlerId, StateId};

/// Kernel errors.
///
/// Every variant except `BoundingPotentialViolation` is fatal for a run: it
/// signals miswiring or a bug in an event handler, never a condition to retry.
#[derive(Error, Debug)]
pub enum EcmcError {
    // Wiring errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{component} was used before its initialization")]
    Uninitialized { component: String },

    // Scheduling errors
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Tag activator error: {0}")]
    TagActivator(String),

    #[error("Mediator error: {0}")]
    Mediator(String),

    #[error("Event handler precondition violated: {0}")]
    Precondition(String),

    #[error("Event handler {handler} is in lifecycle state {state} and cannot {action}")]
    Lifecycle {
        handler: HandlerId,
        state: String,
        action: String,
    },

    // Sampling errors
    #[error("Lifting scheme error: {0}")]
    LiftingScheme(String),

    #[error(
        "Bounding potential of {handler} was violated {count} times (limit {limit}); \
         last bound {bound}, real rate {real}"
    )]
    BoundingPotentialViolation {
        handler: String,
        count: u64,
        limit: u64,
        bound: f64,
        real: f64,
    },

    // State errors
    #[error("State not found: {0:?}")]
    StateNotFound(StateId),

    #[error("Output error: {0}")]
    Output(String),
}

impl EcmcError {
    pub fn configuration(message: impl Into<String>) -> Self {
        EcmcError::Configuration(message.into())
    }

    pub fn mediator(message: impl Into<String>) -> Self {
        EcmcError::Mediator(message.into())
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        EcmcError::Precondition(message.into())
    }
}

/// Result type for kernel operations
pub type EcmcResult<T> = Result<T, EcmcError>;
