//! Event handler protocol
//!
//! The mediator drives every handler through two calls:
//! 1. `send_event_time(in_state)` stores the in-state branches and returns
//!    the candidate event time together with a payload that names the state
//!    the handler needs for its out-state.
//! 2. `send_out_state(arguments)` is called only for the handler whose event
//!    time was the earliest. It returns the branches to commit, or `None`
//!    when the event is unconfirmed.
//!
//! An unconfirmed event changes nothing in the global state. The mediator
//! then calls `resend_event_time`, which continues from the state the
//! handler stored for the unconfirmed event, and pops the next event.

use std::sync::Arc;

use ecmc_core::{Cell, EcmcError, EcmcResult, Node, StateId, Time};
use ecmc_sampling::UniformDraw;

/// Place of a handler in the run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerRole {
    StartOfRun,
    EndOfRun,
    EndOfChain,
    Sampling,
    CellVeto,
    CellBoundary,
    Pair,
}

/// Global action the mediator runs after committing an event of the handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MediatingAction {
    None,
    /// Write the full global state to the named output.
    Sample { output: String },
    /// Optionally write the full global state, then stop the run.
    EndOfRun { output: Option<String> },
}

impl MediatingAction {
    /// Output the action writes to, if any.
    pub fn output(&self) -> Option<&str> {
        match self {
            MediatingAction::Sample { output } => Some(output),
            MediatingAction::EndOfRun { output } => output.as_deref(),
            MediatingAction::None => None,
        }
    }
}

/// Static description of a handler type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandlerDescriptor {
    pub name: &'static str,
    pub role: HandlerRole,
    pub mediating_action: MediatingAction,
}

/// State the mediator resolves before calling `send_out_state`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutStatePayload {
    /// The handler already holds everything it needs.
    Empty,
    /// The currently active global state.
    ActiveGlobalState,
    /// The active global state and the branches of the new active units.
    ActiveAndNewIdentifiers(Vec<StateId>),
    /// The occupants of a target cell in the internal cell occupancy.
    TargetCell(Cell),
    /// The branch of a single identifier.
    Identifier(StateId),
}

impl OutStatePayload {
    /// Whether `send_out_state` can run without any state resolved by the
    /// mediator.
    #[inline]
    pub fn is_self_contained(&self) -> bool {
        matches!(self, OutStatePayload::Empty)
    }
}

/// Resolved arguments of `send_out_state`.
#[derive(Clone, Debug, PartialEq)]
pub enum OutStateArguments {
    Empty,
    ActiveGlobalState(Vec<Node>),
    ActiveAndNew {
        active: Vec<Node>,
        new_active: Vec<Node>,
    },
    /// Branch of the occupant of the target cell, `None` for an empty cell.
    TargetOccupant(Option<Node>),
    Branch(Node),
}

impl OutStateArguments {
    fn kind(&self) -> &'static str {
        match self {
            OutStateArguments::Empty => "no arguments",
            OutStateArguments::ActiveGlobalState(_) => "the active global state",
            OutStateArguments::ActiveAndNew { .. } => "the active and new active states",
            OutStateArguments::TargetOccupant(_) => "a target cell occupant",
            OutStateArguments::Branch(_) => "a single branch",
        }
    }

    /// Error for a handler that was sent the wrong kind of arguments.
    pub fn unexpected(&self, handler: &str) -> EcmcError {
        EcmcError::mediator(format!(
            "{} cannot build its out-state from {}",
            handler,
            self.kind()
        ))
    }
}

/// Candidate event time and the payload for the out-state request.
#[derive(Clone, Debug, PartialEq)]
pub struct EventTimeReply {
    pub time: Time,
    pub payload: OutStatePayload,
}

impl EventTimeReply {
    #[inline]
    pub fn new(time: Time, payload: OutStatePayload) -> Self {
        EventTimeReply { time, payload }
    }
}

/// Event handler.
///
/// Implementations must be deterministic given the in-state and the uniform
/// variates they draw: the multi-process mediator relies on it to reproduce
/// the single-process event sequence.
pub trait EventHandler: Send {
    fn descriptor(&self) -> HandlerDescriptor;

    /// Store the in-state and compute the candidate event time.
    ///
    /// `in_state` is `None` for handlers whose tagger yields no identifiers.
    fn send_event_time(
        &mut self,
        in_state: Option<Vec<Node>>,
        rng: &mut dyn UniformDraw,
    ) -> EcmcResult<EventTimeReply>;

    /// Confirm or reject the event computed by the last `send_event_time`.
    ///
    /// `None` marks an unconfirmed event, only handlers that implement
    /// [`resend_event_time`](EventHandler::resend_event_time) may return it.
    fn send_out_state(
        &mut self,
        arguments: OutStateArguments,
        rng: &mut dyn UniformDraw,
    ) -> EcmcResult<Option<Vec<Node>>>;

    /// Next candidate event after an unconfirmed one, computed from the
    /// stored in-state.
    fn resend_event_time(&mut self, _rng: &mut dyn UniformDraw) -> EcmcResult<EventTimeReply> {
        Err(EcmcError::mediator(format!(
            "{} returned an unconfirmed event but cannot resend its event time",
            self.descriptor().name
        )))
    }
}

/// Builds independent handler instances from one shared configuration.
pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn EventHandler> + Send + Sync>;

/// Factory that clones a configured, never-run prototype for every instance.
pub fn handler_factory<H>(prototype: H) -> HandlerFactory
where
    H: EventHandler + Clone + Sync + 'static,
{
    Arc::new(move || Box::new(prototype.clone()) as Box<dyn EventHandler>)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mediating_action_output() {
        assert_eq!(MediatingAction::None.output(), None);
        assert_eq!(
            MediatingAction::Sample {
                output: "positions".to_string()
            }
            .output(),
            Some("positions")
        );
        assert_eq!(MediatingAction::EndOfRun { output: None }.output(), None);
    }

    #[test]
    fn test_self_contained_payload() {
        assert!(OutStatePayload::Empty.is_self_contained());
        assert!(!OutStatePayload::TargetCell(3).is_self_contained());
        assert!(!OutStatePayload::ActiveGlobalState.is_self_contained());
    }

    #[derive(Clone)]
    struct AlwaysConfirmed;

    impl EventHandler for AlwaysConfirmed {
        fn descriptor(&self) -> HandlerDescriptor {
            HandlerDescriptor {
                name: "AlwaysConfirmed",
                role: HandlerRole::Pair,
                mediating_action: MediatingAction::None,
            }
        }

        fn send_event_time(
            &mut self,
            _in_state: Option<Vec<Node>>,
            _rng: &mut dyn UniformDraw,
        ) -> EcmcResult<EventTimeReply> {
            Ok(EventTimeReply::new(Time::ZERO, OutStatePayload::Empty))
        }

        fn send_out_state(
            &mut self,
            _arguments: OutStateArguments,
            _rng: &mut dyn UniformDraw,
        ) -> EcmcResult<Option<Vec<Node>>> {
            Ok(Some(Vec::new()))
        }
    }

    #[test]
    fn test_resend_without_unconfirmed_events_is_mediator_error() {
        let mut handler = handler_factory(AlwaysConfirmed)();
        let mut draw = ecmc_sampling::SequenceDraw::new([0.5]);
        let error = handler.resend_event_time(&mut draw).unwrap_err();
        assert!(matches!(error, EcmcError::Mediator(_)));
        assert!(error.to_string().contains("AlwaysConfirmed"));
    }

    #[test]
    fn test_unexpected_arguments_is_mediator_error() {
        let error = OutStateArguments::Empty.unexpected("FinalTimeEndOfRunEventHandler");
        assert!(matches!(error, EcmcError::Mediator(_)));
        assert!(error.to_string().contains("no arguments"));
    }
}
