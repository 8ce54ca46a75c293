//! Start of the first event chain

use ecmc_core::{Context, EcmcError, EcmcResult, Node, StateId, Time};
use ecmc_sampling::UniformDraw;

use crate::capabilities::{node_mut, HandlerContext, LeafExtraction, VelocityChanges, VelocityExchange};
use crate::handler::{
    EventHandler, EventTimeReply, HandlerDescriptor, HandlerRole, MediatingAction, OutStateArguments,
    OutStatePayload,
};

const NAME: &str = "InitialChainStartOfRunEventHandler";

/// Starts the run at time zero by giving every leaf of one unit the initial
/// velocity.
#[derive(Clone, Debug)]
pub struct InitialChainStartOfRunEventHandler {
    context: Context,
    initial_velocity: Vec<f64>,
    initial_active_identifier: StateId,
    pending: bool,
}

impl InitialChainStartOfRunEventHandler {
    pub fn new(context: Context, initial_velocity: Vec<f64>, initial_active_identifier: StateId) -> EcmcResult<Self> {
        if initial_velocity.len() != context.dimension() {
            return Err(EcmcError::configuration(format!(
                "the initial velocity {:?} does not match the dimension {}",
                initial_velocity,
                context.dimension()
            )));
        }
        if initial_velocity.iter().all(|v| *v == 0.0) {
            return Err(EcmcError::configuration("the initial velocity must not vanish"));
        }
        if initial_active_identifier.is_empty() {
            return Err(EcmcError::configuration("the initial active identifier must not be empty"));
        }
        Ok(InitialChainStartOfRunEventHandler {
            context,
            initial_velocity,
            initial_active_identifier,
            pending: false,
        })
    }
}

impl HandlerContext for InitialChainStartOfRunEventHandler {
    fn context(&self) -> &Context {
        &self.context
    }
}

impl EventHandler for InitialChainStartOfRunEventHandler {
    fn descriptor(&self) -> HandlerDescriptor {
        HandlerDescriptor {
            name: NAME,
            role: HandlerRole::StartOfRun,
            mediating_action: MediatingAction::None,
        }
    }

    fn send_event_time(
        &mut self,
        _in_state: Option<Vec<Node>>,
        _rng: &mut dyn UniformDraw,
    ) -> EcmcResult<EventTimeReply> {
        self.pending = true;
        Ok(EventTimeReply::new(
            Time::ZERO,
            OutStatePayload::Identifier(self.initial_active_identifier.clone()),
        ))
    }

    fn send_out_state(
        &mut self,
        arguments: OutStateArguments,
        _rng: &mut dyn UniformDraw,
    ) -> EcmcResult<Option<Vec<Node>>> {
        if !std::mem::take(&mut self.pending) {
            return Err(EcmcError::mediator(format!(
                "{} was asked for an out-state without a preceding event time",
                NAME
            )));
        }
        let branch = match arguments {
            OutStateArguments::Branch(branch) => branch,
            other => return Err(other.unexpected(NAME)),
        };
        let mut branches = vec![branch];
        let mut changes = VelocityChanges::new();
        for leaf in self.extract_leaves(&branches) {
            let unit = &mut node_mut(&mut branches, &leaf)?.unit;
            if unit.velocity.is_some() || unit.time_stamp.is_some() {
                return Err(EcmcError::precondition(format!(
                    "unit {} is already active at the start of the run",
                    unit.identifier
                )));
            }
            unit.velocity = Some(self.initial_velocity.clone());
            unit.time_stamp = Some(Time::ZERO);
            self.register_velocity_change_leaf(&mut changes, &branches, &leaf, &self.initial_velocity)?;
        }
        self.commit_non_leaf_velocity_changes(changes, &mut branches, Time::ZERO)?;
        tracing::debug!(
            identifier = %self.initial_active_identifier,
            velocity = ?self.initial_velocity,
            "Started the first event chain"
        );
        Ok(Some(branches))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecmc_core::Unit;
    use ecmc_sampling::SequenceDraw;

    fn context() -> Context {
        Context::with_composites(vec![1.0, 1.0], 1.0, 2, 2).unwrap()
    }

    #[test]
    fn test_rejects_bad_configuration() {
        assert!(InitialChainStartOfRunEventHandler::new(context(), vec![1.0], StateId::root(0)).is_err());
        assert!(InitialChainStartOfRunEventHandler::new(context(), vec![0.0, 0.0], StateId::root(0)).is_err());
    }

    #[test]
    fn test_starts_whole_composite() {
        let mut handler =
            InitialChainStartOfRunEventHandler::new(context(), vec![1.0, 0.0], StateId::root(0)).unwrap();
        let mut draw = SequenceDraw::new([]);
        let reply = handler.send_event_time(None, &mut draw).unwrap();
        assert_eq!(reply.time, Time::ZERO);
        assert_eq!(reply.payload, OutStatePayload::Identifier(StateId::root(0)));

        let dimer = Node::composite(
            Unit::new(StateId::root(0), vec![0.5, 0.5]),
            vec![
                Unit::new(StateId::child(0, 0), vec![0.4, 0.5]),
                Unit::new(StateId::child(0, 1), vec![0.6, 0.5]),
            ],
        );
        let out = handler
            .send_out_state(OutStateArguments::Branch(dimer), &mut draw)
            .unwrap()
            .unwrap();
        assert_eq!(out[0].unit.velocity, Some(vec![1.0, 0.0]));
        assert_eq!(out[0].unit.time_stamp, Some(Time::ZERO));
        for child in &out[0].children {
            assert_eq!(child.unit.velocity, Some(vec![1.0, 0.0]));
        }
    }

    #[test]
    fn test_active_unit_is_rejected() {
        let mut handler =
            InitialChainStartOfRunEventHandler::new(context(), vec![1.0, 0.0], StateId::root(0)).unwrap();
        let mut draw = SequenceDraw::new([]);
        handler.send_event_time(None, &mut draw).unwrap();
        let active = Node::new(
            Unit::new(StateId::root(0), vec![0.5, 0.5]).with_velocity(vec![1.0, 0.0], Time::ZERO),
            1.0,
        );
        assert!(matches!(
            handler.send_out_state(OutStateArguments::Branch(active), &mut draw),
            Err(EcmcError::Precondition(_))
        ));
    }
}
