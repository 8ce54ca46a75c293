//! End of event chains after a fixed chain length

use ecmc_core::{Context, EcmcError, EcmcResult, Node, Time};
use ecmc_sampling::UniformDraw;

use crate::capabilities::{
    node, node_mut, HandlerContext, LeafExtraction, StoredState, TimeSlicing, VelocityChanges, VelocityExchange,
};
use crate::handler::{
    EventHandler, EventTimeReply, HandlerDescriptor, HandlerRole, MediatingAction, OutStateArguments,
    OutStatePayload,
};

const NAME: &str = "SameActivePeriodicDirectionEndOfChainEventHandler";

/// Ends every event chain after `chain_length` and cycles the direction of
/// motion through the axes, keeping the active units and their speed.
#[derive(Clone, Debug)]
pub struct SameActivePeriodicDirectionEndOfChainEventHandler {
    context: Context,
    chain_length: f64,
    next_time: Time,
    stored: StoredState,
}

impl SameActivePeriodicDirectionEndOfChainEventHandler {
    pub fn new(context: Context, chain_length: f64) -> EcmcResult<Self> {
        if !(chain_length > 0.0) || !chain_length.is_finite() {
            return Err(EcmcError::configuration(format!(
                "the chain length must be finite and > 0.0, got {}",
                chain_length
            )));
        }
        Ok(SameActivePeriodicDirectionEndOfChainEventHandler {
            context,
            chain_length,
            next_time: Time::ZERO,
            stored: StoredState::default(),
        })
    }
}

impl HandlerContext for SameActivePeriodicDirectionEndOfChainEventHandler {
    fn context(&self) -> &Context {
        &self.context
    }
}

impl EventHandler for SameActivePeriodicDirectionEndOfChainEventHandler {
    fn descriptor(&self) -> HandlerDescriptor {
        HandlerDescriptor {
            name: NAME,
            role: HandlerRole::EndOfChain,
            mediating_action: MediatingAction::None,
        }
    }

    fn send_event_time(
        &mut self,
        _in_state: Option<Vec<Node>>,
        _rng: &mut dyn UniformDraw,
    ) -> EcmcResult<EventTimeReply> {
        self.next_time = self.next_time + self.chain_length;
        self.stored.set_event_time(self.next_time);
        Ok(EventTimeReply::new(
            self.next_time,
            OutStatePayload::ActiveAndNewIdentifiers(Vec::new()),
        ))
    }

    fn send_out_state(
        &mut self,
        arguments: OutStateArguments,
        _rng: &mut dyn UniformDraw,
    ) -> EcmcResult<Option<Vec<Node>>> {
        let event_time = self.stored.take_event_time(NAME)?;
        let mut branches = match arguments {
            OutStateArguments::ActiveAndNew { active, new_active } if new_active.is_empty() => active,
            other => return Err(other.unexpected(NAME)),
        };
        self.time_slice_all(&mut branches, event_time);

        let mut active_leaves = Vec::new();
        let mut velocity: Option<Vec<f64>> = None;
        for leaf in self.extract_leaves(&branches) {
            let unit = &node(&branches, &leaf)?.unit;
            let Some(leaf_velocity) = &unit.velocity else {
                continue;
            };
            match &velocity {
                Some(v) if v != leaf_velocity => {
                    return Err(EcmcError::precondition(format!(
                        "{} needs equal velocities of all active leaves, got {:?} and {:?}",
                        NAME, v, leaf_velocity
                    )))
                }
                Some(_) => {}
                None => velocity = Some(leaf_velocity.clone()),
            }
            active_leaves.push(leaf);
        }
        let velocity = velocity.ok_or_else(|| EcmcError::precondition("no active leaf at the end of a chain"))?;
        let mut moving = velocity.iter().enumerate().filter(|(_, v)| **v != 0.0);
        let (direction, speed) = match (moving.next(), moving.next()) {
            (Some((direction, &speed)), None) => (direction, speed),
            _ => {
                return Err(EcmcError::precondition(format!(
                    "{} needs a velocity along one axis, got {:?}",
                    NAME, velocity
                )))
            }
        };
        let new_direction = (direction + 1) % self.context.dimension();
        let mut new_velocity = vec![0.0; velocity.len()];
        new_velocity[new_direction] = speed;
        let change: Vec<f64> = new_velocity.iter().zip(&velocity).map(|(n, o)| n - o).collect();

        let mut changes = VelocityChanges::new();
        for leaf in &active_leaves {
            node_mut(&mut branches, leaf)?.unit.velocity = Some(new_velocity.clone());
            self.register_velocity_change_leaf(&mut changes, &branches, leaf, &change)?;
        }
        self.commit_non_leaf_velocity_changes(changes, &mut branches, event_time)?;
        tracing::debug!(%event_time, direction = new_direction, "End of event chain");
        Ok(Some(branches))
    }
}
