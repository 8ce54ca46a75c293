//! Pair events between two leaf units sampled from a bounding potential

use std::sync::Arc;

use ecmc_core::{Context, EcmcError, EcmcResult, Node, NodePath};
use ecmc_sampling::{expovariate, UniformDraw};

use crate::bounding::BoundingViolationMonitor;
use crate::capabilities::{
    node, ActiveLeaf, HandlerContext, LeafExtraction, SingleActiveLeaf, StoredState, TimeSlicing,
    VelocityExchange,
};
use crate::handler::{
    EventHandler, EventTimeReply, HandlerDescriptor, HandlerRole, MediatingAction, OutStateArguments,
    OutStatePayload,
};
use crate::potential::{InvertiblePotential, Potential};
use crate::two_leaf::image_displacement;

const NAME: &str = "TwoLeafUnitBoundingPotentialEventHandler";

/// Leaf unit pair whose candidate events come from an invertible bounding
/// potential and are confirmed against the real potential.
#[derive(Clone, Debug)]
pub struct TwoLeafUnitBoundingPotentialEventHandler {
    context: Context,
    potential: Arc<dyn Potential>,
    bounding_potential: Arc<dyn InvertiblePotential>,
    charge: Option<String>,
    monitor: BoundingViolationMonitor,
    stored: StoredState,
    leaves: Vec<NodePath>,
    active: Option<ActiveLeaf>,
}

impl TwoLeafUnitBoundingPotentialEventHandler {
    pub fn new(
        context: Context,
        potential: Arc<dyn Potential>,
        bounding_potential: Arc<dyn InvertiblePotential>,
        charge: Option<String>,
        bounding_violation_limit: Option<u64>,
    ) -> EcmcResult<Self> {
        potential.descriptor().validate(NAME, 1, charge.as_deref())?;
        bounding_potential
            .descriptor()
            .validate(NAME, 1, charge.as_deref())?;
        Ok(TwoLeafUnitBoundingPotentialEventHandler {
            context,
            potential,
            bounding_potential,
            charge,
            monitor: BoundingViolationMonitor::new(bounding_violation_limit),
            stored: StoredState::default(),
            leaves: Vec::new(),
            active: None,
        })
    }

    pub fn bounding_violations(&self) -> u64 {
        self.monitor.count()
    }
}

impl HandlerContext for TwoLeafUnitBoundingPotentialEventHandler {
    fn context(&self) -> &Context {
        &self.context
    }
}

impl EventHandler for TwoLeafUnitBoundingPotentialEventHandler {
    fn descriptor(&self) -> HandlerDescriptor {
        HandlerDescriptor {
            name: NAME,
            role: HandlerRole::Pair,
            mediating_action: MediatingAction::None,
        }
    }

    fn send_event_time(
        &mut self,
        in_state: Option<Vec<Node>>,
        rng: &mut dyn UniformDraw,
    ) -> EcmcResult<EventTimeReply> {
        let mut branches =
            in_state.ok_or_else(|| EcmcError::precondition(format!("{} needs an in-state", NAME)))?;
        let leaves = self.extract_exact_leaves(&branches, 2)?;
        let active = self.single_active_leaf(&branches, &leaves)?;
        let target_path = if leaves[0] == active.path { &leaves[1] } else { &leaves[0] };

        let active_unit = &node(&branches, &active.path)?.unit;
        let target_unit = &node(&branches, target_path)?.unit;
        let separation = self
            .context
            .separation_vector(&active_unit.position, &target_unit.position);
        let charges = self
            .bounding_potential
            .descriptor()
            .charges(self.charge.as_deref(), active_unit, target_unit)?;
        let potential_change = expovariate(rng, self.context.beta());
        let displacement = image_displacement(
            self.bounding_potential.as_ref(),
            &self.context,
            active.direction,
            separation,
            &charges,
            potential_change,
        );

        let event_time = active.time_stamp + displacement / active.speed;
        if event_time.is_finite() {
            self.time_slice_all(&mut branches, event_time);
        }
        self.leaves = leaves;
        self.active = Some(active);
        self.stored.store(branches);
        self.stored.set_event_time(event_time);
        Ok(EventTimeReply::new(event_time, OutStatePayload::Empty))
    }

    fn send_out_state(
        &mut self,
        arguments: OutStateArguments,
        rng: &mut dyn UniformDraw,
    ) -> EcmcResult<Option<Vec<Node>>> {
        self.stored.take_event_time(NAME)?;
        if arguments != OutStateArguments::Empty {
            return Err(arguments.unexpected(NAME));
        }
        let active = self
            .active
            .take()
            .ok_or_else(|| EcmcError::mediator(format!("{} has no stored active leaf", NAME)))?;
        let mut branches = self.stored.take_branches();
        let target_path = if self.leaves[0] == active.path {
            self.leaves[1].clone()
        } else {
            self.leaves[0].clone()
        };

        let (bounding_rate, real_rate) = {
            let active_unit = &node(&branches, &active.path)?.unit;
            let target_unit = &node(&branches, &target_path)?.unit;
            let separation = self
                .context
                .separation_vector(&active_unit.position, &target_unit.position);
            let charges = self
                .potential
                .descriptor()
                .charges(self.charge.as_deref(), active_unit, target_unit)?;
            let bounding_charges = self
                .bounding_potential
                .descriptor()
                .charges(self.charge.as_deref(), active_unit, target_unit)?;
            (
                self.bounding_potential
                    .derivative(active.direction, &[&separation], &bounding_charges),
                self.potential.derivative(active.direction, &[&separation], &charges),
            )
        };
        if self.monitor.confirm(NAME, bounding_rate, real_rate, rng)? {
            self.exchange_velocity(&mut branches, &active.path, &target_path)?;
        }
        Ok(Some(branches))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::potential::InversePowerPotential;
    use ecmc_core::{StateId, Time, Unit};
    use ecmc_sampling::SequenceDraw;

    fn handler(bounding_prefactor: f64) -> TwoLeafUnitBoundingPotentialEventHandler {
        let context = Context::hypercubic(2, 2.0, 1.0).unwrap();
        let potential = Arc::new(InversePowerPotential::new(2.0, 1.0).unwrap());
        let bounding = Arc::new(InversePowerPotential::new(2.0, bounding_prefactor).unwrap());
        TwoLeafUnitBoundingPotentialEventHandler::new(context, potential, bounding, None, None).unwrap()
    }

    fn in_state() -> Vec<Node> {
        vec![
            Node::new(
                Unit::new(StateId::root(0), vec![0.1, 0.5]).with_velocity(vec![1.0, 0.0], Time::ZERO),
                1.0,
            ),
            Node::new(Unit::new(StateId::root(1), vec![0.6, 0.6]), 1.0),
        ]
    }

    #[test]
    fn test_accepted_event_exchanges_velocity() {
        let mut handler = handler(2.0);
        let mut draw = SequenceDraw::new([0.5, 0.0]);
        let reply = handler.send_event_time(Some(in_state()), &mut draw).unwrap();
        assert!(reply.time.is_finite());
        let out = handler
            .send_out_state(OutStateArguments::Empty, &mut draw)
            .unwrap()
            .unwrap();
        assert!(!out[0].unit.is_active());
        assert!(out[1].unit.is_active());
        assert_eq!(handler.bounding_violations(), 0);
    }

    #[test]
    fn test_rejected_event_keeps_active_unit() {
        let mut handler = handler(2.0);
        // Acceptance probability is one half.
        let mut draw = SequenceDraw::new([0.5, 0.75]);
        handler.send_event_time(Some(in_state()), &mut draw).unwrap();
        let out = handler
            .send_out_state(OutStateArguments::Empty, &mut draw)
            .unwrap()
            .unwrap();
        assert!(out[0].unit.is_active());
        assert!(!out[1].unit.is_active());
    }

    #[test]
    fn test_violated_bound_is_counted() {
        let mut handler = handler(0.5);
        let mut draw = SequenceDraw::new([0.5, 0.0]);
        handler.send_event_time(Some(in_state()), &mut draw).unwrap();
        handler
            .send_out_state(OutStateArguments::Empty, &mut draw)
            .unwrap();
        assert_eq!(handler.bounding_violations(), 1);
    }
}
