//! Pair events between two leaf units with an invertible potential

use std::sync::Arc;

use ecmc_core::{Context, EcmcError, EcmcResult, Node, NodePath, Time};
use ecmc_sampling::{expovariate, UniformDraw};

use crate::capabilities::{
    node, HandlerContext, LeafExtraction, SingleActiveLeaf, StoredState, TimeSlicing, VelocityExchange,
};
use crate::handler::{
    EventHandler, EventTimeReply, HandlerDescriptor, HandlerRole, MediatingAction, OutStateArguments,
    OutStatePayload,
};
use crate::potential::InvertiblePotential;

const NAME: &str = "TwoLeafUnitEventHandler";

/// Displacement until the potential change is reached, following the target
/// into its next periodic image at most once.
///
/// The nearest-image separation only covers half the box along the
/// direction of motion. When the displacement reaches beyond that, the
/// separation jumps to the other side of the box and the search continues
/// there.
pub(crate) fn image_displacement(
    potential: &dyn InvertiblePotential,
    context: &Context,
    direction: usize,
    mut separation: Vec<f64>,
    charges: &[f64],
    potential_change: f64,
) -> f64 {
    let half_length = context.system_length(direction) / 2.0;
    let mut total = 0.0;
    let mut flipped = false;
    loop {
        let to_flip = separation[direction] + half_length;
        let displacement = potential.displacement(direction, &[&separation], charges, potential_change);
        if displacement <= to_flip {
            return total + displacement;
        }
        if flipped {
            return f64::INFINITY;
        }
        total += to_flip;
        separation[direction] = half_length;
        flipped = true;
    }
}

/// Leaf unit pair interacting through an invertible potential.
///
/// The out-state moves the velocity from the active leaf to the target leaf.
#[derive(Clone, Debug)]
pub struct TwoLeafUnitEventHandler {
    context: Context,
    potential: Arc<dyn InvertiblePotential>,
    charge: Option<String>,
    stored: StoredState,
    leaves: Vec<NodePath>,
    active: usize,
}

impl TwoLeafUnitEventHandler {
    pub fn new(context: Context, potential: Arc<dyn InvertiblePotential>, charge: Option<String>) -> EcmcResult<Self> {
        potential.descriptor().validate(NAME, 1, charge.as_deref())?;
        Ok(TwoLeafUnitEventHandler {
            context,
            potential,
            charge,
            stored: StoredState::default(),
            leaves: Vec::new(),
            active: 0,
        })
    }
}

impl HandlerContext for TwoLeafUnitEventHandler {
    fn context(&self) -> &Context {
        &self.context
    }
}

impl EventHandler for TwoLeafUnitEventHandler {
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
        self.active = if leaves[0] == active.path { 0 } else { 1 };
        let target_path = &leaves[1 - self.active];

        let active_unit = &node(&branches, &active.path)?.unit;
        let target_unit = &node(&branches, target_path)?.unit;
        let separation = self
            .context
            .separation_vector(&active_unit.position, &target_unit.position);
        let charges = self
            .potential
            .descriptor()
            .charges(self.charge.as_deref(), active_unit, target_unit)?;
        let potential_change = expovariate(rng, self.context.beta());
        let displacement = image_displacement(
            self.potential.as_ref(),
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
        tracing::trace!(active = %active.identifier, %event_time, "Two leaf unit event time");
        self.leaves = leaves;
        self.stored.store(branches);
        self.stored.set_event_time(event_time);
        Ok(EventTimeReply::new(event_time, OutStatePayload::Empty))
    }

    fn send_out_state(
        &mut self,
        arguments: OutStateArguments,
        _rng: &mut dyn UniformDraw,
    ) -> EcmcResult<Option<Vec<Node>>> {
        self.stored.take_event_time(NAME)?;
        if arguments != OutStateArguments::Empty {
            return Err(arguments.unexpected(NAME));
        }
        let mut branches = self.stored.take_branches();
        let active = self.leaves[self.active].clone();
        let target = self.leaves[1 - self.active].clone();
        self.exchange_velocity(&mut branches, &active, &target)?;
        Ok(Some(branches))
    }
}
