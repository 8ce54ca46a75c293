//! Events between two composite objects with a summed bounding potential
//!
//! The active leaf of one composite object interacts with every leaf of the
//! other composite object. Candidate events come from the first of the
//! bounding-potential events over all target leaves; a confirmed event
//! lifts the active label with a [`Lifting`] scheme over the leaves of both
//! composite objects.

use std::sync::Arc;

use ecmc_core::{Context, EcmcError, EcmcResult, Node, NodePath, StateId, Unit};
use ecmc_sampling::{expovariate, uniform, Lifting, LiftingPolicy, UniformDraw};

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

const NAME: &str = "TwoCompositeObjectSummedBoundingPotentialEventHandler";

#[derive(Clone, Debug)]
pub struct TwoCompositeObjectSummedBoundingPotentialEventHandler {
    context: Context,
    potential: Arc<dyn Potential>,
    bounding_potential: Arc<dyn InvertiblePotential>,
    charge: Option<String>,
    lifting: Lifting<StateId>,
    monitor: BoundingViolationMonitor,
    stored: StoredState,
    local_leaves: Vec<NodePath>,
    target_leaves: Vec<NodePath>,
    active: Option<ActiveLeaf>,
}

impl TwoCompositeObjectSummedBoundingPotentialEventHandler {
    pub fn new(
        context: Context,
        potential: Arc<dyn Potential>,
        bounding_potential: Arc<dyn InvertiblePotential>,
        lifting: LiftingPolicy,
        charge: Option<String>,
        bounding_violation_limit: Option<u64>,
    ) -> EcmcResult<Self> {
        potential.descriptor().validate(NAME, 1, charge.as_deref())?;
        bounding_potential
            .descriptor()
            .validate(NAME, 1, charge.as_deref())?;
        Ok(TwoCompositeObjectSummedBoundingPotentialEventHandler {
            context,
            potential,
            bounding_potential,
            charge,
            lifting: Lifting::new(lifting),
            monitor: BoundingViolationMonitor::new(bounding_violation_limit),
            stored: StoredState::default(),
            local_leaves: Vec::new(),
            target_leaves: Vec::new(),
            active: None,
        })
    }

    pub fn bounding_violations(&self) -> u64 {
        self.monitor.count()
    }

    fn pair(&self, branches: &[Node], from: &NodePath, to: &NodePath) -> EcmcResult<(Vec<f64>, Vec<f64>)> {
        let from_unit: &Unit = &node(branches, from)?.unit;
        let to_unit: &Unit = &node(branches, to)?.unit;
        let separation = self
            .context
            .separation_vector(&from_unit.position, &to_unit.position);
        let charges = self
            .potential
            .descriptor()
            .charges(self.charge.as_deref(), from_unit, to_unit)?;
        Ok((separation, charges))
    }

    /// Record the lifting rates of all leaves; the composite object with the
    /// smaller root identifier goes first.
    fn fill_lifting(
        &mut self,
        branches: &[Node],
        active: &ActiveLeaf,
        event_rate: f64,
        mut target_rates: Vec<f64>,
        rng: &mut dyn UniformDraw,
    ) -> EcmcResult<()> {
        let mut local_rates = Vec::with_capacity(self.local_leaves.len());
        for local in &self.local_leaves {
            if *local == active.path {
                local_rates.push(event_rate);
                continue;
            }
            let mut rate = 0.0;
            for (target, target_rate) in self.target_leaves.iter().zip(target_rates.iter_mut()) {
                let (separation, charges) = self.pair(branches, local, target)?;
                let derivative = self.potential.derivative(active.direction, &[&separation], &charges);
                rate += derivative;
                *target_rate -= derivative;
            }
            local_rates.push(rate);
        }

        let mut local = Vec::with_capacity(local_rates.len());
        for (path, rate) in self.local_leaves.iter().zip(local_rates) {
            local.push((rate, node(branches, path)?.unit.identifier.clone(), *path == active.path));
        }
        let mut target = Vec::with_capacity(target_rates.len());
        for (path, rate) in self.target_leaves.iter().zip(target_rates) {
            target.push((rate, node(branches, path)?.unit.identifier.clone(), false));
        }
        let local_first = match (local.first(), target.first()) {
            (Some(l), Some(t)) => l.1.root_id() < t.1.root_id(),
            _ => true,
        };
        let ordered = if local_first {
            local.into_iter().chain(target)
        } else {
            target.into_iter().chain(local)
        };

        self.lifting.reset();
        for (rate, identifier, is_active) in ordered {
            self.lifting.insert(rate, identifier, is_active, rng)?;
        }
        Ok(())
    }
}

impl HandlerContext for TwoCompositeObjectSummedBoundingPotentialEventHandler {
    fn context(&self) -> &Context {
        &self.context
    }
}

impl EventHandler for TwoCompositeObjectSummedBoundingPotentialEventHandler {
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
        if branches.len() != 2 {
            return Err(EcmcError::precondition(format!(
                "{} needs exactly two composite objects, got {}",
                NAME,
                branches.len()
            )));
        }
        let leaves = self.extract_leaves(&branches);
        let active = self.single_active_leaf(&branches, &leaves)?;
        let (local, target): (Vec<NodePath>, Vec<NodePath>) = leaves
            .into_iter()
            .partition(|path| path.branch == active.path.branch);
        if target.is_empty() {
            return Err(EcmcError::precondition(format!("{} has no target leaves", NAME)));
        }

        let mut displacement = f64::INFINITY;
        for target_path in &target {
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
            displacement = displacement.min(image_displacement(
                self.bounding_potential.as_ref(),
                &self.context,
                active.direction,
                separation,
                &charges,
                potential_change,
            ));
        }

        let event_time = active.time_stamp + displacement / active.speed;
        if event_time.is_finite() {
            self.time_slice_all(&mut branches, event_time);
        }
        self.local_leaves = local;
        self.target_leaves = target;
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

        let mut bounding_rate = 0.0;
        let mut factor = 0.0;
        let mut target_rates = Vec::with_capacity(self.target_leaves.len());
        for target in &self.target_leaves {
            let (separation, charges) = self.pair(&branches, &active.path, target)?;
            let bounding_charges = {
                let active_unit = &node(&branches, &active.path)?.unit;
                let target_unit = &node(&branches, target)?.unit;
                self.bounding_potential
                    .descriptor()
                    .charges(self.charge.as_deref(), active_unit, target_unit)?
            };
            bounding_rate += self
                .bounding_potential
                .derivative(active.direction, &[&separation], &bounding_charges)
                .max(0.0);
            let pairwise = self.potential.derivative(active.direction, &[&separation], &charges);
            factor += pairwise;
            target_rates.push(-pairwise);
        }
        let event_rate = factor.max(0.0);
        self.monitor.check(NAME, bounding_rate, event_rate)?;
        if event_rate <= uniform(rng, 0.0, bounding_rate) {
            return Ok(Some(branches));
        }

        self.fill_lifting(&branches, &active, event_rate, target_rates, rng)?;
        let next = self.lifting.get_active_identifier(rng)?;
        let mut next_path = None;
        for path in self.local_leaves.iter().chain(&self.target_leaves) {
            if node(&branches, path)?.unit.identifier == next {
                next_path = Some(path.clone());
                break;
            }
        }
        let next_path = next_path.ok_or_else(|| {
            EcmcError::LiftingScheme(format!("lifted identifier {} is not part of the event", next))
        })?;
        tracing::trace!(from = %active.identifier, to = %next, "Lifted active label");
        self.exchange_velocity(&mut branches, &active.path, &next_path)?;
        Ok(Some(branches))
    }
}
