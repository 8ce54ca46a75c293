//! Cell-veto events
//!
//! Long-range interactions between the active leaf unit and the units in
//! cells that are not nearby the active cell are sampled in O(1). For every
//! cell relative to the zero cell, the derivative of the potential along
//! each axis direction is bounded once at construction. The sum of the
//! bounds gives a total event rate; the Walker alias tables pick the cell
//! of a candidate event, which is then confirmed against the occupant of the
//! target cell, if there is one.
//!
//! An empty target cell or a rejected confirmation leaves the event
//! unconfirmed. The handler keeps its in-state, time-sliced to the
//! unconfirmed event time, and samples the next candidate from there.

use std::collections::BTreeMap;
use std::sync::Arc;

use ecmc_core::{Cell, Context, CuboidPeriodicCells, EcmcError, EcmcResult, Node, NodePath, Time};
use ecmc_sampling::{expovariate, UniformDraw, Walker, WalkerItem};

use crate::bounding::BoundingViolationMonitor;
use crate::capabilities::{
    node, ActiveLeaf, HandlerContext, LeafExtraction, SingleActiveLeaf, StoredState, TimeSlicing,
    VelocityExchange,
};
use crate::estimator::Estimator;
use crate::handler::{
    EventHandler, EventTimeReply, HandlerDescriptor, HandlerRole, MediatingAction, OutStateArguments,
    OutStatePayload,
};
use crate::potential::{unit_charge, Potential};

const NAME: &str = "LeafUnitCellVetoEventHandler";

/// Precomputed derivative bounds and alias tables of the cell-veto
/// algorithm, shared by every handler instance.
#[derive(Debug)]
pub struct CellVetoTables {
    cells: Arc<CuboidPeriodicCells>,
    cell_level: usize,
    /// Per direction, over relative cells
    upper_walkers: Vec<Walker<Cell>>,
    lower_walkers: Vec<Walker<Cell>>,
    /// Per relative cell and direction: (upper bound, negated lower bound)
    bounds: BTreeMap<Cell, Vec<(f64, f64)>>,
}

impl CellVetoTables {
    /// Estimate the bounds for every cell that is not nearby the zero cell.
    ///
    /// `cell_level` is the tree level of the units the cells are occupied by.
    /// Every bound is multiplied by `bound_correction_factor`.
    pub fn new(
        cells: Arc<CuboidPeriodicCells>,
        cell_level: usize,
        estimator: &dyn Estimator,
        bound_correction_factor: f64,
    ) -> EcmcResult<Self> {
        if cell_level == 0 {
            return Err(EcmcError::configuration("the cell level starts at 1 for root units"));
        }
        if !(bound_correction_factor > 0.0) {
            return Err(EcmcError::configuration(format!(
                "the bound correction factor must be > 0.0, got {}",
                bound_correction_factor
            )));
        }
        let zero = cells.zero_cell();
        let nearby = cells.nearby_cells(zero);
        let zero_min = cells.cell_min(zero);
        let zero_max = cells.cell_max(zero);
        let dimension = cells.dimension();

        let mut bounds = BTreeMap::new();
        for cell in cells.yield_cells().filter(|cell| !nearby.contains(cell)) {
            let lower_corner: Vec<f64> = cells
                .cell_min(cell)
                .iter()
                .zip(&zero_max)
                .map(|(min, zero)| min - zero)
                .collect();
            let upper_corner: Vec<f64> = cells
                .cell_max(cell)
                .iter()
                .zip(&zero_min)
                .map(|(max, zero)| max - zero)
                .collect();
            let per_direction = (0..dimension)
                .map(|direction| {
                    let (upper, lower) = estimator.derivative_bound(&lower_corner, &upper_corner, direction);
                    (upper * bound_correction_factor, -lower * bound_correction_factor)
                })
                .collect::<Vec<_>>();
            bounds.insert(cells.relative_cell(cell, zero), per_direction);
        }
        if bounds.is_empty() {
            return Err(EcmcError::configuration(
                "every cell is nearby the zero cell, the cell-veto tables would be empty",
            ));
        }

        let walkers = |select: fn(&(f64, f64)) -> f64| -> EcmcResult<Vec<Walker<Cell>>> {
            (0..dimension)
                .map(|direction| {
                    Walker::new(
                        bounds
                            .iter()
                            .map(|(cell, per_direction)| {
                                WalkerItem::new(*cell, select(&per_direction[direction]).max(0.0))
                            })
                            .collect(),
                    )
                })
                .collect()
        };
        let upper_walkers = walkers(|bound| bound.0)?;
        let lower_walkers = walkers(|bound| bound.1)?;

        tracing::info!(
            cells = cells.number_of_cells(),
            relative_cells = bounds.len(),
            cell_level,
            bound_correction_factor,
            total_rates = ?upper_walkers.iter().map(|w| w.total_rate()).collect::<Vec<_>>(),
            "Cell-veto tables precomputed"
        );
        Ok(CellVetoTables {
            cells,
            cell_level,
            upper_walkers,
            lower_walkers,
            bounds,
        })
    }

    pub fn cells(&self) -> &CuboidPeriodicCells {
        &self.cells
    }

    pub fn cell_level(&self) -> usize {
        self.cell_level
    }

    /// Upper bound and negated lower bound for a relative cell.
    pub fn bound(&self, relative_cell: Cell, direction: usize) -> Option<(f64, f64)> {
        self.bounds
            .get(&relative_cell)
            .and_then(|per_direction| per_direction.get(direction))
            .copied()
    }

    fn walker(&self, direction: usize, upper: bool) -> EcmcResult<&Walker<Cell>> {
        let walkers = if upper { &self.upper_walkers } else { &self.lower_walkers };
        walkers.get(direction).ok_or_else(|| {
            EcmcError::precondition(format!("no cell-veto table for direction {}", direction))
        })
    }
}

/// Sampling setup of the in-state of the last `send_event_time`.
#[derive(Clone, Debug)]
struct CellVetoDraw {
    active: ActiveLeaf,
    active_cell: Cell,
    upper: bool,
    charge_factor: f64,
    total_rate: f64,
}

/// Cell-veto event handler for a single active leaf unit.
#[derive(Clone, Debug)]
pub struct LeafUnitCellVetoEventHandler {
    context: Context,
    tables: Arc<CellVetoTables>,
    estimator: Arc<dyn Estimator>,
    potential: Arc<dyn Potential>,
    charge: Option<String>,
    monitor: BoundingViolationMonitor,
    stored: StoredState,
    draw: Option<CellVetoDraw>,
    bounding_rate: f64,
}

impl LeafUnitCellVetoEventHandler {
    /// Create the handler.
    ///
    /// Confirmation uses `potential`, or the potential of the estimator if
    /// none is given.
    pub fn new(
        context: Context,
        tables: Arc<CellVetoTables>,
        estimator: Arc<dyn Estimator>,
        potential: Option<Arc<dyn Potential>>,
        charge: Option<String>,
        bounding_violation_limit: Option<u64>,
    ) -> EcmcResult<Self> {
        let potential = potential.unwrap_or_else(|| estimator.potential());
        potential.descriptor().validate(NAME, 1, charge.as_deref())?;
        Ok(LeafUnitCellVetoEventHandler {
            context,
            tables,
            estimator,
            potential,
            charge,
            monitor: BoundingViolationMonitor::new(bounding_violation_limit),
            stored: StoredState::default(),
            draw: None,
            bounding_rate: 0.0,
        })
    }

    pub fn bounding_violations(&self) -> u64 {
        self.monitor.count()
    }

    fn active_cell(&self, branches: &[Node], active: &ActiveLeaf) -> EcmcResult<Cell> {
        let ancestry = active.path.ancestry();
        let path = ancestry.get(self.tables.cell_level - 1).ok_or_else(|| {
            EcmcError::precondition(format!(
                "active unit {} lies above the cell level {}",
                active.identifier, self.tables.cell_level
            ))
        })?;
        Ok(self
            .tables
            .cells
            .position_to_cell(&node(branches, path)?.unit.position))
    }

    /// Sample the target cell and the time of the next candidate event from
    /// the stored in-state, which is time-sliced to that event.
    fn sample_event(&mut self, rng: &mut dyn UniformDraw) -> EcmcResult<EventTimeReply> {
        let draw = self
            .draw
            .as_mut()
            .ok_or_else(|| EcmcError::mediator(format!("{} has no stored in-state", NAME)))?;
        if !(draw.total_rate > 0.0) {
            self.stored.set_event_time(Time::INF);
            return Ok(EventTimeReply::new(Time::INF, OutStatePayload::Empty));
        }

        let relative = self.tables.walker(draw.active.direction, draw.upper)?.sample(rng);
        let bound = self
            .tables
            .bound(relative, draw.active.direction)
            .map(|(upper_bound, lower_bound)| if draw.upper { upper_bound } else { lower_bound })
            .ok_or_else(|| EcmcError::precondition(format!("no bound for relative cell {}", relative)))?;
        self.bounding_rate = bound * draw.charge_factor * draw.active.speed;
        if !(self.bounding_rate > 0.0) {
            return Err(EcmcError::precondition(format!(
                "sampled relative cell {} with bounding rate {}",
                relative, self.bounding_rate
            )));
        }
        let target_cell = self.tables.cells.translate(draw.active_cell, relative);
        let event_time = draw.active.time_stamp + expovariate(rng, self.context.beta()) / draw.total_rate;
        draw.active.time_stamp = event_time;
        let active_cell = draw.active_cell;
        let mut branches = self.stored.take_branches();
        self.time_slice_all(&mut branches, event_time);
        tracing::trace!(active_cell, target_cell, %event_time, "Cell-veto event time");

        self.stored.branches = branches;
        self.stored.set_event_time(event_time);
        Ok(EventTimeReply::new(event_time, OutStatePayload::TargetCell(target_cell)))
    }
}

impl HandlerContext for LeafUnitCellVetoEventHandler {
    fn context(&self) -> &Context {
        &self.context
    }
}

impl EventHandler for LeafUnitCellVetoEventHandler {
    fn descriptor(&self) -> HandlerDescriptor {
        HandlerDescriptor {
            name: NAME,
            role: HandlerRole::CellVeto,
            mediating_action: MediatingAction::None,
        }
    }

    fn send_event_time(
        &mut self,
        in_state: Option<Vec<Node>>,
        rng: &mut dyn UniformDraw,
    ) -> EcmcResult<EventTimeReply> {
        let branches =
            in_state.ok_or_else(|| EcmcError::precondition(format!("{} needs an in-state", NAME)))?;
        if branches.len() != 1 {
            return Err(EcmcError::precondition(format!(
                "{} needs exactly one branch, got {}",
                NAME,
                branches.len()
            )));
        }
        let leaves = self.extract_leaves(&branches);
        let active = self.single_active_leaf(&branches, &leaves)?;
        let active_cell = self.active_cell(&branches, &active)?;

        let charge = match &self.charge {
            Some(name) => unit_charge(&node(&branches, &active.path)?.unit, name)?,
            None => 1.0,
        };
        let mut charge_factor = self.estimator.charge_correction_factor(charge);
        let upper = charge_factor > 0.0;
        if !upper {
            charge_factor = -charge_factor;
        }
        let total_rate = self.tables.walker(active.direction, upper)?.total_rate() * charge_factor * active.speed;
        self.stored.store(branches);
        self.draw = Some(CellVetoDraw {
            active,
            active_cell,
            upper,
            charge_factor,
            total_rate,
        });
        self.sample_event(rng)
    }

    fn resend_event_time(&mut self, rng: &mut dyn UniformDraw) -> EcmcResult<EventTimeReply> {
        if self.draw.is_none() {
            return Err(EcmcError::mediator(format!(
                "{} was asked to resend an event time without a stored in-state",
                NAME
            )));
        }
        self.sample_event(rng)
    }

    fn send_out_state(
        &mut self,
        arguments: OutStateArguments,
        rng: &mut dyn UniformDraw,
    ) -> EcmcResult<Option<Vec<Node>>> {
        self.stored.take_event_time(NAME)?;
        let occupant = match arguments {
            OutStateArguments::TargetOccupant(occupant) => occupant,
            other => return Err(other.unexpected(NAME)),
        };
        let active = self
            .draw
            .as_ref()
            .map(|draw| draw.active.clone())
            .ok_or_else(|| EcmcError::mediator(format!("{} has no stored active leaf", NAME)))?;
        let mut branches = self.stored.take_branches();
        let Some(target_branch) = occupant else {
            self.stored.branches = branches;
            return Ok(None);
        };
        branches.push(target_branch);
        let target_leaves: Vec<NodePath> = self
            .extract_leaves(&branches)
            .into_iter()
            .filter(|path| path.branch == 1)
            .collect();
        if target_leaves.len() != 1 {
            return Err(EcmcError::precondition(format!(
                "{} confirms against a single target leaf, got {}",
                NAME,
                target_leaves.len()
            )));
        }
        let target_path = &target_leaves[0];

        let real_rate = {
            let active_unit = &node(&branches, &active.path)?.unit;
            let target_unit = &node(&branches, target_path)?.unit;
            let separation = self
                .context
                .separation_vector(&active_unit.position, &target_unit.position);
            let charges = self
                .potential
                .descriptor()
                .charges(self.charge.as_deref(), active_unit, target_unit)?;
            self.potential.derivative(active.direction, &[&separation], &charges) * active.speed
        };
        if self.monitor.confirm(NAME, self.bounding_rate, real_rate, rng)? {
            self.exchange_velocity(&mut branches, &active.path, target_path)?;
            self.draw = None;
            return Ok(Some(branches));
        }
        branches.truncate(1);
        self.stored.branches = branches;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::InnerPointEstimator;
    use crate::potential::InversePowerPotential;
    use ecmc_core::{StateId, Unit};
    use ecmc_sampling::SequenceDraw;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn context() -> Context {
        Context::hypercubic(2, 1.0, 1.0).unwrap()
    }

    fn estimator() -> Arc<InnerPointEstimator> {
        let potential = Arc::new(InversePowerPotential::new(1.0, 1.0).unwrap());
        Arc::new(InnerPointEstimator::new(potential, context()).unwrap())
    }

    fn tables() -> Arc<CellVetoTables> {
        let cells = Arc::new(CuboidPeriodicCells::new(&context(), &[4], 1).unwrap());
        Arc::new(CellVetoTables::new(cells, 1, estimator().as_ref(), 1.0).unwrap())
    }

    fn handler() -> LeafUnitCellVetoEventHandler {
        LeafUnitCellVetoEventHandler::new(context(), tables(), estimator(), None, None, None).unwrap()
    }

    fn active_branch() -> Node {
        Node::new(
            Unit::new(StateId::root(0), vec![0.1, 0.1]).with_velocity(vec![1.0, 0.0], Time::ZERO),
            1.0,
        )
    }

    #[test]
    fn test_tables_skip_nearby_cells() {
        let tables = tables();
        let cells = tables.cells();
        for cell in cells.yield_cells() {
            let nearby = cells.nearby_cells(cells.zero_cell()).contains(&cell);
            assert_eq!(tables.bound(cell, 0).is_none(), nearby);
        }
        assert!(tables.walker(0, true).unwrap().total_rate() > 0.0);
        assert!(tables.walker(1, false).unwrap().total_rate() > 0.0);
    }

    #[test]
    fn test_bounds_hold_at_cell_centers() {
        let tables = tables();
        let cells = tables.cells();
        let potential = InversePowerPotential::new(1.0, 1.0).unwrap();
        let zero_center = cells.cell_center(cells.zero_cell());
        for cell in cells.yield_cells() {
            let Some((upper, negated_lower)) = tables.bound(cell, 0) else {
                continue;
            };
            let separation = context().separation_vector(&zero_center, &cells.cell_center(cell));
            let derivative = potential.derivative(0, &[&separation], &[1.0, 1.0]);
            assert!(derivative <= upper);
            assert!(-derivative <= negated_lower);
        }
    }

    #[test]
    fn test_rejects_tables_without_distant_cells() {
        let cells = Arc::new(CuboidPeriodicCells::new(&context(), &[3], 1).unwrap());
        assert!(CellVetoTables::new(cells, 1, estimator().as_ref(), 1.0).is_err());
    }

    #[test]
    fn test_event_time_targets_distant_cell() {
        let tables = tables();
        let mut handler = handler();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..20 {
            let reply = handler.send_event_time(Some(vec![active_branch()]), &mut rng).unwrap();
            assert!(reply.time > Time::ZERO && reply.time.is_finite());
            let OutStatePayload::TargetCell(target) = reply.payload else {
                panic!("cell-veto events name a target cell");
            };
            let active_cell = tables.cells().position_to_cell(&[0.1, 0.1]);
            assert!(!tables.cells().nearby_cells(active_cell).contains(&target));
            assert_eq!(
                handler
                    .send_out_state(OutStateArguments::TargetOccupant(None), &mut rng)
                    .unwrap(),
                None
            );
        }
    }

    #[test]
    fn test_resend_continues_from_unconfirmed_event() {
        let tables = tables();
        let mut handler = handler();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut reply = handler.send_event_time(Some(vec![active_branch()]), &mut rng).unwrap();
        let active_cell = tables.cells().position_to_cell(&[0.1, 0.1]);
        for _ in 0..10 {
            assert_eq!(
                handler
                    .send_out_state(OutStateArguments::TargetOccupant(None), &mut rng)
                    .unwrap(),
                None
            );
            let resent = handler.resend_event_time(&mut rng).unwrap();
            assert!(resent.time > reply.time);
            let OutStatePayload::TargetCell(target) = resent.payload else {
                panic!("cell-veto events name a target cell");
            };
            assert!(!tables.cells().nearby_cells(active_cell).contains(&target));
            reply = resent;
        }

        // The in-state stays time-sliced to the last unconfirmed event.
        let active_x = (0.1 + (reply.time - Time::ZERO)).rem_euclid(1.0);
        let behind = (active_x - 0.4).rem_euclid(1.0);
        let occupant = Node::new(Unit::new(StateId::root(1), vec![behind, 0.1]), 1.0);
        let out = handler
            .send_out_state(OutStateArguments::TargetOccupant(Some(occupant)), &mut rng)
            .unwrap();
        assert_eq!(out, None);
        assert_eq!(handler.stored.branches.len(), 1);
        assert_eq!(handler.stored.branches[0].unit.time_stamp, Some(reply.time));
        assert!(handler.resend_event_time(&mut rng).unwrap().time > reply.time);
    }

    #[test]
    fn test_resend_needs_stored_in_state() {
        let mut handler = handler();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert!(matches!(
            handler.resend_event_time(&mut rng),
            Err(EcmcError::Mediator(_))
        ));
    }

    #[test]
    fn test_confirmation_against_occupant() {
        let tables = tables();
        let mut handler = handler();
        let potential = InversePowerPotential::new(1.0, 1.0).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        for _ in 0..20 {
            let reply = handler.send_event_time(Some(vec![active_branch()]), &mut rng).unwrap();
            let OutStatePayload::TargetCell(target) = reply.payload else {
                panic!("cell-veto events name a target cell");
            };
            let occupant_position = tables.cells().cell_center(target);
            let occupant = Node::new(Unit::new(StateId::root(1), occupant_position.clone()), 1.0);
            let active_position = [0.1 + (reply.time - Time::ZERO), 0.1];
            let separation = context().separation_vector(&active_position, &occupant_position);
            let real = potential.derivative(0, &[&separation], &[1.0, 1.0]);

            let mut draw = SequenceDraw::new([0.0]);
            let out = handler
                .send_out_state(OutStateArguments::TargetOccupant(Some(occupant)), &mut draw)
                .unwrap();
            match out {
                Some(out) => {
                    assert!(real > 0.0);
                    assert!(!out[0].unit.is_active());
                    assert_eq!(out[1].unit.velocity, Some(vec![1.0, 0.0]));
                    assert_eq!(out[1].unit.time_stamp, Some(reply.time));
                }
                None => assert!(real <= 0.0),
            }
        }
        assert_eq!(handler.bounding_violations(), 0);
    }

    #[test]
    fn test_wrong_arguments_are_rejected() {
        let mut handler = handler();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        handler.send_event_time(Some(vec![active_branch()]), &mut rng).unwrap();
        assert!(matches!(
            handler.send_out_state(OutStateArguments::Empty, &mut rng),
            Err(EcmcError::Mediator(_))
        ));
    }
}
