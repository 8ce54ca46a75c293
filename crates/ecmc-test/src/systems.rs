//! Reusable systems for end-to-end runs
//!
//! Every builder returns a [`System`]: the initial global state together
//! with the tagger graph that drives it. The graphs share the run frame of
//! start-of-run, end-of-chain, sampling and end-of-run handlers and differ
//! in the interaction handlers.

use std::sync::Arc;

use ecmc_core::{Context, CuboidPeriodicCells, EcmcResult, Node, StateId, Unit};
use ecmc_events::{
    handler_factory, CellBoundaryEventHandler, CellVetoTables, Estimator, FinalTimeEndOfRunEventHandler,
    FixedIntervalSamplingEventHandler, HardSpherePotential, InitialChainStartOfRunEventHandler,
    InnerPointEstimator, InversePowerPotential, LeafUnitCellVetoEventHandler, Potential,
    SameActivePeriodicDirectionEndOfChainEventHandler, TwoCompositeObjectSummedBoundingPotentialEventHandler,
    TwoLeafUnitBoundingPotentialEventHandler, TwoLeafUnitEventHandler,
};
use ecmc_runtime::{
    build_mediator, Mediator, MemoryOutputSink, RunConfig, SingleActiveCellOccupancy, TagActivator, TaggerConfig,
    TaggerKind,
};
use ecmc_sampling::LiftingPolicy;
use ecmc_state::TreeStateHandler;

/// Name of the output the sampling handler writes to.
pub const POSITIONS: &str = "positions";
/// Name of the output the end-of-run handler writes to.
pub const FINAL_STATE: &str = "final_state";

const CHARGE: &str = "charge";

// ============================================================================
// RUN FRAME
// ============================================================================

/// Times shared by every system.
#[derive(Clone, Debug)]
pub struct RunParameters {
    /// Time of the end-of-run event
    pub final_time: f64,
    /// Duration of one event chain
    pub chain_length: f64,
    /// Time between two samples
    pub sampling_interval: f64,
    /// Speed of the active unit
    pub speed: f64,
}

impl Default for RunParameters {
    fn default() -> Self {
        Self {
            final_time: 5.5,
            chain_length: 0.7,
            sampling_interval: 1.0,
            speed: 1.0,
        }
    }
}

/// Initial global state, taggers and internal states of a run.
pub struct System {
    pub context: Context,
    pub global_state: Vec<Node>,
    pub taggers: Vec<TaggerConfig>,
    pub internal_states: Vec<(String, SingleActiveCellOccupancy)>,
}

/// Mediator of a system together with the sink it writes to.
pub struct SystemRun {
    pub mediator: Box<dyn Mediator>,
    pub sink: MemoryOutputSink,
}

impl System {
    /// Build the mediator selected by `config`.
    pub fn build(self, config: &RunConfig) -> EcmcResult<SystemRun> {
        let sink = MemoryOutputSink::new(&[POSITIONS, FINAL_STATE]);
        let state = TreeStateHandler::new(self.global_state)?;
        let activator = TagActivator::new(self.taggers, self.internal_states)?;
        let mediator = build_mediator(config, Box::new(state), activator, Box::new(sink.clone()))?;
        Ok(SystemRun { mediator, sink })
    }

    pub fn number_of_roots(&self) -> usize {
        self.global_state.len()
    }
}

/// Start-of-run, end-of-chain, sampling and end-of-run taggers.
///
/// `interactions` are the tags created at the start of the run and of every
/// chain; the end of a chain trashes them.
fn run_frame(context: &Context, parameters: &RunParameters, interactions: &[&str]) -> EcmcResult<Vec<TaggerConfig>> {
    let mut initial_velocity = vec![0.0; context.dimension()];
    initial_velocity[0] = parameters.speed;

    let mut start_creates = interactions.to_vec();
    start_creates.extend(["end_of_chain", "sampling", "end_of_run"]);
    let mut chain_creates = interactions.to_vec();
    chain_creates.push("end_of_chain");

    Ok(vec![
        TaggerConfig::new(
            "start_of_run",
            TaggerKind::NoInState,
            handler_factory(InitialChainStartOfRunEventHandler::new(
                context.clone(),
                initial_velocity,
                active_identifier(context),
            )?),
        )
        .creates(&start_creates),
        TaggerConfig::new(
            "end_of_chain",
            TaggerKind::NoInState,
            handler_factory(SameActivePeriodicDirectionEndOfChainEventHandler::new(
                context.clone(),
                parameters.chain_length,
            )?),
        )
        .creates(&chain_creates)
        .trashes(interactions),
        TaggerConfig::new(
            "sampling",
            TaggerKind::NoInState,
            handler_factory(FixedIntervalSamplingEventHandler::new(
                context.clone(),
                parameters.sampling_interval,
                POSITIONS,
            )?),
        )
        .creates(&["sampling"]),
        TaggerConfig::new(
            "end_of_run",
            TaggerKind::NoInState,
            handler_factory(FinalTimeEndOfRunEventHandler::new(
                context.clone(),
                parameters.final_time,
                Some(FINAL_STATE.to_string()),
            )?),
        ),
    ])
}

fn active_identifier(context: &Context) -> StateId {
    if context.number_of_node_levels() > 1 {
        StateId::child(0, 0)
    } else {
        StateId::root(0)
    }
}

/// Point masses on a square grid, shifted off the cell boundaries.
fn grid_points(per_side: usize, charge: Option<f64>) -> Vec<Node> {
    let spacing = 1.0 / per_side as f64;
    (0..per_side * per_side)
        .map(|index| {
            let x = (index % per_side) as f64 * spacing + 0.3 * spacing;
            let y = (index / per_side) as f64 * spacing + 0.45 * spacing;
            let mut unit = Unit::new(StateId::root(index), vec![x, y]);
            if let Some(value) = charge {
                unit = unit.with_charge(CHARGE, value);
            }
            Node::new(unit, 1.0)
        })
        .collect()
}

fn inverse_power(prefactor: f64) -> EcmcResult<Arc<InversePowerPotential>> {
    Ok(Arc::new(InversePowerPotential::new(1.0, prefactor)?))
}

// ============================================================================
// SYSTEMS
// ============================================================================

/// Two hard disks in a periodic unit square.
pub fn two_hard_disks(parameters: &RunParameters) -> EcmcResult<System> {
    let context = Context::hypercubic(2, 1.0, 1.0)?;
    let global_state = vec![
        Node::new(Unit::new(StateId::root(0), vec![0.2, 0.3]), 1.0),
        Node::new(Unit::new(StateId::root(1), vec![0.35, 0.6]), 1.0),
    ];
    hard_disks(context, global_state, 0.1, parameters)
}

/// Hard disks of the given radius on a square grid.
pub fn hard_disk_grid(per_side: usize, radius: f64, parameters: &RunParameters) -> EcmcResult<System> {
    let context = Context::hypercubic(2, 1.0, 1.0)?;
    hard_disks(context, grid_points(per_side, None), radius, parameters)
}

fn hard_disks(context: Context, global_state: Vec<Node>, radius: f64, parameters: &RunParameters) -> EcmcResult<System> {
    let potential = Arc::new(HardSpherePotential::new(radius)?);
    let pairs = global_state.len().saturating_sub(1).max(1);
    let mut taggers = run_frame(&context, parameters, &["hard_disk"])?;
    taggers.push(
        TaggerConfig::new(
            "hard_disk",
            TaggerKind::PairFactorInState { whole_composites: false },
            handler_factory(TwoLeafUnitEventHandler::new(context.clone(), potential, None)?),
        )
        .with_event_handlers(pairs)
        .creates(&["hard_disk"])
        .trashes(&["hard_disk"]),
    );
    Ok(System {
        context,
        global_state,
        taggers,
        internal_states: Vec::new(),
    })
}

/// Charged point masses with a repulsive inverse-power interaction, sampled
/// from a bounding potential of twice the strength.
pub fn inverse_power_grid(
    per_side: usize,
    parameters: &RunParameters,
    bounding_violation_limit: Option<u64>,
) -> EcmcResult<System> {
    let context = Context::hypercubic(2, 1.0, 1.0)?;
    let global_state = grid_points(per_side, Some(1.0));
    let handler = TwoLeafUnitBoundingPotentialEventHandler::new(
        context.clone(),
        inverse_power(0.05)?,
        inverse_power(0.1)?,
        Some(CHARGE.to_string()),
        bounding_violation_limit,
    )?;
    let mut taggers = run_frame(&context, parameters, &["coulomb"])?;
    taggers.push(
        TaggerConfig::new(
            "coulomb",
            TaggerKind::PairFactorInState { whole_composites: false },
            handler_factory(handler),
        )
        .with_event_handlers(global_state.len() - 1)
        .creates(&["coulomb"])
        .trashes(&["coulomb"]),
    );
    Ok(System {
        context,
        global_state,
        taggers,
        internal_states: Vec::new(),
    })
}

/// Dimers of two charged leaf units, interacting between composite objects
/// through the summed bounding potential.
pub fn dimers(number: usize, parameters: &RunParameters, bounding_violation_limit: Option<u64>) -> EcmcResult<System> {
    let context = Context::with_composites(vec![1.0, 1.0], 1.0, 2, 2)?;
    let spacing = 1.0 / number as f64;
    let global_state: Vec<Node> = (0..number)
        .map(|index| {
            let x = (index as f64 + 0.5) * spacing;
            let y = 0.2 + 0.6 * (index % 2) as f64;
            let children = vec![
                Unit::new(StateId::child(index, 0), vec![x - 0.05, y]).with_charge(CHARGE, 1.0),
                Unit::new(StateId::child(index, 1), vec![x + 0.05, y]).with_charge(CHARGE, -1.0),
            ];
            Node::composite(Unit::new(StateId::root(index), vec![x, y]), children)
        })
        .collect();

    let handler = TwoCompositeObjectSummedBoundingPotentialEventHandler::new(
        context.clone(),
        inverse_power(0.02)?,
        Arc::new(InversePowerPotential::new(1.0, 0.04)?),
        LiftingPolicy::InsideFirst,
        Some(CHARGE.to_string()),
        bounding_violation_limit,
    )?;
    let mut taggers = run_frame(&context, parameters, &["dimer"])?;
    taggers.push(
        TaggerConfig::new(
            "dimer",
            TaggerKind::PairFactorInState { whole_composites: true },
            handler_factory(handler),
        )
        .with_event_handlers(number - 1)
        .creates(&["dimer"])
        .trashes(&["dimer"]),
    );
    Ok(System {
        context,
        global_state,
        taggers,
        internal_states: Vec::new(),
    })
}

/// Charged point masses handled by the cell-veto algorithm.
///
/// Units in nearby cells and surplus units interact through pair handlers,
/// all other cells through a single cell-veto handler. `cells_per_side`
/// should be a power of two so cell boundaries are exact.
pub fn cell_veto_grid(
    per_side: usize,
    cells_per_side: usize,
    parameters: &RunParameters,
    bounding_violation_limit: Option<u64>,
) -> EcmcResult<System> {
    const OCCUPANCY: &str = "cell_occupancy";
    const INTERACTIONS: [&str; 4] = ["cell_boundary", "cell_veto", "nearby", "surplus"];

    let context = Context::hypercubic(2, 1.0, 1.0)?;
    let global_state = grid_points(per_side, Some(1.0));
    let cells = Arc::new(CuboidPeriodicCells::new(&context, &[cells_per_side], 1)?);
    let occupancy = SingleActiveCellOccupancy::new(&context, cells.clone(), 1, Some(CHARGE.to_string()))?;

    let potential: Arc<dyn Potential> = inverse_power(0.05)?;
    let estimator: Arc<dyn Estimator> = Arc::new(InnerPointEstimator::new(potential.clone(), context.clone())?);
    let tables = Arc::new(CellVetoTables::new(cells.clone(), 1, estimator.as_ref(), 1.0)?);
    let pair = TwoLeafUnitBoundingPotentialEventHandler::new(
        context.clone(),
        potential.clone(),
        inverse_power(0.1)?,
        Some(CHARGE.to_string()),
        bounding_violation_limit,
    )?;
    let pair = handler_factory(pair);
    let nearby_cells = cells.nearby_cells(cells.zero_cell()).len();

    let mut taggers = run_frame(&context, parameters, &INTERACTIONS)?;
    taggers.extend([
        TaggerConfig::new(
            "cell_boundary",
            TaggerKind::CellBoundary {
                internal_state: OCCUPANCY.to_string(),
            },
            handler_factory(CellBoundaryEventHandler::new(context.clone(), cells, 1)?),
        ),
        TaggerConfig::new(
            "cell_veto",
            TaggerKind::CellVeto {
                internal_state: OCCUPANCY.to_string(),
            },
            handler_factory(LeafUnitCellVetoEventHandler::new(
                context.clone(),
                tables,
                estimator,
                Some(potential),
                Some(CHARGE.to_string()),
                bounding_violation_limit,
            )?),
        ),
        TaggerConfig::new(
            "nearby",
            TaggerKind::NearbyCells {
                internal_state: OCCUPANCY.to_string(),
            },
            pair.clone(),
        )
        .with_event_handlers(nearby_cells),
        TaggerConfig::new(
            "surplus",
            TaggerKind::SurplusCells {
                internal_state: OCCUPANCY.to_string(),
            },
            pair,
        )
        .with_event_handlers(global_state.len()),
    ]);
    for tagger in taggers.iter_mut().filter(|tagger| INTERACTIONS.contains(&tagger.tag.as_str())) {
        tagger.create = INTERACTIONS.iter().map(|tag| tag.to_string()).collect();
        tagger.trash = tagger.create.clone();
    }

    Ok(System {
        context,
        global_state,
        taggers,
        internal_states: vec![(OCCUPANCY.to_string(), occupancy)],
    })
}
