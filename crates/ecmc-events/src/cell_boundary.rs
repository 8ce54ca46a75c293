//! Cell boundary events
//!
//! Cell-based handlers compute their candidate events for the cell the
//! active unit occupies when the event time is requested. This handler fires
//! when the active unit on the cell level leaves that cell, so every
//! cell-based handler is recomputed for the new cell.

use std::sync::Arc;

use ecmc_core::{Context, CuboidPeriodicCells, EcmcError, EcmcResult, Node, NodePath};
use ecmc_sampling::UniformDraw;

use crate::capabilities::{node, node_mut, HandlerContext, StoredState, TimeSlicing};
use crate::handler::{
    EventHandler, EventTimeReply, HandlerDescriptor, HandlerRole, MediatingAction, OutStateArguments,
    OutStatePayload,
};

const NAME: &str = "CellBoundaryEventHandler";

#[derive(Clone, Debug)]
pub struct CellBoundaryEventHandler {
    context: Context,
    cells: Arc<CuboidPeriodicCells>,
    cell_level: usize,
    stored: StoredState,
    relevant: Option<NodePath>,
    direction: usize,
    boundary: f64,
}

impl CellBoundaryEventHandler {
    pub fn new(context: Context, cells: Arc<CuboidPeriodicCells>, cell_level: usize) -> EcmcResult<Self> {
        if cell_level == 0 {
            return Err(EcmcError::configuration("the cell level starts at 1 for root units"));
        }
        Ok(CellBoundaryEventHandler {
            context,
            cells,
            cell_level,
            stored: StoredState::default(),
            relevant: None,
            direction: 0,
            boundary: 0.0,
        })
    }

    /// Path of the unit on the cell level, the branch must not fork above it.
    fn relevant_path(&self, branches: &[Node]) -> EcmcResult<NodePath> {
        let mut path = NodePath {
            branch: 0,
            children: Vec::new(),
        };
        let mut current = node(branches, &path)?;
        while current.unit.identifier.len() < self.cell_level {
            if current.children.len() != 1 {
                return Err(EcmcError::precondition(format!(
                    "{} needs a single path down to the cell level, unit {} has {} children",
                    NAME,
                    current.unit.identifier,
                    current.children.len()
                )));
            }
            path.children.push(0);
            current = &current.children[0];
        }
        Ok(path)
    }
}

impl HandlerContext for CellBoundaryEventHandler {
    fn context(&self) -> &Context {
        &self.context
    }
}

impl EventHandler for CellBoundaryEventHandler {
    fn descriptor(&self) -> HandlerDescriptor {
        HandlerDescriptor {
            name: NAME,
            role: HandlerRole::CellBoundary,
            mediating_action: MediatingAction::None,
        }
    }

    fn send_event_time(
        &mut self,
        in_state: Option<Vec<Node>>,
        _rng: &mut dyn UniformDraw,
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
        let path = self.relevant_path(&branches)?;
        let unit = &node(&branches, &path)?.unit;
        let (Some(velocity), Some(time_stamp)) = (&unit.velocity, unit.time_stamp) else {
            return Err(EcmcError::precondition(format!(
                "unit {} on the cell level is not active",
                unit.identifier
            )));
        };
        let mut moving = velocity.iter().enumerate().filter(|(_, v)| **v != 0.0);
        let (direction, speed) = match (moving.next(), moving.next()) {
            (Some((direction, &speed)), None) if speed > 0.0 => (direction, speed),
            _ => {
                return Err(EcmcError::precondition(format!(
                    "{} needs a velocity along the positive direction of one axis, got {:?}",
                    NAME, velocity
                )))
            }
        };

        let cell = self.cells.position_to_cell(&unit.position);
        let boundary = self.cells.cell_min(self.cells.successor(cell, direction))[direction];
        let mut separation = boundary - unit.position[direction];
        if separation < 0.0 {
            separation += self.context.system_length(direction);
        }
        self.boundary = boundary;
        self.direction = direction;

        let event_time = time_stamp + separation / speed;
        self.relevant = Some(path);
        self.stored.store(branches);
        self.stored.set_event_time(event_time);
        Ok(EventTimeReply::new(event_time, OutStatePayload::Empty))
    }

    fn send_out_state(
        &mut self,
        arguments: OutStateArguments,
        _rng: &mut dyn UniformDraw,
    ) -> EcmcResult<Option<Vec<Node>>> {
        let event_time = self.stored.take_event_time(NAME)?;
        if arguments != OutStateArguments::Empty {
            return Err(arguments.unexpected(NAME));
        }
        let path = self
            .relevant
            .take()
            .ok_or_else(|| EcmcError::mediator(format!("{} has no stored relevant unit", NAME)))?;
        let mut branches = self.stored.take_branches();
        self.time_slice_all(&mut branches, event_time);
        node_mut(&mut branches, &path)?.unit.position[self.direction] = self.boundary;
        Ok(Some(branches))
    }
}
