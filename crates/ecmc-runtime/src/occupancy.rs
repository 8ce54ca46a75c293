//! Cell occupancy with a single active unit
//!
//! Every cell stores at most one occupant identifier. Further units in an
//! already occupied cell are kept as surplus. The active unit is stored in
//! neither place; it is tracked separately together with the cell it
//! currently occupies.

use std::collections::BTreeMap;
use std::sync::Arc;

use ecmc_core::{Cell, Context, CuboidPeriodicCells, EcmcError, EcmcResult, Node, StateId};

/// Units on `level` below the root, `level == 1` being the root itself.
fn nodes_on_level(root: &Node, level: usize) -> Vec<&Node> {
    let mut nodes = vec![root];
    for _ in 1..level {
        nodes = nodes.into_iter().flat_map(|node| node.children.iter()).collect();
    }
    nodes
}

#[derive(Clone, Debug)]
pub struct SingleActiveCellOccupancy {
    cells: Arc<CuboidPeriodicCells>,
    cell_level: usize,
    charge: Option<String>,
    occupants: Vec<Option<StateId>>,
    surplus: BTreeMap<Cell, Vec<StateId>>,
    active_identifier: Option<StateId>,
    active_cell: Option<Cell>,
    initialized: bool,
}

impl SingleActiveCellOccupancy {
    /// Occupancy of the units with identifiers of length `cell_level`.
    ///
    /// With a `charge`, only units with a non-zero value of that charge are
    /// stored. Charges only exist on leaf units.
    pub fn new(
        context: &Context,
        cells: Arc<CuboidPeriodicCells>,
        cell_level: usize,
        charge: Option<String>,
    ) -> EcmcResult<Self> {
        if cell_level == 0 || cell_level > context.number_of_node_levels() {
            return Err(EcmcError::configuration(format!(
                "the cell level must be in 1..={}, got {}",
                context.number_of_node_levels(),
                cell_level
            )));
        }
        if charge.is_some() && cell_level < context.number_of_node_levels() {
            return Err(EcmcError::configuration(
                "the cell level stores composite objects which cannot carry a charge",
            ));
        }
        tracing::debug!(
            cells = cells.number_of_cells(),
            cell_level,
            ?charge,
            "Single active cell occupancy created"
        );
        Ok(SingleActiveCellOccupancy {
            occupants: vec![None; cells.number_of_cells()],
            cells,
            cell_level,
            charge,
            surplus: BTreeMap::new(),
            active_identifier: None,
            active_cell: None,
            initialized: false,
        })
    }

    pub fn cells(&self) -> &Arc<CuboidPeriodicCells> {
        &self.cells
    }

    pub fn cell_level(&self) -> usize {
        self.cell_level
    }

    fn is_relevant(&self, node: &Node) -> bool {
        match &self.charge {
            Some(name) => node.unit.charge_value(name).map_or(false, |value| value != 0.0),
            None => true,
        }
    }

    fn ensure_initialized(&self) -> EcmcResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(EcmcError::Uninitialized {
                component: "SingleActiveCellOccupancy".to_string(),
            })
        }
    }

    fn store(&mut self, cell: Cell, identifier: StateId) {
        if self.occupants[cell].is_none() {
            self.occupants[cell] = Some(identifier);
        } else {
            self.surplus.entry(cell).or_default().push(identifier);
        }
    }

    /// Fill the cells from the full global state.
    pub fn initialize(&mut self, global_state: &[Node]) -> EcmcResult<()> {
        for root in global_state {
            for node in nodes_on_level(root, self.cell_level) {
                if !self.is_relevant(node) {
                    continue;
                }
                let cell = self.cells.position_to_cell(&node.unit.position);
                let identifier = node.unit.identifier.clone();
                self.store(cell, identifier);
            }
        }
        self.initialized = true;
        tracing::debug!(
            occupied = self.occupants.iter().filter(|o| o.is_some()).count(),
            surplus = self.surplus.values().map(Vec::len).sum::<usize>(),
            "Cell occupancy initialized"
        );
        Ok(())
    }

    /// Follow the active unit of the active global state.
    ///
    /// A new active unit leaves its slot (occupant or surplus) and the
    /// previous one is stored again in the cell it was last seen in. If the
    /// active unit did not change, only its cell is recomputed.
    pub fn update(&mut self, active_global_state: &[Node]) -> EcmcResult<()> {
        self.ensure_initialized()?;
        let active_units: Vec<&Node> = active_global_state
            .iter()
            .flat_map(|root| nodes_on_level(root, self.cell_level))
            .collect();
        let [active] = active_units.as_slice() else {
            return Err(EcmcError::precondition(format!(
                "the cell occupancy needs exactly one active unit on level {}, got {}",
                self.cell_level,
                active_units.len()
            )));
        };

        if self.active_identifier.as_ref() == Some(&active.unit.identifier) {
            self.active_cell = Some(self.cells.position_to_cell(&active.unit.position));
            return Ok(());
        }

        if let (Some(previous), Some(cell)) = (self.active_identifier.take(), self.active_cell.take()) {
            self.store(cell, previous);
        }
        if !self.is_relevant(active) {
            return Ok(());
        }

        let identifier = active.unit.identifier.clone();
        let cell = self.cells.position_to_cell(&active.unit.position);
        if self.occupants[cell].as_ref() == Some(&identifier) {
            self.occupants[cell] = self.surplus.get_mut(&cell).and_then(Vec::pop);
        } else {
            let parked = self.surplus.get_mut(&cell).ok_or_else(|| {
                EcmcError::TagActivator(format!("active unit {} is not stored in its cell {}", identifier, cell))
            })?;
            let position = parked.iter().position(|id| *id == identifier).ok_or_else(|| {
                EcmcError::TagActivator(format!("active unit {} is not stored in its cell {}", identifier, cell))
            })?;
            parked.remove(position);
        }
        if self.surplus.get(&cell).map_or(false, Vec::is_empty) {
            self.surplus.remove(&cell);
        }
        self.active_identifier = Some(identifier);
        self.active_cell = Some(cell);
        Ok(())
    }

    /// Occupant of a cell. The active unit and surplus units are never
    /// returned.
    pub fn occupant(&self, cell: Cell) -> EcmcResult<Option<&StateId>> {
        self.ensure_initialized()?;
        self.occupants
            .get(cell)
            .map(Option::as_ref)
            .ok_or_else(|| EcmcError::TagActivator(format!("cell {} does not exist", cell)))
    }

    pub fn yield_surplus(&self) -> EcmcResult<Vec<StateId>> {
        self.ensure_initialized()?;
        Ok(self.surplus.values().flatten().cloned().collect())
    }

    /// Cell and identifier of the active unit, if it is stored here.
    pub fn yield_active_cells(&self) -> EcmcResult<Option<(Cell, StateId)>> {
        self.ensure_initialized()?;
        Ok(self.active_cell.zip(self.active_identifier.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecmc_core::{Time, Unit};

    fn setup() -> SingleActiveCellOccupancy {
        let context = Context::hypercubic(2, 1.0, 1.0).unwrap();
        let cells = Arc::new(CuboidPeriodicCells::new(&context, &[4], 1).unwrap());
        SingleActiveCellOccupancy::new(&context, cells, 1, None).unwrap()
    }

    fn point(index: usize, position: [f64; 2]) -> Node {
        Node::new(Unit::new(StateId::root(index), position.to_vec()), 1.0)
    }

    fn active(index: usize, position: [f64; 2]) -> Node {
        Node::new(
            Unit::new(StateId::root(index), position.to_vec()).with_velocity(vec![1.0, 0.0], Time::ZERO),
            1.0,
        )
    }

    fn global_state() -> Vec<Node> {
        vec![
            point(0, [0.1, 0.1]),
            point(1, [0.2, 0.2]),
            point(2, [0.6, 0.1]),
        ]
    }

    #[test]
    fn test_use_before_initialize() {
        let occupancy = setup();
        assert!(matches!(occupancy.occupant(0), Err(EcmcError::Uninitialized { .. })));
        assert!(matches!(occupancy.yield_surplus(), Err(EcmcError::Uninitialized { .. })));
    }

    #[test]
    fn test_initialize_fills_occupants_then_surplus() {
        let mut occupancy = setup();
        occupancy.initialize(&global_state()).unwrap();
        let cells = Arc::clone(occupancy.cells());
        let first = cells.position_to_cell(&[0.1, 0.1]);
        let third = cells.position_to_cell(&[0.6, 0.1]);
        assert_eq!(occupancy.occupant(first).unwrap(), Some(&StateId::root(0)));
        assert_eq!(occupancy.occupant(third).unwrap(), Some(&StateId::root(2)));
        assert_eq!(occupancy.yield_surplus().unwrap(), vec![StateId::root(1)]);
        assert_eq!(occupancy.yield_active_cells().unwrap(), None);
    }

    #[test]
    fn test_active_occupant_is_replaced_by_surplus() {
        let mut occupancy = setup();
        occupancy.initialize(&global_state()).unwrap();
        let cell = occupancy.cells().position_to_cell(&[0.1, 0.1]);

        occupancy.update(&[active(0, [0.1, 0.1])]).unwrap();
        assert_eq!(occupancy.yield_active_cells().unwrap(), Some((cell, StateId::root(0))));
        assert_eq!(occupancy.occupant(cell).unwrap(), Some(&StateId::root(1)));
        assert!(occupancy.yield_surplus().unwrap().is_empty());
    }

    #[test]
    fn test_active_surplus_unit_leaves_surplus() {
        let mut occupancy = setup();
        occupancy.initialize(&global_state()).unwrap();
        let cell = occupancy.cells().position_to_cell(&[0.2, 0.2]);

        occupancy.update(&[active(1, [0.2, 0.2])]).unwrap();
        assert_eq!(occupancy.occupant(cell).unwrap(), Some(&StateId::root(0)));
        assert!(occupancy.yield_surplus().unwrap().is_empty());
    }

    #[test]
    fn test_previous_active_unit_is_stored_in_its_last_cell() {
        let mut occupancy = setup();
        occupancy.initialize(&global_state()).unwrap();
        occupancy.update(&[active(0, [0.1, 0.1])]).unwrap();
        // Unit 0 moved on to the cell of unit 2 before it passed on the activity.
        occupancy.update(&[active(0, [0.55, 0.1])]).unwrap();
        let moved_to = occupancy.cells().position_to_cell(&[0.55, 0.1]);
        occupancy.update(&[active(2, [0.6, 0.1])]).unwrap();

        assert_eq!(occupancy.occupant(moved_to).unwrap(), Some(&StateId::root(0)));
        assert_eq!(occupancy.yield_active_cells().unwrap(), Some((moved_to, StateId::root(2))));
        assert!(occupancy.yield_surplus().unwrap().is_empty());
    }

    #[test]
    fn test_previous_active_unit_becomes_surplus_in_occupied_cell() {
        let mut occupancy = setup();
        occupancy.initialize(&global_state()).unwrap();
        occupancy.update(&[active(1, [0.2, 0.2])]).unwrap();
        occupancy.update(&[active(0, [0.1, 0.1])]).unwrap();
        // Unit 1 is parked again and immediately refills the slot unit 0 vacates.
        let cell = occupancy.cells().position_to_cell(&[0.1, 0.1]);
        assert_eq!(occupancy.occupant(cell).unwrap(), Some(&StateId::root(1)));
        assert!(occupancy.yield_surplus().unwrap().is_empty());
    }

    #[test]
    fn test_more_than_one_active_unit_is_rejected() {
        let mut occupancy = setup();
        occupancy.initialize(&global_state()).unwrap();
        assert!(matches!(
            occupancy.update(&[active(0, [0.1, 0.1]), active(2, [0.6, 0.1])]),
            Err(EcmcError::Precondition(_))
        ));
    }

    #[test]
    fn test_charge_filter() {
        let context = Context::hypercubic(2, 1.0, 1.0).unwrap();
        let cells = Arc::new(CuboidPeriodicCells::new(&context, &[4], 1).unwrap());
        let mut occupancy =
            SingleActiveCellOccupancy::new(&context, cells, 1, Some("charge".to_string())).unwrap();
        let state = vec![
            Node::new(Unit::new(StateId::root(0), vec![0.1, 0.1]).with_charge("charge", 1.0), 1.0),
            Node::new(Unit::new(StateId::root(1), vec![0.6, 0.6]).with_charge("charge", 0.0), 1.0),
        ];
        occupancy.initialize(&state).unwrap();
        let neutral = occupancy.cells().position_to_cell(&[0.6, 0.6]);
        assert_eq!(occupancy.occupant(neutral).unwrap(), None);
    }

    #[test]
    fn test_charge_on_composite_level_is_rejected() {
        let context = Context::with_composites(vec![1.0, 1.0], 1.0, 2, 2).unwrap();
        let cells = Arc::new(CuboidPeriodicCells::new(&context, &[4], 1).unwrap());
        assert!(SingleActiveCellOccupancy::new(&context, cells, 1, Some("charge".to_string())).is_err());
    }
}
