//! Periodic cell systems
//!
//! Cells partition the simulation box and back the occupancy index of the
//! activator and the cell-veto tables. A cell is identified by its linear
//! index; index arithmetic is done on integer tuples so relative cells and
//! translations never suffer from rounding at cell boundaries.

use std::collections::BTreeSet;

use crate::{Context, EcmcError, EcmcResult};

/// Linear cell index.
pub type Cell = usize;

/// Hypercuboid cell system with periodic boundaries and its origin at zero.
#[derive(Clone, Debug)]
pub struct CuboidPeriodicCells {
    context: Context,
    cells_per_side: Vec<usize>,
    cell_side_length: Vec<f64>,
    cumulative_product: Vec<usize>,
    number_of_cells: usize,
    neighbor_layers: usize,
    nearby: Vec<BTreeSet<Cell>>,
}

impl CuboidPeriodicCells {
    /// Create the cell system.
    ///
    /// `cells_per_side` may contain fewer entries than the dimension; the
    /// first entry is then used for the missing directions.
    pub fn new(context: &Context, cells_per_side: &[usize], neighbor_layers: usize) -> EcmcResult<Self> {
        let dimension = context.dimension();
        let first = *cells_per_side
            .first()
            .ok_or_else(|| EcmcError::configuration("cells_per_side must not be empty"))?;
        let cells_per_side: Vec<usize> = (0..dimension)
            .map(|d| cells_per_side.get(d).copied().unwrap_or(first))
            .collect();
        if cells_per_side.iter().any(|&n| n == 0) {
            return Err(EcmcError::configuration("every direction needs at least one cell"));
        }
        if cells_per_side
            .iter()
            .any(|&n| n < 2 * neighbor_layers + 1)
        {
            tracing::warn!(
                ?cells_per_side,
                neighbor_layers,
                "nearby cell layers wrap around the periodic box"
            );
        }
        let cell_side_length = cells_per_side
            .iter()
            .enumerate()
            .map(|(d, &n)| context.system_length(d) / n as f64)
            .collect();
        let mut cumulative_product = Vec::with_capacity(dimension);
        let mut product = 1;
        for &n in &cells_per_side {
            cumulative_product.push(product);
            product *= n;
        }

        let mut cells = CuboidPeriodicCells {
            context: context.clone(),
            cells_per_side,
            cell_side_length,
            cumulative_product,
            number_of_cells: product,
            neighbor_layers,
            nearby: Vec::new(),
        };
        cells.nearby = (0..cells.number_of_cells)
            .map(|cell| cells.compute_nearby(cell))
            .collect();
        tracing::debug!(
            cells_per_side = ?cells.cells_per_side,
            number_of_cells = cells.number_of_cells,
            neighbor_layers,
            "Cell system constructed"
        );
        Ok(cells)
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.cells_per_side.len()
    }

    #[inline]
    pub fn number_of_cells(&self) -> usize {
        self.number_of_cells
    }

    #[inline]
    pub fn cells_per_side(&self) -> &[usize] {
        &self.cells_per_side
    }

    #[inline]
    pub fn neighbor_layers(&self) -> usize {
        self.neighbor_layers
    }

    pub fn yield_cells(&self) -> impl Iterator<Item = Cell> {
        0..self.number_of_cells
    }

    #[inline]
    pub fn zero_cell(&self) -> Cell {
        0
    }

    pub fn to_tuple(&self, cell: Cell) -> Vec<usize> {
        self.cells_per_side
            .iter()
            .zip(&self.cumulative_product)
            .map(|(&n, &product)| (cell / product) % n)
            .collect()
    }

    pub fn from_tuple(&self, tuple: &[usize]) -> Cell {
        tuple
            .iter()
            .zip(&self.cumulative_product)
            .map(|(index, product)| index * product)
            .sum()
    }

    pub fn position_to_cell(&self, position: &[f64]) -> Cell {
        let mut cell = 0;
        for d in 0..self.dimension() {
            let entry = self.context.correct_position_entry(position[d], d);
            let index = ((entry / self.cell_side_length[d]) as usize).min(self.cells_per_side[d] - 1);
            cell += index * self.cumulative_product[d];
        }
        cell
    }

    /// Lower corner of the cell.
    pub fn cell_min(&self, cell: Cell) -> Vec<f64> {
        self.to_tuple(cell)
            .iter()
            .zip(&self.cell_side_length)
            .map(|(&index, side)| index as f64 * side)
            .collect()
    }

    /// Upper corner of the cell.
    pub fn cell_max(&self, cell: Cell) -> Vec<f64> {
        self.to_tuple(cell)
            .iter()
            .zip(&self.cell_side_length)
            .map(|(&index, side)| (index + 1) as f64 * side)
            .collect()
    }

    pub fn cell_center(&self, cell: Cell) -> Vec<f64> {
        self.to_tuple(cell)
            .iter()
            .zip(&self.cell_side_length)
            .map(|(&index, side)| (index as f64 + 0.5) * side)
            .collect()
    }

    /// Neighbouring cell in positive `direction`.
    pub fn successor(&self, cell: Cell, direction: usize) -> Cell {
        let mut tuple = self.to_tuple(cell);
        tuple[direction] = (tuple[direction] + 1) % self.cells_per_side[direction];
        self.from_tuple(&tuple)
    }

    /// Cells within `neighbor_layers` of `cell` in every direction, the cell
    /// itself included.
    pub fn nearby_cells(&self, cell: Cell) -> &BTreeSet<Cell> {
        &self.nearby[cell]
    }

    /// Cell of `cell` relative to `reference`, so that
    /// `translate(reference, relative_cell(cell, reference)) == cell`.
    pub fn relative_cell(&self, cell: Cell, reference: Cell) -> Cell {
        let tuple = self.to_tuple(cell);
        let reference = self.to_tuple(reference);
        let relative: Vec<usize> = (0..self.dimension())
            .map(|d| {
                let n = self.cells_per_side[d];
                (tuple[d] + n - reference[d]) % n
            })
            .collect();
        self.from_tuple(&relative)
    }

    pub fn translate(&self, cell: Cell, relative: Cell) -> Cell {
        let tuple = self.to_tuple(cell);
        let relative = self.to_tuple(relative);
        let translated: Vec<usize> = (0..self.dimension())
            .map(|d| (tuple[d] + relative[d]) % self.cells_per_side[d])
            .collect();
        self.from_tuple(&translated)
    }

    fn compute_nearby(&self, cell: Cell) -> BTreeSet<Cell> {
        let width = 2 * self.neighbor_layers + 1;
        let dimension = self.dimension();
        let center = self.to_tuple(cell);
        let mut nearby = BTreeSet::new();
        for offset in 0..width.pow(dimension as u32) {
            let mut rest = offset;
            let mut tuple = Vec::with_capacity(dimension);
            for d in 0..dimension {
                let n = self.cells_per_side[d];
                let shift = rest % width;
                rest /= width;
                let shifted = (center[d] as i64 + shift as i64 - self.neighbor_layers as i64)
                    .rem_euclid(n as i64) as usize;
                tuple.push(shifted);
            }
            nearby.insert(self.from_tuple(&tuple));
        }
        nearby
    }
}
