//! Taggers - in-state identifiers for the handlers of one tag
//!
//! A tagger groups handler instances under a tag and knows which branches of
//! the global state its handlers need for their next event time. Taggers
//! that read a cell occupancy are bound to it in a second initialization
//! phase, after the occupancies themselves have been filled.

use std::collections::BTreeSet;
use std::fmt;

use ecmc_core::{EcmcError, EcmcResult, Node, StateId};
use ecmc_events::{HandlerFactory, HandlerRole};

use crate::occupancy::SingleActiveCellOccupancy;

/// Strategy that turns the active global state into in-state identifiers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaggerKind {
    /// Handlers that need no in-state.
    NoInState,
    /// All independent active units in one in-state.
    ActiveGlobalStateInState,
    /// The active unit of every active cell.
    CellVeto { internal_state: String },
    /// The active unit of every active cell, for cell boundary events.
    CellBoundary { internal_state: String },
    /// The active unit together with the occupant of every occupied cell
    /// that is not nearby the active cell.
    CellBoundingPotential { internal_state: String },
    /// The active unit together with the occupant of every occupied cell
    /// nearby the active cell.
    NearbyCells { internal_state: String },
    /// The active unit together with every surplus unit.
    SurplusCells { internal_state: String },
    /// The active unit together with every unit of another composite object.
    ///
    /// With `whole_composites` the in-states consist of the two root
    /// identifiers, otherwise of the two leaf identifiers.
    PairFactorInState { whole_composites: bool },
}

impl TaggerKind {
    fn internal_state_label(&self) -> Option<&str> {
        match self {
            TaggerKind::CellVeto { internal_state }
            | TaggerKind::CellBoundary { internal_state }
            | TaggerKind::CellBoundingPotential { internal_state }
            | TaggerKind::NearbyCells { internal_state }
            | TaggerKind::SurplusCells { internal_state } => Some(internal_state),
            _ => None,
        }
    }

    /// Handler role the strategy is restricted to, if any.
    pub(crate) fn required_role(&self) -> Option<HandlerRole> {
        match self {
            TaggerKind::CellVeto { .. } => Some(HandlerRole::CellVeto),
            TaggerKind::CellBoundary { .. } => Some(HandlerRole::CellBoundary),
            _ => None,
        }
    }
}

/// Configuration of one tagger.
#[derive(Clone)]
pub struct TaggerConfig {
    pub tag: String,
    pub kind: TaggerKind,
    pub factory: HandlerFactory,
    /// Handler instances, the maximum number of simultaneously pending
    /// events of this tag.
    pub number_event_handlers: usize,
    /// Tags whose handlers compute new events after an event of this tag.
    pub create: Vec<String>,
    /// Tags whose pending events become stale after an event of this tag.
    pub trash: Vec<String>,
    pub activate: Vec<String>,
    pub deactivate: Vec<String>,
}

impl TaggerConfig {
    pub fn new(tag: impl Into<String>, kind: TaggerKind, factory: HandlerFactory) -> Self {
        TaggerConfig {
            tag: tag.into(),
            kind,
            factory,
            number_event_handlers: 1,
            create: Vec::new(),
            trash: Vec::new(),
            activate: Vec::new(),
            deactivate: Vec::new(),
        }
    }

    pub fn with_event_handlers(mut self, number_event_handlers: usize) -> Self {
        self.number_event_handlers = number_event_handlers;
        self
    }

    pub fn creates(mut self, tags: &[&str]) -> Self {
        self.create = tags.iter().map(|tag| tag.to_string()).collect();
        self
    }

    pub fn trashes(mut self, tags: &[&str]) -> Self {
        self.trash = tags.iter().map(|tag| tag.to_string()).collect();
        self
    }

    pub fn activates(mut self, tags: &[&str]) -> Self {
        self.activate = tags.iter().map(|tag| tag.to_string()).collect();
        self
    }

    pub fn deactivates(mut self, tags: &[&str]) -> Self {
        self.deactivate = tags.iter().map(|tag| tag.to_string()).collect();
        self
    }
}

impl fmt::Debug for TaggerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaggerConfig")
            .field("tag", &self.tag)
            .field("kind", &self.kind)
            .field("number_event_handlers", &self.number_event_handlers)
            .field("create", &self.create)
            .field("trash", &self.trash)
            .field("activate", &self.activate)
            .field("deactivate", &self.deactivate)
            .finish_non_exhaustive()
    }
}

/// Shape of one root of the global state, recorded in phase two.
#[derive(Clone, Debug)]
struct RootShape {
    identifier: StateId,
    children: usize,
    leaves: Vec<StateId>,
}

fn leaf_identifiers(node: &Node, leaves: &mut Vec<StateId>) {
    if node.children.is_empty() {
        leaves.push(node.unit.identifier.clone());
    }
    for child in &node.children {
        leaf_identifiers(child, leaves);
    }
}

fn active_leaf_identifiers(node: &Node, leaves: &mut Vec<StateId>) {
    if node.children.is_empty() {
        if node.unit.velocity.is_some() {
            leaves.push(node.unit.identifier.clone());
        }
        return;
    }
    for child in &node.children {
        active_leaf_identifiers(child, leaves);
    }
}

/// Runtime state of a tagger.
#[derive(Debug)]
pub(crate) struct Tagger {
    tag: String,
    kind: TaggerKind,
    active: bool,
    internal_state: Option<usize>,
    roots: Vec<RootShape>,
    initialized: bool,
}

impl Tagger {
    pub(crate) fn new(tag: String, kind: TaggerKind) -> Self {
        Tagger {
            tag,
            kind,
            active: true,
            internal_state: None,
            roots: Vec::new(),
            initialized: false,
        }
    }

    pub(crate) fn tag(&self) -> &str {
        &self.tag
    }

    pub(crate) fn activate(&mut self) {
        self.active = true;
    }

    pub(crate) fn deactivate(&mut self) {
        self.active = false;
    }

    pub(crate) fn internal_state(&self) -> Option<usize> {
        self.internal_state
    }

    /// Second initialization phase, after the internal states have been
    /// initialized.
    pub(crate) fn initialize_with_internal_states(
        &mut self,
        global_state: &[Node],
        internal_state_labels: &[&str],
    ) -> EcmcResult<()> {
        if let Some(label) = self.kind.internal_state_label() {
            let index = internal_state_labels
                .iter()
                .position(|candidate| *candidate == label)
                .ok_or_else(|| {
                    EcmcError::configuration(format!(
                        "tagger '{}' refers to the unknown internal state '{}'",
                        self.tag, label
                    ))
                })?;
            self.internal_state = Some(index);
        }
        self.roots = global_state
            .iter()
            .map(|root| {
                let mut leaves = Vec::new();
                leaf_identifiers(root, &mut leaves);
                RootShape {
                    identifier: root.unit.identifier.clone(),
                    children: root.children.len(),
                    leaves,
                }
            })
            .collect();
        self.initialized = true;
        Ok(())
    }

    fn occupancy<'a>(
        &self,
        internal_states: &'a [SingleActiveCellOccupancy],
    ) -> EcmcResult<&'a SingleActiveCellOccupancy> {
        self.internal_state
            .and_then(|index| internal_states.get(index))
            .ok_or_else(|| {
                EcmcError::TagActivator(format!("tagger '{}' has no internal state", self.tag))
            })
    }

    /// In-state identifiers, one entry per handler to run. `None` means the
    /// handler needs no in-state.
    pub(crate) fn yield_identifiers(
        &self,
        active_global_state: &[Node],
        internal_states: &[SingleActiveCellOccupancy],
    ) -> EcmcResult<Vec<Option<Vec<StateId>>>> {
        if !self.initialized {
            return Err(EcmcError::Uninitialized {
                component: format!("tagger '{}'", self.tag),
            });
        }
        if !self.active {
            return Ok(Vec::new());
        }
        let identifiers = match &self.kind {
            TaggerKind::NoInState => vec![None],
            TaggerKind::ActiveGlobalStateInState => {
                vec![Some(self.independent_active_identifiers(active_global_state))]
            }
            TaggerKind::CellVeto { .. } | TaggerKind::CellBoundary { .. } => self
                .occupancy(internal_states)?
                .yield_active_cells()?
                .into_iter()
                .map(|(_, active)| Some(vec![active]))
                .collect(),
            TaggerKind::CellBoundingPotential { .. } => {
                let occupancy = self.occupancy(internal_states)?;
                let mut identifiers = Vec::new();
                if let Some((active_cell, active)) = occupancy.yield_active_cells()? {
                    let nearby = occupancy.cells().nearby_cells(active_cell);
                    for cell in occupancy.cells().yield_cells() {
                        if nearby.contains(&cell) {
                            continue;
                        }
                        if let Some(occupant) = occupancy.occupant(cell)? {
                            identifiers.push(Some(vec![active.clone(), occupant.clone()]));
                        }
                    }
                }
                identifiers
            }
            TaggerKind::NearbyCells { .. } => {
                let occupancy = self.occupancy(internal_states)?;
                let mut identifiers = Vec::new();
                if let Some((active_cell, active)) = occupancy.yield_active_cells()? {
                    for &cell in occupancy.cells().nearby_cells(active_cell) {
                        if let Some(occupant) = occupancy.occupant(cell)? {
                            identifiers.push(Some(vec![active.clone(), occupant.clone()]));
                        }
                    }
                }
                identifiers
            }
            TaggerKind::SurplusCells { .. } => {
                let occupancy = self.occupancy(internal_states)?;
                match occupancy.yield_active_cells()? {
                    Some((_, active)) => occupancy
                        .yield_surplus()?
                        .into_iter()
                        .map(|surplus| Some(vec![active.clone(), surplus]))
                        .collect(),
                    None => Vec::new(),
                }
            }
            TaggerKind::PairFactorInState { whole_composites } => {
                self.pair_identifiers(active_global_state, *whole_composites)
            }
        };
        Ok(identifiers)
    }

    fn independent_active_identifiers(&self, active_global_state: &[Node]) -> Vec<StateId> {
        let mut identifiers = Vec::new();
        for branch in active_global_state {
            let whole = self
                .roots
                .iter()
                .find(|root| root.identifier == branch.unit.identifier)
                .map_or(true, |root| branch.children.len() == root.children);
            if whole {
                identifiers.push(branch.unit.identifier.clone());
            } else {
                identifiers.extend(branch.children.iter().map(|child| child.unit.identifier.clone()));
            }
        }
        identifiers
    }

    fn pair_identifiers(&self, active_global_state: &[Node], whole_composites: bool) -> Vec<Option<Vec<StateId>>> {
        let mut identifiers = Vec::new();
        if whole_composites {
            let active_roots: BTreeSet<StateId> = active_global_state
                .iter()
                .map(|branch| branch.unit.identifier.root_id())
                .collect();
            for active in &active_roots {
                for root in &self.roots {
                    if root.identifier != *active {
                        identifiers.push(Some(vec![active.clone(), root.identifier.clone()]));
                    }
                }
            }
        } else {
            let mut active_leaves = Vec::new();
            for branch in active_global_state {
                active_leaf_identifiers(branch, &mut active_leaves);
            }
            for active in &active_leaves {
                for root in &self.roots {
                    if root.identifier.same_composite_object(active) {
                        continue;
                    }
                    for leaf in &root.leaves {
                        identifiers.push(Some(vec![active.clone(), leaf.clone()]));
                    }
                }
            }
        }
        identifiers
    }
}
