//! Tree state handler - in-memory forest of units
//!
//! Positions and charges live in the physical forest. Velocities and time
//! stamps of the lifted (active) units live in a separate map keyed by
//! identifier, so the active units can be enumerated without a scan of the
//! whole forest.

use std::collections::BTreeMap;

use ecmc_core::{EcmcError, EcmcResult, Node, StateId, Time, Unit};

use crate::StateHandler;

/// In-memory global state.
#[derive(Debug, Clone)]
pub struct TreeStateHandler {
    /// Physical state, velocities always stripped
    roots: Vec<Node>,
    /// Lifted units: velocity and time stamp by identifier
    lifted: BTreeMap<StateId, (Vec<f64>, Time)>,
}

impl TreeStateHandler {
    /// Create the state handler from the initial global state.
    ///
    /// Root `i` must carry the identifier `(i)`, child `j` of a unit with
    /// identifier `id` must carry `id + (j)`.
    pub fn new(global_state: Vec<Node>) -> EcmcResult<Self> {
        let mut handler = TreeStateHandler {
            roots: Vec::with_capacity(global_state.len()),
            lifted: BTreeMap::new(),
        };
        for (index, mut root) in global_state.into_iter().enumerate() {
            handler.register(&mut root, &StateId::root(index))?;
            handler.roots.push(root);
        }
        tracing::debug!(
            roots = handler.roots.len(),
            lifted = handler.lifted.len(),
            "Tree state handler initialized"
        );
        Ok(handler)
    }

    fn register(&mut self, node: &mut Node, expected: &StateId) -> EcmcResult<()> {
        if &node.unit.identifier != expected {
            return Err(EcmcError::configuration(format!(
                "unit {} is stored at position {} of the global state",
                node.unit.identifier, expected
            )));
        }
        match (node.unit.velocity.take(), node.unit.time_stamp.take()) {
            (Some(velocity), Some(time_stamp)) => {
                self.lifted.insert(expected.clone(), (velocity, time_stamp));
            }
            (None, None) => {}
            _ => {
                return Err(EcmcError::configuration(format!(
                    "unit {} must set both velocity and time stamp or neither",
                    expected
                )))
            }
        }
        for (index, child) in node.children.iter_mut().enumerate() {
            let mut components = expected.components().to_vec();
            components.push(index);
            self.register(child, &StateId::new(components))?;
        }
        Ok(())
    }

    /// Number of root units.
    pub fn number_of_roots(&self) -> usize {
        self.roots.len()
    }

    /// Velocity and time stamp of a lifted unit.
    pub fn lifted(&self, identifier: &StateId) -> Option<&(Vec<f64>, Time)> {
        self.lifted.get(identifier)
    }

    /// Identifiers of the units that move independently.
    ///
    /// A composite object whose leaves are all lifted moves as a whole and is
    /// reported by its root identifier; otherwise its lifted leaves are
    /// reported one by one.
    pub fn yield_independent_active_identifiers(&self) -> Vec<StateId> {
        let mut identifiers = Vec::new();
        for root in &self.roots {
            let root_id = &root.unit.identifier;
            if root.children.is_empty() {
                if self.lifted.contains_key(root_id) {
                    identifiers.push(root_id.clone());
                }
                continue;
            }
            let lifted_children: Vec<&StateId> = root
                .children
                .iter()
                .map(|child| &child.unit.identifier)
                .filter(|id| self.lifted.contains_key(*id))
                .collect();
            if lifted_children.len() == root.children.len() {
                identifiers.push(root_id.clone());
            } else {
                identifiers.extend(lifted_children.into_iter().cloned());
            }
        }
        identifiers
    }

    fn physical(&self, identifier: &StateId) -> EcmcResult<&Node> {
        let (first, rest) = identifier
            .components()
            .split_first()
            .ok_or_else(|| EcmcError::StateNotFound(identifier.clone()))?;
        self.roots
            .get(*first)
            .and_then(|root| root.descend(rest))
            .ok_or_else(|| EcmcError::StateNotFound(identifier.clone()))
    }

    fn physical_mut(&mut self, identifier: &StateId) -> EcmcResult<&mut Node> {
        let (first, rest) = identifier
            .components()
            .split_first()
            .ok_or_else(|| EcmcError::StateNotFound(identifier.clone()))?;
        self.roots
            .get_mut(*first)
            .and_then(|root| root.descend_mut(rest))
            .ok_or_else(|| EcmcError::StateNotFound(identifier.clone()))
    }

    fn copy_unit(&self, unit: &Unit) -> Unit {
        let mut copy = unit.clone();
        if let Some((velocity, time_stamp)) = self.lifted.get(&unit.identifier) {
            copy.velocity = Some(velocity.clone());
            copy.time_stamp = Some(*time_stamp);
        }
        copy
    }

    fn copy_subtree(&self, node: &Node) -> Node {
        Node {
            unit: self.copy_unit(&node.unit),
            weight: node.weight,
            children: node.children.iter().map(|c| self.copy_subtree(c)).collect(),
        }
    }

    fn insert_node(&mut self, node: &Node) -> EcmcResult<()> {
        let identifier = &node.unit.identifier;
        let stored = self.physical_mut(identifier)?;
        stored.unit.position.clone_from(&node.unit.position);
        match (&node.unit.velocity, node.unit.time_stamp) {
            (Some(velocity), Some(time_stamp)) => {
                self.lifted
                    .insert(identifier.clone(), (velocity.clone(), time_stamp));
            }
            (None, None) => {
                self.lifted.remove(identifier);
            }
            _ => {
                return Err(EcmcError::mediator(format!(
                    "inserted unit {} sets only one of velocity and time stamp",
                    identifier
                )))
            }
        }
        for child in &node.children {
            self.insert_node(child)?;
        }
        Ok(())
    }
}

impl StateHandler for TreeStateHandler {
    fn extract_active_global_state(&self) -> EcmcResult<Vec<Node>> {
        let identifiers = self.yield_independent_active_identifiers();
        tracing::trace!(?identifiers, "Independent active identifiers");
        self.extract_all(&identifiers)
    }

    fn extract_from_global_state(&self, identifier: &StateId) -> EcmcResult<Node> {
        // Validate the full path before building the branch.
        let target = self.physical(identifier)?;
        let components = identifier.components();
        let root = &self.roots[components[0]];

        // Walk down from the root, keeping only the nodes on the path.
        let mut path_nodes = vec![root];
        for &index in &components[1..] {
            let parent = path_nodes[path_nodes.len() - 1];
            path_nodes.push(&parent.children[index]);
        }
        let mut branch = self.copy_subtree(target);
        for node in path_nodes.into_iter().rev().skip(1) {
            branch = Node {
                unit: self.copy_unit(&node.unit),
                weight: node.weight,
                children: vec![branch],
            };
        }
        Ok(branch)
    }

    fn insert_into_global_state(&mut self, branches: &[Node]) -> EcmcResult<()> {
        for branch in branches {
            self.insert_node(branch)?;
        }
        Ok(())
    }

    fn extract_global_state(&self) -> Vec<Node> {
        self.roots.iter().map(|root| self.copy_subtree(root)).collect()
    }
}
