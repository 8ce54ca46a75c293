//! Units and the trees that carry them
//!
//! The global state is a forest: one tree per root unit. A point mass is a
//! root without children, a composite object is a root whose children are the
//! leaf units. Event handlers receive branches of this forest (copies that may
//! contain only part of the children) and send modified branches back.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{StateId, Time};

/// Position, velocity and charges of one element of the global state.
///
/// A unit is active iff its velocity is set, and then its time stamp is set
/// as well.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub identifier: StateId,
    pub position: Vec<f64>,
    pub velocity: Option<Vec<f64>>,
    pub time_stamp: Option<Time>,
    pub charge: Option<BTreeMap<String, f64>>,
}

impl Unit {
    pub fn new(identifier: StateId, position: Vec<f64>) -> Self {
        Unit {
            identifier,
            position,
            velocity: None,
            time_stamp: None,
            charge: None,
        }
    }

    pub fn with_velocity(mut self, velocity: Vec<f64>, time_stamp: Time) -> Self {
        self.velocity = Some(velocity);
        self.time_stamp = Some(time_stamp);
        self
    }

    pub fn with_charge(mut self, name: impl Into<String>, value: f64) -> Self {
        self.charge
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), value);
        self
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.velocity.is_some()
    }

    /// Value of the named charge, `None` if the unit carries no such charge.
    pub fn charge_value(&self, name: &str) -> Option<f64> {
        self.charge.as_ref().and_then(|charges| charges.get(name).copied())
    }
}

/// Node of a unit tree.
///
/// `weight` is the share of the node in the velocity of its parent (one over
/// the number of children in the full tree, one for roots). It is stored
/// explicitly because branches may omit siblings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub unit: Unit,
    pub weight: f64,
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(unit: Unit, weight: f64) -> Self {
        Node {
            unit,
            weight,
            children: Vec::new(),
        }
    }

    /// Root node with children whose weights are one over their count.
    pub fn composite(unit: Unit, children: Vec<Unit>) -> Self {
        let weight = 1.0 / children.len().max(1) as f64;
        Node {
            unit,
            weight: 1.0,
            children: children.into_iter().map(|u| Node::new(u, weight)).collect(),
        }
    }

    pub fn add_child(&mut self, child: Node) {
        self.children.push(child);
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn leaves(&self) -> Vec<&Node> {
        fn collect<'a>(node: &'a Node, out: &mut Vec<&'a Node>) {
            if node.children.is_empty() {
                out.push(node);
            } else {
                for child in &node.children {
                    collect(child, out);
                }
            }
        }
        let mut out = Vec::new();
        collect(self, &mut out);
        out
    }

    pub fn leaves_mut(&mut self) -> Vec<&mut Node> {
        fn collect<'a>(node: &'a mut Node, out: &mut Vec<&'a mut Node>) {
            if node.children.is_empty() {
                out.push(node);
            } else {
                for child in node.children.iter_mut() {
                    collect(child, out);
                }
            }
        }
        let mut out = Vec::new();
        collect(self, &mut out);
        out
    }

    /// Apply `f` to every unit in the subtree, parents before children.
    pub fn for_each_unit_mut<F: FnMut(&mut Unit)>(&mut self, f: &mut F) {
        f(&mut self.unit);
        for child in self.children.iter_mut() {
            child.for_each_unit_mut(f);
        }
    }

    pub fn descend(&self, children: &[usize]) -> Option<&Node> {
        let mut node = self;
        for &index in children {
            node = node.children.get(index)?;
        }
        Some(node)
    }

    pub fn descend_mut(&mut self, children: &[usize]) -> Option<&mut Node> {
        let mut node = self;
        for &index in children {
            node = node.children.get_mut(index)?;
        }
        Some(node)
    }
}

/// Location of a node inside a list of branches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodePath {
    pub branch: usize,
    pub children: Vec<usize>,
}

impl NodePath {
    /// Paths of every node from the branch root down to this one.
    pub fn ancestry(&self) -> Vec<NodePath> {
        (0..=self.children.len())
            .map(|depth| NodePath {
                branch: self.branch,
                children: self.children[..depth].to_vec(),
            })
            .collect()
    }
}

/// Paths of all leaf nodes, in depth-first order over the branches.
pub fn leaf_paths(branches: &[Node]) -> Vec<NodePath> {
    fn collect(node: &Node, branch: usize, prefix: &mut Vec<usize>, out: &mut Vec<NodePath>) {
        if node.children.is_empty() {
            out.push(NodePath {
                branch,
                children: prefix.clone(),
            });
            return;
        }
        for (index, child) in node.children.iter().enumerate() {
            prefix.push(index);
            collect(child, branch, prefix, out);
            prefix.pop();
        }
    }
    let mut out = Vec::new();
    for (branch, node) in branches.iter().enumerate() {
        collect(node, branch, &mut Vec::new(), &mut out);
    }
    out
}

pub fn node_at<'a>(branches: &'a [Node], path: &NodePath) -> Option<&'a Node> {
    branches.get(path.branch)?.descend(&path.children)
}

pub fn node_at_mut<'a>(branches: &'a mut [Node], path: &NodePath) -> Option<&'a mut Node> {
    branches.get_mut(path.branch)?.descend_mut(&path.children)
}
