//! Identity types for the ECMC kernel
//!
//! `StateId` addresses a unit in the global state tree, `HandlerId` addresses
//! one event handler instance across the activator, the scheduler and the
//! mediators.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a unit in the global state store.
///
/// The first component names the root (composite object or independent point
/// mass), every further component descends one level into the tree.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct StateId(pub Vec<usize>);

impl StateId {
    #[inline]
    pub fn new(components: Vec<usize>) -> Self {
        StateId(components)
    }

    /// Identifier of a root unit.
    #[inline]
    pub fn root(index: usize) -> Self {
        StateId(vec![index])
    }

    /// Identifier of a child of a root unit.
    #[inline]
    pub fn child(root: usize, child: usize) -> Self {
        StateId(vec![root, child])
    }

    #[inline]
    pub fn components(&self) -> &[usize] {
        &self.0
    }

    /// Tree level of the identified unit (a root has level one).
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Identifier of the root this unit belongs to.
    #[inline]
    pub fn root_id(&self) -> StateId {
        StateId(self.0.iter().take(1).copied().collect())
    }

    /// Identifier truncated to the given tree level.
    #[inline]
    pub fn truncated(&self, level: usize) -> StateId {
        StateId(self.0.iter().take(level).copied().collect())
    }

    /// Two identifiers describe the same composite object iff their first
    /// components agree.
    #[inline]
    pub fn same_composite_object(&self, other: &StateId) -> bool {
        self.0.first() == other.0.first()
    }
}

impl From<Vec<usize>> for StateId {
    fn from(components: Vec<usize>) -> Self {
        StateId(components)
    }
}

impl fmt::Debug for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "State{:?}", self.0)
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|c| c.to_string()).collect();
        write!(f, "({})", parts.join(", "))
    }
}

/// Event handler instance identity, dense from zero in activator order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct HandlerId(pub usize);

impl HandlerId {
    #[inline]
    pub fn new(index: usize) -> Self {
        HandlerId(index)
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Debug for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler({})", self.0)
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
