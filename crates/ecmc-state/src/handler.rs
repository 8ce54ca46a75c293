//! State handler interface

use ecmc_core::{EcmcResult, Node, StateId};

/// Storage of the global state as seen by the mediators.
///
/// Extracted branches are copies. Changes only reach the global state
/// through [`StateHandler::insert_into_global_state`].
pub trait StateHandler: Send {
    /// Branches of all independent active units.
    fn extract_active_global_state(&self) -> EcmcResult<Vec<Node>>;

    /// Branch from the root of `identifier` down to the identified unit,
    /// including the whole subtree below it.
    fn extract_from_global_state(&self, identifier: &StateId) -> EcmcResult<Node>;

    /// Write positions, velocities and time stamps of every unit in the
    /// branches back into the global state.
    fn insert_into_global_state(&mut self, branches: &[Node]) -> EcmcResult<()>;

    /// Copy of the full global state.
    fn extract_global_state(&self) -> Vec<Node>;

    /// Extract several branches in the given order.
    fn extract_all(&self, identifiers: &[StateId]) -> EcmcResult<Vec<Node>> {
        identifiers
            .iter()
            .map(|identifier| self.extract_from_global_state(identifier))
            .collect()
    }
}
