//! Capabilities shared by the concrete event handlers
//!
//! Handlers compose these instead of inheriting from a base handler. Every
//! capability with behavior that depends on the simulation box is a trait
//! with default methods, implemented for every [`HandlerContext`].

use ecmc_core::{
    leaf_paths, node_at, node_at_mut, Context, EcmcError, EcmcResult, Node, NodePath, StateId,
    Time, Unit,
};

/// Velocity entries below this magnitude count as zero after a commit.
const ZERO_VELOCITY_TOLERANCE: f64 = 1e-6;

/// Access to the immutable simulation context.
pub trait HandlerContext {
    fn context(&self) -> &Context;
}

/// In-state stored between `send_event_time` and `send_out_state`.
#[derive(Clone, Debug, Default)]
pub struct StoredState {
    pub branches: Vec<Node>,
    event_time: Option<Time>,
}

impl StoredState {
    pub fn store(&mut self, branches: Vec<Node>) {
        self.branches = branches;
        self.event_time = None;
    }

    pub fn set_event_time(&mut self, event_time: Time) {
        self.event_time = Some(event_time);
    }

    /// Event time of the pending out-state request, clearing it.
    ///
    /// Fails if no event time was computed since the last out-state.
    pub fn take_event_time(&mut self, handler: &str) -> EcmcResult<Time> {
        self.event_time.take().ok_or_else(|| {
            EcmcError::mediator(format!(
                "{} was asked for an out-state without a preceding event time",
                handler
            ))
        })
    }

    pub fn take_branches(&mut self) -> Vec<Node> {
        std::mem::take(&mut self.branches)
    }
}

/// Node at a path that is known to exist.
pub fn node<'a>(branches: &'a [Node], path: &NodePath) -> EcmcResult<&'a Node> {
    node_at(branches, path)
        .ok_or_else(|| EcmcError::precondition(format!("no node at {:?}", path)))
}

pub fn node_mut<'a>(branches: &'a mut [Node], path: &NodePath) -> EcmcResult<&'a mut Node> {
    node_at_mut(branches, path)
        .ok_or_else(|| EcmcError::precondition(format!("no node at {:?}", path)))
}

/// Leaf paths of an in-state.
pub trait LeafExtraction {
    fn extract_leaves(&self, branches: &[Node]) -> Vec<NodePath> {
        leaf_paths(branches)
    }

    /// Leaf paths, which must number exactly `expected`.
    fn extract_exact_leaves(&self, branches: &[Node], expected: usize) -> EcmcResult<Vec<NodePath>> {
        let leaves = self.extract_leaves(branches);
        if leaves.len() != expected {
            return Err(EcmcError::precondition(format!(
                "expected {} leaf units in the in-state, got {}",
                expected,
                leaves.len()
            )));
        }
        Ok(leaves)
    }
}

impl<T: ?Sized> LeafExtraction for T {}

/// The unique active leaf of an in-state.
#[derive(Clone, Debug, PartialEq)]
pub struct ActiveLeaf {
    pub path: NodePath,
    pub identifier: StateId,
    pub direction: usize,
    pub speed: f64,
    pub time_stamp: Time,
}

pub trait SingleActiveLeaf: LeafExtraction {
    /// Locate the single active leaf among `leaves`.
    ///
    /// Its velocity must point along the positive direction of one axis.
    fn single_active_leaf(&self, branches: &[Node], leaves: &[NodePath]) -> EcmcResult<ActiveLeaf> {
        let mut active = None;
        for path in leaves {
            let unit = &node(branches, path)?.unit;
            if let (Some(velocity), Some(time_stamp)) = (&unit.velocity, unit.time_stamp) {
                if active.is_some() {
                    return Err(EcmcError::precondition(
                        "more than one active leaf unit in the in-state",
                    ));
                }
                active = Some((path, unit, velocity, time_stamp));
            }
        }
        let (path, unit, velocity, time_stamp) = active
            .ok_or_else(|| EcmcError::precondition("no active leaf unit in the in-state"))?;
        let (direction, speed) = axis_velocity(unit, velocity)?;
        Ok(ActiveLeaf {
            path: path.clone(),
            identifier: unit.identifier.clone(),
            direction,
            speed,
            time_stamp,
        })
    }
}

impl<T: ?Sized> SingleActiveLeaf for T {}

fn axis_velocity(unit: &Unit, velocity: &[f64]) -> EcmcResult<(usize, f64)> {
    let mut moving = velocity.iter().enumerate().filter(|(_, v)| **v != 0.0);
    match (moving.next(), moving.next()) {
        (Some((direction, &speed)), None) if speed > 0.0 => Ok((direction, speed)),
        _ => Err(EcmcError::precondition(format!(
            "unit {} must move along the positive direction of one axis, velocity {:?}",
            unit.identifier, velocity
        ))),
    }
}

/// Advance moving units to the event time.
pub trait TimeSlicing: HandlerContext {
    /// Move every active unit of the branches to `event_time` and update its
    /// time stamp.
    fn time_slice_all(&self, branches: &mut [Node], event_time: Time) {
        let context = self.context();
        for branch in branches.iter_mut() {
            branch.for_each_unit_mut(&mut |unit| time_slice_unit(context, unit, event_time));
        }
    }
}

impl<T: HandlerContext + ?Sized> TimeSlicing for T {}

fn time_slice_unit(context: &Context, unit: &mut Unit, event_time: Time) {
    if let (Some(velocity), Some(time_stamp)) = (&unit.velocity, unit.time_stamp) {
        let elapsed = event_time - time_stamp;
        for (entry, v) in unit.position.iter_mut().zip(velocity) {
            *entry += v * elapsed;
        }
        context.correct_position(&mut unit.position);
        unit.time_stamp = Some(event_time);
    }
}

/// Pending velocity changes of composite nodes, keyed by their path.
#[derive(Clone, Debug, Default)]
pub struct VelocityChanges {
    changes: Vec<(NodePath, Vec<f64>)>,
}

impl VelocityChanges {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, path: NodePath, change: &[f64], factor: f64) {
        match self.changes.iter_mut().find(|(p, _)| *p == path) {
            Some((_, total)) => {
                for (t, c) in total.iter_mut().zip(change) {
                    *t += c * factor;
                }
            }
            None => self
                .changes
                .push((path, change.iter().map(|c| c * factor).collect())),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Velocity transfer between leaves and the propagation of the change to the
/// composite ancestors.
pub trait VelocityExchange: TimeSlicing {
    /// Record `change` in the velocity of a leaf for all of its ancestors.
    ///
    /// An ancestor receives the change scaled by the weights of every node on
    /// the path from the leaf up to (not including) the ancestor.
    fn register_velocity_change_leaf(
        &self,
        changes: &mut VelocityChanges,
        branches: &[Node],
        leaf: &NodePath,
        change: &[f64],
    ) -> EcmcResult<()> {
        let ancestry = leaf.ancestry();
        let mut factor = 1.0;
        for pair in ancestry.windows(2).rev() {
            factor *= node(branches, &pair[1])?.weight;
            changes.add(pair[0].clone(), change, factor);
        }
        Ok(())
    }

    /// Apply the recorded changes to the composite nodes.
    ///
    /// A node without velocity starts moving at `event_time`; a moving node
    /// is time sliced first. A node whose velocity drops to zero stops.
    fn commit_non_leaf_velocity_changes(
        &self,
        changes: VelocityChanges,
        branches: &mut [Node],
        event_time: Time,
    ) -> EcmcResult<()> {
        let context = self.context();
        for (path, change) in changes.changes {
            let unit = &mut node_mut(branches, &path)?.unit;
            match unit.velocity.take() {
                None => {
                    unit.velocity = Some(change);
                    unit.time_stamp = Some(event_time);
                }
                Some(velocity) => {
                    unit.velocity = Some(velocity);
                    time_slice_unit(context, unit, event_time);
                    if let Some(velocity) = unit.velocity.as_mut() {
                        for (v, c) in velocity.iter_mut().zip(&change) {
                            *v += c;
                        }
                    }
                }
            }
            let stopped = unit
                .velocity
                .as_ref()
                .map_or(false, |v| v.iter().all(|e| e.abs() < ZERO_VELOCITY_TOLERANCE));
            if stopped {
                unit.velocity = None;
                unit.time_stamp = None;
            }
        }
        Ok(())
    }

    /// Move the velocity of the active leaf to the target leaf.
    ///
    /// Both leaves must already be time sliced to the event time.
    fn exchange_velocity(&self, branches: &mut [Node], active: &NodePath, target: &NodePath) -> EcmcResult<()> {
        let (velocity, time_stamp) = {
            let unit = &mut node_mut(branches, active)?.unit;
            match (unit.velocity.take(), unit.time_stamp.take()) {
                (Some(velocity), Some(time_stamp)) => (velocity, time_stamp),
                _ => {
                    return Err(EcmcError::precondition(format!(
                        "velocity exchange from inactive unit {}",
                        unit.identifier
                    )))
                }
            }
        };
        let target_unit = &mut node_mut(branches, target)?.unit;
        if target_unit.velocity.is_some() {
            return Err(EcmcError::precondition(format!(
                "velocity exchange into active unit {}",
                target_unit.identifier
            )));
        }
        target_unit.velocity = Some(velocity.clone());
        target_unit.time_stamp = Some(time_stamp);

        let negative: Vec<f64> = velocity.iter().map(|v| -v).collect();
        let mut changes = VelocityChanges::new();
        self.register_velocity_change_leaf(&mut changes, branches, active, &negative)?;
        self.register_velocity_change_leaf(&mut changes, branches, target, &velocity)?;
        self.commit_non_leaf_velocity_changes(changes, branches, time_stamp)
    }
}

impl<T: HandlerContext + ?Sized> VelocityExchange for T {}

#[cfg(test)]
mod tests {
    use super::*;

    struct Host(Context);

    impl HandlerContext for Host {
        fn context(&self) -> &Context {
            &self.0
        }
    }

    fn host() -> Host {
        Host(Context::hypercubic(2, 1.0, 1.0).unwrap())
    }

    fn point(index: usize, x: f64, active: bool) -> Node {
        let mut unit = Unit::new(StateId::root(index), vec![x, 0.5]);
        if active {
            unit = unit.with_velocity(vec![1.0, 0.0], Time::ZERO);
        }
        Node::new(unit, 1.0)
    }

    fn dumbbell(index: usize, active_leaf: Option<usize>) -> Node {
        let children = (0..2)
            .map(|j| {
                let unit = Unit::new(StateId::child(index, j), vec![0.1 + 0.1 * j as f64, 0.5]);
                if Some(j) == active_leaf {
                    unit.with_velocity(vec![1.0, 0.0], Time::ZERO)
                } else {
                    unit
                }
            })
            .collect();
        let mut root = Node::composite(Unit::new(StateId::root(index), vec![0.15, 0.5]), children);
        if active_leaf.is_some() {
            root.unit.velocity = Some(vec![0.5, 0.0]);
            root.unit.time_stamp = Some(Time::ZERO);
        }
        root
    }

    #[test]
    fn test_single_active_leaf() {
        let host = host();
        let branches = vec![point(0, 0.1, false), point(1, 0.2, true)];
        let leaves = host.extract_exact_leaves(&branches, 2).unwrap();
        let active = host.single_active_leaf(&branches, &leaves).unwrap();
        assert_eq!(active.identifier, StateId::root(1));
        assert_eq!(active.direction, 0);
        assert_eq!(active.speed, 1.0);
        assert!(host.extract_exact_leaves(&branches, 3).is_err());
    }

    #[test]
    fn test_two_active_leaves_is_precondition_error() {
        let host = host();
        let branches = vec![point(0, 0.1, true), point(1, 0.2, true)];
        let leaves = host.extract_leaves(&branches);
        assert!(matches!(
            host.single_active_leaf(&branches, &leaves),
            Err(EcmcError::Precondition(_))
        ));
    }

    #[test]
    fn test_time_slice_wraps_periodically() {
        let host = host();
        let mut branches = vec![point(0, 0.9, true), point(1, 0.2, false)];
        host.time_slice_all(&mut branches, Time::from_float(0.25));
        assert!((branches[0].unit.position[0] - 0.15).abs() < 1e-12);
        assert_eq!(branches[0].unit.time_stamp, Some(Time::from_float(0.25)));
        assert_eq!(branches[1].unit.position[0], 0.2);
        assert_eq!(branches[1].unit.time_stamp, None);
    }

    #[test]
    fn test_exchange_between_point_masses() {
        let host = host();
        let mut branches = vec![point(0, 0.1, true), point(1, 0.2, false)];
        let leaves = host.extract_leaves(&branches);
        host
            .exchange_velocity(&mut branches, &leaves[0], &leaves[1])
            .unwrap();
        assert!(!branches[0].unit.is_active());
        assert_eq!(branches[1].unit.velocity, Some(vec![1.0, 0.0]));
        assert_eq!(branches[1].unit.time_stamp, Some(Time::ZERO));
    }

    #[test]
    fn test_exchange_inside_composite_keeps_root_velocity() {
        let host = host();
        let mut branches = vec![dumbbell(0, Some(0))];
        let leaves = host.extract_leaves(&branches);
        host
            .exchange_velocity(&mut branches, &leaves[0], &leaves[1])
            .unwrap();
        assert_eq!(branches[0].unit.velocity, Some(vec![0.5, 0.0]));
        assert!(branches[0].children[1].unit.is_active());
    }

    #[test]
    fn test_exchange_between_composites_moves_root_velocity() {
        let host = host();
        let mut branches = vec![dumbbell(0, Some(1)), dumbbell(1, None)];
        let leaves = host.extract_leaves(&branches);
        host
            .exchange_velocity(&mut branches, &leaves[1], &leaves[2])
            .unwrap();
        assert!(!branches[0].unit.is_active());
        assert_eq!(branches[1].unit.velocity, Some(vec![0.5, 0.0]));
        assert_eq!(branches[1].unit.time_stamp, Some(Time::ZERO));
        assert!(branches[1].children[0].unit.is_active());
    }

    #[test]
    fn test_stored_state_requires_event_time() {
        let mut stored = StoredState::default();
        assert!(matches!(
            stored.take_event_time("handler"),
            Err(EcmcError::Mediator(_))
        ));
        stored.store(vec![point(0, 0.1, false)]);
        stored.set_event_time(Time::from_float(1.5));
        assert_eq!(stored.take_event_time("handler").unwrap(), Time::from_float(1.5));
        assert!(stored.take_event_time("handler").is_err());
        assert_eq!(stored.take_branches().len(), 1);
    }
}
