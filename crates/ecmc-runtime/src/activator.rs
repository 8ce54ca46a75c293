//! Tag activator - which handlers compute new events after a commit
//!
//! Every tagger owns a pool of handler instances. After an event of a tag is
//! committed, the handlers of the tags it creates receive new in-states and
//! the pending events of the tags it trashes are dropped. Handler instances
//! cycle between the running and the not-running pool of their tagger.

use tracing::debug;

use ecmc_core::{Cell, EcmcError, EcmcResult, HandlerId, Node, StateId};
use ecmc_events::{EventHandler, HandlerDescriptor, HandlerFactory, HandlerRole};

use crate::occupancy::SingleActiveCellOccupancy;
use crate::tagger::{Tagger, TaggerConfig};

/// Handler with the in-state identifiers it should compute an event time for.
pub type HandlerToRun = (HandlerId, Option<Vec<StateId>>);

pub struct TagActivator {
    taggers: Vec<Tagger>,
    factories: Vec<HandlerFactory>,
    internal_state_labels: Vec<String>,
    internal_states: Vec<SingleActiveCellOccupancy>,
    descriptors: Vec<HandlerDescriptor>,
    handler_tagger: Vec<usize>,
    running: Vec<Vec<HandlerId>>,
    not_running: Vec<Vec<HandlerId>>,
    create: Vec<Vec<usize>>,
    trash: Vec<Vec<usize>>,
    activate: Vec<Vec<usize>>,
    deactivate: Vec<Vec<usize>>,
    start_of_run: HandlerId,
    initialized: bool,
    started: bool,
}

fn resolve_tags(tags: &[String], owner: &str, references: &[String]) -> EcmcResult<Vec<usize>> {
    references
        .iter()
        .map(|reference| {
            tags.iter().position(|tag| tag == reference).ok_or_else(|| {
                EcmcError::configuration(format!(
                    "tagger '{}' refers to the unknown tag '{}'",
                    owner, reference
                ))
            })
        })
        .collect()
}

impl TagActivator {
    pub fn new(
        configs: Vec<TaggerConfig>,
        internal_states: Vec<(String, SingleActiveCellOccupancy)>,
    ) -> EcmcResult<Self> {
        let tags: Vec<String> = configs.iter().map(|config| config.tag.clone()).collect();
        for (index, tag) in tags.iter().enumerate() {
            if tags[..index].contains(tag) {
                return Err(EcmcError::configuration(format!("tag '{}' is used twice", tag)));
            }
        }
        for (index, (label, _)) in internal_states.iter().enumerate() {
            if internal_states[..index].iter().any(|(other, _)| other == label) {
                return Err(EcmcError::configuration(format!(
                    "internal state '{}' is used twice",
                    label
                )));
            }
        }

        let mut taggers = Vec::with_capacity(configs.len());
        let mut factories = Vec::with_capacity(configs.len());
        let mut descriptors = Vec::new();
        let mut handler_tagger = Vec::new();
        let mut not_running = Vec::with_capacity(configs.len());
        let mut create = Vec::with_capacity(configs.len());
        let mut trash = Vec::with_capacity(configs.len());
        let mut activate = Vec::with_capacity(configs.len());
        let mut deactivate = Vec::with_capacity(configs.len());
        let mut start_of_run = None;

        for (tagger_index, config) in configs.into_iter().enumerate() {
            if config.number_event_handlers == 0 {
                return Err(EcmcError::configuration(format!(
                    "tagger '{}' needs at least one event handler",
                    config.tag
                )));
            }
            let descriptor = (config.factory)().descriptor();
            if let Some(role) = config.kind.required_role() {
                if descriptor.role != role {
                    return Err(EcmcError::configuration(format!(
                        "tagger '{}' of kind {:?} cannot drive {}",
                        config.tag, config.kind, descriptor.name
                    )));
                }
            }
            if descriptor.role == HandlerRole::StartOfRun {
                if start_of_run.is_some() || config.number_event_handlers != 1 {
                    return Err(EcmcError::configuration(
                        "exactly one start-of-run event handler is required",
                    ));
                }
                start_of_run = Some(HandlerId(descriptors.len()));
            }

            let first = descriptors.len();
            for _ in 0..config.number_event_handlers {
                descriptors.push(descriptor.clone());
                handler_tagger.push(tagger_index);
            }
            // Pools pop from the back, so the lowest identifier runs first.
            not_running.push((first..descriptors.len()).rev().map(HandlerId).collect());

            create.push(resolve_tags(&tags, &config.tag, &config.create)?);
            trash.push(resolve_tags(&tags, &config.tag, &config.trash)?);
            activate.push(resolve_tags(&tags, &config.tag, &config.activate)?);
            deactivate.push(resolve_tags(&tags, &config.tag, &config.deactivate)?);
            factories.push(config.factory);
            taggers.push(Tagger::new(config.tag, config.kind));
        }

        let start_of_run = start_of_run.ok_or_else(|| {
            EcmcError::configuration("exactly one start-of-run event handler is required")
        })?;

        let (internal_state_labels, internal_states): (Vec<String>, Vec<SingleActiveCellOccupancy>) =
            internal_states.into_iter().unzip();
        Ok(TagActivator {
            running: vec![Vec::new(); taggers.len()],
            taggers,
            factories,
            internal_state_labels,
            internal_states,
            descriptors,
            handler_tagger,
            not_running,
            create,
            trash,
            activate,
            deactivate,
            start_of_run,
            initialized: false,
            started: false,
        })
    }

    /// Fresh handler instances, indexed by `HandlerId`.
    pub fn event_handlers(&self) -> Vec<Box<dyn EventHandler>> {
        self.handler_tagger
            .iter()
            .map(|&tagger| (self.factories[tagger])())
            .collect()
    }

    pub fn number_of_event_handlers(&self) -> usize {
        self.descriptors.len()
    }

    pub fn descriptor(&self, handler: HandlerId) -> &HandlerDescriptor {
        &self.descriptors[handler.index()]
    }

    pub fn descriptors(&self) -> &[HandlerDescriptor] {
        &self.descriptors
    }

    /// Tag of the tagger that owns the handler.
    pub fn tag(&self, handler: HandlerId) -> &str {
        self.taggers[self.handler_tagger[handler.index()]].tag()
    }

    pub fn initialize(&mut self, global_state: &[Node]) -> EcmcResult<()> {
        for internal_state in &mut self.internal_states {
            internal_state.initialize(global_state)?;
        }
        let labels: Vec<&str> = self.internal_state_labels.iter().map(String::as_str).collect();
        for tagger in &mut self.taggers {
            tagger.initialize_with_internal_states(global_state, &labels)?;
        }
        self.initialized = true;
        Ok(())
    }

    /// Handlers that compute new event times after the event of `preceding`.
    ///
    /// Without a preceding handler the run starts and only the start-of-run
    /// handler is scheduled.
    pub fn get_event_handlers_to_run(
        &mut self,
        active_global_state: &[Node],
        preceding: Option<HandlerId>,
    ) -> EcmcResult<Vec<HandlerToRun>> {
        if !self.initialized {
            return Err(EcmcError::Uninitialized {
                component: "TagActivator".to_string(),
            });
        }
        let to_run = match preceding {
            None => {
                if self.started {
                    return Err(EcmcError::TagActivator(
                        "the run was already started, a preceding event handler is required".to_string(),
                    ));
                }
                self.started = true;
                let tagger = self.handler_tagger[self.start_of_run.index()];
                self.apply_activation(tagger);
                self.allocate_for(tagger, active_global_state)?
            }
            Some(handler) => {
                if !self.started {
                    return Err(EcmcError::TagActivator(format!(
                        "{} cannot precede the start of the run",
                        handler
                    )));
                }
                let tagger = self.tagger_index(handler)?;
                self.apply_activation(tagger);
                for internal_state in &mut self.internal_states {
                    internal_state.update(active_global_state)?;
                }
                let mut to_run = Vec::new();
                for created in self.create[tagger].clone() {
                    to_run.extend(self.allocate_for(created, active_global_state)?);
                }
                to_run
            }
        };
        debug!(handlers = to_run.len(), preceding = ?preceding, "Event handlers to run");
        Ok(to_run)
    }

    /// Handlers whose pending events are stale after `committed` was
    /// committed. They return to their not-running pools, and so does
    /// `committed` itself.
    pub fn get_trashable_events(&mut self, committed: HandlerId) -> EcmcResult<Vec<HandlerId>> {
        let tagger = self.tagger_index(committed)?;
        let mut trashed = Vec::new();
        for &trashed_tagger in &self.trash[tagger] {
            let released: Vec<HandlerId> = self.running[trashed_tagger].drain(..).collect();
            self.not_running[trashed_tagger].extend(released.iter().rev().copied());
            trashed.extend(released);
        }
        if let Some(position) = self.running[tagger].iter().position(|&h| h == committed) {
            self.running[tagger].remove(position);
            self.not_running[tagger].push(committed);
        }
        Ok(trashed)
    }

    /// Occupants of `cell` in the internal state of the handler's tagger.
    pub fn get_info_internal_state(&self, handler: HandlerId, cell: Cell) -> EcmcResult<Vec<StateId>> {
        let tagger = &self.taggers[self.tagger_index(handler)?];
        let internal_state = tagger
            .internal_state()
            .and_then(|index| self.internal_states.get(index))
            .ok_or_else(|| {
                EcmcError::TagActivator(format!("tagger '{}' has no internal state", tagger.tag()))
            })?;
        Ok(internal_state.occupant(cell)?.into_iter().cloned().collect())
    }

    fn tagger_index(&self, handler: HandlerId) -> EcmcResult<usize> {
        self.handler_tagger
            .get(handler.index())
            .copied()
            .ok_or_else(|| EcmcError::TagActivator(format!("unknown event handler {}", handler)))
    }

    fn apply_activation(&mut self, tagger: usize) {
        for &activated in &self.activate[tagger] {
            self.taggers[activated].activate();
        }
        for &deactivated in &self.deactivate[tagger] {
            self.taggers[deactivated].deactivate();
        }
    }

    fn allocate_for(&mut self, tagger: usize, active_global_state: &[Node]) -> EcmcResult<Vec<HandlerToRun>> {
        let identifiers = self.taggers[tagger].yield_identifiers(active_global_state, &self.internal_states)?;
        let mut to_run = Vec::with_capacity(identifiers.len());
        for in_state in identifiers {
            let handler = self.not_running[tagger].pop().ok_or_else(|| {
                EcmcError::TagActivator(format!(
                    "no idle event handler left for tag '{}'; increase number_event_handlers",
                    self.taggers[tagger].tag()
                ))
            })?;
            self.running[tagger].push(handler);
            to_run.push((handler, in_state));
        }
        Ok(to_run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use ecmc_core::{Context, CuboidPeriodicCells, Time, Unit};
    use ecmc_events::{
        handler_factory, EventTimeReply, MediatingAction, OutStateArguments, OutStatePayload,
    };
    use ecmc_sampling::UniformDraw;

    use crate::tagger::TaggerKind;

    #[derive(Clone)]
    struct RecordingHandler {
        role: HandlerRole,
    }

    impl EventHandler for RecordingHandler {
        fn descriptor(&self) -> HandlerDescriptor {
            HandlerDescriptor {
                name: "RecordingHandler",
                role: self.role,
                mediating_action: MediatingAction::None,
            }
        }

        fn send_event_time(
            &mut self,
            _in_state: Option<Vec<Node>>,
            _rng: &mut dyn UniformDraw,
        ) -> EcmcResult<EventTimeReply> {
            Ok(EventTimeReply::new(Time::INF, OutStatePayload::Empty))
        }

        fn send_out_state(
            &mut self,
            _arguments: OutStateArguments,
            _rng: &mut dyn UniformDraw,
        ) -> EcmcResult<Option<Vec<Node>>> {
            Ok(None)
        }
    }

    fn factory(role: HandlerRole) -> HandlerFactory {
        handler_factory(RecordingHandler { role })
    }

    fn tagger(tag: &str, role: HandlerRole) -> TaggerConfig {
        TaggerConfig::new(tag, TaggerKind::NoInState, factory(role))
    }

    fn round_trip_activator() -> TagActivator {
        let configs = vec![
            tagger("start", HandlerRole::StartOfRun).creates(&["A", "C"]),
            tagger("A", HandlerRole::Pair).creates(&["B"]).trashes(&["C"]),
            tagger("B", HandlerRole::Pair),
            tagger("C", HandlerRole::Pair).with_event_handlers(2),
        ];
        let mut activator = TagActivator::new(configs, Vec::new()).unwrap();
        activator.initialize(&[]).unwrap();
        activator
    }

    #[test]
    fn test_handler_identifiers_follow_tagger_order() {
        let activator = round_trip_activator();
        assert_eq!(activator.number_of_event_handlers(), 5);
        assert_eq!(activator.tag(HandlerId(0)), "start");
        assert_eq!(activator.tag(HandlerId(3)), "C");
        assert_eq!(activator.tag(HandlerId(4)), "C");
        assert_eq!(activator.event_handlers().len(), 5);
    }

    #[test]
    fn test_create_and_trash_round_trip() {
        let mut activator = round_trip_activator();
        let start = activator.get_event_handlers_to_run(&[], None).unwrap();
        assert_eq!(start, vec![(HandlerId(0), None)]);

        let after_start = activator.get_event_handlers_to_run(&[], Some(HandlerId(0))).unwrap();
        assert_eq!(after_start, vec![(HandlerId(1), None), (HandlerId(3), None)]);
        assert!(activator.get_trashable_events(HandlerId(0)).unwrap().is_empty());

        let after_a = activator.get_event_handlers_to_run(&[], Some(HandlerId(1))).unwrap();
        assert_eq!(after_a, vec![(HandlerId(2), None)]);
        assert_eq!(activator.get_trashable_events(HandlerId(1)).unwrap(), vec![HandlerId(3)]);
    }

    #[test]
    fn test_released_handlers_are_reused() {
        let mut activator = round_trip_activator();
        activator.get_event_handlers_to_run(&[], None).unwrap();
        activator.get_event_handlers_to_run(&[], Some(HandlerId(0))).unwrap();
        activator.get_trashable_events(HandlerId(0)).unwrap();
        activator.get_event_handlers_to_run(&[], Some(HandlerId(1))).unwrap();
        activator.get_trashable_events(HandlerId(1)).unwrap();

        // A was released as the committed handler, C through the trash list.
        let again = activator.get_event_handlers_to_run(&[], Some(HandlerId(0))).unwrap();
        assert_eq!(again, vec![(HandlerId(1), None), (HandlerId(3), None)]);
    }

    #[test]
    fn test_empty_pool_is_an_error() {
        let mut activator = round_trip_activator();
        activator.get_event_handlers_to_run(&[], None).unwrap();
        activator.get_event_handlers_to_run(&[], Some(HandlerId(0))).unwrap();
        let result = activator.get_event_handlers_to_run(&[], Some(HandlerId(0)));
        assert!(matches!(result, Err(EcmcError::TagActivator(_))));
    }

    #[test]
    fn test_deactivated_tagger_yields_nothing() {
        let configs = vec![
            tagger("start", HandlerRole::StartOfRun).creates(&["pairs"]).deactivates(&["pairs"]),
            tagger("pairs", HandlerRole::Pair).activates(&["pairs"]).creates(&["pairs"]),
        ];
        let mut activator = TagActivator::new(configs, Vec::new()).unwrap();
        activator.initialize(&[]).unwrap();
        activator.get_event_handlers_to_run(&[], None).unwrap();
        assert!(activator.get_event_handlers_to_run(&[], Some(HandlerId(0))).unwrap().is_empty());
    }

    #[test]
    fn test_configuration_errors() {
        let missing_start = vec![tagger("pairs", HandlerRole::Pair)];
        assert!(matches!(
            TagActivator::new(missing_start, Vec::new()),
            Err(EcmcError::Configuration(_))
        ));

        let unknown_tag = vec![tagger("start", HandlerRole::StartOfRun).creates(&["nowhere"])];
        assert!(matches!(
            TagActivator::new(unknown_tag, Vec::new()),
            Err(EcmcError::Configuration(_))
        ));

        let duplicated = vec![
            tagger("start", HandlerRole::StartOfRun),
            tagger("start", HandlerRole::Pair),
        ];
        assert!(matches!(
            TagActivator::new(duplicated, Vec::new()),
            Err(EcmcError::Configuration(_))
        ));

        let wrong_role = vec![
            tagger("start", HandlerRole::StartOfRun),
            TaggerConfig::new(
                "cell_veto",
                TaggerKind::CellVeto {
                    internal_state: "occupancy".to_string(),
                },
                factory(HandlerRole::Pair),
            ),
        ];
        assert!(matches!(
            TagActivator::new(wrong_role, Vec::new()),
            Err(EcmcError::Configuration(_))
        ));
    }

    #[test]
    fn test_use_before_initialization() {
        let mut activator =
            TagActivator::new(vec![tagger("start", HandlerRole::StartOfRun)], Vec::new()).unwrap();
        assert!(matches!(
            activator.get_event_handlers_to_run(&[], None),
            Err(EcmcError::Uninitialized { .. })
        ));
    }

    #[test]
    fn test_info_internal_state() {
        let context = Context::hypercubic(2, 1.0, 1.0).unwrap();
        let cells = Arc::new(CuboidPeriodicCells::new(&context, &[4], 1).unwrap());
        let occupancy = SingleActiveCellOccupancy::new(&context, cells.clone(), 1, None).unwrap();
        let configs = vec![
            tagger("start", HandlerRole::StartOfRun),
            TaggerConfig::new(
                "cell_veto",
                TaggerKind::CellVeto {
                    internal_state: "occupancy".to_string(),
                },
                factory(HandlerRole::CellVeto),
            ),
        ];
        let mut activator = TagActivator::new(configs, vec![("occupancy".to_string(), occupancy)]).unwrap();
        let global = vec![Node::new(Unit::new(StateId::root(0), vec![0.6, 0.1]), 1.0)];
        activator.initialize(&global).unwrap();

        let occupied = cells.position_to_cell(&[0.6, 0.1]);
        assert_eq!(
            activator.get_info_internal_state(HandlerId(1), occupied).unwrap(),
            vec![StateId::root(0)]
        );
        assert!(activator.get_info_internal_state(HandlerId(1), cells.zero_cell()).unwrap().is_empty());
        assert!(matches!(
            activator.get_info_internal_state(HandlerId(0), occupied),
            Err(EcmcError::TagActivator(_))
        ));
    }
}
