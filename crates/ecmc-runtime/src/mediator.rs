//! Mediator - the event loop of a run
//!
//! One step of the loop:
//! 1. Extract the active global state
//! 2. Ask the tag activator which handlers compute new events
//! 3. Extract their in-states from the global state
//! 4. Request the candidate event times and push them into the scheduler
//! 5. Pop the earliest event
//! 6. Resolve the out-state arguments and request the out-state. If the
//!    event is unconfirmed, the handler resends its event time, which is
//!    pushed in place of the popped event, and the loop returns to 5
//! 7. Commit the out-state
//! 8. Trash the events made stale by the commit
//! 9. Run the mediating action of the committing handler

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info, warn};

use ecmc_core::{EcmcError, EcmcResult, HandlerId, Node, StateId, Time};
use ecmc_events::{EventHandler, MediatingAction, OutStateArguments, OutStatePayload};
use ecmc_state::StateHandler;

use crate::activator::TagActivator;
use crate::config::{MediatorKind, RunConfig};
use crate::multi_process::MultiProcessMediator;
use crate::output::OutputSink;
use crate::rng::HandlerRng;
use crate::scheduler::{ScheduledEvent, Scheduler};

/// Result of a single step of the event loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Stopped,
}

/// Result of a complete run.
#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome {
    Stopped(RunSummary),
}

/// Statistics of a run.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RunSummary {
    /// Committed events
    pub events: u64,
    /// Committed events by tag
    pub events_per_tag: BTreeMap<String, u64>,
    /// Unconfirmed events by tag
    pub unconfirmed_per_tag: BTreeMap<String, u64>,
    /// Time the active units moved
    pub total_time: f64,
    /// Distance the active units travelled
    pub total_distance: f64,
    /// Time of the last committed event
    pub last_event_time: f64,
    /// Time stamp and velocity of the active unit after the last commit
    pub final_time_stamp: Option<f64>,
    pub final_velocity: Option<Vec<f64>>,
}

impl RunSummary {
    fn record(&mut self, tag: &str, time: Time, branches: &[Node]) {
        self.last_event_time = time.to_float();
        self.events += 1;
        *self.events_per_tag.entry(tag.to_string()).or_default() += 1;

        let active = branches
            .iter()
            .flat_map(|branch| branch.leaves())
            .find_map(|leaf| Some((leaf.unit.velocity.as_ref()?, leaf.unit.time_stamp?)));
        if let Some((velocity, time_stamp)) = active {
            let time_stamp = time_stamp.to_float();
            if let (Some(last_stamp), Some(last_velocity)) = (self.final_time_stamp, &self.final_velocity) {
                let elapsed = time_stamp - last_stamp;
                if elapsed > 0.0 {
                    let speed = last_velocity.iter().map(|v| v * v).sum::<f64>().sqrt();
                    self.total_time += elapsed;
                    self.total_distance += speed * elapsed;
                }
            }
            self.final_time_stamp = Some(time_stamp);
            self.final_velocity = Some(velocity.clone());
        }
    }

    /// Committed events of the handlers with the given tag.
    pub fn events_of(&self, tag: &str) -> u64 {
        self.events_per_tag.get(tag).copied().unwrap_or(0)
    }

    pub fn unconfirmed_of(&self, tag: &str) -> u64 {
        self.unconfirmed_per_tag.get(tag).copied().unwrap_or(0)
    }
}

/// Event loop driver.
pub trait Mediator {
    /// Run one step of the event loop.
    fn step(&mut self) -> EcmcResult<StepOutcome>;

    /// Earliest event of the last step.
    fn last_event(&self) -> Option<ScheduledEvent>;

    fn summary(&self) -> &RunSummary;

    /// Copy of the full global state.
    fn global_state(&self) -> Vec<Node>;

    /// Release the resources of the run and report its summary.
    fn post_run(&mut self) -> EcmcResult<RunSummary>;

    /// Step until a handler ends the run.
    fn run(&mut self) -> EcmcResult<RunOutcome> {
        while self.step()? == StepOutcome::Continue {}
        Ok(RunOutcome::Stopped(self.post_run()?))
    }
}

/// Build the mediator selected by the run configuration.
pub fn build_mediator(
    config: &RunConfig,
    state: Box<dyn StateHandler>,
    activator: TagActivator,
    sink: Box<dyn OutputSink>,
) -> EcmcResult<Box<dyn Mediator>> {
    config.validate()?;
    let scheduler = config.scheduler.build(config.warn_on_equal_event_times);
    Ok(match config.mediator {
        MediatorKind::SingleProcess => Box::new(SingleProcessMediator::new(
            state, activator, scheduler, sink, config.seed,
        )?),
        MediatorKind::MultiProcess { cores } => Box::new(MultiProcessMediator::new(
            state, activator, scheduler, sink, config.seed, cores,
        )?),
    })
}

/// State shared by the single-process and the multi-process mediator.
pub(crate) struct MediatorCore {
    pub(crate) state: Box<dyn StateHandler>,
    pub(crate) activator: TagActivator,
    pub(crate) scheduler: Box<dyn Scheduler>,
    sink: Box<dyn OutputSink>,
    active_global_state: Vec<Node>,
    preceding: Option<HandlerId>,
    pub(crate) last_event: Option<ScheduledEvent>,
    pub(crate) summary: RunSummary,
    pub(crate) stopped: bool,
}

impl MediatorCore {
    pub(crate) fn new(
        state: Box<dyn StateHandler>,
        mut activator: TagActivator,
        scheduler: Box<dyn Scheduler>,
        sink: Box<dyn OutputSink>,
    ) -> EcmcResult<Self> {
        let mut used = Vec::new();
        for descriptor in activator.descriptors() {
            if let Some(output) = descriptor.mediating_action.output() {
                if !sink.outputs().contains(output) {
                    return Err(EcmcError::configuration(format!(
                        "{} writes to the output '{}', which the output sink does not provide",
                        descriptor.name, output
                    )));
                }
                used.push(output.to_string());
            }
        }
        for output in sink.outputs() {
            if !used.contains(output) {
                warn!(output = %output, "Output is not used by any event handler");
            }
        }

        activator.initialize(&state.extract_global_state())?;
        Ok(MediatorCore {
            state,
            activator,
            scheduler,
            sink,
            active_global_state: Vec::new(),
            preceding: None,
            last_event: None,
            summary: RunSummary::default(),
            stopped: false,
        })
    }

    pub(crate) fn ensure_running(&self) -> EcmcResult<()> {
        if self.stopped {
            return Err(EcmcError::mediator("the run has already stopped"));
        }
        Ok(())
    }

    /// Steps 1 to 3: handlers to run with their extracted in-states.
    pub(crate) fn handlers_to_run(&mut self) -> EcmcResult<Vec<(HandlerId, Option<Vec<Node>>)>> {
        self.active_global_state = self.state.extract_active_global_state()?;
        self.activator
            .get_event_handlers_to_run(&self.active_global_state, self.preceding)?
            .into_iter()
            .map(|(handler, identifiers)| -> EcmcResult<_> {
                let in_state = match identifiers {
                    Some(identifiers) => Some(self.state.extract_all(&identifiers)?),
                    None => None,
                };
                Ok((handler, in_state))
            })
            .collect()
    }

    /// Step 6: the arguments the payload of an event asks for.
    pub(crate) fn out_state_arguments(
        &self,
        handler: HandlerId,
        payload: OutStatePayload,
    ) -> EcmcResult<OutStateArguments> {
        Ok(match payload {
            OutStatePayload::Empty => OutStateArguments::Empty,
            OutStatePayload::ActiveGlobalState => {
                OutStateArguments::ActiveGlobalState(self.active_global_state.clone())
            }
            OutStatePayload::ActiveAndNewIdentifiers(identifiers) => OutStateArguments::ActiveAndNew {
                active: self.active_global_state.clone(),
                new_active: self.state.extract_all(&identifiers)?,
            },
            OutStatePayload::TargetCell(cell) => {
                let occupants: Vec<StateId> = self.activator.get_info_internal_state(handler, cell)?;
                let occupant = match occupants.first() {
                    Some(identifier) => Some(self.state.extract_from_global_state(identifier)?),
                    None => None,
                };
                OutStateArguments::TargetOccupant(occupant)
            }
            OutStatePayload::Identifier(identifier) => {
                OutStateArguments::Branch(self.state.extract_from_global_state(&identifier)?)
            }
        })
    }

    /// Step 6 for an unconfirmed event: replace it by the resent event time.
    ///
    /// The global state and the tag activator are left untouched.
    pub(crate) fn reschedule(&mut self, event: ScheduledEvent, resent: Time) {
        let tag = self.activator.tag(event.handler);
        debug!(handler = %event.handler, tag = %tag, time = %event.time, resent = %resent, "Event unconfirmed");
        *self.summary.unconfirmed_per_tag.entry(tag.to_string()).or_default() += 1;
        self.scheduler.trash_event(event.handler);
        self.scheduler.push_event(resent, event.handler);
    }

    /// Steps 7 to 9. Returns the outcome and the trashed handlers.
    pub(crate) fn commit(
        &mut self,
        event: ScheduledEvent,
        out_state: Vec<Node>,
    ) -> EcmcResult<(StepOutcome, Vec<HandlerId>)> {
        let tag = self.activator.tag(event.handler).to_string();
        self.state.insert_into_global_state(&out_state)?;
        debug!(handler = %event.handler, tag = %tag, time = %event.time, "Committed event");
        self.summary.record(&tag, event.time, &out_state);

        let trashed = self.activator.get_trashable_events(event.handler)?;
        for &handler in &trashed {
            self.scheduler.trash_event(handler);
        }
        self.preceding = Some(event.handler);
        self.last_event = Some(event);

        let outcome = match self.activator.descriptor(event.handler).mediating_action.clone() {
            MediatingAction::None => StepOutcome::Continue,
            MediatingAction::Sample { output } => {
                self.sink.write(&output, event.time, &self.state.extract_global_state())?;
                StepOutcome::Continue
            }
            MediatingAction::EndOfRun { output } => {
                if let Some(output) = output {
                    self.sink.write(&output, event.time, &self.state.extract_global_state())?;
                }
                self.stopped = true;
                StepOutcome::Stopped
            }
        };
        Ok((outcome, trashed))
    }

    pub(crate) fn post_run(&mut self) -> EcmcResult<RunSummary> {
        self.sink.flush()?;
        let summary = &self.summary;
        info!(
            events = summary.events,
            total_time = summary.total_time,
            total_distance = summary.total_distance,
            last_event_time = summary.last_event_time,
            "Run finished"
        );
        for (tag, events) in &summary.events_per_tag {
            info!(tag = %tag, events, "Committed events");
        }
        for (tag, events) in &summary.unconfirmed_per_tag {
            info!(tag = %tag, events, "Unconfirmed events");
        }
        Ok(summary.clone())
    }
}

struct HandlerSlot {
    handler: Box<dyn EventHandler>,
    rng: HandlerRng,
    payload: Option<OutStatePayload>,
}

/// Mediator that runs every handler call on the calling thread.
pub struct SingleProcessMediator {
    core: MediatorCore,
    handlers: Vec<HandlerSlot>,
}

impl SingleProcessMediator {
    pub fn new(
        state: Box<dyn StateHandler>,
        activator: TagActivator,
        scheduler: Box<dyn Scheduler>,
        sink: Box<dyn OutputSink>,
        seed: u64,
    ) -> EcmcResult<Self> {
        let handlers = activator
            .event_handlers()
            .into_iter()
            .enumerate()
            .map(|(index, handler)| HandlerSlot {
                handler,
                rng: HandlerRng::new(seed, HandlerId(index)),
                payload: None,
            })
            .collect();
        let core = MediatorCore::new(state, activator, scheduler, sink)?;
        Ok(SingleProcessMediator { core, handlers })
    }
}

impl Mediator for SingleProcessMediator {
    fn step(&mut self) -> EcmcResult<StepOutcome> {
        self.core.ensure_running()?;
        for (handler, in_state) in self.core.handlers_to_run()? {
            let slot = &mut self.handlers[handler.index()];
            let reply = slot.handler.send_event_time(in_state, slot.rng.event_time())?;
            slot.payload = Some(reply.payload);
            self.core.scheduler.push_event(reply.time, handler);
        }

        let (event, out_state) = loop {
            let event = self.core.scheduler.pop_minimum()?;
            let payload = self.handlers[event.handler.index()]
                .payload
                .take()
                .ok_or_else(|| EcmcError::mediator(format!("{} has no pending event", event.handler)))?;
            let arguments = self.core.out_state_arguments(event.handler, payload)?;
            let slot = &mut self.handlers[event.handler.index()];
            if let Some(out_state) = slot.handler.send_out_state(arguments, slot.rng.out_state())? {
                break (event, out_state);
            }
            let reply = slot.handler.resend_event_time(slot.rng.event_time())?;
            slot.payload = Some(reply.payload);
            self.core.reschedule(event, reply.time);
        };

        let (outcome, trashed) = self.core.commit(event, out_state)?;
        for handler in trashed {
            self.handlers[handler.index()].payload = None;
        }
        Ok(outcome)
    }

    fn last_event(&self) -> Option<ScheduledEvent> {
        self.core.last_event
    }

    fn summary(&self) -> &RunSummary {
        &self.core.summary
    }

    fn global_state(&self) -> Vec<Node> {
        self.core.state.extract_global_state()
    }

    fn post_run(&mut self) -> EcmcResult<RunSummary> {
        self.core.post_run()
    }
}
