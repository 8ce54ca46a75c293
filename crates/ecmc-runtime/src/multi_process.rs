//! Multi-process mediator
//!
//! Every handler instance lives in its own worker thread together with its
//! random stream. The mediator talks to a worker through a start channel
//! (event time requests), a continue channel (out-state requests) and a
//! reply channel. A counting semaphore bounds the event time computations
//! that run at the same time to `cores - 1`, one core is left to the
//! mediator.
//!
//! Handlers whose out-state needs no arguments from the mediator may start
//! their out-state computation right after their event time arrived. Such a
//! speculative computation is drained if the event is trashed.
//!
//! An unconfirmed event sends a resend request over the start channel and
//! the resent event time replaces the popped event.
//!
//! Event times are pushed into the scheduler in activator order once every
//! reply of a round arrived, so the committed events are the same as with
//! the single-process mediator.

use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use ecmc_core::{EcmcError, EcmcResult, HandlerId, Node};
use ecmc_events::{EventHandler, EventTimeReply, OutStateArguments, OutStatePayload};
use ecmc_state::StateHandler;

use crate::activator::TagActivator;
use crate::mediator::{Mediator, MediatorCore, RunSummary, StepOutcome};
use crate::output::OutputSink;
use crate::rng::HandlerRng;
use crate::scheduler::{ScheduledEvent, Scheduler};

// ============================================================================
// Semaphore
// ============================================================================

/// Counting semaphore.
#[derive(Debug)]
pub(crate) struct Semaphore {
    permits: Mutex<usize>,
    released: Condvar,
}

/// Permit of a [`Semaphore`], returned on drop.
pub(crate) struct Permit<'a> {
    semaphore: &'a Semaphore,
}

impl Semaphore {
    pub(crate) fn new(permits: usize) -> Self {
        Semaphore {
            permits: Mutex::new(permits),
            released: Condvar::new(),
        }
    }

    pub(crate) fn acquire(&self) -> Permit<'_> {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.released.wait(&mut permits);
        }
        *permits -= 1;
        Permit { semaphore: self }
    }

    pub(crate) fn available(&self) -> usize {
        *self.permits.lock()
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        *self.semaphore.permits.lock() += 1;
        self.semaphore.released.notify_one();
    }
}

// ============================================================================
// Workers
// ============================================================================

/// Lifecycle of a handler as seen by the mediator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    EventTimeStarted,
    /// Event time received, out-state not requested.
    Suspended,
    OutStateStarted,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lifecycle::Idle => "idle",
            Lifecycle::EventTimeStarted => "event_time_started",
            Lifecycle::Suspended => "suspended",
            Lifecycle::OutStateStarted => "out_state_started",
        };
        f.write_str(name)
    }
}

/// Request sent over the start channel.
enum EventTimeRequest {
    /// New event time for the extracted in-state.
    Fresh(Option<Vec<Node>>),
    /// Next event time after an unconfirmed event.
    Resend,
}

enum Reply {
    EventTime(EcmcResult<EventTimeReply>),
    OutState(EcmcResult<Option<Vec<Node>>>),
}

struct Worker {
    start: Sender<EventTimeRequest>,
    proceed: Sender<OutStateArguments>,
    replies: Receiver<Reply>,
    thread: JoinHandle<()>,
    lifecycle: Lifecycle,
    payload: Option<OutStatePayload>,
}

fn run_worker(
    mut handler: Box<dyn EventHandler>,
    mut rng: HandlerRng,
    start: Receiver<EventTimeRequest>,
    proceed: Receiver<OutStateArguments>,
    replies: Sender<Reply>,
    semaphore: Arc<Semaphore>,
) {
    loop {
        let reply = select! {
            recv(start) -> message => message.ok().map(|request| {
                let _permit = semaphore.acquire();
                Reply::EventTime(match request {
                    EventTimeRequest::Fresh(in_state) => handler.send_event_time(in_state, rng.event_time()),
                    EventTimeRequest::Resend => handler.resend_event_time(rng.event_time()),
                })
            }),
            recv(proceed) -> message => message
                .ok()
                .map(|arguments| Reply::OutState(handler.send_out_state(arguments, rng.out_state()))),
        };
        // A closed channel means the mediator shut down.
        let Some(reply) = reply else { break };
        if replies.send(reply).is_err() {
            break;
        }
    }
}

fn lifecycle_error(handler: HandlerId, state: Lifecycle, action: &str) -> EcmcError {
    EcmcError::Lifecycle {
        handler,
        state: state.to_string(),
        action: action.to_string(),
    }
}

fn disconnected(handler: HandlerId) -> EcmcError {
    EcmcError::mediator(format!("worker of {} disconnected", handler))
}

// ============================================================================
// Mediator
// ============================================================================

/// Mediator that runs every handler instance in its own worker thread.
pub struct MultiProcessMediator {
    core: MediatorCore,
    workers: Vec<Worker>,
    semaphore: Arc<Semaphore>,
    cores: usize,
}

impl MultiProcessMediator {
    pub fn new(
        state: Box<dyn StateHandler>,
        activator: TagActivator,
        scheduler: Box<dyn Scheduler>,
        sink: Box<dyn OutputSink>,
        seed: u64,
        cores: usize,
    ) -> EcmcResult<Self> {
        if cores <= 1 {
            return Err(EcmcError::configuration(format!(
                "the multi-process mediator needs more than one core, got {}",
                cores
            )));
        }
        let semaphore = Arc::new(Semaphore::new(cores - 1));
        let handlers = activator.event_handlers();
        let core = MediatorCore::new(state, activator, scheduler, sink)?;

        let mut workers = Vec::with_capacity(handlers.len());
        for (index, handler) in handlers.into_iter().enumerate() {
            let (start_tx, start_rx) = channel::unbounded();
            let (proceed_tx, proceed_rx) = channel::unbounded();
            let (reply_tx, reply_rx) = channel::unbounded();
            let rng = HandlerRng::new(seed, HandlerId(index));
            let semaphore = semaphore.clone();
            let thread = std::thread::Builder::new()
                .name(format!("ecmc-handler-{}", index))
                .spawn(move || run_worker(handler, rng, start_rx, proceed_rx, reply_tx, semaphore))
                .map_err(|e| EcmcError::mediator(format!("cannot spawn worker {}: {}", index, e)))?;
            workers.push(Worker {
                start: start_tx,
                proceed: proceed_tx,
                replies: reply_rx,
                thread,
                lifecycle: Lifecycle::Idle,
                payload: None,
            });
        }
        debug!(workers = workers.len(), cores, "Started event handler workers");

        Ok(MultiProcessMediator {
            core,
            workers,
            semaphore,
            cores,
        })
    }

    /// Workers still computing. A reply waiting in its channel does not count.
    fn in_flight(&self) -> usize {
        self.workers
            .iter()
            .filter(|worker| {
                matches!(
                    worker.lifecycle,
                    Lifecycle::EventTimeStarted | Lifecycle::OutStateStarted
                ) && worker.replies.is_empty()
            })
            .count()
    }

    fn worker(&mut self, handler: HandlerId) -> EcmcResult<&mut Worker> {
        self.workers
            .get_mut(handler.index())
            .ok_or_else(|| EcmcError::mediator(format!("unknown event handler {}", handler)))
    }

    fn receive_event_time(&mut self, handler: HandlerId) -> EcmcResult<EventTimeReply> {
        let worker = self.worker(handler)?;
        match worker.replies.recv().map_err(|_| disconnected(handler))? {
            Reply::EventTime(reply) => {
                if worker.lifecycle != Lifecycle::EventTimeStarted {
                    return Err(lifecycle_error(handler, worker.lifecycle, "receive an event time"));
                }
                worker.lifecycle = Lifecycle::Suspended;
                reply
            }
            Reply::OutState(_) => Err(lifecycle_error(handler, worker.lifecycle, "receive an out-state")),
        }
    }

    /// Out-state reply of a worker. The outer result fails on a broken
    /// protocol, the inner one carries the result of the handler.
    fn receive_out_state_reply(&mut self, handler: HandlerId) -> EcmcResult<EcmcResult<Option<Vec<Node>>>> {
        let worker = self.worker(handler)?;
        match worker.replies.recv().map_err(|_| disconnected(handler))? {
            Reply::OutState(out_state) => {
                if worker.lifecycle != Lifecycle::OutStateStarted {
                    return Err(lifecycle_error(handler, worker.lifecycle, "receive an out-state"));
                }
                worker.lifecycle = Lifecycle::Idle;
                Ok(out_state)
            }
            Reply::EventTime(_) => Err(lifecycle_error(handler, worker.lifecycle, "receive an event time")),
        }
    }

    fn receive_out_state(&mut self, handler: HandlerId) -> EcmcResult<Option<Vec<Node>>> {
        self.receive_out_state_reply(handler)?
    }

    fn start_event_time(&mut self, handler: HandlerId, request: EventTimeRequest) -> EcmcResult<()> {
        let worker = self.worker(handler)?;
        if worker.lifecycle != Lifecycle::Idle {
            return Err(lifecycle_error(handler, worker.lifecycle, "start an event time"));
        }
        worker.start.send(request).map_err(|_| disconnected(handler))?;
        worker.lifecycle = Lifecycle::EventTimeStarted;
        Ok(())
    }

    fn start_out_state(&mut self, handler: HandlerId, arguments: OutStateArguments) -> EcmcResult<()> {
        let worker = self.worker(handler)?;
        if worker.lifecycle != Lifecycle::Suspended {
            return Err(lifecycle_error(handler, worker.lifecycle, "start an out-state"));
        }
        worker.proceed.send(arguments).map_err(|_| disconnected(handler))?;
        worker.lifecycle = Lifecycle::OutStateStarted;
        Ok(())
    }

    /// Return a trashed handler to idle, draining a speculative out-state.
    ///
    /// Only the result of the handler is discarded, a broken protocol is
    /// fatal.
    fn release(&mut self, handler: HandlerId) -> EcmcResult<()> {
        let lifecycle = self.worker(handler)?.lifecycle;
        match lifecycle {
            Lifecycle::OutStateStarted => {
                if let Err(error) = self.receive_out_state_reply(handler)? {
                    debug!(handler = %handler, error = %error, "Discarded speculative out-state");
                }
            }
            Lifecycle::Suspended | Lifecycle::Idle => {}
            Lifecycle::EventTimeStarted => {
                return Err(lifecycle_error(handler, lifecycle, "be trashed"));
            }
        }
        let worker = self.worker(handler)?;
        worker.lifecycle = Lifecycle::Idle;
        worker.payload = None;
        Ok(())
    }

    fn shutdown(&mut self) {
        for (index, worker) in self.workers.drain(..).enumerate() {
            let Worker {
                start,
                proceed,
                replies,
                thread,
                ..
            } = worker;
            drop(start);
            drop(proceed);
            drop(replies);
            if thread.join().is_err() {
                warn!(handler = index, "Event handler worker panicked");
            }
        }
    }
}

impl Mediator for MultiProcessMediator {
    fn step(&mut self) -> EcmcResult<StepOutcome> {
        self.core.ensure_running()?;
        let to_run = self.core.handlers_to_run()?;

        let mut started = Vec::with_capacity(to_run.len());
        for (handler, in_state) in to_run {
            self.start_event_time(handler, EventTimeRequest::Fresh(in_state))?;
            started.push(handler);
        }

        let mut times = Vec::with_capacity(started.len());
        for (position, &handler) in started.iter().enumerate() {
            let reply = self.receive_event_time(handler)?;
            let remaining = started.len() - position - 1;
            if reply.payload.is_self_contained() && remaining > 0 && self.in_flight() < self.cores - 1 {
                self.start_out_state(handler, OutStateArguments::Empty)?;
            }
            self.worker(handler)?.payload = Some(reply.payload);
            times.push((reply.time, handler));
        }
        for (time, handler) in times {
            self.core.scheduler.push_event(time, handler);
        }

        let (event, out_state) = loop {
            let event = self.core.scheduler.pop_minimum()?;
            let worker = self.worker(event.handler)?;
            let payload = worker
                .payload
                .take()
                .ok_or_else(|| EcmcError::mediator(format!("{} has no pending event", event.handler)))?;
            let lifecycle = worker.lifecycle;
            match lifecycle {
                Lifecycle::OutStateStarted => {}
                Lifecycle::Suspended => {
                    let arguments = self.core.out_state_arguments(event.handler, payload)?;
                    self.start_out_state(event.handler, arguments)?;
                }
                lifecycle => return Err(lifecycle_error(event.handler, lifecycle, "commit its event")),
            }
            if let Some(out_state) = self.receive_out_state(event.handler)? {
                break (event, out_state);
            }
            self.start_event_time(event.handler, EventTimeRequest::Resend)?;
            let reply = self.receive_event_time(event.handler)?;
            self.worker(event.handler)?.payload = Some(reply.payload);
            self.core.reschedule(event, reply.time);
        };

        let (outcome, trashed) = self.core.commit(event, out_state)?;
        for handler in trashed {
            self.release(handler)?;
        }
        if outcome == StepOutcome::Stopped {
            self.shutdown();
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
        self.shutdown();
        debug!(permits = self.semaphore.available(), "Event handler workers joined");
        self.core.post_run()
    }
}

impl Drop for MultiProcessMediator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    use crate::mediator::tests::{point_mass_parts, NeverConfirmed, LAST, SAMPLES};
    use crate::mediator::{RunOutcome, SingleProcessMediator};
    use crate::output::MemoryOutputSink;
    use crate::scheduler::SchedulerKind;

    const START_OF_RUN: HandlerId = HandlerId(0);

    fn point_mass(never_confirmed: Option<NeverConfirmed>, cores: usize) -> MultiProcessMediator {
        let (state, activator) = point_mass_parts(never_confirmed).unwrap();
        let sink = MemoryOutputSink::new(&[SAMPLES, LAST]);
        MultiProcessMediator::new(state, activator, SchedulerKind::Heap.build(false), Box::new(sink), 0, cores)
            .unwrap()
    }

    fn wait_for_reply(mediator: &MultiProcessMediator, handler: HandlerId) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while mediator.workers[handler.index()].replies.is_empty() {
            assert!(Instant::now() < deadline, "no reply from {}", handler);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_unconfirmed_events_are_resent() {
        let (state, activator) = point_mass_parts(Some(NeverConfirmed::new(0.6, true))).unwrap();
        let mut single = SingleProcessMediator::new(
            state,
            activator,
            SchedulerKind::Heap.build(false),
            Box::new(MemoryOutputSink::new(&[SAMPLES, LAST])),
            0,
        )
        .unwrap();
        let RunOutcome::Stopped(expected) = single.run().unwrap();

        for cores in [2, 3] {
            let mut multi = point_mass(Some(NeverConfirmed::new(0.6, true)), cores);
            let RunOutcome::Stopped(summary) = multi.run().unwrap();
            assert_eq!(summary.unconfirmed_of("never_confirmed"), 4);
            assert_eq!(summary, expected);
        }
    }

    #[test]
    fn test_unconfirmed_event_without_resend_is_fatal() {
        let mut mediator = point_mass(Some(NeverConfirmed::new(0.6, false)), 2);
        assert_eq!(mediator.step().unwrap(), StepOutcome::Continue);
        assert!(matches!(mediator.step(), Err(EcmcError::Mediator(_))));
    }

    #[test]
    fn test_release_discards_handler_errors() {
        let mut mediator = point_mass(None, 2);
        mediator
            .start_event_time(START_OF_RUN, EventTimeRequest::Fresh(None))
            .unwrap();
        mediator.receive_event_time(START_OF_RUN).unwrap();
        // The start of the run expects the branch of its initial unit.
        mediator
            .start_out_state(START_OF_RUN, OutStateArguments::Empty)
            .unwrap();
        mediator.release(START_OF_RUN).unwrap();
        assert_eq!(mediator.workers[START_OF_RUN.index()].lifecycle, Lifecycle::Idle);
    }

    #[test]
    fn test_release_propagates_protocol_errors() {
        let mut mediator = point_mass(None, 2);
        mediator
            .start_event_time(START_OF_RUN, EventTimeRequest::Fresh(None))
            .unwrap();
        // An event time arrives where an out-state is drained.
        mediator.workers[START_OF_RUN.index()].lifecycle = Lifecycle::OutStateStarted;
        assert!(matches!(
            mediator.release(START_OF_RUN),
            Err(EcmcError::Lifecycle { .. })
        ));
    }

    #[test]
    fn test_waiting_reply_is_not_in_flight() {
        let mut mediator = point_mass(None, 2);
        mediator
            .start_event_time(START_OF_RUN, EventTimeRequest::Fresh(None))
            .unwrap();
        wait_for_reply(&mediator, START_OF_RUN);
        assert_eq!(mediator.workers[START_OF_RUN.index()].lifecycle, Lifecycle::EventTimeStarted);
        assert_eq!(mediator.in_flight(), 0);
        mediator.receive_event_time(START_OF_RUN).unwrap();
        assert_eq!(mediator.in_flight(), 0);
    }

    #[test]
    fn test_semaphore_bounds_concurrency() {
        let semaphore = Arc::new(Semaphore::new(2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..6)
            .map(|_| {
                let semaphore = semaphore.clone();
                let running = running.clone();
                let peak = peak.clone();
                std::thread::spawn(move || {
                    let _permit = semaphore.acquire();
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(5));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(semaphore.available(), 2);
    }

    #[test]
    fn test_lifecycle_names() {
        assert_eq!(Lifecycle::OutStateStarted.to_string(), "out_state_started");
        let error = lifecycle_error(HandlerId(3), Lifecycle::Idle, "commit its event");
        assert!(error.to_string().contains("idle"));
    }
}
