//! Schedulers - candidate event times by handler
//!
//! The mediator pushes one candidate event time per running handler and pops
//! the earliest one after every round of event time requests. Committed
//! events must never go back in time; a popped time smaller than the last
//! popped time is a fatal consistency error.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};

use ecmc_core::{EcmcError, EcmcResult, HandlerId, Time};

/// Earliest candidate event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScheduledEvent {
    pub time: Time,
    pub handler: HandlerId,
}

/// Min-priority store of candidate event times.
pub trait Scheduler: Send {
    /// Store the candidate event time of a handler.
    fn push_event(&mut self, time: Time, handler: HandlerId);

    /// Remove and return the earliest candidate event.
    ///
    /// Equal times are returned in insertion order.
    fn pop_minimum(&mut self) -> EcmcResult<ScheduledEvent>;

    /// Drop every pending candidate event of the handler.
    ///
    /// Handlers without a pending event are ignored.
    fn trash_event(&mut self, handler: HandlerId);

    /// Number of pending candidate events.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Kind of scheduler.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    #[default]
    Heap,
    List,
}

impl SchedulerKind {
    pub fn build(self, warn_on_equal_event_times: bool) -> Box<dyn Scheduler> {
        match self {
            SchedulerKind::Heap => Box::new(HeapScheduler::new(warn_on_equal_event_times)),
            SchedulerKind::List => Box::new(ListScheduler::new(warn_on_equal_event_times)),
        }
    }
}

/// Enforces non-decreasing popped times.
#[derive(Debug, Default)]
struct MonotonicGuard {
    last: Option<Time>,
    warn_on_equal_event_times: bool,
}

impl MonotonicGuard {
    fn new(warn_on_equal_event_times: bool) -> Self {
        MonotonicGuard {
            last: None,
            warn_on_equal_event_times,
        }
    }

    fn check(&mut self, event: &ScheduledEvent) -> EcmcResult<()> {
        if let Some(last) = self.last {
            match event.time.cmp(&last) {
                Ordering::Less => {
                    return Err(EcmcError::Scheduler(format!(
                        "event time {} of handler {} is earlier than the last committed event time {}",
                        event.time, event.handler, last
                    )))
                }
                Ordering::Equal if self.warn_on_equal_event_times => {
                    tracing::warn!(
                        time = %event.time,
                        handler = %event.handler,
                        "Two consecutive events share the same event time"
                    );
                }
                _ => {}
            }
        }
        self.last = Some(event.time);
        Ok(())
    }
}

fn empty_scheduler() -> EcmcError {
    EcmcError::Scheduler("no candidate event left in the scheduler".to_string())
}

// ============================================================================
// HEAP SCHEDULER
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
struct HeapEntry {
    time: Time,
    sequence: u64,
    handler: HandlerId,
    generation: u64,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then(self.sequence.cmp(&other.sequence))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Binary heap with lazy deletion.
///
/// Trashing a handler bumps its generation; entries of older generations
/// are skipped when they reach the top of the heap.
#[derive(Debug)]
pub struct HeapScheduler {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    generations: HashMap<HandlerId, u64>,
    pending: HashMap<HandlerId, usize>,
    /// Sum over `pending`
    len: usize,
    sequence: u64,
    guard: MonotonicGuard,
}

impl HeapScheduler {
    pub fn new(warn_on_equal_event_times: bool) -> Self {
        HeapScheduler {
            heap: BinaryHeap::new(),
            generations: HashMap::new(),
            pending: HashMap::new(),
            len: 0,
            sequence: 0,
            guard: MonotonicGuard::new(warn_on_equal_event_times),
        }
    }

    fn is_current(&self, entry: &HeapEntry) -> bool {
        self.generations.get(&entry.handler).copied().unwrap_or(0) == entry.generation
    }
}

impl Default for HeapScheduler {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Scheduler for HeapScheduler {
    fn push_event(&mut self, time: Time, handler: HandlerId) {
        if !time.is_finite() {
            tracing::trace!(%handler, "Infinite candidate event time is not scheduled");
            return;
        }
        let generation = self.generations.get(&handler).copied().unwrap_or(0);
        self.heap.push(Reverse(HeapEntry {
            time,
            sequence: self.sequence,
            handler,
            generation,
        }));
        self.sequence += 1;
        *self.pending.entry(handler).or_insert(0) += 1;
        self.len += 1;
    }

    fn pop_minimum(&mut self) -> EcmcResult<ScheduledEvent> {
        while let Some(Reverse(entry)) = self.heap.pop() {
            if !self.is_current(&entry) {
                continue;
            }
            if let Some(count) = self.pending.get_mut(&entry.handler) {
                *count -= 1;
                self.len -= 1;
                if *count == 0 {
                    self.pending.remove(&entry.handler);
                }
            }
            let event = ScheduledEvent {
                time: entry.time,
                handler: entry.handler,
            };
            self.guard.check(&event)?;
            return Ok(event);
        }
        Err(empty_scheduler())
    }

    fn trash_event(&mut self, handler: HandlerId) {
        if let Some(count) = self.pending.remove(&handler) {
            self.len -= count;
            *self.generations.entry(handler).or_insert(0) += 1;
        }
        // Compact once stale entries dominate the heap.
        if self.heap.len() > 64 && self.heap.len() > 4 * self.len() {
            let generations = &self.generations;
            self.heap.retain(|Reverse(entry)| {
                generations.get(&entry.handler).copied().unwrap_or(0) == entry.generation
            });
        }
    }

    fn len(&self) -> usize {
        self.len
    }
}

// ============================================================================
// LIST SCHEDULER
// ============================================================================

/// Linear scan over all pending events, for small numbers of handlers.
#[derive(Debug)]
pub struct ListScheduler {
    events: Vec<(Time, u64, HandlerId)>,
    sequence: u64,
    guard: MonotonicGuard,
}

impl ListScheduler {
    pub fn new(warn_on_equal_event_times: bool) -> Self {
        ListScheduler {
            events: Vec::new(),
            sequence: 0,
            guard: MonotonicGuard::new(warn_on_equal_event_times),
        }
    }
}

impl Default for ListScheduler {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Scheduler for ListScheduler {
    fn push_event(&mut self, time: Time, handler: HandlerId) {
        if !time.is_finite() {
            tracing::trace!(%handler, "Infinite candidate event time is not scheduled");
            return;
        }
        self.events.push((time, self.sequence, handler));
        self.sequence += 1;
    }

    fn pop_minimum(&mut self) -> EcmcResult<ScheduledEvent> {
        let index = self
            .events
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.0.cmp(&b.0).then(a.1.cmp(&b.1)))
            .map(|(index, _)| index)
            .ok_or_else(empty_scheduler)?;
        let (time, _, handler) = self.events.swap_remove(index);
        let event = ScheduledEvent { time, handler };
        self.guard.check(&event)?;
        Ok(event)
    }

    fn trash_event(&mut self, handler: HandlerId) {
        self.events.retain(|(_, _, h)| *h != handler);
    }

    fn len(&self) -> usize {
        self.events.len()
    }
}
