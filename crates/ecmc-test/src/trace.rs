//! Event traces of complete runs

use ecmc_core::{EcmcError, EcmcResult, HandlerId, Time};
use ecmc_runtime::{Mediator, RunSummary, StepOutcome};

/// Committed event of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceEntry {
    pub handler: HandlerId,
    pub time: Time,
}

/// Events of a run in commit order together with its summary.
#[derive(Clone, Debug)]
pub struct Trace {
    pub entries: Vec<TraceEntry>,
    pub summary: RunSummary,
}

impl Trace {
    /// Whether no committed time is smaller than the one before.
    pub fn is_monotonic(&self) -> bool {
        self.entries.windows(2).all(|pair| pair[0].time <= pair[1].time)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Time of the last committed event.
    pub fn final_time(&self) -> Option<Time> {
        self.entries.last().map(|entry| entry.time)
    }
}

/// Step the mediator until the run stops, recording every committed event.
///
/// A run that has not stopped after `max_steps` steps is a mediator error.
pub fn record_trace(mediator: &mut dyn Mediator, max_steps: usize) -> EcmcResult<Trace> {
    let mut entries = Vec::new();
    for _ in 0..max_steps {
        let outcome = mediator.step()?;
        if let Some(event) = mediator.last_event() {
            entries.push(TraceEntry {
                handler: event.handler,
                time: event.time,
            });
        }
        if outcome == StepOutcome::Stopped {
            tracing::debug!(events = entries.len(), "Recorded event trace");
            let summary = mediator.post_run()?;
            return Ok(Trace { entries, summary });
        }
    }
    let last_time = entries.last().map(|entry| entry.time.to_string());
    Err(EcmcError::mediator(format!(
        "the run did not stop within {} steps, last committed event at {}",
        max_steps,
        last_time.as_deref().unwrap_or("none")
    )))
}
