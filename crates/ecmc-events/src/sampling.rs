//! Sampling of the global state at fixed time intervals

use ecmc_core::{Context, EcmcError, EcmcResult, Node, Time};
use ecmc_sampling::UniformDraw;

use crate::capabilities::{HandlerContext, StoredState, TimeSlicing};
use crate::handler::{
    EventHandler, EventTimeReply, HandlerDescriptor, HandlerRole, MediatingAction, OutStateArguments,
    OutStatePayload,
};

const NAME: &str = "FixedIntervalSamplingEventHandler";

/// Writes the global state to an output every `sampling_interval`.
///
/// The first sample is taken one interval after the start of the run.
#[derive(Clone, Debug)]
pub struct FixedIntervalSamplingEventHandler {
    context: Context,
    sampling_interval: f64,
    output: String,
    next_time: Time,
    stored: StoredState,
}

impl FixedIntervalSamplingEventHandler {
    pub fn new(context: Context, sampling_interval: f64, output: impl Into<String>) -> EcmcResult<Self> {
        if !(sampling_interval > 0.0) || !sampling_interval.is_finite() {
            return Err(EcmcError::configuration(format!(
                "the sampling interval must be finite and > 0.0, got {}",
                sampling_interval
            )));
        }
        Ok(FixedIntervalSamplingEventHandler {
            context,
            sampling_interval,
            output: output.into(),
            next_time: Time::ZERO,
            stored: StoredState::default(),
        })
    }
}

impl HandlerContext for FixedIntervalSamplingEventHandler {
    fn context(&self) -> &Context {
        &self.context
    }
}

impl EventHandler for FixedIntervalSamplingEventHandler {
    fn descriptor(&self) -> HandlerDescriptor {
        HandlerDescriptor {
            name: NAME,
            role: HandlerRole::Sampling,
            mediating_action: MediatingAction::Sample {
                output: self.output.clone(),
            },
        }
    }

    fn send_event_time(
        &mut self,
        _in_state: Option<Vec<Node>>,
        _rng: &mut dyn UniformDraw,
    ) -> EcmcResult<EventTimeReply> {
        self.next_time = self.next_time + self.sampling_interval;
        self.stored.set_event_time(self.next_time);
        Ok(EventTimeReply::new(self.next_time, OutStatePayload::ActiveGlobalState))
    }

    fn send_out_state(
        &mut self,
        arguments: OutStateArguments,
        _rng: &mut dyn UniformDraw,
    ) -> EcmcResult<Option<Vec<Node>>> {
        let event_time = self.stored.take_event_time(NAME)?;
        let mut active = match arguments {
            OutStateArguments::ActiveGlobalState(active) => active,
            other => return Err(other.unexpected(NAME)),
        };
        self.time_slice_all(&mut active, event_time);
        Ok(Some(active))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecmc_sampling::SequenceDraw;

    #[test]
    fn test_event_times_advance_by_interval() {
        let context = Context::hypercubic(2, 1.0, 1.0).unwrap();
        let mut handler = FixedIntervalSamplingEventHandler::new(context, 0.5, "positions").unwrap();
        let mut draw = SequenceDraw::new([]);
        let times: Vec<f64> = (0..3)
            .map(|_| handler.send_event_time(None, &mut draw).unwrap().time.to_float())
            .collect();
        assert_eq!(times, vec![0.5, 1.0, 1.5]);
        assert_eq!(handler.descriptor().mediating_action.output(), Some("positions"));
    }

    #[test]
    fn test_rejects_bad_interval() {
        let context = Context::hypercubic(2, 1.0, 1.0).unwrap();
        assert!(FixedIntervalSamplingEventHandler::new(context, -1.0, "positions").is_err());
    }
}
