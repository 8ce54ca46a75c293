//! End of the run at a fixed time

use ecmc_core::{Context, EcmcError, EcmcResult, Node, Time};
use ecmc_sampling::UniformDraw;

use crate::capabilities::{HandlerContext, StoredState, TimeSlicing};
use crate::handler::{
    EventHandler, EventTimeReply, HandlerDescriptor, HandlerRole, MediatingAction, OutStateArguments,
    OutStatePayload,
};

const NAME: &str = "FinalTimeEndOfRunEventHandler";

/// Ends the run at the final time, optionally writing the final global state.
#[derive(Clone, Debug)]
pub struct FinalTimeEndOfRunEventHandler {
    context: Context,
    final_time: Time,
    output: Option<String>,
    stored: StoredState,
}

impl FinalTimeEndOfRunEventHandler {
    pub fn new(context: Context, final_time: f64, output: Option<String>) -> EcmcResult<Self> {
        if !(final_time > 0.0) || !final_time.is_finite() {
            return Err(EcmcError::configuration(format!(
                "the final time must be finite and > 0.0, got {}",
                final_time
            )));
        }
        Ok(FinalTimeEndOfRunEventHandler {
            context,
            final_time: Time::from_float(final_time),
            output,
            stored: StoredState::default(),
        })
    }
}

impl HandlerContext for FinalTimeEndOfRunEventHandler {
    fn context(&self) -> &Context {
        &self.context
    }
}

impl EventHandler for FinalTimeEndOfRunEventHandler {
    fn descriptor(&self) -> HandlerDescriptor {
        HandlerDescriptor {
            name: NAME,
            role: HandlerRole::EndOfRun,
            mediating_action: MediatingAction::EndOfRun {
                output: self.output.clone(),
            },
        }
    }

    fn send_event_time(
        &mut self,
        _in_state: Option<Vec<Node>>,
        _rng: &mut dyn UniformDraw,
    ) -> EcmcResult<EventTimeReply> {
        self.stored.set_event_time(self.final_time);
        Ok(EventTimeReply::new(self.final_time, OutStatePayload::ActiveGlobalState))
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
        tracing::debug!(final_time = %event_time, "End of run reached");
        Ok(Some(active))
    }
}
