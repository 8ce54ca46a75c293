//! Per-handler random streams
//!
//! Every handler instance owns its own ChaCha8 stream, seeded from the run
//! seed and the handler index. The out-state draws come from a second
//! generator that is forked from the main stream on every event time
//! request, so an out-state that is computed speculatively and then thrown
//! away leaves the main stream untouched.

use ecmc_core::HandlerId;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

#[derive(Clone, Debug)]
pub struct HandlerRng {
    stream: ChaCha8Rng,
    out_state: ChaCha8Rng,
}

impl HandlerRng {
    pub fn new(seed: u64, handler: HandlerId) -> Self {
        let mut stream = ChaCha8Rng::seed_from_u64(seed);
        stream.set_stream(handler.index() as u64);
        let out_state = ChaCha8Rng::seed_from_u64(stream.next_u64());
        HandlerRng { stream, out_state }
    }

    /// Generator for `send_event_time`. Forks a fresh out-state generator.
    pub fn event_time(&mut self) -> &mut ChaCha8Rng {
        self.out_state = ChaCha8Rng::seed_from_u64(self.stream.next_u64());
        &mut self.stream
    }

    /// Generator for `send_out_state` of the last requested event.
    pub fn out_state(&mut self) -> &mut ChaCha8Rng {
        &mut self.out_state
    }
}
