//! Bounding potential confirmation
//!
//! Bounding-potential handlers sample candidate events with a rate that must
//! stay above the real event rate. A violated bound biases the sampling
//! without stopping it, so it is logged and counted; a run can opt into
//! aborting once violations pile up.

use ecmc_core::{EcmcError, EcmcResult};
use ecmc_sampling::{uniform, UniformDraw};

/// Counts bounding potential violations of one handler instance.
#[derive(Clone, Debug, Default)]
pub struct BoundingViolationMonitor {
    limit: Option<u64>,
    count: u64,
}

impl BoundingViolationMonitor {
    /// `limit` is the number of violations tolerated before `check` fails;
    /// `None` never fails.
    pub fn new(limit: Option<u64>) -> Self {
        BoundingViolationMonitor { limit, count: 0 }
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Record a violation if `bound < real` for a positive real rate.
    pub fn check(&mut self, handler: &str, bound: f64, real: f64) -> EcmcResult<()> {
        if real > 0.0 && bound < real {
            self.count += 1;
            tracing::warn!(
                handler,
                bound,
                real,
                count = self.count,
                "Bounding potential is violated"
            );
            if let Some(limit) = self.limit {
                if self.count > limit {
                    return Err(EcmcError::BoundingPotentialViolation {
                        handler: handler.to_string(),
                        count: self.count,
                        limit,
                        bound,
                        real,
                    });
                }
            }
        }
        Ok(())
    }

    /// Confirm a candidate event with probability `real / bound`.
    ///
    /// Non-positive real rates are rejected without drawing.
    pub fn confirm(
        &mut self,
        handler: &str,
        bound: f64,
        real: f64,
        rng: &mut dyn UniformDraw,
    ) -> EcmcResult<bool> {
        if real <= 0.0 {
            return Ok(false);
        }
        self.check(handler, bound, real)?;
        Ok(uniform(rng, 0.0, bound) < real)
    }
}
