//! Estimators of derivative bounds over regions of separations
//!
//! The cell-veto tables need, for every pair of cells, an upper and a lower
//! bound of the potential derivative over all separations between a point in
//! one cell and a point in the other.

use std::fmt;
use std::sync::Arc;

use ecmc_core::{Context, EcmcError, EcmcResult};

use crate::potential::Potential;

pub trait Estimator: Send + Sync + fmt::Debug {
    /// Potential whose derivative is bounded.
    fn potential(&self) -> Arc<dyn Potential>;

    /// Upper and lower bound of the derivative along `direction` for
    /// separations in the hypercuboid between the two corners.
    fn derivative_bound(&self, lower_corner: &[f64], upper_corner: &[f64], direction: usize) -> (f64, f64);

    /// Factor that turns bounds computed for unit charges into bounds for an
    /// active unit with the given charge.
    fn charge_correction_factor(&self, active_charge: f64) -> f64 {
        active_charge
    }
}

/// Samples the derivative on an even grid of points spanning the region.
#[derive(Clone)]
pub struct InnerPointEstimator {
    potential: Arc<dyn Potential>,
    context: Context,
    prefactor: f64,
    empirical_bound: f64,
    points_per_side: usize,
    charges: Vec<f64>,
}

impl InnerPointEstimator {
    /// Create the estimator with a safety prefactor of 1.5, ten grid steps per
    /// side and no empirical clamp.
    pub fn new(potential: Arc<dyn Potential>, context: Context) -> EcmcResult<Self> {
        Self::with_parameters(potential, context, 1.5, f64::INFINITY, 10, None)
    }

    /// Create the estimator.
    ///
    /// `target_charge` is the charge of the target units used in the bound
    /// estimation (one if not given); the potential must then expect two
    /// charges.
    pub fn with_parameters(
        potential: Arc<dyn Potential>,
        context: Context,
        prefactor: f64,
        empirical_bound: f64,
        points_per_side: usize,
        target_charge: Option<f64>,
    ) -> EcmcResult<Self> {
        let descriptor = potential.descriptor();
        if descriptor.number_separation_arguments != 1 {
            return Err(EcmcError::configuration(
                "the inner point estimator needs a potential with exactly one separation",
            ));
        }
        let charges = match (descriptor.number_charge_arguments, target_charge) {
            (0, None) => Vec::new(),
            (0, Some(_)) => {
                return Err(EcmcError::configuration(
                    "a target charge was given but the potential expects no charges",
                ))
            }
            (2, target) => vec![1.0, target.unwrap_or(1.0)],
            (n, _) => {
                return Err(EcmcError::configuration(format!(
                    "the inner point estimator needs a potential with 0 or 2 charges, got {}",
                    n
                )))
            }
        };
        if !(prefactor > 0.0) || points_per_side == 0 {
            return Err(EcmcError::configuration(format!(
                "the inner point estimator needs a prefactor > 0.0 and at least one step per side, \
                 got {} and {}",
                prefactor, points_per_side
            )));
        }
        tracing::debug!(
            prefactor,
            empirical_bound,
            points_per_side,
            ?target_charge,
            "Inner point estimator constructed"
        );
        Ok(InnerPointEstimator {
            potential,
            context,
            prefactor,
            empirical_bound,
            points_per_side,
            charges,
        })
    }
}

impl fmt::Debug for InnerPointEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InnerPointEstimator")
            .field("potential", &self.potential)
            .field("prefactor", &self.prefactor)
            .field("empirical_bound", &self.empirical_bound)
            .field("points_per_side", &self.points_per_side)
            .finish()
    }
}

impl Estimator for InnerPointEstimator {
    fn potential(&self) -> Arc<dyn Potential> {
        Arc::clone(&self.potential)
    }

    fn derivative_bound(&self, lower_corner: &[f64], upper_corner: &[f64], direction: usize) -> (f64, f64) {
        let dimension = lower_corner.len();
        let steps = self.points_per_side + 1;
        let mut upper_bound = f64::NEG_INFINITY;
        let mut lower_bound = f64::INFINITY;
        let mut separation = vec![0.0; dimension];
        for point in 0..steps.pow(dimension as u32) {
            let mut rest = point;
            for (d, entry) in separation.iter_mut().enumerate() {
                let step = rest % steps;
                rest /= steps;
                *entry = lower_corner[d]
                    + (upper_corner[d] - lower_corner[d]) * step as f64 / self.points_per_side as f64;
            }
            self.context.correct_separation(&mut separation);
            let derivative = self.potential.derivative(direction, &[&separation], &self.charges);
            upper_bound = upper_bound.max(derivative);
            lower_bound = lower_bound.min(derivative);
        }

        if upper_bound > 0.0 {
            upper_bound *= self.prefactor;
        } else {
            upper_bound /= self.prefactor;
        }
        if lower_bound > 0.0 {
            lower_bound /= self.prefactor;
        } else {
            lower_bound *= self.prefactor;
        }
        (
            upper_bound.min(self.empirical_bound),
            lower_bound.max(-self.empirical_bound),
        )
    }

    fn charge_correction_factor(&self, active_charge: f64) -> f64 {
        if self.charges.is_empty() {
            1.0
        } else {
            active_charge
        }
    }
}
