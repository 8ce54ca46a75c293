//! Lifting schemes
//!
//! After a confirmed event the active label moves to one of the units that
//! take part in the interaction. Every candidate contributes a signed lifting
//! rate: the active unit and the units that increase the rate contribute
//! positive amounts, the candidates for the new active label contribute
//! negative amounts. Global balance requires both sums to agree.

use ecmc_core::{EcmcError, EcmcResult};

use crate::random::{uniform, UniformDraw};

/// How the new active identifier is resolved from the negative lifting rates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LiftingPolicy {
    /// Uniform draw over the summed negative rates.
    Ratio,
    /// Positive rates in front of the active entry are stacked first.
    InsideFirst,
    /// Positive rates behind the active entry are stacked first.
    OutsideFirst,
}

/// Resettable lifting scheme for identifiers of type `I`.
#[derive(Clone, Debug)]
pub struct Lifting<I> {
    policy: LiftingPolicy,
    negative_rates: Vec<f64>,
    identifiers: Vec<I>,
    random_position: f64,
    sum_positive_rates: f64,
    active_recorded: bool,
}

impl<I: Clone> Lifting<I> {
    pub fn new(policy: LiftingPolicy) -> Self {
        tracing::debug!(?policy, "Lifting scheme constructed");
        Lifting {
            policy,
            negative_rates: Vec::new(),
            identifiers: Vec::new(),
            random_position: 0.0,
            sum_positive_rates: 0.0,
            active_recorded: false,
        }
    }

    #[inline]
    pub fn policy(&self) -> LiftingPolicy {
        self.policy
    }

    pub fn reset(&mut self) {
        self.negative_rates.clear();
        self.identifiers.clear();
        self.random_position = 0.0;
        self.sum_positive_rates = 0.0;
        self.active_recorded = false;
    }

    /// Record the lifting rate of one candidate.
    ///
    /// The active entry must carry a positive rate. The ordered policies
    /// consume one uniform variate for it.
    pub fn insert<D: UniformDraw + ?Sized>(
        &mut self,
        rate: f64,
        identifier: I,
        is_active: bool,
        draw: &mut D,
    ) -> EcmcResult<()> {
        if rate > 0.0 {
            self.sum_positive_rates += rate;
            match self.policy {
                LiftingPolicy::Ratio => {
                    if is_active {
                        self.active_recorded = true;
                    }
                }
                LiftingPolicy::InsideFirst => {
                    if is_active {
                        self.active_recorded = true;
                        self.random_position += uniform(draw, 0.0, rate);
                    } else if !self.active_recorded {
                        self.random_position += rate;
                    }
                }
                LiftingPolicy::OutsideFirst => {
                    if is_active {
                        self.active_recorded = true;
                        self.random_position = rate - uniform(draw, 0.0, rate);
                    } else if self.active_recorded {
                        self.random_position += rate;
                    }
                }
            }
        } else {
            if is_active {
                return Err(EcmcError::LiftingScheme(format!(
                    "the active entry needs a positive lifting rate, got {}",
                    rate
                )));
            }
            self.negative_rates.push(-rate);
            self.identifiers.push(identifier);
        }
        Ok(())
    }

    /// Sample the new active identifier.
    pub fn get_active_identifier<D: UniformDraw + ?Sized>(&self, draw: &mut D) -> EcmcResult<I> {
        if !self.active_recorded {
            return Err(EcmcError::LiftingScheme(
                "Active unit has not been recorded.".to_string(),
            ));
        }
        if self.identifiers.is_empty() {
            return Err(EcmcError::LiftingScheme(
                "no candidate with a negative lifting rate was recorded".to_string(),
            ));
        }
        let position = match self.policy {
            LiftingPolicy::Ratio => {
                let sum_negative: f64 = self.negative_rates.iter().sum();
                let position = uniform(draw, 0.0, sum_negative);
                if (self.sum_positive_rates - sum_negative).abs() >= 1e-11 {
                    return Err(EcmcError::LiftingScheme(format!(
                        "positive ({}) and negative ({}) lifting rates are unbalanced",
                        self.sum_positive_rates, sum_negative
                    )));
                }
                position
            }
            LiftingPolicy::InsideFirst | LiftingPolicy::OutsideFirst => self.random_position,
        };
        Ok(self.resolve(position))
    }

    fn resolve(&self, position: f64) -> I {
        let mut cumulative = 0.0;
        for (rate, identifier) in self.negative_rates.iter().zip(&self.identifiers) {
            cumulative += rate;
            if position <= cumulative {
                return identifier.clone();
            }
        }
        // Rounding can leave the position a hair above the last cumulative sum.
        self.identifiers[self.identifiers.len() - 1].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::SequenceDraw;

    /// Unit variate that makes `uniform(0.0, high)` return `value`.
    fn unit(value: f64, high: f64) -> f64 {
        value / high
    }

    fn fill(lifting: &mut Lifting<(u32, u32)>, inserts: &[(f64, (u32, u32), bool)], draw: &mut SequenceDraw) {
        lifting.reset();
        for &(rate, id, active) in inserts {
            lifting.insert(rate, id, active, draw).unwrap();
        }
    }

    const INSIDE_FIRST: [(f64, (u32, u32), bool); 8] = [
        (0.6, (1, 2), false),
        (-0.5, (3, 4), false),
        (-0.5, (5, 6), false),
        (-0.5, (7, 8), false),
        (-0.1, (9, 10), false),
        (0.5, (11, 12), true),
        (0.3, (13, 14), false),
        (0.2, (15, 16), false),
    ];

    const OUTSIDE_FIRST: [(f64, (u32, u32), bool); 8] = [
        (0.4, (1, 2), false),
        (-0.5, (3, 4), false),
        (-0.5, (5, 6), false),
        (-0.5, (7, 8), false),
        (-0.1, (9, 10), false),
        (0.5, (11, 12), true),
        (0.3, (13, 14), false),
        (0.4, (15, 16), false),
    ];

    #[test]
    fn test_inside_first() {
        let mut lifting = Lifting::new(LiftingPolicy::InsideFirst);
        let cases = [
            (0.0, (5, 6)),
            (0.4 - 1e-10, (5, 6)),
            (0.4 + 1e-10, (7, 8)),
            (0.48, (7, 8)),
        ];
        for (value, expected) in cases {
            let mut draw = SequenceDraw::new([unit(value, 0.5)]);
            fill(&mut lifting, &INSIDE_FIRST, &mut draw);
            assert_eq!(lifting.get_active_identifier(&mut draw).unwrap(), expected);
        }
    }

    #[test]
    fn test_outside_first() {
        let mut lifting = Lifting::new(LiftingPolicy::OutsideFirst);
        let cases = [
            (0.0, (7, 8)),
            (0.2 - 1e-10, (7, 8)),
            (0.2 + 1e-10, (5, 6)),
            (0.4, (5, 6)),
        ];
        for (value, expected) in cases {
            let mut draw = SequenceDraw::new([unit(value, 0.5)]);
            fill(&mut lifting, &OUTSIDE_FIRST, &mut draw);
            assert_eq!(lifting.get_active_identifier(&mut draw).unwrap(), expected);
        }
    }

    #[test]
    fn test_missing_active_is_an_error() {
        for policy in [LiftingPolicy::InsideFirst, LiftingPolicy::OutsideFirst, LiftingPolicy::Ratio] {
            let mut lifting = Lifting::new(policy);
            let inactive: Vec<_> = INSIDE_FIRST.iter().map(|&(r, id, _)| (r, id, false)).collect();
            let mut draw = SequenceDraw::new([0.5]);
            fill(&mut lifting, &inactive, &mut draw);
            assert!(matches!(
                lifting.get_active_identifier(&mut draw),
                Err(EcmcError::LiftingScheme(_))
            ));
        }
    }

    #[test]
    fn test_ratio() {
        let inserts = [(-0.3, 'A', false), (0.6, 'B', false), (0.4, 'C', true), (-0.7, 'D', false)];
        let mut lifting = Lifting::new(LiftingPolicy::Ratio);
        for (draw_value, expected) in [(0.2, 'A'), (0.31, 'D')] {
            lifting.reset();
            let mut draw = SequenceDraw::new([draw_value]);
            for &(rate, id, active) in &inserts {
                lifting.insert(rate, id, active, &mut draw).unwrap();
            }
            assert_eq!(lifting.get_active_identifier(&mut draw).unwrap(), expected);
        }
    }

    #[test]
    fn test_ratio_rejects_unbalanced_rates() {
        let mut lifting = Lifting::new(LiftingPolicy::Ratio);
        let mut draw = SequenceDraw::new([0.5]);
        lifting.insert(0.4, 'C', true, &mut draw).unwrap();
        lifting.insert(-0.7, 'D', false, &mut draw).unwrap();
        assert!(lifting.get_active_identifier(&mut draw).is_err());
    }

    #[test]
    fn test_active_entry_needs_positive_rate() {
        let mut lifting = Lifting::new(LiftingPolicy::InsideFirst);
        let mut draw = SequenceDraw::new([0.5]);
        assert!(lifting.insert(-0.1, 1, true, &mut draw).is_err());
    }
}
