//! Potentials consumed by the event handlers
//!
//! The kernel only needs two things from a potential: the directional time
//! derivative along the motion of the active unit (for the confirmation of
//! bounding-potential events) and, for invertible potentials, the
//! displacement after which the cumulative event rate reaches a sampled
//! potential change. Directions are axis indices; the active unit moves with
//! unit velocity along the positive direction.

use std::fmt;

use ecmc_core::{EcmcError, EcmcResult, Unit};

/// Static shape of the arguments of a potential.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PotentialDescriptor {
    pub number_separation_arguments: usize,
    pub number_charge_arguments: usize,
    pub potential_change_required: bool,
}

impl PotentialDescriptor {
    /// Validate the descriptor against a handler that passes
    /// `separations` separation vectors and, if `charge` is set, exactly two
    /// charges per pair.
    pub fn validate(&self, handler: &str, separations: usize, charge: Option<&str>) -> EcmcResult<()> {
        if self.number_separation_arguments != separations {
            return Err(EcmcError::configuration(format!(
                "{} passes {} separation(s) but the potential expects {}",
                handler, separations, self.number_separation_arguments
            )));
        }
        if charge.is_some() && self.number_charge_arguments != 2 {
            return Err(EcmcError::configuration(format!(
                "{} passes two charges but the potential expects {}",
                handler, self.number_charge_arguments
            )));
        }
        Ok(())
    }

    /// Charges of the active and the target unit.
    ///
    /// Without a charge name every charge argument is one.
    pub fn charges(&self, charge: Option<&str>, active: &Unit, target: &Unit) -> EcmcResult<Vec<f64>> {
        match charge {
            None => Ok(vec![1.0; self.number_charge_arguments]),
            Some(name) => Ok(vec![unit_charge(active, name)?, unit_charge(target, name)?]),
        }
    }
}

/// Value of the named charge of a unit.
pub fn unit_charge(unit: &Unit, name: &str) -> EcmcResult<f64> {
    unit.charge_value(name).ok_or_else(|| {
        EcmcError::precondition(format!("unit {} carries no charge {:?}", unit.identifier, name))
    })
}

pub trait Potential: Send + Sync + fmt::Debug {
    fn descriptor(&self) -> PotentialDescriptor;

    /// Time derivative of the potential for a unit velocity of the active
    /// unit along `direction`.
    fn derivative(&self, direction: usize, separations: &[&[f64]], charges: &[f64]) -> f64;
}

pub trait InvertiblePotential: Potential {
    /// Displacement of the active unit along `direction` after which the
    /// cumulative event rate equals `potential_change`, `f64::INFINITY` if it
    /// never does.
    fn displacement(
        &self,
        direction: usize,
        separations: &[&[f64]],
        charges: &[f64],
        potential_change: f64,
    ) -> f64;
}

fn norm_sq(vector: &[f64]) -> f64 {
    vector.iter().map(|v| v * v).sum()
}

/// Hard spheres of equal radius.
///
/// The potential is infinite for overlapping spheres and zero otherwise, so
/// the displacement is the distance to contact and no potential change is
/// sampled.
#[derive(Clone, Debug)]
pub struct HardSpherePotential {
    radius: f64,
    diameter_squared: f64,
}

impl HardSpherePotential {
    pub fn new(radius: f64) -> EcmcResult<Self> {
        if !(radius > 0.0) {
            return Err(EcmcError::configuration(format!(
                "hard spheres need a radius > 0.0, got {}",
                radius
            )));
        }
        tracing::debug!(radius, "Hard sphere potential constructed");
        Ok(HardSpherePotential {
            radius,
            diameter_squared: 4.0 * radius * radius,
        })
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }
}

impl Potential for HardSpherePotential {
    fn descriptor(&self) -> PotentialDescriptor {
        PotentialDescriptor {
            number_separation_arguments: 1,
            number_charge_arguments: 0,
            potential_change_required: false,
        }
    }

    /// Vanishes everywhere except at contact; events are never confirmed
    /// against it.
    fn derivative(&self, _direction: usize, _separations: &[&[f64]], _charges: &[f64]) -> f64 {
        0.0
    }
}

impl InvertiblePotential for HardSpherePotential {
    fn displacement(&self, direction: usize, separations: &[&[f64]], _charges: &[f64], _potential_change: f64) -> f64 {
        let separation = separations[0];
        let along = separation[direction];
        let square_root_term = along * along - (norm_sq(separation) - self.diameter_squared);
        if square_root_term >= 0.0 && along >= 0.0 {
            along - square_root_term.sqrt()
        } else {
            f64::INFINITY
        }
    }
}

/// `U = k * c1 * c2 / |r|^p` for the separation `r` from the active to the
/// target unit.
#[derive(Clone, Debug)]
pub struct InversePowerPotential {
    power: f64,
    prefactor: f64,
}

impl InversePowerPotential {
    pub fn new(power: f64, prefactor: f64) -> EcmcResult<Self> {
        if !(power > 0.0) {
            return Err(EcmcError::configuration(format!(
                "the inverse power potential needs a power > 0.0, got {}",
                power
            )));
        }
        tracing::debug!(power, prefactor, "Inverse power potential constructed");
        Ok(InversePowerPotential { power, prefactor })
    }

    fn potential(&self, prefactor_product: f64, norm: f64) -> f64 {
        prefactor_product / norm.powf(self.power)
    }

    fn new_separation_squared(&self, prefactor_product: f64, potential: f64) -> f64 {
        (prefactor_product / potential).powf(2.0 / self.power)
    }

    fn displacement_repulsive(&self, prefactor_product: f64, along: f64, separation_squared: f64, potential_change: f64) -> f64 {
        if along <= 0.0 {
            return f64::INFINITY;
        }
        let minimum_separation_squared = separation_squared - along * along;
        let maximum_potential = self.potential(prefactor_product, minimum_separation_squared.sqrt());
        let current_potential = self.potential(prefactor_product, separation_squared.sqrt());
        if potential_change < maximum_potential - current_potential {
            let target = self.new_separation_squared(prefactor_product, current_potential + potential_change);
            let square_root_term = along * along - (separation_squared - target);
            return along - square_root_term.sqrt();
        }
        f64::INFINITY
    }

    fn displacement_attractive(
        &self,
        prefactor_product: f64,
        mut along: f64,
        mut separation_squared: f64,
        potential_change: f64,
    ) -> f64 {
        let mut total = 0.0;
        // Move to the point of closest approach first, where the potential
        // is lowest.
        if along > 0.0 {
            let initial_separation_squared = separation_squared;
            separation_squared -= along * along;
            total += along;
            along = 0.0;
            // Head-on approach: the path runs through the singularity at
            // -infinity, which no finite potential change climbs out of.
            if separation_squared <= f64::EPSILON * initial_separation_squared {
                return f64::INFINITY;
            }
        }
        let current_potential = self.potential(prefactor_product, separation_squared.sqrt());
        if current_potential + potential_change >= 0.0 {
            return f64::INFINITY;
        }
        let target = self.new_separation_squared(prefactor_product, current_potential + potential_change);
        let square_root_term = along * along - (separation_squared - target);
        total + along + square_root_term.sqrt()
    }
}

impl Potential for InversePowerPotential {
    fn descriptor(&self) -> PotentialDescriptor {
        PotentialDescriptor {
            number_separation_arguments: 1,
            number_charge_arguments: 2,
            potential_change_required: true,
        }
    }

    fn derivative(&self, direction: usize, separations: &[&[f64]], charges: &[f64]) -> f64 {
        let separation = separations[0];
        let norm = norm_sq(separation).sqrt();
        self.power / norm.powf(self.power + 2.0)
            * self.prefactor
            * charges[0]
            * charges[1]
            * separation[direction]
    }
}

impl InvertiblePotential for InversePowerPotential {
    fn displacement(&self, direction: usize, separations: &[&[f64]], charges: &[f64], potential_change: f64) -> f64 {
        let separation = separations[0];
        let prefactor_product = self.prefactor * charges[0] * charges[1];
        let along = separation[direction];
        let separation_squared = norm_sq(separation);
        if prefactor_product > 0.0 {
            self.displacement_repulsive(prefactor_product, along, separation_squared, potential_change)
        } else {
            self.displacement_attractive(prefactor_product, along, separation_squared, potential_change)
        }
    }
}
