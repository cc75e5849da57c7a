use serde::{Deserialize, Serialize};

use crate::cycle::Cycle;
use crate::DqdvError;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CoulombicEfficiencyRow {
    pub cycle_id: u32,
    pub charge_capacity: f64,
    pub discharge_capacity: f64,
    /// Percent.
    pub efficiency: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StateOfHealthRow {
    pub cycle_id: u32,
    pub max_capacity: f64,
    /// Percent of rated capacity.
    pub soh: f64,
}

/// Discharge over charge capacity per cycle, in percent.
///
/// Branch capacities are the final samples; a missing branch counts as zero. Cycles
/// above 100 % are measurement artefacts and are left out.
pub fn coulombic_efficiency(cycles: &[Cycle]) -> Vec<CoulombicEfficiencyRow> {
    cycles
        .iter()
        .filter_map(|cycle| {
            let charge = final_capacity(cycle.charge.as_ref());
            let discharge = final_capacity(cycle.discharge.as_ref());
            let efficiency = if charge > 0.0 {
                discharge / charge * 100.0
            } else {
                0.0
            };
            (efficiency <= 100.0).then_some(CoulombicEfficiencyRow {
                cycle_id: cycle.id,
                charge_capacity: charge,
                discharge_capacity: discharge,
                efficiency,
            })
        })
        .collect()
}

/// Highest branch capacity of each cycle relative to the rated capacity, in percent.
pub fn state_of_health(cycles: &[Cycle], rated_capacity: f64) -> Result<Vec<StateOfHealthRow>, DqdvError> {
    if !(rated_capacity.is_finite() && rated_capacity > 0.0) {
        return Err(DqdvError::InvalidParameter(format!(
            "rated capacity must be positive, got {rated_capacity}"
        )));
    }
    Ok(cycles
        .iter()
        .filter_map(|cycle| {
            let max_capacity = [cycle.charge.as_ref(), cycle.discharge.as_ref()]
                .into_iter()
                .flatten()
                .filter_map(|curve| curve.max_capacity())
                .reduce(f64::max)?;
            Some(StateOfHealthRow {
                cycle_id: cycle.id,
                max_capacity,
                soh: max_capacity / rated_capacity * 100.0,
            })
        })
        .collect())
}

fn final_capacity(curve: Option<&crate::Curve>) -> f64 {
    curve.and_then(|c| c.final_capacity()).unwrap_or(0.0)
}
