use ndarray::{s, ArrayView1};

use crate::resample::interpolate_linear;
use crate::smooth::smooth_savgol;
use crate::DqdvError;

/// Forward-difference dQ/dV: `(C[i+1] - C[i]) / (V[i+1] - V[i])`.
///
/// The result is one sample shorter than the inputs. Equal consecutive voltages yield
/// `±inf` or `NaN`; those values are returned as-is so callers can spot malformed
/// curves.
pub fn differential_capacity(capacity: &[f64], voltage: &[f64]) -> Result<Vec<f64>, DqdvError> {
    if capacity.len() != voltage.len() {
        return Err(DqdvError::LengthMismatch {
            expected: voltage.len(),
            actual: capacity.len(),
        });
    }
    if voltage.len() < 2 {
        return Ok(Vec::new());
    }
    let c = ArrayView1::from(capacity);
    let v = ArrayView1::from(voltage);
    let dc = &c.slice(s![1..]) - &c.slice(s![..-1]);
    let dv = &v.slice(s![1..]) - &v.slice(s![..-1]);
    Ok((dc / dv).to_vec())
}

/// The three dQ/dV variants computed for one branch.
#[derive(Clone, Debug, Default)]
pub struct DifferentialCurves {
    /// Voltage of the raw samples, without the last one.
    pub raw_voltage: Vec<f64>,
    pub raw: Vec<f64>,
    /// Resampled voltage grid, without the last node.
    pub voltage: Vec<f64>,
    pub resampled: Vec<f64>,
    pub smoothed: Vec<f64>,
}

impl DifferentialCurves {
    pub fn compute(
        voltage: &[f64],
        capacity: &[f64],
        interpolation_points: usize,
        window_length: usize,
        polyorder: usize,
    ) -> Result<Self, DqdvError> {
        let raw = differential_capacity(capacity, voltage)?;
        let raw_voltage = voltage[..raw.len()].to_vec();

        let (grid, cap_grid) = interpolate_linear(voltage, capacity, interpolation_points);
        let resampled = differential_capacity(&cap_grid, &grid)?;
        let smoothed = smooth_savgol(&resampled, window_length, polyorder)?;

        let mut grid = grid;
        grid.truncate(resampled.len());

        Ok(Self {
            raw_voltage,
            raw,
            voltage: grid,
            resampled,
            smoothed,
        })
    }
}
