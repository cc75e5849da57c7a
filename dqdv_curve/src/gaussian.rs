//! Single-Gaussian least-squares fitting around detected dQ/dV peaks.
//!
//! The model is `amplitude * exp(-(x - mean)^2 / (2 sigma^2))`, fitted with a damped
//! Gauss-Newton (Levenberg-Marquardt) loop on the analytic Jacobian. Every model
//! evaluation over the window counts against the evaluation budget.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::DqdvError;

const FTOL: f64 = 1.49012e-8;
const XTOL: f64 = 1.49012e-8;
const LAMBDA_INIT: f64 = 1e-3;
const LAMBDA_MAX: f64 = 1e16;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct GaussianParams {
    pub amplitude: f64,
    pub mean: f64,
    pub sigma: f64,
}

impl GaussianParams {
    pub fn evaluate(&self, x: f64) -> f64 {
        let z = (x - self.mean) / self.sigma;
        self.amplitude * (-0.5 * z * z).exp()
    }

    /// Integrated area, `amplitude * sigma * sqrt(2 pi)`.
    pub fn area(&self) -> f64 {
        self.amplitude * self.sigma * (2.0 * std::f64::consts::PI).sqrt()
    }

    fn to_vector(self) -> Vector3<f64> {
        Vector3::new(self.amplitude, self.mean, self.sigma)
    }

    fn from_vector(v: &Vector3<f64>) -> Self {
        Self {
            amplitude: v[0],
            mean: v[1],
            sigma: v[2],
        }
    }
}

/// Sample range `[peak - half_width, peak + half_width]`, clipped to `0..len`.
pub fn peak_window(peak: usize, half_width: usize, len: usize) -> std::ops::Range<usize> {
    let start = peak.saturating_sub(half_width);
    let end = (peak + half_width + 1).min(len);
    start..end
}

/// Fit a Gaussian to `(x, y)` starting from `seed`.
///
/// Fails with `InsufficientData` when the window has fewer samples than parameters
/// and with `FitNonConvergence` when the evaluation budget runs out or the iterate
/// leaves the finite domain.
pub fn fit_gaussian(
    x: &[f64],
    y: &[f64],
    seed: GaussianParams,
    max_evaluations: usize,
) -> Result<GaussianParams, DqdvError> {
    if x.len() != y.len() {
        return Err(DqdvError::LengthMismatch {
            expected: x.len(),
            actual: y.len(),
        });
    }
    if x.len() < 3 {
        return Err(DqdvError::InsufficientData(format!(
            "gaussian fit needs at least 3 samples, got {}",
            x.len()
        )));
    }

    let mut evaluations = 0usize;
    let mut params = seed.to_vector();
    let mut cost = sum_squares(x, y, &params);
    evaluations += 1;
    if !cost.is_finite() {
        return Err(DqdvError::FitNonConvergence { evaluations });
    }
    let mut lambda = LAMBDA_INIT;

    loop {
        if cost == 0.0 {
            break;
        }
        let (jtj, jtr) = normal_equations(x, y, &params);
        evaluations += 1;

        let mut accepted = false;
        while !accepted {
            if evaluations >= max_evaluations {
                return Err(DqdvError::FitNonConvergence { evaluations });
            }
            if lambda > LAMBDA_MAX {
                // no damping level improves the cost: already at the minimum
                return finish(params, evaluations);
            }

            let mut damped = jtj;
            for k in 0..3 {
                damped[(k, k)] += lambda * jtj[(k, k)].max(f64::EPSILON);
            }
            let Some(step) = damped.lu().solve(&(-jtr)) else {
                lambda *= 10.0;
                continue;
            };

            let trial = params + step;
            let trial_cost = sum_squares(x, y, &trial);
            evaluations += 1;

            if trial_cost.is_finite() && trial_cost < cost {
                let reduction = (cost - trial_cost) / cost;
                let small_step = step.norm() <= XTOL * (params.norm() + XTOL);
                params = trial;
                cost = trial_cost;
                lambda = (lambda / 10.0).max(1e-12);
                accepted = true;
                if reduction <= FTOL || small_step {
                    return finish(params, evaluations);
                }
            } else {
                lambda *= 10.0;
            }
        }
    }

    finish(params, evaluations)
}

fn finish(params: Vector3<f64>, evaluations: usize) -> Result<GaussianParams, DqdvError> {
    let mut fitted = GaussianParams::from_vector(&params);
    if !(fitted.amplitude.is_finite() && fitted.mean.is_finite() && fitted.sigma.is_finite())
        || fitted.sigma == 0.0
    {
        return Err(DqdvError::FitNonConvergence { evaluations });
    }
    // sigma only enters squared; report the positive branch
    fitted.sigma = fitted.sigma.abs();
    Ok(fitted)
}

fn sum_squares(x: &[f64], y: &[f64], p: &Vector3<f64>) -> f64 {
    let model = GaussianParams::from_vector(p);
    x.iter()
        .zip(y.iter())
        .map(|(&xi, &yi)| {
            let r = model.evaluate(xi) - yi;
            r * r
        })
        .sum()
}

/// `J^T J` and `J^T r` for residuals `r = f(x) - y`.
fn normal_equations(x: &[f64], y: &[f64], p: &Vector3<f64>) -> (Matrix3<f64>, Vector3<f64>) {
    let (amp, mean, sigma) = (p[0], p[1], p[2]);
    let s2 = sigma * sigma;
    let mut jtj = Matrix3::<f64>::zeros();
    let mut jtr = Vector3::<f64>::zeros();
    for (&xi, &yi) in x.iter().zip(y.iter()) {
        let d = xi - mean;
        let e = (-d * d / (2.0 * s2)).exp();
        let f = amp * e;
        let grad = Vector3::new(e, f * d / s2, f * d * d / (s2 * sigma));
        jtj += grad * grad.transpose();
        jtr += grad * (f - yi);
    }
    (jtj, jtr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn sample(truth: &GaussianParams, noise: f64) -> (Vec<f64>, Vec<f64>) {
        let x: Vec<f64> = (0..201).map(|i| 3.2 + i as f64 * 0.005).collect();
        let y = x
            .iter()
            .enumerate()
            .map(|(i, &xi)| {
                let clean = truth.evaluate(xi);
                clean + noise * truth.amplitude * (i as f64 * 2.3).sin()
            })
            .collect();
        (x, y)
    }

    #[test]
    fn window_is_symmetric_and_clipped() {
        assert_eq!(peak_window(10, 3, 100), 7..14);
        assert_eq!(peak_window(1, 3, 100), 0..5);
        assert_eq!(peak_window(98, 3, 100), 95..100);
        assert_eq!(peak_window(0, 0, 1), 0..1);
    }

    #[test]
    fn recovers_noisy_gaussian() {
        let truth = GaussianParams {
            amplitude: 500.0,
            mean: 3.7,
            sigma: 0.1,
        };
        let (x, y) = sample(&truth, 0.009);
        let peak = y
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        let seed = GaussianParams {
            amplitude: y[peak],
            mean: x[peak],
            sigma: 0.05,
        };
        let fit = fit_gaussian(&x, &y, seed, 5000).unwrap();
        assert_relative_eq!(fit.amplitude, 500.0, max_relative = 0.05);
        assert_relative_eq!(fit.mean, 3.7, max_relative = 0.05);
        assert_relative_eq!(fit.sigma, 0.1, max_relative = 0.05);
    }

    #[test]
    fn fits_negative_discharge_peak() {
        let truth = GaussianParams {
            amplitude: -800.0,
            mean: 3.55,
            sigma: 0.04,
        };
        let (x, y) = sample(&truth, 0.0);
        let seed = GaussianParams {
            amplitude: -790.0,
            mean: 3.56,
            sigma: 0.06,
        };
        let fit = fit_gaussian(&x, &y, seed, 5000).unwrap();
        assert_relative_eq!(fit.amplitude, -800.0, max_relative = 1e-4);
        assert_relative_eq!(fit.mean, 3.55, max_relative = 1e-4);
        assert_relative_eq!(fit.sigma, 0.04, max_relative = 1e-3);
        assert!(fit.area() < 0.0);
    }

    #[test]
    fn area_is_derived_from_parameters() {
        let p = GaussianParams {
            amplitude: 420.0,
            mean: 3.9,
            sigma: 0.07,
        };
        assert_abs_diff_eq!(
            p.area(),
            420.0 * 0.07 * (2.0 * std::f64::consts::PI).sqrt(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn too_few_samples_is_rejected() {
        let seed = GaussianParams {
            amplitude: 1.0,
            mean: 0.0,
            sigma: 1.0,
        };
        assert!(matches!(
            fit_gaussian(&[0.0, 1.0], &[1.0, 0.5], seed, 100),
            Err(DqdvError::InsufficientData(_))
        ));
    }

    #[test]
    fn exhausted_budget_reports_non_convergence() {
        let truth = GaussianParams {
            amplitude: 500.0,
            mean: 3.7,
            sigma: 0.1,
        };
        let (x, y) = sample(&truth, 0.0);
        let seed = GaussianParams {
            amplitude: 100.0,
            mean: 3.4,
            sigma: 0.05,
        };
        assert!(matches!(
            fit_gaussian(&x, &y, seed, 3),
            Err(DqdvError::FitNonConvergence { .. })
        ));
    }

    #[test]
    fn non_finite_data_is_rejected() {
        let seed = GaussianParams {
            amplitude: 1.0,
            mean: 0.0,
            sigma: 1.0,
        };
        assert!(matches!(
            fit_gaussian(&[0.0, 1.0, 2.0], &[1.0, f64::INFINITY, 0.5], seed, 100),
            Err(DqdvError::FitNonConvergence { .. })
        ));
    }
}
