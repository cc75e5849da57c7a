//! Savitzky-Golay smoothing.
//!
//! Interior samples are convolved with the least-squares coefficients of a centred
//! window. The first and last `window_length / 2` samples are taken from a
//! polynomial fitted to the first and last full window, so the output keeps the
//! input length and polynomials up to `polyorder` pass through unchanged.

use nalgebra::{DMatrix, DVector};

use crate::DqdvError;

/// Validated smoothing configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SavgolConfig {
    pub window_length: usize,
    pub polyorder: usize,
}

impl SavgolConfig {
    pub fn new(window_length: usize, polyorder: usize) -> Result<Self, DqdvError> {
        if window_length % 2 == 0 || window_length <= polyorder {
            return Err(DqdvError::InvalidSmoothingParameter {
                window_length,
                polyorder,
                len: None,
            });
        }
        Ok(Self {
            window_length,
            polyorder,
        })
    }

    fn half(&self) -> usize {
        self.window_length / 2
    }
}

/// Smooth `y` with a Savitzky-Golay filter.
///
/// Sequences shorter than three samples are returned unchanged. A window longer than
/// the sequence is rejected.
pub fn smooth_savgol(y: &[f64], window_length: usize, polyorder: usize) -> Result<Vec<f64>, DqdvError> {
    if y.len() < 3 {
        return Ok(y.to_vec());
    }
    let config = SavgolConfig::new(window_length, polyorder)?;
    if config.window_length > y.len() {
        return Err(DqdvError::InvalidSmoothingParameter {
            window_length,
            polyorder,
            len: Some(y.len()),
        });
    }

    let n = y.len();
    let w = config.window_length;
    let half = config.half();
    let mut out = vec![0.0; n];

    let center = window_weights(&config, half)?;
    for i in half..n - half {
        out[i] = dot(&center, &y[i - half..=i + half]);
    }

    let head = &y[..w];
    let tail = &y[n - w..];
    for pos in 0..half {
        let weights = window_weights(&config, pos)?;
        out[pos] = dot(&weights, head);

        let tail_pos = w - half + pos;
        let weights = window_weights(&config, tail_pos)?;
        out[n - half + pos] = dot(&weights, tail);
    }

    Ok(out)
}

/// Weights that evaluate the least-squares polynomial of a full window at
/// position `eval_at` (0-based within the window).
fn window_weights(config: &SavgolConfig, eval_at: usize) -> Result<Vec<f64>, DqdvError> {
    let w = config.window_length;
    let cols = config.polyorder + 1;
    let half = config.half() as f64;

    let mut vandermonde = DMatrix::<f64>::zeros(w, cols);
    for i in 0..w {
        let x = i as f64 - half;
        for j in 0..cols {
            vandermonde[(i, j)] = x.powi(j as i32);
        }
    }

    let t = eval_at as f64 - half;
    let basis = DVector::<f64>::from_fn(cols, |j, _| t.powi(j as i32));

    let normal = vandermonde.transpose() * &vandermonde;
    let solved = normal
        .lu()
        .solve(&basis)
        .ok_or_else(|| DqdvError::Computation("singular Savitzky-Golay normal matrix".into()))?;

    Ok((vandermonde * solved).iter().copied().collect())
}

fn dot(weights: &[f64], values: &[f64]) -> f64 {
    weights.iter().zip(values.iter()).map(|(w, v)| w * v).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn short_input_is_untouched() {
        assert_eq!(smooth_savgol(&[], 5, 1).unwrap(), Vec::<f64>::new());
        assert_eq!(smooth_savgol(&[1.0, 9.0], 5, 1).unwrap(), vec![1.0, 9.0]);
    }

    #[test]
    fn rejects_bad_windows() {
        let data = vec![1.0; 20];
        assert!(matches!(
            smooth_savgol(&data, 4, 1),
            Err(DqdvError::InvalidSmoothingParameter { window_length: 4, .. })
        ));
        assert!(matches!(
            smooth_savgol(&data, 3, 3),
            Err(DqdvError::InvalidSmoothingParameter { polyorder: 3, .. })
        ));
        assert!(matches!(
            smooth_savgol(&data[..4], 5, 1),
            Err(DqdvError::InvalidSmoothingParameter { len: Some(4), .. })
        ));
    }

    #[test]
    fn linear_window_is_moving_average_inside() {
        let data = [0.0, 0.0, 5.0, 0.0, 0.0, 0.0, 0.0];
        let out = smooth_savgol(&data, 5, 1).unwrap();
        assert_eq!(out.len(), data.len());
        assert_abs_diff_eq!(out[2], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out[3], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out[4], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn known_quadratic_coefficients() {
        // 5-point quadratic kernel is [-3, 12, 17, 12, -3] / 35
        let config = SavgolConfig::new(5, 2).unwrap();
        let weights = window_weights(&config, 2).unwrap();
        let expected = [-3.0, 12.0, 17.0, 12.0, -3.0];
        for (w, e) in weights.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*w, e / 35.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn preserves_polynomials_including_edges() {
        let data: Vec<f64> = (0..15)
            .map(|i| {
                let x = i as f64;
                x.powi(3) - 2.0 * x.powi(2) + x + 1.0
            })
            .collect();
        let out = smooth_savgol(&data, 7, 3).unwrap();
        for (a, b) in data.iter().zip(out.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn reduces_noise() {
        let truth: Vec<f64> = (0..80).map(|i| (i as f64 * 0.08).sin()).collect();
        let noisy: Vec<f64> = truth
            .iter()
            .enumerate()
            .map(|(i, v)| v + 0.1 * (i as f64 * 1.7).sin())
            .collect();
        let smoothed = smooth_savgol(&noisy, 9, 3).unwrap();
        let mse = |a: &[f64]| -> f64 {
            a.iter().zip(truth.iter()).map(|(x, t)| (x - t).powi(2)).sum::<f64>() / a.len() as f64
        };
        assert!(mse(&smoothed) < mse(&noisy));
    }
}
