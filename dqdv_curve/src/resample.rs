use ndarray::Array1;
use ordered_float::OrderedFloat;

/// Linearly interpolate `(x, y)` onto `num_points` evenly spaced samples spanning
/// `[min(x), max(x)]`.
///
/// Curves with fewer than two points are returned unchanged. Samples are sorted by
/// `x` first, so a discharge branch (falling voltage) comes back on an ascending grid.
/// Repeated `x` values keep their first sample.
pub fn interpolate_linear(x: &[f64], y: &[f64], num_points: usize) -> (Vec<f64>, Vec<f64>) {
    if x.len() < 2 || y.len() < 2 || num_points < 2 {
        return (x.to_vec(), y.to_vec());
    }

    let mut points: Vec<(f64, f64)> = x.iter().copied().zip(y.iter().copied()).collect();
    points.sort_by_key(|p| OrderedFloat(p.0));
    points.dedup_by(|a, b| a.0 == b.0);
    if points.len() < 2 {
        return (x.to_vec(), y.to_vec());
    }

    let start = points[0].0;
    let end = points[points.len() - 1].0;
    let grid = Array1::linspace(start, end, num_points);

    let mut values = Vec::with_capacity(num_points);
    let mut idx = 0;
    for &target in grid.iter() {
        while idx + 2 < points.len() && points[idx + 1].0 < target {
            idx += 1;
        }
        let (x0, y0) = points[idx];
        let (x1, y1) = points[idx + 1];
        let frac = ((target - x0) / (x1 - x0)).clamp(0.0, 1.0);
        values.push(y0 + (y1 - y0) * frac);
    }

    (grid.to_vec(), values)
}
