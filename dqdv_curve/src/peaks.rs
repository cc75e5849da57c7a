//! Peak detection with height/prominence thresholds and the adaptive threshold
//! search that tunes them until the peak count is acceptable.

use serde::{Deserialize, Serialize};
use tracing::trace;

/// Bounds and step sizes for the adaptive threshold search.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct PeakSearchBounds {
    pub min_height: f64,
    pub max_height: f64,
    pub height_step: f64,
    pub min_prominence: f64,
    pub max_prominence: f64,
    pub prominence_step: f64,
    pub max_iterations: usize,
    pub max_peaks: usize,
}

impl Default for PeakSearchBounds {
    fn default() -> Self {
        Self {
            min_height: 50.0,
            max_height: 10_000.0,
            height_step: 10.0,
            min_prominence: 50.0,
            max_prominence: 10_000.0,
            prominence_step: 10.0,
            max_iterations: 1000,
            max_peaks: 2,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum PeakPolarity {
    /// Local maxima of the curve.
    Maxima,
    /// Local minima, found as maxima of the negated curve.
    Minima,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct PeakThresholds {
    pub height: f64,
    pub prominence: f64,
}

impl PeakThresholds {
    pub fn initial(bounds: &PeakSearchBounds) -> Self {
        Self {
            height: bounds.min_height,
            prominence: bounds.min_prominence,
        }
    }

    /// Thresholds for the next attempt after `count` peaks were found.
    ///
    /// Too many peaks raise both thresholds (capped at the maxima), no peaks lower
    /// them (floored at the minima). An acceptable count leaves them untouched.
    pub fn adjust(self, count: usize, bounds: &PeakSearchBounds) -> Self {
        if count > bounds.max_peaks {
            Self {
                height: (self.height + bounds.height_step).min(bounds.max_height),
                prominence: (self.prominence + bounds.prominence_step).min(bounds.max_prominence),
            }
        } else if count == 0 {
            Self {
                height: (self.height - bounds.height_step).max(bounds.min_height),
                prominence: (self.prominence - bounds.prominence_step).max(bounds.min_prominence),
            }
        } else {
            self
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct DetectedPeak {
    pub index: usize,
    /// Prominence measured on the oriented curve (negated for minima).
    pub prominence: f64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum SearchOutcome {
    /// Peak count landed in `1..=max_peaks`.
    Converged,
    /// Thresholds were pinned at their bounds and could not move any further.
    Stalled,
    /// `max_iterations` adjustments were spent without an acceptable count.
    IterationCap,
}

impl SearchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchOutcome::Converged => "converged",
            SearchOutcome::Stalled => "stalled",
            SearchOutcome::IterationCap => "iteration_cap",
        }
    }
}

#[derive(Clone, Debug)]
pub struct PeakSearch {
    pub peaks: Vec<DetectedPeak>,
    pub thresholds: PeakThresholds,
    pub iterations: usize,
    pub outcome: SearchOutcome,
}

#[derive(Clone, Copy, Debug)]
struct SearchState {
    thresholds: PeakThresholds,
    iterations: usize,
}

enum Step {
    Done(SearchOutcome),
    Continue(SearchState),
}

fn advance(state: SearchState, count: usize, bounds: &PeakSearchBounds) -> Step {
    if count > 0 && count <= bounds.max_peaks {
        return Step::Done(SearchOutcome::Converged);
    }
    if state.iterations >= bounds.max_iterations {
        return Step::Done(SearchOutcome::IterationCap);
    }
    let next = state.thresholds.adjust(count, bounds);
    if next == state.thresholds {
        return Step::Done(SearchOutcome::Stalled);
    }
    Step::Continue(SearchState {
        thresholds: next,
        iterations: state.iterations + 1,
    })
}

/// Search height/prominence thresholds, starting from the minima, until the number of
/// detected peaks is in `1..=max_peaks`.
///
/// The result always carries the peaks detected at the final thresholds, even when
/// the search did not converge.
pub fn adaptive_peak_search(
    curve: &[f64],
    polarity: PeakPolarity,
    bounds: &PeakSearchBounds,
) -> PeakSearch {
    let oriented: Vec<f64> = match polarity {
        PeakPolarity::Maxima => curve.to_vec(),
        PeakPolarity::Minima => curve.iter().map(|v| -v).collect(),
    };

    let mut state = SearchState {
        thresholds: PeakThresholds::initial(bounds),
        iterations: 0,
    };
    loop {
        let peaks = find_peaks(&oriented, state.thresholds);
        trace!(
            iteration = state.iterations,
            count = peaks.len(),
            height = state.thresholds.height,
            prominence = state.thresholds.prominence,
            "peak search step"
        );
        match advance(state, peaks.len(), bounds) {
            Step::Continue(next) => state = next,
            Step::Done(outcome) => {
                return PeakSearch {
                    peaks,
                    thresholds: state.thresholds,
                    iterations: state.iterations,
                    outcome,
                }
            }
        }
    }
}

/// Local maxima of `y` whose value and prominence both reach the thresholds.
///
/// Flat tops count once, at the middle sample. NaN samples never form a peak.
pub fn find_peaks(y: &[f64], thresholds: PeakThresholds) -> Vec<DetectedPeak> {
    local_maxima(y)
        .into_iter()
        .filter(|&idx| y[idx] >= thresholds.height)
        .filter_map(|idx| {
            let prominence = peak_prominence(y, idx);
            (prominence >= thresholds.prominence).then_some(DetectedPeak {
                index: idx,
                prominence,
            })
        })
        .collect()
}

fn local_maxima(y: &[f64]) -> Vec<usize> {
    let mut out = Vec::new();
    if y.len() < 3 {
        return out;
    }
    let last = y.len() - 1;
    let mut i = 1;
    while i < last {
        if y[i - 1] < y[i] {
            let mut ahead = i + 1;
            while ahead < last && y[ahead] == y[i] {
                ahead += 1;
            }
            if y[ahead] < y[i] {
                out.push((i + ahead - 1) / 2);
                i = ahead;
            }
        }
        i += 1;
    }
    out
}

/// Height of the peak above the higher of the two lowest points reachable on each
/// side before the curve rises above the peak again.
fn peak_prominence(y: &[f64], peak: usize) -> f64 {
    let top = y[peak];

    let mut left_min = top;
    for &v in y[..=peak].iter().rev() {
        if v > top {
            break;
        }
        left_min = left_min.min(v);
    }

    let mut right_min = top;
    for &v in &y[peak..] {
        if v > top {
            break;
        }
        right_min = right_min.min(v);
    }

    top - left_min.max(right_min)
}
