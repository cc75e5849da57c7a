//! Differential capacity (dQ/dV) analysis of battery cycler records.

pub mod cycle;
pub mod differential;
pub mod gaussian;
pub mod metrics;
pub mod peaks;
pub mod resample;
pub mod smooth;
pub mod stats;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

pub use cycle::{group_cycles, Curve, Cycle, StepKind, StepRecord};
pub use differential::{differential_capacity, DifferentialCurves};
pub use gaussian::{fit_gaussian, peak_window, GaussianParams};
pub use metrics::{coulombic_efficiency, state_of_health, CoulombicEfficiencyRow, StateOfHealthRow};
pub use peaks::{
    adaptive_peak_search, find_peaks, DetectedPeak, PeakPolarity, PeakSearchBounds, PeakThresholds,
    SearchOutcome,
};
pub use resample::interpolate_linear;
pub use smooth::smooth_savgol;
pub use stats::{summarize_cycles, CycleSummary, Describe};

#[derive(Error, Debug)]
pub enum DqdvError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error(
        "invalid smoothing window {window_length} for polyorder {polyorder}{}",
        .len.map(|n| format!(" and {n} samples")).unwrap_or_default()
    )]
    InvalidSmoothingParameter {
        window_length: usize,
        polyorder: usize,
        len: Option<usize>,
    },
    #[error("length mismatch: expected {expected} samples, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    #[error("gaussian fit did not converge after {evaluations} evaluations")]
    FitNonConvergence { evaluations: usize },
    #[error("computation failed: {0}")]
    Computation(String),
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Branch {
    Charge,
    Discharge,
}

impl Branch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Branch::Charge => "Charge",
            Branch::Discharge => "Discharge",
        }
    }

    /// Charge peaks are maxima of dQ/dV, discharge peaks are minima.
    pub fn polarity(&self) -> PeakPolarity {
        match self {
            Branch::Charge => PeakPolarity::Maxima,
            Branch::Discharge => PeakPolarity::Minima,
        }
    }
}

/// Result variants that can be requested from an analysis run.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum OutputKind {
    /// dQ/dV straight from the recorded samples.
    Raw,
    /// dQ/dV on the interpolated grid.
    Resampled,
    /// Smoothed dQ/dV; always produced since peak search runs on it.
    Smoothed,
    /// Peak search, Gaussian fits and overvoltage pairing.
    PeaksFitting,
    /// dQ/dV as reported by the cycler, when the export carries it.
    Device,
}

impl OutputKind {
    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "raw" | "ori" => Some(OutputKind::Raw),
            "resampled" | "int" => Some(OutputKind::Resampled),
            "smoothed" | "smooth" => Some(OutputKind::Smoothed),
            "peaks-fitting" | "peaks" => Some(OutputKind::PeaksFitting),
            "device" | "data" => Some(OutputKind::Device),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OutputSet {
    pub raw: bool,
    pub resampled: bool,
    pub peaks_fitting: bool,
    pub device: bool,
}

impl OutputSet {
    pub fn from_kinds(kinds: &[OutputKind]) -> Self {
        let mut set = OutputSet::default();
        for kind in kinds {
            match kind {
                OutputKind::Raw => set.raw = true,
                OutputKind::Resampled => set.resampled = true,
                OutputKind::Smoothed => {}
                OutputKind::PeaksFitting => set.peaks_fitting = true,
                OutputKind::Device => set.device = true,
            }
        }
        set
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    pub interpolation_points: usize,
    pub window_length: usize,
    pub polyorder: usize,
    /// Samples taken on each side of a peak for the Gaussian fit.
    pub fit_half_width: usize,
    pub peak_search: PeakSearchBounds,
    pub charge_sigma_seed: f64,
    pub discharge_sigma_seed: f64,
    pub max_fit_evaluations: usize,
    /// Rated (nameplate) capacity in mAh, needed for state of health.
    pub rated_capacity: Option<f64>,
    pub outputs: Vec<OutputKind>,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            interpolation_points: 300,
            window_length: 5,
            polyorder: 1,
            fit_half_width: 3,
            peak_search: PeakSearchBounds::default(),
            charge_sigma_seed: 0.05,
            discharge_sigma_seed: 0.5,
            max_fit_evaluations: 5000,
            rated_capacity: None,
            outputs: vec![
                OutputKind::Raw,
                OutputKind::Resampled,
                OutputKind::Smoothed,
                OutputKind::PeaksFitting,
                OutputKind::Device,
            ],
        }
    }
}

impl Params {
    pub fn validate(&self) -> Result<(), DqdvError> {
        smooth::SavgolConfig::new(self.window_length, self.polyorder)?;
        if self.interpolation_points < 2 {
            return Err(DqdvError::InvalidParameter(
                "interpolation_points must be at least 2".into(),
            ));
        }
        if self.interpolation_points - 1 < self.window_length {
            return Err(DqdvError::InvalidSmoothingParameter {
                window_length: self.window_length,
                polyorder: self.polyorder,
                len: Some(self.interpolation_points - 1),
            });
        }

        let b = &self.peak_search;
        if !(b.min_height <= b.max_height) || !(b.min_prominence <= b.max_prominence) {
            return Err(DqdvError::InvalidParameter(
                "peak search minimum exceeds maximum".into(),
            ));
        }
        if !(b.height_step >= 0.0 && b.prominence_step >= 0.0) {
            return Err(DqdvError::InvalidParameter(
                "peak search steps must be non-negative".into(),
            ));
        }
        if b.max_peaks == 0 {
            return Err(DqdvError::InvalidParameter("max_peaks must be positive".into()));
        }
        if !(self.charge_sigma_seed > 0.0 && self.discharge_sigma_seed > 0.0) {
            return Err(DqdvError::InvalidParameter("sigma seeds must be positive".into()));
        }
        if self.max_fit_evaluations == 0 {
            return Err(DqdvError::InvalidParameter(
                "max_fit_evaluations must be positive".into(),
            ));
        }
        if let Some(rated) = self.rated_capacity {
            if !(rated.is_finite() && rated > 0.0) {
                return Err(DqdvError::InvalidParameter(format!(
                    "rated capacity must be positive, got {rated}"
                )));
            }
        }
        Ok(())
    }

    pub fn output_set(&self) -> OutputSet {
        OutputSet::from_kinds(&self.outputs)
    }

    pub fn sigma_seed(&self, branch: Branch) -> f64 {
        match branch {
            Branch::Charge => self.charge_sigma_seed,
            Branch::Discharge => self.discharge_sigma_seed,
        }
    }

    pub fn params_hash(&self) -> Result<String, DqdvError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| DqdvError::InvalidParameter(format!("params not serializable: {e}")))?;
        let digest = Sha256::digest(&json);
        Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
    }
}

/// dQ/dV curves of one branch of one cycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DqdvCurve {
    pub cycle_id: u32,
    pub branch: Branch,
    /// Grid voltage of `smoothed` and `resampled`.
    pub voltage: Vec<f64>,
    pub smoothed: Vec<f64>,
    pub resampled: Option<Vec<f64>>,
    /// `(voltage, dQ/dV)` of the unprocessed samples.
    pub raw: Option<(Vec<f64>, Vec<f64>)>,
    /// `(voltage, dQ/dV)` as exported by the cycler.
    pub device: Option<(Vec<f64>, Vec<f64>)>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Peak {
    pub cycle_id: u32,
    pub branch: Branch,
    /// 1-based position in voltage order.
    pub ordinal: usize,
    pub index: usize,
    pub voltage: f64,
    pub dqdv: f64,
    pub prominence: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GaussianFit {
    pub cycle_id: u32,
    pub branch: Branch,
    /// Ordinal of the peak this fit belongs to.
    pub ordinal: usize,
    pub amplitude: f64,
    pub mean: f64,
    pub sigma: f64,
    pub area: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OvervoltageRow {
    pub cycle_id: u32,
    pub ordinal: usize,
    pub charge_voltage: f64,
    pub discharge_voltage: f64,
    pub overvoltage: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PeakSearchSummary {
    pub cycle_id: u32,
    pub branch: Branch,
    pub outcome: SearchOutcome,
    pub iterations: usize,
    pub height: f64,
    pub prominence: f64,
    pub peaks: usize,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Analysis {
    pub curves: Vec<DqdvCurve>,
    pub peaks: Vec<Peak>,
    pub fits: Vec<GaussianFit>,
    pub overvoltage: Vec<OvervoltageRow>,
    pub searches: Vec<PeakSearchSummary>,
    pub skipped_cycles: Vec<u32>,
    pub failures: Vec<BranchFailure>,
}

/// A branch whose curves could not be computed. A failed charge branch drops the
/// whole cycle; a failed discharge branch only drops the discharge rows.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BranchFailure {
    pub cycle_id: u32,
    pub branch: Branch,
    pub reason: String,
}

/// Everything derived from one branch.
#[derive(Clone, Debug)]
pub struct BranchAnalysis {
    pub curve: DqdvCurve,
    pub peaks: Vec<Peak>,
    pub fits: Vec<GaussianFit>,
    pub search: Option<PeakSearchSummary>,
}

#[derive(Clone, Debug)]
pub struct CycleAnalysis {
    pub cycle_id: u32,
    pub charge: BranchAnalysis,
    pub discharge: Option<BranchAnalysis>,
    pub overvoltage: Vec<OvervoltageRow>,
    pub failures: Vec<BranchFailure>,
}

/// Differentiate, smooth, search peaks and fit Gaussians on one branch.
pub fn analyze_branch(
    cycle_id: u32,
    branch: Branch,
    curve: &Curve,
    params: &Params,
) -> Result<BranchAnalysis, DqdvError> {
    let outputs = params.output_set();
    let diff = DifferentialCurves::compute(
        &curve.voltage,
        &curve.capacity,
        params.interpolation_points,
        params.window_length,
        params.polyorder,
    )?;

    let mut peaks = Vec::new();
    let mut fits = Vec::new();
    let mut search_summary = None;

    if outputs.peaks_fitting {
        let search = adaptive_peak_search(&diff.smoothed, branch.polarity(), &params.peak_search);
        if search.outcome != SearchOutcome::Converged {
            warn!(
                cycle_id,
                branch = branch.as_str(),
                outcome = search.outcome.as_str(),
                iterations = search.iterations,
                peaks = search.peaks.len(),
                "peak search did not reach the expected peak count"
            );
        }
        search_summary = Some(PeakSearchSummary {
            cycle_id,
            branch,
            outcome: search.outcome,
            iterations: search.iterations,
            height: search.thresholds.height,
            prominence: search.thresholds.prominence,
            peaks: search.peaks.len(),
        });

        for (n, detected) in search.peaks.iter().enumerate() {
            let ordinal = n + 1;
            let idx = detected.index;
            peaks.push(Peak {
                cycle_id,
                branch,
                ordinal,
                index: idx,
                voltage: diff.voltage[idx],
                dqdv: diff.smoothed[idx],
                prominence: detected.prominence,
            });

            let window = peak_window(idx, params.fit_half_width, diff.smoothed.len());
            let seed = GaussianParams {
                amplitude: diff.smoothed[idx],
                mean: diff.voltage[idx],
                sigma: params.sigma_seed(branch),
            };
            match fit_gaussian(
                &diff.voltage[window.clone()],
                &diff.smoothed[window],
                seed,
                params.max_fit_evaluations,
            ) {
                Ok(fit) => fits.push(GaussianFit {
                    cycle_id,
                    branch,
                    ordinal,
                    amplitude: fit.amplitude,
                    mean: fit.mean,
                    sigma: fit.sigma,
                    area: fit.area(),
                }),
                Err(err) => {
                    debug!(cycle_id, branch = branch.as_str(), ordinal, %err, "dropping peak fit");
                }
            }
        }
    }

    let DifferentialCurves {
        raw_voltage,
        raw,
        voltage,
        resampled,
        smoothed,
    } = diff;

    Ok(BranchAnalysis {
        curve: DqdvCurve {
            cycle_id,
            branch,
            voltage,
            smoothed,
            resampled: outputs.resampled.then_some(resampled),
            raw: outputs.raw.then_some((raw_voltage, raw)),
            device: curve
                .device_dqdv
                .as_ref()
                .filter(|_| outputs.device)
                .map(|dqdv| (curve.voltage.clone(), dqdv.clone())),
        },
        peaks,
        fits,
        search: search_summary,
    })
}

/// Pair charge peak `k` with discharge peak `k`.
///
/// Pairing is by position only; surplus peaks on either branch are left unpaired.
pub fn pair_overvoltage(cycle_id: u32, charge: &[Peak], discharge: &[Peak]) -> Vec<OvervoltageRow> {
    charge
        .iter()
        .zip(discharge.iter())
        .map(|(c, d)| OvervoltageRow {
            cycle_id,
            ordinal: c.ordinal,
            charge_voltage: c.voltage,
            discharge_voltage: d.voltage,
            overvoltage: c.voltage - d.voltage,
        })
        .collect()
}

/// Analyse one cycle. Returns `Ok(None)` when the cycle has no charge branch and
/// `Err` when the charge branch fails. A failing discharge branch is recorded in
/// `failures` and the charge results are kept.
pub fn analyze_cycle(cycle: &Cycle, params: &Params) -> Result<Option<CycleAnalysis>, DqdvError> {
    let Some(charge_curve) = cycle.charge.as_ref() else {
        return Ok(None);
    };
    let charge = analyze_branch(cycle.id, Branch::Charge, charge_curve, params)?;

    let mut failures = Vec::new();
    let discharge = match cycle.discharge.as_ref() {
        Some(curve) => match analyze_branch(cycle.id, Branch::Discharge, curve, params) {
            Ok(result) => Some(result),
            Err(err) => {
                warn!(cycle_id = cycle.id, %err, "dropping discharge branch");
                failures.push(BranchFailure {
                    cycle_id: cycle.id,
                    branch: Branch::Discharge,
                    reason: err.to_string(),
                });
                None
            }
        },
        None => None,
    };
    let overvoltage = discharge
        .as_ref()
        .map(|d| pair_overvoltage(cycle.id, &charge.peaks, &d.peaks))
        .unwrap_or_default();

    Ok(Some(CycleAnalysis {
        cycle_id: cycle.id,
        charge,
        discharge,
        overvoltage,
        failures,
    }))
}

/// Analyse every cycle in parallel and flatten the results into tables ordered by
/// cycle, then branch.
///
/// Only invalid `params` fail the call. A cycle whose charge branch cannot be
/// analysed is reported in `failures` and the remaining cycles proceed.
pub fn analyze_cycles(cycles: &[Cycle], params: &Params) -> Result<Analysis, DqdvError> {
    params.validate()?;

    let per_cycle: Vec<_> = cycles
        .par_iter()
        .map(|cycle| (cycle.id, analyze_cycle(cycle, params)))
        .collect();

    let mut analysis = Analysis::default();
    for (cycle_id, result) in per_cycle {
        let result = match result {
            Ok(Some(result)) => result,
            Ok(None) => {
                warn!(cycle_id, "skipping cycle without charge data");
                analysis.skipped_cycles.push(cycle_id);
                continue;
            }
            Err(err) => {
                warn!(cycle_id, %err, "skipping cycle with unusable charge data");
                analysis.failures.push(BranchFailure {
                    cycle_id,
                    branch: Branch::Charge,
                    reason: err.to_string(),
                });
                continue;
            }
        };
        analysis.failures.extend(result.failures);
        for branch in std::iter::once(result.charge).chain(result.discharge) {
            analysis.curves.push(branch.curve);
            analysis.peaks.extend(branch.peaks);
            analysis.fits.extend(branch.fits);
            analysis.searches.extend(branch.search);
        }
        analysis.overvoltage.extend(result.overvoltage);
    }
    debug!(
        cycles = cycles.len(),
        skipped = analysis.skipped_cycles.len(),
        failed = analysis.failures.len(),
        peaks = analysis.peaks.len(),
        fits = analysis.fits.len(),
        "dq/dv analysis finished"
    );
    Ok(analysis)
}
