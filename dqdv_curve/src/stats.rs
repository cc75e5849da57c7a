use std::collections::BTreeMap;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::cycle::StepRecord;

/// count/mean/std/min/quartiles/max of one column, NaN samples ignored.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Describe {
    pub count: usize,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub q25: f64,
    pub median: f64,
    pub q75: f64,
    pub max: f64,
}

impl Describe {
    pub fn of(values: impl IntoIterator<Item = f64>) -> Option<Self> {
        let mut sorted: Vec<f64> = values.into_iter().filter(|v| !v.is_nan()).collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_by_key(|v| OrderedFloat(*v));
        let count = sorted.len();
        let mean = sorted.iter().sum::<f64>() / count as f64;
        let std = if count > 1 {
            (sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64).sqrt()
        } else {
            f64::NAN
        };
        Some(Self {
            count,
            mean,
            std,
            min: sorted[0],
            q25: quantile(&sorted, 0.25),
            median: quantile(&sorted, 0.5),
            q75: quantile(&sorted, 0.75),
            max: sorted[count - 1],
        })
    }
}

fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CycleSummary {
    pub cycle_id: u32,
    pub voltage: Option<Describe>,
    pub current: Option<Describe>,
    pub capacity: Option<Describe>,
    pub dqdv: Option<Describe>,
}

/// Per-cycle column statistics over every record of the cycle.
pub fn summarize_cycles(records: &[StepRecord]) -> Vec<CycleSummary> {
    let mut by_cycle: BTreeMap<u32, Vec<&StepRecord>> = BTreeMap::new();
    for record in records {
        by_cycle.entry(record.cycle_id).or_default().push(record);
    }
    by_cycle
        .into_iter()
        .map(|(cycle_id, rows)| CycleSummary {
            cycle_id,
            voltage: Describe::of(rows.iter().map(|r| r.voltage)),
            current: Describe::of(rows.iter().map(|r| r.current)),
            capacity: Describe::of(rows.iter().map(|r| r.capacity)),
            dqdv: Describe::of(rows.iter().filter_map(|r| r.dqdv)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::StepKind;
    use approx::assert_abs_diff_eq;

    #[test]
    fn describe_matches_linear_quantiles() {
        let d = Describe::of([4.0, 1.0, 3.0, 2.0, f64::NAN]).unwrap();
        assert_eq!(d.count, 4);
        assert_abs_diff_eq!(d.mean, 2.5);
        assert_abs_diff_eq!(d.min, 1.0);
        assert_abs_diff_eq!(d.max, 4.0);
        assert_abs_diff_eq!(d.q25, 1.75);
        assert_abs_diff_eq!(d.median, 2.5);
        assert_abs_diff_eq!(d.q75, 3.25);
        assert_abs_diff_eq!(d.std, (5.0f64 / 3.0).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn describe_of_nothing_is_none() {
        assert!(Describe::of(Vec::<f64>::new()).is_none());
        assert!(Describe::of([f64::NAN]).is_none());
        assert!(Describe::of([2.0]).unwrap().std.is_nan());
    }

    #[test]
    fn summaries_are_grouped_by_cycle() {
        let record = |cycle_id, voltage, dqdv| StepRecord {
            cycle_id,
            step: StepKind::CcCharge,
            voltage,
            current: 1000.0,
            capacity: 0.0,
            dqdv,
        };
        let rows = summarize_cycles(&[
            record(2, 3.5, None),
            record(1, 3.0, Some(10.0)),
            record(1, 4.0, Some(30.0)),
        ]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].cycle_id, 1);
        assert_abs_diff_eq!(rows[0].voltage.as_ref().unwrap().mean, 3.5);
        assert_abs_diff_eq!(rows[0].dqdv.as_ref().unwrap().median, 20.0);
        assert!(rows[1].dqdv.is_none());
    }
}
