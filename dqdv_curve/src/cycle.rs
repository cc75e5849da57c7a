use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::DqdvError;

/// Cycler step type of a record.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StepKind {
    CcCharge,
    CvCharge,
    CcDischarge,
    Rest,
    Other(String),
}

impl StepKind {
    /// Parse a cycler step name (`CC_Chg`, `CV_Chg`, `CC_DChg`, `Rest`).
    pub fn from_name(name: &str) -> Self {
        let trimmed = name.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "cc_chg" => StepKind::CcCharge,
            "cv_chg" => StepKind::CvCharge,
            "cc_dchg" => StepKind::CcDischarge,
            "rest" => StepKind::Rest,
            _ => StepKind::Other(trimmed.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            StepKind::CcCharge => "CC_Chg",
            StepKind::CvCharge => "CV_Chg",
            StepKind::CcDischarge => "CC_DChg",
            StepKind::Rest => "Rest",
            StepKind::Other(name) => name,
        }
    }
}

/// One sample of a cycler record table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepRecord {
    pub cycle_id: u32,
    pub step: StepKind,
    pub voltage: f64,
    pub current: f64,
    pub capacity: f64,
    pub dqdv: Option<f64>,
}

/// Voltage/capacity samples of one branch in acquisition order.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Curve {
    pub voltage: Vec<f64>,
    pub capacity: Vec<f64>,
    /// dQ/dV as reported by the cycler, kept for comparison only.
    pub device_dqdv: Option<Vec<f64>>,
}

impl Curve {
    pub fn new(voltage: Vec<f64>, capacity: Vec<f64>) -> Result<Self, DqdvError> {
        if voltage.len() != capacity.len() {
            return Err(DqdvError::LengthMismatch {
                expected: voltage.len(),
                actual: capacity.len(),
            });
        }
        Ok(Self {
            voltage,
            capacity,
            device_dqdv: None,
        })
    }

    pub fn final_capacity(&self) -> Option<f64> {
        self.capacity.last().copied()
    }

    pub fn max_capacity(&self) -> Option<f64> {
        self.capacity.iter().copied().reduce(f64::max)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Cycle {
    pub id: u32,
    pub charge: Option<Curve>,
    pub discharge: Option<Curve>,
}

#[derive(Default)]
struct BranchBuilder {
    voltage: Vec<f64>,
    capacity: Vec<f64>,
    dqdv: Vec<f64>,
    device_complete: bool,
}

impl BranchBuilder {
    fn new() -> Self {
        Self {
            device_complete: true,
            ..Self::default()
        }
    }

    fn push(&mut self, record: &StepRecord, capacity_offset: f64) {
        self.voltage.push(record.voltage);
        self.capacity.push(record.capacity + capacity_offset);
        match record.dqdv {
            Some(v) => self.dqdv.push(v),
            None => self.device_complete = false,
        }
    }

    fn build(self) -> Option<Curve> {
        if self.voltage.is_empty() {
            return None;
        }
        let device_dqdv = (self.device_complete && self.dqdv.len() == self.voltage.len())
            .then_some(self.dqdv);
        Some(Curve {
            voltage: self.voltage,
            capacity: self.capacity,
            device_dqdv,
        })
    }
}

/// Split a record table into cycles with charge and discharge branches.
///
/// The charge branch is the CC charge step followed by the CV charge step. Cyclers
/// restart step capacity at zero, so CV capacity is offset by the last CC capacity.
/// Cycles are returned in ascending id order; a cycle without CC charge samples has no
/// charge branch, one without CC discharge samples has no discharge branch.
pub fn group_cycles(records: &[StepRecord]) -> Vec<Cycle> {
    let mut by_cycle: BTreeMap<u32, Vec<&StepRecord>> = BTreeMap::new();
    for record in records {
        by_cycle.entry(record.cycle_id).or_default().push(record);
    }

    by_cycle
        .into_iter()
        .map(|(id, rows)| {
            let mut cc = BranchBuilder::new();
            let mut cv = Vec::new();
            let mut discharge = BranchBuilder::new();
            for row in rows {
                match row.step {
                    StepKind::CcCharge => cc.push(row, 0.0),
                    StepKind::CvCharge => cv.push(row),
                    StepKind::CcDischarge => discharge.push(row, 0.0),
                    StepKind::Rest | StepKind::Other(_) => {}
                }
            }

            let charge = if cc.voltage.is_empty() {
                None
            } else {
                let offset = cc.capacity.last().copied().unwrap_or(0.0);
                for row in cv {
                    cc.push(row, offset);
                }
                cc.build()
            };

            Cycle {
                id,
                charge,
                discharge: discharge.build(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(cycle_id: u32, step: &str, voltage: f64, capacity: f64) -> StepRecord {
        StepRecord {
            cycle_id,
            step: StepKind::from_name(step),
            voltage,
            current: 0.0,
            capacity,
            dqdv: Some(0.0),
        }
    }

    #[test]
    fn parses_step_names() {
        assert_eq!(StepKind::from_name("CC_Chg"), StepKind::CcCharge);
        assert_eq!(StepKind::from_name(" cv_chg "), StepKind::CvCharge);
        assert_eq!(StepKind::from_name("CC_DChg"), StepKind::CcDischarge);
        assert_eq!(StepKind::from_name("Rest"), StepKind::Rest);
        assert_eq!(
            StepKind::from_name("CCCV_Chg"),
            StepKind::Other("CCCV_Chg".into())
        );
        assert_eq!(StepKind::from_name("CC_DChg").name(), "CC_DChg");
    }

    #[test]
    fn cv_capacity_continues_from_cc() {
        let records = vec![
            rec(1, "Rest", 3.0, 0.0),
            rec(1, "CC_Chg", 3.0, 0.0),
            rec(1, "CC_Chg", 4.2, 1800.0),
            rec(1, "CV_Chg", 4.2, 0.0),
            rec(1, "CV_Chg", 4.2, 150.0),
            rec(1, "CC_DChg", 4.1, 0.0),
            rec(1, "CC_DChg", 3.0, 1900.0),
        ];
        let cycles = group_cycles(&records);
        assert_eq!(cycles.len(), 1);
        let charge = cycles[0].charge.as_ref().unwrap();
        assert_eq!(charge.capacity, vec![0.0, 1800.0, 1800.0, 1950.0]);
        assert_eq!(charge.voltage, vec![3.0, 4.2, 4.2, 4.2]);
        assert_eq!(charge.device_dqdv.as_ref().map(Vec::len), Some(4));
        let discharge = cycles[0].discharge.as_ref().unwrap();
        assert_eq!(discharge.capacity, vec![0.0, 1900.0]);
        assert_eq!(discharge.final_capacity(), Some(1900.0));
    }

    #[test]
    fn missing_steps_leave_branches_empty() {
        let records = vec![
            rec(3, "CC_Chg", 3.0, 0.0),
            rec(3, "CC_Chg", 4.0, 100.0),
            rec(2, "CV_Chg", 4.2, 10.0),
            rec(2, "CC_DChg", 4.0, 0.0),
        ];
        let cycles = group_cycles(&records);
        let ids: Vec<u32> = cycles.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert!(cycles[0].charge.is_none());
        assert!(cycles[0].discharge.is_some());
        assert!(cycles[1].charge.is_some());
        assert!(cycles[1].discharge.is_none());
    }

    #[test]
    fn incomplete_device_dqdv_is_dropped() {
        let mut records = vec![rec(1, "CC_Chg", 3.0, 0.0), rec(1, "CC_Chg", 3.5, 10.0)];
        records[1].dqdv = None;
        let cycles = group_cycles(&records);
        assert!(cycles[0].charge.as_ref().unwrap().device_dqdv.is_none());
    }

    #[test]
    fn curve_rejects_mismatched_lengths() {
        assert!(matches!(
            Curve::new(vec![3.0, 3.1], vec![0.0]),
            Err(DqdvError::LengthMismatch { expected: 2, actual: 1 })
        ));
        let curve = Curve::new(vec![3.0, 3.1], vec![0.0, 5.0]).unwrap();
        assert_eq!(curve.max_capacity(), Some(5.0));
        assert!(curve.device_dqdv.is_none());
    }
}
