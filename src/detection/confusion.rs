//! Confusion-matrix accumulation for the detector.
//!
//! Counters are atomics so a reporter can snapshot them from another
//! thread while the engine keeps recording.

use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

/// Which cell of the matrix a decision landed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    TruePositive,
    TrueNegative,
    FalsePositive,
    FalseNegative,
}

impl Outcome {
    pub fn from_labels(predicted_malicious: bool, actually_malicious: bool) -> Self {
        match (predicted_malicious, actually_malicious) {
            (true, true) => Outcome::TruePositive,
            (true, false) => Outcome::FalsePositive,
            (false, true) => Outcome::FalseNegative,
            (false, false) => Outcome::TrueNegative,
        }
    }
}

/// Run-wide detection counters. Never decremented.
#[derive(Debug, Default)]
pub struct DetectionResults {
    tp: AtomicU32,
    tn: AtomicU32,
    fp: AtomicU32,
    fn_: AtomicU32,
}

impl DetectionResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::TruePositive => &self.tp,
            Outcome::TrueNegative => &self.tn,
            Outcome::FalsePositive => &self.fp,
            Outcome::FalseNegative => &self.fn_,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConfusionMatrix {
        ConfusionMatrix {
            tp: self.tp.load(Ordering::Relaxed),
            tn: self.tn.load(Ordering::Relaxed),
            fp: self.fp.load(Ordering::Relaxed),
            fn_: self.fn_.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub tp: u32,
    pub tn: u32,
    pub fp: u32,
    #[serde(rename = "fn")]
    pub fn_: u32,
}

impl ConfusionMatrix {
    pub fn total(&self) -> u32 {
        self.tp + self.tn + self.fp + self.fn_
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.tp + self.tn, self.total())
    }

    pub fn precision(&self) -> f64 {
        ratio(self.tp, self.tp + self.fp)
    }

    /// Detection rate.
    pub fn recall(&self) -> f64 {
        ratio(self.tp, self.tp + self.fn_)
    }

    pub fn false_positive_rate(&self) -> f64 {
        ratio(self.fp, self.fp + self.tn)
    }

    pub fn f1(&self) -> f64 {
        let p = self.precision();
        let r = self.recall();
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }
}

fn ratio(num: u32, den: u32) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_mapping() {
        assert_eq!(Outcome::from_labels(true, true), Outcome::TruePositive);
        assert_eq!(Outcome::from_labels(true, false), Outcome::FalsePositive);
        assert_eq!(Outcome::from_labels(false, true), Outcome::FalseNegative);
        assert_eq!(Outcome::from_labels(false, false), Outcome::TrueNegative);
    }

    #[test]
    fn test_metrics() {
        let results = DetectionResults::new();
        for _ in 0..8 {
            results.record(Outcome::TruePositive);
        }
        for _ in 0..2 {
            results.record(Outcome::FalsePositive);
        }
        for _ in 0..90 {
            results.record(Outcome::TrueNegative);
        }
        let m = results.snapshot();
        assert_eq!(m.total(), 100);
        assert!((m.accuracy() - 0.98).abs() < 1e-12);
        assert!((m.precision() - 0.8).abs() < 1e-12);
        assert_eq!(m.recall(), 1.0);
        assert!((m.false_positive_rate() - 2.0 / 92.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_matrix_metrics_are_zero() {
        let m = ConfusionMatrix::default();
        assert_eq!(m.accuracy(), 0.0);
        assert_eq!(m.f1(), 0.0);
    }

    #[test]
    fn test_serializes_fn_field_name() {
        let json = serde_json::to_string(&ConfusionMatrix::default()).unwrap();
        assert!(json.contains("\"fn\":0"));
    }
}
