//! Accuracy reports and curves produced by evaluation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Accuracy of one classifier on the cumulative test set of one task.
///
/// All values are percentages rounded to two decimals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccuracyReport {
    pub top1: f64,
    pub top5: f64,
    /// Top-1 accuracy keyed by `total`, task range (`"00-09"`), `old` and `new`
    pub grouped: BTreeMap<String, f64>,
    pub num_samples: usize,
}

impl AccuracyReport {
    /// Grouped accuracy for one key, if present.
    pub fn group(&self, key: &str) -> Option<f64> {
        self.grouped.get(key).copied()
    }
}

/// Round a fraction to a percentage with two decimals.
pub fn to_percent(correct: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let ratio = correct as f64 / total as f64;
    (ratio * 10_000.0).round() / 100.0
}

/// Per-task top-1 and top-5 scores of one classifier, append-only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccuracyCurve {
    pub top1: Vec<f64>,
    pub top5: Vec<f64>,
}

impl AccuracyCurve {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, report: &AccuracyReport) {
        self.top1.push(report.top1);
        self.top5.push(report.top5);
    }

    pub fn len(&self) -> usize {
        self.top1.len()
    }

    pub fn is_empty(&self) -> bool {
        self.top1.is_empty()
    }

    /// Average incremental accuracy (mean top-1 over tasks so far).
    pub fn average_top1(&self) -> Option<f64> {
        average(&self.top1)
    }

    pub fn average_top5(&self) -> Option<f64> {
        average(&self.top5)
    }
}

fn average(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Curves of both classifiers for one repetition.
///
/// The nearest-mean curve only grows on tasks where that classifier was available.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CurveSet {
    pub cnn: AccuracyCurve,
    pub nme: AccuracyCurve,
}

impl CurveSet {
    pub fn record(&mut self, cnn: &AccuracyReport, nme: Option<&AccuracyReport>) {
        self.cnn.push(cnn);
        if let Some(nme) = nme {
            self.nme.push(nme);
        }
    }

    pub fn tasks_completed(&self) -> usize {
        self.cnn.len()
    }
}

/// Flat numeric metrics pushed to the tracking collaborator after each task.
pub fn tracking_metrics(cnn: &AccuracyReport, nme: Option<&AccuracyReport>) -> BTreeMap<String, f64> {
    let mut metrics = BTreeMap::new();
    metrics.insert("cnn_top1".to_string(), cnn.top1);
    metrics.insert("cnn_top5".to_string(), cnn.top5);
    if let Some(nme) = nme {
        metrics.insert("nme_top1".to_string(), nme.top1);
        metrics.insert("nme_top5".to_string(), nme.top5);
    }
    metrics
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(top1: f64, top5: f64) -> AccuracyReport {
        AccuracyReport {
            top1,
            top5,
            grouped: BTreeMap::new(),
            num_samples: 10,
        }
    }

    #[test]
    fn test_to_percent_rounding() {
        assert_eq!(to_percent(1, 3), 33.33);
        assert_eq!(to_percent(2, 3), 66.67);
        assert_eq!(to_percent(0, 0), 0.0);
        assert_eq!(to_percent(5, 5), 100.0);
    }

    #[test]
    fn test_curve_grows_one_entry_per_task() {
        let mut curves = CurveSet::default();
        for task in 0..3 {
            curves.record(&report(90.0 - task as f64, 99.0), None);
            assert_eq!(curves.cnn.top1.len(), task + 1);
            assert_eq!(curves.cnn.top5.len(), task + 1);
        }
        assert_eq!(curves.cnn.top1, vec![90.0, 89.0, 88.0]);
        assert!(curves.nme.is_empty());
    }

    #[test]
    fn test_average_incremental_accuracy() {
        let mut curve = AccuracyCurve::new();
        assert!(curve.average_top1().is_none());
        curve.push(&report(80.0, 95.0));
        curve.push(&report(60.0, 85.0));
        assert_eq!(curve.average_top1(), Some(70.0));
        assert_eq!(curve.average_top5(), Some(90.0));
    }

    #[test]
    fn test_tracking_metrics_omit_missing_nme() {
        let cnn = report(50.0, 75.0);
        let metrics = tracking_metrics(&cnn, None);
        assert_eq!(metrics.len(), 2);
        assert!(!metrics.contains_key("nme_top1"));

        let nme = report(55.0, 80.0);
        let metrics = tracking_metrics(&cnn, Some(&nme));
        assert_eq!(metrics["nme_top5"], 80.0);
    }
}
