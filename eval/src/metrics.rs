// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Classification metrics for hallucination detection
//!
//! The positive class is "hallucinated". Implements:
//! - Confusion matrix with accuracy, precision, recall, F1
//! - Specificity, balanced accuracy, Matthews correlation coefficient
//! - Per-class score distributions (mean, standard deviation)
//! - AUC-ROC over severity-oriented scores
//!
//! Every ratio with a zero denominator is 0.0.

use crate::backends::ScoreAxis;
use serde::{Deserialize, Serialize};

/// Confusion matrix for binary classification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    /// Hallucinated, predicted hallucinated
    pub tp: usize,
    /// Faithful, predicted faithful
    pub tn: usize,
    /// Faithful, predicted hallucinated
    pub fp: usize,
    /// Hallucinated, predicted faithful
    pub fn_: usize,
}

impl ConfusionMatrix {
    pub fn record(&mut self, predicted: bool, actual: bool) {
        match (predicted, actual) {
            (true, true) => self.tp += 1,
            (false, false) => self.tn += 1,
            (true, false) => self.fp += 1,
            (false, true) => self.fn_ += 1,
        }
    }

    /// Build from paired predictions and ground truth
    pub fn from_predictions(predictions: &[bool], ground_truth: &[bool]) -> Self {
        let mut matrix = Self::default();
        for (&predicted, &actual) in predictions.iter().zip(ground_truth) {
            matrix.record(predicted, actual);
        }
        matrix
    }

    pub fn total(&self) -> usize {
        self.tp + self.tn + self.fp + self.fn_
    }

    /// Accuracy: (TP + TN) / Total
    pub fn accuracy(&self) -> f64 {
        ratio(self.tp + self.tn, self.total())
    }

    /// Precision: TP / (TP + FP)
    pub fn precision(&self) -> f64 {
        ratio(self.tp, self.tp + self.fp)
    }

    /// Recall: TP / (TP + FN)
    pub fn recall(&self) -> f64 {
        ratio(self.tp, self.tp + self.fn_)
    }

    /// Specificity: TN / (TN + FP)
    pub fn specificity(&self) -> f64 {
        ratio(self.tn, self.tn + self.fp)
    }

    /// F1 Score: 2 * (Precision * Recall) / (Precision + Recall)
    pub fn f1_score(&self) -> f64 {
        let precision = self.precision();
        let recall = self.recall();
        let denom = precision + recall;
        if denom == 0.0 {
            return 0.0;
        }
        2.0 * precision * recall / denom
    }

    /// Matthews Correlation Coefficient, from -1 to 1
    pub fn mcc(&self) -> f64 {
        let tp = self.tp as f64;
        let tn = self.tn as f64;
        let fp = self.fp as f64;
        let fn_ = self.fn_ as f64;

        let numerator = tp * tn - fp * fn_;
        let denominator = ((tp + fp) * (tp + fn_) * (tn + fp) * (tn + fn_)).sqrt();

        if denominator == 0.0 {
            return 0.0;
        }
        numerator / denominator
    }

    /// Balanced Accuracy: (Recall + Specificity) / 2
    pub fn balanced_accuracy(&self) -> f64 {
        (self.recall() + self.specificity()) / 2.0
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    numerator as f64 / denominator as f64
}

/// Threshold plus the comparison direction of its score axis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecisionRule {
    pub axis: ScoreAxis,
    pub threshold: f64,
}

impl DecisionRule {
    pub fn new(axis: ScoreAxis, threshold: f64) -> Self {
        Self { axis, threshold }
    }

    /// Consistency scores predict hallucination below the threshold,
    /// severity scores above it
    pub fn predicts_hallucination(&self, score: f64) -> bool {
        match self.axis {
            ScoreAxis::Consistency => score < self.threshold,
            ScoreAxis::Severity => score > self.threshold,
        }
    }

    pub fn describe(&self) -> String {
        match self.axis {
            ScoreAxis::Consistency => format!("score < {:.2}", self.threshold),
            ScoreAxis::Severity => format!("score > {:.2}", self.threshold),
        }
    }
}

/// Full classification report with all metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub confusion_matrix: ConfusionMatrix,
    pub accuracy: f64,
    pub balanced_accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub mcc: f64,
    pub specificity: f64,
    pub support: usize,
}

impl ClassificationReport {
    pub fn from_confusion_matrix(cm: ConfusionMatrix) -> Self {
        Self {
            accuracy: cm.accuracy(),
            balanced_accuracy: cm.balanced_accuracy(),
            precision: cm.precision(),
            recall: cm.recall(),
            f1_score: cm.f1_score(),
            mcc: cm.mcc(),
            specificity: cm.specificity(),
            support: cm.total(),
            confusion_matrix: cm,
        }
    }

    /// Format as a human-readable string
    pub fn format(&self) -> String {
        format!(
            r#"Accuracy:          {:.4} ({:.2}%)
Balanced Accuracy: {:.4} ({:.2}%)
Precision:         {:.4}
Recall:            {:.4}
F1 Score:          {:.4}
MCC:               {:.4}
Specificity:       {:.4}
Support:           {}

Confusion Matrix:
                      Predicted
                      Halluc.   Faithful
Actual Hallucinated  {:>6}    {:>6}
       Faithful      {:>6}    {:>6}
"#,
            self.accuracy, self.accuracy * 100.0,
            self.balanced_accuracy, self.balanced_accuracy * 100.0,
            self.precision,
            self.recall,
            self.f1_score,
            self.mcc,
            self.specificity,
            self.support,
            self.confusion_matrix.tp, self.confusion_matrix.fn_,
            self.confusion_matrix.fp, self.confusion_matrix.tn,
        )
    }
}

/// Summary of a score collection
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreDistribution {
    pub count: usize,
    pub mean: f64,
    /// Sample standard deviation; 0.0 for fewer than two scores
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

impl ScoreDistribution {
    pub fn from_scores(scores: &[f64]) -> Self {
        if scores.is_empty() {
            return Self::default();
        }

        let n = scores.len() as f64;
        let mean = scores.iter().sum::<f64>() / n;
        let std_dev = if scores.len() > 1 {
            let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / (n - 1.0);
            variance.sqrt()
        } else {
            0.0
        };

        Self {
            count: scores.len(),
            mean,
            std_dev,
            min: scores.iter().copied().fold(f64::INFINITY, f64::min),
            max: scores.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

/// Metrics for one score stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScorerMetrics {
    pub rule: DecisionRule,
    pub classification: ClassificationReport,
    /// Raw scores of hallucinated samples
    pub hallucinated: ScoreDistribution,
    /// Raw scores of faithful samples
    pub faithful: ScoreDistribution,
    /// Absent when either class has no scores
    pub auc_roc: Option<f64>,
}

impl ScorerMetrics {
    pub fn format(&self) -> String {
        let auc = self
            .auc_roc
            .map(|a| format!("{:.4}", a))
            .unwrap_or_else(|| "n/a".to_string());
        format!(
            "Decision rule:     hallucinated if {}\n{}\nAUC-ROC:           {}\nHallucinated scores: mean {:.4}, std {:.4} (n={})\nFaithful scores:     mean {:.4}, std {:.4} (n={})\n",
            self.rule.describe(),
            self.classification.format(),
            auc,
            self.hallucinated.mean,
            self.hallucinated.std_dev,
            self.hallucinated.count,
            self.faithful.mean,
            self.faithful.std_dev,
            self.faithful.count,
        )
    }
}

/// Append-only tally of thresholded predictions and their scores
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsAccumulator {
    rule: DecisionRule,
    matrix: ConfusionMatrix,
    hallucinated_scores: Vec<f64>,
    faithful_scores: Vec<f64>,
}

impl MetricsAccumulator {
    pub fn new(rule: DecisionRule) -> Self {
        Self {
            rule,
            matrix: ConfusionMatrix::default(),
            hallucinated_scores: Vec::new(),
            faithful_scores: Vec::new(),
        }
    }

    /// Threshold a score and record it. Returns the prediction.
    pub fn record(&mut self, score: f64, actual: bool) -> bool {
        let predicted = self.rule.predicts_hallucination(score);
        self.record_prediction(predicted, actual, score);
        predicted
    }

    pub fn record_prediction(&mut self, predicted: bool, actual: bool, score: f64) {
        self.matrix.record(predicted, actual);
        if actual {
            self.hallucinated_scores.push(score);
        } else {
            self.faithful_scores.push(score);
        }
    }

    pub fn matrix(&self) -> &ConfusionMatrix {
        &self.matrix
    }

    pub fn report(&self) -> ScorerMetrics {
        ScorerMetrics {
            rule: self.rule,
            classification: ClassificationReport::from_confusion_matrix(self.matrix),
            hallucinated: ScoreDistribution::from_scores(&self.hallucinated_scores),
            faithful: ScoreDistribution::from_scores(&self.faithful_scores),
            auc_roc: self.auc_roc(),
        }
    }

    fn auc_roc(&self) -> Option<f64> {
        let to_severity = |s: &f64| self.rule.axis.to_severity(*s);
        let positives: Vec<f64> = self.hallucinated_scores.iter().map(to_severity).collect();
        let negatives: Vec<f64> = self.faithful_scores.iter().map(to_severity).collect();
        auc_roc(&positives, &negatives)
    }
}

/// AUC-ROC from rank statistics, ties counted as half.
/// Higher scores are taken to indicate the positive class.
pub fn auc_roc(positives: &[f64], negatives: &[f64]) -> Option<f64> {
    if positives.is_empty() || negatives.is_empty() {
        return None;
    }

    let mut scored: Vec<(f64, bool)> = positives
        .iter()
        .map(|&s| (s, true))
        .chain(negatives.iter().map(|&s| (s, false)))
        .collect();
    scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    // Sum of average ranks of the positives
    let mut positive_rank_sum = 0.0;
    let mut i = 0;
    while i < scored.len() {
        let mut j = i;
        while j + 1 < scored.len() && scored[j + 1].0 == scored[i].0 {
            j += 1;
        }
        let average_rank = (i + j) as f64 / 2.0 + 1.0;
        let tied_positives = scored[i..=j].iter().filter(|(_, positive)| *positive).count();
        positive_rank_sum += average_rank * tied_positives as f64;
        i = j + 1;
    }

    let n_pos = positives.len() as f64;
    let n_neg = negatives.len() as f64;
    Some((positive_rank_sum - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(tp: usize, fp: usize, tn: usize, fn_: usize) -> ConfusionMatrix {
        ConfusionMatrix { tp, tn, fp, fn_ }
    }

    #[test]
    fn test_reference_counts() {
        let cm = matrix(3, 1, 4, 2);

        assert_eq!(cm.total(), 10);
        assert!((cm.accuracy() - 0.7).abs() < 1e-6);
        assert!((cm.precision() - 0.75).abs() < 1e-6);
        assert!((cm.recall() - 0.6).abs() < 1e-6);
        assert!((cm.f1_score() - 2.0 / 3.0).abs() < 1e-6);
        assert!((cm.specificity() - 0.8).abs() < 1e-6);
        assert!((cm.balanced_accuracy() - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_zero_denominators() {
        let cm = matrix(0, 0, 5, 3);
        assert_eq!(cm.precision(), 0.0);
        assert_eq!(cm.recall(), 0.0);
        assert_eq!(cm.f1_score(), 0.0);
        assert_eq!(cm.mcc(), 0.0);

        let empty = ConfusionMatrix::default();
        assert_eq!(empty.accuracy(), 0.0);
        assert_eq!(empty.specificity(), 0.0);
    }

    #[test]
    fn test_from_predictions() {
        let predictions = vec![true, true, false, false, true];
        let ground_truth = vec![true, false, false, true, true];
        let cm = ConfusionMatrix::from_predictions(&predictions, &ground_truth);
        assert_eq!(cm, matrix(2, 1, 1, 1));
    }

    #[test]
    fn test_perfect_mcc() {
        let cm = matrix(50, 0, 50, 0);
        assert!((cm.mcc() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_threshold_direction_per_axis() {
        let consistency = DecisionRule::new(ScoreAxis::Consistency, 0.5);
        let severity = DecisionRule::new(ScoreAxis::Severity, 0.5);

        // A low score means hallucination only on the consistency axis
        assert!(consistency.predicts_hallucination(0.2));
        assert!(!severity.predicts_hallucination(0.2));
        // A high score means hallucination only on the severity axis
        assert!(!consistency.predicts_hallucination(0.8));
        assert!(severity.predicts_hallucination(0.8));
        // Equal to the threshold is never a hallucination
        assert!(!consistency.predicts_hallucination(0.5));
        assert!(!severity.predicts_hallucination(0.5));
    }

    #[test]
    fn test_accumulator_consistency_axis() {
        let mut acc = MetricsAccumulator::new(DecisionRule::new(ScoreAxis::Consistency, 0.5));
        assert!(acc.record(0.1, true));
        assert!(!acc.record(0.9, false));
        assert!(!acc.record(0.7, true));
        assert!(acc.record(0.3, false));

        assert_eq!(*acc.matrix(), matrix(1, 1, 1, 1));
        let report = acc.report();
        assert_eq!(report.hallucinated.count, 2);
        assert!((report.hallucinated.mean - 0.4).abs() < 1e-9);
        // Severity of hallucinated: 0.9, 0.3; faithful: 0.1, 0.7
        assert!((report.auc_roc.unwrap() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_score_distribution() {
        let single = ScoreDistribution::from_scores(&[0.4]);
        assert_eq!(single.std_dev, 0.0);
        assert_eq!(single.mean, 0.4);

        let dist = ScoreDistribution::from_scores(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((dist.mean - 5.0).abs() < 1e-9);
        assert!((dist.std_dev - (32.0f64 / 7.0).sqrt()).abs() < 1e-9);
        assert_eq!(dist.min, 2.0);
        assert_eq!(dist.max, 9.0);

        assert_eq!(ScoreDistribution::from_scores(&[]).count, 0);
    }

    #[test]
    fn test_auc_roc() {
        assert_eq!(auc_roc(&[0.9, 0.8], &[0.1, 0.2]), Some(1.0));
        assert_eq!(auc_roc(&[0.1], &[0.9]), Some(0.0));
        assert_eq!(auc_roc(&[0.5, 0.5], &[0.5]), Some(0.5));
        assert_eq!(auc_roc(&[], &[0.5]), None);
    }

    #[test]
    fn test_report_format() {
        let report = ClassificationReport::from_confusion_matrix(matrix(3, 1, 4, 2));
        let text = report.format();
        assert!(text.contains("Accuracy:          0.7000"));
        assert!(text.contains("Actual Hallucinated"));
    }
}
