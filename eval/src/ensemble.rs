// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Confidence-weighted ensemble of backend outcomes
//!
//! Every successful outcome is mapped onto the severity axis and weighted by
//! its confidence:
//! - consistency scores become `1 - score` with a fixed confidence
//! - judgment scores keep their value and the judge's own confidence
//!
//! The ensemble confidence is the plain mean of the contributing confidences.

use crate::backends::{BackendKind, ScoreOutcome};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Confidence attached to a consistency contribution
pub const CONSISTENCY_CONFIDENCE: f64 = 0.9;
/// Confidence used when the judge reports none
pub const JUDGMENT_FALLBACK_CONFIDENCE: f64 = 0.7;

/// Severity band of a combined score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeverityBand {
    Negligible,
    Low,
    Mild,
    Moderate,
    Severe,
}

impl SeverityBand {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            SeverityBand::Severe
        } else if score >= 0.6 {
            SeverityBand::Moderate
        } else if score >= 0.4 {
            SeverityBand::Mild
        } else if score >= 0.2 {
            SeverityBand::Low
        } else {
            SeverityBand::Negligible
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            SeverityBand::Severe => "Severe hallucination",
            SeverityBand::Moderate => "Clear hallucination",
            SeverityBand::Mild => "Mild hallucination",
            SeverityBand::Low => "Mostly accurate",
            SeverityBand::Negligible => "Highly accurate",
        }
    }
}

impl fmt::Display for SeverityBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// One backend's share of an ensemble score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub backend: BackendKind,
    pub severity: f64,
    pub confidence: f64,
    pub interpretation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleOutcome {
    pub score: Option<f64>,
    pub confidence: Option<f64>,
    pub band: Option<SeverityBand>,
    pub interpretation: Option<String>,
    pub contributions: Vec<Contribution>,
    pub errors: Vec<String>,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("{name} must be a finite value within [0, 1], got {value}")]
pub struct InvalidConfidence {
    pub name: &'static str,
    pub value: f64,
}

/// Combines backend outcomes. Both confidences are kept within [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnsembleCombiner {
    consistency_confidence: f64,
    judgment_fallback_confidence: f64,
}

impl Default for EnsembleCombiner {
    fn default() -> Self {
        Self {
            consistency_confidence: CONSISTENCY_CONFIDENCE,
            judgment_fallback_confidence: JUDGMENT_FALLBACK_CONFIDENCE,
        }
    }
}

impl EnsembleCombiner {
    pub fn new(consistency_confidence: f64, judgment_fallback_confidence: f64) -> Result<Self, InvalidConfidence> {
        for (name, value) in [
            ("consistency confidence", consistency_confidence),
            ("judgment fallback confidence", judgment_fallback_confidence),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(InvalidConfidence { name, value });
            }
        }
        Ok(Self {
            consistency_confidence,
            judgment_fallback_confidence,
        })
    }

    pub fn consistency_confidence(&self) -> f64 {
        self.consistency_confidence
    }

    pub fn judgment_fallback_confidence(&self) -> f64 {
        self.judgment_fallback_confidence
    }

    pub fn combine<'a>(&self, outcomes: impl IntoIterator<Item = &'a ScoreOutcome>) -> EnsembleOutcome {
        let mut contributions = Vec::new();
        let mut errors = Vec::new();

        for outcome in outcomes {
            match self.contribution(outcome) {
                Some(contribution) => contributions.push(contribution),
                None => errors.push(format!(
                    "{} backend failed: {}",
                    outcome.backend,
                    outcome.error.as_deref().unwrap_or("no score")
                )),
            }
        }

        let pairs: Vec<(f64, f64)> = contributions.iter().map(|c| (c.severity, c.confidence)).collect();

        match weighted_severity(&pairs) {
            Some((score, confidence)) => {
                let band = SeverityBand::from_score(score);
                let count = contributions.len();
                let interpretation = format!(
                    "{} (combined from {} backend{})",
                    band.description(),
                    count,
                    if count == 1 { "" } else { "s" }
                );
                EnsembleOutcome {
                    score: Some(score),
                    confidence: Some(confidence),
                    band: Some(band),
                    interpretation: Some(interpretation),
                    contributions,
                    errors,
                    success: true,
                }
            }
            None => {
                errors.push("no backend produced a usable score".to_string());
                EnsembleOutcome {
                    score: None,
                    confidence: None,
                    band: None,
                    interpretation: None,
                    contributions,
                    errors,
                    success: false,
                }
            }
        }
    }

    fn contribution(&self, outcome: &ScoreOutcome) -> Option<Contribution> {
        let severity = outcome.severity()?;
        let confidence = match outcome.backend {
            BackendKind::Consistency => self.consistency_confidence,
            BackendKind::Judgment => outcome.confidence.unwrap_or(self.judgment_fallback_confidence),
        };

        Some(Contribution {
            backend: outcome.backend,
            severity,
            confidence,
            interpretation: outcome.interpretation().unwrap_or_default().to_string(),
        })
    }
}

/// Confidence-weighted mean of `(severity, confidence)` pairs and the mean confidence.
/// Falls back to the unweighted mean when every confidence is zero.
pub fn weighted_severity(pairs: &[(f64, f64)]) -> Option<(f64, f64)> {
    if pairs.is_empty() {
        return None;
    }

    let n = pairs.len() as f64;
    let weight_sum: f64 = pairs.iter().map(|(_, c)| c).sum();
    let score = if weight_sum > 0.0 {
        pairs.iter().map(|(s, c)| s * c).sum::<f64>() / weight_sum
    } else {
        pairs.iter().map(|(s, _)| s).sum::<f64>() / n
    };
    let confidence = weight_sum / n;

    Some((score, confidence))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{BackendError, RawScore};
    use proptest::prelude::*;

    fn consistency(score: f64) -> ScoreOutcome {
        ScoreOutcome::scored(BackendKind::Consistency, RawScore::new(score))
    }

    fn judgment(score: f64, confidence: Option<f64>) -> ScoreOutcome {
        let mut raw = RawScore::new(score);
        raw.confidence = confidence;
        ScoreOutcome::scored(BackendKind::Judgment, raw)
    }

    #[test]
    fn test_both_backends_weighted() {
        // "Paris is in England" against "The Eiffel Tower is in Paris, France"
        let outcomes = [consistency(0.1), judgment(0.85, Some(0.8))];
        let result = EnsembleCombiner::default().combine(&outcomes);

        assert!(result.success);
        // (0.9 * 0.9 + 0.85 * 0.8) / 1.7
        assert!((result.score.unwrap() - 1.49 / 1.7).abs() < 1e-9);
        assert!((result.confidence.unwrap() - 0.85).abs() < 1e-9);
        assert_eq!(result.band, Some(SeverityBand::Severe));
        assert!(result.interpretation.unwrap().contains("2 backends"));
    }

    #[test]
    fn test_faithful_text_is_negligible() {
        let outcomes = [consistency(0.98), judgment(0.05, Some(0.95))];
        let result = EnsembleCombiner::default().combine(&outcomes);
        assert_eq!(result.band, Some(SeverityBand::Negligible));
    }

    #[test]
    fn test_judge_confidence_fallback() {
        let outcomes = [consistency(0.5), judgment(1.0, None)];
        let result = EnsembleCombiner::default().combine(&outcomes);
        // (0.5 * 0.9 + 1.0 * 0.7) / 1.6
        assert!((result.score.unwrap() - 0.71875).abs() < 1e-9);
        assert!((result.confidence.unwrap() - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_single_backend_passes_through() {
        let failed = ScoreOutcome::failed(BackendKind::Judgment, &BackendError::Timeout);
        let outcomes = [consistency(0.3), failed];
        let result = EnsembleCombiner::default().combine(&outcomes);

        assert!(result.success);
        assert!((result.score.unwrap() - 0.7).abs() < 1e-9);
        assert_eq!(result.contributions.len(), 1);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("timed out"));
        assert!(result.interpretation.unwrap().contains("1 backend)"));
    }

    #[test]
    fn test_no_successful_backend() {
        let outcomes = [
            ScoreOutcome::failed(BackendKind::Consistency, &BackendError::EmptyCandidate),
            ScoreOutcome::failed(BackendKind::Judgment, &BackendError::EmptyCandidate),
        ];
        let result = EnsembleCombiner::default().combine(&outcomes);
        assert!(!result.success);
        assert_eq!(result.score, None);
        assert_eq!(result.band, None);
    }

    #[test]
    fn test_zero_confidence_uses_plain_mean() {
        let (score, confidence) = weighted_severity(&[(0.2, 0.0), (0.6, 0.0)]).unwrap();
        assert!((score - 0.4).abs() < 1e-9);
        assert_eq!(confidence, 0.0);
        assert_eq!(weighted_severity(&[]), None);
    }

    #[test]
    fn test_band_edges() {
        assert_eq!(SeverityBand::from_score(0.8), SeverityBand::Severe);
        assert_eq!(SeverityBand::from_score(0.79), SeverityBand::Moderate);
        assert_eq!(SeverityBand::from_score(0.4), SeverityBand::Mild);
        assert_eq!(SeverityBand::from_score(0.2), SeverityBand::Low);
        assert_eq!(SeverityBand::from_score(0.0), SeverityBand::Negligible);
    }

    #[test]
    fn test_combiner_rejects_out_of_range_confidence() {
        for (c, j) in [(3.0, 0.7), (-0.8, 0.7), (0.9, 1.5), (f64::NAN, 0.7), (0.9, f64::INFINITY)] {
            assert!(EnsembleCombiner::new(c, j).is_err(), "accepted ({}, {})", c, j);
        }
        let err = EnsembleCombiner::new(3.0, 0.7).unwrap_err();
        assert_eq!(err.name, "consistency confidence");
        assert!(err.to_string().contains("[0, 1]"));
    }

    #[test]
    fn test_custom_combiner_keeps_confidence_in_range() {
        let combiner = EnsembleCombiner::new(1.0, 0.0).unwrap();
        assert_eq!(combiner.consistency_confidence(), 1.0);
        assert_eq!(combiner.judgment_fallback_confidence(), 0.0);

        let outcomes = [consistency(0.1), judgment(0.85, None)];
        let result = combiner.combine(&outcomes);
        // The judge carries zero weight, so only the consistency severity counts
        assert!((result.score.unwrap() - 0.9).abs() < 1e-9);
        assert!((result.confidence.unwrap() - 0.5).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn prop_ensemble_between_contributions(
            c in 0.0f64..=1.0,
            j in 0.0f64..=1.0,
            conf in 0.0f64..=1.0,
        ) {
            let outcomes = [consistency(c), judgment(j, Some(conf))];
            let result = EnsembleCombiner::default().combine(&outcomes);
            let score = result.score.unwrap();
            let lo = (1.0 - c).min(j);
            let hi = (1.0 - c).max(j);
            prop_assert!(score >= lo - 1e-9 && score <= hi + 1e-9);
            prop_assert!((0.0..=1.0).contains(&result.confidence.unwrap()));
        }
    }
}
