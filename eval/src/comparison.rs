// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Agreement between the consistency backend and the judge

use serde::{Deserialize, Serialize};

/// Tally of how two backends' predictions line up with each other and the truth
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgreementReport {
    pub samples: usize,
    pub agreements: usize,
    pub consistency_correct: usize,
    pub judgment_correct: usize,
    pub both_correct: usize,
    pub only_consistency_correct: usize,
    pub only_judgment_correct: usize,
    pub both_wrong: usize,
}

impl AgreementReport {
    /// Record one sample both backends scored
    pub fn record(&mut self, consistency_predicted: bool, judgment_predicted: bool, actual: bool) {
        let consistency_ok = consistency_predicted == actual;
        let judgment_ok = judgment_predicted == actual;

        self.samples += 1;
        if consistency_predicted == judgment_predicted {
            self.agreements += 1;
        }
        if consistency_ok {
            self.consistency_correct += 1;
        }
        if judgment_ok {
            self.judgment_correct += 1;
        }
        match (consistency_ok, judgment_ok) {
            (true, true) => self.both_correct += 1,
            (true, false) => self.only_consistency_correct += 1,
            (false, true) => self.only_judgment_correct += 1,
            (false, false) => self.both_wrong += 1,
        }
    }

    pub fn agreement_rate(&self) -> f64 {
        self.rate(self.agreements)
    }

    pub fn consistency_accuracy(&self) -> f64 {
        self.rate(self.consistency_correct)
    }

    pub fn judgment_accuracy(&self) -> f64 {
        self.rate(self.judgment_correct)
    }

    fn rate(&self, count: usize) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        count as f64 / self.samples as f64
    }

    pub fn format(&self) -> String {
        format!(
            r#"Backend Agreement
=================
Samples scored by both:    {}
Agreement rate:            {:.2}%
Consistency accuracy:      {:.2}%
Judgment accuracy:         {:.2}%
Both correct:              {}
Only consistency correct:  {}
Only judgment correct:     {}
Both wrong:                {}
"#,
            self.samples,
            self.agreement_rate() * 100.0,
            self.consistency_accuracy() * 100.0,
            self.judgment_accuracy() * 100.0,
            self.both_correct,
            self.only_consistency_correct,
            self.only_judgment_correct,
            self.both_wrong,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agreement_tally() {
        let mut report = AgreementReport::default();
        report.record(true, true, true);
        report.record(true, false, true);
        report.record(false, true, true);
        report.record(true, true, false);

        assert_eq!(report.samples, 4);
        assert_eq!(report.agreements, 2);
        assert_eq!(report.both_correct, 1);
        assert_eq!(report.only_consistency_correct, 1);
        assert_eq!(report.only_judgment_correct, 1);
        assert_eq!(report.both_wrong, 1);
        assert!((report.agreement_rate() - 0.5).abs() < 1e-9);
        assert!((report.consistency_accuracy() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_empty_report() {
        let report = AgreementReport::default();
        assert_eq!(report.agreement_rate(), 0.0);
        assert!(report.format().contains("Samples scored by both:    0"));
    }
}
