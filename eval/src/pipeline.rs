// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Reproducible benchmark pipeline for hallucination detection
//!
//! Orchestrates:
//! - Seeded filtering and sampling of the RAGTruth dataset
//! - Backend evaluation, sequential or on a worker pool
//! - Thresholded metrics per scorer and backend agreement
//! - Results serialization (JSON, markdown report, per-sample CSV)
//!
//! All tallies are owned by a single reducer on the calling thread. Workers
//! only evaluate samples and send their evaluations back.

use crate::backends::BackendKind;
use crate::comparison::AgreementReport;
use crate::datasets::{DatasetStatistics, Dataset, Sample, SampleFilter, Selector, DEFAULT_DATASET_ROOT};
use crate::evaluator::{Evaluation, EvaluationMethod, HallucinationEvaluator, Scorer};
use crate::metrics::{DecisionRule, MetricsAccumulator, ScorerMetrics};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

/// Decision thresholds, one per scorer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Hallucinated when the consistency score is below this
    pub consistency: f64,
    /// Hallucinated when the judge's score is above this
    pub judgment: f64,
    /// Hallucinated when the ensemble score is above this
    pub ensemble: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            consistency: 0.5,
            judgment: 0.5,
            ensemble: 0.5,
        }
    }
}

impl Thresholds {
    pub fn rule(&self, scorer: Scorer) -> DecisionRule {
        let threshold = match scorer {
            Scorer::Consistency => self.consistency,
            Scorer::Judgment => self.judgment,
            Scorer::Ensemble => self.ensemble,
        };
        DecisionRule::new(scorer.axis(), threshold)
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("consistency", self.consistency),
            ("judgment", self.judgment),
            ("ensemble", self.ensemble),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                anyhow::bail!("{} threshold must be within [0, 1], got {}", name, value);
            }
        }
        Ok(())
    }
}

/// Configuration for the evaluation pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Directory holding `response.jsonl` and `source_info.jsonl`
    pub dataset_path: String,
    pub method: EvaluationMethod,
    pub thresholds: Thresholds,
    pub max_samples: usize,
    /// Sampling seed; `None` draws a fresh sample every run
    pub seed: Option<u64>,
    pub task_type: Selector,
    pub split: Selector,
    pub has_hallucination: Option<bool>,
    /// Samples whose source info is shorter than this are skipped
    pub min_source_chars: usize,
    pub workers: usize,
    /// Stop dispatching samples after this many seconds
    pub deadline_secs: Option<u64>,
    pub output_dir: String,
    pub show_progress: bool,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            dataset_path: DEFAULT_DATASET_ROOT.to_string(),
            method: EvaluationMethod::default(),
            thresholds: Thresholds::default(),
            max_samples: 100,
            seed: Some(42),
            task_type: Selector::All,
            split: Selector::only("test"),
            has_hallucination: None,
            min_source_chars: 10,
            workers: 1,
            deadline_secs: None,
            output_dir: "eval/results".to_string(),
            show_progress: true,
        }
    }
}

impl EvaluationConfig {
    pub fn filter(&self) -> SampleFilter {
        SampleFilter {
            task_type: self.task_type.clone(),
            split: self.split.clone(),
            has_hallucination: self.has_hallucination,
        }
    }
}

/// Cooperative stop signal: an explicit flag, an optional deadline, or both
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token sharing this one's flag that also expires after `after`
    pub fn with_deadline(&self, after: Duration) -> Self {
        let candidate = Instant::now() + after;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            flag: Arc::clone(&self.flag),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.deadline.map_or(false, |d| Instant::now() >= d)
    }
}

/// Call counts for one backend
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackendStats {
    pub backend: BackendKind,
    pub attempted: usize,
    pub succeeded: usize,
    pub degraded: usize,
}

impl BackendStats {
    fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            attempted: 0,
            succeeded: 0,
            degraded: 0,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.attempted == 0 {
            return 0.0;
        }
        self.succeeded as f64 / self.attempted as f64
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    /// Samples drawn after filtering and sampling
    pub selected: usize,
    /// Skipped for too-short source info
    pub skipped: usize,
    pub evaluated: usize,
    pub successful: usize,
    pub failed: usize,
    /// Successful evaluations that relied on a fallback verdict
    pub degraded: usize,
}

/// Metrics for one scorer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScorerResult {
    pub scorer: Scorer,
    pub metrics: ScorerMetrics,
}

/// One evaluated sample, as written to the verdict CSV
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleVerdict {
    pub id: String,
    pub task_type: String,
    pub split: String,
    pub model: String,
    pub actual: bool,
    pub consistency_score: Option<f64>,
    pub consistency_predicted: Option<bool>,
    pub judgment_score: Option<f64>,
    pub judgment_predicted: Option<bool>,
    pub ensemble_score: Option<f64>,
    pub ensemble_predicted: Option<bool>,
    pub success: bool,
    pub degraded: bool,
    pub errors: String,
}

/// Complete evaluation results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResults {
    pub config: EvaluationConfig,
    pub dataset: DatasetStatistics,
    pub backends: Vec<(BackendKind, String)>,
    pub counts: RunCounts,
    pub backend_stats: Vec<BackendStats>,
    pub scorers: Vec<ScorerResult>,
    pub agreement: Option<AgreementReport>,
    pub verdicts: Vec<SampleVerdict>,
    pub evaluation_secs: f64,
    /// The run stopped before every selected sample was evaluated
    pub cancelled: bool,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

impl EvaluationResults {
    pub fn scorer(&self, scorer: Scorer) -> Option<&ScorerMetrics> {
        self.scorers.iter().find(|r| r.scorer == scorer).map(|r| &r.metrics)
    }

    pub fn success_rate(&self) -> f64 {
        if self.counts.evaluated == 0 {
            return 0.0;
        }
        self.counts.successful as f64 / self.counts.evaluated as f64
    }
}

/// Single-writer reduction of evaluations into tallies
struct Tally {
    accumulators: Vec<(Scorer, MetricsAccumulator)>,
    backend_stats: Vec<BackendStats>,
    agreement: Option<AgreementReport>,
    verdicts: Vec<SampleVerdict>,
    counts: RunCounts,
}

impl Tally {
    fn new(method: EvaluationMethod, thresholds: &Thresholds) -> Self {
        Self {
            accumulators: method
                .scorers()
                .into_iter()
                .map(|scorer| (scorer, MetricsAccumulator::new(thresholds.rule(scorer))))
                .collect(),
            backend_stats: [BackendKind::Consistency, BackendKind::Judgment]
                .into_iter()
                .filter(|&kind| method.runs(kind))
                .map(BackendStats::new)
                .collect(),
            agreement: (method == EvaluationMethod::BothIndependent).then(AgreementReport::default),
            verdicts: Vec::new(),
            counts: RunCounts::default(),
        }
    }

    fn absorb(&mut self, sample: &Sample<'_>, evaluation: &Evaluation) {
        let actual = sample.has_hallucination();
        let degraded = evaluation.degraded();

        self.counts.evaluated += 1;
        if evaluation.success {
            self.counts.successful += 1;
            if degraded {
                self.counts.degraded += 1;
            }
        } else {
            self.counts.failed += 1;
            tracing::warn!("Sample {} failed: {}", sample.response.id, evaluation.errors.join("; "));
        }

        for stats in &mut self.backend_stats {
            if let Some(outcome) = evaluation.outcome(stats.backend) {
                stats.attempted += 1;
                if outcome.success {
                    stats.succeeded += 1;
                    if outcome.degraded {
                        stats.degraded += 1;
                    }
                }
            }
        }

        let mut verdict = SampleVerdict {
            id: sample.response.id.clone(),
            task_type: sample.task_type().to_string(),
            split: sample.response.split.clone(),
            model: sample.response.model.clone(),
            actual,
            consistency_score: None,
            consistency_predicted: None,
            judgment_score: None,
            judgment_predicted: None,
            ensemble_score: None,
            ensemble_predicted: None,
            success: evaluation.success,
            degraded,
            errors: evaluation.errors.join("; "),
        };

        for (scorer, accumulator) in &mut self.accumulators {
            let Some(score) = evaluation.score_for(*scorer) else {
                continue;
            };
            let predicted = accumulator.record(score, actual);
            let (score_slot, predicted_slot) = match scorer {
                Scorer::Consistency => (&mut verdict.consistency_score, &mut verdict.consistency_predicted),
                Scorer::Judgment => (&mut verdict.judgment_score, &mut verdict.judgment_predicted),
                Scorer::Ensemble => (&mut verdict.ensemble_score, &mut verdict.ensemble_predicted),
            };
            *score_slot = Some(score);
            *predicted_slot = Some(predicted);
        }

        if let (Some(agreement), Some(c), Some(j)) =
            (self.agreement.as_mut(), verdict.consistency_predicted, verdict.judgment_predicted)
        {
            agreement.record(c, j, actual);
        }

        self.verdicts.push(verdict);
    }
}

/// Main evaluation pipeline
pub struct EvaluationPipeline {
    config: EvaluationConfig,
    evaluator: HallucinationEvaluator,
}

impl EvaluationPipeline {
    pub fn new(config: EvaluationConfig, evaluator: HallucinationEvaluator) -> Self {
        Self { config, evaluator }
    }

    fn evaluate_sample(&self, sample: &Sample<'_>) -> Evaluation {
        self.evaluator
            .evaluate(sample.generated_text(), &sample.source_texts(), self.config.method)
    }

    /// Run the full evaluation over a loaded dataset
    pub fn run(&self, dataset: &Dataset, cancel: &CancelToken) -> Result<EvaluationResults> {
        self.config.thresholds.validate()?;

        let cancel = match self.config.deadline_secs {
            Some(secs) => cancel.with_deadline(Duration::from_secs(secs)),
            None => cancel.clone(),
        };

        let selected = dataset.select(&self.config.filter(), self.config.max_samples, self.config.seed);
        let selected_count = selected.len();
        let (work, short): (Vec<Sample<'_>>, Vec<Sample<'_>>) = selected
            .into_iter()
            .partition(|s| s.source.source_info.char_len() >= self.config.min_source_chars);

        for sample in &short {
            tracing::debug!("Skipping {}: source info too short", sample.response.id);
        }
        if !short.is_empty() {
            tracing::warn!(
                "Skipped {} samples with source info shorter than {} characters",
                short.len(),
                self.config.min_source_chars
            );
        }
        if work.is_empty() {
            tracing::warn!("No samples to evaluate after filtering");
        }

        tracing::info!(
            "Evaluating {} samples with method {} on {} worker(s)",
            work.len(),
            self.config.method,
            self.config.workers.max(1)
        );

        let progress = self.progress_bar(work.len());
        let mut tally = Tally::new(self.config.method, &self.config.thresholds);
        let started = Instant::now();

        if self.config.workers > 1 {
            self.run_parallel(&work, &cancel, &mut tally, &progress);
        } else {
            self.run_sequential(&work, &cancel, &mut tally, &progress);
        }

        let evaluation_secs = started.elapsed().as_secs_f64();
        progress.finish_and_clear();

        let cancelled = tally.counts.evaluated < work.len();
        if cancelled {
            tracing::warn!(
                "Evaluation cancelled after {} of {} samples",
                tally.counts.evaluated,
                work.len()
            );
        }

        tally.counts.selected = selected_count;
        tally.counts.skipped = short.len();

        let scorers: Vec<ScorerResult> = tally
            .accumulators
            .iter()
            .map(|(scorer, acc)| ScorerResult {
                scorer: *scorer,
                metrics: acc.report(),
            })
            .collect();

        for result in &scorers {
            let c = &result.metrics.classification;
            tracing::info!(
                "  {} - Accuracy: {:.4}, F1: {:.4}, MCC: {:.4}",
                result.scorer,
                c.accuracy,
                c.f1_score,
                c.mcc
            );
        }

        Ok(EvaluationResults {
            config: self.config.clone(),
            dataset: dataset.statistics(),
            backends: self.evaluator.backend_names(),
            counts: tally.counts,
            backend_stats: tally.backend_stats,
            scorers,
            agreement: tally.agreement,
            verdicts: tally.verdicts,
            evaluation_secs,
            cancelled,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    fn run_sequential(&self, work: &[Sample<'_>], cancel: &CancelToken, tally: &mut Tally, progress: &ProgressBar) {
        for sample in work {
            if cancel.is_cancelled() {
                break;
            }
            let evaluation = self.evaluate_sample(sample);
            if cancel.is_cancelled() {
                break;
            }
            tally.absorb(sample, &evaluation);
            progress.inc(1);
        }
    }

    fn run_parallel(&self, work: &[Sample<'_>], cancel: &CancelToken, tally: &mut Tally, progress: &ProgressBar) {
        let next = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel::<(usize, Evaluation)>();

        std::thread::scope(|scope| {
            for _ in 0..self.config.workers {
                let tx = tx.clone();
                let next = &next;
                scope.spawn(move || loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let idx = next.fetch_add(1, Ordering::SeqCst);
                    let Some(sample) = work.get(idx) else {
                        break;
                    };
                    let evaluation = self.evaluate_sample(sample);
                    if tx.send((idx, evaluation)).is_err() {
                        break;
                    }
                });
            }
            drop(tx);

            for (idx, evaluation) in rx {
                // Late arrivals after a stop are dropped
                if cancel.is_cancelled() {
                    continue;
                }
                tally.absorb(&work[idx], &evaluation);
                progress.inc(1);
            }
        });
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        let style = ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta})")
            .map(|s| s.progress_chars("#>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);
        pb
    }

    /// Save results to JSON file
    pub fn save_results(results: &EvaluationResults, output_path: &Path) -> Result<()> {
        ensure_parent(output_path)?;
        let json = serde_json::to_string_pretty(results)?;
        std::fs::write(output_path, json)
            .with_context(|| format!("Failed to write results to {}", output_path.display()))?;
        tracing::info!("Results saved to {}", output_path.display());
        Ok(())
    }

    /// Write one CSV row per evaluated sample
    pub fn save_verdicts_csv(results: &EvaluationResults, output_path: &Path) -> Result<()> {
        ensure_parent(output_path)?;
        let mut writer = csv::Writer::from_path(output_path)
            .with_context(|| format!("Failed to create {}", output_path.display()))?;
        for verdict in &results.verdicts {
            writer.serialize(verdict)?;
        }
        writer.flush()?;
        tracing::info!("Verdicts saved to {}", output_path.display());
        Ok(())
    }

    /// Write JSON, markdown and CSV outputs into a directory
    pub fn save_all(results: &EvaluationResults, output_dir: &Path) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;

        let stem = format!(
            "ragtruth_{}_{}",
            results.config.method,
            results.timestamp.format("%Y%m%d_%H%M%S")
        );
        let json_path = output_dir.join(format!("{}.json", stem));
        let md_path = output_dir.join(format!("{}.md", stem));
        let csv_path = output_dir.join(format!("{}_verdicts.csv", stem));

        Self::save_results(results, &json_path)?;
        std::fs::write(&md_path, Self::generate_report(results))
            .with_context(|| format!("Failed to write report to {}", md_path.display()))?;
        Self::save_verdicts_csv(results, &csv_path)?;

        Ok(vec![json_path, md_path, csv_path])
    }

    /// Generate a markdown report
    pub fn generate_report(results: &EvaluationResults) -> String {
        let mut report = String::new();

        report.push_str("# Hallucination Detection Evaluation Report\n\n");
        report.push_str(&format!("**Generated:** {}\n\n", results.timestamp.format("%Y-%m-%d %H:%M:%S UTC")));
        report.push_str(&format!("**Version:** {}\n\n", results.version));
        report.push_str(&format!("**Method:** {}\n\n", results.config.method));

        report.push_str("## Dataset\n\n");
        report.push_str(&format!("- **Path:** {}\n", results.config.dataset_path));
        report.push_str(&format!("- **Responses:** {}\n", results.dataset.total_responses));
        report.push_str(&format!("- **Sources:** {}\n", results.dataset.total_sources));
        report.push_str(&format!(
            "- **Filters:** task={}, split={}, has_hallucination={}\n",
            results.config.task_type,
            results.config.split,
            results
                .config
                .has_hallucination
                .map_or("any".to_string(), |h| h.to_string())
        ));
        report.push_str(&format!(
            "- **Sampling:** max {} samples, seed {}\n\n",
            results.config.max_samples,
            results.config.seed.map_or("none".to_string(), |s| s.to_string())
        ));

        report.push_str("## Run\n\n");
        let counts = &results.counts;
        report.push_str(&format!("- Selected: {}\n", counts.selected));
        report.push_str(&format!("- Skipped (short source): {}\n", counts.skipped));
        report.push_str(&format!("- Evaluated: {}\n", counts.evaluated));
        report.push_str(&format!(
            "- Successful: {} ({:.2}%)\n",
            counts.successful,
            results.success_rate() * 100.0
        ));
        report.push_str(&format!("- Failed: {}\n", counts.failed));
        report.push_str(&format!("- Degraded verdicts: {}\n", counts.degraded));
        report.push_str(&format!("- Evaluation time: {:.2}s\n", results.evaluation_secs));
        if results.cancelled {
            report.push_str("- **Cancelled before completion**\n");
        }
        report.push('\n');

        if !results.backend_stats.is_empty() {
            report.push_str("### Backends\n\n");
            report.push_str("| Backend | Model | Attempted | Succeeded | Success Rate | Degraded |\n");
            report.push_str("|---------|-------|-----------|-----------|--------------|----------|\n");
            for stats in &results.backend_stats {
                let name = results
                    .backends
                    .iter()
                    .find(|(kind, _)| *kind == stats.backend)
                    .map_or("-", |(_, name)| name.as_str());
                report.push_str(&format!(
                    "| {} | {} | {} | {} | {:.2}% | {} |\n",
                    stats.backend,
                    name,
                    stats.attempted,
                    stats.succeeded,
                    stats.success_rate() * 100.0,
                    stats.degraded
                ));
            }
            report.push('\n');
        }

        report.push_str("## Summary\n\n");
        report.push_str("| Scorer | Rule | Accuracy | Precision | Recall | F1 Score | MCC | AUC-ROC |\n");
        report.push_str("|--------|------|----------|-----------|--------|----------|-----|---------|\n");
        for result in &results.scorers {
            let m = &result.metrics;
            let auc = m.auc_roc.map_or("-".to_string(), |v| format!("{:.4}", v));
            report.push_str(&format!(
                "| {} | {} | {:.4} | {:.4} | {:.4} | {:.4} | {:.4} | {} |\n",
                result.scorer,
                m.rule.describe(),
                m.classification.accuracy,
                m.classification.precision,
                m.classification.recall,
                m.classification.f1_score,
                m.classification.mcc,
                auc
            ));
        }

        report.push_str("\n## Detailed Results\n\n");
        for result in &results.scorers {
            report.push_str(&format!("### {}\n\n", result.scorer));
            report.push_str(&format!("```\n{}\n```\n\n", result.metrics.format()));
        }

        if let Some(agreement) = &results.agreement {
            report.push_str("## Backend Agreement\n\n");
            report.push_str(&format!("```\n{}\n```\n\n", agreement.format()));
        }

        report.push_str("## Configuration\n\n");
        report.push_str(&format!(
            "```json\n{}\n```\n",
            serde_json::to_string_pretty(&results.config).unwrap_or_default()
        ));

        report
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{BackendError, RawScore};
    use crate::testing::{response, text_source, StubBackend};

    fn dataset() -> Dataset {
        let mut responses = Vec::new();
        for i in 0..12 {
            responses.push(response(&format!("r{}", i), "s1", "test", i % 3 == 0));
        }
        responses.push(response("r-short", "s2", "test", true));
        responses.push(response("r-train", "s1", "train", false));
        Dataset::from_records(
            responses,
            vec![
                text_source("s1", "QA", "The Eiffel Tower is in Paris, France."),
                text_source("s2", "QA", "short"),
            ],
        )
    }

    fn config(method: EvaluationMethod) -> EvaluationConfig {
        EvaluationConfig {
            method,
            show_progress: false,
            ..Default::default()
        }
    }

    fn evaluator() -> HallucinationEvaluator {
        HallucinationEvaluator::new(
            Some(Box::new(StubBackend::by_content(BackendKind::Consistency))),
            Some(Box::new(StubBackend::by_content(BackendKind::Judgment))),
        )
        .unwrap()
    }

    fn run(config: EvaluationConfig) -> EvaluationResults {
        EvaluationPipeline::new(config, evaluator())
            .run(&dataset(), &CancelToken::new())
            .unwrap()
    }

    #[test]
    fn test_ensemble_run() {
        let results = run(config(EvaluationMethod::Ensemble));

        assert_eq!(results.counts.selected, 13);
        assert_eq!(results.counts.skipped, 1);
        assert_eq!(results.counts.evaluated, 12);
        assert_eq!(results.counts.successful, 12);
        assert!(!results.cancelled);

        let ensemble = results.scorer(Scorer::Ensemble).unwrap();
        assert_eq!(ensemble.classification.confusion_matrix.tp, 4);
        assert_eq!(ensemble.classification.confusion_matrix.tn, 8);
        assert!((ensemble.classification.accuracy - 1.0).abs() < 1e-9);
        assert_eq!(ensemble.auc_roc, Some(1.0));
        assert!(results.agreement.is_none());
    }

    #[test]
    fn test_both_independent_reports_agreement() {
        let results = run(config(EvaluationMethod::BothIndependent));

        assert_eq!(results.scorers.len(), 2);
        let consistency = results.scorer(Scorer::Consistency).unwrap();
        assert!((consistency.classification.accuracy - 1.0).abs() < 1e-9);

        let agreement = results.agreement.unwrap();
        assert_eq!(agreement.samples, 12);
        assert!((agreement.agreement_rate() - 1.0).abs() < 1e-9);
        assert_eq!(agreement.both_correct, 12);
        assert_eq!(results.backend_stats.len(), 2);
    }

    #[test]
    fn test_split_filter_and_sampling() {
        let mut cfg = config(EvaluationMethod::ConsistencyOnly);
        cfg.split = Selector::only("train");
        let results = run(cfg);
        assert_eq!(results.counts.evaluated, 1);

        let mut cfg = config(EvaluationMethod::ConsistencyOnly);
        cfg.max_samples = 5;
        let first = run(cfg.clone());
        let second = run(cfg);
        let ids = |r: &EvaluationResults| r.verdicts.iter().map(|v| v.id.clone()).collect::<Vec<_>>();
        assert_eq!(first.counts.selected, 5);
        assert_eq!(ids(&first), ids(&second));
    }

    #[test]
    fn test_workers_match_sequential() {
        let sequential = run(config(EvaluationMethod::Ensemble));
        let mut cfg = config(EvaluationMethod::Ensemble);
        cfg.workers = 4;
        let parallel = run(cfg);

        assert_eq!(parallel.counts, sequential.counts);
        assert_eq!(
            parallel.scorer(Scorer::Ensemble).unwrap().classification.confusion_matrix,
            sequential.scorer(Scorer::Ensemble).unwrap().classification.confusion_matrix
        );

        let mut ids: Vec<String> = parallel.verdicts.iter().map(|v| v.id.clone()).collect();
        let mut expected: Vec<String> = sequential.verdicts.iter().map(|v| v.id.clone()).collect();
        ids.sort();
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_cancelled_before_start() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let results = EvaluationPipeline::new(config(EvaluationMethod::Ensemble), evaluator())
            .run(&dataset(), &cancel)
            .unwrap();

        assert_eq!(results.counts.evaluated, 0);
        assert!(results.cancelled);
        assert_eq!(results.scorer(Scorer::Ensemble).unwrap().classification.support, 0);
    }

    #[test]
    fn test_cancel_mid_run_discards_late_result() {
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let judge = StubBackend::new(BackendKind::Judgment, move |_, _| {
            trigger.cancel();
            Ok(RawScore::new(0.9).with_confidence(0.9))
        });
        let calls = judge.call_counter();
        let evaluator = HallucinationEvaluator::new(None, Some(Box::new(judge))).unwrap();

        let results = EvaluationPipeline::new(config(EvaluationMethod::JudgmentOnly), evaluator)
            .run(&dataset(), &cancel)
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(results.counts.evaluated, 0);
        assert!(results.verdicts.is_empty());
        assert!(results.cancelled);
    }

    #[test]
    fn test_cancel_mid_run_on_workers_keeps_tally_consistent() {
        let responses = (0..40)
            .map(|i| response(&format!("r{}", i), "s1", "test", i % 2 == 0))
            .collect();
        let dataset = Dataset::from_records(
            responses,
            vec![text_source("s1", "QA", "The Eiffel Tower is in Paris, France.")],
        );

        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let seen = Arc::new(AtomicUsize::new(0));
        let judge = StubBackend::new(BackendKind::Judgment, move |_, _| {
            if seen.fetch_add(1, Ordering::SeqCst) + 1 == 6 {
                trigger.cancel();
            }
            Ok(RawScore::new(0.9).with_confidence(0.9))
        });
        let calls = judge.call_counter();
        let evaluator = HallucinationEvaluator::new(None, Some(Box::new(judge))).unwrap();

        let mut cfg = config(EvaluationMethod::JudgmentOnly);
        cfg.workers = 4;
        let results = EvaluationPipeline::new(cfg, evaluator).run(&dataset, &cancel).unwrap();

        let calls = calls.load(Ordering::SeqCst);
        assert!(calls >= 6 && calls < 40, "calls = {}", calls);
        assert!(results.cancelled);
        assert_eq!(results.counts.selected, 40);
        assert!(results.counts.evaluated < 6);

        let support = results.scorer(Scorer::Judgment).unwrap().classification.support;
        assert_eq!(results.counts.evaluated, support);
        assert_eq!(results.counts.evaluated, results.verdicts.len());
        assert_eq!(results.counts.evaluated, results.counts.successful + results.counts.failed);
    }

    #[test]
    fn test_deadline_token() {
        let token = CancelToken::new().with_deadline(Duration::from_secs(0));
        assert!(token.is_cancelled());
        assert!(!CancelToken::new().with_deadline(Duration::from_secs(3600)).is_cancelled());
    }

    #[test]
    fn test_failures_and_degraded_counted() {
        let consistency = StubBackend::failing(BackendKind::Consistency, BackendError::Timeout);
        let judge = StubBackend::new(BackendKind::Judgment, |_, _| {
            Ok(RawScore::new(0.6).with_confidence(0.7).degraded())
        });
        let evaluator = HallucinationEvaluator::new(Some(Box::new(consistency)), Some(Box::new(judge))).unwrap();

        let results = EvaluationPipeline::new(config(EvaluationMethod::BothIndependent), evaluator)
            .run(&dataset(), &CancelToken::new())
            .unwrap();

        assert_eq!(results.counts.successful, 12);
        assert_eq!(results.counts.degraded, 12);
        let stats = &results.backend_stats;
        assert_eq!(stats[0].backend, BackendKind::Consistency);
        assert_eq!(stats[0].succeeded, 0);
        assert_eq!(stats[1].degraded, 12);
        assert!((stats[1].success_rate() - 1.0).abs() < 1e-9);
        // Consistency never scored, so nothing was compared
        assert_eq!(results.agreement.unwrap().samples, 0);
        assert!(results.verdicts[0].errors.contains("timed out"));
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let mut cfg = config(EvaluationMethod::Ensemble);
        cfg.thresholds.ensemble = 1.5;
        let err = EvaluationPipeline::new(cfg, evaluator())
            .run(&dataset(), &CancelToken::new())
            .unwrap_err();
        assert!(err.to_string().contains("ensemble threshold"));
    }

    #[test]
    fn test_generate_report() {
        let results = run(config(EvaluationMethod::BothIndependent));
        let report = EvaluationPipeline::generate_report(&results);

        assert!(report.contains("Hallucination Detection Evaluation Report"));
        assert!(report.contains("| consistency | score < 0.50 |"));
        assert!(report.contains("| judgment | score > 0.50 |"));
        assert!(report.contains("Backend Agreement"));
    }

    #[test]
    fn test_save_outputs() {
        let results = run(config(EvaluationMethod::Ensemble));
        let dir = tempfile::tempdir().unwrap();

        let paths = EvaluationPipeline::save_all(&results, dir.path()).unwrap();
        assert_eq!(paths.len(), 3);

        let json = std::fs::read_to_string(&paths[0]).unwrap();
        let parsed: EvaluationResults = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.counts, results.counts);

        let csv = std::fs::read_to_string(&paths[2]).unwrap();
        assert!(csv.starts_with("id,task_type,split,model,actual"));
        assert_eq!(csv.lines().count(), results.counts.evaluated + 1);
    }
}
