// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Hallucination detection for retrieval-augmented generation
//!
//! This crate provides:
//! - RAGTruth dataset loading, filtering and seeded sampling
//! - Scoring backends: a factual-consistency scorer and an LLM judge
//! - Confidence-weighted ensemble of backend verdicts
//! - Threshold-based classification metrics per scorer
//! - A reproducible benchmark pipeline with JSON, markdown and CSV outputs

pub mod backends;
pub mod comparison;
pub mod datasets;
pub mod ensemble;
pub mod evaluator;
pub mod metrics;
pub mod pipeline;

#[cfg(test)]
pub(crate) mod testing;

pub use backends::{
    BackendCredentials, BackendError, BackendKind, BackendSettings, ScoreAxis, ScoreBackend, ScoreOutcome,
};
pub use comparison::AgreementReport;
pub use datasets::{Dataset, DatasetStatistics, Response, Sample, SampleFilter, Selector, SourceInfo, SourceRecord};
pub use ensemble::{EnsembleCombiner, EnsembleOutcome, InvalidConfidence, SeverityBand};
pub use evaluator::{Evaluation, EvaluationMethod, EvaluationRequest, EvaluatorError, HallucinationEvaluator, Scorer};
pub use metrics::{ClassificationReport, ConfusionMatrix, DecisionRule, MetricsAccumulator, ScorerMetrics};
pub use pipeline::{CancelToken, EvaluationConfig, EvaluationPipeline, EvaluationResults, Thresholds};
