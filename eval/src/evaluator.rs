// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Hallucination evaluator
//!
//! Holds up to two backends (consistency and judgment) and runs them
//! according to an [`EvaluationMethod`]:
//! - `ConsistencyOnly` / `JudgmentOnly`: a single backend
//! - `BothIndependent`: both backends, reported side by side
//! - `Ensemble`: both backends, combined by [`EnsembleCombiner`]

use crate::backends::{
    BackendCredentials, BackendKind, BackendSettings, ConsistencyClient, JudgeClient, ScoreAxis, ScoreBackend,
    ScoreOutcome,
};
use crate::ensemble::{EnsembleCombiner, EnsembleOutcome};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvaluationMethod {
    ConsistencyOnly,
    JudgmentOnly,
    BothIndependent,
    #[default]
    Ensemble,
}

impl EvaluationMethod {
    pub const ALL: [EvaluationMethod; 4] = [
        EvaluationMethod::ConsistencyOnly,
        EvaluationMethod::JudgmentOnly,
        EvaluationMethod::BothIndependent,
        EvaluationMethod::Ensemble,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EvaluationMethod::ConsistencyOnly => "consistency-only",
            EvaluationMethod::JudgmentOnly => "judgment-only",
            EvaluationMethod::BothIndependent => "both-independent",
            EvaluationMethod::Ensemble => "ensemble",
        }
    }

    /// Whether this method calls the given backend
    pub fn runs(self, kind: BackendKind) -> bool {
        match self {
            EvaluationMethod::ConsistencyOnly => kind == BackendKind::Consistency,
            EvaluationMethod::JudgmentOnly => kind == BackendKind::Judgment,
            EvaluationMethod::BothIndependent | EvaluationMethod::Ensemble => true,
        }
    }

    /// Scores this method produces, each with its own decision rule
    pub fn scorers(self) -> Vec<Scorer> {
        match self {
            EvaluationMethod::ConsistencyOnly => vec![Scorer::Consistency],
            EvaluationMethod::JudgmentOnly => vec![Scorer::Judgment],
            EvaluationMethod::BothIndependent => vec![Scorer::Consistency, Scorer::Judgment],
            EvaluationMethod::Ensemble => vec![Scorer::Ensemble],
        }
    }
}

impl fmt::Display for EvaluationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvaluationMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "consistency-only" | "consistency" => Ok(EvaluationMethod::ConsistencyOnly),
            "judgment-only" | "judgment" | "judge" => Ok(EvaluationMethod::JudgmentOnly),
            "both" | "both-independent" => Ok(EvaluationMethod::BothIndependent),
            "ensemble" => Ok(EvaluationMethod::Ensemble),
            other => Err(format!(
                "unknown method '{}', expected consistency-only, judgment-only, both-independent or ensemble",
                other
            )),
        }
    }
}

/// A score stream that gets its own metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scorer {
    Consistency,
    Judgment,
    Ensemble,
}

impl Scorer {
    pub fn axis(self) -> ScoreAxis {
        match self {
            Scorer::Consistency => ScoreAxis::Consistency,
            Scorer::Judgment | Scorer::Ensemble => ScoreAxis::Severity,
        }
    }
}

impl fmt::Display for Scorer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scorer::Consistency => write!(f, "consistency"),
            Scorer::Judgment => write!(f, "judgment"),
            Scorer::Ensemble => write!(f, "ensemble"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvaluatorError {
    #[error("no scoring backend available: supply at least one API key")]
    NoBackendAvailable,
    #[error("a {found} backend was supplied for the {slot} slot")]
    SlotMismatch { slot: BackendKind, found: BackendKind },
}

/// One candidate text with its references, as read from batch input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub generated_text: String,
    #[serde(default)]
    pub source_texts: Vec<String>,
}

/// Everything one `evaluate` call produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub method: EvaluationMethod,
    pub consistency: Option<ScoreOutcome>,
    pub judgment: Option<ScoreOutcome>,
    pub ensemble: Option<EnsembleOutcome>,
    pub errors: Vec<String>,
    pub success: bool,
}

impl Evaluation {
    /// Successful score for a scorer, on that scorer's axis
    pub fn score_for(&self, scorer: Scorer) -> Option<f64> {
        match scorer {
            Scorer::Consistency => self.consistency.as_ref().and_then(ScoreOutcome::successful_score),
            Scorer::Judgment => self.judgment.as_ref().and_then(ScoreOutcome::successful_score),
            Scorer::Ensemble => self.ensemble.as_ref().filter(|e| e.success).and_then(|e| e.score),
        }
    }

    pub fn outcome(&self, kind: BackendKind) -> Option<&ScoreOutcome> {
        match kind {
            BackendKind::Consistency => self.consistency.as_ref(),
            BackendKind::Judgment => self.judgment.as_ref(),
        }
    }

    /// Whether any backend answered through its fallback path
    pub fn degraded(&self) -> bool {
        [&self.consistency, &self.judgment]
            .into_iter()
            .flatten()
            .any(|o| o.success && o.degraded)
    }
}

pub struct HallucinationEvaluator {
    consistency: Option<Box<dyn ScoreBackend>>,
    judgment: Option<Box<dyn ScoreBackend>>,
    combiner: EnsembleCombiner,
}

impl HallucinationEvaluator {
    /// Build from optional backends. At least one must be present and each
    /// must match its slot.
    pub fn new(
        consistency: Option<Box<dyn ScoreBackend>>,
        judgment: Option<Box<dyn ScoreBackend>>,
    ) -> Result<Self, EvaluatorError> {
        for (slot, backend) in [(BackendKind::Consistency, &consistency), (BackendKind::Judgment, &judgment)] {
            if let Some(backend) = backend {
                if backend.kind() != slot {
                    return Err(EvaluatorError::SlotMismatch {
                        slot,
                        found: backend.kind(),
                    });
                }
            }
        }

        if consistency.is_none() && judgment.is_none() {
            return Err(EvaluatorError::NoBackendAvailable);
        }

        Ok(Self {
            consistency,
            judgment,
            combiner: EnsembleCombiner::default(),
        })
    }

    /// Build HTTP backends for whichever credentials are present
    pub fn from_credentials(
        credentials: &BackendCredentials,
        settings: &BackendSettings,
    ) -> Result<Self, EvaluatorError> {
        let consistency = credentials.consistency_api_key.as_ref().and_then(|key| {
            match ConsistencyClient::new(key.clone(), settings) {
                Ok(client) => Some(Box::new(client) as Box<dyn ScoreBackend>),
                Err(e) => {
                    tracing::warn!("Consistency backend unavailable: {}", e);
                    None
                }
            }
        });
        if credentials.consistency_api_key.is_none() {
            tracing::warn!("No consistency API key, consistency backend disabled");
        }

        let judgment = credentials.judgment_api_key.as_ref().and_then(|key| {
            match JudgeClient::new(key.clone(), settings) {
                Ok(client) => Some(Box::new(client) as Box<dyn ScoreBackend>),
                Err(e) => {
                    tracing::warn!("Judgment backend unavailable: {}", e);
                    None
                }
            }
        });
        if credentials.judgment_api_key.is_none() {
            tracing::warn!("No judgment API key, judgment backend disabled");
        }

        Self::new(consistency, judgment)
    }

    pub fn with_combiner(mut self, combiner: EnsembleCombiner) -> Self {
        self.combiner = combiner;
        self
    }

    pub fn has_backend(&self, kind: BackendKind) -> bool {
        self.slot(kind).is_some()
    }

    /// Names of the configured backends
    pub fn backend_names(&self) -> Vec<(BackendKind, String)> {
        [BackendKind::Consistency, BackendKind::Judgment]
            .into_iter()
            .filter_map(|kind| self.slot(kind).map(|b| (kind, b.name().to_string())))
            .collect()
    }

    fn slot(&self, kind: BackendKind) -> Option<&dyn ScoreBackend> {
        match kind {
            BackendKind::Consistency => self.consistency.as_deref(),
            BackendKind::Judgment => self.judgment.as_deref(),
        }
    }

    pub fn evaluate(&self, candidate: &str, references: &[String], method: EvaluationMethod) -> Evaluation {
        let mut errors = Vec::new();
        let mut run = |kind: BackendKind| -> Option<ScoreOutcome> {
            if !method.runs(kind) {
                return None;
            }
            match self.slot(kind) {
                Some(backend) => {
                    let outcome = backend.evaluate(candidate, references);
                    if let Some(error) = &outcome.error {
                        errors.push(format!("{} evaluation failed: {}", kind, error));
                    }
                    Some(outcome)
                }
                None => {
                    errors.push(format!("{} backend not configured", kind));
                    None
                }
            }
        };

        let consistency = run(BackendKind::Consistency);
        let judgment = run(BackendKind::Judgment);

        let ensemble = match method {
            EvaluationMethod::Ensemble => Some(self.combiner.combine(consistency.iter().chain(judgment.iter()))),
            _ => None,
        };

        let succeeded = |o: &Option<ScoreOutcome>| o.as_ref().map_or(false, |o| o.success);
        let success = match method {
            EvaluationMethod::ConsistencyOnly => succeeded(&consistency),
            EvaluationMethod::JudgmentOnly => succeeded(&judgment),
            EvaluationMethod::BothIndependent => succeeded(&consistency) || succeeded(&judgment),
            EvaluationMethod::Ensemble => ensemble.as_ref().map_or(false, |e| e.success),
        };

        if !success && errors.is_empty() {
            errors.push("evaluation produced no score".to_string());
        }

        Evaluation {
            method,
            consistency,
            judgment,
            ensemble,
            errors,
            success,
        }
    }

    pub fn batch_evaluate(&self, requests: &[EvaluationRequest], method: EvaluationMethod) -> Vec<Evaluation> {
        requests
            .iter()
            .enumerate()
            .map(|(i, request)| {
                tracing::debug!("Batch item {}/{}", i + 1, requests.len());
                self.evaluate(&request.generated_text, &request.source_texts, method)
            })
            .collect()
    }

    /// Run the single-backend methods and the ensemble on the same input
    pub fn compare_methods(&self, candidate: &str, references: &[String]) -> Vec<(EvaluationMethod, Evaluation)> {
        [
            EvaluationMethod::ConsistencyOnly,
            EvaluationMethod::JudgmentOnly,
            EvaluationMethod::Ensemble,
        ]
        .into_iter()
        .map(|method| (method, self.evaluate(candidate, references, method)))
        .collect()
    }
}
