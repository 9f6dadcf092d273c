// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Scoring backends for hallucination detection
//!
//! Two backends sit behind the [`ScoreBackend`] trait:
//! - [`ConsistencyClient`]: factual-consistency scorer (higher = more consistent)
//! - [`JudgeClient`]: LLM hallucination judge (higher = more hallucinated)
//!
//! A backend never panics or propagates an error to its caller: every
//! failure is folded into an unsuccessful [`ScoreOutcome`].

pub mod consistency;
pub mod judgment;

pub use consistency::ConsistencyClient;
pub use judgment::{JudgeClient, JudgeModel};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of a backend's raw score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreAxis {
    /// Higher means more agreement with the references
    Consistency,
    /// Higher means more hallucination
    Severity,
}

impl ScoreAxis {
    /// Map a score on this axis onto the severity axis
    pub fn to_severity(self, score: f64) -> f64 {
        match self {
            ScoreAxis::Consistency => 1.0 - score,
            ScoreAxis::Severity => score,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Consistency,
    Judgment,
}

impl BackendKind {
    pub fn axis(self) -> ScoreAxis {
        match self {
            BackendKind::Consistency => ScoreAxis::Consistency,
            BackendKind::Judgment => ScoreAxis::Severity,
        }
    }

    /// Human-readable band for a raw score of this backend
    pub fn interpret(self, score: f64) -> &'static str {
        match self {
            BackendKind::Consistency => {
                if score >= 0.8 {
                    "Highly consistent - the text agrees with the references"
                } else if score >= 0.6 {
                    "Mostly consistent - minor deviations from the references"
                } else if score >= 0.4 {
                    "Partially consistent - noticeable differences from the references"
                } else if score >= 0.2 {
                    "Weakly consistent - serious differences from the references"
                } else {
                    "Severely inconsistent - the text conflicts with the references"
                }
            }
            BackendKind::Judgment => {
                if score >= 0.8 {
                    "Severe hallucination - largely false or inaccurate content"
                } else if score >= 0.6 {
                    "Clear hallucination - evident factual errors"
                } else if score >= 0.4 {
                    "Mild hallucination - some inaccurate statements"
                } else if score >= 0.2 {
                    "Mostly accurate - minor issues"
                } else {
                    "Highly accurate - consistent with the references"
                }
            }
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Consistency => write!(f, "consistency"),
            BackendKind::Judgment => write!(f, "judgment"),
        }
    }
}

/// Why a backend produced no score
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("generated text is empty")]
    EmptyCandidate,
    #[error("reference texts are empty")]
    EmptyReferences,
    #[error("request timed out")]
    Timeout,
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request failed: {0}")]
    Transport(String),
    #[error("malformed response: {0}")]
    MalformedPayload(String),
    #[error("client setup failed: {0}")]
    Client(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Timeout
        } else if err.is_decode() {
            BackendError::MalformedPayload(err.to_string())
        } else if err.is_builder() {
            BackendError::Client(err.to_string())
        } else {
            BackendError::Transport(err.to_string())
        }
    }
}

/// A score as returned by a backend, before bounds checking
#[derive(Debug, Clone, PartialEq)]
pub struct RawScore {
    pub score: f64,
    pub confidence: Option<f64>,
    pub explanation: Option<String>,
    /// Produced by a fallback path rather than the backend's structured answer
    pub degraded: bool,
}

impl RawScore {
    pub fn new(score: f64) -> Self {
        Self {
            score,
            confidence: None,
            explanation: None,
            degraded: false,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }

    pub fn degraded(mut self) -> Self {
        self.degraded = true;
        self
    }
}

/// Result of one backend call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreOutcome {
    pub backend: BackendKind,
    /// Raw score on the backend's own axis, in [0, 1]
    pub score: Option<f64>,
    pub confidence: Option<f64>,
    pub explanation: Option<String>,
    pub degraded: bool,
    pub success: bool,
    pub error: Option<String>,
}

impl ScoreOutcome {
    pub fn scored(backend: BackendKind, raw: RawScore) -> Self {
        Self {
            backend,
            score: Some(raw.score),
            confidence: raw.confidence,
            explanation: raw.explanation,
            degraded: raw.degraded,
            success: true,
            error: None,
        }
    }

    pub fn failed(backend: BackendKind, error: &BackendError) -> Self {
        Self {
            backend,
            score: None,
            confidence: None,
            explanation: None,
            degraded: false,
            success: false,
            error: Some(error.to_string()),
        }
    }

    /// Score mapped onto the severity axis, if the call succeeded
    pub fn severity(&self) -> Option<f64> {
        self.successful_score().map(|s| self.backend.axis().to_severity(s))
    }

    pub fn successful_score(&self) -> Option<f64> {
        if self.success {
            self.score
        } else {
            None
        }
    }

    pub fn interpretation(&self) -> Option<&'static str> {
        self.successful_score().map(|s| self.backend.interpret(s))
    }
}

/// Capability shared by every scorer
pub trait ScoreBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn name(&self) -> &str;

    /// Perform the backend call. Inputs are already trimmed and non-empty.
    fn score(&self, candidate: &str, references: &[String]) -> Result<RawScore, BackendError>;

    /// Validate inputs, call the backend and fold any failure into the outcome
    fn evaluate(&self, candidate: &str, references: &[String]) -> ScoreOutcome {
        let kind = self.kind();
        let result = prepare_inputs(candidate, references)
            .and_then(|(candidate, references)| self.score(candidate, &references))
            .and_then(check_bounds);

        match result {
            Ok(raw) => {
                if raw.degraded {
                    tracing::warn!(backend = %kind, "Unstructured reply, using keyword estimate {:.2}", raw.score);
                }
                tracing::debug!(backend = %kind, score = raw.score, "Backend call succeeded");
                ScoreOutcome::scored(kind, raw)
            }
            Err(err) => {
                tracing::warn!(backend = %kind, "Backend call failed: {}", err);
                ScoreOutcome::failed(kind, &err)
            }
        }
    }
}

/// Trim the candidate and drop blank references
pub fn prepare_inputs<'a>(
    candidate: &'a str,
    references: &[String],
) -> Result<(&'a str, Vec<String>), BackendError> {
    let candidate = candidate.trim();
    if candidate.is_empty() {
        return Err(BackendError::EmptyCandidate);
    }

    let references: Vec<String> = references
        .iter()
        .map(|r| r.trim())
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect();
    if references.is_empty() {
        return Err(BackendError::EmptyReferences);
    }

    Ok((candidate, references))
}

pub fn is_probability(value: f64) -> bool {
    value.is_finite() && (0.0..=1.0).contains(&value)
}

fn check_bounds(raw: RawScore) -> Result<RawScore, BackendError> {
    if !is_probability(raw.score) {
        return Err(BackendError::MalformedPayload(format!("score {} outside [0, 1]", raw.score)));
    }
    if let Some(confidence) = raw.confidence {
        if !is_probability(confidence) {
            return Err(BackendError::MalformedPayload(format!(
                "confidence {} outside [0, 1]",
                confidence
            )));
        }
    }
    Ok(raw)
}

/// Transport settings shared by the HTTP backends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSettings {
    pub consistency_endpoint: String,
    pub consistency_model: String,
    pub judgment_endpoint: String,
    pub judgment_model: JudgeModel,
    pub judge_temperature: f64,
    pub judge_max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            consistency_endpoint: consistency::DEFAULT_ENDPOINT.to_string(),
            consistency_model: consistency::DEFAULT_MODEL.to_string(),
            judgment_endpoint: judgment::DEFAULT_ENDPOINT.to_string(),
            judgment_model: JudgeModel::default(),
            judge_temperature: 0.1,
            judge_max_tokens: 2000,
            timeout_secs: 30,
        }
    }
}

/// API keys for the two backends. An absent key means that backend is not built.
#[derive(Clone, Default)]
pub struct BackendCredentials {
    pub consistency_api_key: Option<String>,
    pub judgment_api_key: Option<String>,
}

impl BackendCredentials {
    pub fn new(consistency_api_key: Option<String>, judgment_api_key: Option<String>) -> Self {
        let present = |key: Option<String>| key.filter(|k| !k.trim().is_empty());
        Self {
            consistency_api_key: present(consistency_api_key),
            judgment_api_key: present(judgment_api_key),
        }
    }
}

impl fmt::Debug for BackendCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mask = |key: &Option<String>| if key.is_some() { "<set>" } else { "<unset>" };
        f.debug_struct("BackendCredentials")
            .field("consistency_api_key", &mask(&self.consistency_api_key))
            .field("judgment_api_key", &mask(&self.judgment_api_key))
            .finish()
    }
}

/// Cut a response body down for error messages
pub(crate) fn truncate_body(body: &str, max_chars: usize) -> String {
    if body.chars().count() <= max_chars {
        body.to_string()
    } else {
        let mut cut: String = body.chars().take(max_chars).collect();
        cut.push_str("...");
        cut
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubBackend;

    fn refs(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_empty_candidate_fails_without_call() {
        let backend = StubBackend::fixed(BackendKind::Consistency, 0.9, None);
        let calls = backend.call_counter();

        let outcome = backend.evaluate("   ", &refs(&["reference"]));
        assert!(!outcome.success);
        assert_eq!(outcome.score, None);
        assert_eq!(outcome.error.as_deref(), Some("generated text is empty"));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn test_blank_references_fail() {
        let backend = StubBackend::fixed(BackendKind::Judgment, 0.2, Some(0.8));
        assert!(!backend.evaluate("text", &[]).success);

        let outcome = backend.evaluate("text", &refs(&["", "  \n"]));
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("reference texts are empty"));
    }

    #[test]
    fn test_references_are_trimmed() {
        let (candidate, cleaned) = prepare_inputs("  hello ", &refs(&[" a ", "", "b"])).unwrap();
        assert_eq!(candidate, "hello");
        assert_eq!(cleaned, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_out_of_range_score_is_failure() {
        let backend = StubBackend::fixed(BackendKind::Consistency, 1.5, None);
        let outcome = backend.evaluate("text", &refs(&["ref"]));
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("outside [0, 1]"));

        let backend = StubBackend::fixed(BackendKind::Judgment, 0.5, Some(f64::NAN));
        assert!(!backend.evaluate("text", &refs(&["ref"])).success);
    }

    #[test]
    fn test_transport_failure_is_folded() {
        let backend = StubBackend::failing(BackendKind::Judgment, BackendError::Timeout);
        let outcome = backend.evaluate("text", &refs(&["ref"]));
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("request timed out"));
        assert_eq!(outcome.severity(), None);
    }

    #[test]
    fn test_severity_mapping_by_axis() {
        let consistency = ScoreOutcome::scored(BackendKind::Consistency, RawScore::new(0.1));
        assert!((consistency.severity().unwrap() - 0.9).abs() < 1e-9);

        let judgment = ScoreOutcome::scored(BackendKind::Judgment, RawScore::new(0.85));
        assert!((judgment.severity().unwrap() - 0.85).abs() < 1e-9);
    }

    #[test]
    fn test_interpretation_bands() {
        assert!(BackendKind::Consistency.interpret(0.95).starts_with("Highly consistent"));
        assert!(BackendKind::Consistency.interpret(0.1).starts_with("Severely inconsistent"));
        assert!(BackendKind::Judgment.interpret(0.8).starts_with("Severe"));
        assert!(BackendKind::Judgment.interpret(0.19).starts_with("Highly accurate"));
    }

    #[test]
    fn test_credentials_ignore_blank_keys() {
        let creds = BackendCredentials::new(Some("  ".to_string()), Some("key".to_string()));
        assert!(creds.consistency_api_key.is_none());
        assert!(creds.judgment_api_key.is_some());
        assert!(!format!("{:?}", creds).contains("key\""));
    }

    #[test]
    fn test_truncate_body() {
        assert_eq!(truncate_body("short", 10), "short");
        assert_eq!(truncate_body("abcdefgh", 3), "abc...");
    }
}
