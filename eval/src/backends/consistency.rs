// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Factual-consistency scorer (HHEM via the Vectara evaluation API)

use super::{truncate_body, BackendError, BackendKind, BackendSettings, RawScore, ScoreBackend};
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "https://api.vectara.io/v2/evaluate_factual_consistency";
pub const DEFAULT_MODEL: &str = "hhem_v2.3";

#[derive(Debug, Serialize)]
struct ModelParameters<'a> {
    model_name: &'a str,
}

#[derive(Debug, Serialize)]
struct ConsistencyRequest<'a> {
    model_parameters: ModelParameters<'a>,
    generated_text: &'a str,
    source_texts: &'a [String],
}

#[derive(Debug, Deserialize)]
struct ConsistencyResponse {
    score: Option<f64>,
}

/// HTTP client for the consistency endpoint
pub struct ConsistencyClient {
    http: Client,
    endpoint: String,
    model: String,
    api_key: String,
}

impl ConsistencyClient {
    pub fn new(api_key: impl Into<String>, settings: &BackendSettings) -> Result<Self, BackendError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| BackendError::Client(e.to_string()))?;

        Ok(Self {
            http,
            endpoint: settings.consistency_endpoint.clone(),
            model: settings.consistency_model.clone(),
            api_key: api_key.into(),
        })
    }
}

impl ScoreBackend for ConsistencyClient {
    fn kind(&self) -> BackendKind {
        BackendKind::Consistency
    }

    fn name(&self) -> &str {
        &self.model
    }

    fn score(&self, candidate: &str, references: &[String]) -> Result<RawScore, BackendError> {
        let body = request_body(&self.model, candidate, references);

        let response = self
            .http
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .header("x-api-key", &self.api_key)
            .json(&body)
            .send()?;

        let status = response.status();
        let text = response.text()?;
        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: truncate_body(&text, 500),
            });
        }

        parse_score_body(&text).map(RawScore::new)
    }
}

fn request_body<'a>(model: &'a str, candidate: &'a str, references: &'a [String]) -> ConsistencyRequest<'a> {
    ConsistencyRequest {
        model_parameters: ModelParameters { model_name: model },
        generated_text: candidate,
        source_texts: references,
    }
}

/// Extract the `score` field from a response body
pub(crate) fn parse_score_body(body: &str) -> Result<f64, BackendError> {
    let parsed: ConsistencyResponse =
        serde_json::from_str(body).map_err(|e| BackendError::MalformedPayload(e.to_string()))?;
    parsed
        .score
        .ok_or_else(|| BackendError::MalformedPayload("missing `score` field".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_body_shape() {
        let refs = vec!["The capital of France is Paris.".to_string()];
        let body = request_body(DEFAULT_MODEL, "Paris is in France.", &refs);
        let value = serde_json::to_value(&body).unwrap();

        assert_eq!(
            value,
            json!({
                "model_parameters": {"model_name": "hhem_v2.3"},
                "generated_text": "Paris is in France.",
                "source_texts": ["The capital of France is Paris."]
            })
        );
    }

    #[test]
    fn test_parse_score_body() {
        let score = parse_score_body(r#"{"score": 0.93, "p_consistent": 0.93}"#).unwrap();
        assert!((score - 0.93).abs() < 1e-9);
    }

    #[test]
    fn test_parse_score_body_missing_field() {
        let err = parse_score_body(r#"{"result": "ok"}"#).unwrap_err();
        assert!(matches!(err, BackendError::MalformedPayload(_)));
    }

    #[test]
    fn test_parse_score_body_not_json() {
        let err = parse_score_body("<html>bad gateway</html>").unwrap_err();
        assert!(matches!(err, BackendError::MalformedPayload(_)));
    }

    #[test]
    fn test_client_uses_settings() {
        let settings = BackendSettings::default();
        let client = ConsistencyClient::new("test-key", &settings).unwrap();
        assert_eq!(client.kind(), BackendKind::Consistency);
        assert_eq!(client.name(), "hhem_v2.3");
        assert_eq!(client.endpoint, DEFAULT_ENDPOINT);
    }
}
