// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! LLM hallucination judge
//!
//! Talks to any OpenAI-compatible chat-completions endpoint (DashScope's
//! compatible mode by default). The judge is asked for a JSON verdict:
//! - `hallucination_score` in [0, 1], higher = more hallucinated
//! - `confidence` in [0, 1]
//! - `explanation` and `issues_found`
//!
//! Replies that carry no parseable verdict fall back to a keyword
//! estimate, which is flagged as degraded.

use super::{truncate_body, BackendError, BackendKind, BackendSettings, RawScore, ScoreBackend};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1/chat/completions";

const SYSTEM_PROMPT: &str =
    "You are a meticulous fact checker who detects hallucinations in AI-generated text.";

/// Confidence assigned to a keyword estimate
const KEYWORD_CONFIDENCE: f64 = 0.7;
/// Score and confidence used when a verdict omits a field
const MISSING_FIELD_DEFAULT: f64 = 0.5;
const EXPLANATION_PREVIEW_CHARS: usize = 200;

/// Keyword groups and the severity each implies, checked in order
const KEYWORD_BANDS: &[(&[&str], f64)] = &[
    (&["severe hallucination", "completely wrong", "seriously inconsistent"], 0.9),
    (&["contains hallucination", "partially wrong", "inaccurate"], 0.6),
    (&["minor issue", "mostly accurate"], 0.3),
    (&["no hallucination", "fully accurate", "consistent with the facts"], 0.1),
];
const UNKNOWN_KEYWORD_SCORE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum JudgeModel {
    #[default]
    #[serde(rename = "qwen-turbo")]
    QwenTurbo,
    #[serde(rename = "qwen-plus")]
    QwenPlus,
    #[serde(rename = "qwen-max")]
    QwenMax,
    #[serde(rename = "qwen-max-longcontext")]
    QwenMaxLongContext,
}

impl JudgeModel {
    pub const ALL: [JudgeModel; 4] = [
        JudgeModel::QwenTurbo,
        JudgeModel::QwenPlus,
        JudgeModel::QwenMax,
        JudgeModel::QwenMaxLongContext,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JudgeModel::QwenTurbo => "qwen-turbo",
            JudgeModel::QwenPlus => "qwen-plus",
            JudgeModel::QwenMax => "qwen-max",
            JudgeModel::QwenMaxLongContext => "qwen-max-longcontext",
        }
    }
}

impl fmt::Display for JudgeModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JudgeModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        JudgeModel::ALL
            .into_iter()
            .find(|m| m.as_str() == wanted)
            .ok_or_else(|| {
                let known: Vec<&str> = JudgeModel::ALL.iter().map(|m| m.as_str()).collect();
                format!("unknown judge model '{}', expected one of: {}", s, known.join(", "))
            })
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// HTTP client for the judge endpoint
pub struct JudgeClient {
    http: Client,
    endpoint: String,
    model: JudgeModel,
    temperature: f64,
    max_tokens: u32,
    api_key: String,
}

impl JudgeClient {
    pub fn new(api_key: impl Into<String>, settings: &BackendSettings) -> Result<Self, BackendError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| BackendError::Client(e.to_string()))?;

        Ok(Self {
            http,
            endpoint: settings.judgment_endpoint.clone(),
            model: settings.judgment_model,
            temperature: settings.judge_temperature,
            max_tokens: settings.judge_max_tokens,
            api_key: api_key.into(),
        })
    }
}

impl ScoreBackend for JudgeClient {
    fn kind(&self) -> BackendKind {
        BackendKind::Judgment
    }

    fn name(&self) -> &str {
        self.model.as_str()
    }

    fn score(&self, candidate: &str, references: &[String]) -> Result<RawScore, BackendError> {
        let request = ChatRequest {
            model: self.model.as_str(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: build_prompt(candidate, references),
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()?;

        let status = response.status();
        let text = response.text()?;
        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: truncate_body(&text, 500),
            });
        }

        let content = reply_content(&text)?;
        Ok(parse_verdict(&content))
    }
}

/// Pull the first choice's message out of a chat-completions body
fn reply_content(body: &str) -> Result<String, BackendError> {
    let parsed: ChatResponse =
        serde_json::from_str(body).map_err(|e| BackendError::MalformedPayload(e.to_string()))?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| BackendError::MalformedPayload("response has no choices".to_string()))
}

/// Judge prompt for a candidate text and its references
pub fn build_prompt(candidate: &str, references: &[String]) -> String {
    let numbered: Vec<String> = references
        .iter()
        .enumerate()
        .map(|(i, r)| format!("[{}] {}", i + 1, r))
        .collect();

    format!(
        r#"Assess whether the generated text below contains hallucinations, i.e. statements that contradict the reference texts or cannot be supported by them.

Reference texts:
{references}

Generated text:
{candidate}

Consider:
1. Factual accuracy against the references
2. Logical consistency
3. Information not supported by the references
4. Fabricated details

Reply with a single JSON object and nothing else:
{{
  "hallucination_score": <number between 0 and 1, higher means more hallucinated>,
  "confidence": <number between 0 and 1>,
  "explanation": "<short justification>",
  "issues_found": ["<issue>", "..."]
}}"#,
        references = numbered.join("\n"),
        candidate = candidate
    )
}

/// Turn a judge reply into a score, falling back to keywords
pub fn parse_verdict(reply: &str) -> RawScore {
    structured_verdict(reply).unwrap_or_else(|| keyword_estimate(reply))
}

fn structured_verdict(reply: &str) -> Option<RawScore> {
    let json = extract_json_object(reply)?;
    let value: Value = serde_json::from_str(json).ok()?;
    let object = value.as_object()?;

    let score = numeric_field(object, "hallucination_score")?;
    let confidence = numeric_field(object, "confidence")?;

    let mut explanation = object
        .get("explanation")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .unwrap_or("No explanation given")
        .to_string();

    let issues: Vec<&str> = object
        .get("issues_found")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if !issues.is_empty() {
        explanation.push_str(&format!(" (issues: {})", issues.join("; ")));
    }

    Some(
        RawScore::new(score)
            .with_confidence(confidence)
            .with_explanation(explanation),
    )
}

/// Read a field as a number or numeric string, clamped to [0, 1].
/// Missing fields take the default; unreadable ones reject the verdict.
fn numeric_field(object: &Map<String, Value>, key: &str) -> Option<f64> {
    let value = match object.get(key) {
        None | Some(Value::Null) => Some(MISSING_FIELD_DEFAULT),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    }?;

    value.is_finite().then(|| value.clamp(0.0, 1.0))
}

/// Slice from the first `{` to the last `}`, ignoring code fences
fn extract_json_object(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (start < end).then(|| &reply[start..=end])
}

fn keyword_estimate(reply: &str) -> RawScore {
    let lowered = reply.to_lowercase();
    let score = KEYWORD_BANDS
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|k| lowered.contains(k)))
        .map(|(_, score)| *score)
        .unwrap_or(UNKNOWN_KEYWORD_SCORE);

    let preview: String = reply.trim().chars().take(EXPLANATION_PREVIEW_CHARS).collect();

    RawScore::new(score)
        .with_confidence(KEYWORD_CONFIDENCE)
        .with_explanation(format!("Keyword estimate from unstructured reply: {}", preview))
        .degraded()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let raw = parse_verdict(
            r#"{"hallucination_score": 0.85, "confidence": 0.9, "explanation": "Wrong country", "issues_found": ["Paris is not in England"]}"#,
        );
        assert!((raw.score - 0.85).abs() < 1e-9);
        assert_eq!(raw.confidence, Some(0.9));
        assert!(!raw.degraded);
        let explanation = raw.explanation.unwrap();
        assert!(explanation.starts_with("Wrong country"));
        assert!(explanation.contains("Paris is not in England"));
    }

    #[test]
    fn test_parse_fenced_json_with_prose() {
        let reply = "Here is my verdict:\n```json\n{\"hallucination_score\": \"0.2\", \"confidence\": 0.6}\n```\nThanks.";
        let raw = parse_verdict(reply);
        assert!((raw.score - 0.2).abs() < 1e-9);
        assert_eq!(raw.confidence, Some(0.6));
        assert!(!raw.degraded);
    }

    #[test]
    fn test_missing_fields_default_to_half() {
        let raw = parse_verdict(r#"{"explanation": "unsure"}"#);
        assert!((raw.score - 0.5).abs() < 1e-9);
        assert_eq!(raw.confidence, Some(0.5));
        assert!(!raw.degraded);
    }

    #[test]
    fn test_out_of_range_values_are_clamped() {
        let raw = parse_verdict(r#"{"hallucination_score": 1.7, "confidence": -0.2}"#);
        assert!((raw.score - 1.0).abs() < 1e-9);
        assert_eq!(raw.confidence, Some(0.0));
    }

    #[test]
    fn test_keyword_fallback() {
        let raw = parse_verdict("This answer contains severe hallucination about geography.");
        assert!((raw.score - 0.9).abs() < 1e-9);
        assert_eq!(raw.confidence, Some(0.7));
        assert!(raw.degraded);

        assert!((parse_verdict("The text is mostly accurate.").score - 0.3).abs() < 1e-9);
        assert!((parse_verdict("No hallucination detected.").score - 0.1).abs() < 1e-9);
        assert!((parse_verdict("I cannot tell.").score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_non_numeric_score_falls_back() {
        let raw = parse_verdict(r#"{"hallucination_score": "high", "explanation": "inaccurate dates"}"#);
        assert!(raw.degraded);
        assert!((raw.score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_keyword_explanation_is_truncated() {
        let reply = "x".repeat(500);
        let raw = parse_verdict(&reply);
        let explanation = raw.explanation.unwrap();
        assert!(explanation.chars().count() < 300);
    }

    #[test]
    fn test_reply_content() {
        let body = r#"{"choices": [{"message": {"role": "assistant", "content": "{\"hallucination_score\": 0.1}"}}]}"#;
        assert_eq!(reply_content(body).unwrap(), r#"{"hallucination_score": 0.1}"#);

        let err = reply_content(r#"{"choices": []}"#).unwrap_err();
        assert!(matches!(err, BackendError::MalformedPayload(_)));
    }

    #[test]
    fn test_prompt_mentions_inputs() {
        let prompt = build_prompt("Paris is in England.", &["Paris is in France.".to_string()]);
        assert!(prompt.contains("[1] Paris is in France."));
        assert!(prompt.contains("Paris is in England."));
        assert!(prompt.contains("hallucination_score"));
    }

    #[test]
    fn test_judge_model_parsing() {
        assert_eq!("qwen-plus".parse::<JudgeModel>().unwrap(), JudgeModel::QwenPlus);
        assert_eq!("QWEN-MAX".parse::<JudgeModel>().unwrap(), JudgeModel::QwenMax);
        assert!("gpt-4".parse::<JudgeModel>().is_err());
        assert_eq!(JudgeModel::default().to_string(), "qwen-turbo");
    }
}
