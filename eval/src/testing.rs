// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Test fixtures: dataset records and scripted backends

use crate::backends::{BackendError, BackendKind, RawScore, ScoreBackend};
use crate::datasets::{HallucinationSpan, Response, SourceInfo, SourceRecord};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Text of a hallucinated fixture response
pub const HALLUCINATED_TEXT: &str = "Paris is in England";
/// Text of a faithful fixture response
pub const FAITHFUL_TEXT: &str = "The Eiffel Tower is in Paris, France";

pub fn response(id: &str, source_id: &str, split: &str, hallucinated: bool) -> Response {
    let labels = if hallucinated {
        vec![HallucinationSpan {
            start: 12,
            end: 19,
            text: "England".to_string(),
            label_type: "Evident Conflict".to_string(),
            meta: "Paris is in France".to_string(),
            due_to_null: None,
            implicit_true: Some(false),
        }]
    } else {
        Vec::new()
    };

    Response {
        id: id.to_string(),
        source_id: source_id.to_string(),
        model: "gpt-4-0613".to_string(),
        temperature: 0.7,
        labels,
        split: split.to_string(),
        quality: "good".to_string(),
        response: if hallucinated { HALLUCINATED_TEXT } else { FAITHFUL_TEXT }.to_string(),
    }
}

pub fn source(id: &str, task: &str, info: Value) -> SourceRecord {
    let source_info = match info {
        Value::String(text) => SourceInfo::RawText(text),
        Value::Object(map) => SourceInfo::Structured(map),
        other => SourceInfo::RawText(other.to_string()),
    };
    SourceRecord {
        source_id: id.to_string(),
        task_type: task.to_string(),
        source: "MARCO".to_string(),
        source_info,
        prompt: "Answer the question using the passages.".to_string(),
    }
}

pub fn text_source(id: &str, task: &str, text: &str) -> SourceRecord {
    source(id, task, Value::String(text.to_string()))
}

type Handler = dyn Fn(&str, &[String]) -> Result<RawScore, BackendError> + Send + Sync;

/// Backend whose answers come from a closure
pub struct StubBackend {
    kind: BackendKind,
    handler: Box<Handler>,
    calls: Arc<AtomicUsize>,
}

impl StubBackend {
    pub fn new<F>(kind: BackendKind, handler: F) -> Self
    where
        F: Fn(&str, &[String]) -> Result<RawScore, BackendError> + Send + Sync + 'static,
    {
        Self {
            kind,
            handler: Box::new(handler),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn fixed(kind: BackendKind, score: f64, confidence: Option<f64>) -> Self {
        Self::new(kind, move |_, _| {
            let mut raw = RawScore::new(score);
            raw.confidence = confidence;
            Ok(raw)
        })
    }

    pub fn failing(kind: BackendKind, error: BackendError) -> Self {
        Self::new(kind, move |_, _| Err(error.clone()))
    }

    /// Scores the fixture texts: low consistency / high severity for the
    /// hallucinated text, the opposite for anything else
    pub fn by_content(kind: BackendKind) -> Self {
        Self::new(kind, move |candidate, _| {
            let hallucinated = candidate.contains("England");
            let score = match (kind, hallucinated) {
                (BackendKind::Consistency, true) => 0.1,
                (BackendKind::Consistency, false) => 0.95,
                (BackendKind::Judgment, true) => 0.85,
                (BackendKind::Judgment, false) => 0.05,
            };
            Ok(RawScore::new(score).with_confidence(0.8))
        })
    }

    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl ScoreBackend for StubBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn name(&self) -> &str {
        "stub"
    }

    fn score(&self, candidate: &str, references: &[String]) -> Result<RawScore, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.handler)(candidate, references)
    }
}
