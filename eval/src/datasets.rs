// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! RAGTruth dataset loading, filtering and reproducible sampling
//!
//! The dataset is two newline-delimited JSON streams joined on `source_id`:
//! - `response.jsonl`: generated responses with annotated hallucination spans
//! - `source_info.jsonl`: the reference material each response was generated from
//!
//! A response whose `source_id` has no matching source record never appears
//! in any sample set.

use anyhow::{Context, Result};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const RESPONSE_FILE: &str = "response.jsonl";
pub const SOURCE_FILE: &str = "source_info.jsonl";
pub const DEFAULT_DATASET_ROOT: &str = "data/ragtruth";

/// An annotated hallucinated span inside a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HallucinationSpan {
    /// Start character offset into the response text
    pub start: usize,
    /// End character offset into the response text
    pub end: usize,
    /// The flagged excerpt
    pub text: String,
    /// Category tag (open vocabulary, e.g. "Evident Conflict")
    pub label_type: String,
    /// Annotator note
    pub meta: String,
    #[serde(default)]
    pub due_to_null: Option<bool>,
    #[serde(default)]
    pub implicit_true: Option<bool>,
}

/// A generated response with its hallucination labels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(deserialize_with = "string_or_number")]
    pub source_id: String,
    pub model: String,
    pub temperature: f64,
    pub labels: Vec<HallucinationSpan>,
    pub split: String,
    pub quality: String,
    pub response: String,
}

impl Response {
    pub fn has_hallucination(&self) -> bool {
        !self.labels.is_empty()
    }
}

/// Free-form reference material attached to a source record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceInfo {
    RawText(String),
    Structured(Map<String, Value>),
}

impl SourceInfo {
    /// Reference texts handed to the scoring backends. Never empty.
    pub fn source_texts(&self) -> Vec<String> {
        match self {
            SourceInfo::RawText(text) => vec![text.clone()],
            SourceInfo::Structured(fields) => {
                let mut texts = Vec::new();
                if let Some(passages) = fields.get("passages") {
                    texts.push(value_text(passages));
                }
                if let Some(question) = fields.get("question") {
                    texts.push(format!("Question: {}", value_text(question)));
                }
                if texts.is_empty() {
                    texts.push(Value::Object(fields.clone()).to_string());
                }
                texts
            }
        }
    }

    /// Length in characters of the trimmed textual form
    pub fn char_len(&self) -> usize {
        match self {
            SourceInfo::RawText(text) => text.trim().chars().count(),
            SourceInfo::Structured(fields) => Value::Object(fields.clone()).to_string().chars().count(),
        }
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Reference record a response was generated from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    #[serde(deserialize_with = "string_or_number")]
    pub source_id: String,
    pub task_type: String,
    pub source: String,
    pub source_info: SourceInfo,
    pub prompt: String,
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Identifier {
        Text(String),
        Signed(i64),
        Unsigned(u64),
    }

    Ok(match Identifier::deserialize(deserializer)? {
        Identifier::Text(s) => s,
        Identifier::Signed(n) => n.to_string(),
        Identifier::Unsigned(n) => n.to_string(),
    })
}

/// A response paired with its source record
#[derive(Debug, Clone, Copy)]
pub struct Sample<'a> {
    pub response: &'a Response,
    pub source: &'a SourceRecord,
}

impl<'a> Sample<'a> {
    pub fn generated_text(&self) -> &'a str {
        &self.response.response
    }

    pub fn source_texts(&self) -> Vec<String> {
        self.source.source_info.source_texts()
    }

    pub fn has_hallucination(&self) -> bool {
        self.response.has_hallucination()
    }

    pub fn task_type(&self) -> &'a str {
        &self.source.task_type
    }
}

/// "ALL" or one exact tag value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    #[default]
    All,
    Only(String),
}

impl Selector {
    pub fn only(value: impl Into<String>) -> Self {
        Selector::Only(value.into())
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            Selector::All => true,
            Selector::Only(expected) => expected == value,
        }
    }
}

impl FromStr for Selector {
    type Err = Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            Ok(Selector::All)
        } else {
            Ok(Selector::Only(s.to_string()))
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::All => write!(f, "ALL"),
            Selector::Only(value) => write!(f, "{}", value),
        }
    }
}

/// Conjunction of task, split and label filters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleFilter {
    pub task_type: Selector,
    pub split: Selector,
    pub has_hallucination: Option<bool>,
}

impl SampleFilter {
    pub fn matches(&self, sample: &Sample<'_>) -> bool {
        self.task_type.matches(&sample.source.task_type)
            && self.split.matches(&sample.response.split)
            && self
                .has_hallucination
                .map_or(true, |wanted| sample.has_hallucination() == wanted)
    }

    /// Narrow an existing sample set
    pub fn apply<'a>(&self, samples: Vec<Sample<'a>>) -> Vec<Sample<'a>> {
        samples.into_iter().filter(|s| self.matches(s)).collect()
    }
}

/// Draw `max_samples` items without replacement.
///
/// Sets no larger than `max_samples` are returned whole. Selected items keep
/// their relative input order, so the same seed over the same input always
/// yields the same output.
pub fn sample_subset<T>(items: Vec<T>, max_samples: usize, seed: Option<u64>) -> Vec<T> {
    if items.len() <= max_samples {
        return items;
    }

    let mut rng = match seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_entropy(),
    };

    let mut keep = vec![false; items.len()];
    for idx in rand::seq::index::sample(&mut rng, items.len(), max_samples) {
        keep[idx] = true;
    }

    items
        .into_iter()
        .zip(keep)
        .filter_map(|(item, selected)| selected.then_some(item))
        .collect()
}

/// Aggregate counts over the full loaded collections
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetStatistics {
    pub total_responses: usize,
    pub total_sources: usize,
    pub responses_with_hallucination: usize,
    pub responses_without_hallucination: usize,
    /// Responses whose source_id has no source record
    pub unjoined_responses: usize,
    pub by_split: BTreeMap<String, usize>,
    pub by_model: BTreeMap<String, usize>,
    pub by_task_type: BTreeMap<String, usize>,
    pub by_quality: BTreeMap<String, usize>,
    pub hallucination_types: BTreeMap<String, usize>,
}

impl DatasetStatistics {
    fn percent(part: usize, total: usize) -> f64 {
        if total == 0 {
            0.0
        } else {
            part as f64 / total as f64 * 100.0
        }
    }

    pub fn format(&self) -> String {
        let mut out = String::new();
        out.push_str("RAGTruth Dataset Statistics\n");
        out.push_str("===========================\n");
        out.push_str(&format!("Responses:            {}\n", self.total_responses));
        out.push_str(&format!("Sources:              {}\n", self.total_sources));
        out.push_str(&format!(
            "With hallucination:   {} ({:.1}%)\n",
            self.responses_with_hallucination,
            Self::percent(self.responses_with_hallucination, self.total_responses)
        ));
        out.push_str(&format!(
            "Without hallucination: {} ({:.1}%)\n",
            self.responses_without_hallucination,
            Self::percent(self.responses_without_hallucination, self.total_responses)
        ));
        if self.unjoined_responses > 0 {
            out.push_str(&format!("Unjoined responses:   {}\n", self.unjoined_responses));
        }

        let sections = [
            ("Splits", &self.by_split),
            ("Models", &self.by_model),
            ("Task types", &self.by_task_type),
            ("Quality", &self.by_quality),
        ];
        for (title, counts) in sections {
            out.push_str(&format!("\n{}:\n", title));
            for (key, count) in counts {
                out.push_str(&format!("  {}: {}\n", key, count));
            }
        }

        let mut types: Vec<_> = self.hallucination_types.iter().collect();
        types.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        out.push_str("\nHallucination types (top 10):\n");
        for (label_type, count) in types.into_iter().take(10) {
            out.push_str(&format!("  {}: {}\n", label_type, count));
        }

        out
    }
}

/// A loaded RAGTruth dataset, read-only after load
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    responses: Vec<Response>,
    sources: Vec<SourceRecord>,
    source_index: HashMap<String, usize>,
}

impl Dataset {
    /// Conventional dataset root relative to the working directory
    pub fn default_root() -> PathBuf {
        PathBuf::from(DEFAULT_DATASET_ROOT)
    }

    /// Load `response.jsonl` and `source_info.jsonl` from a directory.
    ///
    /// Any malformed line aborts the load.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let responses: Vec<Response> = read_jsonl(&data_dir.join(RESPONSE_FILE))?;
        let sources: Vec<SourceRecord> = read_jsonl(&data_dir.join(SOURCE_FILE))?;

        let dataset = Self::from_records(responses, sources);
        tracing::info!(
            "Loaded {} responses and {} sources from {}",
            dataset.responses.len(),
            dataset.sources.len(),
            data_dir.display()
        );
        Ok(dataset)
    }

    /// Build from parsed records. Every source record is kept and counted;
    /// when a `source_id` repeats, the last record with that id is the one
    /// responses join to.
    pub fn from_records(responses: Vec<Response>, sources: Vec<SourceRecord>) -> Self {
        let mut source_index = HashMap::with_capacity(sources.len());

        for (idx, source) in sources.iter().enumerate() {
            if source_index.insert(source.source_id.clone(), idx).is_some() {
                tracing::warn!("Duplicate source_id {}, later record replaces earlier", source.source_id);
            }
        }

        Self {
            responses,
            sources,
            source_index,
        }
    }

    pub fn source(&self, source_id: &str) -> Option<&SourceRecord> {
        self.source_index.get(source_id).map(|&idx| &self.sources[idx])
    }

    /// Every joinable response, in file order
    pub fn samples(&self) -> Vec<Sample<'_>> {
        self.responses
            .iter()
            .filter_map(|response| {
                self.source(&response.source_id)
                    .map(|source| Sample { response, source })
            })
            .collect()
    }

    pub fn filter(&self, filter: &SampleFilter) -> Vec<Sample<'_>> {
        filter.apply(self.samples())
    }

    /// Filter, then draw a reproducible subset
    pub fn select(&self, filter: &SampleFilter, max_samples: usize, seed: Option<u64>) -> Vec<Sample<'_>> {
        sample_subset(self.filter(filter), max_samples, seed)
    }

    pub fn statistics(&self) -> DatasetStatistics {
        let mut stats = DatasetStatistics {
            total_responses: self.responses.len(),
            total_sources: self.sources.len(),
            ..Default::default()
        };

        for response in &self.responses {
            if response.has_hallucination() {
                stats.responses_with_hallucination += 1;
            } else {
                stats.responses_without_hallucination += 1;
            }
            if !self.source_index.contains_key(&response.source_id) {
                stats.unjoined_responses += 1;
            }
            *stats.by_split.entry(response.split.clone()).or_insert(0) += 1;
            *stats.by_model.entry(response.model.clone()).or_insert(0) += 1;
            *stats.by_quality.entry(response.quality.clone()).or_insert(0) += 1;
            for span in &response.labels {
                *stats.hallucination_types.entry(span.label_type.clone()).or_insert(0) += 1;
            }
        }

        for source in &self.sources {
            *stats.by_task_type.entry(source.task_type.clone()).or_insert(0) += 1;
        }

        stats
    }
}

fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open dataset file: {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read line {} in {}", idx + 1, path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line)
            .with_context(|| format!("Malformed record at line {} in {}", idx + 1, path.display()))?;
        records.push(record);
    }

    Ok(records)
}
