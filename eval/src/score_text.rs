// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Score generated text against reference texts
//!
//! Scores one candidate given on the command line, or a JSONL batch of
//! `{"generated_text": ..., "source_texts": [...]}` records.

use anyhow::{Context, Result};
use clap::Parser;
use hallucination_eval::backends::{BackendCredentials, BackendSettings, JudgeModel, ScoreOutcome};
use hallucination_eval::evaluator::{Evaluation, EvaluationMethod, EvaluationRequest, HallucinationEvaluator};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "score-text")]
#[command(about = "Score generated text for hallucinations")]
#[command(version)]
struct Args {
    /// Generated text to check
    #[arg(short, long, required_unless_present = "batch")]
    text: Option<String>,

    /// Reference text (repeat for several)
    #[arg(short, long = "reference")]
    references: Vec<String>,

    /// JSONL file of candidates to score
    #[arg(short, long, conflicts_with = "text")]
    batch: Option<PathBuf>,

    /// Evaluation method (consistency-only, judgment-only, both-independent, ensemble)
    #[arg(short, long, default_value = "ensemble")]
    method: EvaluationMethod,

    /// Run every single-backend method and the ensemble on the text
    #[arg(long, conflicts_with = "batch")]
    compare: bool,

    /// Print evaluations as JSON
    #[arg(long)]
    json: bool,

    /// Judge model
    #[arg(long, default_value = "qwen-turbo")]
    judge_model: JudgeModel,

    /// Backend request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// API key for the consistency backend
    #[arg(long, env = "VECTARA_API_KEY", hide_env_values = true)]
    vectara_api_key: Option<String>,

    /// API key for the judge backend
    #[arg(long, env = "DASHSCOPE_API_KEY", hide_env_values = true)]
    dashscope_api_key: Option<String>,
}

fn read_batch(path: &Path) -> Result<Vec<EvaluationRequest>> {
    let file = File::open(path).with_context(|| format!("Failed to open batch file: {}", path.display()))?;
    let mut requests = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read line {} in {}", idx + 1, path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let request = serde_json::from_str(&line)
            .with_context(|| format!("Malformed record at line {} in {}", idx + 1, path.display()))?;
        requests.push(request);
    }
    Ok(requests)
}

fn print_outcome(outcome: &ScoreOutcome) {
    match (outcome.successful_score(), &outcome.error) {
        (Some(score), _) => {
            let confidence = outcome.confidence.map_or("-".to_string(), |c| format!("{:.2}", c));
            println!(
                "  {:<12} {:.4} (confidence {}){}",
                outcome.backend.to_string(),
                score,
                confidence,
                if outcome.degraded { " [keyword estimate]" } else { "" }
            );
            if let Some(interpretation) = outcome.interpretation() {
                println!("               {}", interpretation);
            }
            if let Some(explanation) = &outcome.explanation {
                println!("               {}", explanation);
            }
        }
        (None, error) => {
            println!(
                "  {:<12} failed: {}",
                outcome.backend.to_string(),
                error.as_deref().unwrap_or("no score")
            );
        }
    }
}

fn print_evaluation(label: &str, evaluation: &Evaluation) {
    println!("\n## {} ##", label);
    for outcome in [&evaluation.consistency, &evaluation.judgment].into_iter().flatten() {
        print_outcome(outcome);
    }
    if let Some(ensemble) = &evaluation.ensemble {
        match (ensemble.score, &ensemble.interpretation) {
            (Some(score), Some(interpretation)) => println!(
                "  {:<12} {:.4} (confidence {:.2})\n               {}",
                "ensemble",
                score,
                ensemble.confidence.unwrap_or_default(),
                interpretation
            ),
            _ => println!("  {:<12} no score", "ensemble"),
        }
    }
    for error in &evaluation.errors {
        println!("  error: {}", error);
    }
    println!("  success: {}", evaluation.success);
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let settings = BackendSettings {
        judgment_model: args.judge_model,
        timeout_secs: args.timeout,
        ..Default::default()
    };
    let credentials = BackendCredentials::new(args.vectara_api_key.clone(), args.dashscope_api_key.clone());
    let evaluator = HallucinationEvaluator::from_credentials(&credentials, &settings)?;

    for (kind, name) in evaluator.backend_names() {
        tracing::info!("{} backend: {}", kind, name);
    }

    if let Some(path) = &args.batch {
        let requests = read_batch(path)?;
        tracing::info!("Scoring {} candidates from {}", requests.len(), path.display());

        let evaluations = evaluator.batch_evaluate(&requests, args.method);
        if args.json {
            println!("{}", serde_json::to_string_pretty(&evaluations)?);
        } else {
            for (i, evaluation) in evaluations.iter().enumerate() {
                print_evaluation(&format!("Item {} ({})", i + 1, args.method), evaluation);
            }
            let succeeded = evaluations.iter().filter(|e| e.success).count();
            println!("\n{}/{} candidates scored", succeeded, evaluations.len());
        }
        return Ok(());
    }

    let text = args.text.as_deref().unwrap_or_default();

    if args.compare {
        let compared = evaluator.compare_methods(text, &args.references);
        if args.json {
            let map: serde_json::Map<String, serde_json::Value> = compared
                .iter()
                .map(|(method, evaluation)| Ok((method.to_string(), serde_json::to_value(evaluation)?)))
                .collect::<Result<_>>()?;
            println!("{}", serde_json::to_string_pretty(&map)?);
        } else {
            for (method, evaluation) in &compared {
                print_evaluation(method.as_str(), evaluation);
            }
        }
        return Ok(());
    }

    let evaluation = evaluator.evaluate(text, &args.references, args.method);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&evaluation)?);
    } else {
        print_evaluation(args.method.as_str(), &evaluation);
    }

    Ok(())
}
