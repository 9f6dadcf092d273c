// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! RAGTruth benchmark CLI for hallucination detection
//!
//! Usage:
//!   ragtruth-eval --method ensemble --samples 100 --seed 42
//!   ragtruth-eval --method both-independent --task QA --split test --workers 4
//!   ragtruth-eval --stats

use anyhow::{Context, Result};
use clap::Parser;
use hallucination_eval::backends::{BackendCredentials, BackendSettings, JudgeModel};
use hallucination_eval::datasets::{Dataset, Selector};
use hallucination_eval::evaluator::{EvaluationMethod, HallucinationEvaluator};
use hallucination_eval::pipeline::{CancelToken, EvaluationConfig, EvaluationPipeline, Thresholds};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ragtruth-eval")]
#[command(about = "Benchmark hallucination detectors on the RAGTruth dataset")]
#[command(version)]
struct Args {
    /// Directory holding response.jsonl and source_info.jsonl
    #[arg(short, long, default_value = "data/ragtruth")]
    data_dir: PathBuf,

    /// Evaluation method (consistency-only, judgment-only, both-independent, ensemble)
    #[arg(short, long, default_value = "ensemble")]
    method: EvaluationMethod,

    /// Maximum number of samples to evaluate
    #[arg(short = 'n', long, default_value_t = 100)]
    samples: usize,

    /// Random seed for reproducible sampling
    #[arg(short, long, default_value_t = 42)]
    seed: u64,

    /// Draw a fresh random sample instead of using the seed
    #[arg(long)]
    unseeded: bool,

    /// Task type filter (QA, Summary, Data2txt or ALL)
    #[arg(long, default_value = "ALL")]
    task: Selector,

    /// Split filter (train, test or ALL)
    #[arg(long, default_value = "test")]
    split: Selector,

    /// Only samples with (true) or without (false) annotated hallucinations
    #[arg(long)]
    hallucinated: Option<bool>,

    /// Consistency threshold: hallucinated when score is below it
    #[arg(long, default_value_t = 0.5)]
    consistency_threshold: f64,

    /// Judge threshold: hallucinated when score is above it
    #[arg(long, default_value_t = 0.5)]
    judgment_threshold: f64,

    /// Ensemble threshold: hallucinated when score is above it
    #[arg(long, default_value_t = 0.5)]
    ensemble_threshold: f64,

    /// Skip samples whose source info is shorter than this
    #[arg(long, default_value_t = 10)]
    min_source_chars: usize,

    /// Number of concurrent evaluation workers
    #[arg(short, long, default_value_t = 1)]
    workers: usize,

    /// Stop dispatching new samples after this many seconds
    #[arg(long)]
    deadline: Option<u64>,

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

    /// Output directory for results
    #[arg(short, long, default_value = "eval/results")]
    output: PathBuf,

    /// Print dataset statistics and exit
    #[arg(long)]
    stats: bool,

    /// Do not write result files
    #[arg(long)]
    no_save: bool,

    /// Hide the progress bar
    #[arg(long)]
    no_progress: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let dataset = Dataset::load(&args.data_dir)
        .with_context(|| format!("Failed to load RAGTruth from {}", args.data_dir.display()))?;

    if args.stats {
        println!("{}", dataset.statistics().format());
        return Ok(());
    }

    tracing::info!("RAGTruth Hallucination Evaluation");
    tracing::info!("=================================");
    tracing::info!("Method: {}", args.method);
    tracing::info!("Samples: {} (seed: {})", args.samples, if args.unseeded { "none".to_string() } else { args.seed.to_string() });
    tracing::info!("Task: {}, Split: {}", args.task, args.split);

    let settings = BackendSettings {
        judgment_model: args.judge_model,
        timeout_secs: args.timeout,
        ..Default::default()
    };
    let credentials = BackendCredentials::new(args.vectara_api_key.clone(), args.dashscope_api_key.clone());
    let evaluator = HallucinationEvaluator::from_credentials(&credentials, &settings)?;

    let config = EvaluationConfig {
        dataset_path: args.data_dir.to_string_lossy().to_string(),
        method: args.method,
        thresholds: Thresholds {
            consistency: args.consistency_threshold,
            judgment: args.judgment_threshold,
            ensemble: args.ensemble_threshold,
        },
        max_samples: args.samples,
        seed: (!args.unseeded).then_some(args.seed),
        task_type: args.task.clone(),
        split: args.split.clone(),
        has_hallucination: args.hallucinated,
        min_source_chars: args.min_source_chars,
        workers: args.workers.max(1),
        deadline_secs: args.deadline,
        output_dir: args.output.to_string_lossy().to_string(),
        show_progress: !args.no_progress,
    };

    let pipeline = EvaluationPipeline::new(config, evaluator);
    let results = pipeline.run(&dataset, &CancelToken::new())?;

    // Print summary to console
    println!("\n{}", "=".repeat(70));
    println!("EVALUATION SUMMARY ({})", results.config.method);
    println!("{}", "=".repeat(70));
    println!(
        "\nEvaluated {} of {} selected samples ({} skipped) in {:.1}s",
        results.counts.evaluated, results.counts.selected, results.counts.skipped, results.evaluation_secs
    );
    println!(
        "Successful: {} ({:.1}%), failed: {}, degraded verdicts: {}",
        results.counts.successful,
        results.success_rate() * 100.0,
        results.counts.failed,
        results.counts.degraded
    );
    if results.cancelled {
        println!("Run stopped before all samples were evaluated");
    }

    for stats in &results.backend_stats {
        println!(
            "  {} backend: {}/{} succeeded ({:.1}%)",
            stats.backend,
            stats.succeeded,
            stats.attempted,
            stats.success_rate() * 100.0
        );
    }

    println!("\n{:-<70}", "");
    println!("{:<12} {:>14} {:>10} {:>10} {:>10} {:>10}", "Scorer", "Rule", "Accuracy", "F1", "MCC", "AUC-ROC");
    println!("{:-<70}", "");
    for result in &results.scorers {
        let m = &result.metrics;
        let auc = m.auc_roc.map_or("-".to_string(), |v| format!("{:.4}", v));
        println!(
            "{:<12} {:>14} {:>10.4} {:>10.4} {:>10.4} {:>10}",
            result.scorer.to_string(),
            m.rule.describe(),
            m.classification.accuracy,
            m.classification.f1_score,
            m.classification.mcc,
            auc
        );
    }
    println!("{:-<70}", "");

    for result in &results.scorers {
        println!("\n## {} ##\n{}", result.scorer, result.metrics.format());
    }

    if let Some(agreement) = &results.agreement {
        println!("\n{}", agreement.format());
    }

    if !args.no_save {
        let paths = EvaluationPipeline::save_all(&results, &args.output)?;
        for path in paths {
            println!("Saved: {}", path.display());
        }
    }

    println!("\nEvaluation complete!");

    Ok(())
}
