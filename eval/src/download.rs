// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! RAGTruth download utility
//!
//! Fetches `response.jsonl` and `source_info.jsonl` into the dataset root,
//! printing the SHA-256 of each file and checking it when a digest is given.

use anyhow::{Context, Result};
use clap::Parser;
use hallucination_eval::datasets::{DEFAULT_DATASET_ROOT, RESPONSE_FILE, SOURCE_FILE};
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

const BASE_URL: &str = "https://raw.githubusercontent.com/ParticleMedia/RAGTruth/main/dataset";

#[derive(Parser, Debug)]
#[command(name = "fetch-ragtruth")]
#[command(about = "Download the RAGTruth dataset files")]
#[command(version)]
struct Args {
    /// Output directory
    #[arg(short, long, default_value = DEFAULT_DATASET_ROOT)]
    output: PathBuf,

    /// Base URL the two files are fetched from
    #[arg(long, default_value = BASE_URL)]
    base_url: String,

    /// Expected SHA-256 of response.jsonl
    #[arg(long)]
    response_sha256: Option<String>,

    /// Expected SHA-256 of source_info.jsonl
    #[arg(long)]
    source_sha256: Option<String>,

    /// Force re-download even if files exist
    #[arg(short, long)]
    force: bool,
}

/// Stream `url` into `output_path`, returning the hex SHA-256 of the body
fn download_file(url: &str, output_path: &Path) -> Result<String> {
    tracing::info!("Downloading from: {}", url);

    let mut response = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(600))
        .build()?
        .get(url)
        .send()
        .context("Failed to send request")?;

    if !response.status().is_success() {
        anyhow::bail!("Download failed with status: {}", response.status());
    }

    let pb = match response.content_length() {
        Some(total) => ProgressBar::new(total),
        None => ProgressBar::new_spinner(),
    };
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})")?
            .progress_chars("#>-"),
    );

    let partial = output_path.with_extension("part");
    let mut file = File::create(&partial)
        .with_context(|| format!("Failed to create output file: {}", partial.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = response.read(&mut buffer).context("Failed to read response")?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        file.write_all(&buffer[..bytes_read])?;
        pb.inc(bytes_read as u64);
    }
    file.flush()?;
    drop(file);

    std::fs::rename(&partial, output_path)
        .with_context(|| format!("Failed to move download into place: {}", output_path.display()))?;

    pb.finish_with_message("Downloaded");
    Ok(hex::encode(hasher.finalize()))
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

fn fetch(filename: &str, args: &Args, expected: Option<&str>) -> Result<()> {
    let path = args.output.join(filename);

    let digest = if path.exists() && !args.force {
        tracing::info!("File already exists: {} (use --force to re-download)", path.display());
        sha256_file(&path)?
    } else {
        let url = format!("{}/{}", args.base_url.trim_end_matches('/'), filename);
        download_file(&url, &path)?
    };

    println!("{}  {}", digest, path.display());

    if let Some(expected) = expected {
        if !digest.eq_ignore_ascii_case(expected.trim()) {
            anyhow::bail!("Checksum mismatch for {}: expected {}, got {}", filename, expected, digest);
        }
        tracing::info!("Checksum verified: {}", filename);
    }

    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    tracing::info!("RAGTruth Download Utility");
    tracing::info!("=========================");

    std::fs::create_dir_all(&args.output)
        .with_context(|| format!("Failed to create {}", args.output.display()))?;

    fetch(RESPONSE_FILE, &args, args.response_sha256.as_deref())?;
    fetch(SOURCE_FILE, &args, args.source_sha256.as_deref())?;

    println!("\nDataset ready in {}", args.output.display());
    println!("Inspect it with: ragtruth-eval --data-dir {} --stats", args.output.display());

    Ok(())
}
