// ABOUTME: CLI entry point for detection test runs against sandboxed app instances
// ABOUTME: Loads the run config and detections, drives the supervisor, and prints live status

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use detlab_orchestrator::{
    Detection, DockerRuntime, RunConfig, StatusLine, TestAssignment, TestRunSupervisor, TestStatus,
};
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "detlab",
    about = "Test detection content against sandboxed instances of the app under test",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision the sandbox pool and test detections inside it
    Test {
        /// Path to the run configuration file
        #[arg(short, long, default_value = "detlab.yml")]
        config: String,

        /// Path to a JSON file with the detections to test
        #[arg(short, long)]
        detections: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Test { config, detections } => {
            if let Err(e) = test_command(&config, &detections).await {
                eprintln!("{} {}", "Error:".red(), e);
                std::process::exit(1);
            }
        }
    }
}

async fn test_command(config_path: &str, detections_path: &str) -> Result<()> {
    let config = RunConfig::from_yaml_file(config_path)
        .with_context(|| format!("failed to load run config from {}", config_path))?;

    let raw = std::fs::read_to_string(detections_path)
        .with_context(|| format!("failed to read detections from {}", detections_path))?;
    let detections: Vec<Detection> =
        serde_json::from_str(&raw).context("failed to parse detections file")?;

    // Round-robin detections across the configured instances
    let assignments: Vec<TestAssignment> = detections
        .into_iter()
        .enumerate()
        .map(|(index, detection)| TestAssignment {
            instance: config.instances[index % config.instances.len()]
                .name
                .clone(),
            detection,
        })
        .collect();

    println!(
        "🧪 Testing {} detection(s) across {} sandbox instance(s)",
        assignments.len(),
        config.instances.len()
    );

    let runtime =
        Arc::new(DockerRuntime::connect().context("failed to connect to the Docker daemon")?);

    let (status_tx, mut status_rx) = tokio::sync::mpsc::unbounded_channel::<StatusLine>();
    let printer = tokio::spawn(async move {
        while let Some(line) = status_rx.recv().await {
            println!("[{}] {}", line.instance, line.message);
        }
    });

    let summary = TestRunSupervisor::new(runtime, config)
        .with_status_stream(status_tx)
        .run(assignments)
        .await;

    printer.await.ok();

    println!();
    let mut passed = 0;
    let mut failed = 0;
    let mut errored = 0;
    for result in &summary.results {
        let status = match result.status {
            TestStatus::Passed => {
                passed += 1;
                "passed".green()
            }
            TestStatus::Failed => {
                failed += 1;
                "failed".red()
            }
            TestStatus::Error => {
                errored += 1;
                "error ".yellow()
            }
        };
        println!("  {} [{}] {}", status, result.instance, result.detection);
    }
    println!("\n{} passed, {} failed, {} errored", passed, failed, errored);

    for failure in &summary.errors {
        eprintln!(
            "{} sandbox [{}]: {}",
            "Error:".red(),
            failure.instance,
            failure.error
        );
    }
    for failure in &summary.teardown_failures {
        eprintln!(
            "{} sandbox [{}] could not be cleaned up: {}",
            "Error:".red(),
            failure.instance,
            failure.error
        );
    }

    if summary.failed() || !summary.teardown_failures.is_empty() {
        anyhow::bail!("test run {} terminated with errors", summary.run_id);
    }

    println!("✅ Test run {} complete", summary.run_id);
    Ok(())
}
