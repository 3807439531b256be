use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use goalcast::config::{calibration_settings, load_request, Command, Config};
use goalcast::db::Database;
use goalcast::engine::calibration::calibrate_thresholds;
use goalcast::engine::montecarlo::{CancelToken, OutcomeSink};
use goalcast::engine::PredictionEngine;
use goalcast::pattern::recorder::start_recorder;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    config.validate()?;

    match config.command.clone() {
        Command::Predict {
            request,
            iterations,
            seed,
            mode,
            chaos,
        } => {
            let request = load_request(&request, iterations, seed, mode, chaos)?;
            predict(&config, request).await
        }
        Command::RecordResult {
            request,
            home_goals,
            away_goals,
        } => {
            let request = load_request(&request, None, None, None, None)?;
            let db = Database::open(&config.database_path)?;
            let engine = PredictionEngine::new(Some(db));
            let (pattern, statistics) = engine.record_result(&request, home_goals, away_goals)?;
            print_json(&serde_json::json!({
                "pattern_id": pattern.unique_pattern_id,
                "valid_for_matching": pattern.valid_for_matching,
                "statistics": statistics,
            }))
        }
        Command::Calibrate {
            sequences,
            sequence_len,
            percentile,
            seed,
        } => {
            let settings = calibration_settings(sequences, sequence_len, percentile, seed);
            let report =
                tokio::task::spawn_blocking(move || calibrate_thresholds(&settings)).await??;
            info!("Calibrated thresholds from {} runs", report.runs_observed);
            print_json(&report)
        }
        Command::Stats { pattern_id } => {
            let db = Database::open(&config.database_path)?;
            print_json(&db.pattern_stats(&pattern_id)?)
        }
    }
}

async fn predict(config: &Config, request: goalcast::models::MatchRequest) -> Result<()> {
    // A broken database degrades to simulation-only predictions that say why
    let mut db = None;
    let mut db_error = None;
    if !config.no_database {
        match Database::open(&config.database_path) {
            Ok(opened) => {
                info!("Database opened: {}", config.database_path);
                db = Some(opened);
            }
            Err(e) => {
                warn!("Running without pattern database: {:#}", e);
                db_error = Some(e);
            }
        }
    }

    let recording = request.config.record_every > 0;
    let (recorder, recorder_task) = match &db {
        Some(db) if recording => {
            let (recorder, task) = start_recorder(db.clone());
            (Some(recorder), Some(task))
        }
        _ => (None, None),
    };

    let engine = match db_error {
        Some(e) => PredictionEngine::without_database(e),
        None => PredictionEngine::new(db),
    }
    .with_threads(config.threads)?;

    let mut cancel = CancelToken::new();
    if let Some(timeout) = config.timeout() {
        cancel = cancel.with_timeout(timeout);
    }
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping simulation after the current chunk");
                cancel.cancel();
            }
        });
    }

    info!("Predicting {} ({} iterations)", request.label(), request.config.iterations);
    let sink = recorder.clone();
    let mut prediction = tokio::task::spawn_blocking(move || {
        engine.predict(
            &request,
            Some(&cancel),
            sink.as_ref().map(|r| r as &dyn OutcomeSink),
        )
    })
    .await??;

    if let Some(recorder) = recorder {
        match recorder.shutdown().await {
            Ok(report) => {
                info!(
                    "Recorder flushed: {} pattern(s) recalculated, {} failure(s)",
                    report.patterns_recalculated,
                    report.failures.len()
                );
                prediction.provenance.warnings.extend(report.warnings());
            }
            Err(e) => {
                warn!("Recorder shutdown failed: {:#}", e);
                prediction
                    .provenance
                    .warnings
                    .push(format!("Outcome recorder shutdown failed: {:#}", e));
            }
        }
    }
    if let Some(task) = recorder_task {
        let summary = task.await?;
        info!("{} simulated outcome(s) stored", summary.stored);
    }

    info!(
        "Prediction ready: path {:?}, confidence {:.2}, {} value bet(s)",
        prediction.provenance.path,
        prediction.confidence,
        prediction.value_bets.len()
    );
    print_json(&prediction)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
