//! Background writer for pattern outcomes.
//!
//! A single tokio task owns every write to the outcome log. Commands are
//! processed strictly in FIFO order, so a `flush` acknowledged to the caller
//! covers every `store` sent before it: statistics read after the ack include
//! those outcomes.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::db::models::PatternOutcomeRecord;
use crate::db::Database;
use crate::engine::montecarlo::OutcomeSink;

#[derive(Debug)]
pub enum RecorderCommand {
    Store(Vec<PatternOutcomeRecord>),
    Flush(oneshot::Sender<FlushReport>),
    Shutdown(oneshot::Sender<FlushReport>),
}

/// Statistics rebuilt by one flush, plus every write that failed since the
/// previous one
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlushReport {
    pub patterns_recalculated: usize,
    /// Outcomes whose insert failed
    pub dropped: usize,
    pub failures: Vec<String>,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.dropped == 0 && self.failures.is_empty()
    }

    /// Provenance lines for a report with failures.
    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.dropped > 0 {
            out.push(format!(
                "{} simulated outcome(s) could not be written to the pattern database",
                self.dropped
            ));
        }
        out.extend(
            self.failures
                .iter()
                .map(|f| format!("Outcome recorder: {}", f)),
        );
        out
    }
}

/// Totals over the recorder's lifetime, returned when the task ends
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecorderSummary {
    pub stored: usize,
    pub dropped: usize,
    pub flushes: usize,
}

/// Cloneable sending side of the recorder task
#[derive(Clone)]
pub struct Recorder {
    tx: mpsc::UnboundedSender<RecorderCommand>,
}

/// Spawn the writer task on the current tokio runtime.
pub fn start_recorder(db: Database) -> (Recorder, JoinHandle<RecorderSummary>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_recorder(db, rx));
    (Recorder { tx }, task)
}

impl Recorder {
    /// Queue outcomes for writing. Never blocks.
    pub fn store(&self, records: Vec<PatternOutcomeRecord>) -> Result<()> {
        self.tx
            .send(RecorderCommand::Store(records))
            .map_err(|_| anyhow!("outcome recorder has stopped"))
    }

    /// Write everything queued so far and rebuild the touched statistics.
    pub async fn flush(&self) -> Result<FlushReport> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(RecorderCommand::Flush(ack))
            .map_err(|_| anyhow!("outcome recorder has stopped"))?;
        done.await
            .map_err(|_| anyhow!("outcome recorder stopped before acknowledging flush"))
    }

    /// Final flush, then stop the task.
    pub async fn shutdown(self) -> Result<FlushReport> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(RecorderCommand::Shutdown(ack))
            .map_err(|_| anyhow!("outcome recorder has stopped"))?;
        done.await
            .map_err(|_| anyhow!("outcome recorder stopped before acknowledging shutdown"))
    }
}

impl OutcomeSink for Recorder {
    fn record(&self, records: Vec<PatternOutcomeRecord>) -> Result<()> {
        self.store(records)
    }
}

/// Rebuild statistics for `touched` and hand over the write failures held in
/// `pending`.
fn flush(db: &Database, touched: &mut BTreeSet<String>, pending: &mut FlushReport) -> FlushReport {
    let mut report = std::mem::take(pending);
    for id in std::mem::take(touched) {
        match db.recalculate_statistics(&id) {
            Ok(_) => report.patterns_recalculated += 1,
            Err(e) => {
                warn!("Failed to recalculate statistics for {}: {}", id, e);
                report.failures.push(format!("{}: {:#}", id, e));
            }
        }
    }
    report
}

async fn run_recorder(
    db: Database,
    mut rx: mpsc::UnboundedReceiver<RecorderCommand>,
) -> RecorderSummary {
    info!("Outcome recorder started");
    let mut touched: BTreeSet<String> = BTreeSet::new();
    let mut pending = FlushReport::default();
    let mut summary = RecorderSummary::default();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            RecorderCommand::Store(records) => match db.store_outcomes(&records) {
                Ok(n) => {
                    summary.stored += n;
                    touched.extend(records.into_iter().map(|r| r.pattern_id));
                }
                Err(e) => {
                    warn!("Failed to store {} outcomes: {:#}", records.len(), e);
                    summary.dropped += records.len();
                    pending.dropped += records.len();
                    pending
                        .failures
                        .push(format!("store of {} outcome(s) failed: {:#}", records.len(), e));
                }
            },
            RecorderCommand::Flush(ack) => {
                let report = flush(&db, &mut touched, &mut pending);
                summary.flushes += 1;
                debug!(
                    "Recorder flush: {} patterns recalculated",
                    report.patterns_recalculated
                );
                let _ = ack.send(report);
            }
            RecorderCommand::Shutdown(ack) => {
                let report = flush(&db, &mut touched, &mut pending);
                summary.flushes += 1;
                let _ = ack.send(report);
                break;
            }
        }
    }

    // every sender dropped without a shutdown: still leave statistics current
    if !touched.is_empty() {
        flush(&db, &mut touched, &mut pending);
        summary.flushes += 1;
    }
    info!(
        "Outcome recorder stopped ({} stored, {} dropped, {} flushes)",
        summary.stored, summary.dropped, summary.flushes
    );
    summary
}
