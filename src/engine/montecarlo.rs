//! Batched, parallel Monte Carlo runner.
//!
//! Work is split into batches of `batch_size` trials and each batch into
//! chunks of `chunk_size`. Every chunk owns an RNG seeded from
//! `(seed, batch, chunk)` and local integer counters, so the merged result
//! for a given seed does not depend on the number of worker threads.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::db::models::{OutcomeOrigin, PatternOutcomeRecord};
use crate::engine::boost::LambdaBreakdown;
use crate::engine::chaos::ChaosModel;
use crate::engine::markets::{MarketCounters, MarketProbabilities};
use crate::engine::sampler::{self, Dispersion};
use crate::engine::settings::{DistributionKind, SimulationConfig};
use crate::error::EngineResult;

// ── Seeding ──────────────────────────────────────────────────────────────────

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Independent stream seed for one chunk of one batch.
pub fn derive_seed(seed: u64, batch: u64, chunk: u64) -> u64 {
    splitmix64(splitmix64(splitmix64(seed) ^ batch) ^ chunk)
}

// ── Cancellation ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Complete,
    Cancelled,
    TimedOut,
}

/// Shared stop flag with an optional deadline. Checked before every chunk.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Why the run should stop now, if it should.
    pub fn stop_reason(&self) -> Option<RunStatus> {
        if self.is_cancelled() {
            return Some(RunStatus::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(RunStatus::TimedOut),
            _ => None,
        }
    }
}

// ── Seams ────────────────────────────────────────────────────────────────────

/// Receives sampled outcomes after each batch.
pub trait OutcomeSink: Send + Sync {
    /// An `Err` means the batch was not accepted; the run continues and
    /// counts it in [`RecordingReport::dropped`].
    fn record(&self, records: Vec<PatternOutcomeRecord>) -> anyhow::Result<()>;
}

/// Per-run knobs that are not part of the request.
#[derive(Clone, Copy, Default)]
pub struct RunControl<'a> {
    /// Dedicated pool; `None` runs on rayon's global pool.
    pub pool: Option<&'a rayon::ThreadPool>,
    pub cancel: Option<&'a CancelToken>,
    pub sink: Option<&'a dyn OutcomeSink>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SideModel {
    pub breakdown: LambdaBreakdown,
    /// Gamma shape for negative binomial draws; `None` samples Poisson.
    pub dispersion: Option<Dispersion>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationInputs {
    pub home: SideModel,
    pub away: SideModel,
    /// Outcomes are recorded under this id when set.
    pub pattern_id: Option<String>,
}

// ── Output ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationOutcomeDistribution {
    pub status: RunStatus,
    pub iterations_requested: u64,
    pub iterations_completed: u64,
    pub seed: u64,
    pub distribution: DistributionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home_dispersion: Option<Dispersion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub away_dispersion: Option<Dispersion>,
    pub markets: MarketProbabilities,
    pub recording: RecordingReport,
    #[serde(skip)]
    pub counters: MarketCounters,
}

/// What happened to the outcomes handed to the sink.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecordingReport {
    pub sent: u64,
    pub dropped: u64,
    /// First sink error, if any batch was refused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RecordingReport {
    fn submit(&mut self, sink: &dyn OutcomeSink, records: Vec<PatternOutcomeRecord>) {
        let n = records.len() as u64;
        match sink.record(records) {
            Ok(()) => self.sent += n,
            Err(e) => {
                warn!("Outcome sink refused {} record(s): {:#}", n, e);
                self.dropped += n;
                self.error.get_or_insert_with(|| format!("{:#}", e));
            }
        }
    }
}

// ── Trials ───────────────────────────────────────────────────────────────────

struct TrialContext<'a> {
    inputs: &'a SimulationInputs,
    kind: DistributionKind,
    chaos: ChaosModel,
    first_half_share: f64,
    record_every: u64,
    score_max: u8,
    seed: u64,
}

struct ChunkResult {
    counters: MarketCounters,
    records: Vec<PatternOutcomeRecord>,
}

impl ChunkResult {
    fn merge(mut self, other: ChunkResult) -> ChunkResult {
        self.counters = self.counters.merge(other.counters);
        self.records.extend(other.records);
        self
    }
}

/// Keep each goal independently with probability `share`.
fn thin<R: Rng + ?Sized>(goals: u32, share: f64, rng: &mut R) -> u32 {
    (0..goals).filter(|_| rng.gen::<f64>() < share).count() as u32
}

impl TrialContext<'_> {
    fn empty(&self) -> ChunkResult {
        ChunkResult {
            counters: MarketCounters::new(self.score_max),
            records: Vec::new(),
        }
    }

    /// Run `trials` trials whose global indices start at `first`.
    fn run_chunk(&self, batch: u64, chunk: u64, first: u64, trials: u64) -> ChunkResult {
        let mut rng = StdRng::seed_from_u64(derive_seed(self.seed, batch, chunk));
        let mut out = self.empty();
        let (home, away) = (&self.inputs.home, &self.inputs.away);

        for i in first..first + trials {
            let shock = self
                .chaos
                .sample(home.breakdown.pre_chaos(), away.breakdown.pre_chaos(), &mut rng);
            let home_lambda = home.breakdown.with_chaos(shock.home);
            let away_lambda = away.breakdown.with_chaos(shock.away);

            let h = sampler::sample(home_lambda, self.kind, home.dispersion, &mut rng);
            let a = sampler::sample(away_lambda, self.kind, away.dispersion, &mut rng);
            let ht_h = thin(h, self.first_half_share, &mut rng);
            let ht_a = thin(a, self.first_half_share, &mut rng);
            out.counters.record(h, a, ht_h, ht_a);

            if self.record_every > 0 && i % self.record_every == 0 {
                if let Some(id) = &self.inputs.pattern_id {
                    out.records.push(PatternOutcomeRecord::from_score(
                        id.as_str(),
                        h,
                        a,
                        Some(i),
                        OutcomeOrigin::Simulated,
                    ));
                }
            }
        }
        out
    }
}

fn with_pool<T: Send>(pool: Option<&rayon::ThreadPool>, action: impl FnOnce() -> T + Send) -> T {
    match pool {
        Some(pool) => pool.install(action),
        None => action(),
    }
}

/// Simulate the fixture `config.iterations` times.
///
/// A cancelled or timed-out run returns the chunks that finished, with
/// probabilities taken over `iterations_completed`.
pub fn run(
    inputs: &SimulationInputs,
    config: &SimulationConfig,
    control: RunControl<'_>,
) -> EngineResult<SimulationOutcomeDistribution> {
    config.validate()?;

    let seed = config.seed.unwrap_or_else(rand::random);
    let kind = config.distribution;
    let ctx = TrialContext {
        inputs,
        kind,
        chaos: ChaosModel::new(&config.chaos),
        first_half_share: config.markets.first_half_share,
        record_every: config.record_every,
        score_max: config.markets.exact_score_max,
        seed,
    };

    let never = CancelToken::new();
    let cancel = control.cancel.unwrap_or(&never);
    let batches = config.iterations.div_ceil(config.batch_size);
    let mut counters = MarketCounters::new(config.markets.exact_score_max);
    let mut status = RunStatus::Complete;
    let mut recording = RecordingReport::default();

    for batch in 0..batches {
        let batch_start = batch * config.batch_size;
        let batch_trials = config.batch_size.min(config.iterations - batch_start);
        let chunks = batch_trials.div_ceil(config.chunk_size);

        let merged = with_pool(control.pool, || {
            (0..chunks)
                .into_par_iter()
                .map(|chunk| {
                    if cancel.stop_reason().is_some() {
                        return ctx.empty();
                    }
                    let offset = chunk * config.chunk_size;
                    let trials = config.chunk_size.min(batch_trials - offset);
                    ctx.run_chunk(batch, chunk, batch_start + offset, trials)
                })
                .reduce(|| ctx.empty(), ChunkResult::merge)
        });

        debug!(
            "Batch {}/{}: {} of {} trials",
            batch + 1,
            batches,
            merged.counters.trials,
            batch_trials
        );
        counters = counters.merge(merged.counters);
        if let Some(sink) = control.sink {
            if !merged.records.is_empty() {
                recording.submit(sink, merged.records);
            }
        }

        if let Some(reason) = cancel.stop_reason() {
            status = reason;
            break;
        }
    }

    let completed = counters.trials;
    if status == RunStatus::Complete && completed < config.iterations {
        // a chunk saw the stop signal after the last batch finished
        status = cancel.stop_reason().unwrap_or(RunStatus::Cancelled);
    }
    if status != RunStatus::Complete {
        warn!(
            "Simulation stopped ({:?}) after {} of {} iterations",
            status, completed, config.iterations
        );
    }

    Ok(SimulationOutcomeDistribution {
        status,
        iterations_requested: config.iterations,
        iterations_completed: completed,
        seed,
        distribution: kind,
        home_dispersion: inputs.home.dispersion,
        away_dispersion: inputs.away.dispersion,
        markets: counters.summarize(),
        recording,
        counters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::boost::{LambdaBreakdown, StreakInfo};
    use crate::engine::reversion::ReversionAnalysisResult;
    use crate::engine::settings::BoostConfig;
    use crate::models::Side;
    use approx::assert_relative_eq;
    use std::sync::Mutex;

    fn side(side: Side, base: f64) -> SideModel {
        let boosts = BoostConfig {
            home_advantage: 0.0,
            ..Default::default()
        };
        SideModel {
            breakdown: LambdaBreakdown::build(
                side,
                base,
                &boosts,
                &StreakInfo::NONE,
                &ReversionAnalysisResult::default(),
            ),
            dispersion: None,
        }
    }

    fn inputs() -> SimulationInputs {
        SimulationInputs {
            home: side(Side::Home, 1.5),
            away: side(Side::Away, 1.1),
            pattern_id: Some("c".repeat(64)),
        }
    }

    fn config(iterations: u64) -> SimulationConfig {
        let mut cfg = SimulationConfig {
            iterations,
            batch_size: 4_000,
            chunk_size: 500,
            seed: Some(42),
            ..Default::default()
        };
        cfg.chaos.enabled = false;
        cfg
    }

    #[derive(Default)]
    struct CollectSink {
        records: Mutex<Vec<PatternOutcomeRecord>>,
        cancel_on_first: Option<CancelToken>,
    }

    impl OutcomeSink for CollectSink {
        fn record(&self, records: Vec<PatternOutcomeRecord>) -> anyhow::Result<()> {
            self.records.lock().unwrap().extend(records);
            if let Some(token) = &self.cancel_on_first {
                token.cancel();
            }
            Ok(())
        }
    }

    struct ClosedSink;

    impl OutcomeSink for ClosedSink {
        fn record(&self, _: Vec<PatternOutcomeRecord>) -> anyhow::Result<()> {
            anyhow::bail!("sink closed")
        }
    }

    #[test]
    fn derived_seeds_differ_per_chunk() {
        assert_eq!(derive_seed(1, 2, 3), derive_seed(1, 2, 3));
        assert_ne!(derive_seed(1, 0, 0), derive_seed(1, 0, 1));
        assert_ne!(derive_seed(1, 0, 1), derive_seed(1, 1, 0));
        assert_ne!(derive_seed(1, 0, 0), derive_seed(2, 0, 0));
    }

    #[test]
    fn same_seed_is_bit_identical_across_thread_counts() {
        let mut cfg = config(10_000);
        cfg.chaos.enabled = true;
        let one = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        let four = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();
        let a = run(
            &inputs(),
            &cfg,
            RunControl {
                pool: Some(&one),
                ..Default::default()
            },
        )
        .unwrap();
        let b = run(
            &inputs(),
            &cfg,
            RunControl {
                pool: Some(&four),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(a.counters, b.counters);
        assert_eq!(a, b);
    }

    #[test]
    fn probabilities_are_normalised() {
        let d = run(&inputs(), &config(20_000), RunControl::default()).unwrap();
        assert_eq!(d.status, RunStatus::Complete);
        assert_eq!(d.iterations_completed, 20_000);
        let r = &d.markets.result_ft;
        assert_relative_eq!(r.home + r.draw + r.away, 1.0, epsilon = 1e-9);
        for line in &d.markets.totals_ft {
            let sum = line.win + line.half_win + line.push + line.half_lose + line.lose;
            assert_relative_eq!(sum, 1.0, epsilon = 1e-9);
        }
        let cs: f64 = d.markets.correct_score.values().sum();
        assert_relative_eq!(cs, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn mean_goals_track_the_lambdas() {
        let d = run(&inputs(), &config(60_000), RunControl::default()).unwrap();
        let m = &d.markets;
        assert!((m.mean_home_goals - 1.5).abs() < 0.03, "{}", m.mean_home_goals);
        assert!((m.mean_away_goals - 1.1).abs() < 0.03, "{}", m.mean_away_goals);
        // a 45% first-half share leaves more half-time draws than full-time ones
        assert!(d.markets.result_ht.draw > d.markets.result_ft.draw);
    }

    #[test]
    fn cancellation_returns_scaled_partial_result() {
        let token = CancelToken::new();
        let sink = CollectSink {
            cancel_on_first: Some(token.clone()),
            ..Default::default()
        };
        let mut cfg = config(20_000);
        cfg.record_every = 1;
        let d = run(
            &inputs(),
            &cfg,
            RunControl {
                cancel: Some(&token),
                sink: Some(&sink),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(d.status, RunStatus::Cancelled);
        assert_eq!(d.iterations_completed, 4_000);
        assert_eq!(d.iterations_requested, 20_000);
        let r = &d.markets.result_ft;
        assert_relative_eq!(r.home + r.draw + r.away, 1.0, epsilon = 1e-9);
        assert_eq!(sink.records.lock().unwrap().len(), 4_000);
    }

    #[test]
    fn expired_deadline_runs_nothing() {
        let token = CancelToken::new().with_timeout(Duration::ZERO);
        let d = run(
            &inputs(),
            &config(5_000),
            RunControl {
                cancel: Some(&token),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(d.status, RunStatus::TimedOut);
        assert_eq!(d.iterations_completed, 0);
        assert_eq!(d.markets.result_ft.home, 0.0);
        assert!(d.markets.totals_ft.iter().all(|l| l.win_no_push == 0.0));
    }

    #[test]
    fn every_nth_trial_is_recorded() {
        let sink = CollectSink::default();
        let mut cfg = config(10_000);
        cfg.record_every = 100;
        let d = run(
            &inputs(),
            &cfg,
            RunControl {
                sink: Some(&sink),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(d.recording.sent, 100);
        assert_eq!(d.recording.dropped, 0);
        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 100);
        assert!(records.iter().all(|r| r.origin == OutcomeOrigin::Simulated));
        assert_eq!(records[0].iteration, Some(0));

        let anonymous = SimulationInputs {
            pattern_id: None,
            ..inputs()
        };
        let sink = CollectSink::default();
        run(
            &anonymous,
            &cfg,
            RunControl {
                sink: Some(&sink),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(sink.records.lock().unwrap().is_empty());
    }

    #[test]
    fn refused_batches_are_counted_not_fatal() {
        let mut cfg = config(10_000);
        cfg.record_every = 10;
        let d = run(
            &inputs(),
            &cfg,
            RunControl {
                sink: Some(&ClosedSink),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(d.status, RunStatus::Complete);
        assert_eq!(d.iterations_completed, 10_000);
        assert_eq!(d.recording.sent, 0);
        assert_eq!(d.recording.dropped, 1_000);
        assert_eq!(d.recording.error.as_deref(), Some("sink closed"));
    }

    #[test]
    fn invalid_configuration_aborts_before_sampling() {
        let cfg = SimulationConfig {
            chunk_size: 0,
            ..config(1_000)
        };
        let err = run(&inputs(), &cfg, RunControl::default()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn missing_seed_is_generated_and_reported() {
        let cfg = SimulationConfig {
            seed: None,
            ..config(1_000)
        };
        let d = run(&inputs(), &cfg, RunControl::default()).unwrap();
        let replay = run(
            &inputs(),
            &SimulationConfig {
                seed: Some(d.seed),
                ..cfg
            },
            RunControl::default(),
        )
        .unwrap();
        assert_eq!(d.counters, replay.counters);
    }
}
