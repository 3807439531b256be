//! Offline calibration of reversion thresholds.
//!
//! Simulates long neutral match sequences with the goal sampler, records
//! every maximal run of each streak event, and sets each threshold at the
//! shortest run length that only the rarest `1 - percentile` share of runs
//! reach.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::montecarlo::derive_seed;
use crate::engine::sampler::sample_poisson;
use crate::engine::settings::ReversionThresholds;
use crate::error::{EngineError, EngineResult};

/// Runs longer than this are counted in the last bucket.
const MAX_RUN: usize = 64;
const SEQUENCES_PER_CHUNK: u64 = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationSettings {
    pub sequences: u64,
    pub sequence_len: usize,
    pub percentile: f64,
    pub home_lambda: f64,
    pub away_lambda: f64,
    pub seed: u64,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        CalibrationSettings {
            sequences: 20_000,
            sequence_len: 100,
            percentile: 0.85,
            home_lambda: 1.35,
            away_lambda: 1.35,
            seed: 0x5EED,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunKind {
    Over,
    Under,
    CleanSheet,
    Goalless,
    Win,
    H2hWin,
}

const KINDS: [RunKind; 6] = [
    RunKind::Over,
    RunKind::Under,
    RunKind::CleanSheet,
    RunKind::Goalless,
    RunKind::Win,
    RunKind::H2hWin,
];

/// Counts of maximal runs by length, one histogram per run kind.
#[derive(Debug, Clone, PartialEq)]
struct RunHistogram {
    counts: Vec<[u64; MAX_RUN + 1]>,
}

impl Default for RunHistogram {
    fn default() -> Self {
        RunHistogram {
            counts: vec![[0; MAX_RUN + 1]; KINDS.len()],
        }
    }
}

impl RunHistogram {
    fn record(&mut self, kind: RunKind, len: usize) {
        if len == 0 {
            return;
        }
        let idx = KINDS.iter().position(|k| *k == kind).unwrap_or(0);
        self.counts[idx][len.min(MAX_RUN)] += 1;
    }

    fn merge(mut self, other: RunHistogram) -> RunHistogram {
        for (mine, theirs) in self.counts.iter_mut().zip(other.counts) {
            for (a, b) in mine.iter_mut().zip(theirs) {
                *a += b;
            }
        }
        self
    }

    fn total(&self, kind: RunKind) -> u64 {
        let idx = KINDS.iter().position(|k| *k == kind).unwrap_or(0);
        self.counts[idx].iter().sum()
    }

    /// Shortest length `L` with `P(run >= L) <= 1 - percentile`.
    fn threshold(&self, kind: RunKind, percentile: f64) -> Option<u32> {
        let idx = KINDS.iter().position(|k| *k == kind)?;
        let hist = &self.counts[idx];
        let total: u64 = hist.iter().sum();
        if total == 0 {
            return None;
        }
        // tolerance keeps exact shares such as 2/10 vs 1 - 0.8 on the right side
        let tail_share = 1.0 - percentile + 1e-12;
        let mut at_least = total;
        for len in 1..=MAX_RUN {
            if (at_least as f64 / total as f64) <= tail_share {
                return Some(len as u32);
            }
            at_least -= hist[len];
        }
        Some(MAX_RUN as u32)
    }
}

/// Feed the maximal runs of `true` in one sequence into the histogram.
fn record_runs(hist: &mut RunHistogram, kind: RunKind, events: impl Iterator<Item = bool>) {
    let mut run = 0usize;
    for hit in events {
        if hit {
            run += 1;
        } else {
            hist.record(kind, run);
            run = 0;
        }
    }
    hist.record(kind, run);
}

fn simulate_chunk(settings: &CalibrationSettings, chunk: u64, sequences: u64) -> RunHistogram {
    let mut rng = StdRng::seed_from_u64(derive_seed(settings.seed, 0, chunk));
    let mut hist = RunHistogram::default();
    let mut games = Vec::with_capacity(settings.sequence_len);
    for _ in 0..sequences {
        games.clear();
        for _ in 0..settings.sequence_len {
            let h = sample_poisson(settings.home_lambda, &mut rng);
            let a = sample_poisson(settings.away_lambda, &mut rng);
            games.push((h, a));
        }
        let over = |&(h, a): &(u32, u32)| (h + a) as f64 > 2.5;
        record_runs(&mut hist, RunKind::Over, games.iter().map(over));
        record_runs(&mut hist, RunKind::Under, games.iter().map(|g| !over(g)));
        record_runs(&mut hist, RunKind::CleanSheet, games.iter().map(|&(_, a)| a == 0));
        record_runs(&mut hist, RunKind::Goalless, games.iter().map(|&(h, _)| h == 0));
        record_runs(&mut hist, RunKind::Win, games.iter().map(|&(h, a)| h > a));
        record_runs(&mut hist, RunKind::H2hWin, games.iter().map(|&(h, a)| h > a));
        record_runs(&mut hist, RunKind::H2hWin, games.iter().map(|&(h, a)| a > h));
    }
    hist
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub thresholds: ReversionThresholds,
    pub percentile: f64,
    pub sequences: u64,
    pub runs_observed: u64,
}

/// Derive reversion thresholds from neutral simulations.
pub fn calibrate_thresholds(settings: &CalibrationSettings) -> EngineResult<CalibrationReport> {
    if settings.sequences == 0 || settings.sequence_len == 0 {
        return Err(EngineError::invalid("calibration needs at least one non-empty sequence"));
    }
    if !(settings.percentile > 0.0 && settings.percentile < 1.0) {
        return Err(EngineError::invalid("percentile must be strictly between 0 and 1"));
    }

    let chunks = settings.sequences.div_ceil(SEQUENCES_PER_CHUNK);
    let hist = (0..chunks)
        .into_par_iter()
        .map(|chunk| {
            let start = chunk * SEQUENCES_PER_CHUNK;
            let n = SEQUENCES_PER_CHUNK.min(settings.sequences - start);
            simulate_chunk(settings, chunk, n)
        })
        .reduce(RunHistogram::default, RunHistogram::merge);

    let defaults = ReversionThresholds::default();
    let pick = |kind, fallback| hist.threshold(kind, settings.percentile).unwrap_or(fallback);
    let over = pick(RunKind::Over, defaults.over);
    let under = pick(RunKind::Under, defaults.under);
    let thresholds = ReversionThresholds {
        over,
        under,
        h2h_win: pick(RunKind::H2hWin, defaults.h2h_win),
        h2h_over: over,
        h2h_under: under,
        clean_sheet: pick(RunKind::CleanSheet, defaults.clean_sheet),
        goalless: pick(RunKind::Goalless, defaults.goalless),
        win: pick(RunKind::Win, defaults.win),
    };
    let runs_observed: u64 = KINDS.iter().map(|k| hist.total(*k)).sum();
    info!(
        "Calibrated thresholds from {} sequences ({} runs): {:?}",
        settings.sequences, runs_observed, thresholds
    );
    Ok(CalibrationReport {
        thresholds,
        percentile: settings.percentile,
        sequences: settings.sequences,
        runs_observed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> CalibrationSettings {
        CalibrationSettings {
            sequences: 2_000,
            sequence_len: 60,
            seed: 7,
            ..Default::default()
        }
    }

    #[test]
    fn neutral_thresholds_are_plausible() {
        let report = calibrate_thresholds(&quick()).unwrap();
        let t = report.thresholds;
        assert!((3..=5).contains(&t.over), "over {}", t.over);
        assert!((3..=5).contains(&t.under), "under {}", t.under);
        assert!((2..=4).contains(&t.clean_sheet), "clean sheet {}", t.clean_sheet);
        assert!((2..=4).contains(&t.goalless), "goalless {}", t.goalless);
        assert!((2..=4).contains(&t.win), "win {}", t.win);
        assert!(report.runs_observed > 0);
    }

    #[test]
    fn calibration_is_deterministic() {
        let a = calibrate_thresholds(&quick()).unwrap();
        let b = calibrate_thresholds(&quick()).unwrap();
        assert_eq!(a.thresholds, b.thresholds);
        assert_eq!(a.runs_observed, b.runs_observed);
    }

    #[test]
    fn stricter_percentile_never_lowers_thresholds() {
        let loose = calibrate_thresholds(&quick()).unwrap().thresholds;
        let strict = calibrate_thresholds(&CalibrationSettings {
            percentile: 0.97,
            ..quick()
        })
        .unwrap()
        .thresholds;
        assert!(strict.over >= loose.over);
        assert!(strict.clean_sheet >= loose.clean_sheet);
    }

    #[test]
    fn invalid_percentile_is_rejected() {
        let err = calibrate_thresholds(&CalibrationSettings {
            percentile: 1.0,
            ..quick()
        })
        .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn run_histogram_threshold_on_known_counts() {
        let mut hist = RunHistogram::default();
        // ten runs: 5x1, 3x2, 1x3, 1x4
        for len in [1, 1, 1, 1, 1, 2, 2, 2, 3, 4] {
            hist.record(RunKind::Over, len);
        }
        // P(>=3) = 0.2, P(>=4) = 0.1
        assert_eq!(hist.threshold(RunKind::Over, 0.8), Some(3));
        assert_eq!(hist.threshold(RunKind::Over, 0.85), Some(4));
        assert_eq!(hist.threshold(RunKind::Win, 0.85), None);
    }

    #[test]
    fn record_runs_splits_on_misses() {
        let mut hist = RunHistogram::default();
        record_runs(
            &mut hist,
            RunKind::Win,
            [true, true, false, true, false, false, true, true, true].into_iter(),
        );
        assert_eq!(hist.total(RunKind::Win), 3);
        assert_eq!(hist.threshold(RunKind::Win, 0.6), Some(3));
    }
}
