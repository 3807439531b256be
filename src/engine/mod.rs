pub mod boost;
pub mod calibration;
pub mod chaos;
pub mod markets;
pub mod montecarlo;
pub mod odds;
pub mod reversion;
pub mod sampler;
pub mod settings;

use anyhow::Context;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::models::{OutcomeOrigin, PatternOutcomeRecord, PatternStatistics};
use crate::db::{Database, PatternStore};
use crate::error::{EngineError, EngineResult};
use crate::models::{HistoricalMatch, MatchHistory, MatchRequest, Side};
use crate::pattern::encoder::{encode_history, PatternFingerprint};
use crate::pattern::evidence::{EvidencePrediction, EvidencePredictor, EvidenceSource};

use boost::{base_lambdas, detect_streak, LambdaBreakdown, StreakInfo};
use montecarlo::{
    CancelToken, OutcomeSink, RunControl, RunStatus, SideModel, SimulationInputs,
    SimulationOutcomeDistribution,
};
use odds::{price_markets, Selection, ValueBet};
use reversion::{analyze_all_patterns, ReversionAnalysisResult};
use sampler::{estimate_dispersion, recommend_distribution};
use settings::{DistributionKind, IntegrationMode, SimulationConfig};

// ── Output ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionPath {
    Simulation,
    ExactEvidence,
    SimilarEvidence,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LambdaPair {
    pub home: LambdaBreakdown,
    pub away: LambdaBreakdown,
}

/// The adjustment path that was computed but not used.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathAudit {
    pub path: PredictionPath,
    pub confidence: f64,
    pub home_lambda: f64,
    pub away_lambda: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Provenance {
    pub path: PredictionPath,
    pub mode: IntegrationMode,
    /// Share of the gap to the evidence rates that was applied (0 on the simulation path).
    pub evidence_weight: f64,
    pub simulation_confidence: f64,
    pub database_available: bool,
    pub recommended_distribution: DistributionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit: Option<PathAudit>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchPrediction {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home_team: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub away_team: Option<String>,
    pub pattern: PatternFingerprint,
    pub reversion: ReversionAnalysisResult,
    pub evidence: EvidencePrediction,
    pub lambdas: LambdaPair,
    pub distribution: SimulationOutcomeDistribution,
    pub selections: Vec<Selection>,
    pub value_bets: Vec<ValueBet>,
    pub confidence: f64,
    pub provenance: Provenance,
}

impl MatchPrediction {
    pub fn selection(&self, key: &str) -> Option<&Selection> {
        self.selections.iter().find(|s| s.key == key)
    }
}

// ── Confidence ───────────────────────────────────────────────────────────────

const BASE_CONFIDENCE: f64 = 0.55;
const MAX_CONFIDENCE: f64 = 0.92;

/// Overall confidence from simulation size, data depth and exact evidence.
pub fn prediction_confidence(iterations: u64, history: &MatchHistory, exact_evidence: bool) -> f64 {
    let mut c = BASE_CONFIDENCE;
    if iterations >= 100_000 {
        c += 0.10;
    } else if iterations >= 10_000 {
        c += 0.05;
    }
    if history.h2h.len() >= 5 {
        c += 0.05;
    }
    if history.home.len() >= 5 && history.away.len() >= 5 {
        c += 0.05;
    }
    if exact_evidence {
        c += 0.05;
    }
    c.min(MAX_CONFIDENCE)
}

/// Confidence of the simulation-only path: data quality of the fingerprint,
/// averaged with the mean reversion-pattern confidence when any fired.
fn simulation_confidence(fp: &PatternFingerprint, reversion: &ReversionAnalysisResult) -> f64 {
    if reversion.patterns.is_empty() {
        fp.confidence
    } else {
        (fp.confidence + reversion.mean_confidence()) / 2.0
    }
}

fn goal_series(matches: &[HistoricalMatch], side: Side) -> Vec<u32> {
    matches.iter().map(|m| m.goals_for(side)).collect()
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// Wires every component together for one request at a time.
pub struct PredictionEngine {
    db: Option<Database>,
    /// Why the database could not be opened; reported on every prediction.
    db_error: Option<String>,
    pool: Option<rayon::ThreadPool>,
}

impl PredictionEngine {
    pub fn new(db: Option<Database>) -> Self {
        PredictionEngine {
            db,
            db_error: None,
            pool: None,
        }
    }

    /// Simulation-only engine for a database that failed to open.
    pub fn without_database(err: anyhow::Error) -> Self {
        PredictionEngine {
            db: None,
            db_error: Some(EngineError::from(err).to_string()),
            pool: None,
        }
    }

    /// Run simulations on a dedicated pool of `threads` workers (0 keeps
    /// rayon's global pool).
    pub fn with_threads(mut self, threads: usize) -> anyhow::Result<Self> {
        if threads > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .context("Failed to build simulation thread pool")?;
            self.pool = Some(pool);
        }
        Ok(self)
    }

    pub fn database(&self) -> Option<&Database> {
        self.db.as_ref()
    }

    /// Produce a full prediction. Only configuration errors are returned;
    /// everything else degrades and is reported in the provenance.
    pub fn predict(
        &self,
        request: &MatchRequest,
        cancel: Option<&CancelToken>,
        sink: Option<&dyn OutcomeSink>,
    ) -> EngineResult<MatchPrediction> {
        let cfg = &request.config;
        cfg.validate()?;

        let history = request.history.clone().normalized();
        let mut warnings: Vec<String> = self.db_error.iter().cloned().collect();
        let mut database_available = self.db.is_some();

        // fingerprint
        let pattern = encode_history(&history, cfg.evidence.complexity);
        warnings.extend(pattern.issues.iter().cloned());
        if let Some(db) = &self.db {
            if let Err(e) = db.register_pattern(&pattern) {
                let err = EngineError::from(e);
                warn!("Could not register pattern: {}", err);
                warnings.push(err.to_string());
                database_available = false;
            }
        }

        // reversion
        let reversion =
            analyze_all_patterns(&history.home, &history.away, &history.h2h, &cfg.reversion);
        for p in &reversion.patterns {
            info!(
                "Reversion pattern {} fired: length {} >= {}, confidence {:.2}",
                p.category.as_str(),
                p.length,
                p.threshold,
                p.confidence
            );
        }
        for skipped in &reversion.skipped {
            debug!("{}", skipped.to_error());
        }

        // boosts
        let base = base_lambdas(&history);
        let base_home = cfg.base_home_lambda.unwrap_or(base.home);
        let base_away = cfg.base_away_lambda.unwrap_or(base.away);
        let streak = |side| {
            if cfg.boosts.streak_enabled {
                detect_streak(history.team_matches(side), side)
            } else {
                StreakInfo::NONE
            }
        };
        let build = |side, base| {
            LambdaBreakdown::build(side, base, &cfg.boosts, &streak(side), &reversion)
        };
        let simulated = LambdaPair {
            home: build(Side::Home, base_home),
            away: build(Side::Away, base_away),
        };

        // evidence
        let store = if database_available {
            self.db.as_ref().map(|d| d as &dyn PatternStore)
        } else {
            None
        };
        let evidence = EvidencePredictor::new(store, &cfg.evidence).predict(&pattern);
        // a failed open or registration already reported the database error
        let reported = !database_available && (self.db.is_some() || self.db_error.is_some());
        if let (Some(w), false) = (&evidence.warning, reported) {
            warnings.push(w.clone());
        }
        database_available &= evidence.database_available;
        info!(
            "Evidence source {:?} (confidence {:.2}, {} outcomes)",
            evidence.source, evidence.confidence, evidence.sample_size
        );

        let sim_confidence = simulation_confidence(&pattern, &reversion);
        let (lambdas, path, weight, audit) =
            integrate(cfg, &simulated, &evidence, sim_confidence);

        // dispersion
        let recommended = recommend_distribution(
            &[
                goal_series(&history.home, Side::Home),
                goal_series(&history.away, Side::Away),
            ]
            .concat(),
        );
        let mut dispersion = |side: Side| {
            if cfg.distribution != DistributionKind::NegativeBinomial {
                return None;
            }
            let d = estimate_dispersion(&goal_series(history.team_matches(side), side));
            if d.is_none() {
                warnings.push(format!(
                    "{} goal series is not over-dispersed, sampling Poisson",
                    side.as_str()
                ));
            }
            d
        };
        let home_dispersion = dispersion(Side::Home);
        let away_dispersion = dispersion(Side::Away);

        // simulate
        let inputs = SimulationInputs {
            home: SideModel {
                breakdown: lambdas.home,
                dispersion: home_dispersion,
            },
            away: SideModel {
                breakdown: lambdas.away,
                dispersion: away_dispersion,
            },
            pattern_id: pattern
                .valid_for_matching
                .then(|| pattern.unique_pattern_id.clone()),
        };
        let distribution = montecarlo::run(
            &inputs,
            cfg,
            RunControl {
                pool: self.pool.as_ref(),
                cancel,
                sink,
            },
        )?;
        if distribution.status != RunStatus::Complete {
            warnings.push(format!(
                "simulation {:?} after {} of {} iterations",
                distribution.status,
                distribution.iterations_completed,
                distribution.iterations_requested
            ));
        }
        let recording = &distribution.recording;
        if recording.dropped > 0 {
            warnings.push(format!(
                "{} simulated outcome(s) were not recorded: {}",
                recording.dropped,
                recording.error.as_deref().unwrap_or("sink refused them")
            ));
        }

        let priced = price_markets(&distribution.markets, &request.bookmaker_odds, &cfg.markets);
        warnings.extend(priced.warnings);

        let confidence = prediction_confidence(
            distribution.iterations_completed,
            &history,
            path == PredictionPath::ExactEvidence,
        );

        Ok(MatchPrediction {
            home_team: request.home_team.clone(),
            away_team: request.away_team.clone(),
            pattern,
            reversion,
            evidence,
            lambdas,
            distribution,
            selections: priced.selections,
            value_bets: priced.value_bets,
            confidence,
            provenance: Provenance {
                path,
                mode: cfg.evidence.mode,
                evidence_weight: weight,
                simulation_confidence: sim_confidence,
                database_available,
                recommended_distribution: recommended,
                audit,
                warnings,
            },
        })
    }

    /// Store a real final score under the request's fingerprint and return
    /// the refreshed statistics.
    pub fn record_result(
        &self,
        request: &MatchRequest,
        home_goals: u32,
        away_goals: u32,
    ) -> anyhow::Result<(PatternFingerprint, Option<PatternStatistics>)> {
        let db = self
            .db
            .as_ref()
            .context("recording a result needs a pattern database")?;
        let history = request.history.clone().normalized();
        let pattern = encode_history(&history, request.config.evidence.complexity);
        db.register_pattern(&pattern)?;
        db.store_outcome(&PatternOutcomeRecord::from_score(
            pattern.unique_pattern_id.as_str(),
            home_goals,
            away_goals,
            None,
            OutcomeOrigin::Observed,
        ))?;
        let stats = db.recalculate_statistics(&pattern.unique_pattern_id)?;
        info!(
            "Recorded {}-{} for {} under pattern {}",
            home_goals,
            away_goals,
            request.label(),
            pattern.unique_pattern_id
        );
        Ok((pattern, stats))
    }
}

fn evidence_path(source: EvidenceSource) -> PredictionPath {
    match source {
        EvidenceSource::Exact => PredictionPath::ExactEvidence,
        EvidenceSource::Similar => PredictionPath::SimilarEvidence,
        EvidenceSource::Fallback => PredictionPath::Simulation,
    }
}

fn toward(pair: &LambdaPair, home: f64, away: f64, weight: f64) -> LambdaPair {
    let mut out = *pair;
    out.home.blend_towards(home, weight);
    out.away.blend_towards(away, weight);
    out
}

/// Combine simulated lambdas with evidence according to the integration mode.
fn integrate(
    cfg: &SimulationConfig,
    simulated: &LambdaPair,
    evidence: &EvidencePrediction,
    sim_confidence: f64,
) -> (LambdaPair, PredictionPath, f64, Option<PathAudit>) {
    let xg = match evidence.expected_goals {
        Some(xg) if evidence.usable(cfg.evidence.min_pattern_confidence) => xg,
        _ => return (*simulated, PredictionPath::Simulation, 0.0, None),
    };
    let path = evidence_path(evidence.source);

    match cfg.evidence.mode {
        IntegrationMode::Replace => (toward(simulated, xg.home, xg.away, 1.0), path, 1.0, None),
        IntegrationMode::Hybrid => {
            let w = (evidence.confidence * cfg.evidence.max_adjustment_impact).clamp(0.0, 1.0);
            (toward(simulated, xg.home, xg.away, w), path, w, None)
        }
        IntegrationMode::Compare => {
            let replaced = toward(simulated, xg.home, xg.away, 1.0);
            if evidence.confidence > sim_confidence {
                let audit = PathAudit {
                    path: PredictionPath::Simulation,
                    confidence: sim_confidence,
                    home_lambda: simulated.home.pre_chaos(),
                    away_lambda: simulated.away.pre_chaos(),
                };
                (replaced, path, 1.0, Some(audit))
            } else {
                let audit = PathAudit {
                    path,
                    confidence: evidence.confidence,
                    home_lambda: replaced.home.pre_chaos(),
                    away_lambda: replaced.away.pre_chaos(),
                };
                (*simulated, PredictionPath::Simulation, 0.0, Some(audit))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::settings::EvidenceConfig;
    use crate::pattern::evidence::ExpectedGoals;
    use approx::assert_relative_eq;

    fn m(h: u8, a: u8) -> HistoricalMatch {
        HistoricalMatch::new(h, a)
    }

    fn pair() -> LambdaPair {
        let cfg = SimulationConfig::default();
        let none = ReversionAnalysisResult::default();
        LambdaPair {
            home: LambdaBreakdown::build(Side::Home, 1.4, &cfg.boosts, &StreakInfo::NONE, &none),
            away: LambdaBreakdown::build(Side::Away, 1.0, &cfg.boosts, &StreakInfo::NONE, &none),
        }
    }

    fn evidence(source: EvidenceSource, confidence: f64) -> EvidencePrediction {
        EvidencePrediction {
            source,
            probabilities: None,
            expected_goals: Some(ExpectedGoals { home: 2.2, away: 0.6 }),
            confidence,
            sample_size: 40,
            matched_patterns: vec![],
            reasoning: vec![],
            database_available: true,
            warning: None,
        }
    }

    fn config(mode: IntegrationMode) -> SimulationConfig {
        SimulationConfig {
            evidence: EvidenceConfig {
                mode,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn confidence_bonuses_and_cap() {
        let thin = MatchHistory::default();
        assert_relative_eq!(prediction_confidence(1_000, &thin, false), 0.55);
        assert_relative_eq!(prediction_confidence(10_000, &thin, false), 0.60);
        let rich = MatchHistory {
            h2h: vec![m(1, 0); 5],
            home: vec![m(1, 0); 5],
            away: vec![m(1, 0); 5],
        };
        assert_relative_eq!(prediction_confidence(100_000, &rich, false), 0.75, epsilon = 1e-12);
        assert_relative_eq!(prediction_confidence(100_000, &rich, true), 0.80, epsilon = 1e-12);
        assert!(prediction_confidence(u64::MAX, &rich, true) <= MAX_CONFIDENCE);
    }

    #[test]
    fn replace_mode_uses_evidence_rates() {
        let (lambdas, path, w, audit) = integrate(
            &config(IntegrationMode::Replace),
            &pair(),
            &evidence(EvidenceSource::Exact, 0.7),
            0.5,
        );
        assert_eq!(path, PredictionPath::ExactEvidence);
        assert_relative_eq!(w, 1.0);
        assert_relative_eq!(lambdas.home.pre_chaos(), 2.2, epsilon = 1e-12);
        assert_relative_eq!(lambdas.away.pre_chaos(), 0.6, epsilon = 1e-12);
        assert!(audit.is_none());
    }

    #[test]
    fn hybrid_mode_blends_by_confidence() {
        let sim = pair();
        let (lambdas, path, w, _) = integrate(
            &config(IntegrationMode::Hybrid),
            &sim,
            &evidence(EvidenceSource::Similar, 0.75),
            0.5,
        );
        assert_eq!(path, PredictionPath::SimilarEvidence);
        assert_relative_eq!(w, 0.6, epsilon = 1e-12);
        let expected = 0.4 * sim.home.pre_chaos() + 0.6 * 2.2;
        assert_relative_eq!(lambdas.home.pre_chaos(), expected, epsilon = 1e-12);
    }

    #[test]
    fn compare_mode_keeps_the_more_confident_path() {
        let sim = pair();
        let cfg = config(IntegrationMode::Compare);

        let strong = evidence(EvidenceSource::Exact, 0.9);
        let (lambdas, path, _, audit) = integrate(&cfg, &sim, &strong, 0.6);
        assert_eq!(path, PredictionPath::ExactEvidence);
        assert_relative_eq!(lambdas.home.pre_chaos(), 2.2, epsilon = 1e-12);
        let audit = audit.unwrap();
        assert_eq!(audit.path, PredictionPath::Simulation);
        assert_relative_eq!(audit.home_lambda, sim.home.pre_chaos());

        let weaker = evidence(EvidenceSource::Exact, 0.65);
        let (lambdas, path, _, audit) = integrate(&cfg, &sim, &weaker, 0.8);
        assert_eq!(path, PredictionPath::Simulation);
        assert_eq!(lambdas, sim);
        assert_eq!(audit.unwrap().path, PredictionPath::ExactEvidence);
    }

    #[test]
    fn weak_or_fallback_evidence_is_ignored() {
        let sim = pair();
        let cfg = config(IntegrationMode::Replace);
        let weak = evidence(EvidenceSource::Exact, 0.4);
        let (lambdas, path, _, _) = integrate(&cfg, &sim, &weak, 0.5);
        assert_eq!(path, PredictionPath::Simulation);
        assert_eq!(lambdas, sim);
        let (_, path, _, _) = integrate(&cfg, &sim, &evidence(EvidenceSource::Fallback, 0.9), 0.5);
        assert_eq!(path, PredictionPath::Simulation);
    }
}
