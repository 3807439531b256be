//! Empirical predictions from stored pattern outcomes.
//!
//! Lookup order is exact id, then similar fingerprints, then fallback.
//! Storage failures never escape: they produce a fallback prediction with
//! `database_available = false` and a warning for the provenance record.

use serde::Serialize;
use tracing::{info, warn};

use crate::db::models::{PatternStatistics, SimilarPattern};
use crate::db::PatternStore;
use crate::engine::settings::EvidenceConfig;
use crate::error::EngineError;
use crate::pattern::encoder::PatternFingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceSource {
    Exact,
    Similar,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OutcomeProbabilities {
    pub home: f64,
    pub draw: f64,
    pub away: f64,
    pub btts: f64,
    pub over_25: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExpectedGoals {
    pub home: f64,
    pub away: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvidencePrediction {
    pub source: EvidenceSource,
    pub probabilities: Option<OutcomeProbabilities>,
    pub expected_goals: Option<ExpectedGoals>,
    pub confidence: f64,
    pub sample_size: u64,
    pub matched_patterns: Vec<String>,
    pub reasoning: Vec<String>,
    pub database_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl EvidencePrediction {
    fn fallback(reasoning: Vec<String>, database_available: bool) -> Self {
        EvidencePrediction {
            source: EvidenceSource::Fallback,
            probabilities: None,
            expected_goals: None,
            confidence: 0.0,
            sample_size: 0,
            matched_patterns: Vec::new(),
            reasoning,
            database_available,
            warning: None,
        }
    }

    fn unavailable(err: anyhow::Error) -> Self {
        let err = EngineError::from(err);
        warn!("Pattern evidence unavailable: {}", err);
        let reason = "pattern database unavailable, using simulation".to_string();
        let mut p = Self::fallback(vec![reason], false);
        p.warning = Some(err.to_string());
        p
    }

    /// Whether this prediction may influence the lambdas.
    pub fn usable(&self, min_confidence: f64) -> bool {
        self.source != EvidenceSource::Fallback
            && self.expected_goals.is_some()
            && self.confidence >= min_confidence
    }
}

fn probabilities(s: &PatternStatistics) -> OutcomeProbabilities {
    OutcomeProbabilities {
        home: s.home_win_rate,
        draw: s.draw_rate,
        away: s.away_win_rate,
        btts: s.btts_rate,
        over_25: s.over_25_rate,
    }
}

/// Weighted blend of similar patterns, weight = occurrences × similarity.
fn blend(similar: &[SimilarPattern]) -> (OutcomeProbabilities, ExpectedGoals, f64) {
    let mut probs = OutcomeProbabilities {
        home: 0.0,
        draw: 0.0,
        away: 0.0,
        btts: 0.0,
        over_25: 0.0,
    };
    let mut goals = ExpectedGoals { home: 0.0, away: 0.0 };
    let (mut total_weight, mut weighted_conf, mut sim_sum) = (0.0, 0.0, 0.0);

    for sp in similar {
        let s = &sp.statistics;
        let w = s.occurrence_count as f64 * sp.similarity;
        probs.home += w * s.home_win_rate;
        probs.draw += w * s.draw_rate;
        probs.away += w * s.away_win_rate;
        probs.btts += w * s.btts_rate;
        probs.over_25 += w * s.over_25_rate;
        goals.home += w * s.avg_home_goals;
        goals.away += w * s.avg_away_goals;
        weighted_conf += w * s.confidence_score;
        total_weight += w;
        sim_sum += sp.similarity;
    }
    if total_weight <= 0.0 {
        return (probs, goals, 0.0);
    }

    for v in [
        &mut probs.home,
        &mut probs.draw,
        &mut probs.away,
        &mut probs.btts,
        &mut probs.over_25,
        &mut goals.home,
        &mut goals.away,
    ] {
        *v /= total_weight;
    }
    let mean_similarity = sim_sum / similar.len() as f64;
    (probs, goals, weighted_conf / total_weight * mean_similarity)
}

pub struct EvidencePredictor<'a> {
    store: Option<&'a dyn PatternStore>,
    config: &'a EvidenceConfig,
}

impl<'a> EvidencePredictor<'a> {
    pub fn new(store: Option<&'a dyn PatternStore>, config: &'a EvidenceConfig) -> Self {
        EvidencePredictor { store, config }
    }

    pub fn predict(&self, fp: &PatternFingerprint) -> EvidencePrediction {
        let cfg = self.config;
        if !cfg.enabled {
            let reason = "pattern evidence disabled".to_string();
            return EvidencePrediction::fallback(vec![reason], self.store.is_some());
        }
        let store = match self.store {
            Some(s) => s,
            None => {
                let reason = "no pattern database configured".to_string();
                let mut p = EvidencePrediction::fallback(vec![reason], false);
                let err = EngineError::DatabaseUnavailable("not configured".into());
                p.warning = Some(err.to_string());
                return p;
            }
        };
        if !fp.valid_for_matching {
            return EvidencePrediction::fallback(
                vec![format!("fingerprint not valid for matching: {}", fp.issues.join("; "))],
                true,
            );
        }

        let id = fp.unique_pattern_id.as_str();
        let mut reasoning = Vec::new();

        let exact = match store.find_exact_match(id) {
            Ok(e) => e,
            Err(e) => return EvidencePrediction::unavailable(e),
        };
        if let Some(stats) = exact {
            if stats.occurrence_count >= cfg.min_sample_size
                && stats.confidence_score >= cfg.accept_threshold
            {
                info!(
                    "Exact pattern evidence for {}: {} occurrences",
                    &id[..12.min(id.len())],
                    stats.occurrence_count
                );
                return EvidencePrediction {
                    source: EvidenceSource::Exact,
                    probabilities: Some(probabilities(&stats)),
                    expected_goals: Some(ExpectedGoals {
                        home: stats.avg_home_goals,
                        away: stats.avg_away_goals,
                    }),
                    confidence: stats.confidence_score,
                    sample_size: stats.occurrence_count,
                    matched_patterns: vec![stats.pattern_id.clone()],
                    reasoning: vec![format!(
                        "exact pattern with {} recorded outcomes",
                        stats.occurrence_count
                    )],
                    database_available: true,
                    warning: None,
                };
            }
            reasoning.push(format!(
                "exact pattern has {} outcomes at confidence {:.2}, below acceptance",
                stats.occurrence_count, stats.confidence_score
            ));
        } else {
            reasoning.push("no exact pattern match".to_string());
        }

        let threshold = cfg.similarity_threshold;
        let similar = match store.find_similar_matches(id, threshold, cfg.max_similar) {
            Ok(s) => s,
            Err(e) => return EvidencePrediction::unavailable(e),
        };
        let similar: Vec<SimilarPattern> = similar
            .into_iter()
            .filter(|s| s.statistics.occurrence_count >= cfg.min_similar_occurrences)
            .collect();
        let combined: u64 = similar.iter().map(|s| s.statistics.occurrence_count).sum();

        if !similar.is_empty() && combined >= cfg.min_sample_size {
            let (probs, goals, confidence) = blend(&similar);
            info!(
                "Similar pattern evidence: {} patterns, {} outcomes",
                similar.len(),
                combined
            );
            reasoning.push(format!(
                "{} similar patterns with {} combined outcomes",
                similar.len(),
                combined
            ));
            return EvidencePrediction {
                source: EvidenceSource::Similar,
                probabilities: Some(probs),
                expected_goals: Some(goals),
                confidence,
                sample_size: combined,
                matched_patterns: similar.iter().map(|s| s.pattern_id.clone()).collect(),
                reasoning,
                database_available: true,
                warning: None,
            };
        }

        reasoning.push(format!(
            "{} similar patterns with {} combined outcomes, need {}",
            similar.len(),
            combined,
            cfg.min_sample_size
        ));
        EvidencePrediction::fallback(reasoning, true)
    }
}
