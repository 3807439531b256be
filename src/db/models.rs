use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::MatchResult;

/// Where an outcome row came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeOrigin {
    /// Sampled from a Monte Carlo trial
    Simulated,
    /// A real final score entered after the fixture
    Observed,
}

impl OutcomeOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeOrigin::Simulated => "simulated",
            OutcomeOrigin::Observed => "observed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "simulated" => Some(OutcomeOrigin::Simulated),
            "observed" => Some(OutcomeOrigin::Observed),
            _ => None,
        }
    }
}

/// One append-only outcome under a pattern id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternOutcomeRecord {
    pub id: Option<i64>,
    pub pattern_id: String,
    pub home_goals: u32,
    pub away_goals: u32,
    pub result: MatchResult,
    pub btts: bool,
    pub over_05: bool,
    pub over_15: bool,
    pub over_25: bool,
    pub over_35: bool,
    pub over_45: bool,
    /// "h-a"
    pub exact_score: String,
    /// Trial index for simulated rows
    pub iteration: Option<u64>,
    pub origin: OutcomeOrigin,
    pub created_at: DateTime<Utc>,
}

impl PatternOutcomeRecord {
    /// Build a record with every derived flag filled from the score.
    pub fn from_score(
        pattern_id: impl Into<String>,
        home_goals: u32,
        away_goals: u32,
        iteration: Option<u64>,
        origin: OutcomeOrigin,
    ) -> Self {
        let total = home_goals + away_goals;
        PatternOutcomeRecord {
            id: None,
            pattern_id: pattern_id.into(),
            home_goals,
            away_goals,
            result: MatchResult::from_score(home_goals, away_goals),
            btts: home_goals > 0 && away_goals > 0,
            over_05: total > 0,
            over_15: total > 1,
            over_25: total > 2,
            over_35: total > 3,
            over_45: total > 4,
            exact_score: format!("{}-{}", home_goals, away_goals),
            iteration,
            origin,
            created_at: Utc::now(),
        }
    }
}

/// Aggregates over every outcome row of one pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternStatistics {
    pub pattern_id: String,
    /// Number of backing outcome rows when last computed
    pub occurrence_count: u64,
    pub avg_home_goals: f64,
    pub avg_away_goals: f64,
    pub avg_total_goals: f64,
    pub home_win_rate: f64,
    pub draw_rate: f64,
    pub away_win_rate: f64,
    pub btts_rate: f64,
    pub over_05_rate: f64,
    pub over_15_rate: f64,
    pub over_25_rate: f64,
    pub over_35_rate: f64,
    pub over_45_rate: f64,
    /// 0.5 rising with sample size, capped at 0.95
    pub confidence_score: f64,
    pub last_updated: DateTime<Utc>,
}

/// A fingerprint as stored in the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredPattern {
    pub pattern_id: String,
    /// "basic" | "enhanced" | "advanced"
    pub complexity: String,
    pub h2h_fingerprint: String,
    pub home_fingerprint: String,
    pub away_fingerprint: String,
    pub confidence: f64,
    pub seen_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// A registered pattern close to the one being looked up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarPattern {
    pub pattern_id: String,
    pub similarity: f64,
    pub statistics: PatternStatistics,
}
