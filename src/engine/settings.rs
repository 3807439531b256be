//! Typed simulation configuration.
//!
//! Every tunable lives here with exactly one default. Request files may omit
//! any field; `#[serde(default)]` fills it from the tables below.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::engine::chaos::ChaosPreset;
use crate::error::{EngineError, EngineResult};
use crate::pattern::encoder::ComplexityLevel;

// ── Distribution ─────────────────────────────────────────────────────────────

/// Goal-count law used by the sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DistributionKind {
    #[default]
    Poisson,
    NegativeBinomial,
}

impl DistributionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DistributionKind::Poisson => "poisson",
            DistributionKind::NegativeBinomial => "negative_binomial",
        }
    }
}

impl FromStr for DistributionKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "poisson" => Ok(DistributionKind::Poisson),
            "negative_binomial" | "negbin" | "nb" => Ok(DistributionKind::NegativeBinomial),
            other => Err(EngineError::invalid(format!(
                "unknown distribution kind '{}' (expected poisson or negative_binomial)",
                other
            ))),
        }
    }
}

impl TryFrom<String> for DistributionKind {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DistributionKind> for String {
    fn from(kind: DistributionKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for DistributionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Integration mode ─────────────────────────────────────────────────────────

/// How pattern evidence is combined with the simulated adjustment path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationMode {
    /// Evidence expected goals override streak and reversion terms.
    Replace,
    /// Weighted blend, weight proportional to evidence confidence.
    #[default]
    Hybrid,
    /// Compute both, keep the more confident one, audit the other.
    Compare,
}

impl FromStr for IntegrationMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(IntegrationMode::Replace),
            "hybrid" => Ok(IntegrationMode::Hybrid),
            "compare" => Ok(IntegrationMode::Compare),
            other => Err(EngineError::invalid(format!(
                "unknown integration mode '{}'",
                other
            ))),
        }
    }
}

// ── Boosts ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostConfig {
    /// Added to the home lambda before anything else.
    pub home_advantage: f64,
    pub custom_home: f64,
    pub custom_away: f64,
    pub streak_enabled: bool,
    /// Magnitude of the streak boost at exactly `streak_min_games`.
    pub base_streak_boost: f64,
    pub streak_min_games: u32,
    /// Per-extra-game growth factor of the streak boost.
    pub streak_growth: f64,
    /// Converts a win-probability delta into goal-rate units.
    pub win_prob_to_lambda: f64,
    /// Floor applied to the final per-trial lambda.
    pub min_lambda: f64,
}

impl Default for BoostConfig {
    fn default() -> Self {
        BoostConfig {
            home_advantage: 0.30,
            custom_home: 0.0,
            custom_away: 0.0,
            streak_enabled: true,
            base_streak_boost: 0.12,
            streak_min_games: 5,
            streak_growth: 1.2,
            win_prob_to_lambda: 2.0,
            min_lambda: 0.3,
        }
    }
}

// ── Chaos ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChaosConfig {
    pub enabled: bool,
    pub levy_intensity: f64,
    /// Tail index of the heavy-tailed component, in (0, 2].
    pub levy_alpha: f64,
    pub fractal_intensity: f64,
    /// Per-match probability of a red card (split between the two sides).
    pub red_card_rate: f64,
    pub penalty_rate: f64,
    pub momentum_rate: f64,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        ChaosPreset::Moderate.config()
    }
}

// ── Reversion ────────────────────────────────────────────────────────────────

/// Minimum current-streak length per category. Defaults are the ~85th
/// percentile run lengths from `engine::calibration` under neutral rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReversionThresholds {
    pub over: u32,
    pub under: u32,
    pub h2h_win: u32,
    pub h2h_over: u32,
    pub h2h_under: u32,
    pub clean_sheet: u32,
    pub goalless: u32,
    pub win: u32,
}

impl Default for ReversionThresholds {
    fn default() -> Self {
        ReversionThresholds {
            over: 4,
            under: 4,
            h2h_win: 3,
            h2h_over: 4,
            h2h_under: 4,
            clean_sheet: 3,
            goalless: 3,
            win: 3,
        }
    }
}

/// Base adjustment magnitudes at exactly the threshold length.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReversionPenalties {
    pub over: f64,
    pub under: f64,
    pub h2h_win: f64,
    pub h2h_total: f64,
    pub clean_sheet_fatigue: f64,
    pub goalless_drought: f64,
    pub emotional_momentum: f64,
}

impl Default for ReversionPenalties {
    fn default() -> Self {
        ReversionPenalties {
            over: 0.15,
            under: 0.15,
            h2h_win: 0.05,
            h2h_total: 0.10,
            clean_sheet_fatigue: 0.12,
            goalless_drought: 0.10,
            emotional_momentum: 0.04,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReversionConfig {
    pub enabled: bool,
    pub thresholds: ReversionThresholds,
    pub penalties: ReversionPenalties,
    /// Matches required in a team list before its categories are examined.
    pub min_games: usize,
    pub min_h2h_games: usize,
    pub confidence_threshold: f64,
    pub high_confidence: f64,
    /// Growth of the adjustment per game beyond the threshold.
    pub escalation: f64,
    pub max_total_adjustment: f64,
    pub max_win_prob_adjustment: f64,
}

impl Default for ReversionConfig {
    fn default() -> Self {
        ReversionConfig {
            enabled: true,
            thresholds: ReversionThresholds::default(),
            penalties: ReversionPenalties::default(),
            min_games: 5,
            min_h2h_games: 3,
            confidence_threshold: 0.60,
            high_confidence: 0.75,
            escalation: 0.25,
            max_total_adjustment: 0.5,
            max_win_prob_adjustment: 0.15,
        }
    }
}

// ── Markets ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// Expected share of goals scored before half-time.
    pub first_half_share: f64,
    /// Largest per-side score tracked individually by the correct-score grid.
    pub exact_score_max: u8,
    /// Probabilities below this report degenerate odds.
    pub degenerate_below: f64,
    /// Minimum edge for a selection to be listed as a value bet.
    pub min_edge: f64,
    /// Fractional Kelly multiplier for suggested value-bet stakes.
    pub kelly_fraction: f64,
}

impl Default for MarketConfig {
    fn default() -> Self {
        MarketConfig {
            first_half_share: 0.45,
            exact_score_max: 5,
            degenerate_below: 1e-4,
            min_edge: 0.02,
            kelly_fraction: 0.25,
        }
    }
}

// ── Evidence ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceConfig {
    pub enabled: bool,
    pub mode: IntegrationMode,
    pub complexity: ComplexityLevel,
    pub min_sample_size: u64,
    pub accept_threshold: f64,
    pub similarity_threshold: f64,
    pub max_similar: usize,
    pub min_similar_occurrences: u64,
    /// Evidence below this confidence never influences the lambdas.
    pub min_pattern_confidence: f64,
    pub max_adjustment_impact: f64,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        EvidenceConfig {
            enabled: true,
            mode: IntegrationMode::Hybrid,
            complexity: ComplexityLevel::Enhanced,
            min_sample_size: 10,
            accept_threshold: 0.5,
            similarity_threshold: 0.7,
            max_similar: 5,
            min_similar_occurrences: 5,
            min_pattern_confidence: 0.6,
            max_adjustment_impact: 0.8,
        }
    }
}

// ── Simulation ───────────────────────────────────────────────────────────────

/// Per-request simulation settings. Never mutated once a run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub iterations: u64,
    pub distribution: DistributionKind,
    /// Overrides the lambda derived from history when set.
    pub base_home_lambda: Option<f64>,
    pub base_away_lambda: Option<f64>,
    pub boosts: BoostConfig,
    pub chaos: ChaosConfig,
    pub reversion: ReversionConfig,
    pub markets: MarketConfig,
    pub evidence: EvidenceConfig,
    pub batch_size: u64,
    pub chunk_size: u64,
    /// Persist every Nth trial as a pattern outcome; 0 disables recording.
    pub record_every: u64,
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            iterations: 100_000,
            distribution: DistributionKind::Poisson,
            base_home_lambda: None,
            base_away_lambda: None,
            boosts: BoostConfig::default(),
            chaos: ChaosConfig::default(),
            reversion: ReversionConfig::default(),
            markets: MarketConfig::default(),
            evidence: EvidenceConfig::default(),
            batch_size: 50_000,
            chunk_size: 5_000,
            record_every: 100,
            seed: None,
        }
    }
}

fn finite(name: &str, v: f64) -> EngineResult<()> {
    if !v.is_finite() {
        return Err(EngineError::invalid(format!("{} must be finite", name)));
    }
    Ok(())
}

fn unit(name: &str, v: f64) -> EngineResult<()> {
    if !(0.0..=1.0).contains(&v) {
        return Err(EngineError::invalid(format!(
            "{} must be between 0.0 and 1.0",
            name
        )));
    }
    Ok(())
}

fn non_negative(name: &str, v: f64) -> EngineResult<()> {
    finite(name, v)?;
    if v < 0.0 {
        return Err(EngineError::invalid(format!("{} must not be negative", name)));
    }
    Ok(())
}

impl SimulationConfig {
    /// Reject anything that would make a run meaningless. Called before any
    /// iteration budget is spent.
    pub fn validate(&self) -> EngineResult<()> {
        if self.iterations == 0 {
            return Err(EngineError::invalid("iterations must be positive"));
        }
        if self.batch_size == 0 {
            return Err(EngineError::invalid("batch_size must be positive"));
        }
        if self.chunk_size == 0 {
            return Err(EngineError::invalid("chunk_size must be positive"));
        }
        if let Some(l) = self.base_home_lambda {
            non_negative("base_home_lambda", l)?;
        }
        if let Some(l) = self.base_away_lambda {
            non_negative("base_away_lambda", l)?;
        }

        let b = &self.boosts;
        finite("boosts.home_advantage", b.home_advantage)?;
        finite("boosts.custom_home", b.custom_home)?;
        finite("boosts.custom_away", b.custom_away)?;
        non_negative("boosts.base_streak_boost", b.base_streak_boost)?;
        non_negative("boosts.streak_growth", b.streak_growth)?;
        non_negative("boosts.win_prob_to_lambda", b.win_prob_to_lambda)?;
        non_negative("boosts.min_lambda", b.min_lambda)?;

        let c = &self.chaos;
        non_negative("chaos.levy_intensity", c.levy_intensity)?;
        non_negative("chaos.fractal_intensity", c.fractal_intensity)?;
        if !(c.levy_alpha > 0.0 && c.levy_alpha <= 2.0) {
            return Err(EngineError::invalid("chaos.levy_alpha must be in (0, 2]"));
        }
        unit("chaos.red_card_rate", c.red_card_rate)?;
        unit("chaos.penalty_rate", c.penalty_rate)?;
        unit("chaos.momentum_rate", c.momentum_rate)?;

        let r = &self.reversion;
        let t = &r.thresholds;
        for (name, v) in [
            ("over", t.over),
            ("under", t.under),
            ("h2h_win", t.h2h_win),
            ("h2h_over", t.h2h_over),
            ("h2h_under", t.h2h_under),
            ("clean_sheet", t.clean_sheet),
            ("goalless", t.goalless),
            ("win", t.win),
        ] {
            if v == 0 {
                return Err(EngineError::invalid(format!(
                    "reversion.thresholds.{} must be at least 1",
                    name
                )));
            }
        }
        let p = &r.penalties;
        for (name, v) in [
            ("over", p.over),
            ("under", p.under),
            ("h2h_win", p.h2h_win),
            ("h2h_total", p.h2h_total),
            ("clean_sheet_fatigue", p.clean_sheet_fatigue),
            ("goalless_drought", p.goalless_drought),
            ("emotional_momentum", p.emotional_momentum),
        ] {
            non_negative(&format!("reversion.penalties.{}", name), v)?;
        }
        unit("reversion.confidence_threshold", r.confidence_threshold)?;
        unit("reversion.high_confidence", r.high_confidence)?;
        non_negative("reversion.escalation", r.escalation)?;
        non_negative("reversion.max_total_adjustment", r.max_total_adjustment)?;
        non_negative("reversion.max_win_prob_adjustment", r.max_win_prob_adjustment)?;

        let m = &self.markets;
        unit("markets.first_half_share", m.first_half_share)?;
        unit("markets.degenerate_below", m.degenerate_below)?;
        finite("markets.min_edge", m.min_edge)?;
        unit("markets.kelly_fraction", m.kelly_fraction)?;

        let e = &self.evidence;
        unit("evidence.accept_threshold", e.accept_threshold)?;
        unit("evidence.similarity_threshold", e.similarity_threshold)?;
        unit("evidence.min_pattern_confidence", e.min_pattern_confidence)?;
        unit("evidence.max_adjustment_impact", e.max_adjustment_impact)?;
        Ok(())
    }

    /// Parse a config document on its own (used by the CLI overrides path).
    pub fn from_json(text: &str) -> EngineResult<Self> {
        let cfg: SimulationConfig = serde_json::from_str(text)
            .map_err(|e| EngineError::invalid(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        SimulationConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_iterations_is_invalid() {
        let cfg = SimulationConfig {
            iterations: 0,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(EngineError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn unknown_distribution_is_invalid_configuration() {
        let err = SimulationConfig::from_json(r#"{"distribution": "binomial"}"#).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("binomial"));

        let err = "zipf".parse::<DistributionKind>().unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfiguration(_)));
    }

    #[test]
    fn distribution_round_trips_as_snake_case() {
        let cfg = SimulationConfig::from_json(r#"{"distribution": "negative_binomial"}"#).unwrap();
        assert_eq!(cfg.distribution, DistributionKind::NegativeBinomial);
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains(r#""distribution":"negative_binomial""#));
    }

    #[test]
    fn partial_documents_fill_nested_defaults() {
        let cfg = SimulationConfig::from_json(
            r#"{"iterations": 2000, "reversion": {"thresholds": {"over": 5}}}"#,
        )
        .unwrap();
        assert_eq!(cfg.iterations, 2000);
        assert_eq!(cfg.reversion.thresholds.over, 5);
        assert_eq!(cfg.reversion.thresholds.clean_sheet, 3);
        assert_eq!(cfg.batch_size, 50_000);
    }

    #[test]
    fn shock_rates_must_be_probabilities() {
        let mut cfg = SimulationConfig::default();
        cfg.chaos.penalty_rate = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn integration_mode_parses() {
        assert_eq!("Compare".parse::<IntegrationMode>().unwrap(), IntegrationMode::Compare);
        assert!("blend".parse::<IntegrationMode>().is_err());
    }
}
