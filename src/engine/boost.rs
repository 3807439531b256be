//! Boost & adjustment pipeline.
//!
//! A side's scoring rate is assembled additively, in this order:
//! base → home advantage → custom boost → streak boost → mean reversion →
//! chaos. Everything except chaos is fixed for a run and captured in a
//! [`LambdaBreakdown`]; chaos is added per trial.

use serde::{Deserialize, Serialize};

use crate::engine::reversion::ReversionAnalysisResult;
use crate::engine::settings::BoostConfig;
use crate::models::{HistoricalMatch, MatchHistory, Side, TeamOutcome};

/// Rates used when no history at all is available.
const FALLBACK_HOME_LAMBDA: f64 = 1.50;
const FALLBACK_AWAY_LAMBDA: f64 = 1.30;
/// Share of the opponent's concession rate added to a side's attack.
const DEFENSIVE_IMPACT: f64 = 0.5;

// ── Streaks ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreakKind {
    Winning,
    Unbeaten,
    Losing,
    Winless,
    None,
}

/// A side's current form run, counted back from its latest match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreakInfo {
    pub kind: StreakKind,
    pub games: u32,
}

impl StreakInfo {
    pub const NONE: StreakInfo = StreakInfo {
        kind: StreakKind::None,
        games: 0,
    };
}

fn leading_run(matches: &[HistoricalMatch], side: Side, pred: impl Fn(TeamOutcome) -> bool) -> u32 {
    matches
        .iter()
        .take_while(|m| pred(m.outcome_for(side)))
        .count() as u32
}

/// Classify the current run of a team list (most recent first).
///
/// A run of wins only is `Winning`; once draws extend it, the longer
/// unbeaten run is reported instead (losses mirror this with `Losing` and
/// `Winless`). A run made only of draws has no direction and reports `None`.
pub fn detect_streak(matches: &[HistoricalMatch], side: Side) -> StreakInfo {
    let Some(first) = matches.first() else {
        return StreakInfo::NONE;
    };
    let wins = leading_run(matches, side, |o| o == TeamOutcome::Win);
    let losses = leading_run(matches, side, |o| o == TeamOutcome::Loss);
    let unbeaten = leading_run(matches, side, |o| o != TeamOutcome::Loss);
    let winless = leading_run(matches, side, |o| o != TeamOutcome::Win);

    match first.outcome_for(side) {
        TeamOutcome::Win if wins == unbeaten => StreakInfo {
            kind: StreakKind::Winning,
            games: wins,
        },
        TeamOutcome::Win => StreakInfo {
            kind: StreakKind::Unbeaten,
            games: unbeaten,
        },
        TeamOutcome::Loss if losses == winless => StreakInfo {
            kind: StreakKind::Losing,
            games: losses,
        },
        TeamOutcome::Loss => StreakInfo {
            kind: StreakKind::Winless,
            games: winless,
        },
        TeamOutcome::Draw if unbeaten > winless => StreakInfo {
            kind: StreakKind::Unbeaten,
            games: unbeaten,
        },
        TeamOutcome::Draw if winless > unbeaten => StreakInfo {
            kind: StreakKind::Winless,
            games: winless,
        },
        TeamOutcome::Draw => StreakInfo::NONE,
    }
}

/// Exponential streak boost. Zero below `streak_min_games`, then
/// `base * growth^(games - min)` with no upper cap. Winning and unbeaten
/// runs are pulled down, losing and winless runs pushed up.
pub fn streak_boost(streak: &StreakInfo, cfg: &BoostConfig) -> f64 {
    if !cfg.streak_enabled || streak.games < cfg.streak_min_games {
        return 0.0;
    }
    let extra_games = (streak.games - cfg.streak_min_games) as i32;
    let magnitude = cfg.base_streak_boost * cfg.streak_growth.powi(extra_games);
    match streak.kind {
        StreakKind::Winning | StreakKind::Unbeaten => -magnitude,
        StreakKind::Losing | StreakKind::Winless => magnitude,
        StreakKind::None => 0.0,
    }
}

// ── Base rates ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaseLambdas {
    pub home: f64,
    pub away: f64,
    /// False when no history was available and fallback rates were used.
    pub from_history: bool,
}

fn average(matches: &[HistoricalMatch], f: impl Fn(&HistoricalMatch) -> u32) -> f64 {
    if matches.is_empty() {
        return 0.0;
    }
    matches.iter().map(|m| f(m) as f64).sum::<f64>() / matches.len() as f64
}

/// Weighted attack-meets-defence base rates.
///
/// Each list gets a raw weight growing with its size (H2H up to 0.20 and
/// discounted by 10% at four or fewer matches, each team list up to 0.40);
/// the weights are normalised over the lists that have data. A side's rate
/// is its weighted scoring plus half the opponent's weighted concession.
pub fn base_lambdas(history: &MatchHistory) -> BaseLambdas {
    let (h2h, home, away) = (&history.h2h, &history.home, &history.away);

    let mut w_h2h = if h2h.is_empty() {
        0.0
    } else {
        (h2h.len() as f64 / 8.0 * 0.20).min(0.20)
    };
    if !h2h.is_empty() && h2h.len() <= 4 {
        w_h2h *= 0.9;
    }
    let w_home = (home.len() as f64 / 10.0 * 0.40).min(0.40);
    let w_away = (away.len() as f64 / 10.0 * 0.40).min(0.40);
    let total = w_h2h + w_home + w_away;
    if total <= 0.0 {
        return BaseLambdas {
            home: FALLBACK_HOME_LAMBDA,
            away: FALLBACK_AWAY_LAMBDA,
            from_history: false,
        };
    }
    let (w_h2h, w_home, w_away) = (w_h2h / total, w_home / total, w_away / total);

    let h2h_home_goals = average(h2h, |m| m.home_goals_ft as u32);
    let h2h_away_goals = average(h2h, |m| m.away_goals_ft as u32);

    let home_attack = w_h2h * h2h_home_goals + w_home * average(home, |m| m.goals_for(Side::Home));
    let home_conceded =
        w_h2h * h2h_away_goals + w_home * average(home, |m| m.goals_against(Side::Home));
    let away_attack = w_h2h * h2h_away_goals + w_away * average(away, |m| m.goals_for(Side::Away));
    let away_conceded =
        w_h2h * h2h_home_goals + w_away * average(away, |m| m.goals_against(Side::Away));

    BaseLambdas {
        home: home_attack + away_conceded * DEFENSIVE_IMPACT,
        away: away_attack + home_conceded * DEFENSIVE_IMPACT,
        from_history: true,
    }
}

// ── Breakdown ────────────────────────────────────────────────────────────────

/// Every additive term of a side's pre-chaos scoring rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LambdaBreakdown {
    pub side: Side,
    pub base: f64,
    pub home_advantage: f64,
    pub custom: f64,
    pub streak: f64,
    pub streak_info: StreakInfo,
    /// Reversion lambda delta plus the converted win-probability delta.
    pub reversion: f64,
    /// Shift applied by pattern evidence (zero on the simulation path).
    pub evidence: f64,
    pub min_lambda: f64,
}

impl LambdaBreakdown {
    pub fn build(
        side: Side,
        base: f64,
        boosts: &BoostConfig,
        streak: &StreakInfo,
        reversion: &ReversionAnalysisResult,
    ) -> Self {
        let (home_advantage, custom) = match side {
            Side::Home => (boosts.home_advantage, boosts.custom_home),
            Side::Away => (0.0, boosts.custom_away),
        };
        let reversion_delta = reversion.lambda_adjustment(side)
            + reversion.win_prob_adjustment(side) * boosts.win_prob_to_lambda;
        LambdaBreakdown {
            side,
            base,
            home_advantage,
            custom,
            streak: streak_boost(streak, boosts),
            streak_info: *streak,
            reversion: reversion_delta,
            evidence: 0.0,
            min_lambda: boosts.min_lambda,
        }
    }

    /// Sum of all fixed terms, before chaos and before the floor.
    pub fn pre_chaos(&self) -> f64 {
        self.base + self.home_advantage + self.custom + self.streak + self.reversion + self.evidence
    }

    /// Rate after the simulation-only terms, ignoring any evidence shift.
    pub fn simulated(&self) -> f64 {
        self.pre_chaos() - self.evidence
    }

    /// Final per-trial rate.
    ///
    /// The floor is applied after chaos, so when `pre_chaos` sits within the
    /// chaos spread of `min_lambda` the mean simulated rate is pulled above
    /// `pre_chaos`. Away from the floor the perturbation stays zero-mean.
    pub fn with_chaos(&self, chaos: f64) -> f64 {
        (self.pre_chaos() + chaos).max(self.min_lambda)
    }

    /// Move the rate towards `target` by `weight` (1.0 replaces it outright).
    pub fn blend_towards(&mut self, target: f64, weight: f64) {
        self.evidence = weight.clamp(0.0, 1.0) * (target - self.simulated());
    }
}
