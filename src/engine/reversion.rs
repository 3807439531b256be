//! Mean-reversion streak analysis.
//!
//! Each category measures the length of the *current* run of some event,
//! walking a match list from the most recent fixture backwards. A category
//! fires only when the run reaches its calibrated threshold, the list is
//! long enough, and the confidence clears the configured bar. Fired
//! categories pull the affected side back towards the mean.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::settings::ReversionConfig;
use crate::error::EngineError;
use crate::models::{HistoricalMatch, MatchResult, Side};

/// Goal line used by all over/under categories.
pub const GOAL_LINE: f64 = 2.5;
/// Ceiling of the confidence curve.
const CONFIDENCE_CAP: f64 = 0.95;
const STREAK_WEIGHT: f64 = 0.25;
const SAMPLE_WEIGHT: f64 = 0.08;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternCategory {
    HomeOver,
    HomeUnder,
    AwayOver,
    AwayUnder,
    H2hWin,
    H2hOver,
    H2hUnder,
    CleanSheetFatigue,
    GoallessDrought,
    EmotionalMomentum,
}

impl PatternCategory {
    pub const ALL: [PatternCategory; 10] = [
        PatternCategory::HomeOver,
        PatternCategory::HomeUnder,
        PatternCategory::AwayOver,
        PatternCategory::AwayUnder,
        PatternCategory::H2hWin,
        PatternCategory::H2hOver,
        PatternCategory::H2hUnder,
        PatternCategory::CleanSheetFatigue,
        PatternCategory::GoallessDrought,
        PatternCategory::EmotionalMomentum,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PatternCategory::HomeOver => "home_over",
            PatternCategory::HomeUnder => "home_under",
            PatternCategory::AwayOver => "away_over",
            PatternCategory::AwayUnder => "away_under",
            PatternCategory::H2hWin => "h2h_win",
            PatternCategory::H2hOver => "h2h_over",
            PatternCategory::H2hUnder => "h2h_under",
            PatternCategory::CleanSheetFatigue => "clean_sheet_fatigue",
            PatternCategory::GoallessDrought => "goalless_drought",
            PatternCategory::EmotionalMomentum => "emotional_momentum",
        }
    }
}

/// Which side(s) receive a pattern's adjustment. `Both` splits a lambda
/// delta evenly across the two sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Home,
    Away,
    Both,
}

impl From<Side> for Target {
    fn from(side: Side) -> Self {
        match side {
            Side::Home => Target::Home,
            Side::Away => Target::Away,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lambda_delta: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub win_prob_delta: Option<f64>,
}

/// A fired streak category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreakPattern {
    pub category: PatternCategory,
    /// Team whose run triggered the pattern (absent for shared H2H totals).
    pub team: Option<Side>,
    pub applies_to: Target,
    pub length: u32,
    pub threshold: u32,
    pub confidence: f64,
    pub sample_size: usize,
    pub adjustment: Adjustment,
}

/// A category that could not be examined for lack of history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedCategory {
    pub category: PatternCategory,
    pub team: Option<Side>,
    pub available: usize,
    pub required: usize,
}

impl SkippedCategory {
    pub fn to_error(&self) -> EngineError {
        let dataset = match self.team {
            Some(side) => format!("{} ({})", self.category.as_str(), side.as_str()),
            None => self.category.as_str().to_string(),
        };
        EngineError::insufficient(dataset, self.available, self.required)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReversionAnalysisResult {
    pub total_home_lambda_adjustment: f64,
    pub total_away_lambda_adjustment: f64,
    pub total_home_win_prob_adjustment: f64,
    pub total_away_win_prob_adjustment: f64,
    pub patterns_detected: usize,
    pub high_confidence_patterns: usize,
    pub patterns: Vec<StreakPattern>,
    pub skipped: Vec<SkippedCategory>,
    /// True when the raw lambda sum exceeded the cap and was clipped.
    pub clipped: bool,
}

impl ReversionAnalysisResult {
    pub fn lambda_adjustment(&self, side: Side) -> f64 {
        match side {
            Side::Home => self.total_home_lambda_adjustment,
            Side::Away => self.total_away_lambda_adjustment,
        }
    }

    pub fn win_prob_adjustment(&self, side: Side) -> f64 {
        match side {
            Side::Home => self.total_home_win_prob_adjustment,
            Side::Away => self.total_away_win_prob_adjustment,
        }
    }

    /// Mean confidence of the fired patterns (0 when none fired).
    pub fn mean_confidence(&self) -> f64 {
        if self.patterns.is_empty() {
            return 0.0;
        }
        self.patterns.iter().map(|p| p.confidence).sum::<f64>() / self.patterns.len() as f64
    }
}

/// Confidence that a run of `streak` games in a list of `sample` games is a
/// genuine pattern. Increasing in both arguments, saturating at 0.95.
pub fn streak_confidence(streak: u32, sample: usize) -> f64 {
    let x = STREAK_WEIGHT * streak as f64 + SAMPLE_WEIGHT * sample as f64;
    CONFIDENCE_CAP * (1.0 - (-x).exp())
}

/// Length of the leading run of matches satisfying `pred`.
pub fn current_streak(matches: &[HistoricalMatch], pred: impl Fn(&HistoricalMatch) -> bool) -> u32 {
    matches.iter().take_while(|m| pred(m)).count() as u32
}

/// Length and winner of the current run of H2H wins by the same side.
pub fn h2h_win_streak(h2h: &[HistoricalMatch]) -> (u32, Option<Side>) {
    let winner = match h2h.first().map(HistoricalMatch::result) {
        Some(MatchResult::Home) => Side::Home,
        Some(MatchResult::Away) => Side::Away,
        _ => return (0, None),
    };
    let expected = match winner {
        Side::Home => MatchResult::Home,
        Side::Away => MatchResult::Away,
    };
    (current_streak(h2h, |m| m.result() == expected), Some(winner))
}

struct Candidate {
    category: PatternCategory,
    team: Option<Side>,
    applies_to: Target,
    streak: u32,
    threshold: u32,
    sample: usize,
    required: usize,
    base_lambda: Option<f64>,
    base_win_prob: Option<f64>,
}

fn team_candidates(side: Side, list: &[HistoricalMatch], cfg: &ReversionConfig) -> Vec<Candidate> {
    let t = &cfg.thresholds;
    let p = &cfg.penalties;
    let (over_cat, under_cat) = match side {
        Side::Home => (PatternCategory::HomeOver, PatternCategory::HomeUnder),
        Side::Away => (PatternCategory::AwayOver, PatternCategory::AwayUnder),
    };
    let base = |category, applies_to, streak, threshold, lambda, win_prob| Candidate {
        category,
        team: Some(side),
        applies_to,
        streak,
        threshold,
        sample: list.len(),
        required: cfg.min_games,
        base_lambda: lambda,
        base_win_prob: win_prob,
    };
    vec![
        base(
            over_cat,
            side.into(),
            current_streak(list, |m| m.is_over(GOAL_LINE)),
            t.over,
            Some(-p.over),
            None,
        ),
        base(
            under_cat,
            side.into(),
            current_streak(list, |m| !m.is_over(GOAL_LINE)),
            t.under,
            Some(p.under),
            None,
        ),
        // a run of clean sheets makes the opponent more likely to break through
        base(
            PatternCategory::CleanSheetFatigue,
            side.opponent().into(),
            current_streak(list, |m| m.goals_against(side) == 0),
            t.clean_sheet,
            Some(p.clean_sheet_fatigue),
            None,
        ),
        base(
            PatternCategory::GoallessDrought,
            side.into(),
            current_streak(list, |m| m.goals_for(side) == 0),
            t.goalless,
            Some(p.goalless_drought),
            None,
        ),
        base(
            PatternCategory::EmotionalMomentum,
            side.into(),
            current_streak(list, |m| m.goals_for(side) > m.goals_against(side)),
            t.win,
            None,
            Some(-p.emotional_momentum),
        ),
    ]
}

fn h2h_candidates(h2h: &[HistoricalMatch], cfg: &ReversionConfig) -> Vec<Candidate> {
    let t = &cfg.thresholds;
    let p = &cfg.penalties;
    let (win_streak, winner) = h2h_win_streak(h2h);
    let shared = |category, streak, threshold, lambda| Candidate {
        category,
        team: None,
        applies_to: Target::Both,
        streak,
        threshold,
        sample: h2h.len(),
        required: cfg.min_h2h_games,
        base_lambda: Some(lambda),
        base_win_prob: None,
    };
    vec![
        Candidate {
            category: PatternCategory::H2hWin,
            team: winner,
            applies_to: winner.map(Target::from).unwrap_or(Target::Both),
            streak: win_streak,
            threshold: t.h2h_win,
            sample: h2h.len(),
            required: cfg.min_h2h_games,
            base_lambda: None,
            base_win_prob: Some(-p.h2h_win),
        },
        shared(
            PatternCategory::H2hOver,
            current_streak(h2h, |m| m.is_over(GOAL_LINE)),
            t.h2h_over,
            -p.h2h_total,
        ),
        shared(
            PatternCategory::H2hUnder,
            current_streak(h2h, |m| !m.is_over(GOAL_LINE)),
            t.h2h_under,
            p.h2h_total,
        ),
    ]
}

fn clip(v: f64, cap: f64) -> f64 {
    v.clamp(-cap, cap)
}

/// Run every category over the three history lists.
pub fn analyze_all_patterns(
    home: &[HistoricalMatch],
    away: &[HistoricalMatch],
    h2h: &[HistoricalMatch],
    cfg: &ReversionConfig,
) -> ReversionAnalysisResult {
    let mut result = ReversionAnalysisResult::default();
    if !cfg.enabled {
        return result;
    }

    let mut candidates = team_candidates(Side::Home, home, cfg);
    candidates.extend(team_candidates(Side::Away, away, cfg));
    candidates.extend(h2h_candidates(h2h, cfg));

    let (mut home_lambda, mut away_lambda) = (0.0, 0.0);
    let (mut home_wp, mut away_wp) = (0.0, 0.0);

    for c in candidates {
        if c.sample < c.required {
            result.skipped.push(SkippedCategory {
                category: c.category,
                team: c.team,
                available: c.sample,
                required: c.required,
            });
            continue;
        }
        if c.streak < c.threshold {
            continue;
        }
        let confidence = streak_confidence(c.streak, c.sample);
        if confidence < cfg.confidence_threshold {
            continue;
        }

        let scale = 1.0 + cfg.escalation * (c.streak - c.threshold) as f64;
        let adjustment = Adjustment {
            lambda_delta: c.base_lambda.map(|d| d * scale),
            win_prob_delta: c.base_win_prob.map(|d| d * scale),
        };

        let lambda = adjustment.lambda_delta.unwrap_or(0.0);
        let win_prob = adjustment.win_prob_delta.unwrap_or(0.0);
        match c.applies_to {
            Target::Home => {
                home_lambda += lambda;
                home_wp += win_prob;
            }
            Target::Away => {
                away_lambda += lambda;
                away_wp += win_prob;
            }
            Target::Both => {
                home_lambda += lambda / 2.0;
                away_lambda += lambda / 2.0;
                home_wp += win_prob / 2.0;
                away_wp += win_prob / 2.0;
            }
        }

        debug!(
            "Reversion pattern {} fired (length={}, threshold={}, confidence={:.2})",
            c.category.as_str(),
            c.streak,
            c.threshold,
            confidence
        );
        result.patterns_detected += 1;
        if confidence >= cfg.high_confidence {
            result.high_confidence_patterns += 1;
        }
        result.patterns.push(StreakPattern {
            category: c.category,
            team: c.team,
            applies_to: c.applies_to,
            length: c.streak,
            threshold: c.threshold,
            confidence,
            sample_size: c.sample,
            adjustment,
        });
    }

    let cap = cfg.max_total_adjustment;
    result.clipped = home_lambda.abs() > cap || away_lambda.abs() > cap;
    result.total_home_lambda_adjustment = clip(home_lambda, cap);
    result.total_away_lambda_adjustment = clip(away_lambda, cap);
    result.total_home_win_prob_adjustment = clip(home_wp, cfg.max_win_prob_adjustment);
    result.total_away_win_prob_adjustment = clip(away_wp, cfg.max_win_prob_adjustment);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn m(h: u8, a: u8) -> HistoricalMatch {
        HistoricalMatch::new(h, a)
    }

    fn find(r: &ReversionAnalysisResult, c: PatternCategory) -> Option<&StreakPattern> {
        r.patterns.iter().find(|p| p.category == c)
    }

    #[test]
    fn six_recent_overs_fire_home_over() {
        // most recent first: six high-scoring games, then two quiet ones
        let home = vec![m(3, 1), m(2, 2), m(4, 0), m(1, 2), m(3, 3), m(2, 1), m(1, 0), m(0, 0)];
        let r = analyze_all_patterns(&home, &[], &[], &ReversionConfig::default());
        let p = find(&r, PatternCategory::HomeOver).expect("home_over should fire");
        assert_eq!(p.length, 6);
        assert!(p.length >= p.threshold);
        assert!(p.confidence >= 0.70, "confidence {}", p.confidence);
        assert!(p.adjustment.lambda_delta.unwrap() < 0.0);
        assert!(r.total_home_lambda_adjustment < 0.0);
    }

    #[test]
    fn two_recent_overs_do_not_fire() {
        let home = vec![m(3, 1), m(2, 2), m(1, 0), m(0, 0), m(1, 1), m(2, 0), m(0, 1), m(1, 0)];
        let r = analyze_all_patterns(&home, &[], &[], &ReversionConfig::default());
        assert!(find(&r, PatternCategory::HomeOver).is_none());
    }

    #[test]
    fn adjustment_escalates_beyond_threshold() {
        let home = vec![m(3, 1); 6];
        let r = analyze_all_patterns(&home, &[], &[], &ReversionConfig::default());
        let p = find(&r, PatternCategory::HomeOver).unwrap();
        // threshold 4, two extra games: 0.15 * 1.5
        assert_relative_eq!(p.adjustment.lambda_delta.unwrap(), -0.225, epsilon = 1e-12);
    }

    #[test]
    fn confidence_is_monotone_and_capped() {
        assert!(streak_confidence(5, 8) > streak_confidence(4, 8));
        assert!(streak_confidence(4, 10) > streak_confidence(4, 8));
        assert!(streak_confidence(100, 100) <= 0.95);
        assert_relative_eq!(streak_confidence(100, 100), 0.95, epsilon = 1e-9);
    }

    #[test]
    fn short_lists_are_skipped_not_fatal() {
        let home = vec![m(3, 1); 3];
        let r = analyze_all_patterns(&home, &[], &[], &ReversionConfig::default());
        assert_eq!(r.patterns_detected, 0);
        let skipped = r
            .skipped
            .iter()
            .find(|s| s.category == PatternCategory::HomeOver)
            .unwrap();
        assert_eq!(skipped.available, 3);
        assert_eq!(skipped.required, 5);
        assert!(!skipped.to_error().is_fatal());
    }

    #[test]
    fn clean_sheet_fatigue_boosts_the_opponent() {
        let home = vec![m(1, 0), m(2, 0), m(0, 0), m(1, 0), m(2, 1), m(1, 1)];
        let r = analyze_all_patterns(&home, &[], &[], &ReversionConfig::default());
        let p = find(&r, PatternCategory::CleanSheetFatigue).unwrap();
        assert_eq!(p.team, Some(Side::Home));
        assert_eq!(p.applies_to, Target::Away);
        assert!(r.total_away_lambda_adjustment > 0.0);
    }

    #[test]
    fn goalless_drought_lifts_the_same_side() {
        // away team failed to score in its last four away games
        let away = vec![m(1, 0), m(0, 0), m(2, 0), m(3, 0), m(1, 1)];
        let r = analyze_all_patterns(&[], &away, &[], &ReversionConfig::default());
        let p = find(&r, PatternCategory::GoallessDrought).unwrap();
        assert_eq!(p.applies_to, Target::Away);
        assert_eq!(p.length, 4);
        assert!(r.total_away_lambda_adjustment > 0.0);
    }

    #[test]
    fn emotional_momentum_lowers_win_probability() {
        let away = vec![m(0, 2), m(1, 3), m(0, 1), m(2, 2), m(1, 0)];
        let r = analyze_all_patterns(&[], &away, &[], &ReversionConfig::default());
        let p = find(&r, PatternCategory::EmotionalMomentum).unwrap();
        assert!(p.adjustment.win_prob_delta.unwrap() < 0.0);
        assert!(r.total_away_win_prob_adjustment < 0.0);
        assert_eq!(r.total_home_win_prob_adjustment, 0.0);
    }

    #[test]
    fn h2h_win_streak_targets_the_winner() {
        let h2h = vec![m(0, 1), m(1, 2), m(0, 3), m(1, 4), m(2, 2)];
        let (len, winner) = h2h_win_streak(&h2h);
        assert_eq!((len, winner), (4, Some(Side::Away)));
        let r = analyze_all_patterns(&[], &[], &h2h, &ReversionConfig::default());
        let p = find(&r, PatternCategory::H2hWin).unwrap();
        assert_eq!(p.applies_to, Target::Away);
        assert!(r.total_away_win_prob_adjustment < 0.0);
    }

    #[test]
    fn h2h_totals_are_split_between_sides() {
        let h2h = vec![m(3, 2), m(2, 2), m(4, 1), m(1, 3), m(0, 0)];
        let r = analyze_all_patterns(&[], &[], &h2h, &ReversionConfig::default());
        let p = find(&r, PatternCategory::H2hOver).unwrap();
        let total = p.adjustment.lambda_delta.unwrap();
        assert_relative_eq!(r.total_home_lambda_adjustment, total / 2.0);
        assert_relative_eq!(r.total_away_lambda_adjustment, total / 2.0);
    }

    #[test]
    fn aggregate_is_clipped() {
        let cfg = ReversionConfig {
            max_total_adjustment: 0.1,
            ..Default::default()
        };
        let home = vec![m(4, 3); 10];
        let r = analyze_all_patterns(&home, &[], &[], &cfg);
        assert!(r.clipped);
        assert_relative_eq!(r.total_home_lambda_adjustment, -0.1);
    }

    #[test]
    fn disabled_analysis_is_empty() {
        let cfg = ReversionConfig {
            enabled: false,
            ..Default::default()
        };
        let home = vec![m(4, 3); 10];
        let r = analyze_all_patterns(&home, &[], &[], &cfg);
        assert_eq!(r, ReversionAnalysisResult::default());
    }

    #[test]
    fn high_confidence_count_is_a_subset() {
        let home = vec![m(4, 0); 10];
        let r = analyze_all_patterns(&home, &[], &[], &ReversionConfig::default());
        assert!(r.patterns_detected >= 2);
        assert!(r.high_confidence_patterns <= r.patterns_detected);
    }
}
