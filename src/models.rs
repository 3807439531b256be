use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::engine::settings::SimulationConfig;

/// One finished fixture from a history list.
///
/// Goals are always stored from the fixture's own home/away perspective. For
/// the head-to-head list the fixture's home side is the side playing at home
/// in the match being predicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalMatch {
    pub home_goals_ft: u8,
    pub away_goals_ft: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_goals_ht: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub away_goals_ht: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
}

impl HistoricalMatch {
    pub fn new(home_goals_ft: u8, away_goals_ft: u8) -> Self {
        HistoricalMatch {
            home_goals_ft,
            away_goals_ft,
            home_goals_ht: None,
            away_goals_ht: None,
            date: None,
        }
    }

    pub fn with_half_time(mut self, home: u8, away: u8) -> Self {
        self.home_goals_ht = Some(home);
        self.away_goals_ht = Some(away);
        self
    }

    pub fn total_goals(&self) -> u32 {
        self.home_goals_ft as u32 + self.away_goals_ft as u32
    }

    pub fn result(&self) -> MatchResult {
        MatchResult::from_score(self.home_goals_ft as u32, self.away_goals_ft as u32)
    }

    /// Half-time result, when both half-time scores are known.
    pub fn half_time_result(&self) -> Option<MatchResult> {
        match (self.home_goals_ht, self.away_goals_ht) {
            (Some(h), Some(a)) => Some(MatchResult::from_score(h as u32, a as u32)),
            _ => None,
        }
    }

    pub fn btts(&self) -> bool {
        self.home_goals_ft > 0 && self.away_goals_ft > 0
    }

    pub fn is_over(&self, line: f64) -> bool {
        self.total_goals() as f64 > line
    }

    pub fn goals_for(&self, side: Side) -> u32 {
        match side {
            Side::Home => self.home_goals_ft as u32,
            Side::Away => self.away_goals_ft as u32,
        }
    }

    pub fn goals_against(&self, side: Side) -> u32 {
        self.goals_for(side.opponent())
    }

    /// Result from the point of view of the team that played on `side`.
    pub fn outcome_for(&self, side: Side) -> TeamOutcome {
        let (gf, ga) = (self.goals_for(side), self.goals_against(side));
        if gf > ga {
            TeamOutcome::Win
        } else if gf < ga {
            TeamOutcome::Loss
        } else {
            TeamOutcome::Draw
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Home,
    Away,
}

impl Side {
    pub fn opponent(self) -> Side {
        match self {
            Side::Home => Side::Away,
            Side::Away => Side::Home,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Home => "home",
            Side::Away => "away",
        }
    }
}

/// 1X2 result of a fixture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchResult {
    Home,
    Draw,
    Away,
}

impl MatchResult {
    pub fn from_score(home: u32, away: u32) -> Self {
        if home > away {
            MatchResult::Home
        } else if home < away {
            MatchResult::Away
        } else {
            MatchResult::Draw
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MatchResult::Home => "home",
            MatchResult::Draw => "draw",
            MatchResult::Away => "away",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "home" => Some(MatchResult::Home),
            "draw" => Some(MatchResult::Draw),
            "away" => Some(MatchResult::Away),
            _ => None,
        }
    }
}

/// Result from one team's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamOutcome {
    Win,
    Draw,
    Loss,
}

/// The three history sets attached to a prediction request.
///
/// `home` holds the home team's recent home fixtures and `away` the away
/// team's recent away fixtures. All lists are most recent first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchHistory {
    #[serde(default)]
    pub h2h: Vec<HistoricalMatch>,
    #[serde(default)]
    pub home: Vec<HistoricalMatch>,
    #[serde(default)]
    pub away: Vec<HistoricalMatch>,
}

impl MatchHistory {
    /// Re-sort each list by date (newest first) when every entry is dated.
    /// Undated lists keep the order they were supplied in.
    pub fn normalized(mut self) -> Self {
        for list in [&mut self.h2h, &mut self.home, &mut self.away] {
            if !list.is_empty() && list.iter().all(|m| m.date.is_some()) {
                list.sort_by(|a, b| b.date.cmp(&a.date));
            }
        }
        self
    }

    /// The team list for one side: home-at-home for `Home`, away-at-away for `Away`.
    pub fn team_matches(&self, side: Side) -> &[HistoricalMatch] {
        match side {
            Side::Home => &self.home,
            Side::Away => &self.away,
        }
    }

    pub fn total_matches(&self) -> usize {
        self.h2h.len() + self.home.len() + self.away.len()
    }
}

/// Everything needed to produce one prediction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_team: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub away_team: Option<String>,
    #[serde(default)]
    pub history: MatchHistory,
    /// Decimal bookmaker odds keyed by selection (e.g. "1x2_ft.home").
    /// Only used for edge computation.
    #[serde(default)]
    pub bookmaker_odds: BTreeMap<String, f64>,
    #[serde(default)]
    pub config: SimulationConfig,
}

impl MatchRequest {
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let req: MatchRequest = serde_json::from_str(text)?;
        Ok(req)
    }

    pub fn label(&self) -> String {
        format!(
            "{} vs {}",
            self.home_team.as_deref().unwrap_or("home"),
            self.away_team.as_deref().unwrap_or("away")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_for_each_side() {
        let m = HistoricalMatch::new(2, 1);
        assert_eq!(m.outcome_for(Side::Home), TeamOutcome::Win);
        assert_eq!(m.outcome_for(Side::Away), TeamOutcome::Loss);
        assert_eq!(m.result(), MatchResult::Home);
        assert!(m.btts());
        assert!(m.is_over(2.5));
    }

    #[test]
    fn half_time_result_needs_both_scores() {
        let m = HistoricalMatch::new(1, 1);
        assert_eq!(m.half_time_result(), None);
        let m = m.with_half_time(0, 1);
        assert_eq!(m.half_time_result(), Some(MatchResult::Away));
    }

    #[test]
    fn normalized_sorts_fully_dated_lists_only() {
        let dated = |d: &str, h| HistoricalMatch {
            date: Some(NaiveDate::parse_from_str(d, "%Y-%m-%d").unwrap()),
            ..HistoricalMatch::new(h, 0)
        };
        let history = MatchHistory {
            h2h: vec![dated("2023-01-01", 1), dated("2024-01-01", 2)],
            home: vec![dated("2023-01-01", 1), HistoricalMatch::new(2, 0)],
            away: vec![],
        }
        .normalized();
        assert_eq!(history.h2h[0].home_goals_ft, 2);
        // partially dated: untouched
        assert_eq!(history.home[0].home_goals_ft, 1);
    }

    #[test]
    fn request_parses_with_defaults() {
        let req = MatchRequest::from_json(
            r#"{"history": {"home": [{"home_goals_ft": 3, "away_goals_ft": 1}]}}"#,
        )
        .unwrap();
        assert_eq!(req.history.home.len(), 1);
        assert!(req.history.h2h.is_empty());
        assert!(req.bookmaker_odds.is_empty());
        assert_eq!(req.config.iterations, SimulationConfig::default().iterations);
    }
}
