//! Deterministic fingerprints of a fixture's recent history.
//!
//! Each list is reduced to at most [`PATTERN_WINDOW`] tokens, most recent
//! first. The pattern id is the SHA-256 of the complexity level and the
//! three token strings, so identical histories always map to the same id.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;
use crate::models::{HistoricalMatch, MatchHistory, MatchResult, Side, TeamOutcome};

pub const PATTERN_WINDOW: usize = 8;
/// Lists shorter than this make a fingerprint unsuitable for lookups.
pub const MIN_MATCHES_FOR_MATCHING: usize = 3;
const LOW_CONFIDENCE: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityLevel {
    Basic,
    #[default]
    Enhanced,
    Advanced,
}

impl ComplexityLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            ComplexityLevel::Basic => "basic",
            ComplexityLevel::Enhanced => "enhanced",
            ComplexityLevel::Advanced => "advanced",
        }
    }
}

impl fmt::Display for ComplexityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComplexityLevel {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(ComplexityLevel::Basic),
            "enhanced" => Ok(ComplexityLevel::Enhanced),
            "advanced" => Ok(ComplexityLevel::Advanced),
            other => Err(EngineError::invalid(format!("unknown complexity level '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternStrength {
    Weak,
    Moderate,
    Strong,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMetadata {
    pub h2h_matches: usize,
    pub home_matches: usize,
    pub away_matches: usize,
    pub avg_goals_per_game: f64,
    /// Side with more than one extra H2H win; `None` when balanced.
    pub dominant_team: Option<Side>,
    pub pattern_strength: PatternStrength,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternFingerprint {
    pub h2h_fingerprint: String,
    pub home_fingerprint: String,
    pub away_fingerprint: String,
    /// 64 lowercase hex characters.
    pub unique_pattern_id: String,
    pub complexity: ComplexityLevel,
    pub confidence: f64,
    pub valid_for_matching: bool,
    pub issues: Vec<String>,
    pub context_metadata: ContextMetadata,
}

impl PatternFingerprint {
    pub fn segments(&self) -> [&str; 3] {
        [&self.h2h_fingerprint, &self.home_fingerprint, &self.away_fingerprint]
    }
}

// ── Tokens ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Perspective {
    /// Fixture home side, result as H/D/A.
    Fixture,
    /// One team's own matches, result as W/D/L.
    Team(Side),
}

fn score_bucket(total: u32) -> char {
    match total {
        0..=1 => 'L',
        2..=3 => 'M',
        _ => 'H',
    }
}

fn match_token(m: &HistoricalMatch, view: Perspective, level: ComplexityLevel) -> String {
    let (result, conceded_none) = match view {
        Perspective::Fixture => {
            let r = match m.result() {
                MatchResult::Home => 'H',
                MatchResult::Draw => 'D',
                MatchResult::Away => 'A',
            };
            (r, m.away_goals_ft == 0)
        }
        Perspective::Team(side) => {
            let r = match m.outcome_for(side) {
                TeamOutcome::Win => 'W',
                TeamOutcome::Draw => 'D',
                TeamOutcome::Loss => 'L',
            };
            (r, m.goals_against(side) == 0)
        }
    };

    let mut token = String::with_capacity(12);
    token.push(result);
    token.push(if m.is_over(2.5) { 'O' } else { 'U' });
    if level == ComplexityLevel::Basic {
        return token;
    }

    token.push(if m.btts() { 'G' } else { 'N' });
    token.push_str(&format!("{}.{}", m.home_goals_ft, m.away_goals_ft));
    if level == ComplexityLevel::Enhanced {
        return token;
    }

    token.push(score_bucket(m.total_goals()));
    token.push(if conceded_none { 'C' } else { 'N' });
    token.push(match m.half_time_result() {
        Some(MatchResult::Home) => 'h',
        Some(MatchResult::Draw) => 'd',
        Some(MatchResult::Away) => 'a',
        None => 'x',
    });
    token
}

fn encode_segment(
    prefix: &str,
    matches: &[HistoricalMatch],
    view: Perspective,
    level: ComplexityLevel,
) -> String {
    let tokens: Vec<String> = matches
        .iter()
        .take(PATTERN_WINDOW)
        .map(|m| match_token(m, view, level))
        .collect();
    format!("{}:{}", prefix, tokens.join("-"))
}

pub fn pattern_id(level: ComplexityLevel, h2h: &str, home: &str, away: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(level.as_str().as_bytes());
    for segment in [h2h, home, away] {
        hasher.update(b"|");
        hasher.update(segment.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

// ── Metadata & confidence ────────────────────────────────────────────────────

fn metadata(
    h2h: &[HistoricalMatch],
    home: &[HistoricalMatch],
    away: &[HistoricalMatch],
) -> ContextMetadata {
    let window = |l: &[HistoricalMatch]| l.len().min(PATTERN_WINDOW);
    let encoded = h2h
        .iter()
        .take(PATTERN_WINDOW)
        .chain(home.iter().take(PATTERN_WINDOW))
        .chain(away.iter().take(PATTERN_WINDOW));
    let (games, goals) = encoded.fold((0usize, 0u32), |(n, g), m| (n + 1, g + m.total_goals()));
    let avg_goals_per_game = if games == 0 { 0.0 } else { goals as f64 / games as f64 };

    let home_wins = h2h.iter().filter(|m| m.result() == MatchResult::Home).count();
    let away_wins = h2h.iter().filter(|m| m.result() == MatchResult::Away).count();
    let dominant_team = if home_wins > away_wins + 1 {
        Some(Side::Home)
    } else if away_wins > home_wins + 1 {
        Some(Side::Away)
    } else {
        None
    };

    let total = h2h.len() + home.len() + away.len();
    let pattern_strength = if total >= 15 {
        PatternStrength::Strong
    } else if total >= 10 {
        PatternStrength::Moderate
    } else {
        PatternStrength::Weak
    };

    ContextMetadata {
        h2h_matches: window(h2h),
        home_matches: window(home),
        away_matches: window(away),
        avg_goals_per_game,
        dominant_team,
        pattern_strength,
    }
}

fn confidence(h2h: usize, home: usize, away: usize, strength: PatternStrength) -> f64 {
    let mut c: f64 = match h2h {
        n if n >= 5 => 0.3,
        n if n >= 3 => 0.2,
        n if n >= 1 => 0.1,
        _ => 0.0,
    };
    for n in [home, away] {
        c += match n {
            n if n >= 8 => 0.25,
            n if n >= 5 => 0.15,
            n if n >= 3 => 0.1,
            _ => 0.0,
        };
    }
    c += match strength {
        PatternStrength::Strong => 0.15,
        PatternStrength::Moderate => 0.10,
        PatternStrength::Weak => 0.0,
    };
    (c + 0.05).min(1.0)
}

// ── Public API ───────────────────────────────────────────────────────────────

/// Fingerprint three history lists. Short lists are flagged, never fatal.
pub fn encode(
    h2h: &[HistoricalMatch],
    home: &[HistoricalMatch],
    away: &[HistoricalMatch],
    complexity: ComplexityLevel,
) -> PatternFingerprint {
    let h2h_fingerprint = encode_segment("H2H", h2h, Perspective::Fixture, complexity);
    let home_fingerprint = encode_segment("HOME", home, Perspective::Team(Side::Home), complexity);
    let away_fingerprint = encode_segment("AWAY", away, Perspective::Team(Side::Away), complexity);
    let unique_pattern_id = pattern_id(
        complexity,
        &h2h_fingerprint,
        &home_fingerprint,
        &away_fingerprint,
    );

    let context_metadata = metadata(h2h, home, away);
    let confidence = confidence(
        h2h.len(),
        home.len(),
        away.len(),
        context_metadata.pattern_strength,
    );

    let mut issues = Vec::new();
    for (name, list) in [("h2h", h2h), ("home", home), ("away", away)] {
        if list.len() < MIN_MATCHES_FOR_MATCHING {
            let err = EngineError::insufficient(name, list.len(), MIN_MATCHES_FOR_MATCHING);
            issues.push(err.to_string());
        }
    }
    let valid_for_matching = issues.is_empty();
    if confidence < LOW_CONFIDENCE {
        issues.push(format!("pattern confidence {:.2} below {:.2}", confidence, LOW_CONFIDENCE));
    }

    PatternFingerprint {
        h2h_fingerprint,
        home_fingerprint,
        away_fingerprint,
        unique_pattern_id,
        complexity,
        confidence,
        valid_for_matching,
        issues,
        context_metadata,
    }
}

pub fn encode_history(history: &MatchHistory, complexity: ComplexityLevel) -> PatternFingerprint {
    encode(&history.h2h, &history.home, &history.away, complexity)
}

fn tokens(segment: &str) -> Vec<&str> {
    let body = segment.split_once(':').map(|(_, b)| b).unwrap_or(segment);
    body.split('-').filter(|t| !t.is_empty()).collect()
}

/// Share of positionally equal tokens across the three segments, in [0, 1].
pub fn segment_similarity(a: [&str; 3], b: [&str; 3]) -> f64 {
    let mut matched = 0usize;
    let mut slots = 0usize;
    for (sa, sb) in a.iter().zip(b.iter()) {
        let (ta, tb) = (tokens(sa), tokens(sb));
        slots += ta.len().max(tb.len());
        matched += ta.iter().zip(tb.iter()).filter(|(x, y)| x == y).count();
    }
    if slots == 0 {
        return 1.0;
    }
    matched as f64 / slots as f64
}

/// Similarity of two fingerprints; different complexity levels never match.
pub fn similarity(a: &PatternFingerprint, b: &PatternFingerprint) -> f64 {
    if a.complexity != b.complexity {
        return 0.0;
    }
    segment_similarity(a.segments(), b.segments())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn m(h: u8, a: u8) -> HistoricalMatch {
        HistoricalMatch::new(h, a)
    }

    fn history() -> (Vec<HistoricalMatch>, Vec<HistoricalMatch>, Vec<HistoricalMatch>) {
        (
            vec![m(2, 1), m(0, 0), m(1, 3), m(2, 2), m(1, 0)],
            vec![m(3, 0), m(1, 1), m(2, 1), m(0, 1), m(4, 2), m(1, 0), m(2, 0), m(0, 0)],
            vec![m(1, 2), m(0, 0), m(3, 1), m(2, 2), m(1, 1), m(0, 2)],
        )
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let (h2h, home, away) = history();
        let a = encode(&h2h, &home, &away, ComplexityLevel::Enhanced);
        let b = encode(&h2h, &home, &away, ComplexityLevel::Enhanced);
        assert_eq!(a.unique_pattern_id, b.unique_pattern_id);
        assert_eq!(a.unique_pattern_id.len(), 64);
        assert!(a
            .unique_pattern_id
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn single_score_change_changes_the_id() {
        let (h2h, home, away) = history();
        for level in [ComplexityLevel::Enhanced, ComplexityLevel::Advanced] {
            let base = encode(&h2h, &home, &away, level);
            let mut changed = home.clone();
            // same result, same O/U, same BTTS: only the score differs
            changed[0] = m(4, 0);
            let other = encode(&h2h, &changed, &away, level);
            assert_ne!(base.unique_pattern_id, other.unique_pattern_id, "{:?}", level);
        }
    }

    #[test]
    fn basic_level_ignores_exact_scores() {
        let (h2h, home, away) = history();
        let mut changed = home.clone();
        changed[0] = m(4, 0);
        let a = encode(&h2h, &home, &away, ComplexityLevel::Basic);
        let b = encode(&h2h, &changed, &away, ComplexityLevel::Basic);
        assert_eq!(a.unique_pattern_id, b.unique_pattern_id);
    }

    #[test]
    fn complexity_is_part_of_the_id() {
        let (h2h, home, away) = history();
        let a = encode(&h2h, &home, &away, ComplexityLevel::Basic);
        let b = encode(&h2h, &home, &away, ComplexityLevel::Enhanced);
        assert_ne!(a.unique_pattern_id, b.unique_pattern_id);
    }

    #[test]
    fn tokens_by_level() {
        let game = m(2, 1).with_half_time(0, 1);
        assert_eq!(match_token(&game, Perspective::Fixture, ComplexityLevel::Basic), "HO");
        assert_eq!(
            match_token(&game, Perspective::Team(Side::Away), ComplexityLevel::Enhanced),
            "LOG2.1"
        );
        assert_eq!(
            match_token(&game, Perspective::Team(Side::Home), ComplexityLevel::Advanced),
            "WOG2.1MNa"
        );
        assert_eq!(
            match_token(&m(0, 0), Perspective::Team(Side::Home), ComplexityLevel::Advanced),
            "DUN0.0LCx"
        );
    }

    #[test]
    fn window_caps_each_list() {
        let long: Vec<_> = (0..12).map(|i| m(i % 3, 1)).collect();
        let fp = encode(&long, &long, &long, ComplexityLevel::Basic);
        assert_eq!(tokens(&fp.h2h_fingerprint).len(), PATTERN_WINDOW);
        assert_eq!(fp.context_metadata.home_matches, PATTERN_WINDOW);
    }

    #[test]
    fn short_lists_are_flagged_not_fatal() {
        let (h2h, home, _) = history();
        let fp = encode(&h2h[..2], &home, &[], ComplexityLevel::Enhanced);
        assert!(!fp.valid_for_matching);
        assert!(fp.issues.iter().any(|i| i.contains("h2h")));
        assert!(fp.issues.iter().any(|i| i.contains("away")));
        assert_eq!(fp.away_fingerprint, "AWAY:");
    }

    #[test]
    fn metadata_and_confidence() {
        let (h2h, home, away) = history();
        let fp = encode(&h2h, &home, &away, ComplexityLevel::Enhanced);
        let meta = &fp.context_metadata;
        assert_eq!(meta.pattern_strength, PatternStrength::Strong);
        assert_eq!(meta.dominant_team, None);
        // 0.3 + 0.25 + 0.15 + 0.15 + 0.05
        assert_relative_eq!(fp.confidence, 0.9, epsilon = 1e-12);
        assert!(fp.valid_for_matching);
        assert!(fp.issues.is_empty());
    }

    #[test]
    fn similarity_counts_positional_matches() {
        let (h2h, home, away) = history();
        let a = encode(&h2h, &home, &away, ComplexityLevel::Basic);
        assert_relative_eq!(similarity(&a, &a), 1.0);

        let mut changed = home.clone();
        changed[0] = m(0, 3);
        let b = encode(&h2h, &changed, &away, ComplexityLevel::Basic);
        // 19 token slots, one differs
        assert_relative_eq!(similarity(&a, &b), 18.0 / 19.0, epsilon = 1e-12);

        let c = encode(&h2h, &home, &away, ComplexityLevel::Enhanced);
        assert_eq!(similarity(&a, &c), 0.0);
    }

    #[test]
    fn similarity_penalises_length_mismatch() {
        let s = segment_similarity(["H2H:HO-DU", "HOME:", "AWAY:"], ["H2H:HO", "HOME:", "AWAY:"]);
        assert_relative_eq!(s, 0.5);
    }
}
