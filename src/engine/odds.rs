//! True odds, edges and value bets.
//!
//! Market probabilities are flattened into one table keyed by selection
//! (`ou_ft.over_2.5`, `ah.home_-1.5`, ...). Bookmaker prices are decimal odds.

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use tracing::warn;

use crate::engine::markets::{format_handicap, format_line, LineProbabilities, MarketProbabilities};
use crate::engine::settings::MarketConfig;

/// Fair decimal odds, or a sentinel when the probability is too small to
/// price. Never NaN or infinite.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrueOdds {
    Fair(f64),
    Degenerate,
}

impl TrueOdds {
    pub fn from_probability(p: f64, degenerate_below: f64) -> Self {
        if p.is_finite() && p >= degenerate_below && p > 0.0 {
            TrueOdds::Fair(1.0 / p)
        } else {
            TrueOdds::Degenerate
        }
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            TrueOdds::Fair(o) => Some(*o),
            TrueOdds::Degenerate => None,
        }
    }
}

impl Serialize for TrueOdds {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut st = serializer.serialize_struct("TrueOdds", 2)?;
        st.serialize_field("odds", &self.value())?;
        st.serialize_field("degenerate", &matches!(self, TrueOdds::Degenerate))?;
        st.end()
    }
}

// ── Edge & stake ─────────────────────────────────────────────────────────────

/// Edge = true probability − bookmaker implied probability.
pub fn edge(true_prob: f64, decimal_odds: f64) -> f64 {
    if decimal_odds <= 1.0 {
        return 0.0;
    }
    true_prob - 1.0 / decimal_odds
}

/// Expected return per unit staked.
pub fn expected_value(true_prob: f64, decimal_odds: f64) -> f64 {
    if decimal_odds <= 1.0 {
        return 0.0;
    }
    true_prob * decimal_odds - 1.0
}

/// Fractional Kelly stake at decimal odds.
///
///   f* = (b·p − q) / b,  b = odds − 1
///
/// Returns 0.0 when there is no edge.
pub fn kelly_stake(true_prob: f64, decimal_odds: f64, kelly_fraction: f64) -> f64 {
    if decimal_odds <= 1.0 {
        return 0.0;
    }
    let b = decimal_odds - 1.0;
    let p = true_prob;
    let q = 1.0 - p;
    let f = (b * p - q) / b;
    if f <= 0.0 {
        return 0.0;
    }
    (f * kelly_fraction).clamp(0.0, 1.0)
}

// ── Selection table ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Selection {
    pub key: String,
    /// Pricing probability. Refund lines use the push-excluded share.
    pub probability: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_probability: Option<f64>,
    pub true_odds: TrueOdds,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bookmaker_odds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implied_probability: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueBet {
    pub key: String,
    pub probability: f64,
    pub bookmaker_odds: f64,
    pub edge: f64,
    pub expected_value: f64,
    pub kelly_stake: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PricedMarkets {
    pub selections: Vec<Selection>,
    pub value_bets: Vec<ValueBet>,
    pub warnings: Vec<String>,
}

impl PricedMarkets {
    pub fn get(&self, key: &str) -> Option<&Selection> {
        self.selections.iter().find(|s| s.key == key)
    }
}

struct Row {
    key: String,
    probability: f64,
    push: Option<f64>,
}

fn simple(rows: &mut Vec<Row>, key: String, probability: f64) {
    rows.push(Row {
        key,
        probability,
        push: None,
    });
}

fn line(rows: &mut Vec<Row>, key: String, lp: &LineProbabilities) {
    if lp.refundable() {
        rows.push(Row {
            key,
            probability: lp.win_no_push,
            push: Some(lp.push),
        });
    } else {
        simple(rows, key, lp.win);
    }
}

fn flatten(m: &MarketProbabilities) -> Vec<Row> {
    let mut rows = Vec::new();
    for (prefix, tw) in [("1x2_ft", &m.result_ft), ("1x2_ht", &m.result_ht)] {
        simple(&mut rows, format!("{}.home", prefix), tw.home);
        simple(&mut rows, format!("{}.draw", prefix), tw.draw);
        simple(&mut rows, format!("{}.away", prefix), tw.away);
    }
    simple(&mut rows, "dc.1x".into(), m.double_chance.home_draw);
    simple(&mut rows, "dc.12".into(), m.double_chance.home_away);
    simple(&mut rows, "dc.x2".into(), m.double_chance.draw_away);
    for (key, p) in [("dnb.home", m.draw_no_bet.home), ("dnb.away", m.draw_no_bet.away)] {
        rows.push(Row {
            key: key.into(),
            probability: p,
            push: Some(m.draw_no_bet.push),
        });
    }
    simple(&mut rows, "btts.yes".into(), m.btts.yes);
    simple(&mut rows, "btts.no".into(), m.btts.no);

    for (prefix, lines) in [("ou_ft", &m.totals_ft), ("ou_ht", &m.totals_ht)] {
        for lp in lines {
            let l = format_line(lp.line);
            line(&mut rows, format!("{}.over_{}", prefix, l), lp);
            line(&mut rows, format!("{}.under_{}", prefix, l), &lp.mirror());
        }
    }
    for lp in &m.asian_handicap {
        let away = lp.mirror();
        line(&mut rows, format!("ah.home_{}", format_handicap(lp.line)), lp);
        line(&mut rows, format!("ah.away_{}", format_handicap(away.line)), &away);
    }

    for (prefix, table) in [
        ("cs", &m.correct_score),
        ("range", &m.goal_ranges),
        ("htft", &m.ht_ft),
        ("goals", &m.total_goals),
    ] {
        for (k, &p) in table {
            simple(&mut rows, format!("{}.{}", prefix, k), p);
        }
    }
    simple(&mut rows, "parity.odd".into(), m.parity.odd);
    simple(&mut rows, "parity.even".into(), m.parity.even);
    rows
}

/// Price every selection and compare against the supplied bookmaker odds.
pub fn price_markets(
    markets: &MarketProbabilities,
    bookmaker_odds: &BTreeMap<String, f64>,
    cfg: &MarketConfig,
) -> PricedMarkets {
    let mut priced = PricedMarkets::default();
    let mut usable: BTreeMap<&str, f64> = BTreeMap::new();
    for (key, &odds) in bookmaker_odds {
        if odds.is_finite() && odds > 1.0 {
            usable.insert(key.as_str(), odds);
        } else {
            warn!("Ignoring bookmaker odds {} for {}: must be above 1.0", odds, key);
            priced
                .warnings
                .push(format!("ignored bookmaker odds {} for {} (must be above 1.0)", odds, key));
        }
    }

    for row in flatten(markets) {
        let offered = usable.remove(row.key.as_str());
        let sel = Selection {
            true_odds: TrueOdds::from_probability(row.probability, cfg.degenerate_below),
            bookmaker_odds: offered,
            implied_probability: offered.map(|o| 1.0 / o),
            edge: offered.map(|o| edge(row.probability, o)),
            expected_value: offered.map(|o| expected_value(row.probability, o)),
            probability: row.probability,
            push_probability: row.push,
            key: row.key,
        };
        let offer = (sel.bookmaker_odds, sel.edge, sel.expected_value);
        if let (Some(odds), Some(e), Some(ev)) = offer {
            if e >= cfg.min_edge {
                priced.value_bets.push(ValueBet {
                    key: sel.key.clone(),
                    probability: sel.probability,
                    bookmaker_odds: odds,
                    edge: e,
                    expected_value: ev,
                    kelly_stake: kelly_stake(sel.probability, odds, cfg.kelly_fraction),
                });
            }
        }
        priced.selections.push(sel);
    }

    for key in usable.keys() {
        warn!("No market for bookmaker selection {}", key);
        priced.warnings.push(format!("unknown selection key {}", key));
    }

    priced
        .value_bets
        .sort_by(|a, b| b.edge.partial_cmp(&a.edge).unwrap_or(std::cmp::Ordering::Equal));
    priced
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::markets::MarketCounters;
    use approx::assert_relative_eq;

    fn sample_markets() -> MarketProbabilities {
        let mut c = MarketCounters::new(5);
        for (total, count) in [(0u32, 10), (1, 25), (2, 30), (3, 20), (4, 10), (5, 5)] {
            for _ in 0..count {
                c.record(total, 0, 0, 0);
            }
        }
        c.summarize()
    }

    #[test]
    fn test_edge_calculation() {
        assert_relative_eq!(edge(0.6, 2.0), 0.1, epsilon = 1e-12);
        assert_relative_eq!(expected_value(0.6, 2.0), 0.2, epsilon = 1e-12);
        assert_relative_eq!(edge(0.4, 2.0), -0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_kelly_no_edge() {
        assert_relative_eq!(kelly_stake(0.5, 2.0, 1.0), 0.0, epsilon = 1e-9);
        assert_relative_eq!(kelly_stake(0.6, 2.0, 1.0), 0.2, epsilon = 1e-9);
        assert_relative_eq!(kelly_stake(0.6, 2.0, 0.25), 0.05, epsilon = 1e-9);
    }

    #[test]
    fn degenerate_odds_never_produce_nan() {
        assert_eq!(TrueOdds::from_probability(0.0, 1e-4), TrueOdds::Degenerate);
        assert_eq!(TrueOdds::from_probability(5e-5, 1e-4), TrueOdds::Degenerate);
        assert_eq!(TrueOdds::from_probability(f64::NAN, 1e-4), TrueOdds::Degenerate);
        assert_eq!(TrueOdds::from_probability(0.5, 1e-4), TrueOdds::Fair(2.0));

        let json = serde_json::to_string(&TrueOdds::Degenerate).unwrap();
        assert_eq!(json, r#"{"odds":null,"degenerate":true}"#);
    }

    #[test]
    fn push_lines_price_against_win_no_push() {
        let m = sample_markets();
        let mut books = BTreeMap::new();
        books.insert("ou_ft.over_3.0".to_string(), 5.0);
        books.insert("ou_ft.over_3.5".to_string(), 5.0);
        let priced = price_markets(&m, &books, &MarketConfig::default());

        let three = priced.get("ou_ft.over_3.0").unwrap();
        assert_relative_eq!(three.probability, 0.1875, epsilon = 1e-12);
        assert_relative_eq!(three.push_probability.unwrap(), 0.20, epsilon = 1e-12);
        assert_relative_eq!(three.edge.unwrap(), 0.1875 - 0.2, epsilon = 1e-12);

        let three_half = priced.get("ou_ft.over_3.5").unwrap();
        assert_relative_eq!(three_half.probability, 0.15, epsilon = 1e-12);
        assert!(three_half.push_probability.is_none());

        let under = priced.get("ou_ft.under_3.0").unwrap();
        assert_relative_eq!(under.probability, 0.65 / 0.80, epsilon = 1e-12);
    }

    #[test]
    fn invalid_and_unknown_odds_become_warnings() {
        let m = sample_markets();
        let mut books = BTreeMap::new();
        books.insert("btts.yes".to_string(), 1.0);
        books.insert("corners.over_9.5".to_string(), 1.9);
        let priced = price_markets(&m, &books, &MarketConfig::default());
        assert_eq!(priced.warnings.len(), 2);
        assert!(priced.get("btts.yes").unwrap().bookmaker_odds.is_none());
    }

    #[test]
    fn value_bets_need_min_edge_and_are_sorted() {
        let m = sample_markets();
        let mut books = BTreeMap::new();
        // under 2.5 is 0.65, over 2.5 is 0.35
        books.insert("ou_ft.under_2.5".to_string(), 2.0);
        books.insert("ou_ft.over_2.5".to_string(), 2.5);
        books.insert("btts.no".to_string(), 1.01);
        let priced = price_markets(&m, &books, &MarketConfig::default());
        assert_eq!(priced.value_bets.len(), 1);
        let vb = &priced.value_bets[0];
        assert_eq!(vb.key, "ou_ft.under_2.5");
        assert_relative_eq!(vb.edge, 0.15, epsilon = 1e-12);
        assert!(vb.kelly_stake > 0.0);
    }

    #[test]
    fn selection_keys_cover_the_documented_markets() {
        let priced = price_markets(&sample_markets(), &BTreeMap::new(), &MarketConfig::default());
        for key in [
            "1x2_ft.home",
            "1x2_ht.draw",
            "dc.1x",
            "dc.12",
            "dc.x2",
            "dnb.home",
            "ou_ft.over_2.5",
            "ou_ft.under_3.0",
            "ou_ft.over_2.75",
            "ou_ht.over_0.5",
            "btts.yes",
            "ah.home_-1.5",
            "ah.away_+0.5",
            "ah.home_+0.0",
            "cs.2-1",
            "cs.other",
            "range.2-3",
            "range.7+",
            "parity.odd",
            "htft.home/draw",
            "goals.3",
            "goals.10+",
        ] {
            assert!(priced.get(key).is_some(), "missing {}", key);
        }
    }
}
