//! Market classification.
//!
//! Every trial is classified into all tracked markets by integer counters
//! that merge by plain addition, so per-worker counters can be reduced in
//! any order without changing the result.
//!
//! Lines are held in quarter-goal units. Integer lines (X.0) can push,
//! half lines (X.5) cannot, and quarter lines (X.25 / X.75) split the stake
//! across the two neighbouring lines, producing half-win or half-lose.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::models::MatchResult;

/// Full-time total-goals lines (European and Asian).
pub const FT_TOTAL_LINES: [f64; 13] = [
    0.5, 1.5, 1.75, 2.0, 2.25, 2.5, 2.75, 3.0, 3.25, 3.5, 3.75, 4.5, 5.5,
];
pub const HT_TOTAL_LINES: [f64; 3] = [0.5, 1.5, 2.5];
/// Home handicaps from -2.5 to +2.5 in quarter steps.
pub const HANDICAP_QUARTERS: std::ops::RangeInclusive<i64> = -10..=10;
/// Exact total-goal counts tracked individually; larger totals share a bucket.
pub const MAX_TOTAL_TRACKED: usize = 9;

pub fn to_quarters(line: f64) -> i64 {
    (line * 4.0).round() as i64
}

pub fn from_quarters(q: i64) -> f64 {
    q as f64 / 4.0
}

/// Negate a line without producing `-0.0`.
pub fn opposite_line(line: f64) -> f64 {
    from_quarters(-to_quarters(line))
}

/// Render a line for selection keys: "2.5", "3.0", "2.25".
pub fn format_line(line: f64) -> String {
    if to_quarters(line) % 2 != 0 {
        format!("{:.2}", line)
    } else {
        format!("{:.1}", line)
    }
}

/// Signed rendering for handicaps: "+0.5", "-1.25", "+0.0".
pub fn format_handicap(line: f64) -> String {
    if to_quarters(line) % 2 != 0 {
        format!("{:+.2}", line)
    } else {
        format!("{:+.1}", line)
    }
}

// ── Settlement ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Settlement {
    Win,
    HalfWin,
    Push,
    HalfLose,
    Lose,
}

impl Settlement {
    /// The same trial seen from the opposite side of the line.
    pub fn mirror(self) -> Settlement {
        match self {
            Settlement::Win => Settlement::Lose,
            Settlement::HalfWin => Settlement::HalfLose,
            Settlement::Push => Settlement::Push,
            Settlement::HalfLose => Settlement::HalfWin,
            Settlement::Lose => Settlement::Win,
        }
    }
}

fn settle_single(score_q: i64, line_q: i64) -> Settlement {
    match score_q.cmp(&line_q) {
        Ordering::Greater => Settlement::Win,
        Ordering::Equal => Settlement::Push,
        Ordering::Less => Settlement::Lose,
    }
}

/// Settle a bet that wins when `score > line`, both in quarter units.
pub fn settle(score_q: i64, line_q: i64) -> Settlement {
    if line_q.rem_euclid(2) == 0 {
        return settle_single(score_q, line_q);
    }
    let lower = settle_single(score_q, line_q - 1);
    let upper = settle_single(score_q, line_q + 1);
    match (lower, upper) {
        (Settlement::Win, Settlement::Win) => Settlement::Win,
        (Settlement::Lose, Settlement::Lose) => Settlement::Lose,
        (Settlement::Win, Settlement::Push) | (Settlement::Push, Settlement::Win) => {
            Settlement::HalfWin
        }
        (Settlement::Push, Settlement::Lose) | (Settlement::Lose, Settlement::Push) => {
            Settlement::HalfLose
        }
        _ => Settlement::Push,
    }
}

// ── Line counters ────────────────────────────────────────────────────────────

/// Settlement counts for one line, from the over / home side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LineCounter {
    pub line_q: i64,
    pub win: u64,
    pub half_win: u64,
    pub push: u64,
    pub half_lose: u64,
    pub lose: u64,
}

impl LineCounter {
    pub fn new(line: f64) -> Self {
        LineCounter {
            line_q: to_quarters(line),
            ..Default::default()
        }
    }

    pub fn record(&mut self, score_q: i64) {
        match settle(score_q, self.line_q) {
            Settlement::Win => self.win += 1,
            Settlement::HalfWin => self.half_win += 1,
            Settlement::Push => self.push += 1,
            Settlement::HalfLose => self.half_lose += 1,
            Settlement::Lose => self.lose += 1,
        }
    }

    fn add(&mut self, other: &LineCounter) {
        self.win += other.win;
        self.half_win += other.half_win;
        self.push += other.push;
        self.half_lose += other.half_lose;
        self.lose += other.lose;
    }

    pub fn probabilities(&self, trials: u64) -> LineProbabilities {
        let share = |c: u64| if trials == 0 { 0.0 } else { c as f64 / trials as f64 };
        let (win, half_win, push, half_lose, lose) = (
            share(self.win),
            share(self.half_win),
            share(self.push),
            share(self.half_lose),
            share(self.lose),
        );
        LineProbabilities {
            line: from_quarters(self.line_q),
            win,
            half_win,
            push,
            half_lose,
            lose,
            win_no_push: no_push_probability(win, half_win, half_lose, lose),
        }
    }
}

/// Probability with refunded stake removed from the denominator. For a
/// plain push line this is `win / (win + lose)`; half results count half.
pub fn no_push_probability(win: f64, half_win: f64, half_lose: f64, lose: f64) -> f64 {
    let for_ = win + half_win / 2.0;
    let against = lose + half_lose / 2.0;
    if for_ + against <= 0.0 {
        0.0
    } else {
        for_ / (for_ + against)
    }
}

/// Shares of all trials in each settlement bucket for one line.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LineProbabilities {
    pub line: f64,
    pub win: f64,
    pub half_win: f64,
    pub push: f64,
    pub half_lose: f64,
    pub lose: f64,
    /// Win share with pushes (and the refunded halves) excluded.
    pub win_no_push: f64,
}

impl LineProbabilities {
    /// The opposite side of the same line (under, or the away handicap).
    pub fn mirror(&self) -> LineProbabilities {
        LineProbabilities {
            line: opposite_line(self.line),
            win: self.lose,
            half_win: self.half_lose,
            push: self.push,
            half_lose: self.half_win,
            lose: self.win,
            win_no_push: no_push_probability(self.lose, self.half_lose, self.half_win, self.win),
        }
    }

    /// Integer and quarter lines can refund all or half the stake.
    pub fn refundable(&self) -> bool {
        to_quarters(self.line) % 4 == 0 || to_quarters(self.line) % 2 != 0
    }
}

// ── Trial counters ───────────────────────────────────────────────────────────

fn result_index(r: MatchResult) -> usize {
    match r {
        MatchResult::Home => 0,
        MatchResult::Draw => 1,
        MatchResult::Away => 2,
    }
}

const RESULTS: [MatchResult; 3] = [MatchResult::Home, MatchResult::Draw, MatchResult::Away];

/// Raw per-market counts for a set of trials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketCounters {
    pub trials: u64,
    pub home_goals: u64,
    pub away_goals: u64,
    pub result_ft: [u64; 3],
    pub result_ht: [u64; 3],
    /// `[ht][ft]` result combinations.
    pub ht_ft: [[u64; 3]; 3],
    pub btts: u64,
    pub totals_ft: Vec<LineCounter>,
    pub totals_ht: Vec<LineCounter>,
    pub handicaps: Vec<LineCounter>,
    pub score_max: u8,
    /// Row-major `(max+1) x (max+1)` correct-score grid.
    pub scores: Vec<u64>,
    pub score_other: u64,
    /// Index `n` counts totals of exactly `n`; the last slot is `MAX+1` and above.
    pub totals: Vec<u64>,
    pub odd_totals: u64,
}

impl MarketCounters {
    pub fn new(score_max: u8) -> Self {
        let side = score_max as usize + 1;
        MarketCounters {
            trials: 0,
            home_goals: 0,
            away_goals: 0,
            result_ft: [0; 3],
            result_ht: [0; 3],
            ht_ft: [[0; 3]; 3],
            btts: 0,
            totals_ft: FT_TOTAL_LINES.iter().map(|&l| LineCounter::new(l)).collect(),
            totals_ht: HT_TOTAL_LINES.iter().map(|&l| LineCounter::new(l)).collect(),
            handicaps: HANDICAP_QUARTERS
                .map(|q| LineCounter::new(from_quarters(q)))
                .collect(),
            score_max,
            scores: vec![0; side * side],
            score_other: 0,
            totals: vec![0; MAX_TOTAL_TRACKED + 2],
            odd_totals: 0,
        }
    }

    /// Classify one simulated match.
    pub fn record(&mut self, home: u32, away: u32, ht_home: u32, ht_away: u32) {
        self.trials += 1;
        self.home_goals += home as u64;
        self.away_goals += away as u64;

        let ft = result_index(MatchResult::from_score(home, away));
        let ht = result_index(MatchResult::from_score(ht_home, ht_away));
        self.result_ft[ft] += 1;
        self.result_ht[ht] += 1;
        self.ht_ft[ht][ft] += 1;

        if home > 0 && away > 0 {
            self.btts += 1;
        }

        let total = home + away;
        let total_q = total as i64 * 4;
        for c in &mut self.totals_ft {
            c.record(total_q);
        }
        let ht_total_q = (ht_home + ht_away) as i64 * 4;
        for c in &mut self.totals_ht {
            c.record(ht_total_q);
        }
        // home covers handicap h when (home - away) + h > 0, i.e. diff > -h
        let diff_q = (home as i64 - away as i64) * 4;
        for c in &mut self.handicaps {
            c.record(diff_q);
        }

        let max = self.score_max as u32;
        if home <= max && away <= max {
            let side = max as usize + 1;
            self.scores[home as usize * side + away as usize] += 1;
        } else {
            self.score_other += 1;
        }

        let idx = (total as usize).min(MAX_TOTAL_TRACKED + 1);
        self.totals[idx] += 1;
        if total % 2 == 1 {
            self.odd_totals += 1;
        }
    }

    pub fn merge(mut self, other: MarketCounters) -> MarketCounters {
        self.trials += other.trials;
        self.home_goals += other.home_goals;
        self.away_goals += other.away_goals;
        for i in 0..3 {
            self.result_ft[i] += other.result_ft[i];
            self.result_ht[i] += other.result_ht[i];
            for j in 0..3 {
                self.ht_ft[i][j] += other.ht_ft[i][j];
            }
        }
        self.btts += other.btts;
        for (a, b) in self.totals_ft.iter_mut().zip(&other.totals_ft) {
            a.add(b);
        }
        for (a, b) in self.totals_ht.iter_mut().zip(&other.totals_ht) {
            a.add(b);
        }
        for (a, b) in self.handicaps.iter_mut().zip(&other.handicaps) {
            a.add(b);
        }
        for (a, b) in self.scores.iter_mut().zip(&other.scores) {
            *a += b;
        }
        self.score_other += other.score_other;
        for (a, b) in self.totals.iter_mut().zip(&other.totals) {
            *a += b;
        }
        self.odd_totals += other.odd_totals;
        self
    }

    /// Derive probabilities for every market from the counts.
    pub fn summarize(&self) -> MarketProbabilities {
        let n = self.trials;
        let p = |c: u64| if n == 0 { 0.0 } else { c as f64 / n as f64 };

        let three_way = |c: &[u64; 3]| ThreeWay {
            home: p(c[0]),
            draw: p(c[1]),
            away: p(c[2]),
        };
        let result_ft = three_way(&self.result_ft);
        let result_ht = three_way(&self.result_ht);

        let dnb_home = no_push_probability(result_ft.home, 0.0, 0.0, result_ft.away);
        let draw_no_bet = DrawNoBet {
            home: dnb_home,
            away: if result_ft.home + result_ft.away > 0.0 { 1.0 - dnb_home } else { 0.0 },
            push: result_ft.draw,
        };

        let side = self.score_max as usize + 1;
        let mut correct_score = BTreeMap::new();
        for h in 0..side {
            for a in 0..side {
                correct_score.insert(format!("{}-{}", h, a), p(self.scores[h * side + a]));
            }
        }
        correct_score.insert("other".to_string(), p(self.score_other));

        let mut total_goals = BTreeMap::new();
        for (i, &c) in self.totals.iter().enumerate() {
            let key = if i > MAX_TOTAL_TRACKED {
                format!("{}+", MAX_TOTAL_TRACKED + 1)
            } else {
                i.to_string()
            };
            total_goals.insert(key, p(c));
        }

        let last = self.totals.len() - 1;
        let range = |lo: usize, hi: usize| p(self.totals[lo..=hi.min(last)].iter().sum());
        let mut goal_ranges = BTreeMap::new();
        goal_ranges.insert("0-1".to_string(), range(0, 1));
        goal_ranges.insert("2-3".to_string(), range(2, 3));
        goal_ranges.insert("4-6".to_string(), range(4, 6));
        goal_ranges.insert("7+".to_string(), range(7, self.totals.len() - 1));

        let mut ht_ft = BTreeMap::new();
        for (i, ht) in RESULTS.iter().enumerate() {
            for (j, ft) in RESULTS.iter().enumerate() {
                ht_ft.insert(format!("{}/{}", ht.as_str(), ft.as_str()), p(self.ht_ft[i][j]));
            }
        }

        MarketProbabilities {
            mean_home_goals: p(self.home_goals),
            mean_away_goals: p(self.away_goals),
            double_chance: DoubleChance {
                home_draw: result_ft.home + result_ft.draw,
                home_away: result_ft.home + result_ft.away,
                draw_away: result_ft.draw + result_ft.away,
            },
            result_ft,
            result_ht,
            draw_no_bet,
            btts: YesNo {
                yes: p(self.btts),
                no: if n == 0 { 0.0 } else { p(n - self.btts) },
            },
            totals_ft: self.totals_ft.iter().map(|c| c.probabilities(n)).collect(),
            totals_ht: self.totals_ht.iter().map(|c| c.probabilities(n)).collect(),
            asian_handicap: self
                .handicaps
                .iter()
                .map(|c| {
                    // counters hold -h as the line; report the handicap itself
                    let mut lp = c.probabilities(n);
                    lp.line = opposite_line(lp.line);
                    lp
                })
                .collect(),
            correct_score,
            total_goals,
            goal_ranges,
            parity: OddEven {
                odd: p(self.odd_totals),
                even: if n == 0 { 0.0 } else { p(n - self.odd_totals) },
            },
            ht_ft,
        }
    }
}

// ── Probability tables ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThreeWay {
    pub home: f64,
    pub draw: f64,
    pub away: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DoubleChance {
    pub home_draw: f64,
    pub home_away: f64,
    pub draw_away: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DrawNoBet {
    /// Win probability with draws (refunds) excluded.
    pub home: f64,
    pub away: f64,
    pub push: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct YesNo {
    pub yes: f64,
    pub no: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OddEven {
    pub odd: f64,
    pub even: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketProbabilities {
    pub mean_home_goals: f64,
    pub mean_away_goals: f64,
    pub result_ft: ThreeWay,
    pub result_ht: ThreeWay,
    pub double_chance: DoubleChance,
    pub draw_no_bet: DrawNoBet,
    pub btts: YesNo,
    /// Over side; `mirror()` gives the under side.
    pub totals_ft: Vec<LineProbabilities>,
    pub totals_ht: Vec<LineProbabilities>,
    /// Home side at each home handicap; `mirror()` gives the away side.
    pub asian_handicap: Vec<LineProbabilities>,
    pub correct_score: BTreeMap<String, f64>,
    pub total_goals: BTreeMap<String, f64>,
    pub goal_ranges: BTreeMap<String, f64>,
    pub parity: OddEven,
    pub ht_ft: BTreeMap<String, f64>,
}

impl MarketProbabilities {
    pub fn total_line(&self, line: f64) -> Option<&LineProbabilities> {
        let q = to_quarters(line);
        self.totals_ft.iter().find(|l| to_quarters(l.line) == q)
    }

    pub fn handicap_line(&self, handicap: f64) -> Option<&LineProbabilities> {
        let q = to_quarters(handicap);
        self.asian_handicap.iter().find(|l| to_quarters(l.line) == q)
    }
}
