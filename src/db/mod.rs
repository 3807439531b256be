use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};

pub mod models;
use models::*;

use crate::models::MatchResult;
use crate::pattern::encoder::{segment_similarity, PatternFingerprint};

/// Lookups the evidence layer needs from pattern storage
pub trait PatternStore: Send + Sync {
    fn find_exact_match(&self, pattern_id: &str) -> Result<Option<PatternStatistics>>;

    fn find_similar_matches(
        &self,
        pattern_id: &str,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<SimilarPattern>>;
}

/// Outcome rows shown in a pattern report
const REPORT_RECENT_OUTCOMES: i64 = 10;

/// Registry row, statistics, raw outcome count and latest outcomes for one pattern
#[derive(Debug, Clone, Serialize)]
pub struct PatternReport {
    pub pattern: Option<RegisteredPattern>,
    pub statistics: Option<PatternStatistics>,
    pub outcomes: u64,
    pub recent: Vec<PatternOutcomeRecord>,
}

/// Thread-safe SQLite handle (single connection with mutex)
#[derive(Clone, Debug)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open pattern database at {}", path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    /// Private in-memory database, used by tests and `--no-database` dry runs
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("pattern database mutex poisoned"))
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // ── Registry ─────────────────────────────────────────────────────────────

    /// Insert a fingerprint, or bump `seen_count` if it is already known
    pub fn register_pattern(&self, fp: &PatternFingerprint) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO pattern_registry (
                pattern_id, complexity, h2h_fingerprint, home_fingerprint,
                away_fingerprint, confidence, seen_count, first_seen, last_seen
             ) VALUES (?1,?2,?3,?4,?5,?6,1,?7,?7)
             ON CONFLICT(pattern_id) DO UPDATE SET
                seen_count = seen_count + 1,
                confidence = excluded.confidence,
                last_seen  = excluded.last_seen",
            params![
                fp.unique_pattern_id,
                fp.complexity.as_str(),
                fp.h2h_fingerprint,
                fp.home_fingerprint,
                fp.away_fingerprint,
                fp.confidence,
                Utc::now(),
            ],
        )?;
        Ok(())
    }

    pub fn get_pattern(&self, pattern_id: &str) -> Result<Option<RegisteredPattern>> {
        let conn = self.lock()?;
        let pattern = conn
            .query_row(
                "SELECT pattern_id, complexity, h2h_fingerprint, home_fingerprint,
                        away_fingerprint, confidence, seen_count, first_seen, last_seen
                 FROM pattern_registry WHERE pattern_id = ?1",
                params![pattern_id],
                map_registered,
            )
            .optional()?;
        Ok(pattern)
    }

    // ── Outcomes ─────────────────────────────────────────────────────────────

    /// Append one outcome row
    pub fn store_outcome(&self, record: &PatternOutcomeRecord) -> Result<i64> {
        let conn = self.lock()?;
        insert_outcome(&conn, record)?;
        Ok(conn.last_insert_rowid())
    }

    /// Append a batch of outcome rows in one transaction
    pub fn store_outcomes(&self, records: &[PatternOutcomeRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for record in records {
            insert_outcome(&tx, record)?;
        }
        tx.commit()?;
        Ok(records.len())
    }

    pub fn count_outcomes(&self, pattern_id: &str) -> Result<u64> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pattern_outcomes WHERE pattern_id = ?1",
            params![pattern_id],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// Most recent outcome rows for a pattern
    pub fn list_outcomes(&self, pattern_id: &str, limit: i64) -> Result<Vec<PatternOutcomeRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, pattern_id, home_goals, away_goals, result, btts,
                    over_05, over_15, over_25, over_35, over_45,
                    exact_score, iteration, origin, created_at
             FROM pattern_outcomes WHERE pattern_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let outcomes = stmt
            .query_map(params![pattern_id, limit], map_outcome)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(outcomes)
    }

    // ── Statistics ───────────────────────────────────────────────────────────

    /// Rebuild the statistics row from every outcome currently stored.
    /// Idempotent: running it twice without new outcomes changes nothing but
    /// `last_updated`.
    pub fn recalculate_statistics(&self, pattern_id: &str) -> Result<Option<PatternStatistics>> {
        {
            let conn = self.lock()?;
            conn.execute(RECALCULATE_SQL, params![pattern_id, Utc::now()])?;
        }
        self.find_exact_match(pattern_id)
    }

    /// Primary-key lookup of a pattern's statistics
    pub fn find_exact_match(&self, pattern_id: &str) -> Result<Option<PatternStatistics>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM pattern_statistics WHERE pattern_id = ?1",
            STATISTICS_COLUMNS
        );
        let stats = conn
            .query_row(
                &sql,
                params![pattern_id],
                |row| map_statistics(row, 0),
            )
            .optional()?;
        Ok(stats)
    }

    /// Registered patterns of the same complexity with statistics, ranked by
    /// similarity then by sample size. Unknown ids yield an empty list.
    pub fn find_similar_matches(
        &self,
        pattern_id: &str,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<SimilarPattern>> {
        let target = match self.get_pattern(pattern_id)? {
            Some(p) => p,
            None => return Ok(Vec::new()),
        };
        let target_segments = [
            target.h2h_fingerprint.as_str(),
            target.home_fingerprint.as_str(),
            target.away_fingerprint.as_str(),
        ];

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT r.h2h_fingerprint, r.home_fingerprint, r.away_fingerprint, {}
             FROM pattern_registry r
             JOIN pattern_statistics s ON s.pattern_id = r.pattern_id
             WHERE r.complexity = ?1 AND r.pattern_id <> ?2",
            STATISTICS_COLUMNS
                .split(',')
                .map(|c| format!("s.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        ))?;
        let rows = stmt
            .query_map(params![target.complexity, pattern_id], |row| {
                let segments: (String, String, String) = (row.get(0)?, row.get(1)?, row.get(2)?);
                Ok((segments, map_statistics(row, 3)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut similar: Vec<SimilarPattern> = rows
            .into_iter()
            .filter_map(|((h2h, home, away), statistics)| {
                let segments = [h2h.as_str(), home.as_str(), away.as_str()];
                let similarity = segment_similarity(target_segments, segments);
                (similarity >= threshold).then(|| SimilarPattern {
                    pattern_id: statistics.pattern_id.clone(),
                    similarity,
                    statistics,
                })
            })
            .collect();
        similar.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.statistics.occurrence_count.cmp(&a.statistics.occurrence_count))
                .then(a.pattern_id.cmp(&b.pattern_id))
        });
        similar.truncate(limit);
        Ok(similar)
    }

    /// Everything known about one pattern
    pub fn pattern_stats(&self, pattern_id: &str) -> Result<PatternReport> {
        Ok(PatternReport {
            pattern: self.get_pattern(pattern_id)?,
            statistics: self.find_exact_match(pattern_id)?,
            outcomes: self.count_outcomes(pattern_id)?,
            recent: self.list_outcomes(pattern_id, REPORT_RECENT_OUTCOMES)?,
        })
    }
}

impl PatternStore for Database {
    fn find_exact_match(&self, pattern_id: &str) -> Result<Option<PatternStatistics>> {
        Database::find_exact_match(self, pattern_id)
    }

    fn find_similar_matches(
        &self,
        pattern_id: &str,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<SimilarPattern>> {
        Database::find_similar_matches(self, pattern_id, threshold, limit)
    }
}

// ── Row helpers ──────────────────────────────────────────────────────────────

fn insert_outcome(conn: &Connection, r: &PatternOutcomeRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO pattern_outcomes (
            pattern_id, home_goals, away_goals, result, btts,
            over_05, over_15, over_25, over_35, over_45,
            exact_score, iteration, origin, created_at
         ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
        params![
            r.pattern_id,
            r.home_goals,
            r.away_goals,
            r.result.as_str(),
            r.btts,
            r.over_05,
            r.over_15,
            r.over_25,
            r.over_35,
            r.over_45,
            r.exact_score,
            r.iteration.map(|i| i as i64),
            r.origin.as_str(),
            r.created_at,
        ],
    )?;
    Ok(())
}

fn map_registered(row: &rusqlite::Row) -> rusqlite::Result<RegisteredPattern> {
    let seen: i64 = row.get(6)?;
    Ok(RegisteredPattern {
        pattern_id: row.get(0)?,
        complexity: row.get(1)?,
        h2h_fingerprint: row.get(2)?,
        home_fingerprint: row.get(3)?,
        away_fingerprint: row.get(4)?,
        confidence: row.get(5)?,
        seen_count: seen as u64,
        first_seen: row.get(7)?,
        last_seen: row.get(8)?,
    })
}

fn map_outcome(row: &rusqlite::Row) -> rusqlite::Result<PatternOutcomeRecord> {
    let result: String = row.get(4)?;
    let origin: String = row.get(13)?;
    let iteration: Option<i64> = row.get(12)?;
    Ok(PatternOutcomeRecord {
        id: row.get(0)?,
        pattern_id: row.get(1)?,
        home_goals: row.get(2)?,
        away_goals: row.get(3)?,
        result: MatchResult::parse(&result)
            .ok_or_else(|| rusqlite::Error::InvalidColumnType(4, "result".into(), Type::Text))?,
        btts: row.get(5)?,
        over_05: row.get(6)?,
        over_15: row.get(7)?,
        over_25: row.get(8)?,
        over_35: row.get(9)?,
        over_45: row.get(10)?,
        exact_score: row.get(11)?,
        iteration: iteration.map(|i| i as u64),
        origin: OutcomeOrigin::parse(&origin)
            .ok_or_else(|| rusqlite::Error::InvalidColumnType(13, "origin".into(), Type::Text))?,
        created_at: row.get(14)?,
    })
}

const STATISTICS_COLUMNS: &str = "pattern_id, occurrence_count, avg_home_goals, avg_away_goals, \
    avg_total_goals, home_win_rate, draw_rate, away_win_rate, btts_rate, over_05_rate, \
    over_15_rate, over_25_rate, over_35_rate, over_45_rate, confidence_score, last_updated";

/// Map `STATISTICS_COLUMNS` starting at column `at`
fn map_statistics(row: &rusqlite::Row, at: usize) -> rusqlite::Result<PatternStatistics> {
    let count: i64 = row.get(at + 1)?;
    Ok(PatternStatistics {
        pattern_id: row.get(at)?,
        occurrence_count: count as u64,
        avg_home_goals: row.get(at + 2)?,
        avg_away_goals: row.get(at + 3)?,
        avg_total_goals: row.get(at + 4)?,
        home_win_rate: row.get(at + 5)?,
        draw_rate: row.get(at + 6)?,
        away_win_rate: row.get(at + 7)?,
        btts_rate: row.get(at + 8)?,
        over_05_rate: row.get(at + 9)?,
        over_15_rate: row.get(at + 10)?,
        over_25_rate: row.get(at + 11)?,
        over_35_rate: row.get(at + 12)?,
        over_45_rate: row.get(at + 13)?,
        confidence_score: row.get(at + 14)?,
        last_updated: row.get(at + 15)?,
    })
}

// ── Schema ───────────────────────────────────────────────────────────────────

const RECALCULATE_SQL: &str = r#"
INSERT INTO pattern_statistics (
    pattern_id, occurrence_count, avg_home_goals, avg_away_goals, avg_total_goals,
    home_win_rate, draw_rate, away_win_rate, btts_rate,
    over_05_rate, over_15_rate, over_25_rate, over_35_rate, over_45_rate,
    confidence_score, last_updated
)
SELECT
    pattern_id,
    COUNT(*),
    AVG(home_goals * 1.0),
    AVG(away_goals * 1.0),
    AVG((home_goals + away_goals) * 1.0),
    AVG(CASE WHEN result = 'home' THEN 1.0 ELSE 0.0 END),
    AVG(CASE WHEN result = 'draw' THEN 1.0 ELSE 0.0 END),
    AVG(CASE WHEN result = 'away' THEN 1.0 ELSE 0.0 END),
    AVG(btts * 1.0),
    AVG(over_05 * 1.0),
    AVG(over_15 * 1.0),
    AVG(over_25 * 1.0),
    AVG(over_35 * 1.0),
    AVG(over_45 * 1.0),
    MIN(0.95, 0.5 + (COUNT(*) / 1000.0) * 0.45),
    ?2
FROM pattern_outcomes
WHERE pattern_id = ?1
GROUP BY pattern_id
ON CONFLICT(pattern_id) DO UPDATE SET
    occurrence_count = excluded.occurrence_count,
    avg_home_goals   = excluded.avg_home_goals,
    avg_away_goals   = excluded.avg_away_goals,
    avg_total_goals  = excluded.avg_total_goals,
    home_win_rate    = excluded.home_win_rate,
    draw_rate        = excluded.draw_rate,
    away_win_rate    = excluded.away_win_rate,
    btts_rate        = excluded.btts_rate,
    over_05_rate     = excluded.over_05_rate,
    over_15_rate     = excluded.over_15_rate,
    over_25_rate     = excluded.over_25_rate,
    over_35_rate     = excluded.over_35_rate,
    over_45_rate     = excluded.over_45_rate,
    confidence_score = excluded.confidence_score,
    last_updated     = excluded.last_updated
"#;

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS pattern_registry (
    pattern_id       TEXT    PRIMARY KEY,
    complexity       TEXT    NOT NULL,
    h2h_fingerprint  TEXT    NOT NULL,
    home_fingerprint TEXT    NOT NULL,
    away_fingerprint TEXT    NOT NULL,
    confidence       REAL    NOT NULL,
    seen_count       INTEGER NOT NULL DEFAULT 1,
    first_seen       TEXT    NOT NULL,
    last_seen        TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pattern_registry_complexity ON pattern_registry(complexity);

CREATE TABLE IF NOT EXISTS pattern_outcomes (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    pattern_id  TEXT    NOT NULL,
    home_goals  INTEGER NOT NULL,
    away_goals  INTEGER NOT NULL,
    result      TEXT    NOT NULL,
    btts        INTEGER NOT NULL,
    over_05     INTEGER NOT NULL,
    over_15     INTEGER NOT NULL,
    over_25     INTEGER NOT NULL,
    over_35     INTEGER NOT NULL,
    over_45     INTEGER NOT NULL,
    exact_score TEXT    NOT NULL,
    iteration   INTEGER,
    origin      TEXT    NOT NULL DEFAULT 'simulated',
    created_at  TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pattern_outcomes_pattern ON pattern_outcomes(pattern_id);

CREATE TABLE IF NOT EXISTS pattern_statistics (
    pattern_id       TEXT    PRIMARY KEY,
    occurrence_count INTEGER NOT NULL,
    avg_home_goals   REAL    NOT NULL,
    avg_away_goals   REAL    NOT NULL,
    avg_total_goals  REAL    NOT NULL,
    home_win_rate    REAL    NOT NULL,
    draw_rate        REAL    NOT NULL,
    away_win_rate    REAL    NOT NULL,
    btts_rate        REAL    NOT NULL,
    over_05_rate     REAL    NOT NULL,
    over_15_rate     REAL    NOT NULL,
    over_25_rate     REAL    NOT NULL,
    over_35_rate     REAL    NOT NULL,
    over_45_rate     REAL    NOT NULL,
    confidence_score REAL    NOT NULL,
    last_updated     TEXT    NOT NULL
);
"#;
