use approx::assert_relative_eq;

use goalcast::db::models::OutcomeOrigin;
use goalcast::db::Database;
use goalcast::engine::montecarlo::{CancelToken, OutcomeSink, RunStatus};
use goalcast::engine::settings::IntegrationMode;
use goalcast::engine::{PredictionEngine, PredictionPath};
use goalcast::pattern::evidence::EvidenceSource;
use goalcast::pattern::recorder::start_recorder;
use goalcast::{HistoricalMatch, MatchHistory, MatchRequest};

fn m(h: u8, a: u8) -> HistoricalMatch {
    HistoricalMatch::new(h, a)
}

fn request(iterations: u64, seed: u64) -> MatchRequest {
    let mut req = MatchRequest {
        home_team: Some("Rovers".into()),
        away_team: Some("United".into()),
        history: MatchHistory {
            h2h: vec![m(2, 1), m(1, 1), m(3, 0), m(0, 2), m(2, 2)],
            home: vec![m(2, 0), m(1, 0), m(3, 1), m(1, 1), m(2, 1)],
            away: vec![m(1, 1), m(2, 0), m(0, 1), m(3, 2), m(1, 0)],
        },
        ..Default::default()
    };
    req.config.iterations = iterations;
    req.config.seed = Some(seed);
    req.config.record_every = 0;
    req
}

fn three_way_sum(p: &goalcast::MatchPrediction, prefix: &str) -> f64 {
    ["home", "draw", "away"]
        .iter()
        .map(|o| p.selection(&format!("{}.{}", prefix, o)).unwrap().probability)
        .sum()
}

#[test]
fn simulation_only_prediction() {
    let engine = PredictionEngine::new(None);
    let req = request(20_000, 42);
    let p = engine.predict(&req, None, None).unwrap();

    assert_eq!(p.provenance.path, PredictionPath::Simulation);
    assert!(!p.provenance.database_available);
    assert!(!p.provenance.warnings.is_empty());
    assert_eq!(p.evidence.source, EvidenceSource::Fallback);
    assert_eq!(p.distribution.status, RunStatus::Complete);
    assert_eq!(p.distribution.iterations_completed, 20_000);
    assert!(p.pattern.valid_for_matching);

    assert_relative_eq!(three_way_sum(&p, "1x2_ft"), 1.0, epsilon = 1e-9);
    assert_relative_eq!(three_way_sum(&p, "1x2_ht"), 1.0, epsilon = 1e-9);
    let yes = p.selection("btts.yes").unwrap().probability;
    let no = p.selection("btts.no").unwrap().probability;
    assert_relative_eq!(yes + no, 1.0, epsilon = 1e-9);

    // 20k iterations, five h2h and five per team
    assert_relative_eq!(p.confidence, 0.70, epsilon = 1e-12);
}

#[test]
fn same_seed_same_prediction() {
    let engine = PredictionEngine::new(None).with_threads(3).unwrap();
    let single = PredictionEngine::new(None).with_threads(1).unwrap();
    let req = request(15_000, 7);
    let a = engine.predict(&req, None, None).unwrap();
    let b = single.predict(&req, None, None).unwrap();
    assert_eq!(a.distribution.markets, b.distribution.markets);
    assert_eq!(a.pattern.unique_pattern_id, b.pattern.unique_pattern_id);
}

#[test]
fn bookmaker_odds_produce_value_bets_and_warnings() {
    let engine = PredictionEngine::new(None);
    let mut req = request(10_000, 3);
    req.bookmaker_odds.insert("1x2_ft.home".into(), 50.0);
    req.bookmaker_odds.insert("1x2_ft.away".into(), 1.01);
    req.bookmaker_odds.insert("corners.over_9".into(), 1.9);
    let p = engine.predict(&req, None, None).unwrap();

    assert_eq!(p.value_bets.len(), 1);
    assert_eq!(p.value_bets[0].key, "1x2_ft.home");
    assert!(p.value_bets[0].kelly_stake > 0.0);
    let away = p.selection("1x2_ft.away").unwrap();
    assert!(away.edge.unwrap() < 0.0);
    assert!(p.provenance.warnings.iter().any(|w| w.contains("corners.over_9")));
}

#[test]
fn invalid_configuration_is_fatal() {
    let engine = PredictionEngine::new(None);
    let mut req = request(0, 1);
    req.config.iterations = 0;
    let err = engine.predict(&req, None, None).unwrap_err();
    assert!(err.is_fatal());
}

#[test]
fn cancelled_prediction_reports_partial_status() {
    let engine = PredictionEngine::new(None);
    let req = request(10_000, 5);
    let cancel = CancelToken::new();
    cancel.cancel();
    let p = engine.predict(&req, Some(&cancel), None).unwrap();
    assert_eq!(p.distribution.status, RunStatus::Cancelled);
    assert_eq!(p.distribution.iterations_completed, 0);
    assert!(p.provenance.warnings.iter().any(|w| w.contains("Cancelled")));
}

#[tokio::test]
async fn recorded_simulations_become_exact_evidence() {
    let db = Database::open_in_memory().unwrap();
    let (recorder, task) = start_recorder(db.clone());
    let engine = PredictionEngine::new(Some(db.clone()));

    let mut req = request(50_000, 11);
    req.config.record_every = 100;
    req.config.evidence.mode = IntegrationMode::Replace;

    let first = engine
        .predict(&req, None, Some(&recorder as &dyn OutcomeSink))
        .unwrap();
    assert_eq!(first.provenance.path, PredictionPath::Simulation);
    assert!(first.provenance.database_available);
    assert_eq!(first.evidence.source, EvidenceSource::Fallback);

    recorder.flush().await.unwrap();
    let id = first.pattern.unique_pattern_id.clone();
    let stats = db.find_exact_match(&id).unwrap().unwrap();
    assert_eq!(stats.occurrence_count, 500);
    assert_eq!(db.get_pattern(&id).unwrap().unwrap().seen_count, 1);

    let second = engine.predict(&req, None, None).unwrap();
    assert_eq!(second.provenance.path, PredictionPath::ExactEvidence);
    assert_eq!(second.evidence.sample_size, 500);
    assert_relative_eq!(second.lambdas.home.pre_chaos(), stats.avg_home_goals, epsilon = 1e-9);
    assert_relative_eq!(second.lambdas.away.pre_chaos(), stats.avg_away_goals, epsilon = 1e-9);
    // iterations bonus, both data bonuses and exact evidence
    assert_relative_eq!(second.confidence, 0.75, epsilon = 1e-12);
    assert_eq!(db.get_pattern(&id).unwrap().unwrap().seen_count, 2);

    recorder.shutdown().await.unwrap();
    assert_eq!(task.await.unwrap().stored, 500);
}

#[tokio::test]
async fn stopped_recorder_shows_in_provenance() {
    let db = Database::open_in_memory().unwrap();
    let (recorder, task) = start_recorder(db.clone());
    let sink = recorder.clone();
    recorder.shutdown().await.unwrap();
    task.await.unwrap();

    let engine = PredictionEngine::new(Some(db.clone()));
    let mut req = request(10_000, 13);
    req.config.record_every = 10;
    let p = engine.predict(&req, None, Some(&sink as &dyn OutcomeSink)).unwrap();

    assert_eq!(p.distribution.status, RunStatus::Complete);
    assert_eq!(p.distribution.recording.sent, 0);
    assert_eq!(p.distribution.recording.dropped, 1_000);
    let warnings = &p.provenance.warnings;
    let lost = warnings.iter().find(|w| w.contains("were not recorded")).unwrap();
    assert!(lost.starts_with("1000 simulated outcome(s)"));
    assert!(lost.contains("recorder has stopped"));
    assert_eq!(db.count_outcomes(&p.pattern.unique_pattern_id).unwrap(), 0);
}

#[test]
fn database_open_error_is_reported_not_hidden() {
    let missing = std::env::temp_dir()
        .join("goalcast-no-such-dir")
        .join("nested")
        .join("patterns.db");
    let err = Database::open(missing.to_str().unwrap()).unwrap_err();
    let engine = PredictionEngine::without_database(err);
    let p = engine.predict(&request(5_000, 2), None, None).unwrap();

    assert!(!p.provenance.database_available);
    assert_eq!(p.provenance.path, PredictionPath::Simulation);
    assert!(p.provenance.warnings[0].starts_with("pattern database unavailable: "));
    assert!(!p.provenance.warnings.iter().any(|w| w.contains("not configured")));
}

#[test]
fn observed_results_are_stored_under_the_fingerprint() {
    let db = Database::open_in_memory().unwrap();
    let engine = PredictionEngine::new(Some(db.clone()));
    let req = request(1_000, 1);

    let (pattern, stats) = engine.record_result(&req, 2, 1).unwrap();
    let stats = stats.unwrap();
    assert_eq!(stats.occurrence_count, 1);
    assert_relative_eq!(stats.home_win_rate, 1.0);
    assert_relative_eq!(stats.avg_total_goals, 3.0);

    let report = db.pattern_stats(&pattern.unique_pattern_id).unwrap();
    assert_eq!(report.outcomes, 1);
    assert!(report.pattern.is_some());
    assert_eq!(report.recent.len(), 1);
    assert_eq!(report.recent[0].origin, OutcomeOrigin::Observed);
    assert_eq!(report.recent[0].exact_score, "2-1");
}

#[test]
fn record_result_without_database_fails() {
    let engine = PredictionEngine::new(None);
    assert!(engine.record_result(&request(1_000, 1), 1, 0).is_err());
}
