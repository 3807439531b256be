//! Football match prediction: Monte Carlo goal simulation with boost and
//! mean-reversion adjustments, pattern fingerprinting and evidence lookup
//! against a SQLite outcome store, and market pricing with edge detection.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod models;
pub mod pattern;

pub use engine::{MatchPrediction, PredictionEngine};
pub use error::{EngineError, EngineResult};
pub use models::{HistoricalMatch, MatchHistory, MatchRequest};
