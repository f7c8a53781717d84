//! Inventory matching: scores catalog itineraries and supplier offers
//! against a customer's extracted request.
//!
//! Flow: gather (supplier offers, then catalog) → dedup → score → gate → rank → top 5.

pub mod engine;
pub mod scoring;
pub mod types;

pub use engine::{MAX_RESULTS, MIN_DESTINATION, MIN_TOTAL, MatchingEngine, rank};
pub use types::{MatchCandidate, MatchCriteria, MatchSummary, ScoreBreakdown};
