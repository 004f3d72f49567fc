//! Match lifecycle and settlement engine.
//!
//! Head-to-head pick matches are paired, activated when their events start,
//! settled or voided once every event resolves, and folded into season and
//! leaderboard standings. All long-running work runs as queued jobs.

pub mod app;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod idempotency;
pub mod leaderboard;
pub mod lock;
pub mod matchmaking;
pub mod metrics;
pub mod notify;
pub mod protocol;
pub mod queue;
pub mod season;
pub mod settlement;
pub mod standings;
