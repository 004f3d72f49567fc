//! Runtime configuration for the settlement engine.

use once_cell::sync::Lazy;
use std::env;
use std::time::Duration;

/// Where durable state lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Postgres for rows, Redis for queues, locks, cache and pub/sub.
    External,
    /// Everything in process. Single-node dev runs only.
    Memory,
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "external" => Ok(Backend::External),
            "memory" => Ok(Backend::Memory),
            other => Err(format!("unknown STORE_BACKEND {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub backend: Backend,
    pub database_url: String,
    pub redis_url: String,
    pub server_addr: String,
    pub db_max_connections: u32,

    /// Upper bound for the settlement commit transaction.
    pub settlement_timeout: Duration,
    /// How long a match may stay `active` before the postponement scan acts.
    pub postponement_timeout: chrono::Duration,
    pub postponement_scan_every: Duration,
    /// Window in which identical score-feed updates are dropped.
    pub live_score_dedup: Duration,

    pub matchmaking_interval: Duration,
    pub matchmaking_batch: i64,
    pub matchmaking_claim_ttl: Duration,
    /// Width of a skill band, in rating points.
    pub matchmaking_skill_band: i32,

    pub leaderboard_top_n: usize,
    pub leaderboard_cache_ttl: Duration,

    pub decay_inactive_days: i64,
    pub decay_points: i32,
    pub season_grace: Duration,
    pub season_lock_ttl: Duration,

    pub job_max_attempts: u32,
    /// Jobs whose lease runs out are considered stalled and re-queued.
    pub job_lease: Duration,
    pub worker_poll_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            backend: Backend::External,
            database_url: String::new(),
            redis_url: "redis://127.0.0.1/".into(),
            server_addr: "127.0.0.1:8080".into(),
            db_max_connections: 10,
            settlement_timeout: Duration::from_secs(10),
            postponement_timeout: chrono::Duration::hours(48),
            postponement_scan_every: Duration::from_secs(600),
            live_score_dedup: Duration::from_secs(30),
            matchmaking_interval: Duration::from_secs(5),
            matchmaking_batch: 100,
            matchmaking_claim_ttl: Duration::from_secs(30),
            matchmaking_skill_band: 200,
            leaderboard_top_n: 100,
            leaderboard_cache_ttl: Duration::from_secs(300),
            decay_inactive_days: 7,
            decay_points: 15,
            season_grace: Duration::from_secs(3600),
            season_lock_ttl: Duration::from_secs(120),
            job_max_attempts: 3,
            job_lease: Duration::from_secs(60),
            worker_poll_interval: Duration::from_millis(250),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let d = Settings::default();

        Settings {
            backend: env_parse("STORE_BACKEND", d.backend),
            database_url: env::var("DATABASE_URL").unwrap_or(d.database_url),
            redis_url: env::var("REDIS_URL").unwrap_or(d.redis_url),
            server_addr: env::var("SERVER_ADDR").unwrap_or(d.server_addr),
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", d.db_max_connections),
            settlement_timeout: secs("SETTLEMENT_TIMEOUT_SECS", d.settlement_timeout),
            postponement_timeout: chrono::Duration::hours(env_parse(
                "POSTPONEMENT_TIMEOUT_HOURS",
                d.postponement_timeout.num_hours(),
            )),
            postponement_scan_every: secs("POSTPONEMENT_SCAN_SECS", d.postponement_scan_every),
            live_score_dedup: secs("LIVE_SCORE_DEDUP_SECS", d.live_score_dedup),
            matchmaking_interval: secs("MATCHMAKING_INTERVAL_SECS", d.matchmaking_interval),
            matchmaking_batch: env_parse("MATCHMAKING_BATCH", d.matchmaking_batch),
            matchmaking_claim_ttl: secs("MATCHMAKING_CLAIM_SECS", d.matchmaking_claim_ttl),
            matchmaking_skill_band: env_parse("MATCHMAKING_SKILL_BAND", d.matchmaking_skill_band)
                .max(1),
            leaderboard_top_n: env_parse("LEADERBOARD_TOP_N", d.leaderboard_top_n),
            leaderboard_cache_ttl: secs("LEADERBOARD_CACHE_TTL_SECS", d.leaderboard_cache_ttl),
            decay_inactive_days: env_parse("DECAY_INACTIVE_DAYS", d.decay_inactive_days),
            decay_points: env_parse("DECAY_POINTS", d.decay_points),
            season_grace: secs("SEASON_GRACE_SECS", d.season_grace),
            season_lock_ttl: secs("SEASON_LOCK_TTL_SECS", d.season_lock_ttl),
            job_max_attempts: env_parse("JOB_MAX_ATTEMPTS", d.job_max_attempts).max(1),
            job_lease: secs("JOB_LEASE_SECS", d.job_lease),
            worker_poll_interval: Duration::from_millis(env_parse(
                "WORKER_POLL_MS",
                d.worker_poll_interval.as_millis() as u64,
            )),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_parse(key, default.as_secs()))
}

static SETTINGS: Lazy<Settings> = Lazy::new(Settings::from_env);

/// Process-wide settings, read once from the environment.
pub fn settings() -> &'static Settings {
    &SETTINGS
}
