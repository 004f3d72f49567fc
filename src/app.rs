//! Construction and wiring of every engine component.
//!
//! Backends are built once and injected; nothing below this module reaches
//! for a global handle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use redis::{AsyncCommands, Client as RedisClient};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::Settings;
use crate::db::{MemoryStore, PgStore, Store};
use crate::leaderboard::{LeaderboardService, MemoryRankingCache, RankingCache, RedisRankingCache};
use crate::lock::{DistributedLock, MemoryLock, RedisLock};
use crate::matchmaking::MatchmakingProcessor;
use crate::notify::{EventSink, MemorySink, RedisEventSink};
use crate::queue::{
    self, jobs, JobProcessor, JobQueue, MemoryQueue, RedisQueue, RepeatSpec, RetryPolicy, Worker,
    WorkerPool,
};
use crate::season::SeasonProgression;
use crate::settlement::{CorrectPickEvaluator, SettlementOrchestrator, SettlementService};
use crate::standings::StandingsProcessor;

/// Concurrency and retry base delay per queue.
pub const QUEUES: [(&str, usize, Duration); 5] = [
    (queue::SETTLEMENT, 1, Duration::from_secs(1)),
    (queue::MATCHMAKING, 1, Duration::from_secs(1)),
    (queue::STANDINGS, 2, Duration::from_secs(2)),
    (queue::LEADERBOARD, 4, Duration::from_secs(5)),
    (queue::SEASON, 1, Duration::from_secs(10)),
];

/// How often the repeat scheduler looks for due slots.
const SCHEDULER_TICK: Duration = Duration::from_secs(1);

pub struct Backends {
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn JobQueue>,
    pub lock: Arc<dyn DistributedLock>,
    pub cache: Arc<dyn RankingCache>,
    pub sink: Arc<dyn EventSink>,
}

/// Concrete in-memory backends, kept so tests can inspect them.
#[derive(Clone)]
pub struct MemoryBackends {
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryQueue>,
    pub lock: Arc<MemoryLock>,
    pub cache: Arc<MemoryRankingCache>,
    pub sink: Arc<MemorySink>,
}

impl MemoryBackends {
    pub fn new() -> Self {
        MemoryBackends {
            store: Arc::new(MemoryStore::new()),
            queue: Arc::new(MemoryQueue::new()),
            lock: Arc::new(MemoryLock::new()),
            cache: Arc::new(MemoryRankingCache::new()),
            sink: Arc::new(MemorySink::new()),
        }
    }

    fn erased(&self) -> Backends {
        Backends {
            store: self.store.clone(),
            queue: self.queue.clone(),
            lock: self.lock.clone(),
            cache: self.cache.clone(),
            sink: self.sink.clone(),
        }
    }
}

impl Default for MemoryBackends {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct Engine {
    pub settings: Settings,
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn JobQueue>,
    pub settlement: Arc<SettlementService>,
    pub orchestrator: Arc<SettlementOrchestrator>,
    pub matchmaking: Arc<MatchmakingProcessor>,
    pub leaderboards: Arc<LeaderboardService>,
    pub seasons: Arc<SeasonProgression>,
    pub standings: Arc<StandingsProcessor>,
    db: Option<PgPool>,
    redis: Option<RedisClient>,
}

impl Engine {
    pub fn new(settings: Settings, b: Backends) -> Self {
        let settlement = Arc::new(SettlementService::new(
            b.store.clone(),
            Arc::new(CorrectPickEvaluator),
        ));
        let orchestrator = Arc::new(SettlementOrchestrator::new(
            b.store.clone(),
            b.queue.clone(),
            settlement.clone(),
            b.sink.clone(),
            settings.clone(),
        ));
        let matchmaking = Arc::new(MatchmakingProcessor::new(
            b.store.clone(),
            b.sink.clone(),
            settings.clone(),
        ));
        let leaderboards = Arc::new(LeaderboardService::new(
            b.store.clone(),
            b.cache.clone(),
            b.lock.clone(),
            settings.clone(),
        ));
        let seasons = Arc::new(SeasonProgression::new(
            b.store.clone(),
            b.queue.clone(),
            b.lock.clone(),
            b.sink.clone(),
            settings.clone(),
        ));
        let standings = Arc::new(StandingsProcessor::new(b.store.clone(), b.queue.clone()));

        Engine {
            settings,
            store: b.store,
            queue: b.queue,
            settlement,
            orchestrator,
            matchmaking,
            leaderboards,
            seasons,
            standings,
            db: None,
            redis: None,
        }
    }

    /// Everything in process.
    pub fn in_memory(settings: Settings) -> (Self, MemoryBackends) {
        let mem = MemoryBackends::new();
        (Engine::new(settings, mem.erased()), mem)
    }

    /// Postgres + Redis, with migrations applied.
    pub async fn connect(settings: Settings) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.db_max_connections)
            .connect(&settings.database_url)
            .await
            .context("Failed to create Postgres pool")?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;
        let redis = RedisClient::open(settings.redis_url.as_str()).context("Invalid REDIS_URL")?;

        let backends = Backends {
            store: Arc::new(PgStore::new(pool.clone(), settings.settlement_timeout)),
            queue: Arc::new(RedisQueue::new(redis.clone())),
            lock: Arc::new(RedisLock::new(redis.clone())),
            cache: Arc::new(RedisRankingCache::new(redis.clone())),
            sink: Arc::new(RedisEventSink::new(redis.clone())),
        };
        let mut engine = Engine::new(settings, backends);
        engine.db = Some(pool);
        engine.redis = Some(redis);
        Ok(engine)
    }

    fn processor_for(&self, queue_name: &str) -> Option<Arc<dyn JobProcessor>> {
        let p: Arc<dyn JobProcessor> = match queue_name {
            queue::SETTLEMENT => self.orchestrator.clone(),
            queue::MATCHMAKING => self.matchmaking.clone(),
            queue::STANDINGS => self.standings.clone(),
            queue::LEADERBOARD => self.leaderboards.clone(),
            queue::SEASON => self.seasons.clone(),
            _ => return None,
        };
        Some(p)
    }

    /// Worker for one queue, configured from [`QUEUES`].
    pub fn worker(&self, queue_name: &str) -> Option<Worker> {
        let (name, concurrency, base_delay) =
            QUEUES.iter().copied().find(|(n, _, _)| *n == queue_name)?;
        let processor = self.processor_for(name)?;
        let policy = RetryPolicy::new(base_delay, self.settings.job_max_attempts);
        Some(
            Worker::new(self.queue.clone(), name, concurrency, policy, processor)
                .with_lease(self.settings.job_lease)
                .with_poll_interval(self.settings.worker_poll_interval),
        )
    }

    pub fn repeat_specs(&self) -> Vec<RepeatSpec> {
        let s = &self.settings;
        vec![
            RepeatSpec::new(queue::SETTLEMENT, jobs::POSTPONEMENT_SCAN, s.postponement_scan_every),
            RepeatSpec::new(queue::MATCHMAKING, jobs::MATCHMAKING_RUN, s.matchmaking_interval),
            RepeatSpec::new(queue::LEADERBOARD, jobs::WEEKLY_RESET, Duration::from_secs(3600)),
            RepeatSpec::new(queue::SEASON, jobs::DAILY_DECAY, Duration::from_secs(3600)),
            RepeatSpec::new(queue::SEASON, jobs::SEASON_END_CHECK, Duration::from_secs(300)),
        ]
    }

    /// One worker per queue plus the repeat scheduler.
    pub fn spawn_workers(&self) -> WorkerPool {
        let mut pool = WorkerPool::new();
        for (name, _, _) in QUEUES {
            if let Some(worker) = self.worker(name) {
                pool.spawn(worker);
            }
        }
        pool.spawn_scheduler(self.queue.clone(), self.repeat_specs(), SCHEDULER_TICK);
        pool
    }

    /// Probe the external backends, naming the first that fails.
    pub async fn health(&self) -> Result<(), &'static str> {
        if let Some(db) = &self.db {
            if sqlx::query("SELECT 1").execute(db).await.is_err() {
                return Err("db");
            }
        }
        if let Some(redis) = &self.redis {
            let mut conn = redis
                .get_multiplexed_async_connection()
                .await
                .map_err(|_| "redis")?;
            if conn.ping::<String>().await.is_err() {
                return Err("redis");
            }
        }
        Ok(())
    }
}
