//! Fire-and-forget delivery of [`OutboundEvent`]s.
//
//  Redis channels
//  --------------
//  player:<user_id>:events – PUB/SUB channel for one-off pushes (JSON)

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use redis::{AsyncCommands, Client as RedisClient};
use uuid::Uuid;

use crate::error::EngineResult;
use crate::protocol::OutboundEvent;

pub fn channel(user_id: Uuid) -> String {
    format!("player:{user_id}:events")
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, user_id: Uuid, event: &OutboundEvent) -> EngineResult<()>;
}

pub struct RedisEventSink {
    client: RedisClient,
}

impl RedisEventSink {
    pub fn new(client: RedisClient) -> Self {
        RedisEventSink { client }
    }
}

#[async_trait]
impl EventSink for RedisEventSink {
    async fn publish(&self, user_id: Uuid, event: &OutboundEvent) -> EngineResult<()> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.publish(channel(user_id), payload).await?;
        Ok(())
    }
}

/// Records every published event; used by tests and memory-backed runs.
#[derive(Default)]
pub struct MemorySink {
    sent: Mutex<Vec<(Uuid, OutboundEvent)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(Uuid, OutboundEvent)> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn sent_to(&self, user_id: Uuid) -> Vec<OutboundEvent> {
        self.sent()
            .into_iter()
            .filter(|(u, _)| *u == user_id)
            .map(|(_, e)| e)
            .collect()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn publish(&self, user_id: Uuid, event: &OutboundEvent) -> EngineResult<()> {
        let mut sent = self.sent.lock().unwrap_or_else(|p| p.into_inner());
        sent.push((user_id, event.clone()));
        Ok(())
    }
}

/// Publish on a detached task. Failures are logged and never surface to the
/// caller.
pub fn emit(sink: Arc<dyn EventSink>, user_id: Uuid, event: OutboundEvent) {
    tokio::spawn(async move {
        if let Err(e) = sink.publish(user_id, &event).await {
            log::warn!("could not publish {} to {user_id}: {e}", event.kind());
        }
    });
}
