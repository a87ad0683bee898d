//! Fire-and-forget pub/sub notifications.
//!
//! The bus is not a source of truth: a connection failure is logged and
//! swallowed, and every publish happens only after the corresponding store
//! transaction committed. One flat topic scheme is used everywhere —
//! [`topic::GENERAL`] for build and run updates, [`topic::run`] for log
//! lines — with the JSON envelope `{"id": <i64>, "type": "build"|"run"|"log_line"}`.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::model::Id;

/// Topic names; kept in one place so publishers and subscribers can't drift.
pub mod topic {
    use crate::model::Id;

    /// Build and run updates.
    pub const GENERAL: &str = "general";

    /// Log-line updates of one run.
    pub fn run(run_id: Id) -> String {
        format!("run:{run_id}")
    }
}

/// What changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Build,
    Run,
    LogLine,
}

/// The wire envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BusEvent {
    pub id: Id,
    #[serde(rename = "type")]
    pub kind: EventKind,
}

/// Publisher handle shared by all workers.
#[async_trait]
pub trait Bus: Clone + Send + Sync + 'static {
    /// Publish one envelope; failures are logged by the implementation and
    /// never surface to the worker.
    async fn publish(&self, channel: &str, event: BusEvent);

    async fn publish_build(&self, build_id: Id) {
        self.publish(
            topic::GENERAL,
            BusEvent {
                id: build_id,
                kind: EventKind::Build,
            },
        )
        .await;
    }

    async fn publish_run(&self, run_id: Id) {
        self.publish(
            topic::GENERAL,
            BusEvent {
                id: run_id,
                kind: EventKind::Run,
            },
        )
        .await;
    }

    async fn publish_log_line(&self, run_id: Id, log_line_id: Id) {
        self.publish(
            &topic::run(run_id),
            BusEvent {
                id: log_line_id,
                kind: EventKind::LogLine,
            },
        )
        .await;
    }
}

/// Redis-backed bus.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
}

impl RedisBus {
    pub fn connect(url: &str) -> Result<Self, redis::RedisError> {
        Ok(Self {
            client: redis::Client::open(url)?,
        })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, channel: &str, event: BusEvent) {
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to encode bus event");
                return;
            }
        };
        let mut connection = match self.client.get_multiplexed_async_connection().await {
            Ok(connection) => connection,
            Err(err) => {
                warn!(error = %err, channel, "failed to connect to bus");
                return;
            }
        };
        match redis::cmd("PUBLISH")
            .arg(channel)
            .arg(&payload)
            .query_async::<()>(&mut connection)
            .await
        {
            Ok(()) => debug!(channel, payload, "published bus event"),
            Err(err) => warn!(error = %err, channel, "failed to publish bus event"),
        }
    }
}

/// Test bus that records every publish.
#[derive(Clone, Default)]
pub struct RecordingBus {
    events: std::sync::Arc<std::sync::Mutex<Vec<(String, BusEvent)>>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, BusEvent)> {
        self.events.lock().expect("bus record lock").clone()
    }

    /// Events on one channel.
    pub fn on_channel(&self, channel: &str) -> Vec<BusEvent> {
        self.events()
            .into_iter()
            .filter(|(name, _)| name == channel)
            .map(|(_, event)| event)
            .collect()
    }
}

#[async_trait]
impl Bus for RecordingBus {
    async fn publish(&self, channel: &str, event: BusEvent) {
        self.events
            .lock()
            .expect("bus record lock")
            .push((channel.to_string(), event));
    }
}
