//! Redis pub/sub-backed event publisher (optional).
//!
//! Redis pub/sub is not durable: subscribers that are offline miss messages.
//! Each event is published as its JSON document, with the entity state before
//! and after it, on one channel; a `PUBLISH`
//! that fails is reported so the processor can retry it.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tracing::{debug, instrument};

use cairn_events::{DomainEventWithState, EventPublisher, PublishError};

const DEFAULT_CHANNEL: &str = "cairn:events";

#[derive(Clone)]
pub struct RedisEventPublisher {
    conn: MultiplexedConnection,
    channel: String,
}

impl core::fmt::Debug for RedisEventPublisher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisEventPublisher").field("channel", &self.channel).finish()
    }
}

impl RedisEventPublisher {
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, PublishError> {
        let client =
            redis::Client::open(redis_url.as_ref()).map_err(|e| PublishError::Unavailable(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| PublishError::Unavailable(e.to_string()))?;

        Ok(Self {
            conn,
            channel: DEFAULT_CHANNEL.to_string(),
        })
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }
}

#[async_trait]
impl EventPublisher for RedisEventPublisher {
    #[instrument(skip(self, event), fields(event_id = %event.event.id, revision = event.revision()), err)]
    async fn publish(&self, event: &DomainEventWithState) -> Result<(), PublishError> {
        let payload = serde_json::to_string(event).map_err(|e| PublishError::Serialize(e.to_string()))?;

        let mut conn = self.conn.clone();
        let receivers: i64 = conn
            .publish(&self.channel, payload)
            .await
            .map_err(|e| PublishError::Unavailable(e.to_string()))?;

        debug!(receivers, channel = %self.channel, "event published");
        Ok(())
    }
}
