//! Cross-process event relay over Postgres LISTEN/NOTIFY.
//!
//! Workers publish with [`PgNotifySink`]; each gateway process runs
//! [`spawn_pg_relay`] to feed notifications into its local [`EventBus`].

use super::{EventBus, EventSink};
use crate::error::Result;
use crate::model::Event;
use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Notification channel carrying serialized [`Event`]s.
pub const EVENTS_CHANNEL: &str = "task_events";

/// Postgres rejects NOTIFY payloads of 8000 bytes or more.
const MAX_NOTIFY_PAYLOAD: usize = 7900;

pub struct PgNotifySink {
    pool: PgPool,
}

impl PgNotifySink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Serialize for NOTIFY, dropping the result payload if it will not fit.
/// Subscribers can still fetch the full result from the store.
fn notify_payload(event: &Event) -> Result<String> {
    let body = serde_json::to_string(event)?;
    if body.len() < MAX_NOTIFY_PAYLOAD {
        return Ok(body);
    }
    warn!(task_id = %event.task_id, bytes = body.len(), "event too large for NOTIFY, sending without result and message");
    let trimmed = Event {
        payload: None,
        message: None,
        ..event.clone()
    };
    Ok(serde_json::to_string(&trimmed)?)
}

#[async_trait]
impl EventSink for PgNotifySink {
    async fn emit(&self, event: Event) -> Result<()> {
        let body = notify_payload(&event)?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(EVENTS_CHANNEL)
            .bind(body)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Listen on [`EVENTS_CHANNEL`] and republish every event on `bus`.
/// Runs until the returned handle is aborted.
pub async fn spawn_pg_relay(pool: &PgPool, bus: Arc<EventBus>) -> Result<JoinHandle<()>> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(EVENTS_CHANNEL).await?;
    info!(channel = EVENTS_CHANNEL, "event relay listening");

    Ok(tokio::spawn(async move {
        loop {
            match listener.recv().await {
                Ok(notification) => match serde_json::from_str::<Event>(notification.payload()) {
                    Ok(event) => {
                        let delivered = bus.publish(&event).await;
                        debug!(task_id = %event.task_id, delivered, "relayed event");
                    }
                    Err(e) => warn!("dropping malformed event notification: {e}"),
                },
                Err(e) => {
                    // PgListener reconnects on the next recv; events sent
                    // while disconnected are lost.
                    warn!("event relay listener error: {e}");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }))
}
