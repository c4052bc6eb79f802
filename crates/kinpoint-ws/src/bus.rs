//! Bus dispatcher (C7). Pattern-subscribes the three fan-out channel
//! families and forwards each incoming payload to the matching room or
//! user socket set on this instance.

use std::sync::Arc;

use kinpoint_core::rooms::RoomRegistry;
use kinpoint_core::AppState;
use kinpoint_kv::{BusMessage, KvError, MessageHandler};
use kinpoint_models::channel::{self, BusRoute};
use kinpoint_models::gateway::{EVENT_LOCATION_UPDATE, EVENT_NOTIFICATION};
use serde_json::Value;
use tokio::time::Duration;

const SUBSCRIBE_RETRY_DELAY: Duration = Duration::from_millis(500);
const SUBSCRIBE_RETRY_LIMIT: u32 = 10;

pub struct BusDispatcher;

impl BusDispatcher {
    /// Install the pattern subscriptions. Called once at startup, after the
    /// KV client passed its readiness ping; each subscribe is retried for a
    /// few seconds before startup fails.
    pub async fn start(state: &AppState) -> Result<(), KvError> {
        for pattern in [
            channel::PATTERN_FAMILY_LOCATION,
            channel::PATTERN_FAMILY_ALERTS,
            channel::PATTERN_USER_NOTIFICATIONS,
        ] {
            let registry = state.registry.clone();
            let handler: MessageHandler = Arc::new(move |msg: BusMessage| {
                route_message(&registry, &msg.channel, &msg.payload);
            });
            subscribe_with_retry(state, pattern, handler).await?;
        }
        tracing::info!("bus dispatcher subscribed to location, alert, and notification patterns");
        Ok(())
    }
}

async fn subscribe_with_retry(
    state: &AppState,
    pattern: &str,
    handler: MessageHandler,
) -> Result<(), KvError> {
    let mut attempt = 0;
    loop {
        match state.kv.psubscribe(pattern, handler.clone()).await {
            Ok(_) => return Ok(()),
            Err(err) if attempt < SUBSCRIBE_RETRY_LIMIT => {
                attempt += 1;
                tracing::warn!(%err, pattern, attempt, "pattern subscribe failed, retrying");
                tokio::time::sleep(SUBSCRIBE_RETRY_DELAY).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Route one bus payload to local sockets, returning how many sockets it
/// was queued for. Location channels forward as `location_update`; alert
/// channels forward under the payload's `type` discriminator; notification
/// channels target every socket of the user.
pub fn route_message(registry: &RoomRegistry, channel_name: &str, payload: &str) -> usize {
    let Some(route) = channel::parse(channel_name) else {
        tracing::debug!(channel = channel_name, "ignoring unroutable bus channel");
        return 0;
    };
    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(%err, channel = channel_name, "dropping undecodable bus payload");
            return 0;
        }
    };
    match route {
        BusRoute::FamilyLocation(family_id) => {
            registry.send_to_room(&family_id, EVENT_LOCATION_UPDATE, value)
        }
        BusRoute::FamilyAlerts(family_id) => {
            let Some(event) = value
                .get("type")
                .and_then(Value::as_str)
                .map(str::to_string)
            else {
                tracing::warn!(channel = channel_name, "alert payload without type");
                return 0;
            };
            registry.send_to_room(&family_id, &event, value)
        }
        BusRoute::UserNotifications(user_id) => {
            registry.send_to_user(&user_id, EVENT_NOTIFICATION, value)
        }
    }
}
