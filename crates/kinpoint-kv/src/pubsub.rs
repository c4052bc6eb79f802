//! Subscriber side of the bus. A single background task owns the pub/sub
//! connection; handler registration goes through an internal lock and
//! delivery copies the handler set out before invoking anything, so a
//! handler can never deadlock against a concurrent (un)subscribe.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};

use crate::KvError;

/// One message delivered off the bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub channel: String,
    /// Set when the message arrived via a pattern subscription.
    pub pattern: Option<String>,
    pub payload: String,
}

/// Handlers run on the subscriber's delivery task; anything slow should be
/// spawned by the handler itself.
pub type MessageHandler = Arc<dyn Fn(BusMessage) + Send + Sync>;

/// Token returned from subscribe/psubscribe, used for targeted removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

type HandlerSlot = (HandlerId, MessageHandler);

#[derive(Default)]
struct Registry {
    channels: Mutex<HashMap<String, Vec<HandlerSlot>>>,
    patterns: Mutex<HashMap<String, Vec<HandlerSlot>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum SubCmd {
    Subscribe(String, oneshot::Sender<Result<(), redis::RedisError>>),
    PSubscribe(String, oneshot::Sender<Result<(), redis::RedisError>>),
    Unsubscribe(String),
    PUnsubscribe(String),
}

#[derive(Clone)]
pub struct Subscriber {
    registry: Arc<Registry>,
    next_id: Arc<AtomicU64>,
    cmd_tx: mpsc::UnboundedSender<SubCmd>,
}

impl Subscriber {
    /// Open the subscriber connection and spawn the delivery task.
    pub(crate) async fn start(client: redis::Client) -> Result<Self, KvError> {
        let initial = client.get_async_pubsub().await?;
        let registry = Arc::new(Registry::default());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(client, registry.clone(), cmd_rx, initial));
        Ok(Self {
            registry,
            next_id: Arc::new(AtomicU64::new(1)),
            cmd_tx,
        })
    }

    pub async fn subscribe(
        &self,
        channel: &str,
        handler: MessageHandler,
    ) -> Result<HandlerId, KvError> {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let first = {
            let mut channels = lock(&self.registry.channels);
            let slots = channels.entry(channel.to_string()).or_default();
            slots.push((id, handler));
            slots.len() == 1
        };
        if first {
            self.issue(|ack| SubCmd::Subscribe(channel.to_string(), ack))
                .await?;
        }
        Ok(id)
    }

    pub async fn psubscribe(
        &self,
        pattern: &str,
        handler: MessageHandler,
    ) -> Result<HandlerId, KvError> {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let first = {
            let mut patterns = lock(&self.registry.patterns);
            let slots = patterns.entry(pattern.to_string()).or_default();
            slots.push((id, handler));
            slots.len() == 1
        };
        if first {
            self.issue(|ack| SubCmd::PSubscribe(pattern.to_string(), ack))
                .await?;
        }
        Ok(id)
    }

    /// Drop one handler (by ID) or all handlers for the channel. The backend
    /// subscription is released once no handler remains.
    pub async fn unsubscribe(
        &self,
        channel: &str,
        handler: Option<HandlerId>,
    ) -> Result<(), KvError> {
        let emptied = {
            let mut channels = lock(&self.registry.channels);
            remove_slots(&mut channels, channel, handler)
        };
        if emptied {
            self.cmd_tx
                .send(SubCmd::Unsubscribe(channel.to_string()))
                .map_err(|_| KvError::SubscriberUnavailable)?;
        }
        Ok(())
    }

    pub async fn punsubscribe(
        &self,
        pattern: &str,
        handler: Option<HandlerId>,
    ) -> Result<(), KvError> {
        let emptied = {
            let mut patterns = lock(&self.registry.patterns);
            remove_slots(&mut patterns, pattern, handler)
        };
        if emptied {
            self.cmd_tx
                .send(SubCmd::PUnsubscribe(pattern.to_string()))
                .map_err(|_| KvError::SubscriberUnavailable)?;
        }
        Ok(())
    }

    async fn issue<F>(&self, build: F) -> Result<(), KvError>
    where
        F: FnOnce(oneshot::Sender<Result<(), redis::RedisError>>) -> SubCmd,
    {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(build(ack_tx))
            .map_err(|_| KvError::SubscriberUnavailable)?;
        match ack_rx.await {
            Ok(result) => result.map_err(KvError::Backend),
            Err(_) => Err(KvError::SubscriberUnavailable),
        }
    }
}

/// Returns true when the key had slots before and has none afterwards.
fn remove_slots(
    map: &mut HashMap<String, Vec<HandlerSlot>>,
    key: &str,
    handler: Option<HandlerId>,
) -> bool {
    let Some(slots) = map.get_mut(key) else {
        return false;
    };
    match handler {
        Some(id) => slots.retain(|(slot_id, _)| *slot_id != id),
        None => slots.clear(),
    }
    if slots.is_empty() {
        map.remove(key);
        true
    } else {
        false
    }
}

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

async fn run(
    client: redis::Client,
    registry: Arc<Registry>,
    mut cmd_rx: mpsc::UnboundedReceiver<SubCmd>,
    initial: redis::aio::PubSub,
) {
    let mut connection = Some(initial);
    'outer: loop {
        let mut pubsub = match connection.take() {
            Some(pubsub) => pubsub,
            None => match client.get_async_pubsub().await {
                Ok(pubsub) => pubsub,
                Err(err) => {
                    tracing::warn!(%err, "bus subscriber reconnect failed, retrying");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            },
        };

        if let Err(err) = resubscribe(&mut pubsub, &registry).await {
            tracing::warn!(%err, "bus resubscribe failed, reconnecting");
            tokio::time::sleep(RECONNECT_DELAY).await;
            continue;
        }

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None => break 'outer,
                        Some(SubCmd::Subscribe(channel, ack)) => {
                            let result = pubsub.subscribe(&channel).await;
                            let failed = result.is_err();
                            let _ = ack.send(result);
                            if failed {
                                break;
                            }
                        }
                        Some(SubCmd::PSubscribe(pattern, ack)) => {
                            let result = pubsub.psubscribe(&pattern).await;
                            let failed = result.is_err();
                            let _ = ack.send(result);
                            if failed {
                                break;
                            }
                        }
                        Some(SubCmd::Unsubscribe(channel)) => {
                            if let Err(err) = pubsub.unsubscribe(&channel).await {
                                tracing::warn!(%err, %channel, "unsubscribe failed");
                                break;
                            }
                        }
                        Some(SubCmd::PUnsubscribe(pattern)) => {
                            if let Err(err) = pubsub.punsubscribe(&pattern).await {
                                tracing::warn!(%err, %pattern, "punsubscribe failed");
                                break;
                            }
                        }
                    }
                }
                msg = next_message(&mut pubsub) => {
                    match msg {
                        Some(msg) => deliver(&registry, msg),
                        None => {
                            tracing::warn!("bus subscriber connection dropped, reconnecting");
                            break;
                        }
                    }
                }
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
    tracing::debug!("bus subscriber task stopped");
}

async fn next_message(pubsub: &mut redis::aio::PubSub) -> Option<redis::Msg> {
    pubsub.on_message().next().await
}

async fn resubscribe(
    pubsub: &mut redis::aio::PubSub,
    registry: &Registry,
) -> Result<(), redis::RedisError> {
    let channels: Vec<String> = lock(&registry.channels).keys().cloned().collect();
    let patterns: Vec<String> = lock(&registry.patterns).keys().cloned().collect();
    for channel in channels {
        pubsub.subscribe(&channel).await?;
    }
    for pattern in patterns {
        pubsub.psubscribe(&pattern).await?;
    }
    Ok(())
}

/// Invoke every handler registered for the message's channel or pattern.
/// Handler panics are logged and swallowed; they must not tear down the
/// delivery loop or other subscriptions.
fn deliver(registry: &Registry, msg: redis::Msg) {
    let channel = msg.get_channel_name().to_string();
    let pattern: Option<String> = msg.get_pattern().unwrap_or(None);
    let payload: String = match msg.get_payload() {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(%err, %channel, "dropping non-utf8 bus payload");
            return;
        }
    };

    let handlers: Vec<MessageHandler> = match &pattern {
        Some(pattern) => lock(&registry.patterns)
            .get(pattern)
            .map(|slots| slots.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default(),
        None => lock(&registry.channels)
            .get(&channel)
            .map(|slots| slots.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default(),
    };

    for handler in handlers {
        let message = BusMessage {
            channel: channel.clone(),
            pattern: pattern.clone(),
            payload: payload.clone(),
        };
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| handler(message)));
        if outcome.is_err() {
            tracing::error!(%channel, "bus handler panicked; delivery continues");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> MessageHandler {
        Arc::new(|_msg| {})
    }

    #[test]
    fn remove_slots_reports_emptied() {
        let mut map: HashMap<String, Vec<HandlerSlot>> = HashMap::new();
        map.entry("ch".into()).or_default().push((HandlerId(1), noop()));
        map.entry("ch".into()).or_default().push((HandlerId(2), noop()));

        assert!(!remove_slots(&mut map, "ch", Some(HandlerId(1))));
        assert!(remove_slots(&mut map, "ch", Some(HandlerId(2))));
        assert!(!map.contains_key("ch"));
        assert!(!remove_slots(&mut map, "ch", None));
    }

    #[test]
    fn remove_all_clears_channel() {
        let mut map: HashMap<String, Vec<HandlerSlot>> = HashMap::new();
        map.entry("ch".into()).or_default().push((HandlerId(1), noop()));
        map.entry("ch".into()).or_default().push((HandlerId(2), noop()));
        assert!(remove_slots(&mut map, "ch", None));
    }
}
