//! Cross-replica event fan-out. One subscriber task per replica holds a
//! multiplexed store subscription covering every topic any local socket
//! cares about; inbound events are dispatched to the per-socket outbound
//! queues. Publishes go straight through the store gateway.

use crate::store::StoreGateway;
use crate::ws::outbound::{OutboundFrame, OutboundQueue, PushOutcome};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

const RECONNECT_BACKOFF_INITIAL_MS: u64 = 200;
const RECONNECT_BACKOFF_MAX_MS: u64 = 5_000;

/// Event types that put a socket into Draining once delivered.
const LIFECYCLE_EVENTS: [&str; 3] = ["logout", "session_closed", "server_shutdown"];

#[derive(Debug)]
enum TopicCommand {
    Subscribe(String),
    Unsubscribe(String),
}

/// Local subscriber table: topic -> per-socket delivery queues. Pure data
/// structure; returns the store-level command implied by each change.
#[derive(Default)]
struct TopicTable {
    topics: HashMap<String, HashMap<u64, Arc<OutboundQueue>>>,
}

impl TopicTable {
    /// Returns true when this is the first local subscriber on the topic,
    /// i.e. the store subscription must be established.
    fn add(&mut self, topic: &str, id: u64, queue: Arc<OutboundQueue>) -> bool {
        let subscribers = self.topics.entry(topic.to_string()).or_default();
        let first = subscribers.is_empty();
        subscribers.insert(id, queue);
        first
    }

    /// Returns true when the last local subscriber left, i.e. the store
    /// subscription should be torn down.
    fn remove(&mut self, topic: &str, id: u64) -> bool {
        let Some(subscribers) = self.topics.get_mut(topic) else {
            return false;
        };
        subscribers.remove(&id);
        if subscribers.is_empty() {
            self.topics.remove(topic);
            true
        } else {
            false
        }
    }

    fn queues(&self, topic: &str) -> Vec<Arc<OutboundQueue>> {
        self.topics
            .get(topic)
            .map(|subs| subs.values().cloned().collect())
            .unwrap_or_default()
    }

    fn topic_names(&self) -> Vec<String> {
        self.topics.keys().cloned().collect()
    }
}

/// Handle for one socket's subscription to one topic.
pub struct LocalSubscription {
    pub topic: String,
    id: u64,
}

#[derive(Clone)]
pub struct EventBus {
    store: StoreGateway,
    table: Arc<RwLock<TopicTable>>,
    cmd_tx: mpsc::UnboundedSender<TopicCommand>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    /// Build the bus and spawn its subscriber task.
    pub fn start(store: StoreGateway) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let bus = Self {
            store,
            table: Arc::new(RwLock::new(TopicTable::default())),
            cmd_tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };

        let task = bus.clone();
        tokio::spawn(async move { task.run_subscriber(cmd_rx).await });
        bus
    }

    /// Register a local delivery queue for a topic. Establishes the store
    /// subscription when this is the first local subscriber.
    pub async fn subscribe_local(&self, topic: &str, queue: Arc<OutboundQueue>) -> LocalSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let first = self.table.write().await.add(topic, id, queue);
        if first {
            let _ = self.cmd_tx.send(TopicCommand::Subscribe(topic.to_string()));
        }
        LocalSubscription {
            topic: topic.to_string(),
            id,
        }
    }

    /// Drop a local subscription; tears down the store subscription when it
    /// was the last one.
    pub async fn unsubscribe_local(&self, subscription: LocalSubscription) {
        let last = self
            .table
            .write()
            .await
            .remove(&subscription.topic, subscription.id);
        if last {
            let _ = self
                .cmd_tx
                .send(TopicCommand::Unsubscribe(subscription.topic));
        }
    }

    /// Fire-and-forget publish through the immediate store path.
    pub async fn publish(&self, topic: &str, event: &serde_json::Value) {
        if let Err(e) = self.store.publish(topic, &event.to_string()).await {
            warn!(topic, error = %e, "Failed to publish event");
        }
    }

    /// Subscriber loop. Reconnects with backoff and re-establishes every
    /// live topic after a connection loss; the topic table is the source of
    /// truth for what this replica wants.
    async fn run_subscriber(&self, mut cmd_rx: mpsc::UnboundedReceiver<TopicCommand>) {
        let mut backoff_ms = RECONNECT_BACKOFF_INITIAL_MS;

        'reconnect: loop {
            let mut pubsub = match self.store.pubsub().await {
                Ok(pubsub) => pubsub,
                Err(e) => {
                    warn!(error = %e, backoff_ms, "Pub/sub connection failed; retrying");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(RECONNECT_BACKOFF_MAX_MS);
                    continue;
                }
            };
            backoff_ms = RECONNECT_BACKOFF_INITIAL_MS;

            for topic in self.table.read().await.topic_names() {
                if let Err(e) = pubsub.subscribe(&topic).await {
                    warn!(topic = %topic, error = %e, "Resubscribe failed; reconnecting");
                    continue 'reconnect;
                }
            }

            loop {
                enum Wake {
                    Command(Option<TopicCommand>),
                    Message(Option<(String, String)>),
                }

                let wake = tokio::select! {
                    cmd = cmd_rx.recv() => Wake::Command(cmd),
                    msg = async {
                        pubsub.on_message().next().await.map(|msg| {
                            let topic = msg.get_channel_name().to_string();
                            let payload = msg.get_payload::<String>().unwrap_or_default();
                            (topic, payload)
                        })
                    } => Wake::Message(msg),
                };

                match wake {
                    Wake::Command(Some(TopicCommand::Subscribe(topic))) => {
                        if let Err(e) = pubsub.subscribe(&topic).await {
                            warn!(topic = %topic, error = %e, "Store subscribe failed; reconnecting");
                            continue 'reconnect;
                        }
                    }
                    Wake::Command(Some(TopicCommand::Unsubscribe(topic))) => {
                        if let Err(e) = pubsub.unsubscribe(&topic).await {
                            warn!(topic = %topic, error = %e, "Store unsubscribe failed; reconnecting");
                            continue 'reconnect;
                        }
                    }
                    Wake::Command(None) => return,
                    Wake::Message(Some((topic, payload))) => {
                        self.dispatch(&topic, &payload).await;
                    }
                    Wake::Message(None) => {
                        warn!("Pub/sub connection lost; reconnecting");
                        continue 'reconnect;
                    }
                }
            }
        }
    }

    /// Deliver one store event to every local subscriber of its topic, in
    /// arrival order.
    async fn dispatch(&self, topic: &str, payload: &str) {
        let event: serde_json::Value = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(topic, error = %e, "Dropping malformed event payload");
                return;
            }
        };

        let event_type = event.get("type").and_then(|t| t.as_str()).unwrap_or("");
        let lifecycle = LIFECYCLE_EVENTS.contains(&event_type);

        let queues = self.table.read().await.queues(topic);
        if queues.is_empty() {
            return;
        }

        debug!(topic, event_type, subscribers = queues.len(), "Dispatching event");
        for queue in queues {
            let frame = if lifecycle {
                OutboundFrame::lifecycle(payload.to_string())
            } else {
                OutboundFrame::normal(payload.to_string())
            };
            match queue.push(frame) {
                PushOutcome::DisplacedOldest => {
                    warn!(topic, event_type, "Outbound backpressure: displaced oldest frame");
                }
                PushOutcome::Dropped => {
                    warn!(topic, event_type, "Outbound backpressure: dropped frame");
                }
                PushOutcome::Queued | PushOutcome::Closed => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<OutboundQueue> {
        Arc::new(OutboundQueue::new(4))
    }

    #[test]
    fn test_first_subscriber_triggers_store_subscribe() {
        let mut table = TopicTable::default();
        assert!(table.add("user:alice", 1, queue()));
        assert!(!table.add("user:alice", 2, queue()));
        assert!(table.add("session:s1", 3, queue()));
    }

    #[test]
    fn test_last_unsubscribe_triggers_store_unsubscribe() {
        let mut table = TopicTable::default();
        table.add("user:alice", 1, queue());
        table.add("user:alice", 2, queue());

        assert!(!table.remove("user:alice", 1));
        assert!(table.remove("user:alice", 2));
        assert!(table.queues("user:alice").is_empty());
    }

    #[test]
    fn test_remove_unknown_topic_is_noop() {
        let mut table = TopicTable::default();
        assert!(!table.remove("session:ghost", 9));
    }

    #[test]
    fn test_queues_returns_all_subscribers() {
        let mut table = TopicTable::default();
        table.add("session:s1", 1, queue());
        table.add("session:s1", 2, queue());
        assert_eq!(table.queues("session:s1").len(), 2);
    }

    #[test]
    fn test_lifecycle_event_classification() {
        assert!(LIFECYCLE_EVENTS.contains(&"logout"));
        assert!(LIFECYCLE_EVENTS.contains(&"session_closed"));
        assert!(LIFECYCLE_EVENTS.contains(&"server_shutdown"));
        assert!(!LIFECYCLE_EVENTS.contains(&"session_updated"));
    }
}
