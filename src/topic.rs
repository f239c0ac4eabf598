//! In-memory pub/sub registry (spec.md §4.5), ported from
//! `topic_manager.py`'s `TopicManager`/`TopicSubscriber`.
//!
//! Topics are arbitrary client-chosen strings. Delivery is at-least-once
//! to currently-registered subscribers: a publish snapshots the
//! subscriber set under a short-held lock, then fans out without holding
//! the lock, so a slow or failing subscriber never blocks publish for
//! the rest or for future `add_subscription` calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

const SUBSCRIBER_QUEUE_DEPTH: usize = 128;

/// A message handed to a subscriber: either a published payload or the
/// sentinel close signal the reference implementation's
/// `TopicSubscriber.close()` sends.
#[derive(Debug, Clone)]
pub enum TopicMessage {
    Data(Value),
    Closed,
}

struct SubscriberEntry {
    tx: mpsc::Sender<TopicMessage>,
    closed: Arc<AtomicBool>,
}

/// The receiving half handed back by [`TopicManager::add_subscription`].
/// Holds the only [`mpsc::Receiver`] for this subscription; dropping it
/// without calling [`TopicManager::remove_subscription`] leaks the entry
/// until the next publish notices the channel is gone.
pub struct Subscription {
    pub id: Uuid,
    topic: String,
    rx: mpsc::Receiver<TopicMessage>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<TopicMessage> {
        self.rx.recv().await
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[derive(Default)]
pub struct TopicManager {
    topics: Mutex<HashMap<String, HashMap<Uuid, SubscriberEntry>>>,
}

impl TopicManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the subscriber set under a short-held lock, then fan out
    /// without holding it. A full or closed subscriber queue drops the
    /// message for that subscriber only; it never affects the others.
    pub fn publish(&self, topic: &str, message: Value) {
        let subscribers: Vec<(Arc<AtomicBool>, mpsc::Sender<TopicMessage>)> = {
            let topics = self.topics.lock().unwrap();
            match topics.get(topic) {
                Some(subs) => subs
                    .values()
                    .map(|entry| (entry.closed.clone(), entry.tx.clone()))
                    .collect(),
                None => return,
            }
        };

        for (closed, tx) in subscribers {
            if closed.load(Ordering::Relaxed) {
                continue;
            }
            if tx.try_send(TopicMessage::Data(message.clone())).is_err() {
                trace!(topic, "dropping message for one subscriber: queue full or closed");
            }
        }
    }

    /// Registration is atomic with respect to publish: a subscriber added
    /// here will see every subsequent publish to `topic`, and none
    /// published before this call returns.
    pub fn add_subscription(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let id = Uuid::new_v4();
        let entry = SubscriberEntry {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        };
        self.topics
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .insert(id, entry);
        Subscription {
            id,
            topic: topic.to_string(),
            rx,
        }
    }

    /// Removes the subscriber, deleting the topic entry once its
    /// subscriber set becomes empty. Best-effort delivers the sentinel
    /// close message first so a concurrently-reading `stream()` loop
    /// observes exactly one `Closed` before its channel is gone.
    pub fn remove_subscription(&self, topic: &str, id: Uuid) {
        let mut topics = self.topics.lock().unwrap();
        let Some(subs) = topics.get_mut(topic) else {
            return;
        };
        if let Some(entry) = subs.remove(&id) {
            entry.closed.store(true, Ordering::Relaxed);
            let _ = entry.tx.try_send(TopicMessage::Closed);
        }
        if subs.is_empty() {
            topics.remove(topic);
            debug!(topic, "topic removed: no remaining subscribers");
        }
    }
}
