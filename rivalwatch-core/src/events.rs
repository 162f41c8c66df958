//! In-process publish/subscribe for orchestration progress.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

pub const MONITORING_STARTED: &str = "monitoring_started";
pub const JOB_STARTED: &str = "job_started";
pub const JOB_COMPLETED: &str = "job_completed";
pub const JOB_FAILED: &str = "job_failed";
pub const MONITORING_COMPLETED: &str = "monitoring_completed";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub event: String,
    pub payload: Value,
    #[serde(with = "rfc3339")]
    pub ts: DateTime<Utc>,
}

impl EventMessage {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
            ts: Utc::now(),
        }
    }

    /// Serializes as a single JSON line terminated by `\n`.
    pub fn to_ndjson(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

mod rfc3339 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn format_ts(ts: &DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_ts(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug)]
struct Registry {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<EventMessage>>>,
    capacity: usize,
}

impl Registry {
    fn remove(&self, id: u64) -> bool {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }
}

/// Fan-out of [`EventMessage`]s to bounded subscriber queues. Cloning shares
/// the same subscriber registry.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    registry: Arc<Registry>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(1),
                subscribers: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.registry.capacity);
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        debug!(subscriber = id, "event subscriber registered");
        Subscription {
            id,
            receiver: rx,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.registry.remove(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Delivers to every current subscriber without waiting. Subscribers
    /// whose queue is full or closed are dropped. Returns the number of
    /// successful deliveries.
    pub fn publish(&self, event: &str, payload: Value) -> usize {
        let message = EventMessage::new(event, payload);
        let snapshot: Vec<(u64, mpsc::Sender<EventMessage>)> = self
            .registry
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut delivered = 0;
        let mut dropped = Vec::new();
        for (id, tx) in snapshot {
            match tx.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => dropped.push(id),
            }
        }
        if !dropped.is_empty() {
            let mut subscribers = self
                .registry
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for id in &dropped {
                subscribers.remove(id);
            }
            debug!(event, dropped = dropped.len(), "dropped unresponsive subscribers");
        }
        delivered
    }
}

/// A subscriber's queue. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<EventMessage>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<EventMessage> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<EventMessage> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}
