//! Trigger dispatch: lifecycle events handed to an external queue for
//! asynchronous processing (follow-up jobs, notifications). The engine only
//! enqueues; consumers live elsewhere.

use std::sync::Mutex;

use async_trait::async_trait;
use palaver_schema::StaticTrigger;
use tokio::sync::mpsc;

#[async_trait]
pub trait TriggerSink: Send + Sync {
    async fn enqueue(&self, session_id: i64, trigger: StaticTrigger);
}

/// Drops every trigger. Useful where no consumer is wired up.
pub struct NullSink;

#[async_trait]
impl TriggerSink for NullSink {
    async fn enqueue(&self, _session_id: i64, _trigger: StaticTrigger) {}
}

/// Channel-backed queue; the receiving half is consumed by a worker task.
pub struct TriggerQueue {
    tx: mpsc::Sender<(i64, StaticTrigger)>,
}

impl TriggerQueue {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<(i64, StaticTrigger)>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TriggerSink for TriggerQueue {
    async fn enqueue(&self, session_id: i64, trigger: StaticTrigger) {
        if self.tx.try_send((session_id, trigger)).is_err() {
            tracing::warn!(session_id, ?trigger, "trigger queue full, dropping event");
        }
    }
}

/// Records triggers in memory; test double.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(i64, StaticTrigger)>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<(i64, StaticTrigger)> {
        self.events.lock().expect("sink lock poisoned").clone()
    }

    pub fn triggers_for(&self, session_id: i64) -> Vec<StaticTrigger> {
        self.events()
            .into_iter()
            .filter(|(id, _)| *id == session_id)
            .map(|(_, trigger)| trigger)
            .collect()
    }
}

#[async_trait]
impl TriggerSink for RecordingSink {
    async fn enqueue(&self, session_id: i64, trigger: StaticTrigger) {
        self.events
            .lock()
            .expect("sink lock poisoned")
            .push((session_id, trigger));
    }
}
