//! One live connection: its lifecycle state and the subscriptions it holds.

use crate::broadcast::{EventBus, Subscription};
use crate::model::{Event, TaskId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Subscriptions of a single connection, all feeding one channel so events
/// are written in arrival order regardless of task.
pub struct Connection {
    state: ConnState,
    bus: Arc<EventBus>,
    tx: mpsc::Sender<Event>,
    subscriptions: HashMap<TaskId, Subscription>,
}

impl Connection {
    pub fn new(bus: Arc<EventBus>, capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Self {
            state: ConnState::Connecting,
            bus,
            tx,
            subscriptions: HashMap::new(),
        };
        (conn, rx)
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Handshake done: bind the task named in the path and go `Open`.
    pub async fn open(&mut self, task_id: TaskId) {
        if self.state == ConnState::Connecting {
            self.subscribe(task_id).await;
            self.state = ConnState::Open;
        }
    }

    /// Bind another task. Returns false if it was already bound or the
    /// connection is no longer accepting subscriptions.
    pub async fn subscribe(&mut self, task_id: TaskId) -> bool {
        if matches!(self.state, ConnState::Closing | ConnState::Closed)
            || self.subscriptions.contains_key(&task_id)
        {
            return false;
        }
        let sub = self.bus.subscribe_into(task_id, self.tx.clone()).await;
        self.subscriptions.insert(task_id, sub);
        true
    }

    pub async fn unsubscribe(&mut self, task_id: TaskId) -> bool {
        match self.subscriptions.remove(&task_id) {
            Some(sub) => self.bus.unsubscribe(&sub).await,
            None => false,
        }
    }

    pub fn is_subscribed(&self, task_id: TaskId) -> bool {
        self.subscriptions.contains_key(&task_id)
    }

    /// Whether `event` should be written to the client. Events still queued
    /// after an unsubscribe or once closing began are discarded.
    pub fn accepts(&self, event: &Event) -> bool {
        self.state == ConnState::Open && self.subscriptions.contains_key(&event.task_id)
    }

    /// `Open -> Closing -> Closed`: release every subscription.
    pub async fn close(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        self.state = ConnState::Closing;
        for (task_id, sub) in self.subscriptions.drain() {
            self.bus.unsubscribe(&sub).await;
            debug!(%task_id, "released subscription");
        }
        self.state = ConnState::Closed;
    }
}
