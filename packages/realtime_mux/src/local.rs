//! In-process [`ChannelProvider`] backed by a tokio broadcast hub.
//!
//! Producers call [`LocalRealtime::publish`]; every open channel receives each
//! event and hands it to the bindings whose key and row filter match.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::event::{ChangeEvent, ConnectionState, SubscribeStatus, SystemEvent};
use crate::key::{RowFilter, SubscriptionKey};
use crate::provider::{
    Channel, ChannelOptions, ChannelProvider, ChangeHandler, StatusCallback, SystemHandler,
};

pub const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
enum HubMessage {
    Change(Arc<ChangeEvent>),
    SystemError {
        /// `None` targets every channel
        topic: Option<String>,
        message: String,
    },
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct LocalRealtime {
    tx: broadcast::Sender<HubMessage>,
    channels_created: AtomicU64,
    channels_removed: AtomicU64,
}

impl Default for LocalRealtime {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

impl LocalRealtime {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            channels_created: AtomicU64::new(0),
            channels_removed: AtomicU64::new(0),
        }
    }

    /// Fan a change out to every open channel. Returns how many channels received it.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        debug!(
            schema = %event.schema,
            table = %event.table,
            change = event.change.as_str(),
            "Publishing change"
        );
        self.tx.send(HubMessage::Change(Arc::new(event))).unwrap_or(0)
    }

    /// Inject a transport error, either on one topic or on every channel.
    pub fn publish_system_error(&self, topic: Option<&str>, message: impl Into<String>) -> usize {
        self.tx
            .send(HubMessage::SystemError {
                topic: topic.map(str::to_string),
                message: message.into(),
            })
            .unwrap_or(0)
    }

    pub fn channels_created(&self) -> u64 {
        self.channels_created.load(Ordering::Relaxed)
    }

    pub fn channels_removed(&self) -> u64 {
        self.channels_removed.load(Ordering::Relaxed)
    }
}

impl ChannelProvider for LocalRealtime {
    fn create_channel(&self, topic: &str, options: &ChannelOptions) -> Arc<dyn Channel> {
        self.channels_created.fetch_add(1, Ordering::Relaxed);
        debug!(topic, private = options.private, "Opening local channel");
        Arc::new(LocalChannel {
            topic: topic.to_string(),
            tx: self.tx.clone(),
            inner: Arc::new(ChannelInner::default()),
            cancel: CancellationToken::new(),
        })
    }

    fn remove_channel(&self, channel: &Arc<dyn Channel>) {
        self.channels_removed.fetch_add(1, Ordering::Relaxed);
        debug!(topic = channel.topic(), "Removing local channel");
        channel.close();
    }
}

struct Binding {
    key: SubscriptionKey,
    filter: Option<RowFilter>,
    handler: ChangeHandler,
}

impl Binding {
    fn matches(&self, event: &ChangeEvent) -> bool {
        if !self.key.matches_target(event) {
            return false;
        }
        match (&self.key.filter, &self.filter) {
            (None, _) => true,
            (Some(_), Some(filter)) => filter.matches(event.record()),
            // unparseable filter
            (Some(_), None) => false,
        }
    }
}

struct ChannelInner {
    bindings: Mutex<Vec<Binding>>,
    system: Mutex<Vec<SystemHandler>>,
    state: Mutex<ConnectionState>,
}

impl Default for ChannelInner {
    fn default() -> Self {
        Self {
            bindings: Mutex::new(Vec::new()),
            system: Mutex::new(Vec::new()),
            state: Mutex::new(ConnectionState::Connecting),
        }
    }
}

impl ChannelInner {
    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    fn dispatch_change(&self, event: &ChangeEvent) {
        let handlers: Vec<ChangeHandler> = lock(&self.bindings)
            .iter()
            .filter(|b| b.matches(event))
            .map(|b| b.handler.clone())
            .collect();
        for handler in handlers {
            handler(event);
        }
    }

    fn dispatch_system(&self, event: &SystemEvent) {
        let handlers: Vec<SystemHandler> = lock(&self.system).clone();
        for handler in handlers {
            handler(event);
        }
    }
}

pub struct LocalChannel {
    topic: String,
    tx: broadcast::Sender<HubMessage>,
    inner: Arc<ChannelInner>,
    cancel: CancellationToken,
}

impl Channel for LocalChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn on_change(&self, key: &SubscriptionKey, handler: ChangeHandler) {
        let filter = match key.row_filter() {
            Ok(filter) => filter,
            Err(e) => {
                warn!(topic = %self.topic, key = %key, "Ignoring binding with bad row filter: {}", e);
                None
            }
        };
        lock(&self.inner.bindings).push(Binding {
            key: key.clone(),
            filter,
            handler,
        });
    }

    fn on_system(&self, handler: SystemHandler) {
        lock(&self.inner.system).push(handler);
    }

    fn subscribe(&self, on_status: StatusCallback) {
        // subscribe to the hub before returning so no publish is missed
        let mut rx = self.tx.subscribe();
        let inner = self.inner.clone();
        let cancel = self.cancel.clone();
        let topic = self.topic.clone();

        tokio::spawn(async move {
            inner.set_state(ConnectionState::Open);
            on_status(SubscribeStatus::Subscribed);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(HubMessage::Change(event)) => inner.dispatch_change(&event),
                        Ok(HubMessage::SystemError { topic: target, message }) => {
                            if target.as_deref().is_none_or(|t| t == topic) {
                                inner.dispatch_system(&SystemEvent::Error { message });
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(topic = %topic, skipped, "Local channel lagged behind the hub");
                            inner.dispatch_system(&SystemEvent::Error {
                                message: format!("lagged behind, {} event(s) dropped", skipped),
                            });
                        }
                        Err(RecvError::Closed) => {
                            inner.set_state(ConnectionState::Closed);
                            on_status(SubscribeStatus::Closed);
                            return;
                        }
                    }
                }
            }

            inner.set_state(ConnectionState::Closed);
            debug!(topic = %topic, "Local channel task stopped");
        });
    }

    fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    fn close(&self) {
        self.cancel.cancel();
        self.inner.set_state(ConnectionState::Closed);
    }
}
