//! Reference-counted channel registry.
//!
//! Every logical channel name maps to exactly one provider channel. Each
//! `subscribe` call adds a handler under its [`SubscriptionKey`] and bumps the
//! channel's reference count; the channel is opened on the first subscriber and
//! removed when the last one unsubscribes.
//!
//! The registry lock is never held across a call into the provider or a
//! callback. Handlers and listeners are cloned out and run after the lock is
//! released, so callbacks may freely subscribe or unsubscribe, and providers
//! may invoke bindings synchronously.

use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::event::{
    ChangeEvent, ChannelError, ConnectionState, SubscribeStatus, SystemEvent,
};
use crate::health::{HealthMonitor, HealthSampling};
use crate::key::SubscriptionKey;
use crate::provider::{
    Channel, ChannelOptions, ChannelProvider, ChangeHandler, StatusCallback, SystemHandler,
};

/// Prefix applied to logical channel names to form the provider topic.
pub const TOPIC_PREFIX: &str = "channel:";

pub fn topic_for(channel_name: &str) -> String {
    format!("{}{}", TOPIC_PREFIX, channel_name)
}

pub type ConnectionListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;
pub type ErrorListener = Arc<dyn Fn(&ChannelError) + Send + Sync>;

/// Wrap a closure as a [`ChangeHandler`].
pub fn handler<F>(f: F) -> ChangeHandler
where
    F: Fn(&ChangeEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Clone, Debug)]
pub struct MultiplexerConfig {
    /// How often the health monitor samples channel state
    pub health_interval: Duration,
    pub health_sampling: HealthSampling,
    /// Options used when `subscribe` is called without any
    pub channel_options: ChannelOptions,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(5),
            health_sampling: HealthSampling::default(),
            channel_options: ChannelOptions::default(),
        }
    }
}

/// Introspection view of one live channel.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ActiveChannel {
    /// Number of live subscriptions sharing the channel
    pub count: usize,
    /// Distinct subscription keys with at least one handler
    pub configs: Vec<SubscriptionKey>,
    pub status: Option<SubscribeStatus>,
    pub state: ConnectionState,
}

/// The subscribe / introspect / shutdown contract, for callers that want a trait object.
pub trait SubscriptionRegistry: Send + Sync {
    fn subscribe(
        &self,
        channel_name: &str,
        key: SubscriptionKey,
        handler: ChangeHandler,
        options: Option<ChannelOptions>,
    ) -> Subscription;

    fn active_subscriptions(&self) -> BTreeMap<String, ActiveChannel>;

    fn close_all(&self) -> usize;
}

struct HandlerEntry {
    id: u64,
    handler: ChangeHandler,
}

/// Provider calls owed by a `subscribe`, made once the registry lock is released.
struct PendingBinds {
    channel: Arc<dyn Channel>,
    generation: u64,
    created: bool,
    bind: bool,
    activate: bool,
}

struct ChannelEntry {
    generation: u64,
    channel: Arc<dyn Channel>,
    ref_count: usize,
    handlers: BTreeMap<SubscriptionKey, Vec<HandlerEntry>>,
    /// Keys that already have a dispatcher bound on the provider channel
    bound: HashSet<SubscriptionKey>,
    last_status: Option<SubscribeStatus>,
}

impl ChannelEntry {
    fn new(generation: u64, channel: Arc<dyn Channel>) -> Self {
        Self {
            generation,
            channel,
            ref_count: 0,
            handlers: BTreeMap::new(),
            bound: HashSet::new(),
            last_status: None,
        }
    }

    /// Add a handler and reserve the key's dispatcher binding if it has none.
    fn register(
        &mut self,
        key: &SubscriptionKey,
        id: u64,
        handler: ChangeHandler,
        created: bool,
    ) -> PendingBinds {
        let bind = self.bound.insert(key.clone());
        self.handlers
            .entry(key.clone())
            .or_default()
            .push(HandlerEntry { id, handler });
        self.ref_count += 1;
        PendingBinds {
            channel: self.channel.clone(),
            generation: self.generation,
            created,
            bind,
            activate: self.ref_count == 1,
        }
    }
}

#[derive(Default)]
struct Listeners {
    connection: BTreeMap<u64, ConnectionListener>,
    error: BTreeMap<u64, ErrorListener>,
}

struct Shared {
    provider: Arc<dyn ChannelProvider>,
    config: MultiplexerConfig,
    registry: Mutex<BTreeMap<String, ChannelEntry>>,
    listeners: Mutex<Listeners>,
    global_state: Mutex<Option<ConnectionState>>,
    next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn unsubscribe(&self, topic: &str, generation: u64, key: &SubscriptionKey, id: u64) {
        let removed = {
            let mut registry = lock(&self.registry);
            let Some(entry) = registry.get_mut(topic) else {
                return;
            };
            if entry.generation != generation {
                return;
            }
            let Some(bucket) = entry.handlers.get_mut(key) else {
                return;
            };
            let before = bucket.len();
            bucket.retain(|h| h.id != id);
            if bucket.len() == before {
                return;
            }
            if bucket.is_empty() {
                entry.handlers.remove(key);
            }
            entry.ref_count = entry.ref_count.saturating_sub(1);
            debug!(topic, key = %key, ref_count = entry.ref_count, "Unsubscribed handler");

            if entry.ref_count == 0 {
                registry.remove(topic).map(|e| e.channel)
            } else {
                None
            }
        };

        if let Some(channel) = removed {
            info!(topic, "Last subscriber left, removing channel");
            self.provider.remove_channel(&channel);
        }
    }

    fn handlers_for(&self, topic: &str, generation: u64, key: &SubscriptionKey) -> Vec<ChangeHandler> {
        let registry = lock(&self.registry);
        registry
            .get(topic)
            .filter(|e| e.generation == generation)
            .and_then(|e| e.handlers.get(key))
            .map(|bucket| bucket.iter().map(|h| h.handler.clone()).collect())
            .unwrap_or_default()
    }

    fn is_current(&self, topic: &str, generation: u64) -> bool {
        lock(&self.registry)
            .get(topic)
            .is_some_and(|e| e.generation == generation)
    }

    fn report_error(&self, err: ChannelError) {
        error!(topic = %err.topic, "Realtime channel error: {}", err.message);
        let listeners: Vec<ErrorListener> = lock(&self.listeners).error.values().cloned().collect();
        for listener in listeners {
            listener(&err);
        }
    }

    fn record_status(&self, topic: &str, generation: u64, status: SubscribeStatus) {
        {
            let mut registry = lock(&self.registry);
            match registry.get_mut(topic) {
                Some(entry) if entry.generation == generation => {
                    entry.last_status = Some(status.clone());
                }
                _ => return,
            }
        }

        match &status {
            SubscribeStatus::Subscribed => info!(topic, "Channel subscribed"),
            SubscribeStatus::Closed => info!(topic, "Channel closed"),
            SubscribeStatus::TimedOut => warn!(topic, "Channel subscription timed out"),
            SubscribeStatus::ChannelError(message) => self.report_error(ChannelError {
                topic: topic.to_string(),
                message: message.clone(),
            }),
        }
    }

    fn sample_state(&self) -> Option<ConnectionState> {
        let channels: Vec<Arc<dyn Channel>> = lock(&self.registry)
            .values()
            .map(|e| e.channel.clone())
            .collect();
        self.config
            .health_sampling
            .sample(channels.iter().map(|c| c.state()))
    }

    fn check_connection_health(&self) -> Option<ConnectionState> {
        let sampled = self.sample_state()?;
        {
            let mut global = lock(&self.global_state);
            if *global == Some(sampled) {
                return None;
            }
            *global = Some(sampled);
        }

        info!(state = %sampled, "Realtime connection state changed");
        let listeners: Vec<ConnectionListener> =
            lock(&self.listeners).connection.values().cloned().collect();
        for listener in listeners {
            listener(sampled);
        }
        Some(sampled)
    }
}

/// Deduplicating, reference-counted front for a [`ChannelProvider`].
///
/// Cheap to clone; clones share one registry. Independent registries are
/// created with separate [`Multiplexer::new`] calls.
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<Shared>,
}

impl Multiplexer {
    pub fn new(provider: Arc<dyn ChannelProvider>, config: MultiplexerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                provider,
                config,
                registry: Mutex::new(BTreeMap::new()),
                listeners: Mutex::new(Listeners::default()),
                global_state: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &MultiplexerConfig {
        &self.shared.config
    }

    /// Register `handler` for events matching `key` on the logical channel
    /// `channel_name`, opening the channel if this is its first subscriber.
    pub fn subscribe(
        &self,
        channel_name: &str,
        key: SubscriptionKey,
        handler: ChangeHandler,
        options: Option<ChannelOptions>,
    ) -> Subscription {
        let shared = &self.shared;
        let topic = topic_for(channel_name);
        let id = shared.next_id();

        let joined = lock(&shared.registry)
            .get_mut(&topic)
            .map(|entry| entry.register(&key, id, handler.clone(), false));

        let pending = match joined {
            Some(pending) => pending,
            None => {
                let generation = shared.next_id();
                let options = options.as_ref().unwrap_or(&shared.config.channel_options);
                let fresh = shared.provider.create_channel(&topic, options);

                let (pending, duplicate) = match lock(&shared.registry).entry(topic.clone()) {
                    Entry::Occupied(mut existing) => (
                        existing.get_mut().register(&key, id, handler, false),
                        Some(fresh),
                    ),
                    Entry::Vacant(slot) => (
                        slot.insert(ChannelEntry::new(generation, fresh))
                            .register(&key, id, handler, true),
                        None,
                    ),
                };
                if let Some(duplicate) = duplicate {
                    debug!(topic = %topic, "Channel was created concurrently, discarding duplicate");
                    shared.provider.remove_channel(&duplicate);
                }
                pending
            }
        };

        let PendingBinds {
            channel,
            generation,
            created,
            bind,
            activate,
        } = pending;
        if created {
            debug!(topic = %topic, generation, "Created channel");
            channel.on_system(self.system_observer(&topic, generation));
        }
        if bind {
            channel.on_change(&key, self.dispatcher(&topic, generation, key.clone()));
        }
        debug!(topic = %topic, key = %key, "Subscribed handler");
        if activate {
            channel.subscribe(self.status_observer(&topic, generation));
        }

        Subscription {
            shared: Arc::downgrade(shared),
            channel_name: channel_name.to_string(),
            topic,
            generation,
            key,
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Live channels keyed by topic (`channel:<name>`).
    pub fn active_subscriptions(&self) -> BTreeMap<String, ActiveChannel> {
        let snapshot: Vec<_> = {
            let registry = lock(&self.shared.registry);
            registry
                .iter()
                .map(|(topic, entry)| {
                    (
                        topic.clone(),
                        entry.ref_count,
                        entry.handlers.keys().cloned().collect::<Vec<_>>(),
                        entry.last_status.clone(),
                        entry.channel.clone(),
                    )
                })
                .collect()
        };
        snapshot
            .into_iter()
            .map(|(topic, count, configs, status, channel)| {
                (
                    topic,
                    ActiveChannel {
                        count,
                        configs,
                        status,
                        state: channel.state(),
                    },
                )
            })
            .collect()
    }

    /// Tear down every channel regardless of reference count. Returns how many were closed.
    ///
    /// Subscriptions issued before this call become inert.
    pub fn close_all(&self) -> usize {
        let drained: Vec<(String, ChannelEntry)> = {
            let mut registry = lock(&self.shared.registry);
            std::mem::take(&mut *registry).into_iter().collect()
        };
        for (topic, entry) in &drained {
            debug!(topic = %topic, ref_count = entry.ref_count, "Force-closing channel");
            self.shared.provider.remove_channel(&entry.channel);
        }
        if !drained.is_empty() {
            info!("Closed {} realtime channel(s)", drained.len());
        }
        drained.len()
    }

    pub fn add_connection_listener<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let id = self.shared.next_id();
        lock(&self.shared.listeners)
            .connection
            .insert(id, Arc::new(listener));
        ListenerHandle::new(&self.shared, ListenerKind::Connection, id)
    }

    pub fn add_error_listener<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&ChannelError) + Send + Sync + 'static,
    {
        let id = self.shared.next_id();
        lock(&self.shared.listeners)
            .error
            .insert(id, Arc::new(listener));
        ListenerHandle::new(&self.shared, ListenerKind::Error, id)
    }

    /// Last connection state observed by the health check, if any.
    pub fn connection_state(&self) -> Option<ConnectionState> {
        *lock(&self.shared.global_state)
    }

    /// Sample channel state once; notifies connection listeners and returns the
    /// new state if it differs from the last observation.
    pub fn check_connection_health(&self) -> Option<ConnectionState> {
        self.shared.check_connection_health()
    }

    /// Run [`Multiplexer::check_connection_health`] every `health_interval`.
    pub fn spawn_health_monitor(&self) -> HealthMonitor {
        let cancel = CancellationToken::new();
        let shared = Arc::downgrade(&self.shared);
        let period = self.shared.config.health_interval;
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(shared) = shared.upgrade() else { break };
                        shared.check_connection_health();
                    }
                }
            }
            debug!("Realtime health monitor stopped");
        });

        HealthMonitor::new(cancel, task)
    }

    fn dispatcher(&self, topic: &str, generation: u64, key: SubscriptionKey) -> ChangeHandler {
        let shared = Arc::downgrade(&self.shared);
        let topic = topic.to_string();
        Arc::new(move |event: &ChangeEvent| {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            for handler in shared.handlers_for(&topic, generation, &key) {
                handler(event);
            }
        })
    }

    fn system_observer(&self, topic: &str, generation: u64) -> SystemHandler {
        let shared = Arc::downgrade(&self.shared);
        let topic = topic.to_string();
        Arc::new(move |event: &SystemEvent| {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            match event {
                SystemEvent::Error { message } => {
                    if shared.is_current(&topic, generation) {
                        shared.report_error(ChannelError {
                            topic: topic.clone(),
                            message: message.clone(),
                        });
                    }
                }
                SystemEvent::Ok { message } => debug!(topic = %topic, "System: {}", message),
            }
        })
    }

    fn status_observer(&self, topic: &str, generation: u64) -> StatusCallback {
        let shared = Arc::downgrade(&self.shared);
        let topic = topic.to_string();
        Arc::new(move |status: SubscribeStatus| {
            if let Some(shared) = shared.upgrade() {
                shared.record_status(&topic, generation, status);
            }
        })
    }
}

impl SubscriptionRegistry for Multiplexer {
    fn subscribe(
        &self,
        channel_name: &str,
        key: SubscriptionKey,
        handler: ChangeHandler,
        options: Option<ChannelOptions>,
    ) -> Subscription {
        Multiplexer::subscribe(self, channel_name, key, handler, options)
    }

    fn active_subscriptions(&self) -> BTreeMap<String, ActiveChannel> {
        Multiplexer::active_subscriptions(self)
    }

    fn close_all(&self) -> usize {
        Multiplexer::close_all(self)
    }
}

/// One registered handler. Call [`Subscription::unsubscribe`] to remove it;
/// dropping the value leaves the handler registered.
#[must_use = "the subscription stays registered until unsubscribe() is called"]
pub struct Subscription {
    shared: Weak<Shared>,
    channel_name: String,
    topic: String,
    generation: u64,
    key: SubscriptionKey,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Remove this handler. Later calls are no-ops.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.unsubscribe(&self.topic, self.generation, &self.key, self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("key", &self.key)
            .field("active", &self.is_active())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ListenerKind {
    Connection,
    Error,
}

/// Removal handle for a connection or error listener.
#[must_use = "the listener stays registered until remove() is called"]
pub struct ListenerHandle {
    shared: Weak<Shared>,
    kind: ListenerKind,
    id: u64,
}

impl ListenerHandle {
    fn new(shared: &Arc<Shared>, kind: ListenerKind, id: u64) -> Self {
        Self {
            shared: Arc::downgrade(shared),
            kind,
            id,
        }
    }

    pub fn remove(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut listeners = lock(&shared.listeners);
        match self.kind {
            ListenerKind::Connection => {
                listeners.connection.remove(&self.id);
            }
            ListenerKind::Error => {
                listeners.error.remove(&self.id);
            }
        }
    }
}
