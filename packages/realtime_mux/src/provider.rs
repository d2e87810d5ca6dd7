//! The realtime transport seam.
//!
//! A provider hands out one [`Channel`] per topic. The multiplexer relies on
//! nothing beyond this: bindings are registered with `on_*`, the handshake is
//! started with `subscribe`, and `remove_channel` releases the connection.
//!
//! No provider method is called while the multiplexer holds its registry
//! lock, so implementations may invoke bindings and callbacks synchronously,
//! including from inside `on_system`, `on_change` or `subscribe`.

use std::sync::Arc;

use crate::event::{ChangeEvent, ConnectionState, SubscribeStatus, SystemEvent};
use crate::key::SubscriptionKey;

pub type ChangeHandler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;
pub type SystemHandler = Arc<dyn Fn(&SystemEvent) + Send + Sync>;
pub type StatusCallback = Arc<dyn Fn(SubscribeStatus) + Send + Sync>;

/// Options forwarded to [`ChannelProvider::create_channel`] when a channel is opened.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Require an authorized connection for this channel
    pub private: bool,
    /// Presence key announced on join
    pub presence_key: Option<String>,
}

pub trait Channel: Send + Sync {
    fn topic(&self) -> &str;

    /// Deliver change events matching `key` to `handler`.
    fn on_change(&self, key: &SubscriptionKey, handler: ChangeHandler);

    /// Deliver transport-level notices (including asynchronous errors) to `handler`.
    fn on_system(&self, handler: SystemHandler);

    /// Start the subscription handshake; `on_status` may be called any number of times.
    fn subscribe(&self, on_status: StatusCallback);

    fn state(&self) -> ConnectionState;

    /// Stop delivering events. Called by the provider from `remove_channel`.
    fn close(&self);
}

pub trait ChannelProvider: Send + Sync {
    fn create_channel(&self, topic: &str, options: &ChannelOptions) -> Arc<dyn Channel>;

    fn remove_channel(&self, channel: &Arc<dyn Channel>);
}
