//! Realtime change-event subscriptions multiplexed over shared channels.
//!
//! Many independent consumers may listen to the same logical channel name.
//! [`Multiplexer`] opens one provider channel per name, counts its
//! subscribers, routes each event to the handlers registered for the matching
//! [`SubscriptionKey`], and tears the channel down when the last subscriber
//! leaves.
//!
//! ```no_run
//! use std::sync::Arc;
//! use realtime_mux::{handler, LocalRealtime, Multiplexer, MultiplexerConfig, SubscriptionKey};
//!
//! # async fn demo() {
//! let hub = Arc::new(LocalRealtime::default());
//! let mux = Multiplexer::new(hub.clone(), MultiplexerConfig::default());
//! let sub = mux.subscribe(
//!     "clips",
//!     SubscriptionKey::new("public", "upload_sessions"),
//!     handler(|event| println!("{:?}", event.change)),
//!     None,
//! );
//! sub.unsubscribe();
//! # }
//! ```

pub mod event;
pub mod health;
pub mod key;
pub mod local;
pub mod multiplexer;
pub mod provider;

pub use event::{ChangeEvent, ChangeType, ChannelError, ConnectionState, SubscribeStatus, SystemEvent};
pub use health::{HealthMonitor, HealthSampling};
pub use key::{EventFilter, FilterError, FilterOp, RowFilter, SubscriptionKey};
pub use local::{DEFAULT_BROADCAST_CAPACITY, LocalChannel, LocalRealtime};
pub use multiplexer::{
    ActiveChannel, ConnectionListener, ErrorListener, ListenerHandle, Multiplexer,
    MultiplexerConfig, Subscription, SubscriptionRegistry, TOPIC_PREFIX, handler, topic_for,
};
pub use provider::{
    ChangeHandler, Channel, ChannelOptions, ChannelProvider, StatusCallback, SystemHandler,
};
