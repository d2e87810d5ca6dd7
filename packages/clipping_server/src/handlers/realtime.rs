//! Realtime bridge: WebSocket clients subscribe through the shared multiplexer.

use axum::{
    Json,
    extract::ws::{Message, WebSocket},
    extract::{Query, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use realtime_mux::{ChangeHandler, EventFilter, RowFilter, SubscriptionKey, handler};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use crate::AppState;
use crate::error::ApiError;

/// Multiplexer introspection, keyed by channel topic.
pub async fn list_subscriptions(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.multiplexer.active_subscriptions())
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub channel: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub filter: Option<String>,
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_table() -> String {
    "*".to_string()
}

impl WsParams {
    pub fn subscription_key(&self) -> Result<SubscriptionKey, ApiError> {
        if self.channel.trim().is_empty() {
            return Err(ApiError::BadRequest("channel must not be empty".into()));
        }
        let event: EventFilter = match &self.event {
            Some(raw) => raw
                .parse()
                .map_err(|e| ApiError::BadRequest(format!("{}", e)))?,
            None => EventFilter::All,
        };
        let mut key = SubscriptionKey::new(&self.schema, &self.table).event(event);
        if let Some(filter) = &self.filter {
            RowFilter::parse(filter).map_err(|e| ApiError::BadRequest(e.to_string()))?;
            key = key.filter(filter);
        }
        Ok(key)
    }
}

pub async fn realtime_ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let key = match params.subscription_key() {
        Ok(key) => key,
        Err(e) => return e.into_response(),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.channel, key))
}

/// Serialize events into a bounded per-client queue. When the queue is full
/// the event is dropped and `overflow` is signalled so the socket loop can
/// disconnect the client.
fn forward_to(tx: mpsc::Sender<String>, overflow: Arc<Notify>) -> ChangeHandler {
    handler(move |event| {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize change event: {}", e);
                return;
            }
        };
        match tx.try_send(json) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => overflow.notify_one(),
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    })
}

async fn handle_socket(socket: WebSocket, state: AppState, channel: String, key: SubscriptionKey) {
    state.metrics.ws_client_opened();
    info!(channel = %channel, key = %key, "Realtime client connected");

    let capacity = state.file_config.realtime.ws_queue_capacity.max(1);
    let (tx, mut rx) = mpsc::channel::<String>(capacity);
    let overflow = Arc::new(Notify::new());
    let subscription =
        state
            .multiplexer
            .subscribe(&channel, key, forward_to(tx, overflow.clone()), None);

    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            _ = overflow.notified() => {
                warn!(
                    channel = %channel,
                    capacity,
                    "Realtime client fell behind, disconnecting"
                );
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            outgoing = rx.recv() => {
                let Some(json) = outgoing else { break };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("Realtime socket error: {}", e);
                        break;
                    }
                    _ => {} // clients only listen
                }
            }
        }
    }

    subscription.unsubscribe();
    state.metrics.ws_client_closed();
    info!(channel = %channel, "Realtime client disconnected");
}
