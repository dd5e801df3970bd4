//! WebSocket endpoint: channel subscriptions, task requests and broker
//! fan-out for one connection at a time.

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use robe_shared::{events, Envelope, TaskRequest, TASKS_CHANNEL};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::broker::{decode_frame, Broker};
use crate::state::AppState;

type Subscriptions = Arc<RwLock<HashSet<String>>>;

/// WebSocket upgrade handler
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Drive one connection until the peer goes away
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let client_id = Uuid::new_v4();
    tracing::info!(%client_id, "Socket connected");

    let (forward_tx, mut forward_rx) = mpsc::unbounded_channel::<Envelope>();
    state.clients.register(client_id, forward_tx.clone());
    let subscriptions: Subscriptions = Arc::new(RwLock::new(HashSet::new()));

    let broker_task = tokio::spawn(forward_broker_frames(
        state.broker.subscribe(),
        client_id,
        Arc::clone(&subscriptions),
        forward_tx.clone(),
    ));

    // Task to forward messages to the WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(envelope) = forward_rx.recv().await {
            let json = match envelope.to_json() {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("Failed to encode frame: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Main receive loop
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match Envelope::parse(&text) {
                Ok(envelope) => {
                    handle_envelope(envelope, client_id, &subscriptions, &forward_tx, &state)
                }
                Err(e) => tracing::warn!(%client_id, "Dropping frame: {}", e),
            },
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::debug!(%client_id, "Socket read error: {}", e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup
    state.clients.unregister(&client_id);
    broker_task.abort();
    send_task.abort();
    tracing::info!(%client_id, "Socket closed");
}

fn handle_envelope(
    envelope: Envelope,
    client_id: Uuid,
    subscriptions: &Subscriptions,
    forward_tx: &mpsc::UnboundedSender<Envelope>,
    state: &AppState,
) {
    let Envelope {
        channel,
        event,
        content,
    } = envelope;

    match event.as_str() {
        events::SUBSCRIBE => {
            tracing::debug!(%client_id, %channel, "Subscribed");
            subscriptions.write().insert(channel.clone());
            let _ = forward_tx.send(Envelope::new(channel, events::SUBSCRIBED, Value::Null));
        }
        events::UNSUBSCRIBE => {
            tracing::debug!(%client_id, %channel, "Unsubscribed");
            subscriptions.write().remove(&channel);
            let _ = forward_tx.send(Envelope::new(channel, events::UNSUBSCRIBED, Value::Null));
        }
        events::REQUEST if channel == TASKS_CHANNEL => {
            match serde_json::from_value::<TaskRequest>(content) {
                Ok(request) => spawn_task(request, client_id, state),
                Err(e) => tracing::warn!(%client_id, "Dropping malformed task request: {}", e),
            }
        }
        _ if subscriptions.read().contains(&channel) => {
            relay(&state.broker, &channel, &event, content);
        }
        _ => {
            tracing::warn!(%client_id, %channel, %event, "Dropping frame for unsubscribed channel");
        }
    }
}

/// Run a task off the receive loop and unicast the response back.
fn spawn_task(request: TaskRequest, client_id: Uuid, state: &AppState) {
    let dispatcher = Arc::clone(&state.dispatcher);
    let clients = state.clients.clone();
    tokio::spawn(async move {
        let response = dispatcher.dispatch(request, client_id).await;
        let content = match serde_json::to_value(&response) {
            Ok(content) => content,
            Err(e) => {
                tracing::error!(task = %response.task, "Failed to encode response: {}", e);
                return;
            }
        };
        if !clients.send_to(&client_id, Envelope::new(TASKS_CHANNEL, events::RESPONSE, content)) {
            tracing::debug!(%client_id, task = %response.task, "Client left before its response");
        }
    });
}

fn relay(broker: &Broker, channel: &str, event: &str, content: Value) {
    if let Err(e) = broker.publish(channel, None, event, content) {
        tracing::warn!(%channel, "Failed to publish: {}", e);
    }
}

/// Forward bus frames addressed to this connection
async fn forward_broker_frames(
    mut bus: broadcast::Receiver<Arc<Vec<u8>>>,
    client_id: Uuid,
    subscriptions: Subscriptions,
    forward_tx: mpsc::UnboundedSender<Envelope>,
) {
    let me = client_id.to_string();
    loop {
        let raw = match bus.recv().await {
            Ok(raw) => raw,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(%client_id, skipped, "Broker subscriber lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let frame = match decode_frame(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Dropping broker frame: {}", e);
                continue;
            }
        };
        let deliver = frame.is_for(&me, &subscriptions.read());
        if deliver && forward_tx.send(frame.envelope).is_err() {
            break;
        }
    }
}
