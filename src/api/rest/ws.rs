use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::stream::BoxStream;
use futures::SinkExt;
use futures::StreamExt;
use serde::Serialize;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use crate::error::AppError;
use crate::models::ids::OrderId;
use crate::models::principal::Principal;
use crate::state::AppState;

/// All delivery events; operators only.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    principal: Principal,
) -> Result<impl IntoResponse, AppError> {
    principal.require_privileged()?;

    let events = BroadcastStream::new(state.events.subscribe())
        .filter_map(|item| async move { item.ok() })
        .boxed();
    Ok(ws.on_upgrade(|socket| forward(socket, events)))
}

/// Live driver positions for one order, for anyone party to it.
pub async fn live_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(order_id): Path<OrderId>,
) -> Result<impl IntoResponse, AppError> {
    state.lifecycle.get(&principal, &order_id).await?;

    let positions = BroadcastStream::new(state.tracking.subscribe())
        .filter_map(move |item| {
            let order_id = order_id.clone();
            async move { item.ok().filter(|entry| entry.order_id == order_id) }
        })
        .boxed();
    Ok(ws.on_upgrade(|socket| forward(socket, positions)))
}

async fn forward<T>(socket: WebSocket, mut items: BoxStream<'static, T>)
where
    T: Serialize + Send + 'static,
{
    let (mut sender, mut receiver) = socket.split();

    info!("websocket client connected");

    let send_task = tokio::spawn(async move {
        while let Some(item) = items.next().await {
            let json = match serde_json::to_string(&item) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to serialize ws message");
                    continue;
                }
            };

            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    info!("websocket client disconnected");
}
