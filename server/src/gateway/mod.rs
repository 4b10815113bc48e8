pub mod protocol;

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::config::Config;
use crate::core::auth::tokens_match;
use crate::core::registry::WsOutbound;
use crate::core::restart::RestartManager;
use crate::core::Registry;

use protocol::ServerMessage;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

pub async fn ws_handler(
    State((config, registry, _)): State<(Arc<Config>, Arc<Registry>, Arc<RestartManager>)>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(expected) = &config.auth_token {
        let ok = query.token.as_deref().map(|t| tokens_match(expected, t)).unwrap_or(false);
        if !ok {
            return axum::http::StatusCode::UNAUTHORIZED.into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_socket(socket, registry)).into_response()
}

async fn handle_socket(socket: WebSocket, registry: Arc<Registry>) {
    let (mut sink, mut stream) = socket.split();
    let (connection_id, mut outbound_rx) = registry.register_connection();

    let hello = serde_json::to_string(&ServerMessage::Connected { connection_id }).unwrap_or_default();
    if sink.send(Message::Text(hello.into())).await.is_err() {
        registry.unregister_connection(connection_id);
        return;
    }

    let registry_writer = registry.clone();
    let mut writer_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let len = msg.approx_len();
            let should_close = matches!(msg, WsOutbound::Close);
            let axum_msg = match msg {
                WsOutbound::Text(s) => Message::Text(s.to_string().into()),
                WsOutbound::Binary(b) => Message::Binary(b.to_vec().into()),
                WsOutbound::Close => Message::Close(None),
            };
            if sink.send(axum_msg).await.is_err() {
                break;
            }
            registry_writer.acknowledge_send(connection_id, len);
            if should_close {
                break;
            }
        }
    });

    let registry_reader = registry.clone();
    let mut reader_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = stream.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<serde_json::Value>(&text) {
                    Ok(value) => registry_reader.handle_client_message(connection_id, value).await,
                    Err(_) => registry_reader
                        .handle_client_message(connection_id, serde_json::json!({"type": "__invalid__"}))
                        .await,
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer_task => reader_task.abort(),
        _ = &mut reader_task => writer_task.abort(),
    }

    registry.unregister_connection(connection_id);
}
