use std::sync::Arc;

use axum::{
    Router,
    extract::{
        WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
    routing::get,
};
use tokio::sync::mpsc;

use crate::relay::session::RelaySession;
use crate::relay::types::{ClientCommand, ClientEvent};
use crate::{config, manager};

pub fn relay_router() -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_upgrade))
}

async fn index() -> &'static str {
    "relay route!"
}

async fn ws_upgrade(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(handle_socket)
}

/// One connection, one session. The single receive loop is what keeps
/// binary frames strictly in delivery order: chunks are forwarded one at a
/// time, never concurrently.
async fn handle_socket(mut socket: WebSocket) {
    let id = uuid::Uuid::new_v4().to_string();
    let (events_tx, mut events_rx) = mpsc::channel::<ClientEvent>(64);
    let settings = Arc::clone(&config::config().settings);
    let session = RelaySession::new(id.clone(), settings, events_tx);

    if let Err(e) = manager::add_session(&id, Arc::clone(&session)).await {
        log::error!("session {}: registration failed: {:#}", id, e);
        return;
    }
    log::info!("session {}: connected", id);

    loop {
        tokio::select! {
            event = events_rx.recv() => {
                let Some(event) = event else { break };
                if send_event(&mut socket, &event).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_command(&session, &mut socket, text.as_str()).await;
                    }
                    Some(Ok(Message::Binary(chunk))) => {
                        if let Err(e) = session.submit_chunk(chunk).await {
                            // Forwarding failures never take down the
                            // transport connection.
                            log::debug!("session {}: chunk dropped: {}", id, e);
                            let _ = send_event(
                                &mut socket,
                                &ClientEvent::StreamError { reason: e.to_string() },
                            )
                            .await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("session {}: socket error: {}", id, e);
                        break;
                    }
                }
            }
        }
    }

    // Explicit stop and client disconnect converge here; stop is
    // idempotent, so an already-stopped session is a no-op.
    session.stop().await;
    log::info!("session {}: disconnected", id);
}

async fn handle_command(session: &RelaySession, socket: &mut WebSocket, text: &str) {
    match serde_json::from_str::<ClientCommand>(text) {
        Ok(ClientCommand::Configure(config)) => {
            // Config errors are synchronous; `configured` itself arrives
            // through the session's event channel once the encoder is up.
            if let Err(e) = session.configure(config).await {
                let _ = send_event(
                    socket,
                    &ClientEvent::ConfigError {
                        reason: e.to_string(),
                    },
                )
                .await;
            }
        }
        Ok(ClientCommand::Stop) => {
            session.stop().await;
            let _ = send_event(socket, &ClientEvent::Stopped).await;
        }
        Err(e) => {
            log::debug!("session {}: unrecognized message: {}", session.id(), e);
            let _ = send_event(
                socket,
                &ClientEvent::StreamError {
                    reason: "unrecognized message".to_string(),
                },
            )
            .await;
        }
    }
}

async fn send_event(socket: &mut WebSocket, event: &ClientEvent) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).unwrap_or_default();
    socket.send(Message::Text(text.into())).await
}
