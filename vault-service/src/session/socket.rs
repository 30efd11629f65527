//! Websocket endpoint for agent sessions.

use axum::{
    extract::{
        ws::{
            close_code, rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket,
            WebSocketUpgrade,
        },
        ConnectInfo, Path, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use service_core::error::AppError;
use service_core::middleware::rate_limit::resolve_client_ip;
use std::net::{IpAddr, SocketAddr};
use tokio::sync::mpsc;
use tracing::Instrument;

use super::connection::{drive_session, ConnectionExit, ConnectionSettings, TransportEvent};
use super::manager::SessionManager;
use super::protocol::{OutboundFrame, LOBBY_TOPIC};
use crate::AppState;

const OUTBOUND_QUEUE_SIZE: usize = 64;

/// Upgrade to an agent session. Only the lobby topic is joinable.
#[utoipa::path(
    get,
    path = "/v1/agent/socket/{topic}",
    params(
        ("topic" = String, Path, description = "Must be `agent:lobby`")
    ),
    responses(
        (status = 101, description = "Websocket session established"),
        (status = 401, description = "Topic not joinable", body = ErrorResponse),
        (status = 429, description = "Too many connection attempts", body = ErrorResponse)
    ),
    tag = "Agent Session"
)]
pub async fn agent_socket(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    Path(topic): Path<String>,
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Response {
    if topic != LOBBY_TOPIC {
        tracing::warn!(topic = %topic, "Rejected join on non-lobby topic");
        return AppError::Unauthorized(anyhow::anyhow!("Topic is not joinable")).into_response();
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let peer = connect_info.map(|ConnectInfo(addr)| addr);
    let Some(source_ip) =
        resolve_client_ip(&headers, peer, state.config.security.trust_forwarded_for)
    else {
        return AppError::BadRequest(anyhow::anyhow!("Unable to determine client address"))
            .into_response();
    };

    ws.on_upgrade(move |socket| handle_socket(socket, source_ip, state))
}

async fn handle_socket(socket: WebSocket, source_ip: IpAddr, state: AppState) {
    let (mut sender, receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<OutboundFrame>(OUTBOUND_QUEUE_SIZE);

    let manager = SessionManager::join(
        source_ip,
        state.config.session.heartbeat_timeout(),
        state.approle.clone(),
        state.collaborators.clone(),
    );
    let span = tracing::info_span!(
        "agent_session",
        session_id = %manager.session_id(),
        source_ip = %source_ip
    );

    let writer = tokio::spawn(
        async move {
            while let Some(frame) = rx.recv().await {
                let disconnect = matches!(frame, OutboundFrame::Disconnect { .. });
                match serde_json::to_string(&frame) {
                    Ok(json) => {
                        if let Err(e) = sender.send(Message::Text(json)).await {
                            tracing::debug!(error = %e, "Failed to send websocket frame");
                            break;
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "Failed to encode outbound frame"),
                }
                if disconnect {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::POLICY,
                            reason: "heartbeat_timeout".into(),
                        })))
                        .await;
                    break;
                }
            }
            let _ = sender.close().await;
        }
        .instrument(span.clone()),
    );

    let inbound = Box::pin(receiver.filter_map(|message| async move { transport_event(message) }));

    let settings = ConnectionSettings {
        heartbeat_timeout: state.config.session.heartbeat_timeout(),
        unauthenticated_idle: state.config.session.unauthenticated_idle(),
    };

    let exit = drive_session(inbound, tx, manager, settings)
        .instrument(span.clone())
        .await;

    if let Err(e) = writer.await {
        tracing::debug!(error = %e, "Websocket writer task ended abnormally");
    }

    span.in_scope(|| match exit {
        ConnectionExit::HeartbeatTimeout => tracing::warn!(?exit, "Agent session closed"),
        _ => tracing::info!(?exit, "Agent session closed"),
    });
}

/// Map a websocket message onto the session transport. Pings and pongs are
/// handled by axum and never reach the session.
fn transport_event(message: Result<Message, axum::Error>) -> Option<TransportEvent> {
    match message {
        Ok(Message::Text(text)) => Some(TransportEvent::Text(text)),
        Ok(Message::Binary(data)) => Some(
            String::from_utf8(data)
                .map(TransportEvent::Text)
                .unwrap_or(TransportEvent::Malformed),
        ),
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
        Ok(Message::Close(_)) => Some(TransportEvent::Closed),
        Err(e) => {
            tracing::debug!(error = %e, "Websocket receive error");
            Some(TransportEvent::Closed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_frames_are_decoded_or_flagged() {
        assert!(matches!(
            transport_event(Ok(Message::Binary(br#"{"event":"heartbeat"}"#.to_vec()))),
            Some(TransportEvent::Text(text)) if text == r#"{"event":"heartbeat"}"#
        ));
        assert!(matches!(
            transport_event(Ok(Message::Binary(vec![0xff, 0xfe, 0x00]))),
            Some(TransportEvent::Malformed)
        ));
    }

    #[test]
    fn control_frames() {
        assert!(transport_event(Ok(Message::Ping(vec![1]))).is_none());
        assert!(matches!(
            transport_event(Ok(Message::Close(None))),
            Some(TransportEvent::Closed)
        ));
    }
}
