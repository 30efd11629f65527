//! Transport-independent connection loop.
//!
//! Multiplexes inbound frames, heartbeat ticks and the idle deadline for one
//! session. The websocket handler feeds it; tests drive it with channels.

use futures::{Stream, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use super::heartbeat::HeartbeatMonitor;
use super::manager::SessionManager;
use super::protocol::{ErrorReason, OutboundFrame};
use super::state::HeartbeatStatus;

/// What the transport delivered.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Text(String),
    /// A frame that is not UTF-8 text.
    Malformed,
    Closed,
}

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionExit {
    ClientClosed,
    HeartbeatTimeout,
    IdleTimeout,
    WriterClosed,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub heartbeat_timeout: Duration,
    pub unauthenticated_idle: Duration,
}

pub async fn drive_session<S>(
    mut inbound: S,
    outbound: mpsc::Sender<OutboundFrame>,
    mut manager: SessionManager,
    settings: ConnectionSettings,
) -> ConnectionExit
where
    S: Stream<Item = TransportEvent> + Unpin,
{
    let mut monitor = HeartbeatMonitor::start(settings.heartbeat_timeout);
    let mut last_activity = Instant::now();

    let exit = loop {
        let idle_deadline = last_activity + settings.unauthenticated_idle;
        let unauthenticated = !manager.is_authenticated();

        tokio::select! {
            Some(tick) = monitor.tick() => {
                if manager.check_heartbeat(tick) == HeartbeatStatus::Expired {
                    tracing::warn!(session_id = %manager.session_id(), "Heartbeat window missed");
                    let _ = outbound.send(OutboundFrame::heartbeat_timeout()).await;
                    break ConnectionExit::HeartbeatTimeout;
                }
            }
            _ = sleep_until(idle_deadline), if unauthenticated => {
                tracing::info!(session_id = %manager.session_id(), "Closing idle unauthenticated socket");
                break ConnectionExit::IdleTimeout;
            }
            event = inbound.next() => match event {
                Some(TransportEvent::Text(text)) => {
                    last_activity = Instant::now();
                    let reply = manager.handle_text(&text).await;
                    if outbound.send(reply).await.is_err() {
                        break ConnectionExit::WriterClosed;
                    }
                }
                Some(TransportEvent::Malformed) => {
                    last_activity = Instant::now();
                    tracing::debug!(session_id = %manager.session_id(), "Undecodable frame");
                    let reply = OutboundFrame::error(None, ErrorReason::InvalidFrame);
                    if outbound.send(reply).await.is_err() {
                        break ConnectionExit::WriterClosed;
                    }
                }
                Some(TransportEvent::Closed) | None => break ConnectionExit::ClientClosed,
            },
        }
    };

    monitor.cancel();
    manager.terminate().await;
    exit
}
