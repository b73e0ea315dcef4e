//! WebSocket session lifecycle: one client from upgrade through disconnect.
//!
//! The reader half turns client frames into [`Inbound`] values for the relay
//! dispatcher. The writer half drains the connection's bounded outbound
//! queue and sends periodic pings.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chorus_core::{ClientFrame, ConnectionId, ServerFrame};
use chorus_relay::{Connection, Inbound, Outbound};
use chorus_settings::ServerSettings;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// How long the writer may keep flushing after the reader has stopped.
const WRITER_GRACE: Duration = Duration::from_secs(1);

/// Per-connection transport settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    /// Outbound frames buffered per connection.
    pub max_send_queue: usize,
    /// Ping period; a client silent for two periods is disconnected.
    pub heartbeat_interval: Duration,
}

impl TransportConfig {
    /// Derive from loaded settings.
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            max_send_queue: settings.max_send_queue,
            heartbeat_interval: settings.heartbeat_interval(),
        }
    }
}

/// Run a WebSocket session for a connected client.
#[instrument(skip_all, fields(conn_id = %id))]
pub async fn run_ws_session(
    ws: WebSocket,
    id: ConnectionId,
    config: TransportConfig,
    inbound: mpsc::Sender<Inbound>,
    shutdown: CancellationToken,
) {
    let (ws_tx, mut ws_rx) = ws.split();
    let (tx, rx) = mpsc::channel(config.max_send_queue.max(1));
    let connection = Arc::new(Connection::new(id.clone(), tx));

    if inbound.send(Inbound::Connected(connection.clone())).await.is_err() {
        warn!("relay is not running, dropping connection");
        return;
    }
    info!("client connected");

    let closed = connection.closed_token();
    let mut writer = tokio::spawn(write_loop(ws_tx, rx, connection.clone(), config.heartbeat_interval));

    loop {
        let next = tokio::select! {
            () = closed.cancelled() => break,
            () = shutdown.cancelled() => break,
            next = ws_rx.next() => next,
        };
        let Some(Ok(msg)) = next else { break };
        connection.mark_alive();

        let text = match msg {
            Message::Text(text) => text.as_str().to_owned(),
            Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    debug!(len = data.len(), "non-UTF8 binary frame ignored");
                    continue;
                }
            },
            Message::Close(_) => {
                debug!("client sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        match ClientFrame::parse(&text) {
            Ok(frame) => {
                if inbound.send(to_inbound(&id, frame)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "invalid client frame");
                reject(&connection, &e.to_string());
            }
        }
    }

    let _ = inbound.send(Inbound::Disconnected { id: id.clone() }).await;
    connection.close(false);
    if tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }
    info!(
        dropped = connection.drop_count(),
        duration_ms = u64::try_from(connection.connected_at.elapsed().as_millis()).unwrap_or(u64::MAX),
        "client disconnected"
    );
}

/// Map a parsed client frame onto the relay's dispatch table.
pub fn to_inbound(id: &ConnectionId, frame: ClientFrame) -> Inbound {
    match frame {
        ClientFrame::Message { body, room } => Inbound::Message {
            id: id.clone(),
            body,
            room,
        },
        ClientFrame::Join { room } => Inbound::Join { id: id.clone(), room },
        ClientFrame::Leave { room } => Inbound::Leave { id: id.clone(), room },
    }
}

fn reject(connection: &Connection, reason: &str) {
    let frame = ServerFrame::Error {
        message: format!("invalid frame: {reason}"),
    };
    if let Ok(json) = frame.to_json() {
        let _ = connection.send(Arc::new(json));
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    connection: Arc<Connection>,
    heartbeat: Duration,
) {
    let closed = connection.closed_token();
    let mut ping = tokio::time::interval(heartbeat);
    // Skip the immediate first tick
    let _ = ping.tick().await;

    loop {
        tokio::select! {
            () = closed.cancelled() => break,
            item = rx.recv() => match item {
                Some(Outbound::Text(text)) => {
                    if sink.send(Message::Text(text.as_str().into())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close) => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                None => break,
            },
            _ = ping.tick() => {
                if !connection.check_alive() && connection.last_pong_elapsed() > heartbeat * 2 {
                    warn!(conn_id = %connection.id, "client unresponsive, disconnecting");
                    break;
                }
                if sink.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
    // Stop the reader too, whatever ended the writer.
    connection.close(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::RoomId;
    use serde_json::json;

    #[test]
    fn client_frames_map_to_inbound() {
        let id = ConnectionId::from("c1");
        let frame = ClientFrame::parse(r#"{"type":"message","body":{"text":"hi"},"room":"lobby"}"#).unwrap();
        match to_inbound(&id, frame) {
            Inbound::Message { id, body, room } => {
                assert_eq!(id.as_str(), "c1");
                assert_eq!(body, json!({"text": "hi"}));
                assert_eq!(room, Some(RoomId::from("lobby")));
            }
            other => panic!("unexpected {other:?}"),
        }

        let join = to_inbound(&id, ClientFrame::Join { room: RoomId::from("x") });
        assert!(matches!(join, Inbound::Join { room, .. } if room.as_str() == "x"));
        let leave = to_inbound(&id, ClientFrame::Leave { room: RoomId::from("x") });
        assert!(matches!(leave, Inbound::Leave { room, .. } if room.as_str() == "x"));
    }

    #[tokio::test]
    async fn rejection_is_an_error_frame() {
        let (tx, mut rx) = mpsc::channel(4);
        let connection = Connection::new(ConnectionId::from("c1"), tx);
        reject(&connection, "unknown variant `nope`");

        let Some(Outbound::Text(text)) = rx.recv().await else {
            panic!("expected a text frame");
        };
        let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(frame["type"], "error");
        assert!(frame["message"].as_str().unwrap().starts_with("invalid frame:"));
    }

    #[test]
    fn config_from_settings() {
        let settings = ServerSettings {
            max_send_queue: 8,
            heartbeat_interval_secs: 3,
            ..ServerSettings::default()
        };
        let config = TransportConfig::from_settings(&settings);
        assert_eq!(config.max_send_queue, 8);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(3));
    }
}
