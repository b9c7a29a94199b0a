//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::{JoinError, RoomCommand, RoomCommandKind, RoomHandle};
use crate::net::{ChannelTransport, SharedTransport, Transport, TransportError};
use crate::util::rate_limit::ConnectionRateLimiter;
use crate::ws::protocol::{
    decode, encode, ClientMsg, Envelope, ErrorData, PlayerId, ServerEnvelope, ServerMsg,
};

/// Outbound messages buffered per connection
const OUTBOX_CAPACITY: usize = 512;

/// Outbox handle kept by the session itself
///
/// Only the room holds the outbox strongly. Once the room drops the player
/// the channel closes and the writer ends the session.
type SessionOutbox = Weak<dyn Transport<ServerEnvelope>>;

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    let player_id = Uuid::new_v4();
    info!(player_id = %player_id, "New WebSocket connection");

    let (mut ws_sink, ws_stream) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<ServerEnvelope>(OUTBOX_CAPACITY);

    let (room, outbox) = match join_room(&state, player_id, out_tx) {
        Ok(joined) => joined,
        Err(e) => {
            warn!(player_id = %player_id, error = %e, "No room available");
            let msg = ServerMsg::Error(ErrorData {
                code: "room_unavailable".to_string(),
                message: e.to_string(),
            });
            let _ = send_envelope(&mut ws_sink, &Envelope::new(msg, state.clock.now_ms())).await;
            return;
        }
    };
    let inbox: SharedTransport<RoomCommand> = state.decorate(Arc::new(room.inbox_transport()));
    debug!(player_id = %player_id, room_id = %room.id, "Session started");

    run_session(player_id, ws_sink, ws_stream, out_rx, inbox, outbox, &state).await;

    // Cleanup on disconnect
    state.rooms.leave(player_id, "disconnected").await;
    info!(player_id = %player_id, "WebSocket connection closed");
}

/// Place the player in a room, handing the room sole ownership of the outbox
fn join_room(
    state: &AppState,
    player_id: PlayerId,
    out_tx: mpsc::Sender<ServerEnvelope>,
) -> Result<(RoomHandle, SessionOutbox), JoinError> {
    let outbox: SharedTransport<ServerEnvelope> =
        state.decorate(Arc::new(ChannelTransport::new(out_tx)));
    let weak = Arc::downgrade(&outbox);
    let room = state.rooms.join(player_id, outbox)?;
    Ok((room, weak))
}

/// Run the WebSocket session with read/write split
async fn run_session(
    player_id: PlayerId,
    ws_sink: SplitSink<WebSocket, Message>,
    ws_stream: SplitStream<WebSocket>,
    out_rx: mpsc::Receiver<ServerEnvelope>,
    inbox: SharedTransport<RoomCommand>,
    outbox: SessionOutbox,
    state: &AppState,
) {
    let mut writer = tokio::spawn(write_loop(player_id, ws_sink, out_rx));

    tokio::select! {
        _ = read_loop(player_id, ws_stream, inbox, outbox, state) => {}
        _ = &mut writer => {
            debug!(player_id = %player_id, "Writer finished");
        }
    }

    writer.abort();
}

/// Room outbox -> WebSocket
async fn write_loop(
    player_id: PlayerId,
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<ServerEnvelope>,
) {
    while let Some(envelope) = out_rx.recv().await {
        if let Err(e) = send_envelope(&mut ws_sink, &envelope).await {
            debug!(player_id = %player_id, error = %e, "WebSocket send failed");
            return;
        }
    }

    // Room dropped the player (timeout or shutdown)
    info!(player_id = %player_id, "Room released session, closing socket");
    let _ = ws_sink.send(Message::Close(None)).await;
}

/// WebSocket -> room inbox
async fn read_loop(
    player_id: PlayerId,
    mut ws_stream: SplitStream<WebSocket>,
    inbox: SharedTransport<RoomCommand>,
    outbox: SessionOutbox,
    state: &AppState,
) {
    let rate_limiter = ConnectionRateLimiter::new();

    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if !rate_limiter.check_message() {
                    warn!(player_id = %player_id, "Rate limited client message");
                    continue;
                }

                match decode::<ClientMsg>(&text) {
                    Ok(envelope) => {
                        let cmd = RoomCommand {
                            player_id,
                            kind: RoomCommandKind::Message(envelope.msg),
                        };
                        match inbox.send(cmd) {
                            Ok(()) => {}
                            Err(TransportError::Full) => {
                                warn!(player_id = %player_id, "Room inbox full, message dropped");
                            }
                            Err(TransportError::Closed) => {
                                debug!(player_id = %player_id, "Room inbox closed");
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(player_id = %player_id, error = %e, "Failed to parse client message");
                        let msg = ServerMsg::Error(ErrorData {
                            code: "malformed".to_string(),
                            message: e.to_string(),
                        });
                        match outbox.upgrade() {
                            Some(outbox) => {
                                let _ = outbox.send(Envelope::new(msg, state.clock.now_ms()));
                            }
                            None => break,
                        }
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                warn!(player_id = %player_id, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                debug!(player_id = %player_id, "Transport keepalive");
            }
            Ok(Message::Close(_)) => {
                info!(player_id = %player_id, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(player_id = %player_id, error = %e, "WebSocket error");
                break;
            }
        }
    }
}

/// Encode and send one envelope as a text frame
async fn send_envelope(
    sink: &mut SplitSink<WebSocket, Message>,
    envelope: &ServerEnvelope,
) -> Result<(), String> {
    let json = encode(envelope).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}
