//! The control-connection endpoint: one WebSocket per tunnel, opened by
//! the tunnel-owning peer at `/api/tunnel/:tunnel_id`.
//!
//! One task runs both directions: outbound messages funnel through the
//! registry's mpsc channel so writes never interleave, and the inbound
//! stream is dispatched message by message. A bad message or a dead
//! sub-connection never takes this loop down; unrelated traffic
//! multiplexed on the same socket must survive.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use portgate_shared::frame::{self, Decoded};
use portgate_shared::protocol::{ControlMessage, WsEvent, WsEventKind, MAX_MESSAGE_SIZE};

use crate::registry::{SubConnMsg, Tunnel, CLOSE_GOING_AWAY};
use crate::{correlator, AppState};

pub async fn control_handler(
    ws: WebSocketUpgrade,
    Path(tunnel_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    // Accept only ids the allocation side reserved beforehand.
    if state.registry.get_by_tunnel_id(&tunnel_id).is_none() {
        warn!(%tunnel_id, "control connection for unreserved tunnel id");
        return StatusCode::NOT_FOUND.into_response();
    }
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| run_control(socket, tunnel_id, state))
        .into_response()
}

async fn run_control(socket: WebSocket, tunnel_id: String, state: AppState) {
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
    let Some(epoch) = state.registry.attach(&tunnel_id, out_tx).await else {
        // The reservation was revoked between the upgrade check and here.
        return;
    };

    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    dispatch_control_message(&state, &tunnel_id, &text).await;
                }
                Some(Ok(Message::Binary(buf))) => {
                    dispatch_frame(&state, &tunnel_id, &buf);
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = sender.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(err)) => {
                    warn!(%tunnel_id, error = %err, "control connection error");
                    break;
                }
            },
            outbound = out_rx.recv() => match outbound {
                Some(msg) => {
                    if sender.send(msg).await.is_err() {
                        break;
                    }
                }
                // All senders dropped: this connection was superseded.
                None => break,
            },
        }
    }

    // Only the reader that actually tore the tunnel down frees its TCP
    // listener; a superseded one must leave its successor's port alone.
    if state.registry.detach(&tunnel_id, epoch).await {
        state.tcp.release(&tunnel_id);
    }
    info!(%tunnel_id, "control connection closed");
}

async fn dispatch_control_message(state: &AppState, tunnel_id: &str, text: &str) {
    let msg = match ControlMessage::decode(text) {
        Ok(msg) => msg,
        Err(err) => {
            warn!(%tunnel_id, error = %err, "dropping undecodable control message");
            return;
        }
    };
    let Some(tunnel) = state.registry.get_by_tunnel_id(tunnel_id) else {
        return;
    };
    match msg {
        ControlMessage::HttpResponse(response) => correlator::resolve_response(&tunnel, response),
        ControlMessage::WsEvent(event) => deliver_ws_event(state, &tunnel, event),
        ControlMessage::HttpRequest(_) => {
            debug!(%tunnel_id, "dropping unexpected http_request from peer");
        }
    }
}

fn deliver_ws_event(state: &AppState, tunnel: &Tunnel, event: WsEvent) {
    match event.kind {
        WsEventKind::Text { text } => {
            deliver(state, tunnel, &event.connection_id, SubConnMsg::Text(text));
        }
        WsEventKind::Binary { data } => {
            deliver(state, tunnel, &event.connection_id, SubConnMsg::Data(data));
        }
        WsEventKind::Close { code, reason } => {
            // Unregister first: the bridge task must not echo this close
            // back upstream, and the id is terminal either way.
            if let Some(conn) = state
                .registry
                .unregister_subconn(&tunnel.tunnel_id, &event.connection_id)
            {
                let _ = conn.tx.try_send(SubConnMsg::Close { code, reason });
            }
        }
        WsEventKind::Open { .. } => {
            debug!(tunnel_id = %tunnel.tunnel_id, "dropping unexpected open event from peer");
        }
    }
}

fn dispatch_frame(state: &AppState, tunnel_id: &str, buf: &[u8]) {
    match frame::decode(buf) {
        Ok(Decoded::Frame(frame)) => {
            let Some(tunnel) = state.registry.get_by_tunnel_id(tunnel_id) else {
                return;
            };
            if frame.is_close() {
                if let Some(conn) = state
                    .registry
                    .unregister_subconn(tunnel_id, &frame.connection_id)
                {
                    let _ = conn.tx.try_send(SubConnMsg::Close {
                        code: CLOSE_GOING_AWAY,
                        reason: None,
                    });
                }
            } else {
                deliver(
                    state,
                    &tunnel,
                    &frame.connection_id,
                    SubConnMsg::Data(frame.payload),
                );
            }
        }
        // WebSocket messages are discrete; a short one cannot grow.
        Ok(Decoded::Incomplete) => {
            warn!(%tunnel_id, len = buf.len(), "dropping truncated binary frame");
        }
        Err(err) => {
            warn!(%tunnel_id, error = %err, "dropping malformed binary frame");
        }
    }
}

/// Delivers one message to a sub-connection. An unknown id is an expected
/// race after close. A consumer that cannot keep up is dropped rather
/// than letting it stall every other connection on this tunnel.
fn deliver(state: &AppState, tunnel: &Tunnel, connection_id: &str, msg: SubConnMsg) {
    let Some(conn) = tunnel.subconn(connection_id) else {
        trace!(
            tunnel_id = %tunnel.tunnel_id,
            connection_id,
            "dropping message for unknown sub-connection"
        );
        return;
    };
    if conn.tx.try_send(msg).is_err() {
        debug!(
            tunnel_id = %tunnel.tunnel_id,
            connection_id,
            "dropping slow sub-connection"
        );
        // Removing the last sender closes the bridge task's channel.
        state
            .registry
            .unregister_subconn(&tunnel.tunnel_id, connection_id);
    }
}
