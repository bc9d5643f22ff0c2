//! Public ingress: the fallback handler every tunneled host lands on.
//!
//! Plain requests become unary envelopes answered through the correlator;
//! WebSocket upgrades become event streams bridged over the control
//! connection. Public callers only ever see transport-level failures
//! (502, close code 1011), never protocol internals.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use hyper::header::{HeaderName, HeaderValue};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use portgate_shared::protocol::{HttpRequest, WsEvent, WsEventKind};

use crate::registry::{SubConnMsg, Tunnel, CLOSE_GOING_AWAY};
use crate::routing::{self, RouteTarget};
use crate::{correlator, headers, AppState};

/// Close code for "relay cannot serve this socket" (internal error /
/// service unavailable).
const CLOSE_UNAVAILABLE: u16 = 1011;

/// WebSocket close with no status code observed.
const CLOSE_NO_STATUS: u16 = 1005;

pub async fn public_handler(
    State(state): State<AppState>,
    ws: Option<WebSocketUpgrade>,
    req: Request<Body>,
) -> Response {
    let Some(route) = routing::resolve(req.headers(), req.uri(), &state.config.domain) else {
        debug!(uri = %req.uri(), "no routing key for public request");
        return match ws {
            Some(ws) => reject_ws(ws),
            None => bad_gateway("no tunnel for this host"),
        };
    };

    let tunnel = state.registry.get_by_subdomain(&route.public_key);
    let tunnel = match tunnel {
        Some(tunnel) if tunnel.is_attached().await => tunnel,
        _ => {
            debug!(public_key = %route.public_key, "tunnel missing or not connected");
            return match ws {
                Some(ws) => reject_ws(ws),
                None => bad_gateway("tunnel unavailable"),
            };
        }
    };

    match ws {
        Some(ws) => upgrade_public_ws(ws, state, tunnel, route, req),
        None => bridge_http(state, tunnel, route, req).await,
    }
}

fn bad_gateway(msg: &str) -> Response {
    (StatusCode::BAD_GATEWAY, format!("Bad Gateway: {msg}")).into_response()
}

/// Accepts the handshake, then closes immediately: the caller gets a
/// clean close code instead of a failed upgrade.
fn reject_ws(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|mut socket| async move {
        let _ = socket
            .send(WsMessage::Close(Some(CloseFrame {
                code: CLOSE_UNAVAILABLE,
                reason: "tunnel unavailable".into(),
            })))
            .await;
    })
}

// ---- unary HTTP path ----

async fn bridge_http(
    state: AppState,
    tunnel: Arc<Tunnel>,
    route: RouteTarget,
    req: Request<Body>,
) -> Response {
    let method = req.method().to_string();
    let query = req.uri().query().map(str::to_string);
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let headers = headers::proxied_request_headers(req.headers(), route.host.as_deref(), "http");

    let body = match axum::body::to_bytes(req.into_body(), state.config.max_body_bytes).await {
        Ok(bytes) if !bytes.is_empty() => Some(bytes.to_vec()),
        Ok(_) => None,
        Err(_) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
    };

    let envelope = HttpRequest {
        id: String::new(),
        method,
        path: route.path,
        query,
        headers,
        body,
        content_type,
    };

    match correlator::forward_request(&tunnel, envelope, state.config.request_timeout).await {
        Ok(response) => {
            let status = StatusCode::from_u16(response.status.unwrap_or(502))
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let mut builder = hyper::Response::builder().status(status);
            if let Some(headers_mut) = builder.headers_mut() {
                for (name, value) in response.headers {
                    if let (Ok(name), Ok(value)) = (
                        HeaderName::from_bytes(name.as_bytes()),
                        HeaderValue::from_str(&value),
                    ) {
                        headers_mut.append(name, value);
                    }
                }
            }
            match builder.body(Body::from(response.body.unwrap_or_default())) {
                Ok(response) => response.into_response(),
                Err(_) => bad_gateway("invalid upstream response"),
            }
        }
        Err(err) => {
            warn!(
                subdomain = %tunnel.subdomain,
                error = %err,
                "tunnel forward failed"
            );
            bad_gateway("tunnel unavailable")
        }
    }
}

// ---- WebSocket path ----

fn upgrade_public_ws(
    ws: WebSocketUpgrade,
    state: AppState,
    tunnel: Arc<Tunnel>,
    route: RouteTarget,
    req: Request<Body>,
) -> Response {
    // Echo the first requested sub-protocol so the handshake succeeds;
    // the actual negotiation happens end to end via the open event.
    let protocol = req
        .headers()
        .get("sec-websocket-protocol")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    let query = req.uri().query().map(str::to_string);

    let ws = match &protocol {
        Some(protocol) => ws.protocols([protocol.clone()]),
        None => ws,
    };
    ws.on_upgrade(move |socket| run_public_ws(socket, state, tunnel, route, query, protocol))
}

async fn run_public_ws(
    socket: WebSocket,
    state: AppState,
    tunnel: Arc<Tunnel>,
    route: RouteTarget,
    query: Option<String>,
    protocol: Option<String>,
) {
    let connection_id = Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::channel::<SubConnMsg>(64);
    let session = match state
        .registry
        .register_subconn(&tunnel.tunnel_id, &connection_id, tx)
        .await
    {
        Ok(session) => session,
        Err(err) => {
            debug!(tunnel_id = %tunnel.tunnel_id, error = %err, "ws bridge lost its tunnel");
            close_now(socket, CLOSE_UNAVAILABLE).await;
            return;
        }
    };

    let open = WsEvent {
        connection_id: connection_id.clone(),
        kind: WsEventKind::Open {
            path: route.path,
            query,
            protocol,
        },
    };
    if state
        .registry
        .send_ws_event(&tunnel.tunnel_id, open)
        .await
        .is_err()
    {
        state.registry.unregister_by_session(session);
        close_now(socket, CLOSE_UNAVAILABLE).await;
        return;
    }

    let (mut sender, mut receiver) = socket.split();
    // Close observed from the public side; None when the relay closed.
    let mut observed: Option<(u16, Option<String>)> = None;

    loop {
        tokio::select! {
            inbound = receiver.next() => match inbound {
                Some(Ok(WsMessage::Text(text))) => {
                    let event = WsEvent {
                        connection_id: connection_id.clone(),
                        kind: WsEventKind::Text { text },
                    };
                    if state.registry.send_ws_event(&tunnel.tunnel_id, event).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    let event = WsEvent {
                        connection_id: connection_id.clone(),
                        kind: WsEventKind::Binary { data },
                    };
                    if state.registry.send_ws_event(&tunnel.tunnel_id, event).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Ping(payload))) => {
                    let _ = sender.send(WsMessage::Pong(payload)).await;
                }
                Some(Ok(WsMessage::Pong(_))) => {}
                Some(Ok(WsMessage::Close(frame))) => {
                    observed = Some(match frame {
                        Some(frame) => (
                            frame.code,
                            (!frame.reason.is_empty()).then(|| frame.reason.to_string()),
                        ),
                        None => (CLOSE_NO_STATUS, None),
                    });
                    break;
                }
                Some(Err(_)) | None => break,
            },
            delivery = rx.recv() => match delivery {
                Some(SubConnMsg::Text(text)) => {
                    if sender.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(SubConnMsg::Data(data)) => {
                    if sender.send(WsMessage::Binary(data)).await.is_err() {
                        break;
                    }
                }
                Some(SubConnMsg::Close { code, reason }) => {
                    let _ = sender
                        .send(WsMessage::Close(Some(CloseFrame {
                            code,
                            reason: reason.unwrap_or_default().into(),
                        })))
                        .await;
                    break;
                }
                // Channel dropped by a teardown: the tunnel went away.
                None => {
                    let _ = sender
                        .send(WsMessage::Close(Some(CloseFrame {
                            code: CLOSE_GOING_AWAY,
                            reason: "".into(),
                        })))
                        .await;
                    break;
                }
            },
        }
    }

    // Still registered means the public side closed first: report it
    // upstream. An upstream close or a teardown already removed the id,
    // and sending a close event for it would violate close-is-terminal.
    if let Some(ids) = state.registry.unregister_by_session(session) {
        let (code, reason) = observed.unwrap_or((CLOSE_NO_STATUS, None));
        let close = WsEvent {
            connection_id: ids.connection_id,
            kind: WsEventKind::Close { code, reason },
        };
        let _ = state.registry.send_ws_event(&ids.tunnel_id, close).await;
    }
}

async fn close_now(mut socket: WebSocket, code: u16) {
    let _ = socket
        .send(WsMessage::Close(Some(CloseFrame {
            code,
            reason: "tunnel unavailable".into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::registry::Registry;
    use crate::tcp::TcpGateway;
    use axum::extract::ws::Message;
    use axum::routing::any;
    use axum::Router;
    use portgate_shared::protocol::ControlMessage;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame as TungsteniteCloseFrame;
    use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

    fn test_state() -> AppState {
        let registry = Arc::new(Registry::new());
        AppState {
            tcp: Arc::new(TcpGateway::new(registry.clone(), 0..=0)),
            registry,
            config: Arc::new(RelayConfig {
                domain: "example.com".to_string(),
                port: 0,
                request_timeout: Duration::from_secs(1),
                max_body_bytes: 1024,
                tcp_ports: 0..=0,
            }),
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<Message>) -> WsEvent {
        match rx.recv().await.unwrap() {
            Message::Text(text) => match ControlMessage::decode(&text).unwrap() {
                ControlMessage::WsEvent(event) => event,
                other => panic!("expected ws_event, got {other:?}"),
            },
            other => panic!("expected text message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_public_ws_lifecycle_reaches_upstream() {
        let state = test_state();
        state.registry.reserve("falcon-1234", "t1").unwrap();
        let (control_tx, mut control_rx) = mpsc::channel(16);
        state.registry.attach("t1", control_tx).await.unwrap();

        let app = Router::new()
            .fallback(any(public_handler))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut request = format!("ws://{addr}/live").into_client_request().unwrap();
        request.headers_mut().insert(
            "x-forwarded-host",
            "falcon-1234.example.com".parse().unwrap(),
        );
        let (mut public, _) = tokio_tungstenite::connect_async(request).await.unwrap();

        // Open first, carrying a fresh connection id and the public path.
        let open = next_event(&mut control_rx).await;
        let connection_id = open.connection_id.clone();
        assert!(!connection_id.is_empty());
        assert!(matches!(open.kind, WsEventKind::Open { ref path, .. } if path == "/live"));

        public
            .send(TungsteniteMessage::Text("ping".to_string()))
            .await
            .unwrap();
        let text = next_event(&mut control_rx).await;
        assert_eq!(text.connection_id, connection_id);
        assert!(matches!(text.kind, WsEventKind::Text { ref text } if text == "ping"));

        public
            .send(TungsteniteMessage::Close(Some(TungsteniteCloseFrame {
                code: CloseCode::Normal,
                reason: "done".into(),
            })))
            .await
            .unwrap();
        let close = next_event(&mut control_rx).await;
        assert_eq!(close.connection_id, connection_id);
        assert!(matches!(
            close.kind,
            WsEventKind::Close { code: 1000, ref reason } if reason.as_deref() == Some("done")
        ));

        // The id is unregistered before the close event goes upstream.
        let tunnel = state.registry.get_by_tunnel_id("t1").unwrap();
        assert!(tunnel.subconn(&connection_id).is_none());
    }
}
