//! Local-side bridges: forwarding relayed HTTP requests to the local
//! service and pumping bridged WebSocket / raw TCP connections.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use portgate_shared::frame;
use portgate_shared::protocol::{ControlMessage, HttpRequest, HttpResponse, WsEvent, WsEventKind};

use crate::tunnel::Bridges;

const READ_CHUNK: usize = 16 * 1024;

/// Request headers the local service must not see twice; reqwest derives
/// them from the URL and body.
const REQUEST_SKIP_HEADERS: [&str; 3] = ["host", "content-length", "transfer-encoding"];

/// Response headers that describe the local hop, not the payload.
const RESPONSE_SKIP_HEADERS: [&str; 3] = ["connection", "transfer-encoding", "keep-alive"];

/// Answers one relayed HTTP request against the local service. Always
/// sends a correlated response; a failed local call becomes a status-less
/// envelope the relay maps to 502.
pub async fn forward_http(
    http: reqwest::Client,
    base: String,
    request: HttpRequest,
    out: mpsc::Sender<Message>,
) {
    let id = request.id.clone();
    debug!(%id, method = %request.method, path = %request.path, "forwarding to local service");
    let response = match call_local(&http, &base, request).await {
        Ok(response) => HttpResponse { id, ..response },
        Err(err) => {
            warn!(%id, error = %err, "local service call failed");
            HttpResponse {
                id,
                status: None,
                headers: Vec::new(),
                body: None,
            }
        }
    };
    let Ok(text) = ControlMessage::HttpResponse(response).encode() else {
        return;
    };
    let _ = out.send(Message::Text(text)).await;
}

async fn call_local(
    http: &reqwest::Client,
    base: &str,
    request: HttpRequest,
) -> anyhow::Result<HttpResponse> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())?;
    let mut url = format!("{base}{}", request.path);
    if let Some(query) = &request.query {
        url.push('?');
        url.push_str(query);
    }

    let mut builder = http.request(method, url);
    let mut saw_content_type = false;
    for (name, value) in &request.headers {
        if REQUEST_SKIP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        if name.eq_ignore_ascii_case("content-type") {
            saw_content_type = true;
        }
        builder = builder.header(name, value);
    }
    if let (false, Some(content_type)) = (saw_content_type, &request.content_type) {
        builder = builder.header("content-type", content_type);
    }
    if let Some(body) = request.body {
        builder = builder.body(body);
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter(|(name, _)| {
            !RESPONSE_SKIP_HEADERS
                .iter()
                .any(|h| name.as_str().eq_ignore_ascii_case(h))
        })
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.to_string(), value.to_string()))
        })
        .collect();
    let body = response.bytes().await?.to_vec();
    Ok(HttpResponse {
        id: String::new(),
        status: Some(status),
        headers,
        body: (!body.is_empty()).then_some(body),
    })
}

/// Pumps one bridged WebSocket connection against the local service.
///
/// The bridge removes itself from the registry on local-side closure and
/// reports the close upstream; an entry already gone means the relay
/// closed first and no echo is sent.
pub async fn run_ws_bridge(
    connection_id: String,
    target: String,
    protocol: Option<String>,
    mut rx: mpsc::Receiver<WsEventKind>,
    out: mpsc::Sender<Message>,
    bridges: Arc<Bridges>,
) {
    let stream = match connect_local_ws(&target, protocol.as_deref()).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(%connection_id, %target, error = %err, "local WebSocket connect failed");
            if bridges.ws.remove(&connection_id).is_some() {
                send_event(
                    &out,
                    &connection_id,
                    WsEventKind::Close {
                        code: 1011,
                        reason: Some("local connect failed".to_string()),
                    },
                )
                .await;
            }
            return;
        }
    };
    debug!(%connection_id, %target, "local WebSocket open");

    let (mut writer, mut reader) = stream.split();
    let mut observed: (u16, Option<String>) = (1005, None);
    loop {
        tokio::select! {
            local = reader.next() => match local {
                Some(Ok(Message::Text(text))) => {
                    if !send_event(&out, &connection_id, WsEventKind::Text { text }).await {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if !send_event(&out, &connection_id, WsEventKind::Binary { data }).await {
                        break;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if writer.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(close))) => {
                    if let Some(close) = close {
                        let reason = (!close.reason.is_empty())
                            .then(|| close.reason.into_owned());
                        observed = (close.code.into(), reason);
                    }
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => {
                    observed = (1011, None);
                    break;
                }
            },
            delivery = rx.recv() => match delivery {
                Some(WsEventKind::Text { text }) => {
                    if writer.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(WsEventKind::Binary { data }) => {
                    if writer.send(Message::Binary(data)).await.is_err() {
                        break;
                    }
                }
                Some(WsEventKind::Close { code, reason }) => {
                    let close = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.unwrap_or_default().into(),
                    };
                    let _ = writer.send(Message::Close(Some(close))).await;
                    break;
                }
                Some(WsEventKind::Open { .. }) => {}
                // Session teardown.
                None => {
                    let _ = writer.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }

    if bridges.ws.remove(&connection_id).is_some() {
        let (code, reason) = observed;
        send_event(&out, &connection_id, WsEventKind::Close { code, reason }).await;
        debug!(%connection_id, "local WebSocket closed");
    }
}

async fn connect_local_ws(
    target: &str,
    protocol: Option<&str>,
) -> anyhow::Result<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>>
{
    let mut request = target.into_client_request()?;
    if let Some(protocol) = protocol {
        request
            .headers_mut()
            .insert("sec-websocket-protocol", HeaderValue::from_str(protocol)?);
    }
    let (stream, _) = connect_async(request).await?;
    Ok(stream)
}

/// Pumps one multiplexed raw TCP connection against the local service.
/// An empty-payload frame is the close marker in both directions.
pub async fn run_tcp_bridge(
    connection_id: String,
    target: String,
    mut rx: mpsc::Receiver<Vec<u8>>,
    out: mpsc::Sender<Message>,
    bridges: Arc<Bridges>,
) {
    let stream = match TcpStream::connect(&target).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(%connection_id, %target, error = %err, "local TCP connect failed");
            close_tcp(&connection_id, &out, &bridges).await;
            return;
        }
    };
    debug!(%connection_id, %target, "local TCP connection open");

    let (mut reader, mut writer) = stream.into_split();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let Ok(encoded) = frame::encode(&connection_id, &buf[..n]) else {
                        break;
                    };
                    if out.send(Message::Binary(encoded)).await.is_err() {
                        break;
                    }
                }
            },
            delivery = rx.recv() => match delivery {
                Some(data) => {
                    if writer.write_all(&data).await.is_err() {
                        break;
                    }
                }
                // Relay-side close, or session teardown.
                None => break,
            },
        }
    }

    close_tcp(&connection_id, &out, &bridges).await;
}

/// Sends the close marker if the bridge is still registered; a missing
/// entry means the relay side already closed and no echo is wanted.
async fn close_tcp(connection_id: &str, out: &mpsc::Sender<Message>, bridges: &Arc<Bridges>) {
    if bridges.tcp.remove(connection_id).is_some() {
        if let Ok(marker) = frame::encode_close(connection_id) {
            let _ = out.send(Message::Binary(marker)).await;
        }
        debug!(%connection_id, "local TCP connection closed");
    }
}

async fn send_event(out: &mpsc::Sender<Message>, connection_id: &str, kind: WsEventKind) -> bool {
    let event = ControlMessage::WsEvent(WsEvent {
        connection_id: connection_id.to_string(),
        kind,
    });
    match event.encode() {
        Ok(text) => out.send(Message::Text(text)).await.is_ok(),
        Err(_) => false,
    }
}
