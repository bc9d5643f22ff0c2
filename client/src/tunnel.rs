//! Control-connection runtime: reserves a public endpoint, keeps the
//! WebSocket to the relay open, and hands traffic to local bridges.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use portgate_shared::api::{ExposeHttpRequest, ExposeResponse};
use portgate_shared::frame::{self, Decoded};
use portgate_shared::protocol::{ControlMessage, WsEvent, WsEventKind};

use crate::config::TunnelEntry;
use crate::proxy;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    #[default]
    Http,
    Tcp,
}

#[derive(Debug, Clone)]
pub struct TunnelSpec {
    pub name: String,
    pub proto: Proto,
    pub local_host: String,
    pub local_port: u16,
    pub subdomain: Option<String>,
}

impl From<TunnelEntry> for TunnelSpec {
    fn from(entry: TunnelEntry) -> Self {
        Self {
            name: entry.name,
            proto: entry.proto,
            local_host: entry.local_host,
            local_port: entry.local_port,
            subdomain: entry.subdomain,
        }
    }
}

/// Senders feeding the per-connection bridge tasks. A bridge that is no
/// longer in here is closed or closing; dropping its sender ends it.
pub struct Bridges {
    pub ws: DashMap<String, mpsc::Sender<WsEventKind>>,
    pub tcp: DashMap<String, mpsc::Sender<Vec<u8>>>,
}

enum SessionEnd {
    Shutdown,
    Lost,
}

/// Runs one tunnel until Ctrl+C, re-reserving and reconnecting when the
/// control connection drops.
pub async fn run(relay: String, spec: TunnelSpec) -> Result<()> {
    let http = reqwest::Client::new();
    let mut assigned_subdomain = spec.subdomain.clone();
    let mut last_public: Option<String> = None;

    loop {
        let reservation = reserve(&http, &relay, &spec, assigned_subdomain.clone())
            .await
            .context("reservation failed")?;
        // Keep the same public endpoint across reconnects. TCP ports can
        // still move because the relay frees them on disconnect.
        if reservation.subdomain.is_some() {
            assigned_subdomain = reservation.subdomain.clone();
        }
        let public = public_endpoint(&reservation);
        if last_public.as_deref() != Some(&public) {
            print_banner(&spec, &public);
            last_public = Some(public);
        }

        let url = control_url(&relay, &reservation.tunnel_id);
        let stream = match connect_async(&url).await {
            Ok((stream, _)) => stream,
            Err(err) => {
                warn!(tunnel = %spec.name, error = %err, "control connect failed, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        info!(tunnel = %spec.name, tunnel_id = %reservation.tunnel_id, "control connection up");

        match session(stream, &spec, &http).await {
            SessionEnd::Shutdown => {
                info!(tunnel = %spec.name, "shutting down");
                return Ok(());
            }
            SessionEnd::Lost => {
                warn!(tunnel = %spec.name, "control connection lost, reconnecting");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

async fn reserve(
    http: &reqwest::Client,
    relay: &str,
    spec: &TunnelSpec,
    subdomain: Option<String>,
) -> Result<ExposeResponse> {
    let base = relay.trim_end_matches('/');
    let response = match spec.proto {
        Proto::Http => {
            http.post(format!("{base}/api/expose/http"))
                .json(&ExposeHttpRequest { subdomain })
                .send()
                .await?
        }
        Proto::Tcp => http.post(format!("{base}/api/expose/tcp")).send().await?,
    };
    if !response.status().is_success() {
        let status = response.status();
        let detail = response.text().await.unwrap_or_default();
        bail!("relay rejected reservation: {status} {detail}");
    }
    Ok(response.json().await?)
}

fn control_url(relay: &str, tunnel_id: &str) -> String {
    let base = relay.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{ws_base}/api/tunnel/{tunnel_id}")
}

fn public_endpoint(reservation: &ExposeResponse) -> String {
    match (&reservation.url, reservation.public_host.as_deref()) {
        (Some(url), _) => url.clone(),
        (None, Some(host)) => format!(
            "{}:{}",
            host,
            reservation.public_port.unwrap_or_default()
        ),
        (None, None) => "unknown".to_string(),
    }
}

fn print_banner(spec: &TunnelSpec, public: &str) {
    println!("\n  Portgate tunnel '{}' active", spec.name);
    println!("    Public: {}", public);
    println!("    Local:  {}:{}", spec.local_host, spec.local_port);
    println!("\n  Press Ctrl+C to stop\n");
}

async fn session(
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    spec: &TunnelSpec,
    http: &reqwest::Client,
) -> SessionEnd {
    let (mut writer, mut reader) = stream.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
    let bridges = Arc::new(Bridges {
        ws: DashMap::new(),
        tcp: DashMap::new(),
    });

    let end = loop {
        tokio::select! {
            inbound = reader.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    dispatch_control(&text, spec, http, &bridges, &out_tx);
                }
                Some(Ok(Message::Binary(buf))) => {
                    dispatch_frame(&buf, spec, &bridges, &out_tx);
                }
                Some(Ok(Message::Ping(payload))) => {
                    if out_tx.send(Message::Pong(payload)).await.is_err() {
                        break SessionEnd::Lost;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break SessionEnd::Lost,
                Some(Err(err)) => {
                    warn!(tunnel = %spec.name, error = %err, "control connection error");
                    break SessionEnd::Lost;
                }
                Some(Ok(_)) => {}
            },
            outbound = out_rx.recv() => {
                // Never None while out_tx lives above.
                if let Some(msg) = outbound {
                    if writer.send(msg).await.is_err() {
                        break SessionEnd::Lost;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                let _ = writer.send(Message::Close(None)).await;
                break SessionEnd::Shutdown;
            }
        }
    };

    // Dropping the senders ends every bridge task for this session.
    bridges.ws.clear();
    bridges.tcp.clear();
    end
}

fn dispatch_control(
    text: &str,
    spec: &TunnelSpec,
    http: &reqwest::Client,
    bridges: &Arc<Bridges>,
    out_tx: &mpsc::Sender<Message>,
) {
    let msg = match ControlMessage::decode(text) {
        Ok(msg) => msg,
        Err(err) => {
            warn!(tunnel = %spec.name, error = %err, "undecodable control message dropped");
            return;
        }
    };
    match msg {
        ControlMessage::HttpRequest(request) => {
            let base = format!("http://{}:{}", spec.local_host, spec.local_port);
            tokio::spawn(proxy::forward_http(
                http.clone(),
                base,
                request,
                out_tx.clone(),
            ));
        }
        ControlMessage::WsEvent(event) => dispatch_ws_event(event, spec, bridges, out_tx),
        // Responses only ever travel client -> relay.
        ControlMessage::HttpResponse(resp) => {
            debug!(tunnel = %spec.name, id = %resp.id, "unexpected http_response dropped");
        }
    }
}

fn dispatch_ws_event(
    event: WsEvent,
    spec: &TunnelSpec,
    bridges: &Arc<Bridges>,
    out_tx: &mpsc::Sender<Message>,
) {
    let connection_id = event.connection_id;
    match event.kind {
        WsEventKind::Open {
            path,
            query,
            protocol,
        } => {
            let (tx, rx) = mpsc::channel(64);
            bridges.ws.insert(connection_id.clone(), tx);
            let mut target = format!("ws://{}:{}{}", spec.local_host, spec.local_port, path);
            if let Some(query) = query {
                target.push('?');
                target.push_str(&query);
            }
            tokio::spawn(proxy::run_ws_bridge(
                connection_id,
                target,
                protocol,
                rx,
                out_tx.clone(),
                bridges.clone(),
            ));
        }
        WsEventKind::Close { code, reason } => {
            // Remove first so the bridge's own teardown does not echo the
            // close back upstream.
            if let Some((_, tx)) = bridges.ws.remove(&connection_id) {
                let _ = tx.try_send(WsEventKind::Close { code, reason });
            }
        }
        kind @ (WsEventKind::Text { .. } | WsEventKind::Binary { .. }) => {
            let Some(tx) = bridges.ws.get(&connection_id).map(|e| e.value().clone()) else {
                debug!(%connection_id, "ws event for unknown connection dropped");
                return;
            };
            // A bridge that cannot keep up is cut loose rather than
            // stalling the control reader.
            if tx.try_send(kind).is_err() {
                bridges.ws.remove(&connection_id);
            }
        }
    }
}

fn dispatch_frame(
    buf: &[u8],
    spec: &TunnelSpec,
    bridges: &Arc<Bridges>,
    out_tx: &mpsc::Sender<Message>,
) {
    let frame = match frame::decode(buf) {
        Ok(Decoded::Frame(frame)) => frame,
        Ok(Decoded::Incomplete) => {
            warn!(tunnel = %spec.name, "truncated binary frame dropped");
            return;
        }
        Err(err) => {
            warn!(tunnel = %spec.name, error = %err, "malformed binary frame dropped");
            return;
        }
    };
    if frame.is_close() {
        // Dropping the sender ends the bridge without a close echo.
        bridges.tcp.remove(&frame.connection_id);
        return;
    }
    if let Some(tx) = bridges
        .tcp
        .get(&frame.connection_id)
        .map(|e| e.value().clone())
    {
        if tx.try_send(frame.payload).is_err() {
            bridges.tcp.remove(&frame.connection_id);
        }
        return;
    }
    // First frame for a new public connection opens the local one.
    let (tx, rx) = mpsc::channel(64);
    let connection_id = frame.connection_id.clone();
    let _ = tx.try_send(frame.payload);
    bridges.tcp.insert(connection_id.clone(), tx);
    tokio::spawn(proxy::run_tcp_bridge(
        connection_id,
        format!("{}:{}", spec.local_host, spec.local_port),
        rx,
        out_tx.clone(),
        bridges.clone(),
    ));
}
