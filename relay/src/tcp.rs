//! Public raw-TCP ingress: one listening port per TCP tunnel, every
//! accepted connection multiplexed over the control connection as binary
//! frames.
//!
//! No open envelope exists for TCP: the first frame's bytes are the
//! payload, and the peer opens its local connection on first sight of a
//! new connection id. An empty-payload frame is the close marker in both
//! directions.

use std::ops::RangeInclusive;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use portgate_shared::frame;
use portgate_shared::{Error, Result};

use crate::registry::{Registry, SubConnMsg};

const READ_CHUNK: usize = 16 * 1024;

/// Backoff after a failed accept; persistent errors (fd exhaustion)
/// otherwise turn the accept loop into a busy spin.
const ACCEPT_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(100);

struct PortListener {
    port: u16,
    task: JoinHandle<()>,
}

/// Allocates public ports from a configured range and runs one accept
/// loop per exposed TCP tunnel.
pub struct TcpGateway {
    registry: Arc<Registry>,
    listeners: DashMap<String, PortListener>,
    ports: RangeInclusive<u16>,
}

impl TcpGateway {
    pub fn new(registry: Arc<Registry>, ports: RangeInclusive<u16>) -> Self {
        Self {
            registry,
            listeners: DashMap::new(),
            ports,
        }
    }

    /// Binds a free port from the range for `tunnel_id` and starts
    /// accepting. Idempotent per tunnel id.
    pub async fn expose(&self, tunnel_id: &str) -> Result<u16> {
        if let Some(listener) = self.listeners.get(tunnel_id) {
            return Ok(listener.port);
        }
        for port in self.ports.clone() {
            let listener = match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => listener,
                Err(_) => continue,
            };
            let task = tokio::spawn(accept_loop(
                listener,
                self.registry.clone(),
                tunnel_id.to_string(),
            ));
            self.listeners
                .insert(tunnel_id.to_string(), PortListener { port, task });
            info!(%tunnel_id, port, "public TCP port allocated");
            return Ok(port);
        }
        Err(Error::PortsExhausted)
    }

    /// Stops accepting for `tunnel_id` and frees its port. Idempotent.
    pub fn release(&self, tunnel_id: &str) {
        if let Some((_, listener)) = self.listeners.remove(tunnel_id) {
            listener.task.abort();
            info!(%tunnel_id, port = listener.port, "public TCP port released");
        }
    }
}

async fn accept_loop(listener: TcpListener, registry: Arc<Registry>, tunnel_id: String) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(%tunnel_id, error = %err, "TCP accept failed");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };
        // No live tunnel: drop the socket, the caller sees a reset.
        let Some(tunnel) = registry.get_by_tunnel_id(&tunnel_id) else {
            continue;
        };
        if !tunnel.is_attached().await {
            continue;
        }
        debug!(%tunnel_id, %peer, "accepted public TCP connection");
        tokio::spawn(run_conn(stream, registry.clone(), tunnel_id.clone()));
    }
}

async fn run_conn(stream: TcpStream, registry: Arc<Registry>, tunnel_id: String) {
    let connection_id = Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::channel::<SubConnMsg>(64);
    let Ok(session) = registry
        .register_subconn(&tunnel_id, &connection_id, tx)
        .await
    else {
        return;
    };

    let (mut reader, mut writer) = stream.into_split();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                // One outbound message per read chunk, no coalescing.
                Ok(n) => {
                    let Ok(encoded) = frame::encode(&connection_id, &buf[..n]) else {
                        break;
                    };
                    if registry.send_frame(&tunnel_id, encoded).await.is_err() {
                        break;
                    }
                }
            },
            delivery = rx.recv() => match delivery {
                Some(SubConnMsg::Data(data)) => {
                    if writer.write_all(&data).await.is_err() {
                        break;
                    }
                }
                // Peer closed its side, or the tunnel was torn down.
                Some(SubConnMsg::Close { .. }) | None => break,
                Some(SubConnMsg::Text(_)) => {}
            },
        }
    }

    // Still registered means the local side closed first; the peer
    // learns via the close marker. Otherwise the dispatcher or a
    // teardown already removed us and the marker would be a stray.
    if let Some(ids) = registry.unregister_by_session(session) {
        if let Ok(marker) = frame::encode_close(&ids.connection_id) {
            let _ = registry.send_frame(&ids.tunnel_id, marker).await;
        }
        debug!(
            tunnel_id = %ids.tunnel_id,
            connection_id = %ids.connection_id,
            "public TCP connection closed"
        );
    }
}
