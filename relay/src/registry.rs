//! The tunnel directory: the only shared mutable state in the relay.
//!
//! Maps public keys (subdomain or host:port) and tunnel ids to live
//! [`Tunnel`] state. Every public-side task and every control-connection
//! reader goes through this registry; nothing else is shared.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::Message;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info};

use portgate_shared::protocol::{ControlMessage, HttpResponse, WsEvent};
use portgate_shared::{Error, Result};

/// Process-unique handle for one public-side socket. Used only for the
/// disconnect-cleanup reverse lookup, never on the message path.
pub type SessionId = u64;

/// Close code sent to public sub-connections when their tunnel goes away.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// (tunnel id, connection id) pair resolved from a session handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ids {
    pub tunnel_id: String,
    pub connection_id: String,
}

/// What the relay delivers to one public sub-connection's writer task.
#[derive(Debug, Clone)]
pub enum SubConnMsg {
    Text(String),
    Data(Vec<u8>),
    Close { code: u16, reason: Option<String> },
}

/// A registered public sub-connection (browser WebSocket or TCP socket).
#[derive(Clone)]
pub struct SubConn {
    pub tx: mpsc::Sender<SubConnMsg>,
    pub session: SessionId,
}

/// Write handle for one attached control connection. All writes to the
/// control socket funnel through `tx`; a single task drains it, so
/// envelopes never interleave.
#[derive(Clone)]
pub struct ControlHandle {
    pub tx: mpsc::Sender<Message>,
    /// Attach generation; a superseded reader must not tear down its
    /// successor's state.
    pub epoch: u64,
}

/// One reserved tunnel and everything multiplexed over it.
pub struct Tunnel {
    pub subdomain: String,
    pub tunnel_id: String,
    /// None while PENDING (reserved but the peer has not attached yet).
    control: RwLock<Option<ControlHandle>>,
    /// In-flight unary requests, keyed by request id.
    pub(crate) pending: DashMap<String, oneshot::Sender<HttpResponse>>,
    /// Active sub-connections, keyed by connection id.
    conns: DashMap<String, SubConn>,
    /// Reverse index for the disconnect-cleanup path.
    reverse: DashMap<SessionId, Ids>,
}

impl Tunnel {
    fn new(subdomain: &str, tunnel_id: &str) -> Self {
        Self {
            subdomain: subdomain.to_string(),
            tunnel_id: tunnel_id.to_string(),
            control: RwLock::new(None),
            pending: DashMap::new(),
            conns: DashMap::new(),
            reverse: DashMap::new(),
        }
    }

    pub async fn control(&self) -> Option<ControlHandle> {
        self.control.read().await.clone()
    }

    /// True when a control connection is attached and its writer is alive.
    pub async fn is_attached(&self) -> bool {
        matches!(&*self.control.read().await, Some(handle) if !handle.tx.is_closed())
    }

    /// Sends one message over the control connection. Serialized by the
    /// single writer task draining the handle's channel.
    pub async fn send(&self, msg: Message) -> Result<()> {
        let Some(handle) = self.control().await else {
            return Err(Error::NotConnected(self.tunnel_id.clone()));
        };
        handle
            .tx
            .send(msg)
            .await
            .map_err(|_| Error::NotConnected(self.tunnel_id.clone()))
    }

    pub fn subconn(&self, connection_id: &str) -> Option<SubConn> {
        self.conns.get(connection_id).map(|entry| entry.clone())
    }
}

/// Fails all in-flight state owned by the current control connection.
/// Pending senders are dropped (the correlator surfaces that as
/// `Superseded`); sub-connections get a best-effort close. Callers hold
/// the tunnel's control write lock, so no registration can race in.
fn drain(tunnel: &Tunnel) {
    let pending = tunnel.pending.len();
    let conns = tunnel.conns.len();
    tunnel.pending.clear();
    for entry in tunnel.conns.iter() {
        let _ = entry.value().tx.try_send(SubConnMsg::Close {
            code: CLOSE_GOING_AWAY,
            reason: None,
        });
    }
    tunnel.conns.clear();
    tunnel.reverse.clear();
    if pending > 0 || conns > 0 {
        debug!(
            tunnel_id = %tunnel.tunnel_id,
            pending, conns, "drained in-flight tunnel state"
        );
    }
}

pub struct Registry {
    by_subdomain: DashMap<String, Arc<Tunnel>>,
    by_tunnel_id: DashMap<String, Arc<Tunnel>>,
    next_epoch: AtomicU64,
    next_session: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            by_subdomain: DashMap::new(),
            by_tunnel_id: DashMap::new(),
            next_epoch: AtomicU64::new(0),
            next_session: AtomicU64::new(0),
        }
    }

    /// Creates a PENDING tunnel under both indices. Neither key may be in
    /// use. The subdomain entry goes in last so a tunnel visible to public
    /// lookups is always resolvable by tunnel id too.
    pub fn reserve(&self, subdomain: &str, tunnel_id: &str) -> Result<Arc<Tunnel>> {
        if self.by_subdomain.contains_key(subdomain) || self.by_tunnel_id.contains_key(tunnel_id) {
            return Err(Error::AlreadyReserved);
        }
        let tunnel = Arc::new(Tunnel::new(subdomain, tunnel_id));
        self.by_tunnel_id
            .insert(tunnel_id.to_string(), tunnel.clone());
        self.by_subdomain
            .insert(subdomain.to_string(), tunnel.clone());
        info!(%subdomain, %tunnel_id, "reserved tunnel");
        Ok(tunnel)
    }

    pub fn get_by_subdomain(&self, subdomain: &str) -> Option<Arc<Tunnel>> {
        self.by_subdomain.get(subdomain).map(|entry| entry.clone())
    }

    pub fn get_by_tunnel_id(&self, tunnel_id: &str) -> Option<Arc<Tunnel>> {
        self.by_tunnel_id.get(tunnel_id).map(|entry| entry.clone())
    }

    /// Attaches a control connection, superseding any previous one. The
    /// old connection's in-flight state is drained under the write lock,
    /// so there is no window where both connections appear live. Returns
    /// the attach epoch, or None for an unknown tunnel id.
    pub async fn attach(&self, tunnel_id: &str, tx: mpsc::Sender<Message>) -> Option<u64> {
        let tunnel = self.get_by_tunnel_id(tunnel_id)?;
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed) + 1;
        let superseded = {
            let mut control = tunnel.control.write().await;
            let superseded = control.replace(ControlHandle { tx, epoch }).is_some();
            drain(&tunnel);
            superseded
        };
        if superseded {
            info!(%tunnel_id, epoch, "control connection superseded");
        } else {
            info!(%tunnel_id, epoch, "control connection attached");
        }
        Some(epoch)
    }

    /// Tears down and removes the tunnel, but only if `epoch` is still the
    /// attached generation. A superseded reader calling in after its
    /// replacement attached is a no-op. Returns whether this call tore the
    /// tunnel down; callers must not free tunnel-owned resources (like the
    /// public TCP listener) on a `false` return.
    pub async fn detach(&self, tunnel_id: &str, epoch: u64) -> bool {
        let Some(tunnel) = self.get_by_tunnel_id(tunnel_id) else {
            return false;
        };
        {
            let mut control = tunnel.control.write().await;
            match &*control {
                Some(handle) if handle.epoch == epoch => {
                    control.take();
                    drain(&tunnel);
                }
                _ => return false,
            }
        }
        self.by_subdomain.remove(&tunnel.subdomain);
        self.by_tunnel_id.remove(&tunnel.tunnel_id);
        info!(%tunnel_id, "tunnel closed");
        true
    }

    /// Removes the tunnel from both indices and fails everything it owns.
    /// Idempotent; used by administrative revocation.
    pub async fn remove(&self, tunnel_id: &str) {
        let Some((_, tunnel)) = self.by_tunnel_id.remove(tunnel_id) else {
            return;
        };
        self.by_subdomain.remove(&tunnel.subdomain);
        let mut control = tunnel.control.write().await;
        control.take();
        drain(&tunnel);
        info!(%tunnel_id, "tunnel revoked");
    }

    /// Registers a public sub-connection. Holding the control read lock
    /// for the insert keeps registration atomic with respect to a
    /// concurrent teardown: nothing registers against a tunnel mid-drain
    /// and survives.
    pub async fn register_subconn(
        &self,
        tunnel_id: &str,
        connection_id: &str,
        tx: mpsc::Sender<SubConnMsg>,
    ) -> Result<SessionId> {
        let tunnel = self
            .get_by_tunnel_id(tunnel_id)
            .ok_or_else(|| Error::NotFound(tunnel_id.to_string()))?;
        let control = tunnel.control.read().await;
        if control.is_none() {
            return Err(Error::NotConnected(tunnel_id.to_string()));
        }
        let session = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        tunnel.conns.insert(
            connection_id.to_string(),
            SubConn {
                tx,
                session,
            },
        );
        tunnel.reverse.insert(
            session,
            Ids {
                tunnel_id: tunnel_id.to_string(),
                connection_id: connection_id.to_string(),
            },
        );
        Ok(session)
    }

    /// Removes a sub-connection by id, returning its handle if present.
    pub fn unregister_subconn(&self, tunnel_id: &str, connection_id: &str) -> Option<SubConn> {
        let tunnel = self.get_by_tunnel_id(tunnel_id)?;
        let (_, conn) = tunnel.conns.remove(connection_id)?;
        tunnel.reverse.remove(&conn.session);
        Some(conn)
    }

    /// Scans all tunnels' reverse maps. Bounded by live-tunnel count and
    /// only called on public-side disconnects, never per message.
    pub fn find_by_session(&self, session: SessionId) -> Option<Ids> {
        for entry in self.by_tunnel_id.iter() {
            if let Some(ids) = entry.value().reverse.get(&session) {
                return Some(ids.clone());
            }
        }
        None
    }

    /// Reverse-map removal for the disconnect path. Returns the ids the
    /// session was registered under, or None if a teardown got there
    /// first.
    pub fn unregister_by_session(&self, session: SessionId) -> Option<Ids> {
        for entry in self.by_tunnel_id.iter() {
            if let Some((_, ids)) = entry.value().reverse.remove(&session) {
                entry.value().conns.remove(&ids.connection_id);
                return Some(ids);
            }
        }
        None
    }

    /// Sends a WebSocket bridge event to the tunnel's control connection.
    pub async fn send_ws_event(&self, tunnel_id: &str, event: WsEvent) -> Result<()> {
        let tunnel = self
            .get_by_tunnel_id(tunnel_id)
            .ok_or_else(|| Error::NotFound(tunnel_id.to_string()))?;
        let text = ControlMessage::WsEvent(event).encode()?;
        tunnel.send(Message::Text(text)).await
    }

    /// Sends an encoded binary frame to the tunnel's control connection.
    pub async fn send_frame(&self, tunnel_id: &str, frame: Vec<u8>) -> Result<()> {
        let tunnel = self
            .get_by_tunnel_id(tunnel_id)
            .ok_or_else(|| Error::NotFound(tunnel_id.to_string()))?;
        tunnel.send(Message::Binary(frame)).await
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
