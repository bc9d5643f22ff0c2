//! Request correlation: turns the control connection's multiplexed
//! message stream into synchronous-looking unary calls for the HTTP
//! bridge.
//!
//! Exactly one of {response, timeout, teardown} settles a pending entry.
//! Responses and timeouts remove it via `DashMap::remove`, which can only
//! succeed once; teardown clears the map wholesale, and the dropped
//! sender surfaces to the waiter as `Superseded`.

use std::time::Duration;

use axum::extract::ws::Message;
use tokio::sync::oneshot;
use tracing::trace;
use uuid::Uuid;

use portgate_shared::protocol::{ControlMessage, HttpRequest, HttpResponse};
use portgate_shared::{Error, Result};

use crate::registry::Tunnel;

/// Forwards one unary request over the tunnel's control connection and
/// waits for the correlated response or the deadline.
pub async fn forward_request(
    tunnel: &Tunnel,
    mut request: HttpRequest,
    timeout: Duration,
) -> Result<HttpResponse> {
    if request.id.is_empty() {
        request.id = Uuid::new_v4().to_string();
    }
    let id = request.id.clone();

    let text = match ControlMessage::HttpRequest(request).encode() {
        Ok(text) => text,
        Err(err) => return Err(err.into()),
    };

    let (tx, rx) = oneshot::channel();
    tunnel.pending.insert(id.clone(), tx);

    if let Err(err) = tunnel.send(Message::Text(text)).await {
        tunnel.pending.remove(&id);
        return Err(err);
    }

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(response)) => Ok(response),
        // Sender dropped: the tunnel was torn down or superseded.
        Ok(Err(_)) => {
            tunnel.pending.remove(&id);
            Err(Error::Superseded)
        }
        Err(_) => {
            tunnel.pending.remove(&id);
            Err(Error::Timeout)
        }
    }
}

/// Resolves the pending entry for a response arriving on the control
/// connection. An unknown id is an expected race (the caller already
/// timed out), never an error.
pub fn resolve_response(tunnel: &Tunnel, response: HttpResponse) {
    match tunnel.pending.remove(&response.id) {
        Some((_, tx)) => {
            let _ = tx.send(response);
        }
        None => {
            trace!(
                tunnel_id = %tunnel.tunnel_id,
                request_id = %response.id,
                "dropping response with no pending request"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use tokio::sync::mpsc;

    fn request(path: &str) -> HttpRequest {
        HttpRequest {
            id: String::new(),
            method: "GET".to_string(),
            path: path.to_string(),
            query: None,
            headers: Vec::new(),
            body: None,
            content_type: None,
        }
    }

    fn decode_request(msg: Message) -> HttpRequest {
        match msg {
            Message::Text(text) => match ControlMessage::decode(&text).unwrap() {
                ControlMessage::HttpRequest(req) => req,
                other => panic!("expected http_request, got {other:?}"),
            },
            other => panic!("expected text message, got {other:?}"),
        }
    }

    async fn attached_tunnel(registry: &Registry) -> mpsc::Receiver<Message> {
        registry.reserve("falcon-1234", "t1").unwrap();
        let (tx, rx) = mpsc::channel(16);
        registry.attach("t1", tx).await.unwrap();
        rx
    }

    #[tokio::test]
    async fn test_response_reaches_caller() {
        let registry = Registry::new();
        let mut control_rx = attached_tunnel(&registry).await;
        let tunnel = registry.get_by_tunnel_id("t1").unwrap();

        // Peer answers the envelope it receives, like the CLI would.
        let answering = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move {
                let req = decode_request(control_rx.recv().await.unwrap());
                assert_eq!(req.path, "/hello");
                assert!(!req.id.is_empty());
                resolve_response(
                    &tunnel,
                    HttpResponse {
                        id: req.id,
                        status: Some(200),
                        headers: Vec::new(),
                        body: Some(b"hi".to_vec()),
                    },
                );
            })
        };

        let response = forward_request(&tunnel, request("/hello"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.status, Some(200));
        assert_eq!(response.body.as_deref(), Some(&b"hi"[..]));
        assert!(tunnel.pending.is_empty());
        answering.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_and_late_response_is_dropped() {
        let registry = Registry::new();
        let mut control_rx = attached_tunnel(&registry).await;
        let tunnel = registry.get_by_tunnel_id("t1").unwrap();

        let err = forward_request(&tunnel, request("/slow"), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert!(tunnel.pending.is_empty());

        // A straggling response for the timed-out id is silently dropped.
        let req = decode_request(control_rx.recv().await.unwrap());
        resolve_response(
            &tunnel,
            HttpResponse {
                id: req.id,
                status: Some(200),
                headers: Vec::new(),
                body: None,
            },
        );
        assert!(tunnel.pending.is_empty());
    }

    #[tokio::test]
    async fn test_not_connected_fails_fast() {
        let registry = Registry::new();
        let tunnel = registry.reserve("falcon-1234", "t1").unwrap();
        let err = forward_request(&tunnel, request("/"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected(_)));
        assert!(tunnel.pending.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_requests_resolve_to_matching_callers() {
        let registry = Registry::new();
        let mut control_rx = attached_tunnel(&registry).await;
        let tunnel = registry.get_by_tunnel_id("t1").unwrap();

        // Echo loop: answer every request with a body derived from its path.
        let echo = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move {
                for _ in 0..16 {
                    let req = decode_request(control_rx.recv().await.unwrap());
                    resolve_response(
                        &tunnel,
                        HttpResponse {
                            id: req.id,
                            status: Some(200),
                            headers: Vec::new(),
                            body: Some(req.path.into_bytes()),
                        },
                    );
                }
            })
        };

        let mut waiters = Vec::new();
        for i in 0..16 {
            let tunnel = tunnel.clone();
            waiters.push(tokio::spawn(async move {
                let path = format!("/item/{i}");
                let response = forward_request(&tunnel, request(&path), Duration::from_secs(5))
                    .await
                    .unwrap();
                assert_eq!(response.body.as_deref(), Some(path.as_bytes()));
            }));
        }
        for waiter in waiters {
            waiter.await.unwrap();
        }
        echo.await.unwrap();
        assert!(tunnel.pending.is_empty());
    }

    #[tokio::test]
    async fn test_revoke_rejects_in_flight_request() {
        let registry = Registry::new();
        let _control_rx = attached_tunnel(&registry).await;
        let tunnel = registry.get_by_tunnel_id("t1").unwrap();

        let waiter = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move {
                forward_request(&tunnel, request("/pending"), Duration::from_secs(5)).await
            })
        };
        while tunnel.pending.is_empty() {
            tokio::task::yield_now().await;
        }

        // Administrative teardown surfaces exactly like supersession.
        registry.remove("t1").await;

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Superseded));
        assert!(tunnel.pending.is_empty());
    }

    #[tokio::test]
    async fn test_supersession_rejects_in_flight_request() {
        let registry = Registry::new();
        let _control_rx = attached_tunnel(&registry).await;
        let tunnel = registry.get_by_tunnel_id("t1").unwrap();

        let waiter = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move {
                forward_request(&tunnel, request("/pending"), Duration::from_secs(5)).await
            })
        };
        // Let the request register before replacing the connection.
        while tunnel.pending.is_empty() {
            tokio::task::yield_now().await;
        }

        let (tx2, _rx2) = mpsc::channel(16);
        registry.attach("t1", tx2).await.unwrap();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Superseded));
        assert!(tunnel.pending.is_empty());
    }
}
