//! Reservation API: the allocation interface tunnel clients call before
//! opening their control connection.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use rand::Rng;
use tracing::warn;
use uuid::Uuid;

use portgate_shared::api::{ExposeHttpRequest, ExposeResponse};

use crate::AppState;

pub async fn expose_http(
    State(state): State<AppState>,
    body: Option<Json<ExposeHttpRequest>>,
) -> Response {
    let request = body.map(|Json(body)| body).unwrap_or_default();
    let subdomain = match request.subdomain {
        Some(subdomain) if !is_valid_subdomain(&subdomain) => {
            return (StatusCode::BAD_REQUEST, "invalid subdomain").into_response();
        }
        Some(subdomain) => subdomain,
        None => random_subdomain(),
    };
    let tunnel_id = Uuid::new_v4().to_string();
    if state.registry.reserve(&subdomain, &tunnel_id).is_err() {
        return (StatusCode::CONFLICT, "subdomain already in use").into_response();
    }
    let url = format!("https://{}.{}", subdomain, state.config.domain);
    Json(ExposeResponse {
        tunnel_id,
        subdomain: Some(subdomain),
        url: Some(url),
        public_host: None,
        public_port: None,
    })
    .into_response()
}

pub async fn expose_tcp(State(state): State<AppState>) -> Response {
    let tunnel_id = Uuid::new_v4().to_string();
    let port = match state.tcp.expose(&tunnel_id).await {
        Ok(port) => port,
        Err(err) => {
            warn!(error = %err, "TCP expose failed");
            return (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response();
        }
    };
    // The public (host, port) pair is the routing key for TCP tunnels.
    let public_key = format!("{}:{}", state.config.domain, port);
    if state.registry.reserve(&public_key, &tunnel_id).is_err() {
        state.tcp.release(&tunnel_id);
        return (StatusCode::CONFLICT, "port already reserved").into_response();
    }
    Json(ExposeResponse {
        tunnel_id,
        subdomain: None,
        url: None,
        public_host: Some(state.config.domain.clone()),
        public_port: Some(port),
    })
    .into_response()
}

/// Administrative revoke: fan-out teardown of everything the tunnel owns.
pub async fn revoke(Path(tunnel_id): Path<String>, State(state): State<AppState>) -> StatusCode {
    state.tcp.release(&tunnel_id);
    state.registry.remove(&tunnel_id).await;
    StatusCode::NO_CONTENT
}

fn is_valid_subdomain(subdomain: &str) -> bool {
    !subdomain.is_empty()
        && subdomain.len() <= 63
        && !subdomain.starts_with('-')
        && !subdomain.ends_with('-')
        && subdomain
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn random_subdomain() -> String {
    const NAMES: [&str; 8] = [
        "falcon", "lynx", "orca", "otter", "swift", "sparrow", "tiger", "puma",
    ];
    let mut rng = rand::thread_rng();
    format!(
        "{}-{}",
        NAMES[rng.gen_range(0..NAMES.len())],
        rng.gen_range(1000..10000)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subdomain_validation() {
        assert!(is_valid_subdomain("falcon-1234"));
        assert!(is_valid_subdomain("a"));
        assert!(!is_valid_subdomain(""));
        assert!(!is_valid_subdomain("-edge"));
        assert!(!is_valid_subdomain("edge-"));
        assert!(!is_valid_subdomain("Upper"));
        assert!(!is_valid_subdomain("dot.dot"));
        assert!(!is_valid_subdomain(&"x".repeat(64)));
    }

    #[test]
    fn test_random_subdomain_shape() {
        for _ in 0..32 {
            let subdomain = random_subdomain();
            assert!(is_valid_subdomain(&subdomain));
            let (_, number) = subdomain.rsplit_once('-').unwrap();
            let number: u32 = number.parse().unwrap();
            assert!((1000..10000).contains(&number));
        }
    }
}
