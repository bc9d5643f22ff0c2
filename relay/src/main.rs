use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::routing::{any, delete, get, post};
use axum::Router;
use tracing::info;

mod api;
mod config;
mod control;
mod correlator;
mod headers;
mod ingress;
mod registry;
mod routing;
mod tcp;

use config::RelayConfig;
use registry::Registry;
use tcp::TcpGateway;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub tcp: Arc<TcpGateway>,
    pub config: Arc<RelayConfig>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("portgate_relay=info")
        .init();

    let config = Arc::new(RelayConfig::from_env());
    let registry = Arc::new(Registry::new());
    let tcp = Arc::new(TcpGateway::new(registry.clone(), config.tcp_ports.clone()));
    let state = AppState {
        registry,
        tcp,
        config: config.clone(),
    };

    let app = Router::new()
        .route("/api/expose/http", post(api::expose_http))
        .route("/api/expose/tcp", post(api::expose_tcp))
        .route("/api/expose/:tunnel_id", delete(api::revoke))
        .route("/api/tunnel/:tunnel_id", get(control::control_handler))
        .route("/health", get(|| async { "OK" }))
        .fallback(any(ingress::public_handler))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Portgate relay on {} (domain: {})", addr, config.domain);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
