//! Relay configuration, read from the environment.

use std::ops::RangeInclusive;
use std::time::Duration;

use portgate_shared::protocol::DEFAULT_REQUEST_TIMEOUT_SECS;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Base domain under which tunnel subdomains are served.
    pub domain: String,
    /// Port for the HTTP/WebSocket listener.
    pub port: u16,
    /// Deadline for one tunneled unary request.
    pub request_timeout: Duration,
    /// Cap on a public request body read into a single envelope.
    pub max_body_bytes: usize,
    /// Public port range handed out to TCP tunnels.
    pub tcp_ports: RangeInclusive<u16>,
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self {
            domain: env_or("PORTGATE_DOMAIN", "portgate.dev"),
            port: parse_or("PORT", 8080),
            request_timeout: Duration::from_secs(parse_or(
                "PORTGATE_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )),
            max_body_bytes: parse_or("PORTGATE_MAX_BODY_BYTES", 10 * 1024 * 1024),
            tcp_ports: std::env::var("PORTGATE_TCP_PORTS")
                .ok()
                .and_then(|v| parse_port_range(&v))
                .unwrap_or(20000..=20100),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parses `"20000-20100"`. A single port is a one-port range.
fn parse_port_range(value: &str) -> Option<RangeInclusive<u16>> {
    match value.split_once('-') {
        Some((lo, hi)) => {
            let lo: u16 = lo.trim().parse().ok()?;
            let hi: u16 = hi.trim().parse().ok()?;
            (lo <= hi).then_some(lo..=hi)
        }
        None => {
            let port: u16 = value.trim().parse().ok()?;
            Some(port..=port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_range() {
        assert_eq!(parse_port_range("20000-20100"), Some(20000..=20100));
        assert_eq!(parse_port_range(" 9000 - 9001 "), Some(9000..=9001));
        assert_eq!(parse_port_range("7000"), Some(7000..=7000));
        assert_eq!(parse_port_range("9001-9000"), None);
        assert_eq!(parse_port_range("ports"), None);
    }
}
