//! Routing-key extraction for public ingress.
//!
//! Precedence: `X-Forwarded-Host` (edge proxies do not preserve the
//! original `Host` upstream), then `Host`, then the `/_/{publicKey}/...`
//! path-prefix fallback. Header-based routing wins when both could apply.

use axum::http::header::HOST;
use axum::http::{HeaderMap, Uri};

/// Resolved routing decision for one public request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    /// Subdomain (or path-prefix key) identifying the tunnel.
    pub public_key: String,
    /// Request path with the routing prefix stripped, if one was used.
    pub path: String,
    /// Host the caller addressed, when known.
    pub host: Option<String>,
}

pub fn resolve(headers: &HeaderMap, uri: &Uri, base_domain: &str) -> Option<RouteTarget> {
    let host = routed_host(headers);
    if let Some(host) = &host {
        if let Some(subdomain) = subdomain_of(host, base_domain) {
            return Some(RouteTarget {
                public_key: subdomain.to_string(),
                path: uri.path().to_string(),
                host: Some(host.clone()),
            });
        }
    }
    let (public_key, path) = strip_key_prefix(uri.path())?;
    Some(RouteTarget {
        public_key: public_key.to_string(),
        path,
        host,
    })
}

/// The host the public caller addressed: first element of a
/// comma-separated `X-Forwarded-Host` list, else `Host`.
fn routed_host(headers: &HeaderMap) -> Option<String> {
    let raw = headers
        .get("x-forwarded-host")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .or_else(|| headers.get(HOST).and_then(|value| value.to_str().ok()))?;
    let first = raw.split(',').next().unwrap_or(raw).trim();
    (!first.is_empty()).then(|| first.to_string())
}

/// Extracts the subdomain label from `{subdomain}.{base_domain}`, with
/// any port stripped first. The apex domain itself has no subdomain.
fn subdomain_of<'a>(host: &'a str, base_domain: &str) -> Option<&'a str> {
    let host = host.split(':').next().unwrap_or(host);
    let prefix = host.strip_suffix(base_domain)?.strip_suffix('.')?;
    if prefix.is_empty() {
        return None;
    }
    // Nested labels route on the outermost one, matching the original
    // host-based ingress.
    let label = prefix.split('.').next().unwrap_or(prefix);
    (!label.is_empty()).then_some(label)
}

/// `/_/{key}/rest` -> (key, "/rest"); `/_/{key}` -> (key, "/").
fn strip_key_prefix(path: &str) -> Option<(&str, String)> {
    let rest = path.strip_prefix("/_/")?;
    match rest.find('/') {
        Some(idx) if idx > 0 => Some((&rest[..idx], rest[idx..].to_string())),
        None if !rest.is_empty() => Some((rest, "/".to_string())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve_str(headers: &[(&str, &str)], uri: &str) -> Option<RouteTarget> {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        resolve(&map, &uri.parse::<Uri>().unwrap(), "example.com")
    }

    #[test]
    fn test_host_header_routing() {
        let target = resolve_str(&[("host", "falcon-1234.example.com")], "/hello").unwrap();
        assert_eq!(target.public_key, "falcon-1234");
        assert_eq!(target.path, "/hello");
        assert_eq!(target.host.as_deref(), Some("falcon-1234.example.com"));
    }

    #[test]
    fn test_forwarded_host_wins_over_host() {
        let target = resolve_str(
            &[
                ("host", "lynx-1111.example.com"),
                ("x-forwarded-host", "falcon-1234.example.com"),
            ],
            "/",
        )
        .unwrap();
        assert_eq!(target.public_key, "falcon-1234");
    }

    #[test]
    fn test_forwarded_host_comma_list_and_port() {
        let target = resolve_str(
            &[(
                "x-forwarded-host",
                "falcon-1234.example.com:443, edge.internal",
            )],
            "/x",
        )
        .unwrap();
        assert_eq!(target.public_key, "falcon-1234");
    }

    #[test]
    fn test_apex_and_lookalike_hosts_do_not_route() {
        assert!(resolve_str(&[("host", "example.com")], "/").is_none());
        assert!(resolve_str(&[("host", "evilexample.com")], "/").is_none());
    }

    #[test]
    fn test_path_prefix_fallback() {
        let target = resolve_str(&[("host", "relay.internal")], "/_/falcon-1234/api/x?q=1").unwrap();
        assert_eq!(target.public_key, "falcon-1234");
        assert_eq!(target.path, "/api/x");

        let target = resolve_str(&[], "/_/falcon-1234").unwrap();
        assert_eq!(target.public_key, "falcon-1234");
        assert_eq!(target.path, "/");
    }

    #[test]
    fn test_header_routing_precedes_path_prefix() {
        // Both signals present and disagreeing: the header wins.
        let target = resolve_str(
            &[("host", "falcon-1234.example.com")],
            "/_/lynx-1111/hello",
        )
        .unwrap();
        assert_eq!(target.public_key, "falcon-1234");
        assert_eq!(target.path, "/_/lynx-1111/hello");
    }

    #[test]
    fn test_nested_subdomain_routes_on_outer_label() {
        let target = resolve_str(&[("host", "api.falcon-1234.example.com")], "/").unwrap();
        assert_eq!(target.public_key, "api");
    }

    #[test]
    fn test_no_signal() {
        assert!(resolve_str(&[("host", "relay.internal")], "/hello").is_none());
        assert!(resolve_str(&[], "/_//x").is_none());
    }
}
