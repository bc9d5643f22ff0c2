//! Header rewriting for tunneled requests.
//!
//! Hop-by-hop headers are dropped before the envelope crosses the tunnel;
//! forwarding headers tell the local service who the caller addressed.

use axum::http::HeaderMap;

/// Headers that describe the relay<->caller hop, not the request itself.
const HOP_BY_HOP: [&str; 2] = ["host", "connection"];

/// Builds the header list for a tunneled request envelope: every request
/// header except hop-by-hop ones, plus `X-Forwarded-Host` (overwritten
/// with the routed host when known) and `X-Forwarded-Proto` (kept when an
/// edge already set it).
pub fn proxied_request_headers(
    headers: &HeaderMap,
    routed_host: Option<&str>,
    proto: &str,
) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = headers
        .iter()
        .filter(|(name, _)| !HOP_BY_HOP.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();

    if let Some(host) = routed_host {
        upsert(&mut out, "X-Forwarded-Host", host);
    }
    if !out
        .iter()
        .any(|(name, _)| name.eq_ignore_ascii_case("X-Forwarded-Proto"))
    {
        out.push(("X-Forwarded-Proto".to_string(), proto.to_string()));
    }
    out
}

/// Insert or update a header, case-insensitively.
pub fn upsert(headers: &mut Vec<(String, String)>, key: &str, value: &str) {
    if let Some(header) = headers
        .iter_mut()
        .find(|(name, _)| name.eq_ignore_ascii_case(key))
    {
        header.1 = value.to_string();
    } else {
        headers.push((key.to_string(), value.to_string()));
    }
}
