use std::net::IpAddr;

use axum::http::HeaderMap;

/// Identifies the caller for throttling.
///
/// Prefers the first hop of `x-forwarded-for`, then `x-real-ip`, then the
/// socket peer address. Requests with none of these share the `unknown`
/// bucket.
pub fn client_identifier(headers: &HeaderMap, peer: Option<IpAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').map(str::trim).find(|ip| !ip.is_empty()));

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());

    forwarded
        .or(real_ip)
        .map(str::to_string)
        .or_else(|| peer.map(|ip| ip.to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}
