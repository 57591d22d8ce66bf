//! Client and network identifying header removal

use std::net::SocketAddr;

use hyper::HeaderMap;

/// Headers that reveal the client or the edge network in front of the gateway
pub const DENYLIST: &[&str] = &[
    "cf-connecting-ip",
    "x-forwarded-for",
    "x-real-ip",
    "x-envoy-external-address",
    "x-forwarded-host",
    "x-forwarded-proto",
    "cf-ray",
    "cf-visitor",
    "cf-ipcountry",
    "cf-request-id",
];

/// Strip every denylisted header, including repeated values
pub fn sanitize(headers: &mut HeaderMap) {
    for name in DENYLIST {
        headers.remove(*name);
    }
}

/// Best available client address: forwarded-for, then real-IP, then the
/// socket peer. Must run before [`sanitize`].
pub fn client_ip(headers: &HeaderMap, remote_addr: Option<SocketAddr>) -> String {
    let from_header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    from_header("x-forwarded-for")
        .or_else(|| from_header("x-real-ip"))
        .or_else(|| remote_addr.map(|addr| addr.ip().to_string()))
        .unwrap_or_default()
}
