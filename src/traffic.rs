//! Borrowed request/response views shared by filters and profiles, plus
//! target host helpers.

use http::{HeaderMap, Method, StatusCode, Uri};

/// What policy hooks may inspect about an outbound request.
#[derive(Debug, Clone, Copy)]
pub struct RequestView<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
}

impl<'a> RequestView<'a> {
    /// URL host with a `Host` header fallback.
    pub fn host(&self) -> Option<&'a str> {
        self.uri
            .host()
            .or_else(|| self.headers.get(http::header::HOST)?.to_str().ok())
    }
}

/// What policy hooks may inspect about an upstream response.
#[derive(Debug, Clone, Copy)]
pub struct ResponseView<'a> {
    pub status: StatusCode,
    pub headers: &'a HeaderMap,
}

/// Strip a `:port` suffix from a `host[:port]` target, IPv6-aware.
pub fn host_only(target: &str) -> &str {
    if let Some(rest) = target.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    match target.rsplit_once(':') {
        Some((host, port))
            if !host.contains(':') && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            host
        }
        _ => target,
    }
}

/// Allow-list check: empty target never passes, an empty list passes all,
/// `*` matches any host, otherwise hosts compare case-insensitively with the
/// port stripped.
pub fn host_allowed(allow_hosts: &[String], target: &str) -> bool {
    if target.is_empty() {
        return false;
    }
    if allow_hosts.is_empty() {
        return true;
    }
    let host = host_only(target);
    allow_hosts
        .iter()
        .any(|allowed| allowed == "*" || allowed.eq_ignore_ascii_case(host))
}
