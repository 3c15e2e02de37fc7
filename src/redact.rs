//! Header sanitization for audit emission.
//!
//! Secret-bearing header values never reach the log in the clear; everything
//! else is passed through with multi-values joined.

use http::HeaderMap;
use std::collections::BTreeMap;

const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "x-api-key",
    "api-key",
    "apikey",
    "x-auth-token",
    "x-openai-api-key",
    "openai-organization",
];

fn is_sensitive(name: &str) -> bool {
    SENSITIVE_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Produce a string-valued copy of `headers` suitable for structured logs.
///
/// Sensitive values are masked; other multi-values are joined with `", "`.
/// An empty header map yields an empty output map.
pub fn sanitize_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for name in headers.keys() {
        let values: Vec<&str> = headers
            .get_all(name)
            .iter()
            .map(|v| v.to_str().unwrap_or("<binary>"))
            .collect();
        let rendered = if is_sensitive(name.as_str()) {
            values
                .iter()
                .map(|v| mask_token(v))
                .collect::<Vec<_>>()
                .join(", ")
        } else {
            values.join(", ")
        };
        out.insert(name.as_str().to_string(), rendered);
    }
    out
}

/// Mask a credential value, preserving a leading scheme word such as
/// `Bearer` when present.
pub fn mask_token(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        return String::new();
    }
    match value.split_once(' ') {
        Some((scheme, rest)) => format!("{} {}", scheme, mask_core(rest)),
        None => mask_core(value),
    }
}

fn mask_core(value: &str) -> String {
    if value.len() <= 4 {
        return "***".to_string();
    }
    format!("{}***{}", &value[..2], &value[value.len() - 2..])
}

/// Mask an organization/project identifier for profile attributes.
pub fn mask_identifier(value: &str) -> String {
    let value = value.trim();
    if value.len() <= 4 {
        return "***".to_string();
    }
    if value.len() <= 8 {
        return format!("{}***{}", &value[..2], &value[value.len() - 2..]);
    }
    format!("{}***{}", &value[..3], &value[value.len() - 3..])
}
