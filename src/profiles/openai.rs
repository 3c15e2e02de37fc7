//! OpenAI traffic annotator.
//!
//! Matches any request whose host contains `openai` and derives coarse
//! operation metadata from the path, headers and query string.

use super::Profile;
use crate::record::AttrMap;
use crate::redact::mask_identifier;
use crate::traffic::{RequestView, ResponseView};
use serde_json::Value;

/// Longest-prefix operation table; order puts the more specific paths first.
const OPERATIONS: &[(&str, &str)] = &[
    ("/v1/chat/completions", "chat.completions"),
    ("/v1/completions", "completions"),
    ("/v1/responses", "responses"),
    ("/v1/audio/transcriptions", "audio.transcriptions"),
    ("/v1/audio/translations", "audio.translations"),
];

pub struct OpenAiProfile;

impl OpenAiProfile {
    /// Per-profile options are accepted for forward compatibility; none are
    /// currently defined.
    pub fn with_options(_options: Option<&AttrMap>) -> Self {
        Self
    }
}

impl Profile for OpenAiProfile {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn matches(&self, req: &RequestView<'_>) -> bool {
        req.host().is_some_and(|h| h.contains("openai"))
    }

    fn annotate(&self, req: &RequestView<'_>, resp: Option<&ResponseView<'_>>) -> AttrMap {
        let mut attrs = AttrMap::new();

        let endpoint = req.uri.path();
        if !endpoint.is_empty() {
            attrs.insert("endpoint".to_string(), Value::String(endpoint.to_string()));
            if let Some(op) = operation_for_path(endpoint) {
                attrs.insert("operation".to_string(), Value::String(op.to_string()));
            }
        }
        if let Some(host) = req.host() {
            attrs.insert("target_host".to_string(), Value::String(host.to_string()));
        }
        if stream_hint(req) {
            attrs.insert("stream".to_string(), Value::Bool(true));
        }
        if let Some(v) = header_str(req.headers, "openai-organization") {
            attrs.insert(
                "organization".to_string(),
                Value::String(mask_identifier(v)),
            );
        }
        if let Some(v) = header_str(req.headers, "openai-project") {
            attrs.insert("project".to_string(), Value::String(mask_identifier(v)));
        }
        if let Some(v) = header_str(req.headers, "openai-model") {
            attrs.insert("model_hint".to_string(), Value::String(v.to_string()));
        }

        if let Some(resp) = resp {
            if let Some(v) = header_str(resp.headers, "x-request-id") {
                attrs.insert("request_id".to_string(), Value::String(v.to_string()));
            }
            if let Some(v) = header_str(resp.headers, "openai-processing-ms") {
                attrs.insert("processing_ms".to_string(), Value::String(v.to_string()));
            }
            if let Some(v) = header_str(resp.headers, "openai-organization") {
                attrs.insert(
                    "organization".to_string(),
                    Value::String(mask_identifier(v)),
                );
            }
        }

        attrs
    }
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

fn operation_for_path(path: &str) -> Option<&'static str> {
    OPERATIONS
        .iter()
        .find(|(prefix, _)| path.starts_with(prefix))
        .map(|(_, op)| *op)
}

fn stream_hint(req: &RequestView<'_>) -> bool {
    if header_str(req.headers, "accept")
        .is_some_and(|v| v.to_ascii_lowercase().contains("text/event-stream"))
    {
        return true;
    }
    let Some(query) = req.uri.query() else {
        return false;
    };
    url::form_urlencoded::parse(query.as_bytes()).any(|(k, v)| {
        k == "stream" && matches!(v.to_ascii_lowercase().as_str(), "true" | "1")
    })
}
