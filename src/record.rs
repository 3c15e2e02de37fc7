//! Audit record model and JSONL wire format.

use chrono::{DateTime, SecondsFormat, Utc};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;

/// Open-ended attribute map attached to a record.
pub type AttrMap = serde_json::Map<String, serde_json::Value>;

/// One structured audit record per proxy interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    #[serde(serialize_with = "rfc3339_utc")]
    pub time: DateTime<Utc>,
    pub id: String,
    pub conn: ConnInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseSummary>,
    pub latency_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<AttrMap>,
}

/// Inbound client and upstream target information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnInfo {
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub client_addr: String,
    pub target: String,
    pub protocol: String,
}

/// Request summary without body payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSummary {
    pub method: String,
    pub url: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
}

/// Response summary without body payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseSummary {
    pub status: u16,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
}

fn rfc3339_utc<S>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&time.to_rfc3339_opts(SecondsFormat::Micros, true))
}

impl AuditRecord {
    /// Insert an attribute, creating the map on first use.
    pub fn set_attribute(&mut self, key: &str, value: serde_json::Value) {
        self.attributes
            .get_or_insert_with(AttrMap::new)
            .insert(key.to_string(), value);
    }

    /// Merge profile annotations into the attribute map.
    pub fn merge_attributes(&mut self, attrs: AttrMap) {
        if attrs.is_empty() {
            return;
        }
        self.attributes
            .get_or_insert_with(AttrMap::new)
            .extend(attrs);
    }
}

/// Best-effort client address: a forwarding header wins, then the peer IP.
pub fn client_addr(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if !forwarded.is_empty() {
            return forwarded.to_string();
        }
    }
    peer.ip().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AuditRecord {
        AuditRecord {
            time: Utc::now(),
            id: "req-7".to_string(),
            conn: ConnInfo {
                client_addr: "10.0.0.9".to_string(),
                target: "api.example.test:443".to_string(),
                protocol: "https".to_string(),
            },
            request: Some(RequestSummary {
                method: "POST".to_string(),
                url: "https://api.example.test/v1/chat/completions".to_string(),
                headers: BTreeMap::from([("accept".to_string(), "text/event-stream".to_string())]),
                content_length: Some(42),
            }),
            response: Some(ResponseSummary {
                status: 200,
                headers: BTreeMap::new(),
                content_length: Some(5),
            }),
            latency_ms: 12,
            profile: Some("openai".to_string()),
            error: None,
            attributes: None,
        }
    }

    #[test]
    fn wire_format_round_trips() {
        let mut record = sample();
        record.set_attribute("mitm", serde_json::Value::String("enabled".to_string()));
        record.set_attribute("stream", serde_json::Value::Bool(true));

        let line = serde_json::to_string(&record).unwrap();
        let parsed: AuditRecord = serde_json::from_str(&line).unwrap();

        assert_eq!(parsed.id, record.id);
        assert_eq!(parsed.conn.target, record.conn.target);
        assert_eq!(parsed.latency_ms, 12);
        assert_eq!(parsed.profile.as_deref(), Some("openai"));
        let attrs = parsed.attributes.unwrap();
        assert_eq!(attrs["mitm"], "enabled");
        assert_eq!(attrs["stream"], true);
        assert_eq!(parsed.request.unwrap().content_length, Some(42));
        assert_eq!(parsed.response.unwrap().status, 200);
    }

    #[test]
    fn omitted_fields_are_absent_not_null() {
        let mut record = sample();
        record.request = None;
        record.response = None;
        record.profile = None;
        record.error = None;

        let line = serde_json::to_string(&record).unwrap();
        assert!(!line.contains("\"request\""));
        assert!(!line.contains("\"response\""));
        assert!(!line.contains("\"profile\""));
        assert!(!line.contains("\"error\""));
        assert!(!line.contains("null"));
        assert!(line.contains("\"latency_ms\":12"));
    }

    #[test]
    fn time_is_rfc3339_utc() {
        let line = serde_json::to_string(&sample()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        let time = value["time"].as_str().unwrap();
        assert!(time.ends_with('Z'), "expected UTC suffix: {time}");
        assert!(DateTime::parse_from_rfc3339(time).is_ok());
    }

    #[test]
    fn forwarding_header_wins_over_peer_address() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.4".parse().unwrap());
        let peer: SocketAddr = "127.0.0.1:51234".parse().unwrap();
        assert_eq!(client_addr(&headers, peer), "203.0.113.4");
        assert_eq!(client_addr(&HeaderMap::new(), peer), "127.0.0.1");
    }
}
