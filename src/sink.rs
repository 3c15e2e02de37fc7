//! Audit sinks: where finished records go.
//!
//! Sinks serialize writes internally; callers treat them as concurrent
//! consumers and never let a sink failure affect the client response.

use crate::record::AuditRecord;
use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Consumer of finished audit records.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord) -> Result<()>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

enum JsonlTarget {
    File(File),
    Stdout,
}

/// Append-only JSON-lines sink backed by a file, or stdout for `-`.
pub struct JsonlSink {
    target: Mutex<JsonlTarget>,
}

impl JsonlSink {
    /// Open (creating parent directories as needed) the JSONL log target.
    pub fn open(path: &str) -> Result<Self> {
        if path == "-" {
            return Ok(Self {
                target: Mutex::new(JsonlTarget::Stdout),
            });
        }
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating log directory for {path}"))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening audit log {path}"))?;
        Ok(Self {
            target: Mutex::new(JsonlTarget::File(file)),
        })
    }
}

impl AuditSink for JsonlSink {
    fn record(&self, record: &AuditRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record).context("encoding audit record")?;
        line.push(b'\n');
        let mut target = self.target.lock().unwrap();
        match &mut *target {
            JsonlTarget::File(file) => file.write_all(&line)?,
            JsonlTarget::Stdout => std::io::stdout().write_all(&line)?,
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut target = self.target.lock().unwrap();
        match &mut *target {
            JsonlTarget::File(file) => file.flush()?,
            JsonlTarget::Stdout => std::io::stdout().flush()?,
        }
        Ok(())
    }
}

/// In-memory sink for tests and embedding.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }
}

impl AuditSink for MemorySink {
    fn record(&self, record: &AuditRecord) -> Result<()> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ConnInfo;
    use chrono::Utc;

    fn entry(id: &str) -> AuditRecord {
        AuditRecord {
            time: Utc::now(),
            id: id.to_string(),
            conn: ConnInfo {
                client_addr: String::new(),
                target: "example.test:80".to_string(),
                protocol: "http".to_string(),
            },
            request: None,
            response: None,
            latency_ms: 0,
            profile: None,
            error: None,
            attributes: None,
        }
    }

    #[test]
    fn jsonl_sink_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = JsonlSink::open(path.to_str().unwrap()).unwrap();

        sink.record(&entry("req-1")).unwrap();
        sink.record(&entry("req-2")).unwrap();
        sink.flush().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: AuditRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.id, "req-1");
    }

    #[test]
    fn jsonl_sink_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/logs/audit.jsonl");
        let sink = JsonlSink::open(path.to_str().unwrap()).unwrap();
        sink.record(&entry("req-1")).unwrap();
        sink.flush().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn memory_sink_collects_records() {
        let sink = MemorySink::new();
        sink.record(&entry("req-1")).unwrap();
        sink.record(&entry("req-2")).unwrap();
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.records()[1].id, "req-2");
    }
}
