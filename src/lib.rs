//! Wiretap - Auditing Forward Proxy
//!
//! Wiretap is a forward HTTP/HTTPS proxy that audits outbound API traffic.
//! Clients configure it as their upstream proxy; it forwards plain requests
//! and CONNECT tunnels and emits one structured JSONL record per interaction.
//!
//! ## Features
//!
//! - **Forward proxy**: HTTP/1.1 absolute-form requests and CONNECT tunnels
//! - **MITM interception**: optional TLS termination with per-host leaf
//!   certificates minted from a trusted root CA
//! - **Bounded excerpts**: streaming tee captures body prefixes without
//!   buffering SSE or chunked payloads end-to-end
//! - **Filters**: ordered request/response policy hooks
//! - **Profiles**: pluggable annotators (`generic`, `openai`) enriching
//!   audit records with domain attributes
//!
//! ## Architecture
//!
//! Wiretap is a library with a thin CLI binary on top:
//!
//! - `server` - listener, dispatcher, CONNECT handling
//! - `forward` - request forwarding and record assembly
//! - `mitm` - certificate issuance, leaf cache, TLS interception
//! - `filters` / `profiles` - policy hooks and annotators
//! - `record` / `redact` / `sink` - the audit pipeline

// Core proxy modules
pub mod config;
pub mod forward;
pub mod server;
pub mod tunnel;

// Audit pipeline
pub mod excerpt;
pub mod record;
pub mod redact;
pub mod sink;

// Policy hooks
pub mod filters;
pub mod profiles;
pub mod traffic;

// MITM interception
pub mod mitm;

// Re-export commonly used types

/// Configuration types
pub use config::{Cli, Config, FileConfig, FilterSpec};

/// Server entry point
pub use server::ProxyServer;

/// Audit record model and sinks
pub use record::{AttrMap, AuditRecord, ConnInfo, RequestSummary, ResponseSummary};
pub use sink::{AuditSink, JsonlSink, MemorySink};

/// Excerpt capture
pub use excerpt::{BoundedBuffer, BufferPool, TeeStream};

/// Policy hooks
pub use filters::{FilterChain, FilterReject, TrafficFilter};
pub use profiles::{Profile, ProfileRegistry};

/// MITM types
pub use mitm::{LeafIdentity, LeafIssuer, MitmError, MitmManager};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
