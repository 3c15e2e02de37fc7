//! MITM coordination: enablement policy, the per-host leaf cache, and the
//! client-facing TLS configuration.

use crate::config::Config;
use crate::mitm::issuer::{IssuerError, LeafIdentity, LeafIssuer};
use crate::traffic::host_only;
use rustls::ServerConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

const DEFAULT_LEAF_TTL: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Error)]
pub enum MitmError {
    #[error("mitm disabled")]
    Disabled,

    #[error("mitm enabled but ca/key paths missing")]
    MissingKeyMaterial,

    #[error(transparent)]
    Issuer(#[from] IssuerError),

    #[error("tls config: {0}")]
    TlsConfig(String),
}

struct CachedLeaf {
    identity: Arc<LeafIdentity>,
    expires: Instant,
}

/// Coordinates optional MITM interception using a provided root CA.
///
/// The cache maps lowercased hostnames to unexpired leaves. Minting happens
/// outside the lock; concurrent misses for one host may redundantly issue and
/// the last writer wins, which is harmless.
pub struct MitmManager {
    enabled: bool,
    issuer: Option<LeafIssuer>,
    disable_hosts: Vec<String>,
    leaf_ttl: Duration,
    cache: Mutex<HashMap<String, CachedLeaf>>,
}

impl MitmManager {
    /// Initialize MITM state from configuration; a disabled config yields an
    /// inert manager.
    pub fn from_config(cfg: &Config) -> Result<Self, MitmError> {
        if !cfg.enable_mitm {
            return Ok(Self::disabled());
        }
        if cfg.mitm_ca.is_empty() || cfg.mitm_key.is_empty() {
            return Err(MitmError::MissingKeyMaterial);
        }
        let issuer = LeafIssuer::from_pem_files(&cfg.mitm_ca, &cfg.mitm_key)?;
        Ok(Self {
            enabled: true,
            issuer: Some(issuer),
            disable_hosts: cfg.mitm_disable_hosts.clone(),
            leaf_ttl: DEFAULT_LEAF_TTL,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            issuer: None,
            disable_hosts: Vec::new(),
            leaf_ttl: DEFAULT_LEAF_TTL,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Override the leaf TTL; used to exercise expiry in tests.
    pub fn with_leaf_ttl(mut self, ttl: Duration) -> Self {
        self.leaf_ttl = ttl;
        self
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Whether traffic to `target` should be intercepted: MITM is on and the
    /// host is not on the disable list (case-insensitive, port ignored).
    pub fn intercepts(&self, target: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let host = host_only(target);
        !self
            .disable_hosts
            .iter()
            .any(|d| d.eq_ignore_ascii_case(host))
    }

    /// Return a valid leaf for `host`, minting and caching on miss or expiry.
    pub fn leaf_for_host(&self, host: &str) -> Result<Arc<LeafIdentity>, MitmError> {
        let issuer = self.issuer.as_ref().ok_or(MitmError::Disabled)?;
        let key = host.to_lowercase();
        let now = Instant::now();

        {
            let cache = self.cache.lock().unwrap();
            if let Some(cached) = cache.get(&key) {
                if now < cached.expires {
                    return Ok(Arc::clone(&cached.identity));
                }
            }
        }

        debug!(host = %key, "minting leaf certificate");
        let identity = Arc::new(issuer.issue(&key)?);
        let mut cache = self.cache.lock().unwrap();
        cache.insert(
            key,
            CachedLeaf {
                identity: Arc::clone(&identity),
                expires: now + self.leaf_ttl,
            },
        );
        Ok(identity)
    }

    /// Number of cached leaves.
    pub fn cache_len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    /// Client-facing TLS configuration for one intercepted session. ALPN is
    /// pinned to http/1.1; the interceptor cannot parse h2.
    pub fn server_config(identity: &LeafIdentity) -> Result<Arc<ServerConfig>, MitmError> {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(identity.chain.clone(), identity.key.clone_key())
            .map_err(|e| MitmError::TlsConfig(e.to_string()))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }
}
