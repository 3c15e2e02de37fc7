//! Runtime configuration: CLI flags with an optional YAML/JSON file overlay.
//!
//! File values override flags only for keys the file actually sets; absent
//! keys preserve flag values.

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Auditing forward proxy for outbound API traffic.
#[derive(Parser, Debug, Clone)]
#[command(name = "wiretap", version, about)]
pub struct Cli {
    /// Address the proxy listens on
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub addr: String,

    /// Path to the JSONL audit log ("-" writes to stdout)
    #[arg(long = "log-file", default_value = "logs/audit.jsonl")]
    pub log_file: String,

    /// Comma-separated profile names to enable
    #[arg(long, default_value = "generic", value_delimiter = ',')]
    pub profiles: Vec<String>,

    /// Comma-separated allowlist of upstream hosts ("*" allows all)
    #[arg(long = "allow-hosts", default_value = "*", value_delimiter = ',')]
    pub allow_hosts: Vec<String>,

    /// Maximum bytes captured for request/response excerpts (0 disables)
    #[arg(long = "excerpt-limit", default_value_t = 4096, allow_negative_numbers = true)]
    pub excerpt_limit: i64,

    /// Enable MITM interception
    #[arg(long)]
    pub mitm: bool,

    /// Path to the MITM root CA certificate (PEM)
    #[arg(long = "mitm-ca")]
    pub mitm_ca: Option<String>,

    /// Path to the MITM root CA private key (PEM)
    #[arg(long = "mitm-key")]
    pub mitm_key: Option<String>,

    /// Comma-separated hosts to bypass MITM even when enabled
    #[arg(long = "mitm-disable-hosts", value_delimiter = ',')]
    pub mitm_disable_hosts: Vec<String>,

    /// Optional YAML/JSON configuration file overlaying flag defaults
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Load and validate configuration, then exit
    #[arg(long = "validate-config")]
    pub validate_config: bool,
}

/// Filter configuration entry.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FilterSpec {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub filter_type: String,
    #[serde(default)]
    pub header: String,
    #[serde(default)]
    pub values: Vec<String>,
}

/// Per-profile option maps keyed by profile name.
pub type ProfilesConfig = HashMap<String, serde_json::Map<String, serde_json::Value>>;

/// Immutable per-instance runtime options.
#[derive(Debug, Clone)]
pub struct Config {
    pub addr: String,
    pub log_file: String,
    pub profiles: Vec<String>,
    pub allow_hosts: Vec<String>,
    pub enable_mitm: bool,
    pub mitm_ca: String,
    pub mitm_key: String,
    pub excerpt_limit: usize,
    pub mitm_disable_hosts: Vec<String>,
    pub filters: Vec<FilterSpec>,
    pub profiles_config: ProfilesConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
            log_file: "logs/audit.jsonl".to_string(),
            profiles: vec!["generic".to_string()],
            allow_hosts: vec!["*".to_string()],
            enable_mitm: false,
            mitm_ca: String::new(),
            mitm_key: String::new(),
            excerpt_limit: 4096,
            mitm_disable_hosts: Vec::new(),
            filters: Vec::new(),
            profiles_config: ProfilesConfig::new(),
        }
    }
}

/// Subset of configuration a file may provide; only present keys override.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FileConfig {
    pub addr: Option<String>,
    pub log_file: Option<String>,
    pub profiles: Option<Vec<String>>,
    pub allow_hosts: Option<Vec<String>>,
    pub mitm: Option<bool>,
    pub mitm_ca: Option<String>,
    pub mitm_key: Option<String>,
    pub excerpt_limit: Option<i64>,
    pub mitm_disable_hosts: Option<Vec<String>>,
    pub filters: Option<Vec<FilterSpec>>,
    pub profiles_config: Option<ProfilesConfig>,
}

impl Config {
    /// Build a validated configuration from parsed CLI flags, applying the
    /// file overlay when `--config` was given.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        if cli.excerpt_limit < 0 {
            bail!("excerpt limit must be zero or positive");
        }
        let mut cfg = Config {
            addr: cli.addr.clone(),
            log_file: cli.log_file.clone(),
            profiles: normalize_list(&cli.profiles),
            allow_hosts: normalize_list(&cli.allow_hosts),
            enable_mitm: cli.mitm,
            mitm_ca: cli.mitm_ca.clone().unwrap_or_default(),
            mitm_key: cli.mitm_key.clone().unwrap_or_default(),
            excerpt_limit: cli.excerpt_limit as usize,
            mitm_disable_hosts: normalize_list(&cli.mitm_disable_hosts),
            filters: Vec::new(),
            profiles_config: ProfilesConfig::new(),
        };
        if let Some(path) = &cli.config {
            let file = FileConfig::load(path)?;
            cfg = cfg.merged(file)?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Overlay file configuration on top of this one.
    pub fn merged(mut self, file: FileConfig) -> Result<Self> {
        if let Some(addr) = file.addr {
            self.addr = addr;
        }
        if let Some(log_file) = file.log_file {
            self.log_file = log_file;
        }
        if let Some(profiles) = file.profiles {
            self.profiles = profiles;
        }
        if let Some(allow_hosts) = file.allow_hosts {
            self.allow_hosts = allow_hosts;
        }
        if let Some(mitm) = file.mitm {
            self.enable_mitm = mitm;
        }
        if let Some(ca) = file.mitm_ca {
            self.mitm_ca = ca;
        }
        if let Some(key) = file.mitm_key {
            self.mitm_key = key;
        }
        if let Some(limit) = file.excerpt_limit {
            if limit < 0 {
                bail!("excerpt limit must be zero or positive");
            }
            self.excerpt_limit = limit as usize;
        }
        if let Some(hosts) = file.mitm_disable_hosts {
            self.mitm_disable_hosts = hosts;
        }
        if let Some(filters) = file.filters {
            self.filters = filters;
        }
        if let Some(profiles_config) = file.profiles_config {
            self.profiles_config.extend(profiles_config);
        }
        Ok(self)
    }

    /// Ensure the configuration is internally consistent.
    pub fn validate(&self) -> Result<()> {
        if self.addr.is_empty() {
            bail!("addr must not be empty");
        }
        if self.profiles.is_empty() {
            bail!("at least one profile must be specified");
        }
        if self.enable_mitm && (self.mitm_ca.is_empty() || self.mitm_key.is_empty()) {
            bail!("mitm enabled but ca/key paths not provided");
        }
        for filter in &self.filters {
            match filter.filter_type.as_str() {
                "header-block" => {
                    if filter.header.is_empty() {
                        bail!("filter {:?} missing header", filter.name);
                    }
                }
                "path-prefix-block" => {
                    if filter.values.is_empty() {
                        bail!("filter {:?} requires at least one prefix value", filter.name);
                    }
                }
                "path-prefix-allow" => {
                    if filter.values.is_empty() {
                        bail!("filter {:?} requires at least one allow prefix", filter.name);
                    }
                }
                other => bail!("unknown filter type: {other}"),
            }
        }
        Ok(())
    }
}

impl FileConfig {
    /// Parse a configuration file, detecting YAML vs JSON by extension with
    /// a leading-`{` fallback.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        match detect_format(path, &data) {
            FileFormat::Yaml => serde_yaml::from_slice(&data)
                .with_context(|| format!("parsing YAML config {}", path.display())),
            FileFormat::Json => serde_json::from_slice(&data)
                .with_context(|| format!("parsing JSON config {}", path.display())),
        }
    }
}

enum FileFormat {
    Yaml,
    Json,
}

fn detect_format(path: &Path, data: &[u8]) -> FileFormat {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        _ => {
            let trimmed = data
                .iter()
                .position(|b| !b.is_ascii_whitespace())
                .map(|i| data[i]);
            if trimmed == Some(b'{') {
                FileFormat::Json
            } else {
                FileFormat::Yaml
            }
        }
    }
}

fn normalize_list(items: &[String]) -> Vec<String> {
    items
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
