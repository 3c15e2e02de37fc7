//! Ordered request/response policy hooks.
//!
//! The first rejection short-circuits the chain; its reason lands verbatim in
//! the audit record error.

use crate::config::FilterSpec;
use crate::traffic::{RequestView, ResponseView};
use thiserror::Error;

/// Reason a filter rejected traffic.
#[derive(Debug, Error)]
pub enum FilterReject {
    #[error("blocked by header filter: {header}={value}")]
    Header { header: String, value: String },

    #[error("blocked by path filter: {0}")]
    PathPrefix(String),

    #[error("request path {0:?} not in allowed prefixes")]
    PathNotAllowed(String),
}

/// Policy hook applied to proxied traffic. Both hooks default to no-ops.
pub trait TrafficFilter: Send + Sync {
    fn on_request(&self, _req: &RequestView<'_>) -> Result<(), FilterReject> {
        Ok(())
    }

    fn on_response(&self, _resp: &ResponseView<'_>) -> Result<(), FilterReject> {
        Ok(())
    }
}

/// Executes filters sequentially, stopping at the first rejection.
pub struct FilterChain {
    filters: Vec<Box<dyn TrafficFilter>>,
}

impl FilterChain {
    pub fn new(filters: Vec<Box<dyn TrafficFilter>>) -> Self {
        Self { filters }
    }

    /// Build a chain from configuration specs. Unknown filter types degrade
    /// to no-ops here; `Config::validate` rejects them before startup.
    pub fn from_specs(specs: &[FilterSpec]) -> Self {
        let mut filters: Vec<Box<dyn TrafficFilter>> = Vec::with_capacity(specs.len());
        for spec in specs {
            match spec.filter_type.as_str() {
                "header-block" => {
                    if spec.header.is_empty() {
                        continue;
                    }
                    filters.push(Box::new(HeaderBlockFilter {
                        header: spec.header.clone(),
                        values: spec.values.clone(),
                    }));
                }
                "path-prefix-block" => {
                    if spec.values.is_empty() {
                        continue;
                    }
                    filters.push(Box::new(PathPrefixBlockFilter {
                        prefixes: spec.values.clone(),
                    }));
                }
                "path-prefix-allow" => {
                    if spec.values.is_empty() {
                        continue;
                    }
                    filters.push(Box::new(PathPrefixAllowFilter {
                        prefixes: spec.values.clone(),
                    }));
                }
                _ => filters.push(Box::new(NoopFilter)),
            }
        }
        if filters.is_empty() {
            filters.push(Box::new(NoopFilter));
        }
        Self::new(filters)
    }

    /// Default chain installed when no filters are configured.
    pub fn default_chain() -> Self {
        Self::new(vec![Box::new(HeaderBlockFilter {
            header: "X-Audit-Block".to_string(),
            values: vec!["1".to_string(), "true".to_string(), "block".to_string()],
        })])
    }

    pub fn apply_request(&self, req: &RequestView<'_>) -> Result<(), FilterReject> {
        for filter in &self.filters {
            filter.on_request(req)?;
        }
        Ok(())
    }

    pub fn apply_response(&self, resp: &ResponseView<'_>) -> Result<(), FilterReject> {
        for filter in &self.filters {
            filter.on_response(resp)?;
        }
        Ok(())
    }
}

/// Convenience filter that performs no checks.
pub struct NoopFilter;

impl TrafficFilter for NoopFilter {}

/// Rejects requests carrying a header whose value equals one of the denied
/// values, case-insensitively.
pub struct HeaderBlockFilter {
    pub header: String,
    pub values: Vec<String>,
}

impl TrafficFilter for HeaderBlockFilter {
    fn on_request(&self, req: &RequestView<'_>) -> Result<(), FilterReject> {
        let Some(value) = req
            .headers
            .get(self.header.as_str())
            .and_then(|v| v.to_str().ok())
        else {
            return Ok(());
        };
        if value.is_empty() {
            return Ok(());
        }
        if self.values.iter().any(|d| d.eq_ignore_ascii_case(value)) {
            return Err(FilterReject::Header {
                header: self.header.clone(),
                value: value.to_string(),
            });
        }
        Ok(())
    }
}

/// Rejects requests whose URL path starts with any listed prefix.
pub struct PathPrefixBlockFilter {
    pub prefixes: Vec<String>,
}

impl TrafficFilter for PathPrefixBlockFilter {
    fn on_request(&self, req: &RequestView<'_>) -> Result<(), FilterReject> {
        let path = req.uri.path();
        for prefix in &self.prefixes {
            if path.starts_with(prefix.as_str()) {
                return Err(FilterReject::PathPrefix(prefix.clone()));
            }
        }
        Ok(())
    }
}

/// Rejects requests whose URL path does not start with an allowed prefix.
pub struct PathPrefixAllowFilter {
    pub prefixes: Vec<String>,
}

impl TrafficFilter for PathPrefixAllowFilter {
    fn on_request(&self, req: &RequestView<'_>) -> Result<(), FilterReject> {
        let path = req.uri.path();
        if self.prefixes.iter().any(|p| path.starts_with(p.as_str())) {
            return Ok(());
        }
        Err(FilterReject::PathNotAllowed(path.to_string()))
    }
}
