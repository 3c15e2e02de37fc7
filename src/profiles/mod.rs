//! Named profiles that match requests and contribute audit attributes.

mod generic;
mod openai;

pub use generic::GenericProfile;
pub use openai::OpenAiProfile;

use crate::record::AttrMap;
use crate::traffic::{RequestView, ResponseView};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("unknown profile: {0}")]
    Unknown(String),
}

/// Domain-specific hook set: match a request, then enrich its record.
pub trait Profile: Send + Sync {
    fn name(&self) -> &'static str;

    fn matches(&self, req: &RequestView<'_>) -> bool;

    /// Returns the attributes to merge into the record; an empty map means
    /// "no attributes" and is omitted.
    fn annotate(&self, req: &RequestView<'_>, resp: Option<&ResponseView<'_>>) -> AttrMap;
}

/// Profiles in configured order; the first matcher wins.
pub struct ProfileRegistry {
    ordered: Vec<Box<dyn Profile>>,
}

impl std::fmt::Debug for ProfileRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileRegistry")
            .field("ordered_len", &self.ordered.len())
            .finish()
    }
}

impl ProfileRegistry {
    /// Build a registry from configured names and per-profile option maps.
    pub fn from_names(
        names: &[String],
        options: &HashMap<String, AttrMap>,
    ) -> Result<Self, ProfileError> {
        let names: Vec<&str> = if names.is_empty() {
            vec!["generic"]
        } else {
            names.iter().map(String::as_str).collect()
        };
        let mut ordered: Vec<Box<dyn Profile>> = Vec::with_capacity(names.len());
        for name in names {
            match name {
                "generic" => ordered.push(Box::new(GenericProfile)),
                "openai" => ordered.push(Box::new(OpenAiProfile::with_options(options.get(name)))),
                other => return Err(ProfileError::Unknown(other.to_string())),
            }
        }
        Ok(Self { ordered })
    }

    /// Registered profile names, in order.
    pub fn enabled(&self) -> Vec<&'static str> {
        self.ordered.iter().map(|p| p.name()).collect()
    }

    /// First profile accepting the request, if any.
    pub fn match_request(&self, req: &RequestView<'_>) -> Option<&dyn Profile> {
        self.ordered
            .iter()
            .find(|p| p.matches(req))
            .map(|p| p.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, Method, Uri};

    fn request_view<'a>(uri: &'a Uri, headers: &'a HeaderMap) -> RequestView<'a> {
        RequestView {
            method: &Method::GET,
            uri,
            headers,
        }
    }

    #[test]
    fn unknown_profile_name_is_an_error() {
        let err = ProfileRegistry::from_names(&["bogus".to_string()], &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn empty_name_list_defaults_to_generic() {
        let registry = ProfileRegistry::from_names(&[], &HashMap::new()).unwrap();
        assert_eq!(registry.enabled(), vec!["generic"]);
    }

    #[test]
    fn first_matching_profile_wins() {
        let registry = ProfileRegistry::from_names(
            &["openai".to_string(), "generic".to_string()],
            &HashMap::new(),
        )
        .unwrap();

        let openai_uri: Uri = "https://api.openai.com/v1/models".parse().unwrap();
        let plain_uri: Uri = "https://api.example.test/v1/models".parse().unwrap();
        let headers = HeaderMap::new();

        let matched = registry
            .match_request(&request_view(&openai_uri, &headers))
            .unwrap();
        assert_eq!(matched.name(), "openai");

        let matched = registry
            .match_request(&request_view(&plain_uri, &headers))
            .unwrap();
        assert_eq!(matched.name(), "generic");
    }
}
