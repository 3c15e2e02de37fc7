//! Catch-all profile: matches everything, contributes nothing.

use super::Profile;
use crate::record::AttrMap;
use crate::traffic::{RequestView, ResponseView};

pub struct GenericProfile;

impl Profile for GenericProfile {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn matches(&self, _req: &RequestView<'_>) -> bool {
        true
    }

    fn annotate(&self, _req: &RequestView<'_>, _resp: Option<&ResponseView<'_>>) -> AttrMap {
        AttrMap::new()
    }
}
