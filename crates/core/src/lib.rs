//! ephem core types: manifest model, environment identity, rendered resources
//! and lifecycle results. Pure data; nothing in this crate touches the network.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod manifest;
pub mod resource;
pub mod result;

pub use manifest::{
    validate, EnvironmentManifest, IngressSpec, ServiceSpec, ValidationError, Violation,
};
pub use resource::{RenderedResource, ResourceKind, ResourceRef};
pub use result::{ErrorCause, LifecycleError, LifecycleResult, LifecycleStatus, Operation, ServiceState};

pub mod prelude {
    pub use super::{
        EnvironmentId, EnvironmentManifest, LifecycleResult, LifecycleStatus, RenderedResource,
        ResourceKind, ResourceRef, ServiceSpec,
    };
}

/// Prefix shared by every environment namespace and URL path.
pub const NAMESPACE_PREFIX: &str = "pr-";

/// Longest name the cluster accepts for namespaces and DNS-label resource names.
pub const MAX_K8S_NAME_LENGTH: usize = 63;

/// Identity of one PR environment: `pr-<number>`.
///
/// Used both as the namespace name and as the external path prefix, so it is
/// derived from the PR number alone and never stored anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentId(String);

impl EnvironmentId {
    pub fn from_pr(pr_number: u64) -> Result<Self, ValidationError> {
        if pr_number == 0 {
            return Err(ValidationError::single("pr_number", "PR number must be a positive integer"));
        }
        // u64::MAX is 20 digits, so `pr-` + digits always fits a DNS label.
        Ok(Self(format!("{}{}", NAMESPACE_PREFIX, pr_number)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path prefix routed to this environment, e.g. `/pr-42`.
    pub fn path_prefix(&self) -> String {
        format!("/{}", self.0)
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EnvironmentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_id_is_derived_from_pr_number() {
        let id = EnvironmentId::from_pr(42).expect("valid pr");
        assert_eq!(id.as_str(), "pr-42");
        assert_eq!(id.path_prefix(), "/pr-42");
        assert_eq!(id.to_string(), "pr-42");
    }

    #[test]
    fn environment_id_rejects_zero() {
        let err = EnvironmentId::from_pr(0).unwrap_err();
        assert!(err.to_string().contains("positive"), "err={}", err);
    }

    #[test]
    fn environment_id_fits_namespace_limits_for_any_pr() {
        let id = EnvironmentId::from_pr(u64::MAX).expect("valid pr");
        assert!(id.as_str().len() <= MAX_K8S_NAME_LENGTH);
        assert!(manifest::is_dns_label(id.as_str()));
    }
}
