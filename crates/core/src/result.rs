//! Outcome of a create/delete invocation, as reported to the caller and to
//! notification sinks.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{EnvironmentId, ResourceRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Create,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Create => "create",
            Operation::Delete => "delete",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleStatus {
    Succeeded,
    /// Something was deployed, but at least one resource failed, was skipped,
    /// or never became ready.
    PartiallyFailed,
    /// Nothing usable was deployed (or the delete did not converge).
    Failed,
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleStatus::Succeeded => "succeeded",
            LifecycleStatus::PartiallyFailed => "partially failed",
            LifecycleStatus::Failed => "failed",
        })
    }
}

/// Per-service rollup of its resources' outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    /// Every resource applied and the Deployment has a ready replica.
    Ready,
    /// Applied, but the Deployment never reported a ready replica.
    NotReady,
    /// At least one of the service's resources failed to apply.
    Failed,
    /// Not attempted because an earlier rank failed.
    Skipped,
}

/// Why a resource (or the whole manifest) did not end up where it should.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ErrorCause {
    #[error("validation: {0}")]
    Validation(String),
    #[error("render: {0}")]
    Render(String),
    #[error("apply failed: {0}")]
    Apply(String),
    #[error("skipped: earlier resource(s) failed ({})", .blocked_by.join(", "))]
    Skipped { blocked_by: Vec<String> },
    #[error("not ready after {attempts} readiness checks")]
    ReadinessTimeout { attempts: u32 },
    #[error("delete failed: {0}")]
    Delete(String),
    #[error("namespace still present after {waited_secs}s (stuck finalizers?)")]
    DeleteTimeout { waited_secs: u64 },
}

/// One error entry: the resource it concerns (absent for manifest-level
/// problems) and its cause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleError {
    pub resource: Option<ResourceRef>,
    pub cause: ErrorCause,
}

impl LifecycleError {
    pub fn manifest(cause: ErrorCause) -> Self {
        Self { resource: None, cause }
    }

    pub fn resource(resource: ResourceRef, cause: ErrorCause) -> Self {
        Self { resource: Some(resource), cause }
    }
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.resource {
            Some(r) => write!(f, "{}: {}", r, self.cause),
            None => write!(f, "{}", self.cause),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleResult {
    pub operation: Operation,
    pub pr_number: u64,
    /// Absent only when the PR number itself was rejected.
    pub environment: Option<EnvironmentId>,
    pub status: LifecycleStatus,
    /// Service name to externally reachable URL (enabled-ingress services only).
    pub urls: BTreeMap<String, String>,
    pub services: BTreeMap<String, ServiceState>,
    pub errors: Vec<LifecycleError>,
}

impl LifecycleResult {
    pub fn new(operation: Operation, pr_number: u64, environment: Option<EnvironmentId>) -> Self {
        Self {
            operation,
            pr_number,
            environment,
            status: LifecycleStatus::Succeeded,
            urls: BTreeMap::new(),
            services: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    /// Short-circuit result for failures that happen before the cluster is touched.
    pub fn failed(
        operation: Operation,
        pr_number: u64,
        environment: Option<EnvironmentId>,
        errors: Vec<LifecycleError>,
    ) -> Self {
        Self { status: LifecycleStatus::Failed, errors, ..Self::new(operation, pr_number, environment) }
    }

    pub fn is_success(&self) -> bool {
        self.status == LifecycleStatus::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResourceKind;

    #[test]
    fn error_display_includes_resource_and_cause() {
        let e = LifecycleError::resource(
            ResourceRef::new(ResourceKind::Ingress, Some("pr-3"), "web"),
            ErrorCause::Skipped { blocked_by: vec!["Service/pr-3/web".into()] },
        );
        assert_eq!(e.to_string(), "Ingress/pr-3/web: skipped: earlier resource(s) failed (Service/pr-3/web)");
        let m = LifecycleError::manifest(ErrorCause::Render("boom".into()));
        assert_eq!(m.to_string(), "render: boom");
    }

    #[test]
    fn failed_result_carries_errors() {
        let r = LifecycleResult::failed(
            Operation::Create,
            9,
            None,
            vec![LifecycleError::manifest(ErrorCause::Validation("bad".into()))],
        );
        assert_eq!(r.status, LifecycleStatus::Failed);
        assert!(!r.is_success());
        assert!(r.urls.is_empty());
        assert_eq!(r.errors.len(), 1);
    }
}
